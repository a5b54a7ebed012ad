//! In-memory (single node) implementation of the lock store for local
//! development and tests.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keylease_locks::{LockStore, LockStore1, LockStore2, LockStore3, StoreError};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::trace;

#[derive(Clone, Debug)]
struct Entry {
    token: String,
    expires_at: Instant,
}

impl Entry {
    fn new(token: &str, lease: Duration) -> Self {
        Self {
            token: token.to_string(),
            expires_at: Instant::now() + lease,
        }
    }
}

/// In-memory lock store.
///
/// Entries expire on the tokio clock, so tests running with paused time see
/// leases lapse as time is advanced. Scoped views share the same map.
#[derive(Clone, Debug, Default)]
pub struct MemoryLockStore {
    map: Arc<Mutex<HashMap<String, Entry>>>,
    prefix: Option<String>,
}

impl MemoryLockStore {
    /// Creates a new instance of `MemoryLockStore`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            map: Arc::new(Mutex::new(HashMap::new())),
            prefix: None,
        }
    }

    fn with_scope(&self, prefix: String) -> Self {
        Self {
            map: Arc::clone(&self.map),
            prefix: Some(prefix),
        }
    }

    fn get_key(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}:{key}"),
            None => key.to_string(),
        }
    }

    /// Returns the token currently stored under `key`, if its lease is live.
    pub async fn current_token(&self, key: &str) -> Option<String> {
        let mut map = self.map.lock().await;
        live_entry(&mut map, &self.get_key(key)).map(|entry| entry.token.clone())
    }
}

/// Looks up `key`, dropping it first if its lease has lapsed.
fn live_entry<'a>(map: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
    if map
        .get(key)
        .is_some_and(|entry| entry.expires_at <= Instant::now())
    {
        trace!(key, "Entry expired");
        map.remove(key);
    }

    map.get_mut(key)
}

/// Inserts a fresh entry, sweeping every lapsed lease out of the map first.
fn insert_entry(map: &mut HashMap<String, Entry>, key: String, entry: Entry) {
    let now = Instant::now();
    map.retain(|_, existing| existing.expires_at > now);
    map.insert(key, entry);
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn set_if_absent(
        &self,
        key: &str,
        token: &str,
        lease: Duration,
    ) -> Result<bool, StoreError> {
        let key = self.get_key(key);
        let mut map = self.map.lock().await;

        if live_entry(&mut map, &key).is_some() {
            return Ok(false);
        }

        insert_entry(&mut map, key, Entry::new(token, lease));
        Ok(true)
    }

    async fn acquire(&self, key: &str, token: &str, lease: Duration) -> Result<bool, StoreError> {
        let key = self.get_key(key);
        let mut map = self.map.lock().await;

        if let Some(entry) = live_entry(&mut map, &key) {
            if entry.token != token {
                return Ok(false);
            }

            entry.expires_at = Instant::now() + lease;
            return Ok(true);
        }

        insert_entry(&mut map, key, Entry::new(token, lease));
        Ok(true)
    }

    async fn compare_and_extend(
        &self,
        key: &str,
        token: &str,
        lease_millis: u64,
    ) -> Result<i64, StoreError> {
        let key = self.get_key(key);
        let mut map = self.map.lock().await;

        match live_entry(&mut map, &key) {
            Some(entry) if entry.token == token => {
                entry.expires_at = Instant::now() + Duration::from_millis(lease_millis);
                Ok(1)
            }
            Some(_) => Ok(0),
            None => Err(StoreError::NotFound),
        }
    }

    async fn compare_and_delete(&self, key: &str, token: &str) -> Result<i64, StoreError> {
        let key = self.get_key(key);
        let mut map = self.map.lock().await;

        let held = match live_entry(&mut map, &key) {
            Some(entry) => entry.token == token,
            None => return Err(StoreError::NotFound),
        };

        if !held {
            return Ok(0);
        }

        map.remove(&key);
        Ok(1)
    }
}

macro_rules! impl_scoped_lock_store {
    ($name:ident, $parent:ident) => {
        impl $name for MemoryLockStore {
            type Scoped = Self;

            fn scope<S>(&self, scope: S) -> Self::Scoped
            where
                S: AsRef<str> + Send,
            {
                let new_scope = match &self.prefix {
                    Some(existing_scope) => format!("{}:{}", existing_scope, scope.as_ref()),
                    None => scope.as_ref().to_string(),
                };
                self.with_scope(new_scope)
            }
        }
    };
}

impl_scoped_lock_store!(LockStore1, LockStore);
impl_scoped_lock_store!(LockStore2, LockStore1);
impl_scoped_lock_store!(LockStore3, LockStore2);

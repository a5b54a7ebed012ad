//! Implementation of the lock store on top of Redis.
//!
//! The non-retrying acquire uses `SET NX PX`; the retrying acquire, extend and
//! release run as Lua scripts so every check-then-act happens inside Redis.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod scripts;

pub use error::Error;

use std::fmt::{self, Debug};
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use keylease_locks::{LockStore, LockStore1, LockStore2, LockStore3, StoreError, lease_millis};
use redis::aio::ConnectionManager;
use redis::{Client, RedisError, RedisResult};
use tracing::{debug, info, warn};

const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for the `RedisLockStore`.
#[derive(Clone, Debug)]
pub struct RedisLockStoreConfig {
    /// Redis connection URL, e.g. `redis://127.0.0.1:6379/0`.
    pub url: String,

    /// Timeout for individual Redis round trips. Defaults to 10 seconds if not set.
    pub operation_timeout: Option<Duration>,

    /// Prefix applied to every lock key as `<prefix>:<key>`.
    pub prefix: Option<String>,
}

/// A lock store backed by a shared Redis connection.
#[derive(Clone)]
pub struct RedisLockStore {
    connection: ConnectionManager,
    operation_timeout: Duration,
    prefix: Option<String>,
}

impl Debug for RedisLockStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisLockStore")
            .field("operation_timeout", &self.operation_timeout)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl RedisLockStore {
    /// Connects to Redis and verifies the server answers.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid, the connection cannot be
    /// established, or the server does not answer `PING` in time.
    pub async fn connect(
        RedisLockStoreConfig {
            url,
            operation_timeout,
            prefix,
        }: RedisLockStoreConfig,
    ) -> Result<Self, Error> {
        let operation_timeout = operation_timeout.unwrap_or(DEFAULT_OPERATION_TIMEOUT);
        let client = Client::open(url.as_str())?;

        let mut connection =
            tokio::time::timeout(operation_timeout, client.get_connection_manager())
                .await
                .map_err(|_| Error::ConnectTimeout(operation_timeout))??;

        let pong: String = tokio::time::timeout(
            operation_timeout,
            redis::cmd("PING").query_async(&mut connection),
        )
        .await
        .map_err(|_| Error::ConnectTimeout(operation_timeout))??;

        if pong != "PONG" {
            return Err(Error::UnexpectedPing(pong));
        }

        info!(?operation_timeout, ?prefix, "Redis lock store connected");

        Ok(Self {
            connection,
            operation_timeout,
            prefix,
        })
    }

    /// Wraps an existing connection.
    #[must_use]
    pub const fn from_connection(
        connection: ConnectionManager,
        operation_timeout: Duration,
    ) -> Self {
        Self {
            connection,
            operation_timeout,
            prefix: None,
        }
    }

    fn get_key(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}:{key}"),
            None => key.to_string(),
        }
    }

    /// Runs one Redis round trip bounded by the operation timeout.
    async fn run<T, F>(&self, operation: &str, request: F) -> Result<T, StoreError>
    where
        F: Future<Output = RedisResult<T>> + Send,
    {
        match tokio::time::timeout(self.operation_timeout, request).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(classify(operation, e)),
            Err(_) => {
                warn!(
                    operation,
                    timeout = ?self.operation_timeout,
                    "Redis operation timed out"
                );
                Err(StoreError::DeadlineExceeded)
            }
        }
    }
}

fn classify(operation: &str, error: RedisError) -> StoreError {
    if error.is_timeout() {
        debug!(operation, error = %error, "Redis operation timed out");
        StoreError::DeadlineExceeded
    } else {
        warn!(operation, error = %error, "Redis operation failed");
        StoreError::other(error)
    }
}

#[async_trait]
impl LockStore for RedisLockStore {
    async fn set_if_absent(
        &self,
        key: &str,
        token: &str,
        lease: Duration,
    ) -> Result<bool, StoreError> {
        let key = self.get_key(key);
        let mut connection = self.connection.clone();

        let reply: Option<String> = self
            .run(
                "set_if_absent",
                redis::cmd("SET")
                    .arg(&key)
                    .arg(token)
                    .arg("NX")
                    .arg("PX")
                    .arg(lease_millis(lease))
                    .query_async(&mut connection),
            )
            .await?;

        Ok(reply.is_some())
    }

    async fn acquire(&self, key: &str, token: &str, lease: Duration) -> Result<bool, StoreError> {
        let key = self.get_key(key);
        let mut connection = self.connection.clone();

        let acquired: i64 = self
            .run(
                "acquire",
                scripts::ACQUIRE
                    .key(&key)
                    .arg(token)
                    .arg(lease_millis(lease))
                    .invoke_async(&mut connection),
            )
            .await?;

        Ok(acquired == 1)
    }

    async fn compare_and_extend(
        &self,
        key: &str,
        token: &str,
        lease_millis: u64,
    ) -> Result<i64, StoreError> {
        let key = self.get_key(key);
        let mut connection = self.connection.clone();

        let extended: Option<i64> = self
            .run(
                "compare_and_extend",
                scripts::COMPARE_AND_EXTEND
                    .key(&key)
                    .arg(token)
                    .arg(lease_millis)
                    .invoke_async(&mut connection),
            )
            .await?;

        extended.ok_or(StoreError::NotFound)
    }

    async fn compare_and_delete(&self, key: &str, token: &str) -> Result<i64, StoreError> {
        let key = self.get_key(key);
        let mut connection = self.connection.clone();

        let deleted: Option<i64> = self
            .run(
                "compare_and_delete",
                scripts::COMPARE_AND_DELETE
                    .key(&key)
                    .arg(token)
                    .invoke_async(&mut connection),
            )
            .await?;

        deleted.ok_or(StoreError::NotFound)
    }
}

macro_rules! impl_scoped_lock_store_for_redis {
    ($trait_name:ident, $parent_trait:ident) => {
        impl $trait_name for RedisLockStore {
            type Scoped = Self;

            fn scope<S>(&self, scope: S) -> Self::Scoped
            where
                S: AsRef<str> + Send,
            {
                let prefix = match &self.prefix {
                    Some(existing) => format!("{}:{}", existing, scope.as_ref()),
                    None => scope.as_ref().to_string(),
                };

                Self {
                    connection: self.connection.clone(),
                    operation_timeout: self.operation_timeout,
                    prefix: Some(prefix),
                }
            }
        }
    };
}

impl_scoped_lock_store_for_redis!(LockStore1, LockStore);
impl_scoped_lock_store_for_redis!(LockStore2, LockStore1);
impl_scoped_lock_store_for_redis!(LockStore3, LockStore2);

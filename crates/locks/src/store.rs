use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;

/// Converts a lease to whole milliseconds for stores that count in them.
///
/// Rounds up and never returns zero, so a positive sub-millisecond lease is
/// never turned into an immediate expiry. Saturates at `u64::MAX`.
#[must_use]
pub fn lease_millis(lease: Duration) -> u64 {
    let mut millis = lease.as_millis();
    if lease.subsec_nanos() % 1_000_000 != 0 {
        millis += 1;
    }

    u64::try_from(millis.max(1)).unwrap_or(u64::MAX)
}

/// The primitives a shared key-value store must expose to back a lease lock.
///
/// Every method is a single indivisible step on the store side. They are the
/// only operations that mutate a lock key; the client never reads a value and
/// then writes based on it.
#[async_trait]
pub trait LockStore: Clone + Send + Sync + 'static {
    /// Sets `key` to `token` with an expiry of `lease`, only if `key` is absent.
    ///
    /// Returns whether the value was written.
    async fn set_if_absent(
        &self,
        key: &str,
        token: &str,
        lease: Duration,
    ) -> Result<bool, StoreError>;

    /// Scripted acquire.
    ///
    /// Writes `token` with an expiry of `lease` when `key` is absent. When `key`
    /// already holds `token` the expiry is re-armed and the call also reports
    /// success, so a retried attempt recognises an earlier attempt of its own
    /// whose reply was lost. Any other stored value yields `false` untouched.
    async fn acquire(&self, key: &str, token: &str, lease: Duration) -> Result<bool, StoreError>;

    /// Resets the expiry of `key` to `lease_millis` if it still holds `token`.
    ///
    /// Returns `1` when extended and `0` when the key holds another value.
    /// An absent key is reported as [`StoreError::NotFound`].
    async fn compare_and_extend(
        &self,
        key: &str,
        token: &str,
        lease_millis: u64,
    ) -> Result<i64, StoreError>;

    /// Deletes `key` if it still holds `token`.
    ///
    /// Returns the number of deleted keys, `0` when the key holds another value.
    /// An absent key is reported as [`StoreError::NotFound`].
    async fn compare_and_delete(&self, key: &str, token: &str) -> Result<i64, StoreError>;
}

macro_rules! define_scoped_lock_store {
    ($name:ident, $parent:ident, $doc:expr_2021) => {
        #[doc = $doc]
        pub trait $name
        where
            Self: Clone + Send + Sync + 'static,
        {
            /// The scoped store type.
            type Scoped: $parent;

            /// Creates a view of this store whose keys live under `scope`.
            fn scope<S>(&self, scope: S) -> Self::Scoped
            where
                S: AsRef<str> + Send;
        }
    };
}

define_scoped_lock_store!(
    LockStore1,
    LockStore,
    "A lock store that must be scoped once before use."
);
define_scoped_lock_store!(
    LockStore2,
    LockStore1,
    "A lock store that must be scoped twice before use."
);
define_scoped_lock_store!(
    LockStore3,
    LockStore2,
    "A lock store that must be scoped three times before use."
);

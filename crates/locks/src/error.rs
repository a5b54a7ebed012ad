use std::error::Error as StdError;
use std::sync::Arc;

use thiserror::Error;

/// Errors surfaced by a [`LockStore`](crate::LockStore).
///
/// Stores must classify every failure into one of these three buckets so the
/// lock protocol can tell an absent key and a timed out round trip apart from
/// everything else.
#[derive(Clone, Debug, Error)]
pub enum StoreError {
    /// The key does not exist in the store.
    #[error("key not found")]
    NotFound,

    /// The store round trip did not complete in time.
    #[error("store operation deadline exceeded")]
    DeadlineExceeded,

    /// Transport, protocol or script failure.
    #[error("store operation failed: {0}")]
    Other(Arc<dyn StdError + Send + Sync>),
}

impl StoreError {
    /// Wraps an arbitrary backend error as [`StoreError::Other`].
    pub fn other<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Other(Arc::new(error))
    }
}

/// Errors returned by lock operations.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// The handle's token no longer matches the stored value, or the key is gone.
    #[error("lock not held")]
    LockNotHeld,

    /// The key is held by someone else and no further attempt will be made.
    #[error("failed to preempt lock")]
    FailedToPreempt,

    /// The caller's cancellation token fired before the operation finished.
    #[error("lock operation cancelled")]
    Cancelled,

    /// A single store round trip ran out of time.
    #[error("lock operation deadline exceeded")]
    DeadlineExceeded,

    /// A deduplicated acquisition ended without publishing a result.
    #[error("in-flight acquisition aborted before completing")]
    FlightAborted,

    /// A spawned auto refresh task panicked or was aborted.
    #[error("auto refresh task aborted before completing")]
    RefreshTaskAborted,

    /// Any other store failure, propagated unchanged.
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for Error {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::DeadlineExceeded => Self::DeadlineExceeded,
            other => Self::Store(other),
        }
    }
}

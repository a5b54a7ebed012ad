use std::fmt::{self, Debug};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::{Error, StoreError};
use crate::handle::LockHandle;
use crate::retry::RetryStrategy;
use crate::single_flight::Flight;
use crate::store::LockStore;

/// Entry point for acquiring leases on keys of a [`LockStore`].
pub struct LockClient<S>
where
    S: LockStore,
{
    pub(crate) store: S,
    pub(crate) in_flight: Arc<DashMap<String, Flight<S>>>,
}

impl<S> Clone for LockClient<S>
where
    S: LockStore,
{
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            in_flight: Arc::clone(&self.in_flight),
        }
    }
}

impl<S> Debug for LockClient<S>
where
    S: LockStore + Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockClient")
            .field("store", &self.store)
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}

impl<S> LockClient<S>
where
    S: LockStore,
{
    /// Creates a client over a shared store connection.
    #[must_use]
    pub fn new(store: S) -> Self {
        Self {
            store,
            in_flight: Arc::new(DashMap::new()),
        }
    }

    /// The underlying store.
    #[must_use]
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Makes exactly one attempt to take `key` for `lease`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FailedToPreempt`] if the key is already held; store
    /// failures are propagated unchanged.
    #[instrument(skip(self))]
    pub async fn try_lock(&self, key: &str, lease: Duration) -> Result<LockHandle<S>, Error> {
        let token = new_token();

        if !self.store.set_if_absent(key, &token, lease).await? {
            debug!("Lock held by another owner");
            return Err(Error::FailedToPreempt);
        }

        info!("Lock acquired");
        Ok(LockHandle::new(
            self.store.clone(),
            key.to_string(),
            token,
            lease,
        ))
    }

    /// Acquires `key` for `lease`, retrying according to `retry`.
    ///
    /// One token is used for every attempt of this call. Each attempt is
    /// bounded by `attempt_timeout`; an attempt that times out counts as a
    /// failed attempt rather than an error. `cancel` bounds the whole call and
    /// always wins over an in-progress attempt or wait.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FailedToPreempt`] once `retry` is exhausted,
    /// [`Error::Cancelled`] if `cancel` fires first, and any other store
    /// failure unchanged without retrying.
    #[instrument(skip(self, retry, cancel))]
    pub async fn lock<R>(
        &self,
        key: &str,
        lease: Duration,
        mut retry: R,
        attempt_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<LockHandle<S>, Error>
    where
        R: RetryStrategy,
    {
        let token = new_token();
        let mut attempts = 0_usize;

        loop {
            attempts += 1;

            let attempt =
                tokio::time::timeout(attempt_timeout, self.store.acquire(key, &token, lease));

            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    debug!(attempts, "Lock cancelled during attempt");
                    return Err(Error::Cancelled);
                }
                outcome = attempt => outcome,
            };

            match outcome {
                Ok(Ok(true)) => {
                    info!(attempts, "Lock acquired");
                    return Ok(LockHandle::new(
                        self.store.clone(),
                        key.to_string(),
                        token,
                        lease,
                    ));
                }
                Ok(Ok(false)) => {
                    debug!(attempts, "Lock held by another owner");
                }
                Ok(Err(StoreError::DeadlineExceeded)) | Err(_) => {
                    warn!(attempts, ?attempt_timeout, "Lock attempt timed out");
                }
                Ok(Err(e)) => {
                    warn!(attempts, error = %e, "Lock attempt failed, aborting");
                    return Err(e.into());
                }
            }

            let Some(interval) = retry.next() else {
                debug!(attempts, "Retries exhausted");
                return Err(Error::FailedToPreempt);
            };

            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    debug!(attempts, "Lock cancelled while waiting to retry");
                    return Err(Error::Cancelled);
                }
                () = tokio::time::sleep(interval) => {}
            }
        }
    }
}

fn new_token() -> String {
    Uuid::new_v4().to_string()
}

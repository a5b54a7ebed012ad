use std::fmt::{self, Debug};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, StoreError};
use crate::store::{LockStore, lease_millis};

/// A held lease on a key.
///
/// Clones share the same token and stop signal, so any clone may refresh or
/// release the lease on behalf of all of them.
pub struct LockHandle<S>
where
    S: LockStore,
{
    inner: Arc<Inner<S>>,
}

struct Inner<S> {
    store: S,
    key: String,
    token: String,
    lease: Duration,
    stop: CancellationToken,
}

impl<S> Clone for LockHandle<S>
where
    S: LockStore,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> Debug for LockHandle<S>
where
    S: LockStore,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockHandle")
            .field("key", &self.inner.key)
            .field("lease", &self.inner.lease)
            .field("stopped", &self.inner.stop.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl<S> LockHandle<S>
where
    S: LockStore,
{
    pub(crate) fn new(store: S, key: String, token: String, lease: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                key,
                token,
                lease,
                stop: CancellationToken::new(),
            }),
        }
    }

    /// The locked key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// The ownership token stored under the key while the lease is held.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.inner.token
    }

    /// The lease duration applied on acquisition and on every refresh.
    #[must_use]
    pub fn lease(&self) -> Duration {
        self.inner.lease
    }

    /// Returns true once [`unlock`](Self::unlock) has been called on any clone.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.inner.stop.is_cancelled()
    }

    /// Pushes the lease expiry forward by the lease duration, if still held.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockNotHeld`] when the key is gone or holds another
    /// token; store failures are propagated unchanged.
    #[instrument(skip(self), fields(key = %self.inner.key))]
    pub async fn refresh(&self) -> Result<(), Error> {
        let lease_millis = lease_millis(self.inner.lease);

        match self
            .inner
            .store
            .compare_and_extend(&self.inner.key, &self.inner.token, lease_millis)
            .await
        {
            Ok(1) => {
                debug!("Lease extended");
                Ok(())
            }
            Ok(_) | Err(StoreError::NotFound) => Err(Error::LockNotHeld),
            Err(e) => Err(e.into()),
        }
    }

    /// Like [`refresh`](Self::refresh), bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeadlineExceeded`] if the round trip takes longer than
    /// `timeout`, otherwise the same errors as [`refresh`](Self::refresh).
    pub async fn refresh_within(&self, timeout: Duration) -> Result<(), Error> {
        tokio::time::timeout(timeout, self.refresh())
            .await
            .map_err(|_| Error::DeadlineExceeded)?
    }

    /// Keeps the lease alive until the handle is unlocked.
    ///
    /// Refreshes every `interval`, each call bounded by `timeout`. A refresh
    /// that times out is retried immediately instead of waiting for the next
    /// tick. `interval` must be shorter than the lease.
    ///
    /// # Errors
    ///
    /// Returns the first refresh error that is not a timeout, most commonly
    /// [`Error::LockNotHeld`] when the lease was lost. Returns `Ok(())` once
    /// the handle is unlocked.
    #[instrument(skip(self), fields(key = %self.inner.key))]
    pub async fn auto_refresh(&self, interval: Duration, timeout: Duration) -> Result<(), Error> {
        let stop = &self.inner.stop;
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut retry_now = false;

        loop {
            if !retry_now {
                tokio::select! {
                    biased;
                    () = stop.cancelled() => {
                        debug!("Auto refresh stopped");
                        return Ok(());
                    }
                    _ = ticker.tick() => {}
                }
            }

            let result = tokio::select! {
                biased;
                () = stop.cancelled() => {
                    debug!("Auto refresh stopped during refresh");
                    return Ok(());
                }
                result = self.refresh_within(timeout) => result,
            };

            match result {
                Ok(()) => retry_now = false,
                Err(Error::DeadlineExceeded) => {
                    warn!(?timeout, "Refresh timed out, retrying immediately");
                    retry_now = true;
                }
                Err(e) => {
                    warn!(error = %e, "Auto refresh stopped, lease may be lost");
                    return Err(e);
                }
            }
        }
    }

    /// Runs [`auto_refresh`](Self::auto_refresh) as a background task.
    #[must_use]
    pub fn spawn_auto_refresh(&self, interval: Duration, timeout: Duration) -> AutoRefreshTask {
        let handle = self.clone();
        let task = tokio::spawn(async move { handle.auto_refresh(interval, timeout).await });

        AutoRefreshTask { task }
    }

    /// Releases the lease.
    ///
    /// Fires the stop signal first so a running auto refresh exits cleanly,
    /// then deletes the key only if it still holds this handle's token.
    /// Calling this again repeats the delete, which then reports
    /// [`Error::LockNotHeld`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockNotHeld`] when the key is gone or holds another
    /// token; store failures are propagated unchanged.
    #[instrument(skip(self), fields(key = %self.inner.key))]
    pub async fn unlock(&self) -> Result<(), Error> {
        self.inner.stop.cancel();

        match self
            .inner
            .store
            .compare_and_delete(&self.inner.key, &self.inner.token)
            .await
        {
            Ok(deleted) if deleted > 0 => {
                info!("Lock released");
                Ok(())
            }
            Ok(_) | Err(StoreError::NotFound) => Err(Error::LockNotHeld),
            Err(e) => Err(e.into()),
        }
    }
}

/// A background auto refresh loop bound to a [`LockHandle`].
///
/// The loop ends when the handle is unlocked or the lease is lost.
#[derive(Debug)]
pub struct AutoRefreshTask {
    task: JoinHandle<Result<(), Error>>,
}

impl AutoRefreshTask {
    /// Returns true if the loop has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the loop to exit and returns its result.
    ///
    /// # Errors
    ///
    /// Returns the error that stopped the loop, or
    /// [`Error::RefreshTaskAborted`] if the task panicked or was aborted.
    pub async fn join(self) -> Result<(), Error> {
        self.task.await.map_err(|e| {
            warn!(error = %e, "Auto refresh task did not complete");
            Error::RefreshTaskAborted
        })?
    }

    /// Aborts the loop without releasing the lease.
    pub fn abort(&self) {
        self.task.abort();
    }
}

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::client::LockClient;
use crate::error::Error;
use crate::handle::LockHandle;
use crate::retry::RetryStrategy;
use crate::store::LockStore;

type FlightResult<S> = Option<Result<LockHandle<S>, Error>>;

/// Receiving side of an in-flight acquisition; `None` until it completes.
pub(crate) type Flight<S> = watch::Receiver<FlightResult<S>>;

impl<S> LockClient<S>
where
    S: LockStore,
{
    /// Like [`lock`](Self::lock), but concurrent calls for the same key share one
    /// acquisition.
    ///
    /// The first caller for a key starts the acquisition with its own
    /// arguments; later callers arriving while it runs wait for it and receive
    /// the same result, including a clone of the same handle. Every caller
    /// stops waiting as soon as its own `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns whatever the shared acquisition returned, [`Error::Cancelled`]
    /// if this caller's `cancel` fired first, or [`Error::FlightAborted`] if
    /// the acquisition task died without a result.
    #[instrument(skip(self, retry, cancel))]
    pub async fn single_flight_lock<R>(
        &self,
        key: &str,
        lease: Duration,
        retry: R,
        attempt_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<LockHandle<S>, Error>
    where
        R: RetryStrategy,
    {
        let mut flight = match self.in_flight.entry(key.to_string()) {
            Entry::Occupied(entry) => {
                debug!("Joining in-flight acquisition");
                entry.get().clone()
            }
            Entry::Vacant(entry) => {
                let (tx, rx) = watch::channel(None);
                entry.insert(rx.clone());
                self.start_flight(
                    key.to_string(),
                    lease,
                    retry,
                    attempt_timeout,
                    cancel.clone(),
                    tx,
                );
                rx
            }
        };

        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::Cancelled),
            result = flight.wait_for(Option::is_some) => match result {
                Ok(result) => result.clone().unwrap_or(Err(Error::FlightAborted)),
                Err(_) => Err(Error::FlightAborted),
            },
        }
    }

    fn start_flight<R>(
        &self,
        key: String,
        lease: Duration,
        retry: R,
        attempt_timeout: Duration,
        cancel: CancellationToken,
        tx: watch::Sender<FlightResult<S>>,
    ) where
        R: RetryStrategy,
    {
        let client = self.clone();
        let registration = Registration {
            registry: Arc::clone(&self.in_flight),
            key: key.clone(),
        };

        tokio::spawn(async move {
            let result = client
                .lock(&key, lease, retry, attempt_timeout, &cancel)
                .await;

            // Deregister before publishing so late arrivals start a new flight
            // instead of receiving a stale result.
            drop(registration);
            tx.send_replace(Some(result));
        });
    }

    /// Number of keys with an acquisition currently in flight.
    #[must_use]
    pub fn in_flight_keys(&self) -> usize {
        self.in_flight.len()
    }
}

/// Removes a key from the in-flight registry when its flight ends, including
/// when the flight task panics or is aborted.
struct Registration<S>
where
    S: LockStore,
{
    registry: Arc<DashMap<String, Flight<S>>>,
    key: String,
}

impl<S> Drop for Registration<S>
where
    S: LockStore,
{
    fn drop(&mut self) {
        self.registry.remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::{FixedIntervalRetry, NoRetry};
    use crate::testing::{Reply, ScriptedStore};
    use assert_matches::assert_matches;
    use tokio::task::JoinSet;
    use tokio::time::Instant;

    const CALLERS: usize = 8;

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_acquisition() {
        let store = ScriptedStore::new();
        store.push_acquire(Reply::Value(0));
        store.push_acquire(Reply::Value(1));
        let client = LockClient::new(store.clone());

        let mut callers = JoinSet::new();
        for _ in 0..CALLERS {
            let client = client.clone();
            callers.spawn(async move {
                client
                    .single_flight_lock(
                        "shared-key",
                        Duration::from_secs(60),
                        FixedIntervalRetry::new(Duration::from_millis(100), 3),
                        Duration::from_secs(1),
                        &CancellationToken::new(),
                    )
                    .await
            });
        }

        let handles: Vec<_> = callers
            .join_all()
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();

        assert_eq!(handles.len(), CALLERS);
        assert_eq!(store.acquire_calls(), 2);
        assert!(handles.iter().all(|h| h.token() == handles[0].token()));
        assert_eq!(client.in_flight_keys(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_failure() {
        let store = ScriptedStore::new();
        store.always_acquire(Reply::Value(0));
        let client = LockClient::new(store.clone());

        let mut callers = JoinSet::new();
        for _ in 0..CALLERS {
            let client = client.clone();
            callers.spawn(async move {
                client
                    .single_flight_lock(
                        "contended-key",
                        Duration::from_secs(60),
                        FixedIntervalRetry::new(Duration::from_millis(100), 2),
                        Duration::from_secs(1),
                        &CancellationToken::new(),
                    )
                    .await
            });
        }

        for result in callers.join_all().await {
            assert_matches!(result, Err(Error::FailedToPreempt));
        }
        assert_eq!(store.acquire_calls(), 3);
    }

    fn spawn_caller(
        client: &LockClient<ScriptedStore>,
        retry: FixedIntervalRetry,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<Result<LockHandle<ScriptedStore>, Error>> {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .single_flight_lock(
                    "contended-key",
                    Duration::from_secs(60),
                    retry,
                    Duration::from_secs(1),
                    &cancel,
                )
                .await
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_with_cancelled_token_returns_immediately() {
        let store = ScriptedStore::new();
        store.always_acquire(Reply::Value(0));
        let client = LockClient::new(store.clone());

        let leader = spawn_caller(
            &client,
            FixedIntervalRetry::new(Duration::from_millis(100), 5),
            CancellationToken::new(),
        );

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(client.in_flight_keys(), 1);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let waiter = client
            .single_flight_lock(
                "contended-key",
                Duration::from_secs(60),
                NoRetry,
                Duration::from_secs(1),
                &cancel,
            )
            .await;
        assert_matches!(waiter, Err(Error::Cancelled));

        assert_matches!(leader.await.unwrap(), Err(Error::FailedToPreempt));
        assert_eq!(store.acquire_calls(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_cancelled_mid_wait_leaves_flight_running() {
        let store = ScriptedStore::new();
        store.always_acquire(Reply::Value(0));
        let client = LockClient::new(store.clone());

        let leader = spawn_caller(
            &client,
            FixedIntervalRetry::new(Duration::from_millis(100), 5),
            CancellationToken::new(),
        );
        tokio::time::sleep(Duration::from_millis(10)).await;

        let waiter_cancel = CancellationToken::new();
        let waiter = spawn_caller(
            &client,
            FixedIntervalRetry::new(Duration::from_millis(100), 5),
            waiter_cancel.clone(),
        );

        tokio::time::sleep(Duration::from_millis(140)).await;
        assert!(!waiter.is_finished());
        let started = Instant::now();
        waiter_cancel.cancel();

        assert_matches!(waiter.await.unwrap(), Err(Error::Cancelled));
        assert!(started.elapsed() < Duration::from_millis(10));
        assert_eq!(client.in_flight_keys(), 1);

        assert_matches!(leader.await.unwrap(), Err(Error::FailedToPreempt));
        assert_eq!(store.acquire_calls(), 6);
        assert_eq!(client.in_flight_keys(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leader_cancellation_ends_flight_for_waiters() {
        let store = ScriptedStore::new();
        store.always_acquire(Reply::Value(0));
        let client = LockClient::new(store.clone());

        let leader_cancel = CancellationToken::new();
        let leader = spawn_caller(
            &client,
            FixedIntervalRetry::new(Duration::from_millis(100), 50),
            leader_cancel.clone(),
        );
        tokio::time::sleep(Duration::from_millis(10)).await;

        let waiter = spawn_caller(
            &client,
            FixedIntervalRetry::new(Duration::from_millis(100), 50),
            CancellationToken::new(),
        );
        tokio::time::sleep(Duration::from_millis(240)).await;

        leader_cancel.cancel();

        assert_matches!(leader.await.unwrap(), Err(Error::Cancelled));
        assert_matches!(waiter.await.unwrap(), Err(Error::Cancelled));
        assert_eq!(store.acquire_calls(), 3);
        assert_eq!(client.in_flight_keys(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiters_see_abort_when_flight_panics() {
        let store = ScriptedStore::new();
        store.push_acquire(Reply::Value(0));
        store.push_acquire(Reply::Panic);
        let client = LockClient::new(store.clone());

        let leader = spawn_caller(
            &client,
            FixedIntervalRetry::new(Duration::from_millis(100), 5),
            CancellationToken::new(),
        );
        tokio::time::sleep(Duration::from_millis(10)).await;

        let waiter = spawn_caller(
            &client,
            FixedIntervalRetry::new(Duration::from_millis(100), 5),
            CancellationToken::new(),
        );

        assert_matches!(leader.await.unwrap(), Err(Error::FlightAborted));
        assert_matches!(waiter.await.unwrap(), Err(Error::FlightAborted));
        assert_eq!(store.acquire_calls(), 2);
        assert_eq!(client.in_flight_keys(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_flight_after_previous_completes() {
        let store = ScriptedStore::new();
        store.push_acquire(Reply::Value(1));
        store.push_acquire(Reply::Value(1));
        let client = LockClient::new(store.clone());

        let first = client
            .single_flight_lock(
                "key",
                Duration::from_secs(60),
                NoRetry,
                Duration::from_secs(1),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        let second = client
            .single_flight_lock(
                "key",
                Duration::from_secs(60),
                NoRetry,
                Duration::from_secs(1),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_ne!(first.token(), second.token());
        assert_eq!(store.acquire_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_different_keys_do_not_share() {
        let store = ScriptedStore::new();
        store.always_acquire(Reply::Value(1));
        let client = LockClient::new(store.clone());
        let cancel = CancellationToken::new();

        let (a, b) = tokio::join!(
            client.single_flight_lock(
                "a",
                Duration::from_secs(60),
                NoRetry,
                Duration::from_secs(1),
                &cancel,
            ),
            client.single_flight_lock(
                "b",
                Duration::from_secs(60),
                NoRetry,
                Duration::from_secs(1),
                &cancel,
            ),
        );

        assert_ne!(a.unwrap().token(), b.unwrap().token());
        assert_eq!(store.acquire_calls(), 2);
    }
}

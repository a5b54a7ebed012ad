//! Lease-based mutual exclusion over a shared key-value store.
//!
//! A [`LockClient`] takes a key by writing a fresh ownership token under it with
//! an expiry. The resulting [`LockHandle`] can extend or release the lease, but
//! only while the store still holds its token, so a holder whose lease already
//! lapsed can never touch the entry of whoever took the key next.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod client;
mod error;
mod handle;
mod retry;
mod single_flight;
mod store;

#[cfg(test)]
mod testing;

pub use client::LockClient;
pub use error::{Error, StoreError};
pub use handle::{AutoRefreshTask, LockHandle};
pub use retry::{ExponentialBackoffRetry, FixedIntervalRetry, NoRetry, RetryStrategy};
pub use store::{LockStore, LockStore1, LockStore2, LockStore3, lease_millis};

//! CLI binary to take and hold a Redis-backed lease lock.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::redundant_pub_crate)]

use std::time::Duration;

use clap::Parser;
use keylease_locks::{FixedIntervalRetry, LockClient, LockHandle};
use keylease_locks_redis::{RedisLockStore, RedisLockStoreConfig};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// CLI-specific error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid combination of arguments
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// Lock operation error
    #[error(transparent)]
    Lock(#[from] keylease_locks::Error),

    /// Redis connection error
    #[error(transparent)]
    Redis(#[from] keylease_locks_redis::Error),
}

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Key to lock
    key: String,

    /// Redis connection URL
    #[arg(
        long,
        default_value = "redis://127.0.0.1:6379",
        env = "KEYLEASE_REDIS_URL"
    )]
    redis_url: String,

    /// Prefix applied to the key in Redis
    #[arg(long, env = "KEYLEASE_PREFIX")]
    prefix: Option<String>,

    /// Timeout for a single Redis round trip, in milliseconds
    #[arg(long, default_value_t = 2_000, env = "KEYLEASE_OPERATION_TIMEOUT_MS")]
    operation_timeout_ms: u64,

    /// Lease duration, in milliseconds
    #[arg(long, default_value_t = 10_000, env = "KEYLEASE_LEASE_MS")]
    lease_ms: u64,

    /// Interval between lease refreshes, in milliseconds (defaults to a third of the lease)
    #[arg(long, env = "KEYLEASE_REFRESH_INTERVAL_MS")]
    refresh_interval_ms: Option<u64>,

    /// Number of retries while the key is held elsewhere
    #[arg(long, default_value_t = 10, env = "KEYLEASE_RETRIES")]
    retries: usize,

    /// Wait between retries, in milliseconds
    #[arg(long, default_value_t = 500, env = "KEYLEASE_RETRY_INTERVAL_MS")]
    retry_interval_ms: u64,

    /// Release after holding for this long, in milliseconds (default: until interrupted)
    #[arg(long)]
    hold_ms: Option<u64>,

    /// Make a single attempt instead of retrying
    #[arg(long)]
    no_wait: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct HoldPlan {
    lease: Duration,
    refresh_interval: Duration,
    operation_timeout: Duration,
    retry_interval: Duration,
    hold: Option<Duration>,
}

impl TryFrom<&Args> for HoldPlan {
    type Error = Error;

    fn try_from(args: &Args) -> Result<Self, Self::Error> {
        if args.lease_ms == 0 {
            return Err(Error::InvalidArguments("lease must be positive".to_string()));
        }

        let lease = Duration::from_millis(args.lease_ms);
        let refresh_interval = args
            .refresh_interval_ms
            .map_or(lease / 3, Duration::from_millis);

        if refresh_interval.is_zero() || refresh_interval >= lease {
            return Err(Error::InvalidArguments(format!(
                "refresh interval {refresh_interval:?} must be positive and shorter than the lease {lease:?}"
            )));
        }

        Ok(Self {
            lease,
            refresh_interval,
            operation_timeout: Duration::from_millis(args.operation_timeout_ms),
            retry_interval: Duration::from_millis(args.retry_interval_ms),
            hold: args.hold_ms.map(Duration::from_millis),
        })
    }
}

async fn acquire(
    client: &LockClient<RedisLockStore>,
    args: &Args,
    plan: &HoldPlan,
    shutdown_token: &CancellationToken,
) -> Result<LockHandle<RedisLockStore>, Error> {
    let lock = if args.no_wait {
        client.try_lock(&args.key, plan.lease).await?
    } else {
        client
            .lock(
                &args.key,
                plan.lease,
                FixedIntervalRetry::new(plan.retry_interval, args.retries),
                plan.operation_timeout,
                shutdown_token,
            )
            .await?
    };

    Ok(lock)
}

async fn hold(
    lock: &LockHandle<RedisLockStore>,
    plan: &HoldPlan,
    shutdown_token: &CancellationToken,
) -> Result<(), Error> {
    let refresher = lock.spawn_auto_refresh(plan.refresh_interval, plan.operation_timeout);
    let hold_for = plan.hold;

    let hold_elapsed = async {
        match hold_for {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        () = shutdown_token.cancelled() => info!("Releasing lock on shutdown"),
        () = hold_elapsed => info!("Hold duration elapsed, releasing lock"),
        result = refresher.join() => {
            // The refresher only ends on its own when the lease is lost.
            error!("Lease refresh stopped");
            result?;
        }
    }

    Ok(())
}

async fn run(args: Args, shutdown_token: CancellationToken) -> Result<(), Error> {
    let plan = HoldPlan::try_from(&args)?;

    let store = RedisLockStore::connect(RedisLockStoreConfig {
        url: args.redis_url.clone(),
        operation_timeout: Some(plan.operation_timeout),
        prefix: args.prefix.clone(),
    })
    .await?;
    let client = LockClient::new(store);

    let lock = acquire(&client, &args, &plan, &shutdown_token).await?;
    info!(key = %lock.key(), token = %lock.token(), lease = ?plan.lease, "Holding lock");

    let held = hold(&lock, &plan, &shutdown_token).await;

    match lock.unlock().await {
        Ok(()) => info!("Lock released"),
        Err(e) => warn!(error = %e, "Lock was not released cleanly"),
    }

    held
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Error> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();

    let shutdown_token = CancellationToken::new();

    let signal_shutdown_token = shutdown_token.clone();
    tokio::spawn(async move {
        if cfg!(unix) {
            use tokio::signal::unix::{SignalKind, signal};

            let mut sigterm = signal(SignalKind::terminate()).expect("SIGTERM handler failed");
            let mut sigint = signal(SignalKind::interrupt()).expect("SIGINT handler failed");

            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM"),
                _ = sigint.recv() => info!("Received SIGINT"),
            }
        } else {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received interrupt signal");
        }

        signal_shutdown_token.cancel();
    });

    run(args, shutdown_token).await
}

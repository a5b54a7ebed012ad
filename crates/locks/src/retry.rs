use std::time::Duration;

/// Produces the waits between acquisition attempts of [`LockClient::lock`].
///
/// A strategy is owned by a single `lock` call and advanced once per failed
/// attempt. Returning `None` ends the retry loop.
///
/// [`LockClient::lock`]: crate::LockClient::lock
pub trait RetryStrategy: Send + 'static {
    /// Returns the wait before the next attempt, or `None` to stop retrying.
    fn next(&mut self) -> Option<Duration>;
}

impl RetryStrategy for Box<dyn RetryStrategy> {
    fn next(&mut self) -> Option<Duration> {
        (**self).next()
    }
}

/// Never retries.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoRetry;

impl RetryStrategy for NoRetry {
    fn next(&mut self) -> Option<Duration> {
        None
    }
}

/// Waits the same interval between attempts, up to `max_retries` times.
#[derive(Clone, Debug)]
pub struct FixedIntervalRetry {
    interval: Duration,
    max_retries: usize,
    retries: usize,
}

impl FixedIntervalRetry {
    /// Creates a strategy yielding `interval` exactly `max_retries` times.
    #[must_use]
    pub const fn new(interval: Duration, max_retries: usize) -> Self {
        Self {
            interval,
            max_retries,
            retries: 0,
        }
    }
}

impl RetryStrategy for FixedIntervalRetry {
    fn next(&mut self) -> Option<Duration> {
        if self.retries >= self.max_retries {
            return None;
        }

        self.retries += 1;
        Some(self.interval)
    }
}

/// Exponential backoff with jitter, capped at `max_delay`.
#[derive(Clone, Debug)]
pub struct ExponentialBackoffRetry {
    delay: Duration,
    max_delay: Duration,
    max_retries: usize,
    retries: usize,
}

impl ExponentialBackoffRetry {
    /// Creates a strategy starting at `base` and doubling up to `max_delay`.
    #[must_use]
    pub const fn new(base: Duration, max_delay: Duration, max_retries: usize) -> Self {
        Self {
            delay: base,
            max_delay,
            max_retries,
            retries: 0,
        }
    }
}

impl RetryStrategy for ExponentialBackoffRetry {
    fn next(&mut self) -> Option<Duration> {
        if self.retries >= self.max_retries {
            return None;
        }

        self.retries += 1;
        let current = std::cmp::min(self.delay, self.max_delay);

        // Add 0-10% jitter
        let factor = fastrand::f64().mul_add(0.1, 2.0);
        self.delay = Duration::try_from_secs_f64(self.delay.as_secs_f64() * factor)
            .map_or(self.max_delay, |next| std::cmp::min(next, self.max_delay));

        Some(current)
    }
}

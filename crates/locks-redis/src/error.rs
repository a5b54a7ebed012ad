use std::time::Duration;

use thiserror::Error;

/// Errors that can occur when connecting the Redis lock store.
#[derive(Debug, Error)]
pub enum Error {
    /// Error creating the client or establishing the connection.
    #[error("redis client error: {0}")]
    Client(#[from] redis::RedisError),

    /// The server did not answer in time while connecting.
    #[error("redis connection timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// The server answered the connection check unexpectedly.
    #[error("unexpected reply to PING: {0}")]
    UnexpectedPing(String),
}

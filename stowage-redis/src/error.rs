//! Error types for the Redis store.
//!
//! All errors convert to [`StoreError`] so the cache, queue and rate limiter
//! handle them the same way as any other store failure.

use std::time::Duration;

use redis::RedisError;
use stowage_core::StoreError;

/// Error type for Redis store operations.
///
/// # When You'll Encounter This
///
/// - Using [`RedisStoreBuilder::build`] with an invalid connection URL
/// - Performing the first operation when Redis is unreachable (the connection
///   is established lazily)
/// - Performing operations when the server returns an error
///
/// [`RedisStoreBuilder::build`]: crate::RedisStoreBuilder::build
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An error from the underlying Redis client.
    #[error("Redis store error: {0}")]
    Redis(#[from] RedisError),

    /// The command did not complete within the configured timeout.
    #[error("Redis command timed out after {0:?}")]
    Timeout(Duration),
}

impl Error {
    /// Failures worth a second attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Redis(err) => {
                err.is_io_error()
                    || err.is_connection_dropped()
                    || err.is_connection_refusal()
                    || err.is_timeout()
            }
            Self::Timeout(_) => true,
        }
    }
}

impl From<Error> for StoreError {
    fn from(error: Error) -> Self {
        match error {
            Error::Timeout(after) => Self::Timeout(after),
            error if error.is_transient() => Self::Connection(Box::new(error)),
            Error::Redis(err) => Self::Reply(err.to_string()),
        }
    }
}

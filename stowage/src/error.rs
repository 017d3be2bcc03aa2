//! Error types for the cache, queue and schedule.

use stowage_core::StoreError;
use thiserror::Error;

/// Error returned by job handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error observed by the fallible cache operations
/// ([`KeyCache::try_get`](crate::KeyCache::try_get) and friends).
#[derive(Debug, Error)]
pub enum CacheError {
    /// The store call failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The value could not be encoded to or decoded from JSON.
    #[error("cache value format error: {0}")]
    Format(#[from] serde_json::Error),
}

/// Error returned by queue and schedule operations that report failures.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The store call failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The job payload could not be encoded.
    #[error("job payload could not be serialized: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The schedule has been shut down and refuses new timers.
    #[error("schedule is shut down")]
    Closed,
}

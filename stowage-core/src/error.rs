//! Error types for store operations.

use std::time::Duration;

use thiserror::Error;

/// Error type for store operations.
///
/// Every store implementation converts its own error type into this enum, so
/// callers can decide how to degrade without knowing which store they talk to.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Network interaction error.
    ///
    /// The store could not be reached or the connection dropped mid-call.
    #[error(transparent)]
    Connection(Box<dyn std::error::Error + Send + Sync>),

    /// The call did not complete within the configured bound.
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    /// The store executed the command and answered with an error.
    #[error("store replied with an error: {0}")]
    Reply(String),

    /// The reply could not be decoded into the expected shape.
    #[error("unexpected store reply: {0}")]
    Protocol(String),

    /// Internal error, state or computation error.
    ///
    /// Any error not related to network interaction.
    #[error(transparent)]
    Internal(Box<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    /// Returns `true` for failures worth retrying (connection loss, timeout).
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout(_))
    }

    /// Shortcut for a [`StoreError::Reply`] reporting a type mismatch.
    pub fn wrong_type() -> Self {
        Self::Reply("WRONGTYPE Operation against a key holding the wrong kind of value".to_owned())
    }
}

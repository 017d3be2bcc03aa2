//! Error types for the Upstash REST store.
//!
//! Every error converts into [`StoreError`], which is what callers of the
//! [`Store`](stowage_core::Store) trait see.

use std::time::Duration;

use stowage_core::StoreError;

/// Error type for Upstash REST calls.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The HTTP request could not be sent or its body could not be read.
    #[error("upstash request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The call did not finish within the configured timeout.
    #[error("upstash call timed out after {0:?}")]
    Timeout(Duration),

    /// The endpoint answered with a non-success status and no command error.
    #[error("upstash responded with status {status}: {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, as far as it could be read.
        message: String,
    },

    /// The command was executed and Redis reported an error.
    #[error("upstash replied with an error: {0}")]
    Reply(String),

    /// The reply did not have the shape the command produces.
    #[error("unexpected upstash reply: {0}")]
    Unexpected(String),

    /// A required builder setting was not provided.
    #[error("upstash {0} is not configured")]
    Missing(&'static str),
}

impl Error {
    /// Failures worth a second attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(err) => err.is_connect() || err.is_timeout() || err.is_request(),
            Self::Timeout(_) => true,
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            Self::Reply(_) | Self::Unexpected(_) | Self::Missing(_) => false,
        }
    }
}

impl From<Error> for StoreError {
    fn from(error: Error) -> Self {
        match error {
            Error::Timeout(after) => Self::Timeout(after),
            Error::Reply(message) => Self::Reply(message),
            Error::Unexpected(message) => Self::Protocol(message),
            error if error.is_transient() => Self::Connection(Box::new(error)),
            error => Self::Internal(Box::new(error)),
        }
    }
}

use stowage::{BoxError, QueueError};
use thiserror::Error;

/// Errors raised by campaign scheduling and sending.
#[derive(Debug, Error)]
pub enum CampaignError {
    /// The job queue or schedule failed.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// The campaign catalog could not be read.
    #[error("campaign catalog unavailable: {0}")]
    Catalog(#[source] BoxError),

    /// The event log could not be written.
    #[error("event log unavailable: {0}")]
    Recorder(#[source] BoxError),

    /// An email could not be sent.
    #[error("failed to send campaign {campaign_id} to user {user_id}: {source}")]
    Send {
        /// Campaign being sent.
        campaign_id: i64,
        /// Recipient.
        user_id: i64,
        /// Sender error.
        #[source]
        source: BoxError,
    },

    /// A job referenced a campaign that is missing or inactive.
    #[error("campaign {0} not found")]
    CampaignNotFound(i64),

    /// A job payload is not valid campaign job data.
    #[error("invalid campaign job payload: {0}")]
    Payload(#[from] serde_json::Error),
}

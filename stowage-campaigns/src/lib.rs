//! Email campaign scheduling on top of the stowage job queue.
//!
//! [`DelayedDispatcher`] turns subscription lifecycle events (trial start and
//! end, cancellation, renewal) into campaign jobs that are enqueued after the
//! campaign's delay. [`CampaignEmailHandler`] processes those jobs from a
//! [`PollingWorker`](stowage::PollingWorker).
//!
//! The campaign catalog, the event log, the trial lookup and the email
//! provider are reached through the traits in [`ports`], so the crate does
//! not depend on a database or a mail API.
#![warn(missing_docs)]

pub mod dispatcher;
mod error;
mod handler;
#[cfg(any(test, feature = "test-helpers"))]
pub mod memory;
pub mod model;
pub mod ports;

pub use dispatcher::{CampaignStats, CleanupReport, DelayedDispatcher};
pub use error::CampaignError;
pub use handler::CampaignEmailHandler;
pub use model::{Campaign, EmailJobData, SubscriptionEvent, SubscriptionEventType, UserId};
pub use ports::{CampaignCatalog, EmailSender, EventRecorder, TrialDirectory};

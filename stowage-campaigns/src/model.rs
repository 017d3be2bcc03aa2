//! Campaign and subscription event types.

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Identifier of a user receiving campaign emails.
pub type UserId = i64;

/// Arbitrary JSON object attached to events and jobs.
pub type Metadata = Map<String, Value>;

/// Trigger of campaigns sent during a trial.
pub const TRIGGER_TRIAL_START: &str = "trial_start";
/// Trigger of campaigns sent after a trial ends.
pub const TRIGGER_TRIAL_EXPIRED: &str = "trial_expired";
/// Trigger of the win-back email.
pub const TRIGGER_SUBSCRIPTION_CANCELLED: &str = "subscription_cancelled";
/// Trigger of the renewal thank-you email.
pub const TRIGGER_SUBSCRIPTION_RENEWED: &str = "subscription_renewed";
/// Trigger of conversion emails queued by the application.
pub const TRIGGER_CONVERSION: &str = "conversion_trigger";

/// Kind of subscription lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionEventType {
    /// A trial started.
    TrialStart,
    /// A trial ended without conversion.
    TrialEnd,
    /// The subscription was cancelled.
    SubscriptionCancelled,
    /// The subscription renewed.
    SubscriptionRenewed,
}

impl SubscriptionEventType {
    /// Wire name, e.g. `trial_start`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TrialStart => "trial_start",
            Self::TrialEnd => "trial_end",
            Self::SubscriptionCancelled => "subscription_cancelled",
            Self::SubscriptionRenewed => "subscription_renewed",
        }
    }

    /// Status of the audit row recorded for this event, e.g. `event_trial_start`.
    pub fn audit_status(&self) -> String {
        format!("event_{}", self.as_str())
    }
}

impl fmt::Display for SubscriptionEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subscription lifecycle event reported by billing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionEvent {
    /// Subscriber.
    pub user_id: UserId,
    /// What happened.
    pub event_type: SubscriptionEventType,
    /// Billing provider subscription, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stripe_subscription_id: Option<String>,
    /// Free-form details stored with the audit row.
    #[serde(default)]
    pub metadata: Metadata,
}

impl SubscriptionEvent {
    /// Event without metadata.
    pub fn new(user_id: UserId, event_type: SubscriptionEventType) -> Self {
        Self {
            user_id,
            event_type,
            stripe_subscription_id: None,
            metadata: Metadata::new(),
        }
    }

    /// Attaches metadata.
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Email campaign definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Campaign {
    /// Catalog id.
    pub id: i64,
    /// Unique name, used in job names and timer keys.
    pub campaign_name: String,
    /// Event that schedules this campaign.
    pub trigger_event: String,
    /// Days between the trigger and the send.
    pub delay_days: u32,
    /// Hours added to [`delay_days`](Self::delay_days).
    pub delay_hours: u32,
    /// Inactive campaigns are never scheduled nor sent.
    pub is_active: bool,
}

impl Campaign {
    /// Delay between the trigger and the send.
    pub fn delay(&self) -> Duration {
        Duration::from_millis(
            u64::from(self.delay_days) * 86_400_000 + u64::from(self.delay_hours) * 3_600_000,
        )
    }
}

/// Payload of every campaign job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailJobData {
    /// Recipient.
    pub user_id: UserId,
    /// Trigger used to look up campaigns when no campaign id is set.
    #[serde(default)]
    pub trigger_event: String,
    /// Specific campaign to send.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub campaign_id: Option<i64>,
    /// Extra template context.
    #[serde(default)]
    pub context: Metadata,
}

//! Collaborators the campaign layer depends on.
//!
//! The application implements these against its database and email provider.

use std::sync::Arc;

use async_trait::async_trait;
use stowage::BoxError;

use crate::model::{Campaign, Metadata, UserId};

/// Read access to campaign definitions.
#[async_trait]
pub trait CampaignCatalog: Send + Sync {
    /// Active campaigns scheduled by `trigger_event`.
    async fn active_campaigns(&self, trigger_event: &str) -> Result<Vec<Campaign>, BoxError>;

    /// Active campaign with `id`, if any.
    async fn campaign(&self, id: i64) -> Result<Option<Campaign>, BoxError>;
}

/// Append-only log of subscription events and feature usage.
#[async_trait]
pub trait EventRecorder: Send + Sync {
    /// Records an audit row with `status` (e.g. `event_trial_start`).
    async fn record_event(
        &self,
        user_id: UserId,
        status: &str,
        metadata: &Metadata,
    ) -> Result<(), BoxError>;

    /// Records that `user_id` used `feature`.
    async fn record_feature_usage(&self, user_id: UserId, feature: &str) -> Result<(), BoxError>;
}

/// Answers whether a user is still on an active trial.
#[async_trait]
pub trait TrialDirectory: Send + Sync {
    /// Whether `user_id` has an unexpired trialing subscription.
    async fn is_on_trial(&self, user_id: UserId) -> Result<bool, BoxError>;
}

/// Delivers one campaign email.
#[async_trait]
pub trait EmailSender: Send + Sync {
    /// Sends `campaign` to `user_id` with the job's template `context`.
    async fn send_campaign_email(
        &self,
        user_id: UserId,
        campaign: &Campaign,
        context: &Metadata,
    ) -> Result<(), BoxError>;
}

#[async_trait]
impl<T: CampaignCatalog + ?Sized> CampaignCatalog for Arc<T> {
    async fn active_campaigns(&self, trigger_event: &str) -> Result<Vec<Campaign>, BoxError> {
        (**self).active_campaigns(trigger_event).await
    }

    async fn campaign(&self, id: i64) -> Result<Option<Campaign>, BoxError> {
        (**self).campaign(id).await
    }
}

#[async_trait]
impl<T: EventRecorder + ?Sized> EventRecorder for Arc<T> {
    async fn record_event(
        &self,
        user_id: UserId,
        status: &str,
        metadata: &Metadata,
    ) -> Result<(), BoxError> {
        (**self).record_event(user_id, status, metadata).await
    }

    async fn record_feature_usage(&self, user_id: UserId, feature: &str) -> Result<(), BoxError> {
        (**self).record_feature_usage(user_id, feature).await
    }
}

#[async_trait]
impl<T: TrialDirectory + ?Sized> TrialDirectory for Arc<T> {
    async fn is_on_trial(&self, user_id: UserId) -> Result<bool, BoxError> {
        (**self).is_on_trial(user_id).await
    }
}

#[async_trait]
impl<T: EmailSender + ?Sized> EmailSender for Arc<T> {
    async fn send_campaign_email(
        &self,
        user_id: UserId,
        campaign: &Campaign,
        context: &Metadata,
    ) -> Result<(), BoxError> {
        (**self).send_campaign_email(user_id, campaign, context).await
    }
}

//! In-memory implementations of the collaborator traits.

use std::{
    io,
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use stowage::BoxError;

use crate::{
    model::{Campaign, Metadata, UserId},
    ports::{CampaignCatalog, EmailSender, EventRecorder, TrialDirectory},
};

fn unavailable(what: &str) -> BoxError {
    Box::new(io::Error::new(
        io::ErrorKind::ConnectionRefused,
        format!("{what} unavailable"),
    ))
}

/// Campaign catalog held in a map.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    campaigns: DashMap<i64, Campaign>,
    unavailable: AtomicBool,
}

impl InMemoryCatalog {
    /// Catalog holding `campaigns`.
    pub fn new(campaigns: impl IntoIterator<Item = Campaign>) -> Self {
        let catalog = Self::default();
        for campaign in campaigns {
            catalog.insert(campaign);
        }
        catalog
    }

    /// Adds or replaces a campaign.
    pub fn insert(&self, campaign: Campaign) {
        self.campaigns.insert(campaign.id, campaign);
    }

    /// Makes every read fail while `true`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), BoxError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(unavailable("campaign catalog"));
        }
        Ok(())
    }
}

#[async_trait]
impl CampaignCatalog for InMemoryCatalog {
    async fn active_campaigns(&self, trigger_event: &str) -> Result<Vec<Campaign>, BoxError> {
        self.check()?;
        let mut campaigns: Vec<Campaign> = self
            .campaigns
            .iter()
            .filter(|c| c.is_active && c.trigger_event == trigger_event)
            .map(|c| c.value().clone())
            .collect();
        campaigns.sort_by_key(|c| c.id);
        Ok(campaigns)
    }

    async fn campaign(&self, id: i64) -> Result<Option<Campaign>, BoxError> {
        self.check()?;
        Ok(self
            .campaigns
            .get(&id)
            .filter(|c| c.is_active)
            .map(|c| c.value().clone()))
    }
}

/// Row written by [`InMemoryEventLog`].
#[derive(Debug, Clone, PartialEq)]
pub struct EventRow {
    /// Subscriber.
    pub user_id: UserId,
    /// Audit status, e.g. `event_trial_start`.
    pub status: String,
    /// Event metadata.
    pub metadata: Metadata,
    /// Insert time.
    pub recorded_at: DateTime<Utc>,
}

/// Event log kept in memory.
#[derive(Debug, Default)]
pub struct InMemoryEventLog {
    events: Mutex<Vec<EventRow>>,
    feature_usage: Mutex<Vec<(UserId, String)>>,
    unavailable: AtomicBool,
}

impl InMemoryEventLog {
    /// Empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded audit rows, oldest first.
    pub fn events(&self) -> Vec<EventRow> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Recorded feature usage, oldest first.
    pub fn feature_usage(&self) -> Vec<(UserId, String)> {
        self.feature_usage
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Makes every write fail while `true`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl EventRecorder for InMemoryEventLog {
    async fn record_event(
        &self,
        user_id: UserId,
        status: &str,
        metadata: &Metadata,
    ) -> Result<(), BoxError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(unavailable("event log"));
        }
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(EventRow {
                user_id,
                status: status.to_owned(),
                metadata: metadata.clone(),
                recorded_at: Utc::now(),
            });
        Ok(())
    }

    async fn record_feature_usage(&self, user_id: UserId, feature: &str) -> Result<(), BoxError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(unavailable("event log"));
        }
        self.feature_usage
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((user_id, feature.to_owned()));
        Ok(())
    }
}

/// Set of users currently on trial.
#[derive(Debug, Default)]
pub struct InMemoryTrials {
    trialing: DashSet<UserId>,
}

impl InMemoryTrials {
    /// Directory where `users` are on trial.
    pub fn new(users: impl IntoIterator<Item = UserId>) -> Self {
        Self {
            trialing: users.into_iter().collect(),
        }
    }

    /// Marks `user_id` as trialing.
    pub fn start(&self, user_id: UserId) {
        self.trialing.insert(user_id);
    }

    /// Marks `user_id` as no longer trialing.
    pub fn end(&self, user_id: UserId) {
        self.trialing.remove(&user_id);
    }
}

#[async_trait]
impl TrialDirectory for InMemoryTrials {
    async fn is_on_trial(&self, user_id: UserId) -> Result<bool, BoxError> {
        Ok(self.trialing.contains(&user_id))
    }
}

/// Sender that records deliveries instead of sending them.
#[derive(Debug, Default)]
pub struct RecordingSender {
    sent: Mutex<Vec<(UserId, i64)>>,
    failing: AtomicBool,
}

impl RecordingSender {
    /// Sender with no deliveries.
    pub fn new() -> Self {
        Self::default()
    }

    /// `(user, campaign id)` pairs delivered so far.
    pub fn sent(&self) -> Vec<(UserId, i64)> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Makes every send fail while `true`.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl EmailSender for RecordingSender {
    async fn send_campaign_email(
        &self,
        user_id: UserId,
        campaign: &Campaign,
        _context: &Metadata,
    ) -> Result<(), BoxError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(unavailable("email provider"));
        }
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((user_id, campaign.id));
        Ok(())
    }
}

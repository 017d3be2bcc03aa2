//! Delayed dispatch of campaign emails for subscription events.

use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError, Weak},
    time::Duration,
};

use serde::Serialize;
use serde_json::{Value, json};
use stowage::{
    JobId, JobOptions, JobQueue, PendingJob, PollingWorker, Schedule, SharedStore, Store,
    TimerTable, Ttl, WorkerHandle,
};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::{
    CampaignError,
    handler::CampaignEmailHandler,
    model::{
        Campaign, Metadata, SubscriptionEvent, SubscriptionEventType, TRIGGER_CONVERSION,
        TRIGGER_SUBSCRIPTION_CANCELLED, TRIGGER_SUBSCRIPTION_RENEWED, TRIGGER_TRIAL_EXPIRED,
        TRIGGER_TRIAL_START, UserId,
    },
    ports::{CampaignCatalog, EmailSender, EventRecorder, TrialDirectory},
};

/// Queue campaign jobs are written to.
pub const QUEUE_NAME: &str = "email-campaigns";
/// Delay of the win-back email after a cancellation.
pub const WIN_BACK_DELAY: Duration = Duration::from_secs(7 * 24 * 60 * 60);
/// Delay of the thank-you email after a renewal.
pub const RENEWAL_DELAY: Duration = Duration::from_secs(1);
/// Interval of [`DelayedDispatcher::spawn_cleanup`] sweeps.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);
/// Longest TTL a job record may keep after a cleanup sweep.
pub const MAX_RECORD_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// What a [`DelayedDispatcher::cleanup`] sweep changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Job records whose TTL was capped to [`MAX_RECORD_TTL`].
    pub records_capped: usize,
    /// Trial timers cancelled because the user left the trial.
    pub timers_cancelled: usize,
}

/// Snapshot returned by [`DelayedDispatcher::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CampaignStats {
    /// Pending schedule entries.
    pub scheduled: usize,
    /// Jobs waiting in the queue.
    pub waiting: u64,
    /// Jobs on the dead-letter list.
    pub dead_lettered: u64,
}

#[derive(Default)]
struct Tasks {
    cleanup: Option<JoinHandle<()>>,
    worker: Option<WorkerHandle>,
}

/// Turns subscription events into delayed campaign jobs.
///
/// Every event is first written to the [`EventRecorder`], then the matching
/// campaigns are scheduled under a logical key
/// (`trial-<user>-<campaign>`, `retention-<user>-<campaign>`,
/// `retention-<user>-win-back`, `renewal-<user>-thank-you`). Scheduling the
/// same key again replaces the pending entry.
pub struct DelayedDispatcher {
    queue: JobQueue,
    schedule: Arc<dyn Schedule>,
    catalog: Arc<dyn CampaignCatalog>,
    recorder: Arc<dyn EventRecorder>,
    trials: Arc<dyn TrialDirectory>,
    tasks: Mutex<Tasks>,
}

impl fmt::Debug for DelayedDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelayedDispatcher")
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

impl DelayedDispatcher {
    /// Dispatcher on the `email-campaigns` queue of `store`, scheduling with
    /// in-process timers.
    pub fn new(
        store: SharedStore,
        catalog: Arc<dyn CampaignCatalog>,
        recorder: Arc<dyn EventRecorder>,
        trials: Arc<dyn TrialDirectory>,
    ) -> Self {
        Self::with_queue(JobQueue::new(store, QUEUE_NAME), catalog, recorder, trials)
    }

    /// Dispatcher on an explicit queue.
    pub fn with_queue(
        queue: JobQueue,
        catalog: Arc<dyn CampaignCatalog>,
        recorder: Arc<dyn EventRecorder>,
        trials: Arc<dyn TrialDirectory>,
    ) -> Self {
        let schedule = Arc::new(TimerTable::new(queue.clone()));
        info!(queue = queue.name(), "email campaign dispatcher initialized");
        Self {
            queue,
            schedule,
            catalog,
            recorder,
            trials,
            tasks: Mutex::new(Tasks::default()),
        }
    }

    /// Replaces the schedule, e.g. with a [`DurableSchedule`](stowage::DurableSchedule).
    pub fn with_schedule(mut self, schedule: Arc<dyn Schedule>) -> Self {
        self.schedule = schedule;
        self
    }

    /// Queue campaign jobs are enqueued into.
    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Schedule holding pending campaign jobs.
    pub fn schedule(&self) -> &Arc<dyn Schedule> {
        &self.schedule
    }

    /// Records `event` and schedules the campaigns it triggers.
    ///
    /// Recording is best effort and never fails the call. Scheduling failures
    /// are logged and returned.
    pub async fn handle_subscription_event(
        &self,
        event: &SubscriptionEvent,
    ) -> Result<(), CampaignError> {
        let user_id = event.user_id;
        let event_type = event.event_type;
        self.record_event(event).await;

        let result = match event_type {
            SubscriptionEventType::TrialStart => self
                .schedule_campaigns(user_id, TRIGGER_TRIAL_START, "trial", |campaign| {
                    json!({ "campaignName": campaign.campaign_name })
                })
                .await
                .map(drop),
            SubscriptionEventType::TrialEnd => self
                .schedule_campaigns(user_id, TRIGGER_TRIAL_EXPIRED, "retention", |_| {
                    json!({ "reason": TRIGGER_TRIAL_EXPIRED })
                })
                .await
                .map(drop),
            SubscriptionEventType::SubscriptionCancelled => {
                self.schedule_single(
                    format!("retention-{user_id}-win-back"),
                    "win-back-email",
                    WIN_BACK_DELAY,
                    user_id,
                    TRIGGER_SUBSCRIPTION_CANCELLED,
                )
                .await
            }
            SubscriptionEventType::SubscriptionRenewed => {
                self.schedule_single(
                    format!("renewal-{user_id}-thank-you"),
                    "renewal-thank-you",
                    RENEWAL_DELAY,
                    user_id,
                    TRIGGER_SUBSCRIPTION_RENEWED,
                )
                .await
            }
        };

        match &result {
            Ok(()) => info!(
                user_id,
                event_type = %event_type,
                "subscription event processed for email campaigns"
            ),
            Err(err) => error!(
                user_id,
                event_type = %event_type,
                error = %err,
                "failed to handle subscription event"
            ),
        }
        result
    }

    async fn record_event(&self, event: &SubscriptionEvent) {
        let status = event.event_type.audit_status();
        match self
            .recorder
            .record_event(event.user_id, &status, &event.metadata)
            .await
        {
            Ok(()) => debug!(user_id = event.user_id, status = %status, "subscription event recorded"),
            Err(err) => error!(
                user_id = event.user_id,
                status = %status,
                error = %err,
                "failed to record subscription event"
            ),
        }
    }

    /// Schedules every active campaign of `trigger` for `user_id` as
    /// `<purpose>-<campaign>` jobs keyed `<purpose>-<user>-<campaign>`.
    async fn schedule_campaigns<F>(
        &self,
        user_id: UserId,
        trigger: &str,
        purpose: &str,
        context: F,
    ) -> Result<usize, CampaignError>
    where
        F: Fn(&Campaign) -> Value,
    {
        let campaigns = self
            .catalog
            .active_campaigns(trigger)
            .await
            .map_err(CampaignError::Catalog)?;

        for campaign in &campaigns {
            let key = format!("{purpose}-{user_id}-{}", campaign.campaign_name);
            let delay = campaign.delay();
            let job = PendingJob::new(
                format!("{purpose}-{}", campaign.campaign_name),
                json!({
                    "userId": user_id,
                    "triggerEvent": trigger,
                    "campaignId": campaign.id,
                    "context": context(campaign),
                }),
            );
            self.schedule.schedule(&key, delay, job).await?;
            info!(
                user_id,
                campaign_id = campaign.id,
                campaign_name = %campaign.campaign_name,
                delay_ms = delay.as_millis() as u64,
                "campaign email scheduled"
            );
        }
        Ok(campaigns.len())
    }

    async fn schedule_single(
        &self,
        key: String,
        job_name: &str,
        delay: Duration,
        user_id: UserId,
        trigger: &str,
    ) -> Result<(), CampaignError> {
        let job = PendingJob::new(
            job_name,
            json!({
                "userId": user_id,
                "triggerEvent": trigger,
                "context": { "reason": trigger },
            }),
        );
        self.schedule.schedule(&key, delay, job).await?;
        info!(user_id, job_name, delay_ms = delay.as_millis() as u64, "campaign email scheduled");
        Ok(())
    }

    /// Enqueues a `conversion-<template>` job right away.
    ///
    /// `context` is merged into the job context after the `template` field.
    pub async fn queue_campaign_email(
        &self,
        user_id: UserId,
        template: &str,
        context: Metadata,
    ) -> Result<JobId, CampaignError> {
        let mut merged = Metadata::new();
        merged.insert("template".to_owned(), Value::from(template));
        merged.extend(context);

        let result = self
            .queue
            .add(
                &format!("conversion-{template}"),
                &json!({
                    "userId": user_id,
                    "triggerEvent": TRIGGER_CONVERSION,
                    "context": merged,
                }),
                JobOptions::default(),
            )
            .await;
        match result {
            Ok(id) => {
                info!(user_id, template, job_id = %id, "campaign email queued for conversion trigger");
                Ok(id)
            }
            Err(err) => {
                error!(user_id, template, error = %err, "failed to queue campaign email");
                Err(err.into())
            }
        }
    }

    /// Records that `user_id` used `feature`. Failures are logged and returned.
    pub async fn record_feature_usage(
        &self,
        user_id: UserId,
        feature: &str,
    ) -> Result<(), CampaignError> {
        match self.recorder.record_feature_usage(user_id, feature).await {
            Ok(()) => {
                info!(user_id, feature, "feature usage recorded for email campaigns");
                Ok(())
            }
            Err(err) => {
                error!(user_id, feature, error = %err, "failed to record feature usage");
                Err(CampaignError::Recorder(err))
            }
        }
    }

    /// Caps job record TTLs and drops trial timers of users no longer on trial.
    ///
    /// Only job envelope records of the queue are touched; the job list,
    /// dead-letter list and schedule keys keep their lifetime. Failures are
    /// logged and leave the affected item as it was.
    pub async fn cleanup(&self) -> CleanupReport {
        let mut report = CleanupReport::default();

        match self.cap_record_ttls().await {
            Ok(capped) => report.records_capped = capped,
            Err(err) => error!(error = %err, "failed to cap job record TTLs"),
        }
        match self.drop_stale_trial_timers().await {
            Ok(cancelled) => report.timers_cancelled = cancelled,
            Err(err) => error!(error = %err, "failed to drop stale trial timers"),
        }

        info!(
            records_capped = report.records_capped,
            timers_cancelled = report.timers_cancelled,
            "email campaign cleanup completed"
        );
        report
    }

    async fn cap_record_ttls(&self) -> Result<usize, CampaignError> {
        let store = self.queue.store();
        let mut capped = 0;
        for key in self.queue.envelope_keys().await? {
            let ttl = match store.ttl(&key).await {
                Ok(ttl) => ttl,
                Err(err) => {
                    warn!(key = %key, error = %err, "failed to read job record TTL");
                    continue;
                }
            };
            let too_long = match ttl {
                Ttl::Missing => false,
                Ttl::Persistent => true,
                Ttl::Expires(left) => left > MAX_RECORD_TTL,
            };
            if !too_long {
                continue;
            }
            match store.expire(&key, MAX_RECORD_TTL).await {
                Ok(_) => capped += 1,
                Err(err) => warn!(key = %key, error = %err, "failed to cap job record TTL"),
            }
        }
        Ok(capped)
    }

    async fn drop_stale_trial_timers(&self) -> Result<usize, CampaignError> {
        let mut cancelled = 0;
        for key in self.schedule.pending_keys().await? {
            let Some(user_id) = trial_timer_user(&key) else {
                continue;
            };
            match self.trials.is_on_trial(user_id).await {
                Ok(true) => {}
                Ok(false) => {
                    if self.schedule.cancel(&key).await? {
                        debug!(key = %key, user_id, "dropped trial timer of user no longer on trial");
                        cancelled += 1;
                    }
                }
                Err(err) => {
                    warn!(key = %key, user_id, error = %err, "failed to check trial status, keeping timer");
                }
            }
        }
        Ok(cancelled)
    }

    /// Runs [`cleanup`](Self::cleanup) every `every` until [`close`](Self::close).
    ///
    /// The first sweep runs one interval after the call. Calling again
    /// replaces the running sweep.
    pub fn spawn_cleanup(self: &Arc<Self>, every: Duration) {
        let every = every.max(Duration::from_millis(1));
        let dispatcher: Weak<Self> = Arc::downgrade(self);
        let span = info_span!("campaign_cleanup", queue = self.queue.name());
        let handle = tokio::spawn(
            async move {
                let mut interval =
                    tokio::time::interval_at(tokio::time::Instant::now() + every, every);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    interval.tick().await;
                    let Some(dispatcher) = dispatcher.upgrade() else {
                        break;
                    };
                    dispatcher.cleanup().await;
                }
            }
            .instrument(span),
        );
        if let Some(previous) = self.tasks().cleanup.replace(handle) {
            previous.abort();
        }
    }

    /// Worker draining the campaign queue into `sender`.
    ///
    /// Every job name is handled by a [`CampaignEmailHandler`]; the schedule is
    /// polled at each tick.
    pub fn worker(&self, sender: Arc<dyn EmailSender>, poll_interval: Duration) -> PollingWorker {
        PollingWorker::builder(self.queue.clone())
            .handler("*", CampaignEmailHandler::new(self.catalog.clone(), sender))
            .schedule(self.schedule.clone())
            .poll_interval(poll_interval)
            .build()
    }

    /// Spawns [`worker`](Self::worker); it is stopped by [`close`](Self::close).
    pub async fn start_worker(&self, sender: Arc<dyn EmailSender>, poll_interval: Duration) {
        let handle = self.worker(sender, poll_interval).spawn();
        let previous = self.tasks().worker.replace(handle);
        if let Some(previous) = previous {
            previous.shutdown().await;
        }
    }

    /// Pending entries, waiting jobs and dead-lettered jobs.
    pub async fn stats(&self) -> Result<CampaignStats, CampaignError> {
        let stats = async {
            Ok::<_, CampaignError>(CampaignStats {
                scheduled: self.schedule.len().await?,
                waiting: self.queue.len().await?,
                dead_lettered: self.queue.failed_len().await?,
            })
        }
        .await;
        if let Err(err) = &stats {
            error!(error = %err, "failed to get email campaign stats");
        }
        stats
    }

    /// Cancels every pending entry and stops the cleanup and worker tasks.
    ///
    /// Nothing is enqueued by the schedule once this starts.
    pub async fn close(&self) {
        self.schedule.shutdown().await;
        let (cleanup, worker) = {
            let mut tasks = self.tasks();
            (tasks.cleanup.take(), tasks.worker.take())
        };
        if let Some(cleanup) = cleanup {
            cleanup.abort();
        }
        if let Some(worker) = worker {
            worker.shutdown().await;
        }
        info!(queue = self.queue.name(), "email campaign dispatcher closed");
    }

    fn tasks(&self) -> std::sync::MutexGuard<'_, Tasks> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// User of a `trial-<user>-<campaign>` key.
fn trial_timer_user(key: &str) -> Option<UserId> {
    let rest = key.strip_prefix("trial-")?;
    let (user, _campaign) = rest.split_once('-')?;
    user.parse().ok()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use stowage::{DurableSchedule, JobStatus, TickOutcome};
    use stowage_core::ManualClock;
    use stowage_memory::MemoryStore;

    use super::*;
    use crate::memory::{InMemoryCatalog, InMemoryEventLog, InMemoryTrials, RecordingSender};

    struct Fixture {
        dispatcher: Arc<DelayedDispatcher>,
        store: Arc<MemoryStore>,
        catalog: Arc<InMemoryCatalog>,
        events: Arc<InMemoryEventLog>,
        trials: Arc<InMemoryTrials>,
    }

    fn campaign(id: i64, name: &str, trigger: &str, days: u32, hours: u32) -> Campaign {
        Campaign {
            id,
            campaign_name: name.to_owned(),
            trigger_event: trigger.to_owned(),
            delay_days: days,
            delay_hours: hours,
            is_active: true,
        }
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let catalog = Arc::new(InMemoryCatalog::new([
            campaign(1, "welcome", TRIGGER_TRIAL_START, 0, 1),
            campaign(2, "tips", TRIGGER_TRIAL_START, 3, 0),
            campaign(3, "come-back", TRIGGER_TRIAL_EXPIRED, 1, 0),
        ]));
        let events = Arc::new(InMemoryEventLog::new());
        let trials = Arc::new(InMemoryTrials::default());
        let dispatcher = Arc::new(DelayedDispatcher::new(
            store.clone(),
            catalog.clone(),
            events.clone(),
            trials.clone(),
        ));
        Fixture {
            dispatcher,
            store,
            catalog,
            events,
            trials,
        }
    }

    #[test]
    fn trial_timer_keys() {
        assert_eq!(trial_timer_user("trial-42-welcome"), Some(42));
        assert_eq!(trial_timer_user("trial-42-multi-part-name"), Some(42));
        assert_eq!(trial_timer_user("retention-42-win-back"), None);
        assert_eq!(trial_timer_user("trial-abc-welcome"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_schedules_win_back_after_seven_days() {
        let f = fixture();
        let event = SubscriptionEvent::new(42, SubscriptionEventType::SubscriptionCancelled);

        f.dispatcher.handle_subscription_event(&event).await.unwrap();

        let events = f.events.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].user_id, 42);
        assert_eq!(events[0].status, "event_subscription_cancelled");
        assert_eq!(f.dispatcher.queue().len().await.unwrap(), 0);

        tokio::time::sleep(WIN_BACK_DELAY - Duration::from_secs(1)).await;
        assert_eq!(f.dispatcher.queue().len().await.unwrap(), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(f.dispatcher.queue().len().await.unwrap(), 1);
        let job = f.dispatcher.queue().next_job().await.unwrap();
        assert_eq!(job.name, "win-back-email");
        assert_eq!(job.data["userId"], 42);
        assert_eq!(job.data["triggerEvent"], "subscription_cancelled");
        assert_eq!(job.data["context"]["reason"], "subscription_cancelled");
    }

    #[tokio::test(start_paused = true)]
    async fn trial_start_schedules_each_active_campaign() {
        let f = fixture();
        f.dispatcher
            .handle_subscription_event(&SubscriptionEvent::new(7, SubscriptionEventType::TrialStart))
            .await
            .unwrap();

        let mut keys = f.dispatcher.schedule().pending_keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["trial-7-tips", "trial-7-welcome"]);

        tokio::time::sleep(Duration::from_secs(3601)).await;
        let job = f.dispatcher.queue().next_job().await.unwrap();
        assert_eq!(job.name, "trial-welcome");
        assert_eq!(job.data["campaignId"], 1);
        assert_eq!(job.data["triggerEvent"], "trial_start");
        assert_eq!(job.data["context"]["campaignName"], "welcome");
        assert!(f.dispatcher.queue().next_job().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_renewal_enqueues_one_thank_you() {
        let f = fixture();
        let event = SubscriptionEvent::new(5, SubscriptionEventType::SubscriptionRenewed);
        f.dispatcher.handle_subscription_event(&event).await.unwrap();
        f.dispatcher.handle_subscription_event(&event).await.unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(f.dispatcher.queue().len().await.unwrap(), 1);
        assert_eq!(f.events.events().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn trial_end_schedules_retention_campaigns() {
        let f = fixture();
        f.dispatcher
            .handle_subscription_event(&SubscriptionEvent::new(9, SubscriptionEventType::TrialEnd))
            .await
            .unwrap();

        assert_eq!(
            f.dispatcher.schedule().pending_keys().await.unwrap(),
            vec!["retention-9-come-back"]
        );
        tokio::time::sleep(Duration::from_secs(86_401)).await;
        let job = f.dispatcher.queue().next_job().await.unwrap();
        assert_eq!(job.name, "retention-come-back");
        assert_eq!(job.data["context"]["reason"], "trial_expired");
    }

    #[tokio::test]
    async fn audit_row_is_written_even_when_scheduling_fails() {
        let f = fixture();
        f.catalog.set_unavailable(true);

        let result = f
            .dispatcher
            .handle_subscription_event(&SubscriptionEvent::new(3, SubscriptionEventType::TrialStart))
            .await;

        assert!(matches!(result, Err(CampaignError::Catalog(_))));
        assert_eq!(f.events.events()[0].status, "event_trial_start");
    }

    #[tokio::test]
    async fn recorder_outage_does_not_block_scheduling() {
        let f = fixture();
        f.events.set_unavailable(true);

        f.dispatcher
            .handle_subscription_event(&SubscriptionEvent::new(3, SubscriptionEventType::SubscriptionRenewed))
            .await
            .unwrap();
        assert_eq!(f.dispatcher.schedule().len().await.unwrap(), 1);
        f.dispatcher.close().await;
    }

    #[tokio::test]
    async fn conversion_email_is_queued_immediately() {
        let f = fixture();
        let mut context = Metadata::new();
        context.insert("feature".to_owned(), Value::from("analytics"));

        let id = f
            .dispatcher
            .queue_campaign_email(11, "upgrade-nudge", context)
            .await
            .unwrap();

        let job = f.dispatcher.queue().next_job().await.unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.name, "conversion-upgrade-nudge");
        assert_eq!(
            job.data,
            json!({
                "userId": 11,
                "triggerEvent": "conversion_trigger",
                "context": { "template": "upgrade-nudge", "feature": "analytics" },
            })
        );
    }

    #[tokio::test]
    async fn feature_usage_is_recorded() {
        let f = fixture();
        f.dispatcher.record_feature_usage(4, "exports").await.unwrap();
        assert_eq!(f.events.feature_usage(), vec![(4, "exports".to_owned())]);

        f.events.set_unavailable(true);
        assert!(matches!(
            f.dispatcher.record_feature_usage(4, "exports").await,
            Err(CampaignError::Recorder(_))
        ));
    }

    #[tokio::test]
    async fn cleanup_caps_record_ttls_and_drops_stale_trial_timers() {
        let f = fixture();
        f.trials.start(1);
        for user in [1, 2] {
            f.dispatcher
                .handle_subscription_event(&SubscriptionEvent::new(user, SubscriptionEventType::TrialStart))
                .await
                .unwrap();
        }
        f.dispatcher
            .handle_subscription_event(&SubscriptionEvent::new(2, SubscriptionEventType::SubscriptionCancelled))
            .await
            .unwrap();

        let queue = f.dispatcher.queue();
        let done = queue.add("conversion-a", &json!({ "userId": 1 }), JobOptions::default()).await.unwrap();
        assert_eq!(queue.next_job().await.unwrap().id, done);
        queue.complete_job(&done).await;
        let waiting = queue.add("conversion-b", &json!({ "userId": 1 }), JobOptions::default()).await.unwrap();

        let report = f.dispatcher.cleanup().await;

        assert_eq!(
            report,
            CleanupReport {
                records_capped: 1,
                timers_cancelled: 2,
            }
        );
        assert!(matches!(
            f.store.ttl(&queue.job_key(&waiting)).await.unwrap(),
            Ttl::Expires(left) if left <= MAX_RECORD_TTL
        ));
        assert_eq!(f.store.ttl(&queue.jobs_key()).await.unwrap(), Ttl::Persistent);
        let mut keys = f.dispatcher.schedule().pending_keys().await.unwrap();
        keys.sort();
        assert_eq!(
            keys,
            vec!["retention-2-win-back", "trial-1-tips", "trial-1-welcome"]
        );
        f.dispatcher.close().await;
    }

    #[tokio::test]
    async fn stats_and_close() {
        let f = fixture();
        f.dispatcher
            .handle_subscription_event(&SubscriptionEvent::new(1, SubscriptionEventType::TrialStart))
            .await
            .unwrap();
        f.dispatcher
            .queue_campaign_email(1, "nudge", Metadata::new())
            .await
            .unwrap();

        assert_eq!(
            f.dispatcher.stats().await.unwrap(),
            CampaignStats {
                scheduled: 2,
                waiting: 1,
                dead_lettered: 0,
            }
        );

        f.dispatcher.close().await;
        assert_eq!(f.dispatcher.stats().await.unwrap().scheduled, 0);
        assert!(matches!(
            f.dispatcher
                .handle_subscription_event(&SubscriptionEvent::new(1, SubscriptionEventType::TrialStart))
                .await,
            Err(CampaignError::Queue(stowage::QueueError::Closed))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_cleanup_runs_every_interval() {
        let f = fixture();
        f.dispatcher
            .handle_subscription_event(&SubscriptionEvent::new(8, SubscriptionEventType::TrialStart))
            .await
            .unwrap();
        f.dispatcher.spawn_cleanup(Duration::from_secs(60));

        // User 8 is not on trial, the first sweep drops both timers.
        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(f.dispatcher.schedule().len().await.unwrap(), 2);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(f.dispatcher.schedule().len().await.unwrap(), 0);

        f.dispatcher.close().await;
    }

    #[tokio::test]
    async fn worker_sends_due_durable_campaigns() {
        let clock = ManualClock::at_millis(1_700_000_000_000);
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        let queue = JobQueue::new(store, QUEUE_NAME).with_clock(Arc::new(clock.clone()));
        let catalog = Arc::new(InMemoryCatalog::new([campaign(1, "welcome", TRIGGER_TRIAL_START, 0, 1)]));
        let dispatcher = DelayedDispatcher::with_queue(
            queue.clone(),
            catalog,
            Arc::new(InMemoryEventLog::new()),
            Arc::new(InMemoryTrials::new([42])),
        )
        .with_schedule(Arc::new(DurableSchedule::new(queue.clone())));
        let sender = Arc::new(RecordingSender::new());
        let worker = dispatcher.worker(sender.clone(), Duration::from_secs(5));

        dispatcher
            .handle_subscription_event(&SubscriptionEvent::new(42, SubscriptionEventType::TrialStart))
            .await
            .unwrap();
        assert_eq!(worker.tick().await, TickOutcome::Idle);

        clock.advance(Duration::from_secs(3600));
        let TickOutcome::Completed(id) = worker.tick().await else {
            panic!("expected the due campaign to be sent");
        };
        assert_eq!(sender.sent(), vec![(42, 1)]);
        assert_eq!(queue.job(&id).await.unwrap().unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn failed_sends_are_retried_then_dead_lettered() {
        let f = fixture();
        let sender = Arc::new(RecordingSender::new());
        sender.set_failing(true);
        let worker = f.dispatcher.worker(sender.clone(), Duration::from_secs(5));
        let mut retries = 0;

        f.dispatcher
            .queue_campaign_email(1, "nudge", Metadata::new())
            .await
            .unwrap();
        f.catalog.insert(campaign(9, "nudge", TRIGGER_CONVERSION, 0, 0));

        loop {
            match worker.tick().await {
                TickOutcome::Retried(_) => retries += 1,
                TickOutcome::DeadLettered(_) => break,
                other => panic!("unexpected tick outcome {other:?}"),
            }
        }
        assert_eq!(retries, 2);
        assert_eq!(f.dispatcher.stats().await.unwrap().dead_lettered, 1);
    }
}

//! Email campaign scheduling example.
//!
//! A renewal schedules a thank-you email one second later; the worker then
//! sends it through a sender that only logs. A trial start schedules the
//! trial campaigns, which the cleanup sweep drops once the trial ends.
//!
//! Run:
//!   cargo run -p stowage-demos --example campaigns

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use stowage::{BoxError, DurableSchedule, JobQueue};
use stowage_campaigns::{
    Campaign, DelayedDispatcher, EmailSender, SubscriptionEvent, SubscriptionEventType, UserId,
    dispatcher::QUEUE_NAME,
    memory::{InMemoryCatalog, InMemoryEventLog, InMemoryTrials},
    model::Metadata,
};
use stowage_memory::MemoryStore;

struct LogSender;

#[async_trait]
impl EmailSender for LogSender {
    async fn send_campaign_email(
        &self,
        user_id: UserId,
        campaign: &Campaign,
        context: &Metadata,
    ) -> Result<(), BoxError> {
        tracing::info!(user_id, campaign = %campaign.campaign_name, ?context, "sending email");
        Ok(())
    }
}

fn campaign(id: i64, name: &str, trigger: &str, delay_days: u32) -> Campaign {
    Campaign {
        id,
        campaign_name: name.to_owned(),
        trigger_event: trigger.to_owned(),
        delay_days,
        delay_hours: 0,
        is_active: true,
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter("info,stowage=debug,stowage_campaigns=debug")
        .init();

    let store = Arc::new(MemoryStore::new());
    let queue = JobQueue::new(store, QUEUE_NAME);
    let catalog = Arc::new(InMemoryCatalog::new([
        campaign(1, "welcome", "trial_start", 1),
        campaign(2, "last-chance", "trial_start", 13),
        campaign(3, "thanks", "subscription_renewed", 0),
    ]));
    let trials = Arc::new(InMemoryTrials::new([7]));
    let dispatcher = Arc::new(
        DelayedDispatcher::with_queue(
            queue.clone(),
            catalog,
            Arc::new(InMemoryEventLog::new()),
            trials.clone(),
        )
        .with_schedule(Arc::new(DurableSchedule::new(queue))),
    );

    dispatcher
        .start_worker(Arc::new(LogSender), Duration::from_millis(250))
        .await;

    dispatcher
        .handle_subscription_event(&SubscriptionEvent::new(
            7,
            SubscriptionEventType::SubscriptionRenewed,
        ))
        .await?;
    dispatcher
        .handle_subscription_event(&SubscriptionEvent::new(7, SubscriptionEventType::TrialStart))
        .await?;
    tracing::info!(stats = ?dispatcher.stats().await?, "scheduled");

    tokio::time::sleep(Duration::from_secs(2)).await;

    trials.end(7);
    let report = dispatcher.cleanup().await;
    tracing::info!(?report, stats = ?dispatcher.stats().await?, "after cleanup");

    dispatcher.close().await;
    Ok(())
}

use std::sync::Arc;

use async_trait::async_trait;
use stowage::{BoxError, Job, JobHandler};
use tracing::info;

use crate::{
    CampaignError,
    model::EmailJobData,
    ports::{CampaignCatalog, EmailSender},
};

/// Sends the emails a campaign job stands for.
///
/// A job with a `campaignId` sends that campaign, which must still be active.
/// Otherwise every active campaign of the job's `triggerEvent` is sent.
#[derive(Clone)]
pub struct CampaignEmailHandler {
    catalog: Arc<dyn CampaignCatalog>,
    sender: Arc<dyn EmailSender>,
}

impl CampaignEmailHandler {
    /// Handler reading campaigns from `catalog` and delivering through `sender`.
    pub fn new(catalog: Arc<dyn CampaignCatalog>, sender: Arc<dyn EmailSender>) -> Self {
        Self { catalog, sender }
    }

    /// Sends the emails for `job`.
    pub async fn process(&self, job: &Job) -> Result<usize, CampaignError> {
        let data: EmailJobData = serde_json::from_value(job.data.clone())?;

        let campaigns = match data.campaign_id {
            Some(id) => vec![
                self.catalog
                    .campaign(id)
                    .await
                    .map_err(CampaignError::Catalog)?
                    .ok_or(CampaignError::CampaignNotFound(id))?,
            ],
            None if !data.trigger_event.is_empty() => self
                .catalog
                .active_campaigns(&data.trigger_event)
                .await
                .map_err(CampaignError::Catalog)?,
            None => Vec::new(),
        };

        for campaign in &campaigns {
            self.sender
                .send_campaign_email(data.user_id, campaign, &data.context)
                .await
                .map_err(|source| CampaignError::Send {
                    campaign_id: campaign.id,
                    user_id: data.user_id,
                    source,
                })?;
        }

        info!(
            job_id = %job.id,
            user_id = data.user_id,
            trigger_event = %data.trigger_event,
            campaign_id = ?data.campaign_id,
            sent = campaigns.len(),
            "email campaign job processed"
        );
        Ok(campaigns.len())
    }
}

#[async_trait]
impl JobHandler for CampaignEmailHandler {
    async fn handle(&self, job: Job) -> Result<(), BoxError> {
        self.process(&job).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use stowage::{JobId, JobStatus};

    use super::*;
    use crate::{
        memory::{InMemoryCatalog, RecordingSender},
        model::{Campaign, TRIGGER_TRIAL_START},
    };

    fn campaign(id: i64, name: &str, trigger: &str, active: bool) -> Campaign {
        Campaign {
            id,
            campaign_name: name.to_owned(),
            trigger_event: trigger.to_owned(),
            delay_days: 0,
            delay_hours: 0,
            is_active: active,
        }
    }

    fn job(data: serde_json::Value) -> Job {
        Job {
            id: JobId::from("1700000000000-abcdefghi"),
            name: "trial-welcome".to_owned(),
            data,
            timestamp: 1_700_000_000_000,
            status: JobStatus::Processing,
            attempts: 1,
            max_attempts: 3,
            error: None,
        }
    }

    fn handler() -> (CampaignEmailHandler, Arc<RecordingSender>) {
        let catalog = Arc::new(InMemoryCatalog::new([
            campaign(1, "welcome", TRIGGER_TRIAL_START, true),
            campaign(2, "tips", TRIGGER_TRIAL_START, true),
            campaign(3, "retired", TRIGGER_TRIAL_START, false),
        ]));
        let sender = Arc::new(RecordingSender::new());
        (CampaignEmailHandler::new(catalog, sender.clone()), sender)
    }

    #[tokio::test]
    async fn sends_specific_campaign() {
        let (handler, sender) = handler();
        let sent = handler
            .process(&job(json!({ "userId": 7, "triggerEvent": "trial_start", "campaignId": 2 })))
            .await
            .unwrap();

        assert_eq!(sent, 1);
        assert_eq!(sender.sent(), vec![(7, 2)]);
    }

    #[tokio::test]
    async fn sends_every_active_campaign_of_trigger() {
        let (handler, sender) = handler();
        handler
            .process(&job(json!({ "userId": 7, "triggerEvent": "trial_start" })))
            .await
            .unwrap();

        assert_eq!(sender.sent(), vec![(7, 1), (7, 2)]);
    }

    #[tokio::test]
    async fn inactive_campaign_is_not_found() {
        let (handler, sender) = handler();
        let err = handler
            .process(&job(json!({ "userId": 7, "campaignId": 3 })))
            .await
            .unwrap_err();

        assert!(matches!(err, CampaignError::CampaignNotFound(3)));
        assert!(sender.sent().is_empty());
    }

    #[tokio::test]
    async fn send_failure_fails_the_job() {
        let (handler, sender) = handler();
        sender.set_failing(true);

        let result = JobHandler::handle(&handler, job(json!({ "userId": 7, "campaignId": 1 }))).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn payload_without_user_is_rejected() {
        let (handler, _) = handler();
        assert!(matches!(
            handler.process(&job(json!({ "triggerEvent": "trial_start" }))).await,
            Err(CampaignError::Payload(_))
        ));
    }
}

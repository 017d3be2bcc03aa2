//! Polling worker example.
//!
//! Enqueues a few jobs, one of which keeps failing, and lets a spawned
//! worker drain the queue.
//!
//! Run:
//!   cargo run -p stowage-demos --example worker

use std::{sync::Arc, time::Duration};

use serde_json::json;
use stowage::{BoxError, Job, JobOptions, JobQueue, PollingWorker};
use stowage_memory::MemoryStore;

async fn calculate_trust_score(job: Job) -> Result<(), BoxError> {
    tracing::info!(user_id = %job.data["userId"], "calculating trust score");
    Ok(())
}

async fn sync_social_data(job: Job) -> Result<(), BoxError> {
    if job.data["platform"] == "myspace" {
        return Err("platform no longer exists".into());
    }
    tracing::info!(platform = %job.data["platform"], "social data synced");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter("info,stowage=debug")
        .init();

    let store = Arc::new(MemoryStore::new());
    let queue = JobQueue::new(store, "default").with_max_attempts(2);

    queue
        .add("calculate-trust-score", &json!({ "userId": 1 }), JobOptions::default())
        .await?;
    queue
        .add("sync-social-data", &json!({ "platform": "github" }), JobOptions::default())
        .await?;
    queue
        .add("sync-social-data", &json!({ "platform": "myspace" }), JobOptions::default())
        .await?;
    queue
        .add("unknown-job", &json!({}), JobOptions::default())
        .await?;

    let handle = PollingWorker::builder(queue.clone())
        .handler("calculate-trust-score", calculate_trust_score)
        .handler("sync-social-data", sync_social_data)
        .poll_interval(Duration::from_millis(200))
        .build()
        .spawn();

    tokio::time::sleep(Duration::from_secs(2)).await;
    tracing::info!(status = ?handle.status().await, "worker status");

    for job in queue.failed_jobs(10).await? {
        tracing::warn!(job_id = %job.id, job_name = %job.name, error = ?job.error, "dead-lettered");
    }
    handle.shutdown().await;
    Ok(())
}

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use pretty_assertions::assert_eq;
use serde_json::json;
use stowage::{
    BoxError, CacheOptions, DurableSchedule, Job, JobOptions, PendingJob, PollingWorker, Schedule,
    Settings, SharedStore, Store, TickOutcome,
};
use stowage_core::ManualClock;
use stowage_memory::MemoryStore;

const SETTINGS: &str = r#"
cache:
  namespace: vauntico
  default_ttl: 1m
rate_limit:
  window: 1s
  max_requests: 3
queue:
  retention: 1h
  max_attempts: 2
"#;

#[tokio::test]
async fn components_built_from_settings_share_one_store() {
    let settings = Settings::from_yaml(SETTINGS).unwrap();
    let store: SharedStore = Arc::new(MemoryStore::new());

    let cache = settings.key_cache(store.clone());
    let limiter = settings.rate_limiter(store.clone());
    let queue = settings.job_queue(store.clone(), "trust-scores");

    cache.set("session:1", &json!({ "user": 1 }), CacheOptions::default()).await;
    limiter.can_make_request("10.0.0.1").await;
    queue.add("calculate-trust-score", &json!({ "userId": 1 }), JobOptions::default()).await.unwrap();

    let mut keys = store.keys("*").await.unwrap();
    keys.sort();
    assert_eq!(keys.len(), 4);
    assert!(keys.iter().any(|k| k == "vauntico:session:1"));
    assert!(keys.iter().any(|k| k.starts_with("ratelimit:10.0.0.1:")));
    assert!(keys.iter().any(|k| k == "queue:trust-scores:jobs"));

    // Clearing the cache namespace leaves the limiter and queue alone.
    assert_eq!(cache.clear("*").await, 1);
    assert_eq!(store.keys("*").await.unwrap().len(), 3);
}

#[tokio::test]
async fn durable_schedule_feeds_the_worker() {
    let clock = ManualClock::at_millis(1_700_000_000_000);
    let store: SharedStore = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
    let settings = Settings::from_yaml(SETTINGS).unwrap();
    let queue = settings
        .job_queue(store, "email-campaigns")
        .with_clock(Arc::new(clock.clone()));
    let schedule = Arc::new(DurableSchedule::new(queue.clone()));

    let total = Arc::new(AtomicU64::new(0));
    let seen = total.clone();
    let worker = PollingWorker::builder(queue.clone())
        .handler("renewal-*", move |job: Job| {
            let seen = seen.clone();
            async move {
                let user = job.data["userId"].as_u64().ok_or("missing userId")?;
                seen.fetch_add(user, Ordering::SeqCst);
                Ok::<(), BoxError>(())
            }
        })
        .schedule(schedule.clone())
        .build();

    for user in [1_u64, 2, 3] {
        schedule
            .schedule(
                &format!("renewal-{user}-thank-you"),
                Duration::from_secs(user),
                PendingJob::new("renewal-thank-you", json!({ "userId": user })),
            )
            .await
            .unwrap();
    }

    clock.advance(Duration::from_secs(2));
    let mut completed = 0;
    while let TickOutcome::Completed(_) = worker.tick().await {
        completed += 1;
    }
    assert_eq!(completed, 2);
    assert_eq!(total.load(Ordering::SeqCst), 3);
    assert_eq!(schedule.pending_keys().await.unwrap(), vec!["renewal-3-thank-you"]);
}

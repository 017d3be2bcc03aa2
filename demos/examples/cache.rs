//! Response cache and rate limiter example.
//!
//! Uses Upstash when `UPSTASH_REDIS_REST_URL` and `UPSTASH_REDIS_REST_TOKEN`
//! are set, an in-process store otherwise.
//!
//! Run:
//!   cargo run -p stowage-demos --example cache
//!
//! With Upstash:
//!   UPSTASH_REDIS_REST_URL=https://... UPSTASH_REDIS_REST_TOKEN=... \
//!     cargo run -p stowage-demos --example cache

use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use stowage::{CacheOptions, Settings, SharedStore, check_store};
use stowage_memory::MemoryStore;

#[derive(Debug, Serialize, Deserialize)]
struct CreatorProfile {
    handle: String,
    followers: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter("info,stowage=debug")
        .init();

    let settings = Settings::from_env()?;
    let store: SharedStore = if settings.store.url.is_some() {
        settings.store.clone().into_store()?
    } else {
        tracing::info!("no store configured, using the in-process store");
        Arc::new(MemoryStore::new())
    };

    let report = check_store(&*store).await;
    tracing::info!(healthy = report.healthy, latency = ?report.latency, "store health");

    let cache = settings.key_cache(store.clone());
    let profile = CreatorProfile {
        handle: "ada".to_owned(),
        followers: 1_024,
    };
    cache
        .set("profile:ada", &profile, CacheOptions::ttl(Duration::from_secs(30)))
        .await;
    let cached: Option<CreatorProfile> = cache.get("profile:ada").await;
    tracing::info!(?cached, "read back");
    tracing::info!(deleted = cache.clear("profile:*").await, "cleared profiles");

    let limiter = settings.rate_limiter(store);
    for attempt in 1..=5 {
        let decision = limiter.check("demo-client").await;
        tracing::info!(
            attempt,
            allowed = decision.allowed,
            remaining = decision.remaining,
            reset_after = ?decision.reset_after,
            "rate limit decision"
        );
    }
    Ok(())
}

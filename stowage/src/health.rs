//! Store health check.

use std::time::{Duration, Instant};

use serde::Serialize;
use stowage_core::Store;
use tracing::{error, info};

/// Outcome of [`check_store`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    /// Name of the checked store.
    pub store: String,
    /// Whether the store answered `PONG`.
    pub healthy: bool,
    /// Round trip of the PING, when it returned.
    #[serde(with = "humantime_serde")]
    pub latency: Option<Duration>,
    /// Failure description when unhealthy.
    pub error: Option<String>,
}

/// Sends a PING to `store` and measures the round trip.
pub async fn check_store<S>(store: &S) -> HealthReport
where
    S: Store + ?Sized,
{
    let start = Instant::now();
    match store.ping().await {
        Ok(reply) => {
            let latency = start.elapsed();
            let healthy = reply.eq_ignore_ascii_case("PONG");
            if healthy {
                info!(store = store.name(), ping_latency_ms = latency.as_millis() as u64, "store health check passed");
            } else {
                error!(store = store.name(), reply = %reply, "store health check got unexpected reply");
            }
            HealthReport {
                store: store.name().to_owned(),
                healthy,
                latency: Some(latency),
                error: (!healthy).then(|| format!("unexpected PING reply: {reply}")),
            }
        }
        Err(err) => {
            error!(store = store.name(), error = %err, "store health check failed");
            HealthReport {
                store: store.name().to_owned(),
                healthy: false,
                latency: None,
                error: Some(err.to_string()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use stowage_memory::{FailingStore, MemoryStore};

    use super::*;
    use crate::SharedStore;

    #[tokio::test]
    async fn healthy_store_reports_latency() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let report = check_store(&*store).await;

        assert!(report.healthy);
        assert_eq!(report.store, "memory");
        assert!(report.latency.is_some());
        assert_eq!(report.error, None);
    }

    #[tokio::test]
    async fn unreachable_store_is_unhealthy() {
        let report = check_store(&FailingStore).await;

        assert!(!report.healthy);
        assert_eq!(report.latency, None);
        assert!(report.error.unwrap().contains("simulated outage"));
    }
}

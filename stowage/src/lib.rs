//! Namespaced cache client and minimal polling job queue on top of a
//! Redis-like [`Store`].
//!
//! The building blocks:
//!
//! - [`KeyCache`]: JSON values under `<namespace>:<key>` with a TTL. The cache
//!   is advisory, so backend failures never reach the caller.
//! - [`JobQueue`]: hash-backed job envelopes and a FIFO list of ids, with an
//!   attempt budget and a dead-letter list.
//! - [`RateLimiter`]: fixed-window counters that fail open.
//! - [`Schedule`]: delayed enqueue, either with in-process timers
//!   ([`TimerTable`]) or persisted in a sorted set ([`DurableSchedule`]).
//! - [`PollingWorker`]: pops jobs on an interval and dispatches them to
//!   registered [`JobHandler`]s.
//!
//! Every component takes the store as an injected [`SharedStore`], so tests
//! run against `stowage_memory::MemoryStore` and production against Upstash or
//! Redis.
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod cache;
pub mod config;
pub mod error;
pub mod health;
pub mod metrics;
pub mod queue;
pub mod rate_limit;
pub mod schedule;
pub mod worker;

use std::sync::Arc;

pub use stowage_core::{Clock, DeleteStatus, SharedClock, Store, StoreError, SystemClock, Ttl};

#[cfg(any(test, feature = "test-helpers"))]
pub use stowage_core::ManualClock;

pub use cache::{CacheOptions, KeyCache};
pub use config::{ConfigError, Settings};
pub use error::{BoxError, CacheError, QueueError};
pub use health::{HealthReport, check_store};
pub use queue::{FailOutcome, Job, JobId, JobOptions, JobQueue, JobStatus};
pub use rate_limit::{RateLimitDecision, RateLimiter};
pub use schedule::{DurableSchedule, PendingJob, Schedule, TimerTable};
pub use worker::{
    HandlerRegistry, JobHandler, PollingWorker, TickOutcome, WorkerHandle, WorkerStatus,
};

/// Store handle shared by every component.
pub type SharedStore = Arc<dyn Store>;

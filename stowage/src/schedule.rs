//! Delayed enqueue of jobs keyed by a logical name.
//!
//! A schedule holds at most one pending entry per logical key (for example
//! `trial-42-welcome`). Scheduling a key again replaces the pending entry, so
//! the last write wins and only one job is enqueued.
//!
//! Two implementations:
//!
//! - [`TimerTable`] keeps a tokio timer per key in process memory. Pending
//!   entries are lost when the process exits.
//! - [`DurableSchedule`] keeps fire times in a sorted set and pending jobs in
//!   hashes, and enqueues due entries when [`Schedule::poll_due`] runs.

use std::{
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use smol_str::SmolStr;
use stowage_core::Store;
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::{
    JobOptions, JobQueue, SharedStore,
    error::QueueError,
    metrics::record_scheduled_timers,
};

/// Job to enqueue when a schedule entry fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingJob {
    /// Job name.
    pub name: String,
    /// JSON payload.
    pub data: Value,
    /// Options passed to [`JobQueue::add`].
    #[serde(default)]
    pub options: JobOptions,
}

impl PendingJob {
    /// Pending job with default options.
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            data,
            options: JobOptions::default(),
        }
    }
}

/// Keyed delayed dispatch into a [`JobQueue`].
#[async_trait]
pub trait Schedule: Send + Sync {
    /// Enqueues `job` after `delay`, replacing any pending entry for `key`.
    async fn schedule(&self, key: &str, delay: Duration, job: PendingJob) -> Result<(), QueueError>;

    /// Drops the pending entry for `key`. Returns whether one existed.
    async fn cancel(&self, key: &str) -> Result<bool, QueueError>;

    /// Keys with a pending entry.
    async fn pending_keys(&self) -> Result<Vec<String>, QueueError>;

    /// Number of pending entries.
    async fn len(&self) -> Result<usize, QueueError> {
        Ok(self.pending_keys().await?.len())
    }

    /// Enqueues entries whose fire time has passed and returns how many.
    ///
    /// Timer based schedules fire on their own and return `0`.
    async fn poll_due(&self) -> Result<usize, QueueError>;

    /// Stops the schedule. Later calls to [`schedule`](Self::schedule) fail
    /// with [`QueueError::Closed`].
    async fn shutdown(&self);
}

#[async_trait]
impl<S> Schedule for Arc<S>
where
    S: Schedule + ?Sized,
{
    async fn schedule(&self, key: &str, delay: Duration, job: PendingJob) -> Result<(), QueueError> {
        (**self).schedule(key, delay, job).await
    }

    async fn cancel(&self, key: &str) -> Result<bool, QueueError> {
        (**self).cancel(key).await
    }

    async fn pending_keys(&self) -> Result<Vec<String>, QueueError> {
        (**self).pending_keys().await
    }

    async fn len(&self) -> Result<usize, QueueError> {
        (**self).len().await
    }

    async fn poll_due(&self) -> Result<usize, QueueError> {
        (**self).poll_due().await
    }

    async fn shutdown(&self) {
        (**self).shutdown().await
    }
}

#[derive(Debug)]
struct Timer {
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Debug)]
struct TimerTableInner {
    queue: JobQueue,
    timers: DashMap<SmolStr, Timer>,
    generation: AtomicU64,
    closed: AtomicBool,
}

impl TimerTableInner {
    async fn fire(&self, key: &SmolStr, generation: u64, job: PendingJob) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        // A replaced or cancelled timer must not enqueue.
        if self
            .timers
            .remove_if(key, |_, timer| timer.generation == generation)
            .is_none()
        {
            debug!(key = %key, "timer superseded before firing");
            return;
        }
        record_scheduled_timers(self.queue.name(), self.timers.len());
        if let Err(err) = self.queue.add(&job.name, &job.data, job.options).await {
            error!(key = %key, job_name = %job.name, error = %err, "failed to enqueue scheduled job");
        }
    }
}

/// In-process schedule backed by tokio timers.
///
/// Each pending key owns a spawned task that sleeps for the delay, removes its
/// own table entry and enqueues the job. Enqueue failures are logged and not
/// retried.
///
/// Cloning is cheap and clones share the same table.
#[derive(Clone, Debug)]
pub struct TimerTable {
    inner: Arc<TimerTableInner>,
}

impl TimerTable {
    /// Creates an empty table enqueueing into `queue`.
    pub fn new(queue: JobQueue) -> Self {
        Self {
            inner: Arc::new(TimerTableInner {
                queue,
                timers: DashMap::new(),
                generation: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Whether `key` has a pending timer.
    pub fn is_pending(&self, key: &str) -> bool {
        self.inner.timers.contains_key(key)
    }

    /// Number of pending timers.
    pub fn pending_count(&self) -> usize {
        self.inner.timers.len()
    }

    /// Whether [`shutdown`](Schedule::shutdown) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Aborts every pending timer, keeping the table open.
    pub fn cancel_all(&self) {
        self.inner.timers.retain(|_, timer| {
            timer.handle.abort();
            false
        });
        record_scheduled_timers(self.inner.queue.name(), 0);
    }
}

#[async_trait]
impl Schedule for TimerTable {
    async fn schedule(&self, key: &str, delay: Duration, job: PendingJob) -> Result<(), QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }
        let key = SmolStr::new(key);
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let inner: Weak<TimerTableInner> = Arc::downgrade(&self.inner);
        let (armed_tx, armed_rx) = oneshot::channel::<()>();

        let span = info_span!(
            "scheduled_job",
            key = %key,
            job_name = %job.name,
            delay_ms = delay.as_millis() as u64,
        );
        let task_key = key.clone();
        let handle = tokio::spawn(
            async move {
                // Wait until the timer is registered so it can find its entry.
                if armed_rx.await.is_err() {
                    return;
                }
                tokio::time::sleep(delay).await;
                if let Some(inner) = inner.upgrade() {
                    inner.fire(&task_key, generation, job).await;
                }
            }
            .instrument(span),
        );

        if let Some(previous) = self
            .inner
            .timers
            .insert(key.clone(), Timer { generation, handle })
        {
            previous.handle.abort();
            debug!(key = %key, "replaced pending timer");
        }
        // Shutdown may have raced with the insert.
        if self.is_closed() {
            self.cancel_all();
            return Err(QueueError::Closed);
        }
        let _ = armed_tx.send(());

        record_scheduled_timers(self.inner.queue.name(), self.inner.timers.len());
        info!(key = %key, delay_ms = delay.as_millis() as u64, "job scheduled");
        Ok(())
    }

    async fn cancel(&self, key: &str) -> Result<bool, QueueError> {
        let removed = self.inner.timers.remove(key);
        if let Some((_, timer)) = &removed {
            timer.handle.abort();
            record_scheduled_timers(self.inner.queue.name(), self.inner.timers.len());
            debug!(key, "scheduled job cancelled");
        }
        Ok(removed.is_some())
    }

    async fn pending_keys(&self) -> Result<Vec<String>, QueueError> {
        Ok(self
            .inner
            .timers
            .iter()
            .map(|entry| entry.key().to_string())
            .collect())
    }

    async fn len(&self) -> Result<usize, QueueError> {
        Ok(self.pending_count())
    }

    async fn poll_due(&self) -> Result<usize, QueueError> {
        Ok(0)
    }

    async fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let pending = self.pending_count();
        self.cancel_all();
        info!(queue = self.inner.queue.name(), pending, "timer table shut down");
    }
}

/// Claim batch used by [`DurableSchedule::poll_due`].
pub const DEFAULT_CLAIM_BATCH: usize = 100;

/// Schedule persisted in the store.
///
/// Fire times live in the sorted set `queue:<q>:scheduled` (member = logical
/// key, score = fire time in epoch milliseconds) and pending jobs in hashes
/// `queue:<q>:scheduled:<key>`. An entry is claimed by removing its member
/// from the sorted set; only the caller whose removal succeeded enqueues it,
/// so several pollers can share one schedule.
pub struct DurableSchedule {
    queue: JobQueue,
    batch: usize,
    closed: AtomicBool,
}

impl fmt::Debug for DurableSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DurableSchedule")
            .field("queue", &self.queue)
            .field("batch", &self.batch)
            .field("closed", &self.closed)
            .finish()
    }
}

impl DurableSchedule {
    /// Creates a schedule enqueueing into `queue`, sharing its store and clock.
    pub fn new(queue: JobQueue) -> Self {
        Self {
            queue,
            batch: DEFAULT_CLAIM_BATCH,
            closed: AtomicBool::new(false),
        }
    }

    /// Maximum number of entries claimed per [`poll_due`](Schedule::poll_due).
    pub fn with_batch(mut self, batch: usize) -> Self {
        self.batch = batch.max(1);
        self
    }

    fn store(&self) -> &SharedStore {
        self.queue.store()
    }

    /// Key of the sorted set of fire times.
    pub fn index_key(&self) -> String {
        format!("{}scheduled", self.queue.key_prefix())
    }

    /// Key of the hash holding the pending job of `key`.
    pub fn entry_key(&self, key: &str) -> String {
        format!("{}scheduled:{}", self.queue.key_prefix(), key)
    }

    async fn claim(&self, key: &str) -> Result<bool, QueueError> {
        if !self.store().zrem(&self.index_key(), key).await? {
            debug!(key, "scheduled entry claimed elsewhere");
            return Ok(false);
        }
        let entry_key = self.entry_key(key);
        let fields = self.store().hgetall(&entry_key).await?;
        self.store().del(std::slice::from_ref(&entry_key)).await?;

        let job = fields
            .get("job")
            .map(|raw| serde_json::from_str::<PendingJob>(raw));
        match job {
            Some(Ok(job)) => {
                if let Err(err) = self.queue.add(&job.name, &job.data, job.options).await {
                    error!(key, job_name = %job.name, error = %err, "failed to enqueue scheduled job");
                    return Ok(false);
                }
                Ok(true)
            }
            Some(Err(err)) => {
                warn!(key, error = %err, "dropping undecodable scheduled entry");
                Ok(false)
            }
            None => {
                warn!(key, "dropping scheduled entry without job");
                Ok(false)
            }
        }
    }
}

#[async_trait]
impl Schedule for DurableSchedule {
    async fn schedule(&self, key: &str, delay: Duration, job: PendingJob) -> Result<(), QueueError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }
        let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
        let fire_at = self.queue.clock().now_millis().saturating_add(delay_ms);
        let payload = serde_json::to_string(&job)?;
        // Hash first, so a claimed member always finds its job.
        self.store()
            .hset(&self.entry_key(key), &[("job", payload.as_str())])
            .await?;
        self.store()
            .zadd(&self.index_key(), fire_at as f64, key)
            .await?;
        info!(key, fire_at, job_name = %job.name, "job scheduled");
        Ok(())
    }

    async fn cancel(&self, key: &str) -> Result<bool, QueueError> {
        let removed = self.store().zrem(&self.index_key(), key).await?;
        self.store()
            .del(std::slice::from_ref(&self.entry_key(key)))
            .await?;
        if removed {
            debug!(key, "scheduled job cancelled");
        }
        Ok(removed)
    }

    async fn pending_keys(&self) -> Result<Vec<String>, QueueError> {
        Ok(self
            .store()
            .zrangebyscore(&self.index_key(), f64::NEG_INFINITY, f64::INFINITY, None)
            .await?)
    }

    async fn poll_due(&self) -> Result<usize, QueueError> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(0);
        }
        let now = self.queue.clock().now_millis() as f64;
        let due = self
            .store()
            .zrangebyscore(&self.index_key(), f64::NEG_INFINITY, now, Some(self.batch))
            .await?;
        let mut enqueued = 0;
        for key in due {
            if self.claim(&key).await? {
                enqueued += 1;
            }
        }
        if enqueued > 0 {
            debug!(queue = self.queue.name(), enqueued, "due scheduled jobs enqueued");
        }
        Ok(enqueued)
    }

    async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        info!(queue = self.queue.name(), "durable schedule shut down");
    }
}

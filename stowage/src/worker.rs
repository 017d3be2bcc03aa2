//! Polling worker and handler registry.

use std::{
    collections::HashMap,
    fmt,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicI64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::{sync::watch, task::JoinHandle, time::MissedTickBehavior};
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::{BoxError, FailOutcome, Job, JobId, JobQueue, Schedule};

/// Poll interval used when none is configured.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Error recorded when no handler matches a job.
pub const NO_HANDLER: &str = "no handler registered";

/// Processes one job.
///
/// Implemented for async closures `Fn(Job) -> Future<Output = Result<(), BoxError>>`.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Handles `job`. An error counts as a failed attempt.
    async fn handle(&self, job: Job) -> Result<(), BoxError>;
}

#[async_trait]
impl<F, Fut> JobHandler for F
where
    F: Fn(Job) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), BoxError>> + Send,
{
    async fn handle(&self, job: Job) -> Result<(), BoxError> {
        (self)(job).await
    }
}

/// Maps job names to handlers.
///
/// Patterns are matched in this order:
/// 1. exact name (`win-back-email`)
/// 2. prefix patterns ending in `-*` or `.*` (`trial-*`), longest prefix first
/// 3. the catch-all `*`
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    exact: HashMap<String, Arc<dyn JobHandler>>,
    prefixes: Vec<(String, Arc<dyn JobHandler>)>,
    fallback: Option<Arc<dyn JobHandler>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("exact", &self.exact.keys().collect::<Vec<_>>())
            .field(
                "prefixes",
                &self.prefixes.iter().map(|(p, _)| p).collect::<Vec<_>>(),
            )
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

impl HandlerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `pattern`, replacing an earlier registration.
    pub fn register<H>(&mut self, pattern: impl Into<String>, handler: H) -> &mut Self
    where
        H: JobHandler + 'static,
    {
        let pattern = pattern.into();
        let handler: Arc<dyn JobHandler> = Arc::new(handler);
        if pattern == "*" {
            self.fallback = Some(handler);
        } else if pattern.ends_with("-*") || pattern.ends_with(".*") {
            let prefix = pattern[..pattern.len() - 1].to_owned();
            self.prefixes.retain(|(existing, _)| *existing != prefix);
            self.prefixes.push((prefix, handler));
            self.prefixes
                .sort_by(|(a, _), (b, _)| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        } else {
            self.exact.insert(pattern, handler);
        }
        self
    }

    fn lookup(&self, name: &str) -> Option<Arc<dyn JobHandler>> {
        self.exact.get(name).cloned().or_else(|| {
            self.prefixes
                .iter()
                .find(|(prefix, _)| name.starts_with(prefix.as_str()))
                .map(|(_, handler)| handler.clone())
        })
    }

    /// Handler for `job`: by name, then by `data.triggerEvent`, then `*`.
    pub fn resolve(&self, job: &Job) -> Option<Arc<dyn JobHandler>> {
        self.lookup(&job.name)
            .or_else(|| job.trigger_event().and_then(|event| self.lookup(event)))
            .or_else(|| self.fallback.clone())
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.prefixes.is_empty() && self.fallback.is_none()
    }
}

/// Result of one [`PollingWorker::tick`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Another tick was still running.
    Busy,
    /// No job was waiting.
    Idle,
    /// The handler succeeded.
    Completed(JobId),
    /// The handler failed and the job was requeued.
    Retried(JobId),
    /// The job was dead-lettered.
    DeadLettered(JobId),
    /// The handler ran but its outcome could not be written to the store.
    Unrecorded(JobId),
}

struct ProcessingGuard<'a>(&'a AtomicBool);

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

const NEVER_POLLED: i64 = i64::MIN;

/// Polls a [`JobQueue`] on an interval and dispatches jobs to handlers.
///
/// Each tick first lets an attached durable [`Schedule`] enqueue due
/// entries, then takes at most one job. Ticks never overlap: a tick that
/// starts while another one is running returns [`TickOutcome::Busy`].
pub struct PollingWorker {
    queue: JobQueue,
    registry: HandlerRegistry,
    schedule: Option<Arc<dyn Schedule>>,
    poll_interval: Duration,
    processing: AtomicBool,
    last_poll: Arc<AtomicI64>,
}

impl fmt::Debug for PollingWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollingWorker")
            .field("queue", &self.queue)
            .field("registry", &self.registry)
            .field("schedule", &self.schedule.is_some())
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl PollingWorker {
    /// Starts building a worker for `queue`.
    pub fn builder(queue: JobQueue) -> PollingWorkerBuilder {
        PollingWorkerBuilder {
            queue,
            registry: HandlerRegistry::new(),
            schedule: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Queue the worker consumes.
    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Interval between ticks once spawned.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Whether a tick is in progress.
    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::Acquire)
    }

    /// Time the last tick started.
    pub fn last_poll(&self) -> Option<DateTime<Utc>> {
        last_poll_time(&self.last_poll)
    }

    /// Runs one poll: claim due schedule entries, take one job, dispatch it.
    pub async fn tick(&self) -> TickOutcome {
        if self.processing.swap(true, Ordering::AcqRel) {
            debug!(queue = self.queue.name(), "previous tick still running");
            return TickOutcome::Busy;
        }
        let _guard = ProcessingGuard(&self.processing);
        self.last_poll
            .store(self.queue.clock().now_millis(), Ordering::Release);

        if let Some(schedule) = &self.schedule {
            if let Err(err) = schedule.poll_due().await {
                warn!(queue = self.queue.name(), error = %err, "failed to poll due scheduled jobs");
            }
        }

        let Some(job) = self.queue.next_job().await else {
            return TickOutcome::Idle;
        };
        let id = job.id.clone();

        let Some(handler) = self.registry.resolve(&job) else {
            warn!(queue = self.queue.name(), job_id = %id, job_name = %job.name, "no handler for job");
            return match self.queue.dead_letter(&job, NO_HANDLER).await {
                Ok(()) => TickOutcome::DeadLettered(id),
                Err(_) => TickOutcome::Unrecorded(id),
            };
        };

        let span = info_span!("job", job_id = %id, job_name = %job.name, attempt = job.attempts);
        let result = AssertUnwindSafe(handler.handle(job.clone()))
            .catch_unwind()
            .instrument(span)
            .await;
        let failure = match result {
            Ok(Ok(())) => {
                self.queue.complete_job(&id).await;
                info!(queue = self.queue.name(), job_id = %id, "job processed successfully");
                return TickOutcome::Completed(id);
            }
            Ok(Err(err)) => err.to_string(),
            Err(_) => "job handler panicked".to_owned(),
        };

        error!(
            queue = self.queue.name(),
            job_id = %id,
            job_name = %job.name,
            error = %failure,
            "failed to process job"
        );
        match self.queue.fail_job(&job, &failure).await {
            Ok(FailOutcome::Retried { .. }) => TickOutcome::Retried(id),
            Ok(FailOutcome::DeadLettered) => TickOutcome::DeadLettered(id),
            Err(_) => TickOutcome::Unrecorded(id),
        }
    }

    /// Runs ticks every poll interval on the current runtime until shut down.
    ///
    /// The first tick happens one interval after spawning.
    pub fn spawn(self) -> WorkerHandle {
        let worker = Arc::new(self);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let running = Arc::new(AtomicBool::new(true));
        let queue = worker.queue.clone();
        let last_poll = worker.last_poll.clone();

        let task_running = running.clone();
        let span = info_span!("polling_worker", queue = worker.queue.name());
        let task = tokio::spawn(
            async move {
                info!(
                    poll_interval_ms = worker.poll_interval.as_millis() as u64,
                    "starting job worker"
                );
                let mut interval = tokio::time::interval_at(
                    tokio::time::Instant::now() + worker.poll_interval,
                    worker.poll_interval,
                );
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            worker.tick().await;
                        }
                        _ = shutdown_rx.changed() => break,
                    }
                }
                task_running.store(false, Ordering::Release);
                info!("stopped job worker");
            }
            .instrument(span),
        );

        WorkerHandle {
            shutdown: shutdown_tx,
            task,
            queue,
            running,
            last_poll,
        }
    }
}

fn last_poll_time(last_poll: &AtomicI64) -> Option<DateTime<Utc>> {
    match last_poll.load(Ordering::Acquire) {
        NEVER_POLLED => None,
        millis => DateTime::from_timestamp_millis(millis),
    }
}

/// Builder for [`PollingWorker`].
pub struct PollingWorkerBuilder {
    queue: JobQueue,
    registry: HandlerRegistry,
    schedule: Option<Arc<dyn Schedule>>,
    poll_interval: Duration,
}

impl PollingWorkerBuilder {
    /// Registers a handler, see [`HandlerRegistry`] for pattern rules.
    pub fn handler<H>(mut self, pattern: impl Into<String>, handler: H) -> Self
    where
        H: JobHandler + 'static,
    {
        self.registry.register(pattern, handler);
        self
    }

    /// Replaces the whole registry.
    pub fn registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Attaches a schedule polled at the start of every tick.
    pub fn schedule(mut self, schedule: Arc<dyn Schedule>) -> Self {
        self.schedule = Some(schedule);
        self
    }

    /// Interval between ticks.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Builds the worker.
    pub fn build(self) -> PollingWorker {
        PollingWorker {
            queue: self.queue,
            registry: self.registry,
            schedule: self.schedule,
            poll_interval: self.poll_interval,
            processing: AtomicBool::new(false),
            last_poll: Arc::new(AtomicI64::new(NEVER_POLLED)),
        }
    }
}

/// Health snapshot of a spawned worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStatus {
    /// Whether the queue length could be read.
    pub healthy: bool,
    /// Whether the poll loop is running.
    pub running: bool,
    /// Waiting jobs (0 when unhealthy).
    pub queue_length: u64,
    /// Start of the last tick.
    pub last_poll: Option<DateTime<Utc>>,
}

/// Handle to control a spawned [`PollingWorker`].
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    queue: JobQueue,
    running: Arc<AtomicBool>,
    last_poll: Arc<AtomicI64>,
}

impl WorkerHandle {
    /// Whether the poll loop is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Current health of the worker and its queue.
    pub async fn status(&self) -> WorkerStatus {
        let (healthy, queue_length) = match self.queue.len().await {
            Ok(len) => (true, len),
            Err(err) => {
                warn!(queue = self.queue.name(), error = %err, "failed to read queue length");
                (false, 0)
            }
        };
        WorkerStatus {
            healthy,
            running: self.is_running(),
            queue_length,
            last_poll: last_poll_time(&self.last_poll),
        }
    }

    /// Stops the poll loop after the current tick and waits for it.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.task.await {
            if err.is_panic() {
                error!(queue = self.queue.name(), "job worker panicked");
            }
        }
    }
}

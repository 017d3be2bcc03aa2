//! Hash-backed job queue.
//!
//! Layout for a queue named `q`:
//!
//! | key | type | content |
//! |---|---|---|
//! | `queue:q:<id>` | hash | job envelope |
//! | `queue:q:jobs` | list | waiting ids, pushed at the head, popped at the tail |
//! | `queue:q:failed` | list | dead-lettered ids |
//!
//! Envelopes outlive the list entry: once a job is completed or
//! dead-lettered its hash gets a retention TTL (24h by default).

use std::{collections::HashMap, fmt, str::FromStr, sync::Arc, time::Duration};

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use smol_str::SmolStr;
use stowage_core::{SharedClock, Store, SystemClock, Ttl};
use tracing::{debug, error, warn};

use crate::{
    SharedStore,
    error::QueueError,
    metrics::{JobEvent, record_job},
};

/// Retention of finished envelopes.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(86_400);
/// Number of times a job is handed to a consumer before it is dead-lettered.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const ID_SUFFIX_LEN: usize = 9;

/// Job identifier: `<epoch-ms>-<9 random base36 chars>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(SmolStr);

impl JobId {
    /// Generates a fresh id for a job enqueued at `now_millis`.
    pub fn generate(now_millis: i64) -> Self {
        let mut rng = rand::thread_rng();
        let suffix: String = (0..ID_SUFFIX_LEN)
            .map(|_| char::from(ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())]))
            .collect();
        Self(SmolStr::new(format!("{now_millis}-{suffix}")))
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self(SmolStr::new(id))
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        Self(SmolStr::new(id))
    }
}

/// Lifecycle state of a job envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// In the job list, waiting for a consumer.
    Waiting,
    /// Handed to a consumer.
    Processing,
    /// Finished successfully.
    Completed,
    /// Attempt budget exhausted, dead-lettered.
    Failed,
}

impl JobStatus {
    /// Wire representation stored in the envelope.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "waiting" => Ok(Self::Waiting),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown job status `{other}`")),
        }
    }
}

/// Per-job options for [`JobQueue::add`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Overrides the queue's attempt budget for this job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

impl JobOptions {
    /// Options with an explicit attempt budget.
    pub fn max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts),
        }
    }
}

/// Parsed job envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    /// Identifier assigned at enqueue.
    pub id: JobId,
    /// Logical job type used for handler dispatch.
    pub name: String,
    /// JSON payload.
    pub data: Value,
    /// Enqueue time, epoch milliseconds.
    pub timestamp: i64,
    /// Lifecycle state.
    pub status: JobStatus,
    /// Number of times the job was handed to a consumer.
    pub attempts: u32,
    /// Attempt budget.
    pub max_attempts: u32,
    /// Last handler error.
    pub error: Option<String>,
}

impl Job {
    fn from_fields(mut fields: HashMap<String, String>) -> Result<Self, String> {
        let mut take = |field: &str| {
            fields
                .remove(field)
                .ok_or_else(|| format!("missing field `{field}`"))
        };
        let id = JobId::from(take("id")?);
        let name = take("name")?;
        let data = serde_json::from_str(&take("data")?).map_err(|err| err.to_string())?;
        let timestamp = take("timestamp")?
            .parse()
            .map_err(|err| format!("invalid timestamp: {err}"))?;
        let status = take("status")?.parse()?;
        let attempts = take("attempts")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0);
        let max_attempts = take("max_attempts")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(DEFAULT_MAX_ATTEMPTS);
        let error = take("error").ok().filter(|error| !error.is_empty());
        Ok(Self {
            id,
            name,
            data,
            timestamp,
            status,
            attempts,
            max_attempts,
            error,
        })
    }

    /// The `triggerEvent` field of the payload, if present.
    pub fn trigger_event(&self) -> Option<&str> {
        self.data.get("triggerEvent").and_then(Value::as_str)
    }
}

/// Result of [`JobQueue::fail_job`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// The job went back to the head of the job list.
    Retried {
        /// Attempts used so far.
        attempts: u32,
    },
    /// The attempt budget is exhausted and the job is on the dead-letter list.
    DeadLettered,
}

/// Minimal FIFO job queue.
///
/// Producers [`add`](Self::add) jobs, consumers poll with
/// [`next_job`](Self::next_job) and acknowledge with
/// [`complete_job`](Self::complete_job) or [`fail_job`](Self::fail_job).
/// `next_job` and `complete_job` log store failures instead of returning them.
#[derive(Clone)]
pub struct JobQueue {
    store: SharedStore,
    name: SmolStr,
    clock: SharedClock,
    retention: Duration,
    max_attempts: u32,
}

impl fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobQueue")
            .field("store", &self.store.name())
            .field("name", &self.name)
            .field("retention", &self.retention)
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

impl JobQueue {
    /// Creates a queue named `name` with default retention and attempt budget.
    pub fn new(store: SharedStore, name: impl Into<SmolStr>) -> Self {
        Self {
            store,
            name: name.into(),
            clock: Arc::new(SystemClock),
            retention: DEFAULT_RETENTION,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Replaces the clock used for ids and timestamps.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the retention of finished envelopes.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Replaces the default attempt budget. Values below 1 are raised to 1.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Queue name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Store the queue lives in.
    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Clock used for ids and timestamps.
    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Retention of finished envelopes.
    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Prefix shared by every key of the queue (`queue:<name>:`).
    pub fn key_prefix(&self) -> String {
        format!("queue:{}:", self.name)
    }

    /// Key of the waiting list.
    pub fn jobs_key(&self) -> String {
        format!("queue:{}:jobs", self.name)
    }

    /// Key of the dead-letter list.
    pub fn failed_key(&self) -> String {
        format!("queue:{}:failed", self.name)
    }

    /// Key of the envelope of `id`.
    pub fn job_key(&self, id: &JobId) -> String {
        format!("queue:{}:{}", self.name, id)
    }

    /// Whether `key` names an envelope of this queue (not a list or schedule key).
    pub fn is_envelope_key(&self, key: &str) -> bool {
        key.strip_prefix(&self.key_prefix()).is_some_and(|rest| {
            !rest.is_empty()
                && !rest.contains(':')
                && !matches!(rest, "jobs" | "failed" | "scheduled")
        })
    }

    /// Adds a job and returns its id.
    ///
    /// Writes the envelope first, then pushes the id onto the head of the
    /// job list. Failures are logged and returned.
    pub async fn add<T: Serialize + ?Sized>(
        &self,
        name: &str,
        data: &T,
        options: JobOptions,
    ) -> Result<JobId, QueueError> {
        let result = self.try_add(name, data, options).await;
        match &result {
            Ok(id) => {
                debug!(queue = %self.name, job_id = %id, job_name = name, "job queued");
                record_job(&self.name, JobEvent::Enqueued);
            }
            Err(err) => {
                error!(queue = %self.name, job_name = name, error = %err, "failed to queue job");
            }
        }
        result
    }

    async fn try_add<T: Serialize + ?Sized>(
        &self,
        name: &str,
        data: &T,
        options: JobOptions,
    ) -> Result<JobId, QueueError> {
        let data = serde_json::to_string(data)?;
        let now = self.clock.now_millis();
        let id = JobId::generate(now);
        let timestamp = now.to_string();
        let max_attempts = options
            .max_attempts
            .unwrap_or(self.max_attempts)
            .max(1)
            .to_string();
        self.store
            .hset(
                &self.job_key(&id),
                &[
                    ("id", id.as_str()),
                    ("name", name),
                    ("data", data.as_str()),
                    ("timestamp", timestamp.as_str()),
                    ("status", JobStatus::Waiting.as_str()),
                    ("attempts", "0"),
                    ("max_attempts", max_attempts.as_str()),
                ],
            )
            .await?;
        self.store.lpush(&self.jobs_key(), id.as_str()).await?;
        Ok(id)
    }

    /// Pops the oldest waiting job and marks it `processing`.
    ///
    /// Returns `None` when the queue is empty, when the popped id has no
    /// readable envelope and on store failures (logged).
    pub async fn next_job(&self) -> Option<Job> {
        match self.try_next_job().await {
            Ok(job) => job,
            Err(err) => {
                error!(queue = %self.name, error = %err, "failed to get next job");
                None
            }
        }
    }

    async fn try_next_job(&self) -> Result<Option<Job>, QueueError> {
        let Some(id) = self.store.rpop(&self.jobs_key()).await? else {
            return Ok(None);
        };
        let id = JobId::from(id);
        let Some(mut job) = self.job(&id).await? else {
            warn!(queue = %self.name, job_id = %id, "popped job has no envelope");
            return Ok(None);
        };
        job.status = JobStatus::Processing;
        job.attempts += 1;
        let attempts = job.attempts.to_string();
        self.store
            .hset(
                &self.job_key(&id),
                &[
                    ("status", JobStatus::Processing.as_str()),
                    ("attempts", attempts.as_str()),
                ],
            )
            .await?;
        Ok(Some(job))
    }

    /// Reads one envelope. Missing or corrupt envelopes read as `None`.
    pub async fn job(&self, id: &JobId) -> Result<Option<Job>, QueueError> {
        let fields = self.store.hgetall(&self.job_key(id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        match Job::from_fields(fields) {
            Ok(job) => Ok(Some(job)),
            Err(reason) => {
                warn!(queue = %self.name, job_id = %id, reason = %reason, "corrupt job envelope");
                Ok(None)
            }
        }
    }

    /// Marks a job `completed` and starts its retention period.
    ///
    /// Unknown ids are ignored. Failures are logged, never returned.
    pub async fn complete_job(&self, id: &JobId) {
        let key = self.job_key(id);
        let result = async {
            if self.store.ttl(&key).await? == Ttl::Missing {
                debug!(queue = %self.name, job_id = %id, "complete for unknown job ignored");
                return Ok(false);
            }
            self.store
                .hset(&key, &[("status", JobStatus::Completed.as_str())])
                .await?;
            self.store.expire(&key, self.retention).await?;
            Ok::<_, QueueError>(true)
        }
        .await;
        match result {
            Ok(true) => {
                debug!(queue = %self.name, job_id = %id, "job completed");
                record_job(&self.name, JobEvent::Completed);
            }
            Ok(false) => {}
            Err(err) => {
                error!(queue = %self.name, job_id = %id, error = %err, "failed to complete job");
            }
        }
    }

    /// Records a failed attempt.
    ///
    /// While `attempts < max_attempts` the job goes back to `waiting` at the
    /// head of the job list. Otherwise it is marked `failed`, pushed onto the
    /// dead-letter list and given the retention TTL.
    pub async fn fail_job(&self, job: &Job, error: &str) -> Result<FailOutcome, QueueError> {
        record_job(&self.name, JobEvent::Failed);
        if job.attempts < job.max_attempts {
            let result = self.requeue(job, error).await;
            match &result {
                Ok(()) => warn!(
                    queue = %self.name,
                    job_id = %job.id,
                    attempts = job.attempts,
                    max_attempts = job.max_attempts,
                    error,
                    "job failed, retrying"
                ),
                Err(err) => {
                    error!(queue = %self.name, job_id = %job.id, error = %err, "failed to requeue job")
                }
            }
            result.map(|()| FailOutcome::Retried {
                attempts: job.attempts,
            })
        } else {
            self.dead_letter(job, error)
                .await
                .map(|()| FailOutcome::DeadLettered)
        }
    }

    async fn requeue(&self, job: &Job, error: &str) -> Result<(), QueueError> {
        self.store
            .hset(
                &self.job_key(&job.id),
                &[("status", JobStatus::Waiting.as_str()), ("error", error)],
            )
            .await?;
        self.store.lpush(&self.jobs_key(), job.id.as_str()).await?;
        Ok(())
    }

    /// Moves a job to the dead-letter list regardless of its attempt budget.
    pub async fn dead_letter(&self, job: &Job, error: &str) -> Result<(), QueueError> {
        let key = self.job_key(&job.id);
        let result = async {
            self.store
                .hset(&key, &[("status", JobStatus::Failed.as_str()), ("error", error)])
                .await?;
            self.store.lpush(&self.failed_key(), job.id.as_str()).await?;
            self.store.expire(&key, self.retention).await?;
            Ok::<_, QueueError>(())
        }
        .await;
        match &result {
            Ok(()) => {
                error!(
                    queue = %self.name,
                    job_id = %job.id,
                    job_name = %job.name,
                    attempts = job.attempts,
                    error,
                    "job dead-lettered"
                );
                record_job(&self.name, JobEvent::DeadLettered);
            }
            Err(err) => {
                error!(queue = %self.name, job_id = %job.id, error = %err, "failed to dead-letter job");
            }
        }
        result
    }

    /// Number of waiting jobs.
    pub async fn len(&self) -> Result<u64, QueueError> {
        Ok(self.store.llen(&self.jobs_key()).await?)
    }

    /// Whether no job is waiting.
    pub async fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len().await? == 0)
    }

    /// Number of dead-lettered jobs.
    pub async fn failed_len(&self) -> Result<u64, QueueError> {
        Ok(self.store.llen(&self.failed_key()).await?)
    }

    /// Most recently dead-lettered jobs, newest first.
    ///
    /// Ids whose envelope already expired are skipped.
    pub async fn failed_jobs(&self, limit: usize) -> Result<Vec<Job>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let stop = i64::try_from(limit).unwrap_or(i64::MAX) - 1;
        let ids = self.store.lrange(&self.failed_key(), 0, stop).await?;
        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = self.job(&JobId::from(id)).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    /// Keys of every envelope record of this queue.
    pub async fn envelope_keys(&self) -> Result<Vec<String>, QueueError> {
        let keys = self.store.keys(&format!("{}*", self.key_prefix())).await?;
        Ok(keys
            .into_iter()
            .filter(|key| self.is_envelope_key(key))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use stowage_core::ManualClock;
    use stowage_memory::{FailingStore, MemoryStore};

    use super::*;

    fn queue() -> (JobQueue, Arc<MemoryStore>, ManualClock) {
        let clock = ManualClock::at_millis(1_700_000_000_000);
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        let queue = JobQueue::new(store.clone(), "email").with_clock(Arc::new(clock.clone()));
        (queue, store, clock)
    }

    #[test]
    fn generated_ids_have_timestamp_and_base36_suffix() {
        let id = JobId::generate(1_700_000_000_123);
        let (millis, suffix) = id.as_str().split_once('-').unwrap();
        assert_eq!(millis, "1700000000123");
        assert_eq!(suffix.len(), 9);
        assert!(suffix.bytes().all(|b| ID_ALPHABET.contains(&b)));
        assert_ne!(JobId::generate(1), JobId::generate(1));
    }

    #[tokio::test]
    async fn jobs_come_out_in_insertion_order() {
        let (queue, _, _) = queue();
        let mut added = Vec::new();
        for n in 0..5 {
            added.push(queue.add("send", &json!({ "n": n }), JobOptions::default()).await.unwrap());
        }
        assert_eq!(queue.len().await.unwrap(), 5);

        for (n, id) in added.iter().enumerate() {
            let job = queue.next_job().await.unwrap();
            assert_eq!(&job.id, id);
            assert_eq!(job.data, json!({ "n": n }));
            assert_eq!(job.status, JobStatus::Processing);
            assert_eq!(job.attempts, 1);
        }
        assert!(queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn empty_queue_yields_none_repeatedly() {
        let (queue, _, _) = queue();
        for _ in 0..3 {
            assert_eq!(queue.next_job().await, None);
        }
    }

    #[tokio::test]
    async fn envelope_records_lifecycle() {
        let (queue, store, _) = queue();
        let id = queue
            .add("win-back-email", &json!({ "userId": 42 }), JobOptions::default())
            .await
            .unwrap();

        let waiting = queue.job(&id).await.unwrap().unwrap();
        assert_eq!(waiting.status, JobStatus::Waiting);
        assert_eq!(waiting.name, "win-back-email");
        assert_eq!(waiting.timestamp, 1_700_000_000_000);
        assert_eq!(waiting.max_attempts, DEFAULT_MAX_ATTEMPTS);

        let job = queue.next_job().await.unwrap();
        queue.complete_job(&job.id).await;

        let done = queue.job(&id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(
            store.ttl(&queue.job_key(&id)).await.unwrap(),
            Ttl::Expires(DEFAULT_RETENTION)
        );
    }

    #[tokio::test]
    async fn completing_unknown_job_is_a_noop() {
        let (queue, store, _) = queue();
        queue.complete_job(&JobId::from("1-doesnotexist")).await;
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn finished_envelope_expires_after_retention() {
        let (queue, store, clock) = queue();
        queue.add("x", &json!({}), JobOptions::default()).await.unwrap();
        let job = queue.next_job().await.unwrap();
        queue.complete_job(&job.id).await;

        clock.advance(DEFAULT_RETENTION);
        assert!(!store.contains_key(&queue.job_key(&job.id)));
    }

    #[tokio::test]
    async fn failed_job_is_retried_then_dead_lettered() {
        let (queue, store, _) = queue();
        let id = queue
            .add("flaky", &json!({}), JobOptions::max_attempts(2))
            .await
            .unwrap();

        let first = queue.next_job().await.unwrap();
        assert_eq!(
            queue.fail_job(&first, "smtp timeout").await.unwrap(),
            FailOutcome::Retried { attempts: 1 }
        );
        let retried = queue.job(&id).await.unwrap().unwrap();
        assert_eq!(retried.status, JobStatus::Waiting);
        assert_eq!(retried.error.as_deref(), Some("smtp timeout"));

        let second = queue.next_job().await.unwrap();
        assert_eq!(second.attempts, 2);
        assert_eq!(
            queue.fail_job(&second, "smtp down").await.unwrap(),
            FailOutcome::DeadLettered
        );

        assert_eq!(queue.next_job().await, None);
        assert_eq!(queue.failed_len().await.unwrap(), 1);
        let failed = queue.failed_jobs(10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].status, JobStatus::Failed);
        assert_eq!(failed[0].error.as_deref(), Some("smtp down"));
        assert!(matches!(
            store.ttl(&queue.job_key(&id)).await.unwrap(),
            Ttl::Expires(_)
        ));
    }

    #[tokio::test]
    async fn missing_or_corrupt_envelope_yields_none() {
        let (queue, store, _) = queue();
        store.lpush(&queue.jobs_key(), "1-orphaned").await.unwrap();
        assert_eq!(queue.next_job().await, None);

        store
            .hset("queue:email:1-corrupt", &[("id", "1-corrupt"), ("data", "{")])
            .await
            .unwrap();
        store.lpush(&queue.jobs_key(), "1-corrupt").await.unwrap();
        assert_eq!(queue.next_job().await, None);
    }

    #[tokio::test]
    async fn envelope_keys_skip_lists_and_schedule() {
        let (queue, store, _) = queue();
        let id = queue.add("x", &json!({}), JobOptions::default()).await.unwrap();
        store.lpush(&queue.failed_key(), "gone").await.unwrap();
        store.zadd("queue:email:scheduled", 1.0, "trial-1-a").await.unwrap();
        store
            .hset("queue:email:scheduled:trial-1-a", &[("job", "{}")])
            .await
            .unwrap();
        store.lpush("queue:other:jobs", "x").await.unwrap();

        assert_eq!(queue.envelope_keys().await.unwrap(), vec![queue.job_key(&id)]);
    }

    #[tokio::test]
    async fn add_propagates_store_failure() {
        let queue = JobQueue::new(Arc::new(FailingStore), "email");
        assert!(matches!(
            queue.add("x", &json!({}), JobOptions::default()).await,
            Err(QueueError::Store(_))
        ));
        assert_eq!(queue.next_job().await, None);
        queue.complete_job(&JobId::from("1-x")).await;
    }
}

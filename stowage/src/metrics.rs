//! Metrics declaration and recording helpers.
//!
//! With the `metrics` feature disabled every helper is an empty inline
//! function and is eliminated by the compiler.

#[cfg(feature = "metrics")]
use lazy_static::lazy_static;

#[cfg(feature = "metrics")]
lazy_static! {
    // Cache metrics

    /// Track number of cache hit events.
    pub static ref CACHE_HIT_COUNTER: &'static str = {
        metrics::describe_counter!(
            "stowage_cache_hit_total",
            "Total number of cache hit events."
        );
        "stowage_cache_hit_total"
    };
    /// Track number of cache miss events.
    pub static ref CACHE_MISS_COUNTER: &'static str = {
        metrics::describe_counter!(
            "stowage_cache_miss_total",
            "Total number of cache miss events."
        );
        "stowage_cache_miss_total"
    };

    // Queue metrics

    /// Track number of jobs enqueued.
    pub static ref JOBS_ENQUEUED: &'static str = {
        metrics::describe_counter!(
            "stowage_jobs_enqueued_total",
            "Total number of jobs added to a queue."
        );
        "stowage_jobs_enqueued_total"
    };
    /// Track number of jobs completed.
    pub static ref JOBS_COMPLETED: &'static str = {
        metrics::describe_counter!(
            "stowage_jobs_completed_total",
            "Total number of jobs marked completed."
        );
        "stowage_jobs_completed_total"
    };
    /// Track number of failed handler attempts.
    pub static ref JOBS_FAILED: &'static str = {
        metrics::describe_counter!(
            "stowage_jobs_failed_total",
            "Total number of failed job attempts."
        );
        "stowage_jobs_failed_total"
    };
    /// Track number of jobs moved to the dead-letter list.
    pub static ref JOBS_DEAD_LETTERED: &'static str = {
        metrics::describe_counter!(
            "stowage_jobs_dead_lettered_total",
            "Total number of jobs moved to the dead-letter list."
        );
        "stowage_jobs_dead_lettered_total"
    };

    // Rate limiter metrics

    /// Track number of denied requests.
    pub static ref RATE_LIMIT_DENIED: &'static str = {
        metrics::describe_counter!(
            "stowage_rate_limit_denied_total",
            "Total number of requests denied by the rate limiter."
        );
        "stowage_rate_limit_denied_total"
    };

    // Schedule metrics

    /// Gauge of pending in-process timers.
    pub static ref SCHEDULED_TIMERS: &'static str = {
        metrics::describe_gauge!(
            "stowage_scheduled_timers",
            "Number of pending in-process timers."
        );
        "stowage_scheduled_timers"
    };
}

/// Records a cache lookup result for `namespace`.
#[cfg(feature = "metrics")]
#[inline]
pub fn record_cache_lookup(namespace: &str, hit: bool) {
    let counter = if hit {
        *CACHE_HIT_COUNTER
    } else {
        *CACHE_MISS_COUNTER
    };
    metrics::counter!(counter, "namespace" => namespace.to_owned()).increment(1);
}

/// No-op version when metrics feature is disabled.
#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_cache_lookup(_namespace: &str, _hit: bool) {}

/// Job lifecycle events counted per queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEvent {
    /// A job was added.
    Enqueued,
    /// A job was completed.
    Completed,
    /// A handler attempt failed.
    Failed,
    /// A job was dead-lettered.
    DeadLettered,
}

/// Records a job lifecycle event for `queue`.
#[cfg(feature = "metrics")]
#[inline]
pub fn record_job(queue: &str, event: JobEvent) {
    let counter = match event {
        JobEvent::Enqueued => *JOBS_ENQUEUED,
        JobEvent::Completed => *JOBS_COMPLETED,
        JobEvent::Failed => *JOBS_FAILED,
        JobEvent::DeadLettered => *JOBS_DEAD_LETTERED,
    };
    metrics::counter!(counter, "queue" => queue.to_owned()).increment(1);
}

/// No-op version when metrics feature is disabled.
#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_job(_queue: &str, _event: JobEvent) {}

/// Records a denied rate-limited request.
#[cfg(feature = "metrics")]
#[inline]
pub fn record_rate_limit_denied() {
    metrics::counter!(*RATE_LIMIT_DENIED).increment(1);
}

/// No-op version when metrics feature is disabled.
#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_rate_limit_denied() {}

/// Publishes the number of pending timers for `queue`.
#[cfg(feature = "metrics")]
#[inline]
pub fn record_scheduled_timers(queue: &str, pending: usize) {
    metrics::gauge!(*SCHEDULED_TIMERS, "queue" => queue.to_owned()).set(pending as f64);
}

/// No-op version when metrics feature is disabled.
#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_scheduled_timers(_queue: &str, _pending: usize) {}

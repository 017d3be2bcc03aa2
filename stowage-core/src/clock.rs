//! Wall-clock abstraction.
//!
//! Job ids, rate-limit windows, TTL bookkeeping of the in-memory store and the
//! durable schedule all read the time through [`Clock`], so tests can move it.

use std::{fmt::Debug, sync::Arc};

use chrono::{DateTime, Utc};

/// Source of the current time.
pub trait Clock: Send + Sync + Debug {
    /// Current time.
    fn now(&self) -> DateTime<Utc>;

    /// Current time as milliseconds since the Unix epoch.
    fn now_millis(&self) -> i64 {
        self.now().timestamp_millis()
    }
}

/// Shared clock handle passed to components.
pub type SharedClock = Arc<dyn Clock>;

/// Clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(any(test, feature = "test-helpers"))]
pub use manual::ManualClock;

#[cfg(any(test, feature = "test-helpers"))]
mod manual {
    use std::sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    };
    use std::time::Duration;

    use chrono::{DateTime, Utc};

    use super::Clock;

    /// Clock that only moves when told to.
    ///
    /// Clones share the same time.
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        millis: Arc<AtomicI64>,
    }

    impl ManualClock {
        /// Creates a clock frozen at `start`.
        pub fn new(start: DateTime<Utc>) -> Self {
            Self {
                millis: Arc::new(AtomicI64::new(start.timestamp_millis())),
            }
        }

        /// Creates a clock frozen at the given epoch milliseconds.
        pub fn at_millis(millis: i64) -> Self {
            Self {
                millis: Arc::new(AtomicI64::new(millis)),
            }
        }

        /// Moves the clock forward.
        pub fn advance(&self, by: Duration) {
            let delta = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
            self.millis.fetch_add(delta, Ordering::SeqCst);
        }

        /// Jumps to the given time.
        pub fn set(&self, to: DateTime<Utc>) {
            self.millis.store(to.timestamp_millis(), Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            DateTime::from_timestamp_millis(self.millis.load(Ordering::SeqCst)).unwrap_or_default()
        }

        fn now_millis(&self) -> i64 {
            self.millis.load(Ordering::SeqCst)
        }
    }
}

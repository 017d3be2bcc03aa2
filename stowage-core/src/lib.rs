//! Traits and types shared by every stowage store.
//!
//! A store is the remote (or in-process) key-value service the cache, job
//! queue and rate limiter are built on. If you want to plug in another
//! backing service, implement [`Store`] for it.
#![warn(missing_docs)]

mod clock;
mod error;
mod store;

pub use clock::{Clock, SharedClock, SystemClock};
#[cfg(any(test, feature = "test-helpers"))]
pub use clock::ManualClock;
pub use error::StoreError;
pub use store::{DeleteStatus, Store, StoreResult, Ttl};

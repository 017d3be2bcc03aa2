//! In-process [`Store`](stowage_core::Store) implementation.
//!
//! [`MemoryStore`] keeps strings, lists, hashes and sorted sets in a
//! concurrent map with per-key expiry. It is the fake the test suites inject
//! in place of the remote cache, and a reasonable store for single-process
//! deployments that do not need durability.
#![warn(missing_docs)]

mod pattern;
mod store;

#[cfg(feature = "test-helpers")]
mod failing;

#[cfg(feature = "test-helpers")]
pub use failing::FailingStore;
pub use pattern::KeyPattern;
pub use store::MemoryStore;

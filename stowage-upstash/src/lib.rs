//! [`Store`](stowage_core::Store) implementation for the Upstash Redis REST API.
//!
//! Upstash exposes Redis over HTTPS: a command is a JSON array posted to the
//! database URL with a bearer token, and the reply is `{"result": ...}` or
//! `{"error": "..."}`. [`UpstashStore`] speaks that protocol with a bounded
//! per-call timeout and a single retry for transient failures.
#![warn(missing_docs)]

mod error;
mod store;

pub use error::Error;
pub use store::{UpstashStore, UpstashStoreBuilder};

//! [`Store`](stowage_core::Store) implementation speaking the native Redis
//! protocol through the [`redis`] crate.
//!
//! Use it when the cache is reachable over TCP. For Upstash over HTTPS use
//! `stowage-upstash` instead.
#![warn(missing_docs)]

pub mod error;
pub mod store;

#[doc(inline)]
pub use crate::error::Error;
#[doc(inline)]
pub use crate::store::{RedisStore, RedisStoreBuilder};

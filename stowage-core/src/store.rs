use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::StoreError;

/// Result alias used by every [`Store`] operation.
pub type StoreResult<T> = Result<T, StoreError>;

/// Status of deleting result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteStatus {
    /// Records successfully deleted.
    Deleted(u32),
    /// Records already missing.
    Missing,
}

impl DeleteStatus {
    /// Builds a status from the count a `DEL` command reports.
    pub fn from_count(count: u64) -> Self {
        match count {
            0 => Self::Missing,
            n => Self::Deleted(u32::try_from(n).unwrap_or(u32::MAX)),
        }
    }

    /// Number of removed keys.
    pub fn count(&self) -> u32 {
        match self {
            Self::Deleted(n) => *n,
            Self::Missing => 0,
        }
    }
}

/// Remaining lifetime of a key, as reported by `TTL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    /// The key does not exist.
    Missing,
    /// The key exists and never expires.
    Persistent,
    /// The key expires after the given duration.
    Expires(Duration),
}

impl Ttl {
    /// Decodes the integer reply of a Redis `TTL` command.
    ///
    /// `-2` means missing, `-1` means no expiry, anything else is seconds.
    pub fn from_seconds(raw: i64) -> Self {
        match raw {
            -2 => Self::Missing,
            n if n < 0 => Self::Persistent,
            n => Self::Expires(Duration::from_secs(n.unsigned_abs())),
        }
    }
}

/// Backing key-value protocol.
///
/// The command set is the subset of Redis semantics the cache, queue, rate
/// limiter and schedule need: strings with TTL, lists pushed at the head and
/// popped at the tail, hashes, sorted sets and pattern key listing.
#[async_trait]
pub trait Store: Send + Sync {
    /// Round-trip check, returns the server reply (`PONG`).
    async fn ping(&self) -> StoreResult<String>;

    /// Reads a string value.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Writes a string value that expires after `ttl`.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;

    /// Removes the given keys.
    async fn del(&self, keys: &[String]) -> StoreResult<DeleteStatus>;

    /// Lists keys matching a glob-style `pattern`.
    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>>;

    /// Sets a timeout on `key`, returns whether the key exists.
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    /// Remaining lifetime of `key`.
    async fn ttl(&self, key: &str) -> StoreResult<Ttl>;

    /// Length of the list at `key` (0 if missing).
    async fn llen(&self, key: &str) -> StoreResult<u64>;

    /// Pushes `value` onto the head of the list, returns the new length.
    async fn lpush(&self, key: &str, value: &str) -> StoreResult<u64>;

    /// Pops a value from the tail of the list.
    async fn rpop(&self, key: &str) -> StoreResult<Option<String>>;

    /// Reads the list range `start..=stop` (negative indices count from the tail).
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<String>>;

    /// Sets hash fields, returns the number of fields that were added.
    async fn hset(&self, key: &str, fields: &[(&str, &str)]) -> StoreResult<u64>;

    /// Reads every field of a hash (empty if missing).
    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>>;

    /// Adds or rescores `member`, returns `true` if it was added.
    async fn zadd(&self, key: &str, score: f64, member: &str) -> StoreResult<bool>;

    /// Removes `member`, returns `true` if it was present.
    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool>;

    /// Members with `min <= score <= max`, lowest score first.
    async fn zrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
    ) -> StoreResult<Vec<String>>;

    /// Returns the name of this store for logs and health reports.
    fn name(&self) -> &str {
        "store"
    }
}

#[async_trait]
impl<S> Store for Arc<S>
where
    S: Store + ?Sized,
{
    async fn ping(&self) -> StoreResult<String> {
        (**self).ping().await
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        (**self).get(key).await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        (**self).set_ex(key, value, ttl).await
    }

    async fn del(&self, keys: &[String]) -> StoreResult<DeleteStatus> {
        (**self).del(keys).await
    }

    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        (**self).keys(pattern).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        (**self).expire(key, ttl).await
    }

    async fn ttl(&self, key: &str) -> StoreResult<Ttl> {
        (**self).ttl(key).await
    }

    async fn llen(&self, key: &str) -> StoreResult<u64> {
        (**self).llen(key).await
    }

    async fn lpush(&self, key: &str, value: &str) -> StoreResult<u64> {
        (**self).lpush(key, value).await
    }

    async fn rpop(&self, key: &str) -> StoreResult<Option<String>> {
        (**self).rpop(key).await
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<String>> {
        (**self).lrange(key, start, stop).await
    }

    async fn hset(&self, key: &str, fields: &[(&str, &str)]) -> StoreResult<u64> {
        (**self).hset(key, fields).await
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        (**self).hgetall(key).await
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> StoreResult<bool> {
        (**self).zadd(key, score, member).await
    }

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool> {
        (**self).zrem(key, member).await
    }

    async fn zrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
    ) -> StoreResult<Vec<String>> {
        (**self).zrangebyscore(key, min, max, limit).await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

use std::{collections::HashMap, io, time::Duration};

use async_trait::async_trait;
use stowage_core::{DeleteStatus, Store, StoreError, StoreResult, Ttl};

/// Store whose every call fails with a connection error.
///
/// Used to check that callers degrade gracefully when the cache is down.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailingStore;

impl FailingStore {
    fn outage<T>() -> StoreResult<T> {
        Err(StoreError::Connection(Box::new(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "simulated outage",
        ))))
    }
}

#[async_trait]
impl Store for FailingStore {
    async fn ping(&self) -> StoreResult<String> {
        Self::outage()
    }

    async fn get(&self, _key: &str) -> StoreResult<Option<String>> {
        Self::outage()
    }

    async fn set_ex(&self, _key: &str, _value: &str, _ttl: Duration) -> StoreResult<()> {
        Self::outage()
    }

    async fn del(&self, _keys: &[String]) -> StoreResult<DeleteStatus> {
        Self::outage()
    }

    async fn keys(&self, _pattern: &str) -> StoreResult<Vec<String>> {
        Self::outage()
    }

    async fn expire(&self, _key: &str, _ttl: Duration) -> StoreResult<bool> {
        Self::outage()
    }

    async fn ttl(&self, _key: &str) -> StoreResult<Ttl> {
        Self::outage()
    }

    async fn llen(&self, _key: &str) -> StoreResult<u64> {
        Self::outage()
    }

    async fn lpush(&self, _key: &str, _value: &str) -> StoreResult<u64> {
        Self::outage()
    }

    async fn rpop(&self, _key: &str) -> StoreResult<Option<String>> {
        Self::outage()
    }

    async fn lrange(&self, _key: &str, _start: i64, _stop: i64) -> StoreResult<Vec<String>> {
        Self::outage()
    }

    async fn hset(&self, _key: &str, _fields: &[(&str, &str)]) -> StoreResult<u64> {
        Self::outage()
    }

    async fn hgetall(&self, _key: &str) -> StoreResult<HashMap<String, String>> {
        Self::outage()
    }

    async fn zadd(&self, _key: &str, _score: f64, _member: &str) -> StoreResult<bool> {
        Self::outage()
    }

    async fn zrem(&self, _key: &str, _member: &str) -> StoreResult<bool> {
        Self::outage()
    }

    async fn zrangebyscore(
        &self,
        _key: &str,
        _min: f64,
        _max: f64,
        _limit: Option<usize>,
    ) -> StoreResult<Vec<String>> {
        Self::outage()
    }

    fn name(&self) -> &str {
        "failing"
    }
}

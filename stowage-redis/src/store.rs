//! Redis store implementation.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use redis::{Client, Cmd, FromRedisValue, aio::ConnectionManager};
use stowage_core::{DeleteStatus, Store, StoreError, StoreResult, Ttl};
use tokio::sync::OnceCell;
use tracing::{trace, warn};

use crate::error::Error;

/// Redis store based on the redis-rs crate.
///
/// It uses a [`ConnectionManager`] for asynchronous network interaction. The
/// connection is created on first use and reconnects on its own afterwards.
///
/// [`ConnectionManager`]: redis::aio::ConnectionManager
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    connection: OnceCell<ConnectionManager>,
    timeout: Duration,
    retry_backoff: Duration,
}

impl RedisStore {
    /// Creates a store for a local Redis with default settings.
    pub fn new() -> Result<Self, Error> {
        Self::builder().build()
    }

    /// Creates new RedisStore builder with default settings.
    #[must_use]
    pub fn builder() -> RedisStoreBuilder {
        RedisStoreBuilder::default()
    }

    /// Create lazy connection to redis via [`ConnectionManager`]
    pub async fn connection(&self) -> Result<&ConnectionManager, Error> {
        trace!("Get connection manager");
        let manager = self
            .connection
            .get_or_try_init(|| {
                trace!("Initialize new redis connection manager");
                self.client.get_connection_manager()
            })
            .await?;
        Ok(manager)
    }

    async fn attempt<T: FromRedisValue>(&self, cmd: &Cmd) -> Result<T, Error> {
        let call = async {
            let mut con = self.connection().await?.clone();
            Ok::<T, Error>(cmd.query_async(&mut con).await?)
        };
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| Error::Timeout(self.timeout))?
    }

    /// Runs a command, retrying once if the first attempt fails transiently.
    pub async fn query<T: FromRedisValue>(&self, cmd: Cmd) -> Result<T, Error> {
        match self.attempt(&cmd).await {
            Err(err) if err.is_transient() => {
                warn!(error = %err, "redis command failed, retrying once");
                tokio::time::sleep(self.retry_backoff).await;
                self.attempt(&cmd).await
            }
            result => result,
        }
    }

    async fn run<T: FromRedisValue>(&self, cmd: Cmd) -> StoreResult<T> {
        self.query(cmd).await.map_err(StoreError::from)
    }
}

fn score_arg(score: f64) -> String {
    if score == f64::INFINITY {
        "+inf".to_owned()
    } else if score == f64::NEG_INFINITY {
        "-inf".to_owned()
    } else {
        score.to_string()
    }
}

fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl Store for RedisStore {
    async fn ping(&self) -> StoreResult<String> {
        self.run(redis::cmd("PING")).await
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.run(redis::cmd("GET").arg(key).clone()).await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        self.run(
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("PX")
                .arg(millis(ttl))
                .clone(),
        )
        .await
    }

    async fn del(&self, keys: &[String]) -> StoreResult<DeleteStatus> {
        if keys.is_empty() {
            return Ok(DeleteStatus::Missing);
        }
        let removed: u64 = self.run(redis::cmd("DEL").arg(keys).clone()).await?;
        Ok(DeleteStatus::from_count(removed))
    }

    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        self.run(redis::cmd("KEYS").arg(pattern).clone()).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        self.run(redis::cmd("PEXPIRE").arg(key).arg(millis(ttl)).clone())
            .await
    }

    async fn ttl(&self, key: &str) -> StoreResult<Ttl> {
        let raw: i64 = self.run(redis::cmd("TTL").arg(key).clone()).await?;
        Ok(Ttl::from_seconds(raw))
    }

    async fn llen(&self, key: &str) -> StoreResult<u64> {
        self.run(redis::cmd("LLEN").arg(key).clone()).await
    }

    async fn lpush(&self, key: &str, value: &str) -> StoreResult<u64> {
        self.run(redis::cmd("LPUSH").arg(key).arg(value).clone())
            .await
    }

    async fn rpop(&self, key: &str) -> StoreResult<Option<String>> {
        self.run(redis::cmd("RPOP").arg(key).clone()).await
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<String>> {
        self.run(redis::cmd("LRANGE").arg(key).arg(start).arg(stop).clone())
            .await
    }

    async fn hset(&self, key: &str, fields: &[(&str, &str)]) -> StoreResult<u64> {
        if fields.is_empty() {
            return Ok(0);
        }
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key);
        for (field, value) in fields {
            cmd.arg(*field).arg(*value);
        }
        self.run(cmd).await
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        self.run(redis::cmd("HGETALL").arg(key).clone()).await
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> StoreResult<bool> {
        let added: u64 = self
            .run(
                redis::cmd("ZADD")
                    .arg(key)
                    .arg(score_arg(score))
                    .arg(member)
                    .clone(),
            )
            .await?;
        Ok(added == 1)
    }

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool> {
        let removed: u64 = self
            .run(redis::cmd("ZREM").arg(key).arg(member).clone())
            .await?;
        Ok(removed == 1)
    }

    async fn zrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
    ) -> StoreResult<Vec<String>> {
        let mut cmd = redis::cmd("ZRANGEBYSCORE");
        cmd.arg(key).arg(score_arg(min)).arg(score_arg(max));
        if let Some(limit) = limit {
            cmd.arg("LIMIT").arg(0).arg(limit);
        }
        self.run(cmd).await
    }

    fn name(&self) -> &str {
        "redis"
    }
}

/// Part of builder pattern implementation for RedisStore.
pub struct RedisStoreBuilder {
    connection_info: String,
    timeout: Duration,
    retry_backoff: Duration,
}

impl Default for RedisStoreBuilder {
    fn default() -> Self {
        Self {
            connection_info: "redis://127.0.0.1/".to_owned(),
            timeout: Duration::from_secs(5),
            retry_backoff: Duration::from_millis(100),
        }
    }
}

impl RedisStoreBuilder {
    /// Set connection info (host, port, database, etc.) for RedisStore.
    pub fn server(mut self, connection_info: impl Into<String>) -> Self {
        self.connection_info = connection_info.into();
        self
    }

    /// Upper bound for a single command.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Pause before the single retry of a transient failure.
    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Create new instance of Redis store with passed settings.
    pub fn build(self) -> Result<RedisStore, Error> {
        Ok(RedisStore {
            client: Client::open(self.connection_info)?,
            connection: OnceCell::new(),
            timeout: self.timeout,
            retry_backoff: self.retry_backoff,
        })
    }
}

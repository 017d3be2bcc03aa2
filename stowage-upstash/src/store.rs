//! Upstash REST store implementation.

use std::{collections::HashMap, fmt, time::Duration};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use stowage_core::{DeleteStatus, Store, StoreResult, Ttl};
use tracing::{debug, trace, warn};

use crate::error::Error;

/// Store backed by the Upstash Redis REST API.
///
/// Each command is sent as a JSON array (`["SET", "key", "value"]`) in the
/// body of a `POST` to the database URL, authenticated with a bearer token.
/// Calls are bounded by a timeout and retried once after a short backoff
/// when they fail for a transient reason.
///
/// ```no_run
/// use stowage_upstash::UpstashStore;
///
/// let store = UpstashStore::builder()
///     .url("https://eu1-example.upstash.io")
///     .token("secret")
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct UpstashStore {
    client: reqwest::Client,
    url: String,
    token: String,
    timeout: Duration,
    retry_backoff: Duration,
}

impl fmt::Debug for UpstashStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstashStore")
            .field("url", &self.url)
            .field("timeout", &self.timeout)
            .field("retry_backoff", &self.retry_backoff)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct Reply {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<String>,
}

impl UpstashStore {
    /// Creates a builder with the default timeout (5s) and retry backoff (100ms).
    #[must_use]
    pub fn builder() -> UpstashStoreBuilder {
        UpstashStoreBuilder::default()
    }

    /// Sends a command, retrying once if the first attempt fails transiently.
    pub async fn command<I, A>(&self, args: I) -> Result<Value, Error>
    where
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        let command = args.first().map(String::as_str).unwrap_or_default();
        match self.attempt(&args).await {
            Err(err) if err.is_transient() => {
                warn!(command, error = %err, "upstash call failed, retrying once");
                tokio::time::sleep(self.retry_backoff).await;
                self.attempt(&args).await
            }
            result => result,
        }
    }

    async fn attempt(&self, args: &[String]) -> Result<Value, Error> {
        trace!(command = ?args.first(), "sending upstash command");
        let call = async {
            let response = self
                .client
                .post(&self.url)
                .bearer_auth(&self.token)
                .json(args)
                .send()
                .await?;
            let status = response.status();
            let body = response.text().await?;
            Ok::<_, Error>((status, body))
        };
        let (status, body) = tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| Error::Timeout(self.timeout))??;

        let reply = serde_json::from_str::<Reply>(&body);
        match reply {
            Ok(Reply {
                error: Some(message),
                ..
            }) => Err(Error::Reply(message)),
            Ok(reply) if status.is_success() => Ok(reply.result),
            _ if status.is_success() => Err(Error::Unexpected(body)),
            _ => {
                debug!(status = status.as_u16(), "upstash call rejected");
                Err(Error::Status {
                    status: status.as_u16(),
                    message: body,
                })
            }
        }
    }
}

fn string_reply(value: Value) -> Result<Option<String>, Error> {
    match value {
        Value::Null => Ok(None),
        Value::String(value) => Ok(Some(value)),
        Value::Number(number) => Ok(Some(number.to_string())),
        other => Err(Error::Unexpected(other.to_string())),
    }
}

fn integer_reply(value: Value) -> Result<i64, Error> {
    match &value {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.parse().ok(),
        _ => None,
    }
    .ok_or_else(|| Error::Unexpected(value.to_string()))
}

fn array_reply(value: Value) -> Result<Vec<String>, Error> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => items
            .into_iter()
            .map(|item| string_reply(item)?.ok_or_else(|| Error::Unexpected("null".to_owned())))
            .collect(),
        other => Err(Error::Unexpected(other.to_string())),
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

/// Chooses between the second and millisecond variant of a TTL command.
fn ttl_args(ttl: Duration, seconds: &str, millis: &str) -> [String; 2] {
    if ttl.subsec_millis() == 0 && ttl.as_secs() > 0 {
        [seconds.to_owned(), ttl.as_secs().to_string()]
    } else {
        [millis.to_owned(), ttl.as_millis().max(1).to_string()]
    }
}

#[async_trait]
impl Store for UpstashStore {
    async fn ping(&self) -> StoreResult<String> {
        let reply = self.command(["PING"]).await?;
        Ok(string_reply(reply)?.unwrap_or_default())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(string_reply(self.command(["GET", key]).await?)?)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let [unit, amount] = ttl_args(ttl, "EX", "PX");
        self.command(["SET", key, value, unit.as_str(), amount.as_str()]).await?;
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> StoreResult<DeleteStatus> {
        if keys.is_empty() {
            return Ok(DeleteStatus::Missing);
        }
        let args = std::iter::once("DEL").chain(keys.iter().map(String::as_str));
        let removed = integer_reply(self.command(args).await?)?;
        Ok(DeleteStatus::from_count(removed.max(0).unsigned_abs()))
    }

    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        Ok(array_reply(self.command(["KEYS", pattern]).await?)?)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let [command, amount] = ttl_args(ttl, "EXPIRE", "PEXPIRE");
        Ok(integer_reply(self.command([command.as_str(), key, amount.as_str()]).await?)? == 1)
    }

    async fn ttl(&self, key: &str) -> StoreResult<Ttl> {
        Ok(Ttl::from_seconds(integer_reply(
            self.command(["TTL", key]).await?,
        )?))
    }

    async fn llen(&self, key: &str) -> StoreResult<u64> {
        let len = integer_reply(self.command(["LLEN", key]).await?)?;
        Ok(len.max(0).unsigned_abs())
    }

    async fn lpush(&self, key: &str, value: &str) -> StoreResult<u64> {
        let len = integer_reply(self.command(["LPUSH", key, value]).await?)?;
        Ok(len.max(0).unsigned_abs())
    }

    async fn rpop(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(string_reply(self.command(["RPOP", key]).await?)?)
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<String>> {
        let (start, stop) = (start.to_string(), stop.to_string());
        Ok(array_reply(
            self.command(["LRANGE", key, start.as_str(), stop.as_str()]).await?,
        )?)
    }

    async fn hset(&self, key: &str, fields: &[(&str, &str)]) -> StoreResult<u64> {
        if fields.is_empty() {
            return Ok(0);
        }
        let args = ["HSET", key]
            .into_iter()
            .chain(fields.iter().flat_map(|(field, value)| [*field, *value]));
        let added = integer_reply(self.command(args).await?)?;
        Ok(added.max(0).unsigned_abs())
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        match self.command(["HGETALL", key]).await? {
            Value::Object(map) => Ok(map
                .into_iter()
                .filter_map(|(field, value)| Some((field, string_reply(value).ok()??)))
                .collect()),
            reply => {
                let flat = array_reply(reply)?;
                let mut pairs = flat.into_iter();
                let mut fields = HashMap::new();
                while let (Some(field), Some(value)) = (pairs.next(), pairs.next()) {
                    fields.insert(field, value);
                }
                Ok(fields)
            }
        }
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> StoreResult<bool> {
        let score = score_arg(score);
        Ok(integer_reply(self.command(["ZADD", key, score.as_str(), member]).await?)? == 1)
    }

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool> {
        Ok(integer_reply(self.command(["ZREM", key, member]).await?)? == 1)
    }

    async fn zrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
    ) -> StoreResult<Vec<String>> {
        let mut args = vec![
            "ZRANGEBYSCORE".to_owned(),
            key.to_owned(),
            score_arg(min),
            score_arg(max),
        ];
        if let Some(limit) = limit {
            args.extend(["LIMIT".to_owned(), "0".to_owned(), limit.to_string()]);
        }
        Ok(array_reply(self.command(args).await?)?)
    }

    fn name(&self) -> &str {
        "upstash"
    }
}

/// Builder for [`UpstashStore`].
#[derive(Debug)]
pub struct UpstashStoreBuilder {
    url: Option<String>,
    token: Option<String>,
    timeout: Duration,
    retry_backoff: Duration,
}

impl Default for UpstashStoreBuilder {
    fn default() -> Self {
        Self {
            url: None,
            token: None,
            timeout: Duration::from_secs(5),
            retry_backoff: Duration::from_millis(100),
        }
    }
}

impl UpstashStoreBuilder {
    /// REST endpoint of the database. Surrounding whitespace is ignored.
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into().trim().to_owned());
        self
    }

    /// REST token of the database. Surrounding whitespace is ignored.
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into().trim().to_owned());
        self
    }

    /// Upper bound for a single call.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Pause before the single retry of a transient failure.
    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Builds the store. Fails when the URL or token is missing or empty.
    pub fn build(self) -> Result<UpstashStore, Error> {
        let url = self
            .url
            .filter(|url| !url.is_empty())
            .ok_or(Error::Missing("url"))?;
        let token = self
            .token
            .filter(|token| !token.is_empty())
            .ok_or(Error::Missing("token"))?;
        Ok(UpstashStore {
            client: reqwest::Client::builder().build()?,
            url,
            token,
            timeout: self.timeout,
            retry_backoff: self.retry_backoff,
        })
    }
}

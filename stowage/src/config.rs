//! Settings for the store and the components built on it.
//!
//! Settings deserialize from YAML:
//!
//! ```yaml
//! store:
//!   url: https://eu1-example.upstash.io
//!   token: AX...
//!   timeout: 5s
//! cache:
//!   namespace: vauntico
//!   default_ttl: 5m
//! rate_limit:
//!   window: 1m
//!   max_requests: 100
//! worker:
//!   poll_interval: 5s
//! queue:
//!   retention: 24h
//!   max_attempts: 3
//! ```
//!
//! or from environment variables through [`Settings::from_env`].

use std::{fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{JobQueue, KeyCache, RateLimiter, SharedStore, cache, queue, worker};

/// Upstash REST endpoint.
pub const ENV_URL: &str = "UPSTASH_REDIS_REST_URL";
/// Upstash REST bearer token.
pub const ENV_TOKEN: &str = "UPSTASH_REDIS_REST_TOKEN";
/// Per-call store timeout in milliseconds.
pub const ENV_STORE_TIMEOUT_MS: &str = "STOWAGE_STORE_TIMEOUT_MS";
/// Cache namespace.
pub const ENV_CACHE_NAMESPACE: &str = "STOWAGE_CACHE_NAMESPACE";
/// Default cache TTL in seconds.
pub const ENV_DEFAULT_TTL: &str = "STOWAGE_DEFAULT_TTL";
/// Rate limit window in seconds.
pub const ENV_RATE_LIMIT_WINDOW: &str = "STOWAGE_RATE_LIMIT_WINDOW";
/// Requests allowed per rate limit window.
pub const ENV_RATE_LIMIT_MAX: &str = "STOWAGE_RATE_LIMIT_MAX";
/// Worker poll interval in milliseconds.
pub const ENV_POLL_INTERVAL_MS: &str = "STOWAGE_POLL_INTERVAL_MS";
/// Job record retention in seconds.
pub const ENV_JOB_RETENTION: &str = "STOWAGE_JOB_RETENTION";
/// Default attempt budget per job.
pub const ENV_JOB_MAX_ATTEMPTS: &str = "STOWAGE_JOB_MAX_ATTEMPTS";

/// Errors raised while loading settings or building components from them.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The YAML document could not be parsed.
    #[error("invalid settings document: {0}")]
    Yaml(#[from] serde_saphyr::Error),

    /// An environment variable held a value that does not parse.
    #[error("invalid value {value:?} for {var}: {reason}")]
    InvalidValue {
        /// Variable name.
        var: &'static str,
        /// Raw value.
        value: String,
        /// Parse error.
        reason: String,
    },

    /// A setting required by the requested component is absent.
    #[error("missing setting: {0}")]
    Missing(&'static str),

    /// No compiled-in backend can serve the configured store.
    #[error("store backend not available: {0}")]
    BackendNotAvailable(String),

    /// The Upstash client could not be built.
    #[cfg(feature = "upstash")]
    #[error(transparent)]
    Upstash(#[from] stowage_upstash::Error),

    /// The Redis client could not be built.
    #[cfg(feature = "redis")]
    #[error(transparent)]
    Redis(#[from] stowage_redis::Error),
}

/// Connection to the backing store.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreSettings {
    /// Upstash REST URL, or a `redis://` URL for a TCP connection.
    pub url: Option<String>,
    /// Bearer token for the REST API.
    pub token: Option<String>,
    /// Bound on every store call (e.g. "5s", "500ms").
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl fmt::Debug for StoreSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreSettings")
            .field("url", &self.url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            url: None,
            token: None,
            timeout: Duration::from_secs(5),
        }
    }
}

impl StoreSettings {
    /// Builds the store client the settings describe.
    ///
    /// A URL with a `redis://` or `rediss://` scheme selects the TCP client,
    /// anything else the Upstash REST client.
    pub fn into_store(self) -> Result<SharedStore, ConfigError> {
        let url = self.url.clone().ok_or(ConfigError::Missing("store.url"))?;
        if url.starts_with("redis://") || url.starts_with("rediss://") {
            self.redis_store(url)
        } else {
            self.upstash_store(url)
        }
    }

    #[cfg(feature = "upstash")]
    fn upstash_store(self, url: String) -> Result<SharedStore, ConfigError> {
        let token = self.token.ok_or(ConfigError::Missing("store.token"))?;
        let store = stowage_upstash::UpstashStore::builder()
            .url(url)
            .token(token)
            .timeout(self.timeout)
            .build()?;
        Ok(std::sync::Arc::new(store))
    }

    #[cfg(not(feature = "upstash"))]
    fn upstash_store(self, _url: String) -> Result<SharedStore, ConfigError> {
        Err(ConfigError::BackendNotAvailable("Upstash".to_owned()))
    }

    #[cfg(feature = "redis")]
    fn redis_store(self, url: String) -> Result<SharedStore, ConfigError> {
        let store = stowage_redis::RedisStore::builder()
            .server(url)
            .timeout(self.timeout)
            .build()?;
        Ok(std::sync::Arc::new(store))
    }

    #[cfg(not(feature = "redis"))]
    fn redis_store(self, _url: String) -> Result<SharedStore, ConfigError> {
        Err(ConfigError::BackendNotAvailable("Redis".to_owned()))
    }
}

/// [`KeyCache`] settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheSettings {
    /// Prefix of every cache key.
    pub namespace: String,
    /// TTL for writes that do not set one.
    #[serde(with = "humantime_serde")]
    pub default_ttl: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            namespace: "vauntico".to_owned(),
            default_ttl: cache::DEFAULT_TTL,
        }
    }
}

/// [`RateLimiter`] settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RateLimitSettings {
    /// Window length.
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// Requests allowed per window.
    pub max_requests: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_requests: 100,
        }
    }
}

/// [`PollingWorker`](crate::PollingWorker) settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkerSettings {
    /// Interval between ticks.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            poll_interval: worker::DEFAULT_POLL_INTERVAL,
        }
    }
}

/// [`JobQueue`] settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct QueueSettings {
    /// How long finished job records are kept.
    #[serde(with = "humantime_serde")]
    pub retention: Duration,
    /// Attempt budget for jobs without their own.
    pub max_attempts: u32,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            retention: queue::DEFAULT_RETENTION,
            max_attempts: queue::DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// All settings, each section defaulted when absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    /// Backing store.
    pub store: StoreSettings,
    /// Response cache.
    pub cache: CacheSettings,
    /// Rate limiter.
    pub rate_limit: RateLimitSettings,
    /// Polling worker.
    pub worker: WorkerSettings,
    /// Job queues.
    pub queue: QueueSettings,
}

impl Settings {
    /// Parses a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let mut settings: Settings = serde_saphyr::from_str(yaml)?;
        settings.store.normalize();
        Ok(settings)
    }

    /// Reads settings from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Reads settings from `lookup`, which maps a variable name to its value.
    ///
    /// Unset variables keep their default.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Settings::default();
        let get = |var: &str| lookup(var).filter(|value| !value.trim().is_empty());

        settings.store.url = get(ENV_URL);
        settings.store.token = get(ENV_TOKEN);
        settings.store.normalize();
        if let Some(ms) = parse(&get, ENV_STORE_TIMEOUT_MS)? {
            settings.store.timeout = Duration::from_millis(ms);
        }
        if let Some(namespace) = get(ENV_CACHE_NAMESPACE) {
            settings.cache.namespace = namespace.trim().to_owned();
        }
        if let Some(secs) = parse(&get, ENV_DEFAULT_TTL)? {
            settings.cache.default_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = parse(&get, ENV_RATE_LIMIT_WINDOW)? {
            settings.rate_limit.window = Duration::from_secs(secs);
        }
        if let Some(max) = parse(&get, ENV_RATE_LIMIT_MAX)? {
            settings.rate_limit.max_requests = max;
        }
        if let Some(ms) = parse(&get, ENV_POLL_INTERVAL_MS)? {
            settings.worker.poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = parse(&get, ENV_JOB_RETENTION)? {
            settings.queue.retention = Duration::from_secs(secs);
        }
        if let Some(max) = parse(&get, ENV_JOB_MAX_ATTEMPTS)? {
            settings.queue.max_attempts = max;
        }
        Ok(settings)
    }

    /// Cache over `store` with the configured namespace and TTL.
    pub fn key_cache(&self, store: SharedStore) -> KeyCache {
        KeyCache::new(store, self.cache.namespace.as_str()).with_default_ttl(self.cache.default_ttl)
    }

    /// Limiter over `store` with the configured window.
    pub fn rate_limiter(&self, store: SharedStore) -> RateLimiter {
        RateLimiter::new(store, self.rate_limit.window, self.rate_limit.max_requests)
    }

    /// Queue `name` over `store` with the configured retention and attempts.
    pub fn job_queue(&self, store: SharedStore, name: &str) -> JobQueue {
        JobQueue::new(store, name)
            .with_retention(self.queue.retention)
            .with_max_attempts(self.queue.max_attempts)
    }
}

impl StoreSettings {
    fn normalize(&mut self) {
        for value in [&mut self.url, &mut self.token] {
            *value = value
                .take()
                .map(|v| v.trim().to_owned())
                .filter(|v| !v.is_empty());
        }
    }
}

fn parse<T, G>(get: &G, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    get(var)
        .map(|value| {
            value.trim().parse().map_err(|err: T::Err| ConfigError::InvalidValue {
                var,
                reason: err.to_string(),
                value,
            })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use pretty_assertions::assert_eq;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn defaults_without_environment() {
        let settings = Settings::from_lookup(env(&[])).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.cache.namespace, "vauntico");
        assert_eq!(settings.cache.default_ttl, Duration::from_secs(300));
        assert_eq!(settings.rate_limit.window, Duration::from_secs(60));
        assert_eq!(settings.rate_limit.max_requests, 100);
        assert_eq!(settings.worker.poll_interval, Duration::from_secs(5));
        assert_eq!(settings.queue.retention, Duration::from_secs(86_400));
        assert_eq!(settings.queue.max_attempts, 3);
    }

    #[test]
    fn environment_overrides_and_trims() {
        let settings = Settings::from_lookup(env(&[
            (ENV_URL, "  https://eu1-example.upstash.io \n"),
            (ENV_TOKEN, " secret "),
            (ENV_STORE_TIMEOUT_MS, "2500"),
            (ENV_CACHE_NAMESPACE, "tests"),
            (ENV_RATE_LIMIT_MAX, "10"),
            (ENV_POLL_INTERVAL_MS, "250"),
            (ENV_JOB_MAX_ATTEMPTS, "5"),
        ]))
        .unwrap();

        assert_eq!(settings.store.url.as_deref(), Some("https://eu1-example.upstash.io"));
        assert_eq!(settings.store.token.as_deref(), Some("secret"));
        assert_eq!(settings.store.timeout, Duration::from_millis(2500));
        assert_eq!(settings.cache.namespace, "tests");
        assert_eq!(settings.rate_limit.max_requests, 10);
        assert_eq!(settings.worker.poll_interval, Duration::from_millis(250));
        assert_eq!(settings.queue.max_attempts, 5);
    }

    #[test]
    fn unparsable_value_is_reported() {
        let err = Settings::from_lookup(env(&[(ENV_RATE_LIMIT_WINDOW, "a minute")])).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { var: ENV_RATE_LIMIT_WINDOW, ref value, .. } if value == "a minute"
        ));
    }

    #[test]
    fn yaml_with_humantime_durations() {
        let yaml = r#"
store:
  url: " https://eu1-example.upstash.io "
  token: secret
  timeout: 2s
cache:
  namespace: api
rate_limit:
  window: 1s
  max_requests: 3
queue:
  retention: 1h
"#;
        let settings = Settings::from_yaml(yaml).unwrap();

        assert_eq!(settings.store.url.as_deref(), Some("https://eu1-example.upstash.io"));
        assert_eq!(settings.store.timeout, Duration::from_secs(2));
        assert_eq!(settings.cache.namespace, "api");
        assert_eq!(settings.cache.default_ttl, Duration::from_secs(300));
        assert_eq!(settings.rate_limit.window, Duration::from_secs(1));
        assert_eq!(settings.rate_limit.max_requests, 3);
        assert_eq!(settings.worker, WorkerSettings::default());
        assert_eq!(settings.queue.retention, Duration::from_secs(3600));
        assert_eq!(settings.queue.max_attempts, 3);
    }

    #[test]
    fn store_requires_url() {
        assert!(matches!(
            StoreSettings::default().into_store(),
            Err(ConfigError::Missing("store.url"))
        ));
    }

    #[cfg(feature = "upstash")]
    #[test]
    fn upstash_store_requires_token() {
        let settings = StoreSettings {
            url: Some("https://eu1-example.upstash.io".to_owned()),
            ..StoreSettings::default()
        };
        assert!(matches!(
            settings.into_store(),
            Err(ConfigError::Missing("store.token"))
        ));
    }

    #[test]
    fn token_is_redacted_in_debug() {
        let settings = StoreSettings {
            token: Some("secret".to_owned()),
            ..StoreSettings::default()
        };
        assert!(!format!("{settings:?}").contains("secret"));
    }
}

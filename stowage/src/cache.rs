//! Namespaced JSON cache.

use std::time::Duration;

use serde::{Serialize, de::DeserializeOwned};
use smol_str::SmolStr;
use stowage_core::Store;
use tracing::{debug, error};

use crate::{SharedStore, error::CacheError, metrics::record_cache_lookup};

/// TTL applied when [`CacheOptions::ttl`] is not set.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Per-write options for [`KeyCache::set`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheOptions {
    /// Lifetime of the entry. `None` or zero means the cache default.
    pub ttl: Option<Duration>,
}

impl CacheOptions {
    /// Options with an explicit TTL.
    pub fn ttl(ttl: Duration) -> Self {
        Self { ttl: Some(ttl) }
    }
}

/// JSON values stored under `<namespace>:<key>`.
///
/// The cache is advisory: [`get`](Self::get), [`set`](Self::set),
/// [`del`](Self::del) and [`clear`](Self::clear) log backend and decoding
/// failures and degrade to a miss (or `false`/`0`) instead of returning them.
/// Use [`try_get`](Self::try_get) and [`try_set`](Self::try_set) when the
/// failure matters.
///
/// ```
/// # use std::sync::Arc;
/// # async fn demo(store: stowage::SharedStore) {
/// use stowage::{CacheOptions, KeyCache};
///
/// let cache = KeyCache::new(store, "vauntico");
/// cache.set("user:1", &vec![1, 2, 3], CacheOptions::default()).await;
/// let value: Option<Vec<u8>> = cache.get("user:1").await;
/// # }
/// ```
#[derive(Clone)]
pub struct KeyCache {
    store: SharedStore,
    namespace: SmolStr,
    default_ttl: Duration,
}

impl std::fmt::Debug for KeyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyCache")
            .field("store", &self.store.name())
            .field("namespace", &self.namespace)
            .field("default_ttl", &self.default_ttl)
            .finish()
    }
}

impl KeyCache {
    /// Creates a cache writing under `namespace`.
    pub fn new(store: SharedStore, namespace: impl Into<SmolStr>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            default_ttl: DEFAULT_TTL,
        }
    }

    /// Replaces the TTL used when a write does not set one.
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Namespace every key is prefixed with.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Full store key for `key`.
    pub fn key(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }

    /// Reads and decodes a value, reporting failures.
    pub async fn try_get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        let full_key = self.key(key);
        match self.store.get(&full_key).await? {
            Some(raw) => {
                debug!(key = %full_key, "cache hit");
                record_cache_lookup(&self.namespace, true);
                Ok(Some(serde_json::from_str(&raw)?))
            }
            None => {
                debug!(key = %full_key, "cache miss");
                record_cache_lookup(&self.namespace, false);
                Ok(None)
            }
        }
    }

    /// Reads and decodes a value. Failures are logged and read as a miss.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.try_get(key).await.unwrap_or_else(|err| {
            error!(key = %self.key(key), error = %err, "cache get failed");
            None
        })
    }

    /// Encodes and writes a value, reporting failures.
    pub async fn try_set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        options: CacheOptions,
    ) -> Result<(), CacheError> {
        let full_key = self.key(key);
        let serialized = serde_json::to_string(value)?;
        let ttl = options
            .ttl
            .filter(|ttl| !ttl.is_zero())
            .unwrap_or(self.default_ttl);
        self.store.set_ex(&full_key, &serialized, ttl).await?;
        debug!(
            key = %full_key,
            ttl_secs = ttl.as_secs_f64(),
            value_size = serialized.len(),
            "cache set"
        );
        Ok(())
    }

    /// Encodes and writes a value. Returns `false` if the write failed.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        options: CacheOptions,
    ) -> bool {
        match self.try_set(key, value, options).await {
            Ok(()) => true,
            Err(err) => {
                error!(key = %self.key(key), error = %err, "cache set failed");
                false
            }
        }
    }

    /// Deletes a value. Returns whether a key was actually removed.
    pub async fn del(&self, key: &str) -> bool {
        let full_key = self.key(key);
        match self.store.del(std::slice::from_ref(&full_key)).await {
            Ok(status) => {
                let deleted = status.count() > 0;
                debug!(key = %full_key, deleted, "cache delete");
                deleted
            }
            Err(err) => {
                error!(key = %full_key, error = %err, "cache delete failed");
                false
            }
        }
    }

    /// Deletes every key of the namespace matching the glob `pattern`.
    ///
    /// Returns the number of deleted keys, `0` on failure. This lists keys
    /// with a full keyspace scan, so keep it off hot paths.
    pub async fn clear(&self, pattern: &str) -> usize {
        let full_pattern = self.key(pattern);
        let result = async {
            let keys = self.store.keys(&full_pattern).await?;
            if keys.is_empty() {
                return Ok(0);
            }
            let status = self.store.del(&keys).await?;
            Ok::<_, CacheError>(status.count() as usize)
        }
        .await;
        match result {
            Ok(deleted) => {
                debug!(pattern = %full_pattern, deleted_keys = deleted, "cache clear pattern");
                deleted
            }
            Err(err) => {
                error!(pattern = %full_pattern, error = %err, "cache clear pattern failed");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;
    use serde::Deserialize;
    use stowage_core::ManualClock;
    use stowage_memory::{FailingStore, MemoryStore};

    use super::*;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Profile {
        name: String,
        tags: Vec<String>,
        score: Option<f64>,
    }

    fn profile() -> Profile {
        Profile {
            name: "ada".to_owned(),
            tags: vec!["creator".to_owned(), "trial".to_owned()],
            score: Some(87.5),
        }
    }

    #[tokio::test]
    async fn set_then_get_until_ttl() {
        let clock = ManualClock::at_millis(1_700_000_000_000);
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        let cache = KeyCache::new(store.clone(), "vauntico");

        assert!(
            cache
                .set("profile:1", &profile(), CacheOptions::ttl(Duration::from_secs(10)))
                .await
        );
        assert_eq!(cache.get::<Profile>("profile:1").await, Some(profile()));
        assert!(store.contains_key("vauntico:profile:1"));

        clock.advance(Duration::from_secs(10));
        assert_eq!(cache.get::<Profile>("profile:1").await, None);
    }

    #[tokio::test]
    async fn default_ttl_is_five_minutes() {
        let store = Arc::new(MemoryStore::new());
        let cache = KeyCache::new(store.clone(), "vauntico");

        cache.set("k", &1, CacheOptions::default()).await;
        cache.set("zero", &1, CacheOptions::ttl(Duration::ZERO)).await;

        for key in ["vauntico:k", "vauntico:zero"] {
            let ttl = store.ttl(key).await.unwrap();
            assert!(matches!(ttl, stowage_core::Ttl::Expires(d) if d > Duration::from_secs(299)));
        }
    }

    #[tokio::test]
    async fn undecodable_value_reads_as_miss() {
        let store = Arc::new(MemoryStore::new());
        store
            .set_ex("vauntico:broken", "{not json", Duration::from_secs(60))
            .await
            .unwrap();
        let cache = KeyCache::new(store, "vauntico");

        assert_eq!(cache.get::<Profile>("broken").await, None);
        assert!(matches!(
            cache.try_get::<Profile>("broken").await,
            Err(CacheError::Format(_))
        ));
    }

    #[tokio::test]
    async fn del_reports_whether_key_existed() {
        let cache = KeyCache::new(Arc::new(MemoryStore::new()), "vauntico");
        cache.set("k", "v", CacheOptions::default()).await;

        assert!(cache.del("k").await);
        assert!(!cache.del("k").await);
    }

    #[tokio::test]
    async fn clear_only_touches_matching_keys_of_namespace() {
        let store = Arc::new(MemoryStore::new());
        let cache = KeyCache::new(store.clone(), "vauntico");
        let other = KeyCache::new(store.clone(), "ratelimit");

        cache.set("session:1", &1, CacheOptions::default()).await;
        cache.set("session:2", &2, CacheOptions::default()).await;
        cache.set("profile:1", &3, CacheOptions::default()).await;
        other.set("session:1", &4, CacheOptions::default()).await;

        assert_eq!(cache.clear("session:*").await, 2);
        assert_eq!(cache.get::<i32>("session:1").await, None);
        assert_eq!(cache.get::<i32>("profile:1").await, Some(3));
        assert_eq!(other.get::<i32>("session:1").await, Some(4));

        assert_eq!(cache.clear("session:*").await, 0);
    }

    #[tokio::test]
    async fn outage_degrades_to_miss() {
        let cache = KeyCache::new(Arc::new(FailingStore), "vauntico");

        assert_eq!(cache.get::<i32>("k").await, None);
        assert!(!cache.set("k", &1, CacheOptions::default()).await);
        assert!(!cache.del("k").await);
        assert_eq!(cache.clear("*").await, 0);
        assert!(matches!(
            cache.try_get::<i32>("k").await,
            Err(CacheError::Store(err)) if err.is_transient()
        ));
    }
}

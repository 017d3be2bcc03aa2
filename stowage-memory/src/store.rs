use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use stowage_core::{
    DeleteStatus, SharedClock, Store, StoreError, StoreResult, SystemClock, Ttl,
};
use tracing::trace;

use crate::KeyPattern;

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    List(VecDeque<String>),
    Hash(HashMap<String, String>),
    Sorted(HashMap<String, f64>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Concurrent in-memory store with lazy expiry.
///
/// Expired keys are dropped when they are next touched, the same observable
/// behavior as a remote cache. Time is read through a [`Clock`], so tests can
/// expire entries by advancing a manual clock instead of sleeping.
///
/// Cloning is cheap and clones share the same data.
///
/// ```
/// use stowage_memory::MemoryStore;
///
/// let store = MemoryStore::new();
/// ```
///
/// [`Clock`]: stowage_core::Clock
#[derive(Clone, Debug)]
pub struct MemoryStore {
    entries: Arc<DashMap<String, Entry>>,
    clock: SharedClock,
}

impl MemoryStore {
    /// Creates an empty store driven by the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Creates an empty store driven by the given clock.
    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            clock,
        }
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.purge_expired();
        self.entries.len()
    }

    /// Whether the store holds no live keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `key` exists and has not expired.
    pub fn contains_key(&self, key: &str) -> bool {
        self.purge_if_expired(key);
        self.entries.contains_key(key)
    }

    /// Drops every key.
    pub fn flush(&self) {
        self.entries.clear();
    }

    fn purge_if_expired(&self, key: &str) {
        let now = self.clock.now();
        if self
            .entries
            .remove_if(key, |_, entry| entry.is_expired(now))
            .is_some()
        {
            trace!(key, "expired key dropped");
        }
    }

    fn purge_expired(&self) {
        let now = self.clock.now();
        self.entries.retain(|_, entry| !entry.is_expired(now));
    }

    fn deadline(&self, ttl: Duration) -> DateTime<Utc> {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        self.clock
            .now()
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> StoreResult<String> {
        Ok("PONG".to_owned())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.purge_if_expired(key);
        match self.entries.get(key).map(|entry| entry.value.clone()) {
            None => Ok(None),
            Some(Value::Str(value)) => Ok(Some(value)),
            Some(_) => Err(StoreError::wrong_type()),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let entry = Entry {
            value: Value::Str(value.to_owned()),
            expires_at: Some(self.deadline(ttl)),
        };
        self.entries.insert(key.to_owned(), entry);
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> StoreResult<DeleteStatus> {
        let mut removed = 0;
        for key in keys {
            self.purge_if_expired(key);
            if self.entries.remove(key).is_some() {
                removed += 1;
            }
        }
        Ok(DeleteStatus::from_count(removed))
    }

    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let pattern =
            KeyPattern::new(pattern).map_err(|err| StoreError::Reply(err.to_string()))?;
        self.purge_expired();
        Ok(self
            .entries
            .iter()
            .filter(|entry| pattern.matches(entry.key()))
            .map(|entry| entry.key().clone())
            .collect())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        self.purge_if_expired(key);
        let deadline = self.deadline(ttl);
        Ok(match self.entries.get_mut(key) {
            Some(mut entry) => {
                entry.expires_at = Some(deadline);
                true
            }
            None => false,
        })
    }

    async fn ttl(&self, key: &str) -> StoreResult<Ttl> {
        self.purge_if_expired(key);
        let now = self.clock.now();
        Ok(match self.entries.get(key) {
            None => Ttl::Missing,
            Some(entry) => match entry.expires_at {
                None => Ttl::Persistent,
                Some(at) => Ttl::Expires((at - now).to_std().unwrap_or_default()),
            },
        })
    }

    async fn llen(&self, key: &str) -> StoreResult<u64> {
        self.purge_if_expired(key);
        match self.entries.get(key).as_deref() {
            None => Ok(0),
            Some(Entry {
                value: Value::List(list),
                ..
            }) => Ok(list.len() as u64),
            Some(_) => Err(StoreError::wrong_type()),
        }
    }

    async fn lpush(&self, key: &str, value: &str) -> StoreResult<u64> {
        self.purge_if_expired(key);
        let mut entry = self
            .entries
            .entry(key.to_owned())
            .or_insert_with(|| Entry::new(Value::List(VecDeque::new())));
        match &mut entry.value {
            Value::List(list) => {
                list.push_front(value.to_owned());
                Ok(list.len() as u64)
            }
            _ => Err(StoreError::wrong_type()),
        }
    }

    async fn rpop(&self, key: &str) -> StoreResult<Option<String>> {
        self.purge_if_expired(key);
        let popped = match self.entries.get_mut(key) {
            None => return Ok(None),
            Some(mut entry) => match &mut entry.value {
                Value::List(list) => list.pop_back(),
                _ => return Err(StoreError::wrong_type()),
            },
        };
        // Emptied lists disappear, like in Redis.
        self.entries.remove_if(key, |_, entry| {
            matches!(&entry.value, Value::List(list) if list.is_empty())
        });
        Ok(popped)
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<String>> {
        self.purge_if_expired(key);
        let Some(entry) = self.entries.get(key) else {
            return Ok(Vec::new());
        };
        let Value::List(list) = &entry.value else {
            return Err(StoreError::wrong_type());
        };
        let len = list.len() as i64;
        let resolve = |index: i64| if index < 0 { len + index } else { index };
        let start = resolve(start).max(0);
        let stop = resolve(stop).min(len - 1);
        if start > stop {
            return Ok(Vec::new());
        }
        Ok(list
            .iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .cloned()
            .collect())
    }

    async fn hset(&self, key: &str, fields: &[(&str, &str)]) -> StoreResult<u64> {
        self.purge_if_expired(key);
        let mut entry = self
            .entries
            .entry(key.to_owned())
            .or_insert_with(|| Entry::new(Value::Hash(HashMap::new())));
        match &mut entry.value {
            Value::Hash(hash) => {
                let added = fields
                    .iter()
                    .filter(|(field, value)| {
                        hash.insert((*field).to_owned(), (*value).to_owned())
                            .is_none()
                    })
                    .count();
                Ok(added as u64)
            }
            _ => Err(StoreError::wrong_type()),
        }
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        self.purge_if_expired(key);
        match self.entries.get(key).as_deref() {
            None => Ok(HashMap::new()),
            Some(Entry {
                value: Value::Hash(hash),
                ..
            }) => Ok(hash.clone()),
            Some(_) => Err(StoreError::wrong_type()),
        }
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> StoreResult<bool> {
        self.purge_if_expired(key);
        let mut entry = self
            .entries
            .entry(key.to_owned())
            .or_insert_with(|| Entry::new(Value::Sorted(HashMap::new())));
        match &mut entry.value {
            Value::Sorted(set) => Ok(set.insert(member.to_owned(), score).is_none()),
            _ => Err(StoreError::wrong_type()),
        }
    }

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.purge_if_expired(key);
        let removed = match self.entries.get_mut(key) {
            None => return Ok(false),
            Some(mut entry) => match &mut entry.value {
                Value::Sorted(set) => set.remove(member).is_some(),
                _ => return Err(StoreError::wrong_type()),
            },
        };
        self.entries.remove_if(key, |_, entry| {
            matches!(&entry.value, Value::Sorted(set) if set.is_empty())
        });
        Ok(removed)
    }

    async fn zrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
    ) -> StoreResult<Vec<String>> {
        self.purge_if_expired(key);
        let Some(entry) = self.entries.get(key) else {
            return Ok(Vec::new());
        };
        let Value::Sorted(set) = &entry.value else {
            return Err(StoreError::wrong_type());
        };
        let mut members: Vec<(f64, &String)> = set
            .iter()
            .filter(|(_, score)| **score >= min && **score <= max)
            .map(|(member, score)| (*score, member))
            .collect();
        members.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(b.1)));
        Ok(members
            .into_iter()
            .take(limit.unwrap_or(usize::MAX))
            .map(|(_, member)| member.clone())
            .collect())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use stowage_core::ManualClock;

    use super::*;

    fn store_with_clock() -> (MemoryStore, ManualClock) {
        let clock = ManualClock::at_millis(1_700_000_000_000);
        (MemoryStore::with_clock(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn strings_expire_after_ttl() {
        let (store, clock) = store_with_clock();
        store
            .set_ex("greeting", "hello", Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(store.get("greeting").await.unwrap().as_deref(), Some("hello"));
        assert_eq!(
            store.ttl("greeting").await.unwrap(),
            Ttl::Expires(Duration::from_secs(5))
        );

        clock.advance(Duration::from_secs(5));
        assert_eq!(store.get("greeting").await.unwrap(), None);
        assert_eq!(store.ttl("greeting").await.unwrap(), Ttl::Missing);
    }

    #[tokio::test]
    async fn list_is_fifo_with_head_push_and_tail_pop() {
        let store = MemoryStore::new();
        for value in ["a", "b", "c"] {
            store.lpush("jobs", value).await.unwrap();
        }
        assert_eq!(store.llen("jobs").await.unwrap(), 3);
        assert_eq!(
            store.lrange("jobs", 0, -1).await.unwrap(),
            vec!["c", "b", "a"]
        );

        assert_eq!(store.rpop("jobs").await.unwrap().as_deref(), Some("a"));
        assert_eq!(store.rpop("jobs").await.unwrap().as_deref(), Some("b"));
        assert_eq!(store.rpop("jobs").await.unwrap().as_deref(), Some("c"));
        assert_eq!(store.rpop("jobs").await.unwrap(), None);
        assert!(!store.contains_key("jobs"));
    }

    #[tokio::test]
    async fn hash_fields_merge() {
        let store = MemoryStore::new();
        let added = store
            .hset("job:1", &[("id", "1"), ("status", "waiting")])
            .await
            .unwrap();
        assert_eq!(added, 2);

        let added = store.hset("job:1", &[("status", "processing")]).await.unwrap();
        assert_eq!(added, 0);

        let fields = store.hgetall("job:1").await.unwrap();
        assert_eq!(fields.get("id").map(String::as_str), Some("1"));
        assert_eq!(fields.get("status").map(String::as_str), Some("processing"));
        assert!(store.hgetall("job:missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sorted_set_ranges_by_score() {
        let store = MemoryStore::new();
        store.zadd("due", 30.0, "c").await.unwrap();
        store.zadd("due", 10.0, "a").await.unwrap();
        assert!(store.zadd("due", 20.0, "b").await.unwrap());
        // Rescoring an existing member is not an addition.
        assert!(!store.zadd("due", 5.0, "c").await.unwrap());

        assert_eq!(
            store
                .zrangebyscore("due", f64::NEG_INFINITY, 20.0, None)
                .await
                .unwrap(),
            vec!["c", "a", "b"]
        );
        assert_eq!(
            store
                .zrangebyscore("due", f64::NEG_INFINITY, f64::INFINITY, Some(1))
                .await
                .unwrap(),
            vec!["c"]
        );

        assert!(store.zrem("due", "a").await.unwrap());
        assert!(!store.zrem("due", "a").await.unwrap());
    }

    #[tokio::test]
    async fn keys_honour_patterns_and_expiry() {
        let (store, clock) = store_with_clock();
        store
            .set_ex("vauntico:session:1", "x", Duration::from_secs(1))
            .await
            .unwrap();
        store
            .set_ex("vauntico:session:2", "x", Duration::from_secs(60))
            .await
            .unwrap();
        store
            .set_ex("ratelimit:session:1", "x", Duration::from_secs(60))
            .await
            .unwrap();

        let mut keys = store.keys("vauntico:session:*").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["vauntico:session:1", "vauntico:session:2"]);

        clock.advance(Duration::from_secs(2));
        assert_eq!(
            store.keys("vauntico:*").await.unwrap(),
            vec!["vauntico:session:2"]
        );
    }

    #[tokio::test]
    async fn expire_and_persistent_ttl() {
        let store = MemoryStore::new();
        store.lpush("list", "x").await.unwrap();
        assert_eq!(store.ttl("list").await.unwrap(), Ttl::Persistent);

        assert!(store.expire("list", Duration::from_secs(30)).await.unwrap());
        assert!(matches!(store.ttl("list").await.unwrap(), Ttl::Expires(_)));
        assert!(!store.expire("missing", Duration::from_secs(30)).await.unwrap());
    }

    #[tokio::test]
    async fn wrong_type_is_reported() {
        let store = MemoryStore::new();
        store.lpush("list", "x").await.unwrap();
        let err = store.get("list").await.unwrap_err();
        assert!(matches!(err, StoreError::Reply(message) if message.starts_with("WRONGTYPE")));
        assert!(store.hset("list", &[("a", "b")]).await.is_err());
    }

    #[tokio::test]
    async fn del_counts_removed_keys() {
        let store = MemoryStore::new();
        store.set_ex("a", "1", Duration::from_secs(10)).await.unwrap();
        store.set_ex("b", "1", Duration::from_secs(10)).await.unwrap();

        let status = store
            .del(&["a".to_owned(), "b".to_owned(), "c".to_owned()])
            .await
            .unwrap();
        assert_eq!(status, DeleteStatus::Deleted(2));
        assert_eq!(
            store.del(&["a".to_owned()]).await.unwrap(),
            DeleteStatus::Missing
        );
    }
}

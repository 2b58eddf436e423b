//! Counter storage shared by the rate limiter and the feature extractor.
//!
//! Two backings implement [`CounterStore`] with the same semantics: an
//! in-memory map with per-key TTLs for a single instance, and Redis for
//! counters visible across instances. TTLs are applied when a key is
//! created, so a counter always expires at its window boundary.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use thiserror::Error;
use tokio::time::Instant;

/// Errors that can occur during counter store operations
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    RedisError(#[from] redis::RedisError),
    #[error("Store operation timed out")]
    Timeout,
    #[error("Key {0} holds a value of another type")]
    WrongType(String),
}

/// Key/value operations needed by the request path.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Add `delta` to an integer counter, creating it with `ttl` if absent.
    async fn incr(&self, key: &str, delta: i64, ttl: Duration) -> Result<i64, StoreError>;

    async fn get(&self, key: &str) -> Result<Option<i64>, StoreError>;

    /// Overwrite an integer value and reset its TTL.
    async fn set(&self, key: &str, value: i64, ttl: Duration) -> Result<(), StoreError>;

    /// Set an integer value only if the key does not exist. Returns whether it was set.
    async fn set_if_absent(&self, key: &str, value: i64, ttl: Duration) -> Result<bool, StoreError>;

    /// Add a member to a set and return its cardinality.
    async fn set_add(&self, key: &str, member: &str, ttl: Duration) -> Result<u64, StoreError>;

    /// Append to a list, keep only the newest `cap` values, refresh the TTL and
    /// return the retained values oldest first.
    async fn list_push_capped(
        &self,
        key: &str,
        value: i64,
        cap: usize,
        ttl: Duration,
    ) -> Result<Vec<i64>, StoreError>;

    /// Increment a hash field and return the whole hash.
    async fn hash_incr(
        &self,
        key: &str,
        field: &str,
        delta: i64,
        ttl: Duration,
    ) -> Result<HashMap<String, i64>, StoreError>;

    /// Remaining time to live in milliseconds, `None` if the key does not exist.
    async fn ttl_ms(&self, key: &str) -> Result<Option<u64>, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Drop expired entries. Returns the number removed.
    async fn purge_expired(&self) -> Result<usize, StoreError>;
}

#[derive(Debug, Clone)]
enum Value {
    Int(i64),
    Set(HashSet<String>),
    List(VecDeque<i64>),
    Hash(HashMap<String, i64>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Instant,
}

impl Entry {
    fn new(value: Value, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }
}

/// In-memory counter store with per-key TTLs.
///
/// Expiry is checked on every access and expired keys are dropped by
/// [`CounterStore::purge_expired`] from the eviction sweep.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run `f` on a live entry, replacing a missing or expired one with `init`.
    fn with_entry<T>(
        &self,
        key: &str,
        ttl: Duration,
        init: impl Fn() -> Value,
        f: impl FnOnce(&mut Entry) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(init(), ttl));
        if entry.is_expired(now) {
            *entry = Entry::new(init(), ttl);
        }
        f(&mut entry)
    }

    fn live<T>(&self, key: &str, f: impl FnOnce(&Entry) -> T) -> Option<T> {
        let now = Instant::now();
        let entry = self.entries.get(key)?;
        if entry.is_expired(now) {
            drop(entry);
            self.entries.remove_if(key, |_, e| e.is_expired(now));
            return None;
        }
        Some(f(&entry))
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn incr(&self, key: &str, delta: i64, ttl: Duration) -> Result<i64, StoreError> {
        self.with_entry(key, ttl, || Value::Int(0), |entry| match &mut entry.value {
            Value::Int(n) => {
                *n += delta;
                Ok(*n)
            }
            _ => Err(StoreError::WrongType(key.to_string())),
        })
    }

    async fn get(&self, key: &str) -> Result<Option<i64>, StoreError> {
        match self.live(key, |entry| entry.value.clone()) {
            None => Ok(None),
            Some(Value::Int(n)) => Ok(Some(n)),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn set(&self, key: &str, value: i64, ttl: Duration) -> Result<(), StoreError> {
        self.entries
            .insert(key.to_string(), Entry::new(Value::Int(value), ttl));
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: i64, ttl: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(Entry::new(Value::Int(value), ttl));
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(Entry::new(Value::Int(value), ttl));
                Ok(true)
            }
        }
    }

    async fn set_add(&self, key: &str, member: &str, ttl: Duration) -> Result<u64, StoreError> {
        self.with_entry(key, ttl, || Value::Set(HashSet::new()), |entry| match &mut entry.value {
            Value::Set(members) => {
                members.insert(member.to_string());
                Ok(members.len() as u64)
            }
            _ => Err(StoreError::WrongType(key.to_string())),
        })
    }

    async fn list_push_capped(
        &self,
        key: &str,
        value: i64,
        cap: usize,
        ttl: Duration,
    ) -> Result<Vec<i64>, StoreError> {
        self.with_entry(key, ttl, || Value::List(VecDeque::new()), |entry| {
            entry.expires_at = Instant::now() + ttl;
            match &mut entry.value {
                Value::List(items) => {
                    items.push_back(value);
                    while items.len() > cap {
                        items.pop_front();
                    }
                    Ok(items.iter().copied().collect())
                }
                _ => Err(StoreError::WrongType(key.to_string())),
            }
        })
    }

    async fn hash_incr(
        &self,
        key: &str,
        field: &str,
        delta: i64,
        ttl: Duration,
    ) -> Result<HashMap<String, i64>, StoreError> {
        self.with_entry(key, ttl, || Value::Hash(HashMap::new()), |entry| match &mut entry.value {
            Value::Hash(fields) => {
                *fields.entry(field.to_string()).or_insert(0) += delta;
                Ok(fields.clone())
            }
            _ => Err(StoreError::WrongType(key.to_string())),
        })
    }

    async fn ttl_ms(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let now = Instant::now();
        Ok(self.live(key, |entry| {
            entry.expires_at.saturating_duration_since(now).as_millis() as u64
        }))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize, StoreError> {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        Ok(before.saturating_sub(self.entries.len()))
    }
}

// Each script applies the TTL in the same server-side step as the write,
// so a caller that gives up mid-operation cannot leave a key without expiry.
// A key found without a TTL (PTTL -1) gets one on its next write.
const INCR_SCRIPT: &str = r"
local count = redis.call('INCRBY', KEYS[1], ARGV[1])
if redis.call('PTTL', KEYS[1]) < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return count
";

const SET_ADD_SCRIPT: &str = r"
redis.call('SADD', KEYS[1], ARGV[1])
if redis.call('PTTL', KEYS[1]) < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return redis.call('SCARD', KEYS[1])
";

const HASH_INCR_SCRIPT: &str = r"
redis.call('HINCRBY', KEYS[1], ARGV[1], ARGV[2])
if redis.call('PTTL', KEYS[1]) < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[3])
end
return redis.call('HGETALL', KEYS[1])
";

/// Counter store shared across instances through Redis.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    incr_script: Arc<Script>,
    set_add_script: Arc<Script>,
    hash_incr_script: Arc<Script>,
}

impl RedisStore {
    /// Connect to Redis and keep a managed, auto-reconnecting connection.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            incr_script: Arc::new(Script::new(INCR_SCRIPT)),
            set_add_script: Arc::new(Script::new(SET_ADD_SCRIPT)),
            hash_incr_script: Arc::new(Script::new(HASH_INCR_SCRIPT)),
        })
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn incr(&self, key: &str, delta: i64, ttl: Duration) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        let count: i64 = self
            .incr_script
            .key(key)
            .arg(delta)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn get(&self, key: &str) -> Result<Option<i64>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: i64, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: i64, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn set_add(&self, key: &str, member: &str, ttl: Duration) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let cardinality: u64 = self
            .set_add_script
            .key(key)
            .arg(member)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;
        Ok(cardinality)
    }

    async fn list_push_capped(
        &self,
        key: &str,
        value: i64,
        cap: usize,
        ttl: Duration,
    ) -> Result<Vec<i64>, StoreError> {
        let mut conn = self.conn.clone();
        let keep_from = -(cap as i64);
        let (items,): (Vec<i64>,) = redis::pipe()
            .atomic()
            .cmd("RPUSH")
            .arg(key)
            .arg(value)
            .ignore()
            .cmd("LTRIM")
            .arg(key)
            .arg(keep_from)
            .arg(-1)
            .ignore()
            .cmd("PEXPIRE")
            .arg(key)
            .arg(ttl.as_millis() as u64)
            .ignore()
            .cmd("LRANGE")
            .arg(key)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;
        Ok(items)
    }

    async fn hash_incr(
        &self,
        key: &str,
        field: &str,
        delta: i64,
        ttl: Duration,
    ) -> Result<HashMap<String, i64>, StoreError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, i64> = self
            .hash_incr_script
            .key(key)
            .arg(field)
            .arg(delta)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;
        Ok(fields)
    }

    async fn ttl_ms(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let mut conn = self.conn.clone();
        let remaining: i64 = conn.pttl(key).await?;
        // -2: no such key, -1: no expiry. Every write path sets a TTL, so
        // -1 only shows up for keys written by something else.
        Ok(match remaining {
            -2 => None,
            -1 => Some(0),
            ms => Some(ms as u64),
        })
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize, StoreError> {
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_incr_expires_at_window_boundary() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(1);

        assert_eq!(store.incr("k", 1, ttl).await.unwrap(), 1);
        tokio::time::advance(Duration::from_millis(600)).await;
        assert_eq!(store.incr("k", 1, ttl).await.unwrap(), 2);

        // The second increment must not have extended the TTL.
        tokio::time::advance(Duration::from_millis(400)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert_eq!(store.incr("k", 1, ttl).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_if_absent() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(1);

        assert!(store.set_if_absent("first", 10, ttl).await.unwrap());
        assert!(!store.set_if_absent("first", 20, ttl).await.unwrap());
        assert_eq!(store.get("first").await.unwrap(), Some(10));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(store.set_if_absent("first", 30, ttl).await.unwrap());
        assert_eq!(store.get("first").await.unwrap(), Some(30));
    }

    #[tokio::test]
    async fn test_list_is_capped() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);

        let mut retained = Vec::new();
        for i in 0..250 {
            retained = store.list_push_capped("list", i, 100, ttl).await.unwrap();
        }
        assert_eq!(retained.len(), 100);
        assert_eq!(retained.first(), Some(&150));
        assert_eq!(retained.last(), Some(&249));
    }

    #[tokio::test]
    async fn test_set_and_hash() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);

        store.set_add("paths", "/a", ttl).await.unwrap();
        store.set_add("paths", "/b", ttl).await.unwrap();
        assert_eq!(store.set_add("paths", "/a", ttl).await.unwrap(), 2);

        store.hash_incr("methods", "GET", 1, ttl).await.unwrap();
        let methods = store.hash_incr("methods", "POST", 1, ttl).await.unwrap();
        assert_eq!(methods.get("GET"), Some(&1));
        assert_eq!(methods.get("POST"), Some(&1));

        assert!(matches!(
            store.incr("paths", 1, ttl).await,
            Err(StoreError::WrongType(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let store = MemoryStore::new();
        store.set("short", 1, Duration::from_millis(100)).await.unwrap();
        store.set("long", 1, Duration::from_secs(100)).await.unwrap();

        tokio::time::advance(Duration::from_millis(200)).await;
        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.ttl_ms("short").await.unwrap(), None);
        assert!(store.ttl_ms("long").await.unwrap().is_some());
    }

    #[tokio::test]
    #[ignore = "requires a running Redis server"]
    async fn test_redis_store() {
        let store = RedisStore::connect("redis://127.0.0.1:6379").await.unwrap();
        let ttl = Duration::from_secs(5);
        store.delete("test:counter").await.unwrap();

        assert_eq!(store.incr("test:counter", 1, ttl).await.unwrap(), 1);
        assert_eq!(store.incr("test:counter", 1, ttl).await.unwrap(), 2);
        assert!(store.ttl_ms("test:counter").await.unwrap().unwrap() <= 5_000);

        store.delete("test:list").await.unwrap();
        for i in 0..5 {
            store.list_push_capped("test:list", i, 3, ttl).await.unwrap();
        }
        let items = store.list_push_capped("test:list", 5, 3, ttl).await.unwrap();
        assert_eq!(items, vec![3, 4, 5]);
    }

    #[tokio::test]
    #[ignore = "requires a running Redis server"]
    async fn test_redis_counter_without_ttl_gets_one() {
        let store = RedisStore::connect("redis://127.0.0.1:6379").await.unwrap();
        let ttl = Duration::from_secs(5);
        store.delete("test:orphan").await.unwrap();

        // Simulate a counter whose expiry was never applied
        let mut conn = store.conn.clone();
        conn.incr::<_, _, ()>("test:orphan", 7).await.unwrap();
        assert_eq!(store.ttl_ms("test:orphan").await.unwrap(), Some(0));

        assert_eq!(store.incr("test:orphan", 1, ttl).await.unwrap(), 8);
        let remaining = store.ttl_ms("test:orphan").await.unwrap().unwrap();
        assert!(remaining > 0 && remaining <= 5_000);

        store.delete("test:paths").await.unwrap();
        store.delete("test:methods").await.unwrap();
        assert_eq!(store.set_add("test:paths", "/a", ttl).await.unwrap(), 1);
        let methods = store.hash_incr("test:methods", "GET", 2, ttl).await.unwrap();
        assert_eq!(methods.get("GET"), Some(&2));
        assert!(store.ttl_ms("test:paths").await.unwrap().unwrap() > 0);
        assert!(store.ttl_ms("test:methods").await.unwrap().unwrap() > 0);
    }
}

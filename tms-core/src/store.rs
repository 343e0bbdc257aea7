//! Shared key-value state reachable by every host process.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("value at {0} is not an integer")]
    NotAnInteger(String),
    #[error("value at {0} has the wrong type")]
    WrongType(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Key layout shared with the host's relay.
pub mod keys {
    use uuid::Uuid;

    pub const ACTIVE_CHANNEL_PATTERN: &str = "ts_proxy:channel:*:metadata";

    pub fn channel_stream(channel_id: i64) -> String {
        format!("channel_stream:{channel_id}")
    }

    pub fn stream_profile(source_id: i64) -> String {
        format!("stream_profile:{source_id}")
    }

    pub fn profile_connections(profile_id: i64) -> String {
        format!("profile_connections:{profile_id}")
    }

    pub fn maxed_out(channel_id: i64) -> String {
        format!("tms:maxed_out:{channel_id}")
    }

    pub fn channel_metadata(channel_uuid: &Uuid) -> String {
        format!("ts_proxy:channel:{channel_uuid}:metadata")
    }

    pub fn channel_events(channel_uuid: &Uuid) -> String {
        format!("ts_proxy:events:{channel_uuid}")
    }
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> StoreResult<()>;
    async fn incr(&self, key: &str) -> StoreResult<i64>;
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()>;
    async fn delete(&self, key: &str) -> StoreResult<()>;
    /// Keys matching a glob pattern where `*` matches any run of characters.
    async fn scan(&self, pattern: &str) -> StoreResult<Vec<String>>;
    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>>;
    async fn publish(&self, channel: &str, message: &str) -> StoreResult<()>;
}

/// Reads an integer counter; absent or malformed values count as zero.
pub async fn read_counter(store: &dyn StateStore, key: &str) -> StoreResult<i64> {
    Ok(store
        .get(key)
        .await?
        .and_then(|raw| raw.trim().parse::<i64>().ok())
        .unwrap_or(0))
}

#[derive(Clone)]
pub struct RedisStateStore {
    redis: ConnectionManager,
}

impl fmt::Debug for RedisStateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStateStore").finish_non_exhaustive()
    }
}

impl RedisStateStore {
    pub async fn connect(redis_url: &str) -> StoreResult<Self> {
        let client = Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self { redis })
    }
}

#[async_trait]
impl StateStore for RedisStateStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.redis.clone();
        Ok(conn.get::<_, Option<String>>(key).await?)
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut conn = self.redis.clone();
        conn.set::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn incr(&self, key: &str) -> StoreResult<i64> {
        let mut conn = self.redis.clone();
        Ok(conn.incr::<_, _, i64>(key, 1).await?)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.redis.clone();
        conn.expire::<_, ()>(key, ttl.as_secs() as i64).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn scan(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.redis.clone();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(keys)
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        let mut conn = self.redis.clone();
        Ok(conn.hget::<_, _, Option<String>>(key, field).await?)
    }

    async fn publish(&self, channel: &str, message: &str) -> StoreResult<()> {
        let mut conn = self.redis.clone();
        conn.publish::<_, _, ()>(channel, message).await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum StoredValue {
    Text(String),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: StoredValue,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at > now).unwrap_or(true)
    }
}

/// In-process store with Redis semantics for the subset used here.
/// Expiry follows tokio's clock so paused-time tests can advance it.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    entries: Mutex<HashMap<String, Entry>>,
    published: Mutex<Vec<(String, String)>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hset(&self, key: &str, field: &str, value: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let entry = entries
            .entry(key.to_string())
            .and_modify(|entry| {
                if !entry.is_live(now) || !matches!(entry.value, StoredValue::Hash(_)) {
                    *entry = Entry {
                        value: StoredValue::Hash(HashMap::new()),
                        expires_at: None,
                    };
                }
            })
            .or_insert_with(|| Entry {
                value: StoredValue::Hash(HashMap::new()),
                expires_at: None,
            });
        if let StoredValue::Hash(map) = &mut entry.value {
            map.insert(field.to_string(), value.to_string());
        }
    }

    /// Messages published so far, oldest first.
    pub fn published(&self) -> Vec<(String, String)> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn with_live<T>(&self, key: &str, f: impl FnOnce(Option<&mut Entry>) -> T) -> T {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        if entries.get(key).map(|entry| !entry.is_live(now)).unwrap_or(false) {
            entries.remove(key);
        }
        f(entries.get_mut(key))
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.with_live(key, |entry| match entry.map(|entry| &entry.value) {
            None => Ok(None),
            Some(StoredValue::Text(text)) => Ok(Some(text.clone())),
            Some(StoredValue::Hash(_)) => Err(StoreError::WrongType(key.to_string())),
        })
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(
            key.to_string(),
            Entry {
                value: StoredValue::Text(value.to_string()),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn incr(&self, key: &str) -> StoreResult<i64> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let live = entries.get(key).map(|entry| entry.is_live(now)).unwrap_or(false);
        if !live {
            entries.insert(
                key.to_string(),
                Entry {
                    value: StoredValue::Text("0".into()),
                    expires_at: None,
                },
            );
        }
        let entry = entries
            .get_mut(key)
            .ok_or_else(|| StoreError::WrongType(key.to_string()))?;
        let current = match &entry.value {
            StoredValue::Text(text) => text
                .parse::<i64>()
                .map_err(|_| StoreError::NotAnInteger(key.to_string()))?,
            StoredValue::Hash(_) => return Err(StoreError::WrongType(key.to_string())),
        };
        let next = current + 1;
        entry.value = StoredValue::Text(next.to_string());
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        self.with_live(key, |entry| {
            if let Some(entry) = entry {
                entry.expires_at = Some(Instant::now() + ttl);
            }
        });
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }

    async fn scan(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(key, entry)| entry.is_live(now) && glob_match(pattern, key))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        self.with_live(key, |entry| match entry.map(|entry| &entry.value) {
            None => Ok(None),
            Some(StoredValue::Hash(map)) => Ok(map.get(field).cloned()),
            Some(StoredValue::Text(_)) => Err(StoreError::WrongType(key.to_string())),
        })
    }

    async fn publish(&self, channel: &str, message: &str) -> StoreResult<()> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((channel.to_string(), message.to_string()));
        Ok(())
    }
}

fn glob_match(pattern: &str, candidate: &str) -> bool {
    let mut parts = pattern.split('*');
    let Some(first) = parts.next() else {
        return candidate.is_empty();
    };
    let Some(mut rest) = candidate.strip_prefix(first) else {
        return false;
    };
    let parts: Vec<&str> = parts.collect();
    let Some((last, middle)) = parts.split_last() else {
        return rest.is_empty();
    };
    for part in middle {
        match rest.find(part) {
            Some(index) => rest = &rest[index + part.len()..],
            None => return false,
        }
    }
    rest.len() >= last.len() && rest.ends_with(last)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_matches_metadata_keys() {
        assert!(glob_match(
            keys::ACTIVE_CHANNEL_PATTERN,
            "ts_proxy:channel:abc:metadata"
        ));
        assert!(!glob_match(
            keys::ACTIVE_CHANNEL_PATTERN,
            "ts_proxy:channel:abc:buffer"
        ));
        assert!(glob_match("tms:*", "tms:maxed_out:4"));
        assert!(glob_match("exact", "exact"));
        assert!(!glob_match("exact", "exactly"));
        assert!(!glob_match("a*bc", "abc:x"));
    }

    #[tokio::test(start_paused = true)]
    async fn counters_expire_with_the_clock() {
        let store = MemoryStateStore::new();
        assert_eq!(store.incr("counter").await.unwrap(), 1);
        store.expire("counter", Duration::from_secs(30)).await.unwrap();
        assert_eq!(store.incr("counter").await.unwrap(), 2);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(store.get("counter").await.unwrap(), None);
        assert_eq!(store.incr("counter").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn malformed_counters_read_as_zero() {
        let store = MemoryStateStore::new();
        store.set("profile_connections:1", "garbage").await.unwrap();
        assert_eq!(read_counter(&store, "profile_connections:1").await.unwrap(), 0);
        assert_eq!(read_counter(&store, "profile_connections:2").await.unwrap(), 0);
        assert!(matches!(
            store.incr("profile_connections:1").await,
            Err(StoreError::NotAnInteger(_))
        ));
    }

    #[tokio::test]
    async fn hashes_and_publish_are_recorded() {
        let store = MemoryStateStore::new();
        store.hset("ts_proxy:channel:x:metadata", "url", "http://up/1");
        assert_eq!(
            store
                .hget("ts_proxy:channel:x:metadata", "url")
                .await
                .unwrap()
                .as_deref(),
            Some("http://up/1")
        );
        assert_eq!(
            store.scan(keys::ACTIVE_CHANNEL_PATTERN).await.unwrap(),
            vec!["ts_proxy:channel:x:metadata".to_string()]
        );
        store.publish("events", "{}").await.unwrap();
        assert_eq!(store.published(), vec![("events".into(), "{}".into())]);
    }
}

//! Keyspace Module
//!
//! The embedded backing store shared by every engine, lease and collector in
//! the process. It offers Redis-like strings, hashes and sets with per-key
//! expiry, topic pub/sub, and multi-key atomicity through [`Keyspace::transaction`]:
//! the closure runs under the exclusive write lock, so each call is one atomic
//! step. As with a server-side script, writes a failing step already made are
//! not rolled back.

mod expiry;
pub mod pattern;
mod stats;
mod value;


use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use tokio::sync::{broadcast, watch, RwLock};
use tracing::{debug, info, warn};

use crate::error::{CacheError, Result};

pub use expiry::spawn_expiry_task;
pub use stats::KeyspaceStats;
pub use value::{current_timestamp_ms, StoredValue, Value};

/// Topic on which the names of expired keys are published.
pub const EXPIRED_EVENTS_TOPIC: &str = "__keyevent@0__:expired";

/// Buffered messages per topic before slow subscribers start lagging.
const TOPIC_CAPACITY: usize = 4096;

#[derive(Debug, Default)]
struct KeyspaceData {
    entries: HashMap<String, StoredValue>,
    stats: KeyspaceStats,
}

// == Keyspace ==
/// Shared in-process backing store.
#[derive(Debug)]
pub struct Keyspace {
    data: RwLock<KeyspaceData>,
    available: AtomicBool,
    connectivity: watch::Sender<bool>,
    topics: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl Keyspace {
    // == Constructor ==
    /// Creates an empty, available keyspace.
    pub fn new() -> Self {
        let (connectivity, _) = watch::channel(true);
        Self {
            data: RwLock::new(KeyspaceData::default()),
            available: AtomicBool::new(true),
            connectivity,
            topics: Mutex::new(HashMap::new()),
        }
    }

    // == Transaction ==
    /// Runs `f` as one atomic step against the store.
    ///
    /// Fails with [`CacheError::BackendUnavailable`] while connectivity is down.
    /// Messages published by `f` and expirations it observed are delivered after
    /// the step commits.
    pub async fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T>,
    {
        self.ensure_available()?;

        let mut guard = self.data.write().await;
        let mut tx = Transaction {
            data: &mut *guard,
            now: current_timestamp_ms(),
            published: Vec::new(),
            expired: Vec::new(),
        };
        let result = f(&mut tx);
        let Transaction {
            published, expired, ..
        } = tx;

        let total = guard.entries.len();
        guard.stats.set_total_keys(total);
        drop(guard);

        self.deliver(expired, published);
        result
    }

    // == Active Expiration ==
    /// Removes every expired key and publishes an expired event for each.
    ///
    /// Returns the number of keys removed.
    pub async fn purge_expired(&self) -> usize {
        let mut guard = self.data.write().await;
        let now = current_timestamp_ms();
        let expired: Vec<String> = guard
            .entries
            .iter()
            .filter(|(_, stored)| stored.is_expired_at(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            guard.entries.remove(key);
        }
        guard.stats.record_expired(expired.len());
        let total = guard.entries.len();
        guard.stats.set_total_keys(total);
        drop(guard);

        let count = expired.len();
        self.deliver(expired, Vec::new());
        count
    }

    // == Pub/Sub ==
    /// Subscribes to `topic`. Only messages published after this call are received.
    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<String> {
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .subscribe()
    }

    /// Publishes `message` on `topic` outside of a transaction.
    ///
    /// Returns the number of subscribers that received it.
    pub fn publish(&self, topic: &str, message: &str) -> Result<usize> {
        self.ensure_available()?;
        Ok(self.send(topic, message.to_string()))
    }

    // == Availability ==
    /// Returns true while the store can be reached.
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Flips connectivity and notifies every connectivity watcher.
    pub fn set_available(&self, available: bool) {
        let previous = self.available.swap(available, Ordering::SeqCst);
        if previous != available {
            if available {
                info!("Backing store connectivity restored");
            } else {
                warn!("Backing store connectivity lost");
            }
        }
        self.connectivity.send_replace(available);
    }

    /// Returns a receiver that observes connectivity changes.
    pub fn connectivity(&self) -> watch::Receiver<bool> {
        self.connectivity.subscribe()
    }

    // == Stats ==
    /// Returns current keyspace statistics.
    pub async fn stats(&self) -> KeyspaceStats {
        let guard = self.data.read().await;
        let mut stats = guard.stats.clone();
        stats.set_total_keys(guard.entries.len());
        stats
    }

    // == Convenience Reads ==
    pub async fn exists(&self, key: &str) -> Result<bool> {
        self.transaction(|tx| Ok(tx.exists(key))).await
    }

    pub async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        self.transaction(|tx| tx.smembers(key)).await
    }

    pub async fn scard(&self, key: &str) -> Result<usize> {
        self.transaction(|tx| tx.scard(key)).await
    }

    pub async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        self.transaction(|tx| Ok(tx.keys(pattern))).await
    }

    pub async fn ttl_ms(&self, key: &str) -> Result<Option<u64>> {
        self.transaction(|tx| Ok(tx.ttl_ms(key))).await
    }

    fn ensure_available(&self) -> Result<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(CacheError::BackendUnavailable)
        }
    }

    fn deliver(&self, expired: Vec<String>, published: Vec<(String, String)>) {
        if expired.is_empty() && published.is_empty() {
            return;
        }
        // Subscribers are disconnected while the store is unreachable
        if !self.is_available() {
            debug!(
                expired = expired.len(),
                published = published.len(),
                "Dropping notifications while backing store is unavailable"
            );
            return;
        }
        for key in expired {
            self.send(EXPIRED_EVENTS_TOPIC, key);
        }
        for (topic, message) in published {
            self.send(&topic, message);
        }
    }

    fn send(&self, topic: &str, message: String) -> usize {
        let topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        match topics.get(topic) {
            Some(sender) => sender.send(message).unwrap_or(0),
            None => 0,
        }
    }
}

impl Default for Keyspace {
    fn default() -> Self {
        Self::new()
    }
}

// == Transaction ==
/// Command set available inside one atomic step.
pub struct Transaction<'a> {
    data: &'a mut KeyspaceData,
    now: u64,
    published: Vec<(String, String)>,
    expired: Vec<String>,
}

impl<'a> Transaction<'a> {
    /// Timestamp (Unix milliseconds) the step runs at.
    pub fn now(&self) -> u64 {
        self.now
    }

    pub fn exists(&mut self, key: &str) -> bool {
        self.lookup(key).is_some()
    }

    pub fn del<I, S>(&mut self, keys: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut removed = 0;
        for key in keys {
            let key = key.as_ref();
            self.expire_if_needed(key);
            if self.data.entries.remove(key).is_some() {
                removed += 1;
            }
        }
        removed
    }

    // == Expiry ==
    /// Sets the key's time to live in seconds. Returns false if the key is missing.
    pub fn expire(&mut self, key: &str, seconds: u64) -> bool {
        self.pexpire(key, seconds.saturating_mul(1000))
    }

    /// Sets the key's time to live in milliseconds; zero deletes the key.
    pub fn pexpire(&mut self, key: &str, millis: u64) -> bool {
        let expires_at = self.now.saturating_add(millis);
        match self.lookup(key) {
            Some(stored) => {
                stored.expires_at = Some(expires_at);
            }
            None => return false,
        }
        if millis == 0 {
            self.data.entries.remove(key);
        }
        true
    }

    /// Remaining time to live in milliseconds; None for missing or persistent keys.
    pub fn ttl_ms(&mut self, key: &str) -> Option<u64> {
        let now = self.now;
        self.lookup(key).and_then(|stored| stored.ttl_remaining_ms(now))
    }

    // == Strings ==
    pub fn get(&mut self, key: &str) -> Result<Option<String>> {
        match self.lookup(key) {
            None => Ok(None),
            Some(StoredValue {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(other) => Err(wrong_type(key, "string", other.value.kind())),
        }
    }

    /// Sets a string only if the key does not exist, expiring after `millis`.
    pub fn set_nx_px(&mut self, key: &str, value: &str, millis: u64) -> bool {
        if self.exists(key) {
            return false;
        }
        self.data.entries.insert(
            key.to_string(),
            StoredValue {
                value: Value::Str(value.to_string()),
                expires_at: Some(self.now.saturating_add(millis)),
            },
        );
        true
    }

    // == Hashes ==
    /// Writes every field, creating the hash if needed. Existing expiry is kept.
    pub fn hset_all<I>(&mut self, key: &str, fields: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.expire_if_needed(key);
        let stored = self
            .data
            .entries
            .entry(key.to_string())
            .or_insert_with(|| StoredValue::new(Value::Hash(HashMap::new())));
        match &mut stored.value {
            Value::Hash(map) => {
                map.extend(fields);
            }
            other => return Err(wrong_type(key, "hash", other.kind())),
        }
        self.drop_if_empty(key);
        Ok(())
    }

    pub fn hget(&mut self, key: &str, field: &str) -> Result<Option<String>> {
        match self.lookup(key) {
            None => Ok(None),
            Some(StoredValue {
                value: Value::Hash(map),
                ..
            }) => Ok(map.get(field).cloned()),
            Some(other) => Err(wrong_type(key, "hash", other.value.kind())),
        }
    }

    pub fn hgetall(&mut self, key: &str) -> Result<HashMap<String, String>> {
        match self.lookup(key) {
            None => Ok(HashMap::new()),
            Some(StoredValue {
                value: Value::Hash(map),
                ..
            }) => Ok(map.clone()),
            Some(other) => Err(wrong_type(key, "hash", other.value.kind())),
        }
    }

    /// Adds `delta` to an integer field, creating hash and field as needed.
    pub fn hincr_by(&mut self, key: &str, field: &str, delta: i64) -> Result<i64> {
        self.expire_if_needed(key);
        let stored = self
            .data
            .entries
            .entry(key.to_string())
            .or_insert_with(|| StoredValue::new(Value::Hash(HashMap::new())));
        let map = match &mut stored.value {
            Value::Hash(map) => map,
            other => return Err(wrong_type(key, "hash", other.kind())),
        };
        let current = match map.get(field) {
            Some(raw) => raw.parse::<i64>().map_err(|_| {
                CacheError::Operation(format!("hash value {}.{} is not an integer", key, field))
            })?,
            None => 0,
        };
        let next = current.saturating_add(delta);
        map.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    // == Sets ==
    pub fn sadd<I, S>(&mut self, key: &str, members: I) -> Result<usize>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.expire_if_needed(key);
        let stored = self
            .data
            .entries
            .entry(key.to_string())
            .or_insert_with(|| StoredValue::new(Value::Set(HashSet::new())));
        let added = match &mut stored.value {
            Value::Set(set) => {
                let mut added = 0;
                for member in members {
                    if set.insert(member.into()) {
                        added += 1;
                    }
                }
                added
            }
            other => return Err(wrong_type(key, "set", other.kind())),
        };
        self.drop_if_empty(key);
        Ok(added)
    }

    /// Removes members; the set is deleted once it becomes empty.
    pub fn srem<I, S>(&mut self, key: &str, members: I) -> Result<usize>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let removed = match self.set_ref(key)? {
            Some(set) => members
                .into_iter()
                .filter(|member| set.remove(member.as_ref()))
                .count(),
            None => 0,
        };
        self.drop_if_empty(key);
        Ok(removed)
    }

    /// Removes and returns up to `count` arbitrary members.
    pub fn spop(&mut self, key: &str, count: usize) -> Result<Vec<String>> {
        let popped = match self.set_ref(key)? {
            Some(set) => {
                let picked: Vec<String> = set.iter().take(count).cloned().collect();
                for member in &picked {
                    set.remove(member);
                }
                picked
            }
            None => Vec::new(),
        };
        self.drop_if_empty(key);
        Ok(popped)
    }

    pub fn sismember(&mut self, key: &str, member: &str) -> Result<bool> {
        Ok(self
            .set_ref(key)?
            .map(|set| set.contains(member))
            .unwrap_or(false))
    }

    pub fn smembers(&mut self, key: &str) -> Result<Vec<String>> {
        Ok(self
            .set_ref(key)?
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    pub fn scard(&mut self, key: &str) -> Result<usize> {
        Ok(self.set_ref(key)?.map(|set| set.len()).unwrap_or(0))
    }

    /// Returns the members matching a glob pattern.
    pub fn sscan_match(&mut self, key: &str, glob: &str) -> Result<Vec<String>> {
        Ok(self
            .set_ref(key)?
            .map(|set| {
                set.iter()
                    .filter(|member| pattern::matches(glob, member))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Returns the members starting with `prefix`.
    pub fn sscan_prefix(&mut self, key: &str, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .set_ref(key)?
            .map(|set| {
                set.iter()
                    .filter(|member| member.starts_with(prefix))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    // == Keys ==
    /// Returns every live key matching a glob pattern, sorted.
    pub fn keys(&mut self, glob: &str) -> Vec<String> {
        let now = self.now;
        let expired: Vec<String> = self
            .data
            .entries
            .iter()
            .filter(|(_, stored)| stored.is_expired_at(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            self.expire_if_needed(&key);
        }

        let mut keys: Vec<String> = self
            .data
            .entries
            .keys()
            .filter(|key| pattern::matches(glob, key))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    // == Pub/Sub ==
    /// Queues a message, delivered once the step commits.
    pub fn publish(&mut self, topic: &str, message: &str) {
        self.published.push((topic.to_string(), message.to_string()));
    }

    // == Stats ==
    pub fn record_hit(&mut self) {
        self.data.stats.record_hit();
    }

    pub fn record_miss(&mut self) {
        self.data.stats.record_miss();
    }

    fn lookup(&mut self, key: &str) -> Option<&mut StoredValue> {
        self.expire_if_needed(key);
        self.data.entries.get_mut(key)
    }

    fn set_ref(&mut self, key: &str) -> Result<Option<&mut HashSet<String>>> {
        match self.lookup(key) {
            None => Ok(None),
            Some(StoredValue {
                value: Value::Set(set),
                ..
            }) => Ok(Some(set)),
            Some(other) => Err(wrong_type(key, "set", other.value.kind())),
        }
    }

    fn expire_if_needed(&mut self, key: &str) {
        let now = self.now;
        let expired = self
            .data
            .entries
            .get(key)
            .map(|stored| stored.is_expired_at(now))
            .unwrap_or(false);
        if expired {
            self.data.entries.remove(key);
            self.data.stats.record_expired(1);
            self.expired.push(key.to_string());
        }
    }

    fn drop_if_empty(&mut self, key: &str) {
        let empty = self
            .data
            .entries
            .get(key)
            .map(|stored| stored.value.is_empty_collection())
            .unwrap_or(false);
        if empty {
            self.data.entries.remove(key);
        }
    }
}

fn wrong_type(key: &str, expected: &str, found: &str) -> CacheError {
    CacheError::Operation(format!(
        "WRONGTYPE {} holds a {} value, expected {}",
        key, found, expected
    ))
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_hash_write_and_increment() {
        let keyspace = Keyspace::new();

        keyspace
            .transaction(|tx| {
                tx.hset_all(
                    "entry",
                    vec![
                        ("data".to_string(), "\"v\"".to_string()),
                        ("readCount".to_string(), "0".to_string()),
                    ],
                )?;
                tx.hincr_by("entry", "readCount", 1)
            })
            .await
            .unwrap();

        let read_count = keyspace
            .transaction(|tx| tx.hget("entry", "readCount"))
            .await
            .unwrap();
        assert_eq!(read_count.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_wrong_type_fails_step() {
        let keyspace = Keyspace::new();
        keyspace
            .transaction(|tx| tx.sadd("bucket", ["k1"]))
            .await
            .unwrap();

        let result = keyspace.transaction(|tx| tx.hget("bucket", "data")).await;
        assert!(matches!(result, Err(CacheError::Operation(_))));
    }

    #[tokio::test]
    async fn test_empty_set_is_removed() {
        let keyspace = Keyspace::new();
        keyspace
            .transaction(|tx| tx.sadd("bucket", ["k1", "k2"]))
            .await
            .unwrap();

        let removed = keyspace
            .transaction(|tx| tx.srem("bucket", ["k1", "k2", "k3"]))
            .await
            .unwrap();

        assert_eq!(removed, 2);
        assert!(!keyspace.exists("bucket").await.unwrap());
    }

    #[tokio::test]
    async fn test_sadd_with_no_members_creates_nothing() {
        let keyspace = Keyspace::new();
        let added = keyspace
            .transaction(|tx| tx.sadd("bucket", Vec::<String>::new()))
            .await
            .unwrap();

        assert_eq!(added, 0);
        assert!(!keyspace.exists("bucket").await.unwrap());
    }

    #[tokio::test]
    async fn test_spop_bounded() {
        let keyspace = Keyspace::new();
        keyspace
            .transaction(|tx| tx.sadd("bucket", ["a", "b", "c"]))
            .await
            .unwrap();

        let popped = keyspace
            .transaction(|tx| tx.spop("bucket", 2))
            .await
            .unwrap();
        assert_eq!(popped.len(), 2);
        assert_eq!(keyspace.scard("bucket").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_lazy_expiration_publishes_event() {
        let keyspace = Keyspace::new();
        let mut events = keyspace.subscribe(EXPIRED_EVENTS_TOPIC);

        keyspace
            .transaction(|tx| {
                tx.hset_all("entry", vec![("data".to_string(), "1".to_string())])?;
                Ok(tx.pexpire("entry", 50))
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(!keyspace.exists("entry").await.unwrap());
        assert_eq!(events.recv().await.unwrap(), "entry");
        assert_eq!(keyspace.stats().await.expired, 1);
    }

    #[tokio::test]
    async fn test_set_nx_px() {
        let keyspace = Keyspace::new();

        let first = keyspace
            .transaction(|tx| Ok(tx.set_nx_px("lock", "a", 10_000)))
            .await
            .unwrap();
        let second = keyspace
            .transaction(|tx| Ok(tx.set_nx_px("lock", "b", 10_000)))
            .await
            .unwrap();

        assert!(first);
        assert!(!second);
        let ttl = keyspace.ttl_ms("lock").await.unwrap().unwrap();
        assert!(ttl <= 10_000 && ttl > 9_000);
    }

    #[tokio::test]
    async fn test_keys_pattern_sorted() {
        let keyspace = Keyspace::new();
        keyspace
            .transaction(|tx| {
                tx.sadd("BUCKET.dev.app.b", ["k"])?;
                tx.sadd("BUCKET.dev.app.a", ["k"])?;
                tx.sadd("BUCKET.prod.app.a", ["k"])?;
                Ok(())
            })
            .await
            .unwrap();

        let keys = keyspace.keys("BUCKET.dev.*").await.unwrap();
        assert_eq!(keys, vec!["BUCKET.dev.app.a", "BUCKET.dev.app.b"]);
    }

    #[tokio::test]
    async fn test_publish_delivered_after_commit() {
        let keyspace = Keyspace::new();
        let mut rx = keyspace.subscribe("dev:bucket_del");

        keyspace
            .transaction(|tx| {
                tx.publish("dev:bucket_del", "BUCKET.dev.app.users");
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap(), "BUCKET.dev.app.users");
    }

    #[tokio::test]
    async fn test_unavailable_store_rejects_steps() {
        let keyspace = Keyspace::new();
        let mut connectivity = keyspace.connectivity();

        keyspace.set_available(false);
        let result = keyspace.transaction(|tx| Ok(tx.exists("k"))).await;
        assert!(matches!(result, Err(CacheError::BackendUnavailable)));
        assert!(keyspace.publish("topic", "m").is_err());

        connectivity.changed().await.unwrap();
        assert!(!*connectivity.borrow());

        keyspace.set_available(true);
        assert!(keyspace.exists("k").await.is_ok());
    }

    #[tokio::test]
    async fn test_purge_expired_counts() {
        let keyspace = Keyspace::new();
        keyspace
            .transaction(|tx| {
                tx.hset_all("short", vec![("data".to_string(), "1".to_string())])?;
                tx.pexpire("short", 20);
                tx.hset_all("long", vec![("data".to_string(), "1".to_string())])?;
                tx.pexpire("long", 60_000);
                Ok(())
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(keyspace.purge_expired().await, 1);
        assert!(keyspace.exists("long").await.unwrap());
        assert_eq!(keyspace.stats().await.total_keys, 1);
    }
}

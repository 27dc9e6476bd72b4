//! Storage Engine
//!
//! Entry reads and writes, bucket membership, the GLOBAL reverse index and
//! purge-by-bucket, on top of the shared keyspace.
//!
//! Every multi-key mutation is one [`Keyspace::transaction`]. Purges work in
//! bounded chunks: each chunk is atomic, the purge as a whole is not.
//!
//! The engine fails open. While the backend is unavailable, or a step fails,
//! `get` reports a miss and `set`/`purge_buckets` report failure. Only
//! argument validation errors reach the caller.

mod entry;
mod reconcile;

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{CacheError, Result};
use crate::keyspace::Keyspace;
use crate::lease::LEASE_KEY_PREFIX;
use crate::naming::{BucketNamespace, BucketTarget, BUCKET_KEY_PREFIX};
use crate::notify::NotificationChannel;

pub use entry::{CacheEntry, GlobalTuple, Provenance};
pub use reconcile::EXPIRED_KEYS_PER_STEP;

/// Top-level arrays or objects larger than this are reported when cached.
const LARGE_VALUE_ELEMENTS: usize = 1000;

// == Engine Settings ==
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// When false every call fails open
    pub enabled: bool,
    /// Member keys deleted per atomic step when purging a bucket
    pub purge_batch_size: usize,
    /// GLOBAL tuples rewritten per atomic step when reconciling a deleted bucket
    pub global_batch_size: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            purge_batch_size: 2_000,
            global_batch_size: 2_000,
        }
    }
}

impl From<&Config> for EngineSettings {
    fn from(config: &Config) -> Self {
        Self {
            enabled: config.cache_enabled,
            purge_batch_size: config.purge_batch_size,
            global_batch_size: config.global_purge_batch_size,
        }
    }
}

#[derive(Debug)]
enum PurgeStep {
    Missing,
    More,
    Deleted,
}

// == Storage Engine ==
/// Bucket-indexed cache storage for one application.
#[derive(Debug, Clone)]
pub struct StorageEngine {
    keyspace: Arc<Keyspace>,
    namespace: BucketNamespace,
    notifications: NotificationChannel,
    settings: EngineSettings,
}

impl StorageEngine {
    // == Constructor ==
    pub fn new(keyspace: Arc<Keyspace>, namespace: BucketNamespace, settings: EngineSettings) -> Self {
        let notifications = NotificationChannel::new(keyspace.clone(), namespace.env());
        let settings = EngineSettings {
            purge_batch_size: settings.purge_batch_size.max(1),
            global_batch_size: settings.global_batch_size.max(1),
            ..settings
        };
        Self {
            keyspace,
            namespace,
            notifications,
            settings,
        }
    }

    pub fn from_config(keyspace: Arc<Keyspace>, config: &Config) -> Self {
        let namespace = BucketNamespace::new(&config.environment, &config.app_name);
        Self::new(keyspace, namespace, EngineSettings::from(config))
    }

    pub fn keyspace(&self) -> &Arc<Keyspace> {
        &self.keyspace
    }

    pub fn namespace(&self) -> &BucketNamespace {
        &self.namespace
    }

    pub fn notifications(&self) -> &NotificationChannel {
        &self.notifications
    }

    /// True when the engine is enabled and the backend reachable.
    pub fn is_online(&self) -> bool {
        self.settings.enabled && self.keyspace.is_available()
    }

    // == Get ==
    /// Returns the serialized value stored under `key`, or None on a miss.
    ///
    /// A hit increments the entry's read count and resets its expiry to the
    /// stored ttl, so read traffic keeps hot entries alive.
    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        validate_key(key)?;
        if !self.is_online() {
            return Ok(None);
        }

        let result = self
            .keyspace
            .transaction(|tx| {
                if !tx.exists(key) {
                    tx.record_miss();
                    return Ok(None);
                }
                tx.hincr_by(key, entry::FIELD_READ_COUNT, 1)?;
                let data = tx.hget(key, entry::FIELD_DATA)?;
                let ttl = tx
                    .hget(key, entry::FIELD_TTL)?
                    .and_then(|raw| raw.parse::<u64>().ok());
                if let Some(ttl) = ttl {
                    tx.expire(key, ttl);
                }
                tx.record_hit();
                Ok(data)
            })
            .await;

        match result {
            Ok(data) => Ok(data),
            Err(error) => fail_open("get", error, None),
        }
    }

    /// Reads the full entry record without touching its read count or expiry.
    pub async fn inspect(&self, key: &str) -> Result<Option<CacheEntry>> {
        validate_key(key)?;
        let fields = self.keyspace.transaction(|tx| tx.hgetall(key)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        CacheEntry::from_fields(key, &fields).map(Some)
    }

    // == Set ==
    /// Writes `value` under `key` for `ttl` seconds and indexes it in `buckets`.
    ///
    /// In one atomic step: writes the entry fields, sets the expiry, adds the
    /// key's tuple to GLOBAL and the key to each named bucket. Tuples left by
    /// an earlier write of the same key with other buckets are replaced.
    pub async fn set<V>(
        &self,
        key: &str,
        value: &V,
        ttl: u64,
        buckets: &[String],
        provenance: &Provenance,
    ) -> Result<bool>
    where
        V: Serialize + ?Sized,
    {
        validate_key(key)?;
        if ttl == 0 {
            return Err(CacheError::Validation(
                "ttl must be greater than zero".to_string(),
            ));
        }
        let buckets = self.namespace.resolve_for_set(buckets)?;

        let payload = match serde_json::to_value(value) {
            Ok(payload) => payload,
            Err(error) => return fail_open("set", error.into(), false),
        };
        warn_on_large_value(key, &payload);

        if !self.is_online() {
            return Ok(false);
        }

        let short_names: Vec<String> = buckets.iter().map(ToString::to_string).collect();
        let bucket_keys: Vec<String> = buckets
            .iter()
            .map(|bucket| self.namespace.bucket_key(bucket))
            .collect();
        let entry = CacheEntry::new(key, payload.to_string(), ttl, provenance.clone());
        let global = self.namespace.global_key();

        let encoded = GlobalTuple::new(key, short_names.clone())
            .encode()
            .and_then(|tuple| Ok((tuple, GlobalTuple::key_prefix(key)?)));
        let (tuple, prefix) = match encoded {
            Ok(encoded) => encoded,
            Err(error) => return fail_open("set", error, false),
        };

        let result = self
            .keyspace
            .transaction(|tx| {
                for stale in tx.sscan_prefix(&global, &prefix)? {
                    if stale == tuple {
                        continue;
                    }
                    if let Ok(previous) = GlobalTuple::decode(&stale) {
                        for short in previous.buckets.iter().filter(|b| !short_names.contains(b)) {
                            tx.srem(&self.namespace.bucket_key_for_short(short), [key])?;
                        }
                    }
                    tx.srem(&global, [stale.as_str()])?;
                }

                tx.hset_all(key, entry.to_fields())?;
                tx.expire(key, ttl);
                tx.sadd(&global, [tuple.as_str()])?;
                for bucket_key in &bucket_keys {
                    tx.sadd(bucket_key, [key])?;
                }
                Ok(true)
            })
            .await;

        match result {
            Ok(stored) => {
                debug!(key, ttl, buckets = ?short_names, "Cached value");
                Ok(stored)
            }
            Err(error) => fail_open("set", error, false),
        }
    }

    // == Purge Buckets ==
    /// Deletes every entry in the named buckets, then the buckets themselves.
    ///
    /// Names may be wildcards and may be qualified with another application.
    /// Each deleted bucket is announced on the notification channel; GLOBAL
    /// cleanup for the deleted keys happens when that announcement is
    /// reconciled.
    pub async fn purge_buckets(&self, buckets: &[String]) -> Result<bool> {
        let targets = self.namespace.resolve_for_purge(buckets)?;
        if targets.is_empty() {
            return Ok(true);
        }
        if !self.is_online() {
            return Ok(false);
        }

        match self.purge_targets(&targets).await {
            Ok(deleted) => {
                info!(buckets = ?buckets, deleted, "Purged buckets");
                Ok(true)
            }
            Err(error) => fail_open("purge_buckets", error, false),
        }
    }

    async fn purge_targets(&self, targets: &[BucketTarget]) -> Result<usize> {
        let bucket_keys = self
            .keyspace
            .transaction(|tx| {
                let mut keys: Vec<String> = Vec::new();
                for target in targets {
                    let expanded = match target {
                        BucketTarget::Key(key) => vec![key.clone()],
                        BucketTarget::Pattern(pattern) => tx.keys(pattern),
                    };
                    for key in expanded {
                        if !BucketNamespace::is_global_key(&key) && !keys.contains(&key) {
                            keys.push(key);
                        }
                    }
                }
                Ok(keys)
            })
            .await?;

        let mut deleted = 0;
        for bucket_key in &bucket_keys {
            if self.purge_bucket(bucket_key).await? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Empties one bucket chunk by chunk. Returns true if this call deleted it.
    async fn purge_bucket(&self, bucket_key: &str) -> Result<bool> {
        let batch = self.settings.purge_batch_size;
        loop {
            let step = self
                .keyspace
                .transaction(|tx| {
                    if !tx.exists(bucket_key) {
                        return Ok(PurgeStep::Missing);
                    }
                    let members = tx.spop(bucket_key, batch)?;
                    tx.del(&members);
                    if tx.exists(bucket_key) {
                        return Ok(PurgeStep::More);
                    }
                    self.notifications.publish_bucket_deleted_in(tx, bucket_key);
                    Ok(PurgeStep::Deleted)
                })
                .await?;

            match step {
                PurgeStep::More => continue,
                PurgeStep::Deleted => return Ok(true),
                PurgeStep::Missing => return Ok(false),
            }
        }
    }
}

/// Keys must be non-empty and must not collide with bucket or lease keys.
fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(CacheError::Validation("Invalid key format!".to_string()));
    }
    if is_internal_key(key) {
        return Err(CacheError::Validation(format!(
            "Key uses a reserved prefix: {}",
            key
        )));
    }
    Ok(())
}

fn is_internal_key(key: &str) -> bool {
    key.starts_with(BUCKET_KEY_PREFIX) || key.starts_with(LEASE_KEY_PREFIX)
}

fn fail_open<T>(operation: &str, error: CacheError, fallback: T) -> Result<T> {
    if error.is_validation() {
        return Err(error);
    }
    match error {
        CacheError::BackendUnavailable => {
            debug!(operation, "Backend unavailable, failing open");
            Ok(fallback)
        }
        other => {
            warn!(operation, error = %other, "Cache operation failed");
            Ok(fallback)
        }
    }
}

fn warn_on_large_value(key: &str, payload: &serde_json::Value) {
    match payload {
        serde_json::Value::Null => warn!(key, "Saving null"),
        serde_json::Value::Array(items) if items.len() > LARGE_VALUE_ELEMENTS => {
            warn!(key, elements = items.len(), "Possible large object being saved")
        }
        serde_json::Value::Object(fields) if fields.len() > LARGE_VALUE_ELEMENTS => {
            warn!(key, elements = fields.len(), "Possible large object being saved")
        }
        _ => {}
    }
}

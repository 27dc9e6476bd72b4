//! Reverse Index Reconciliation
//!
//! Cleans up GLOBAL tuples and named bucket memberships after keys vanish
//! without a purge (passive expiry) and after buckets are deleted.

use tracing::debug;

use super::entry::GlobalTuple;
use super::{is_internal_key, StorageEngine};
use crate::error::Result;
use crate::keyspace::pattern;
use crate::naming::BucketNamespace;

/// Expired keys reconciled per atomic step.
pub const EXPIRED_KEYS_PER_STEP: usize = 20;

impl StorageEngine {
    // == Expired Keys ==
    /// Reconciles one passively expired key.
    pub async fn reconcile_expired_key(&self, key: &str) -> Result<usize> {
        self.reconcile_expired_keys(&[key.to_string()]).await
    }

    /// Removes each expired key from the named buckets listed in its GLOBAL
    /// tuple, then drops the tuple.
    ///
    /// Keys are handled [`EXPIRED_KEYS_PER_STEP`] at a time, one atomic step
    /// per chunk. Keys that are live again and internal keys are skipped.
    /// Returns the number of tuples removed.
    pub async fn reconcile_expired_keys(&self, keys: &[String]) -> Result<usize> {
        let candidates = keys
            .iter()
            .filter(|key| !key.is_empty() && !is_internal_key(key))
            .map(|key| Ok((key.as_str(), GlobalTuple::key_prefix(key)?)))
            .collect::<Result<Vec<_>>>()?;
        if candidates.is_empty() {
            return Ok(0);
        }

        let global = self.namespace.global_key();
        let mut removed = 0;
        for chunk in candidates.chunks(EXPIRED_KEYS_PER_STEP) {
            removed += self
                .keyspace
                .transaction(|tx| {
                    let mut removed = 0;
                    for (key, prefix) in chunk {
                        if tx.exists(key) {
                            continue;
                        }
                        for raw in tx.sscan_prefix(&global, prefix)? {
                            if let Ok(tuple) = GlobalTuple::decode(&raw) {
                                for short in &tuple.buckets {
                                    tx.srem(&self.namespace.bucket_key_for_short(short), [*key])?;
                                }
                            }
                            removed += tx.srem(&global, [raw.as_str()])?;
                        }
                    }
                    Ok(removed)
                })
                .await?;
        }

        if removed > 0 {
            debug!(keys = keys.len(), removed, "Reconciled expired keys");
        }
        Ok(removed)
    }

    // == Deleted Buckets ==
    /// Strips a deleted bucket from every GLOBAL tuple that references it.
    ///
    /// A tuple whose key is gone is dropped, and the key is removed from the
    /// tuple's remaining buckets. A tuple whose key is still live is
    /// republished without the bucket. Tuples are rewritten in chunks of the
    /// GLOBAL batch size. Returns the number of tuples touched.
    pub async fn reconcile_deleted_bucket(&self, bucket_key: &str) -> Result<usize> {
        if BucketNamespace::is_global_key(bucket_key) {
            return Ok(0);
        }
        let short = match self.namespace.short_name(bucket_key) {
            Some(short) if !short.is_empty() => short.to_string(),
            _ => return Ok(0),
        };

        let global = self.namespace.global_key();
        let glob = format!("*{}*", pattern::escape(&serde_json::to_string(&short)?));
        let candidates = self
            .keyspace
            .transaction(|tx| tx.sscan_match(&global, &glob))
            .await?;

        let mut touched = 0;
        for chunk in candidates.chunks(self.settings.global_batch_size) {
            touched += self
                .keyspace
                .transaction(|tx| {
                    let mut touched = 0;
                    for raw in chunk {
                        let tuple = match GlobalTuple::decode(raw) {
                            Ok(tuple) if tuple.references(&short) => tuple,
                            _ => continue,
                        };
                        if !tx.sismember(&global, raw)? || tx.sismember(bucket_key, &tuple.key)? {
                            continue;
                        }

                        tx.srem(&global, [raw.as_str()])?;
                        let remaining: Vec<String> = tuple
                            .buckets
                            .iter()
                            .filter(|bucket| **bucket != short)
                            .cloned()
                            .collect();
                        if tx.exists(&tuple.key) {
                            let republished = GlobalTuple::new(&tuple.key, remaining).encode()?;
                            tx.sadd(&global, [republished])?;
                        } else {
                            for other in &remaining {
                                tx.srem(
                                    &self.namespace.bucket_key_for_short(other),
                                    [tuple.key.as_str()],
                                )?;
                            }
                        }
                        touched += 1;
                    }
                    Ok(touched)
                })
                .await?;
        }

        debug!(bucket = bucket_key, touched, "Reconciled deleted bucket");
        Ok(touched)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::engine::{EngineSettings, Provenance, StorageEngine};
    use crate::keyspace::Keyspace;
    use crate::naming::BucketNamespace;

    fn engine_for(keyspace: Arc<Keyspace>, app: &str) -> StorageEngine {
        StorageEngine::new(
            keyspace,
            BucketNamespace::new("dev", app),
            EngineSettings {
                global_batch_size: 2,
                ..EngineSettings::default()
            },
        )
    }

    fn engine() -> StorageEngine {
        engine_for(Arc::new(Keyspace::new()), "shop")
    }

    fn buckets(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    fn provenance() -> Provenance {
        Provenance::new("Users", "find")
    }

    #[tokio::test]
    async fn test_expired_key_leaves_buckets_and_global() {
        let engine = engine();
        engine
            .set("k1", "v1", 1, &buckets(&["A", "B"]), &provenance())
            .await
            .unwrap();
        engine
            .set("k2", "v2", 60, &buckets(&["B"]), &provenance())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(engine.get("k1").await.unwrap(), None);

        assert_eq!(engine.reconcile_expired_key("k1").await.unwrap(), 1);

        let keyspace = engine.keyspace();
        assert!(!keyspace.exists("BUCKET.dev.shop.A").await.unwrap());
        assert_eq!(keyspace.smembers("BUCKET.dev.shop.B").await.unwrap(), vec!["k2"]);
        assert_eq!(
            keyspace.smembers("BUCKET.dev.shop.GLOBAL").await.unwrap(),
            vec![r#"{"key":"k2","buckets":["shop.B"]}"#]
        );
    }

    #[tokio::test]
    async fn test_last_tuple_removes_global() {
        let engine = engine();
        engine.set("k1", "v1", 1, &[], &provenance()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1100)).await;
        engine.reconcile_expired_key("k1").await.unwrap();

        assert!(!engine.keyspace().exists("BUCKET.dev.shop.GLOBAL").await.unwrap());
    }

    #[tokio::test]
    async fn test_live_and_internal_keys_are_skipped() {
        let engine = engine();
        engine
            .set("k1", "v1", 60, &buckets(&["A"]), &provenance())
            .await
            .unwrap();

        let removed = engine
            .reconcile_expired_keys(&buckets(&["k1", "BUCKET.dev.shop.A", "LOCK.dev.gc_lock", ""]))
            .await
            .unwrap();

        assert_eq!(removed, 0);
        assert_eq!(
            engine.keyspace().smembers("BUCKET.dev.shop.A").await.unwrap(),
            vec!["k1"]
        );
    }

    #[tokio::test]
    async fn test_expired_keys_reconciled_across_chunks() {
        let engine = engine();
        let keys: Vec<String> = (0..45).map(|i| format!("k{}", i)).collect();
        for key in &keys {
            engine
                .set(key, "v", 1, &buckets(&["A"]), &provenance())
                .await
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(1100)).await;
        engine.keyspace().purge_expired().await;

        assert_eq!(engine.reconcile_expired_keys(&keys).await.unwrap(), 45);
        assert!(!engine.keyspace().exists("BUCKET.dev.shop.A").await.unwrap());
        assert!(!engine.keyspace().exists("BUCKET.dev.shop.GLOBAL").await.unwrap());
    }

    #[tokio::test]
    async fn test_purge_converges_after_bucket_reconciliation() {
        let engine = engine();
        engine
            .set("k1", "v1", 5, &buckets(&["A", "B"]), &provenance())
            .await
            .unwrap();
        assert_eq!(engine.get("k1").await.unwrap().as_deref(), Some("\"v1\""));

        assert!(engine.purge_buckets(&buckets(&["A"])).await.unwrap());
        engine.reconcile_deleted_bucket("BUCKET.dev.shop.A").await.unwrap();

        let keyspace = engine.keyspace();
        assert_eq!(engine.get("k1").await.unwrap(), None);
        assert!(!keyspace.exists("BUCKET.dev.shop.B").await.unwrap());
        assert!(!keyspace.exists("BUCKET.dev.shop.GLOBAL").await.unwrap());
    }

    #[tokio::test]
    async fn test_live_key_tuple_is_republished_without_bucket() {
        let engine = engine();
        for i in 0..5 {
            engine
                .set(&format!("k{}", i), "v", 60, &buckets(&["A", "B"]), &provenance())
                .await
                .unwrap();
        }
        // The bucket vanishes while its keys stay live
        engine
            .keyspace()
            .transaction(|tx| Ok(tx.del(["BUCKET.dev.shop.A"])))
            .await
            .unwrap();

        let touched = engine
            .reconcile_deleted_bucket("BUCKET.dev.shop.A")
            .await
            .unwrap();

        assert_eq!(touched, 5);
        let mut tuples = engine
            .keyspace()
            .smembers("BUCKET.dev.shop.GLOBAL")
            .await
            .unwrap();
        tuples.sort();
        assert_eq!(tuples.len(), 5);
        assert_eq!(tuples[0], r#"{"key":"k0","buckets":["shop.B"]}"#);
        assert_eq!(engine.keyspace().scard("BUCKET.dev.shop.B").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_similar_bucket_names_are_untouched() {
        let engine = engine();
        engine
            .set("k1", "v", 60, &buckets(&["users", "users_v2"]), &provenance())
            .await
            .unwrap();
        engine
            .keyspace()
            .transaction(|tx| Ok(tx.del(["BUCKET.dev.shop.users"])))
            .await
            .unwrap();

        engine
            .reconcile_deleted_bucket("BUCKET.dev.shop.users")
            .await
            .unwrap();

        assert_eq!(
            engine.keyspace().smembers("BUCKET.dev.shop.GLOBAL").await.unwrap(),
            vec![r#"{"key":"k1","buckets":["shop.users_v2"]}"#]
        );
    }

    #[tokio::test]
    async fn test_wildcard_purge_leaves_no_tuples_for_app() {
        let keyspace = Arc::new(Keyspace::new());
        let shop = engine_for(keyspace.clone(), "shop");
        let mut subscription = shop.notifications().subscribe();

        shop.set("k1", "v", 60, &buckets(&["A"]), &provenance()).await.unwrap();
        shop.set("k2", "v", 60, &buckets(&["A", "B"]), &provenance()).await.unwrap();
        shop.set("k3", "v", 60, &buckets(&["C"]), &provenance()).await.unwrap();

        assert!(shop.purge_buckets(&buckets(&["*"])).await.unwrap());

        for _ in 0..3 {
            match subscription.recv().await {
                Some(crate::notify::Notification::BucketDeleted(bucket)) => {
                    shop.reconcile_deleted_bucket(&bucket).await.unwrap();
                }
                other => panic!("Unexpected notification: {:?}", other),
            }
        }

        assert!(!keyspace.exists("BUCKET.dev.shop.GLOBAL").await.unwrap());
        assert!(keyspace.keys("BUCKET.dev.shop.*").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_recreated_bucket_keeps_its_members() {
        let engine = engine();
        engine
            .set("k1", "v", 60, &buckets(&["A"]), &provenance())
            .await
            .unwrap();

        // Notification arrives after the bucket was written again
        let touched = engine
            .reconcile_deleted_bucket("BUCKET.dev.shop.A")
            .await
            .unwrap();

        assert_eq!(touched, 0);
        assert_eq!(
            engine.keyspace().smembers("BUCKET.dev.shop.GLOBAL").await.unwrap(),
            vec![r#"{"key":"k1","buckets":["shop.A"]}"#]
        );
    }

    #[tokio::test]
    async fn test_other_environment_and_global_are_ignored() {
        let engine = engine();

        assert_eq!(
            engine.reconcile_deleted_bucket("BUCKET.prod.shop.A").await.unwrap(),
            0
        );
        assert_eq!(
            engine
                .reconcile_deleted_bucket("BUCKET.dev.shop.GLOBAL")
                .await
                .unwrap(),
            0
        );
    }
}

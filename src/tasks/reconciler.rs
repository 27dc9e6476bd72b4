//! Reconciler Task
//!
//! Background task that reacts to notifications: expired keys are removed
//! from their buckets and GLOBAL tuples, deleted buckets are stripped from
//! GLOBAL tuples.

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::{StorageEngine, EXPIRED_KEYS_PER_STEP};
use crate::error::{CacheError, Result};
use crate::notify::{Notification, Subscription};

/// Spawns a background task that reconciles every notification it receives.
///
/// Expired keys already queued behind the first one are reconciled together,
/// up to one atomic step's worth. The task ends when the notification
/// channel closes.
///
/// # Arguments
/// * `engine` - engine whose GLOBAL index is kept consistent
/// * `subscription` - subscription taken before any writes that must be seen
///
/// # Returns
/// A JoinHandle for the spawned task, which can be aborted during shutdown.
pub fn spawn_reconciler(engine: StorageEngine, mut subscription: Subscription) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            app = engine.namespace().app(),
            topic = engine.notifications().topic(),
            "Starting reconciler task"
        );

        while let Some(notification) = subscription.recv().await {
            match notification {
                Notification::KeyExpired(key) => {
                    let mut keys = vec![key];
                    keys.extend(subscription.drain_expired(EXPIRED_KEYS_PER_STEP - 1));
                    log_outcome("expired keys", engine.reconcile_expired_keys(&keys).await);
                }
                Notification::BucketDeleted(bucket) => {
                    log_outcome(&bucket, engine.reconcile_deleted_bucket(&bucket).await);
                }
            }
        }

        info!("Notification channel closed, reconciler stopping");
    })
}

fn log_outcome(subject: &str, outcome: Result<usize>) {
    match outcome {
        Ok(_) => {}
        Err(CacheError::BackendUnavailable) => {
            debug!(subject, "Backend unavailable, reconciliation skipped");
        }
        Err(error) => warn!(subject, error = %error, "Reconciliation failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::engine::{EngineSettings, Provenance};
    use crate::keyspace::{spawn_expiry_task, Keyspace};
    use crate::naming::BucketNamespace;

    fn engine() -> StorageEngine {
        StorageEngine::new(
            Arc::new(Keyspace::new()),
            BucketNamespace::new("dev", "shop"),
            EngineSettings::default(),
        )
    }

    fn buckets(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    async fn wait_until_absent(engine: &StorageEngine, key: &str) -> bool {
        for _ in 0..50 {
            if !engine.keyspace().exists(key).await.unwrap() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_purge_converges_through_reconciler() {
        let engine = engine();
        let handle = spawn_reconciler(engine.clone(), engine.notifications().subscribe());

        engine
            .set("k1", "v1", 60, &buckets(&["A", "B"]), &Provenance::default())
            .await
            .unwrap();
        assert!(engine.purge_buckets(&buckets(&["A"])).await.unwrap());

        assert!(wait_until_absent(&engine, "BUCKET.dev.shop.GLOBAL").await);
        assert!(!engine.keyspace().exists("BUCKET.dev.shop.B").await.unwrap());

        handle.abort();
    }

    #[tokio::test]
    async fn test_expired_keys_converge_through_reconciler() {
        let engine = engine();
        let handle = spawn_reconciler(engine.clone(), engine.notifications().subscribe());
        let expiry = spawn_expiry_task(engine.keyspace().clone(), Duration::from_millis(50));

        for i in 0..30 {
            engine
                .set(&format!("k{}", i), &i, 1, &buckets(&["A"]), &Provenance::default())
                .await
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert!(wait_until_absent(&engine, "BUCKET.dev.shop.A").await);
        assert!(wait_until_absent(&engine, "BUCKET.dev.shop.GLOBAL").await);

        expiry.abort();
        handle.abort();
    }

    #[tokio::test]
    async fn test_reconciler_survives_unavailable_backend() {
        let engine = engine();
        let handle = spawn_reconciler(engine.clone(), engine.notifications().subscribe());

        engine.keyspace().set_available(false);
        engine.keyspace().set_available(true);
        engine
            .set("k1", "v1", 60, &buckets(&["A"]), &Provenance::default())
            .await
            .unwrap();
        engine.purge_buckets(&buckets(&["A"])).await.unwrap();

        assert!(wait_until_absent(&engine, "BUCKET.dev.shop.GLOBAL").await);
        assert!(!handle.is_finished());

        handle.abort();
    }
}

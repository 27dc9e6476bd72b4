//! Bucket Sweep
//!
//! One pass over every bucket of the environment: buckets are ordered by
//! member count, smallest first, then cleaned concurrently.
//!
//! Regular buckets lose members whose entry no longer exists, and are
//! announced as deleted once emptied. GLOBAL indexes lose tuples whose key no
//! longer exists. Each chunk of members is one atomic step.

use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::engine::GlobalTuple;
use crate::error::{CacheError, Result};
use crate::keyspace::Keyspace;
use crate::naming::BucketNamespace;
use crate::notify::NotificationChannel;

// == Sweep Report ==
/// Outcome of one sweep pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Bucket keys in the order they were scheduled
    pub visited: Vec<String>,
    /// Dangling members and tuples removed
    pub members_removed: usize,
    /// Regular buckets emptied and deleted by this pass
    pub buckets_deleted: Vec<String>,
    /// Buckets whose cleanup failed
    pub failed: usize,
}

#[derive(Debug, Default)]
struct BucketOutcome {
    removed: usize,
    deleted: bool,
}

// == Sweeper ==
#[derive(Debug, Clone)]
pub struct Sweeper {
    keyspace: Arc<Keyspace>,
    pattern: String,
    notifications: NotificationChannel,
    regular_batch_size: usize,
    global_batch_size: usize,
}

impl Sweeper {
    pub fn new(
        keyspace: Arc<Keyspace>,
        namespace: &BucketNamespace,
        regular_batch_size: usize,
        global_batch_size: usize,
    ) -> Self {
        Self {
            notifications: NotificationChannel::new(keyspace.clone(), namespace.env()),
            pattern: namespace.environment_pattern(),
            keyspace,
            regular_batch_size: regular_batch_size.max(1),
            global_batch_size: global_batch_size.max(1),
        }
    }

    // == Plan ==
    /// Every bucket of the environment with its member count, smallest first.
    pub async fn plan(&self) -> Result<Vec<(String, usize)>> {
        let pattern = self.pattern.clone();
        let mut buckets = self
            .keyspace
            .transaction(|tx| {
                tx.keys(&pattern)
                    .into_iter()
                    .map(|bucket| {
                        let size = tx.scard(&bucket)?;
                        Ok((bucket, size))
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .await?;
        // Stable, so equal sizes keep key order
        buckets.sort_by_key(|(_, size)| *size);
        Ok(buckets)
    }

    // == Sweep ==
    /// Runs one pass. A failing bucket is logged and counted, it does not
    /// stop the others.
    pub async fn sweep(self: &Arc<Self>) -> Result<SweepReport> {
        let plan = self.plan().await?;
        let mut report = SweepReport {
            visited: plan.iter().map(|(bucket, _)| bucket.clone()).collect(),
            ..SweepReport::default()
        };

        let mut tasks = JoinSet::new();
        for (bucket, _) in plan {
            let sweeper = Arc::clone(self);
            tasks.spawn(async move {
                let outcome = sweeper.clean_bucket(&bucket).await;
                (bucket, outcome)
            });
        }

        let mut unavailable = false;
        while let Some(joined) = tasks.join_next().await {
            let (bucket, outcome) = match joined {
                Ok(done) => done,
                Err(error) => {
                    warn!(error = %error, "Bucket cleanup task failed");
                    report.failed += 1;
                    continue;
                }
            };
            match outcome {
                Ok(outcome) => {
                    report.members_removed += outcome.removed;
                    if outcome.deleted {
                        report.buckets_deleted.push(bucket);
                    }
                }
                Err(CacheError::BackendUnavailable) => {
                    unavailable = true;
                    report.failed += 1;
                }
                Err(error) => {
                    warn!(bucket, error = %error, "Bucket cleanup failed");
                    report.failed += 1;
                }
            }
        }

        if unavailable {
            return Err(CacheError::BackendUnavailable);
        }
        report.buckets_deleted.sort();
        Ok(report)
    }

    async fn clean_bucket(&self, bucket: &str) -> Result<BucketOutcome> {
        if BucketNamespace::is_global_key(bucket) {
            self.clean_global(bucket).await
        } else {
            self.clean_regular(bucket).await
        }
    }

    /// Removes members whose entry is gone; announces the bucket once emptied.
    async fn clean_regular(&self, bucket: &str) -> Result<BucketOutcome> {
        let members = self.keyspace.smembers(bucket).await?;
        let mut outcome = BucketOutcome::default();

        for chunk in members.chunks(self.regular_batch_size) {
            let (removed, deleted) = self
                .keyspace
                .transaction(|tx| {
                    let dangling: Vec<&String> =
                        chunk.iter().filter(|member| !tx.exists(member)).collect();
                    let removed = tx.srem(bucket, dangling)?;
                    let deleted = removed > 0 && !tx.exists(bucket);
                    if deleted {
                        self.notifications.publish_bucket_deleted_in(tx, bucket);
                    }
                    Ok((removed, deleted))
                })
                .await?;
            outcome.removed += removed;
            outcome.deleted |= deleted;
        }

        if outcome.removed > 0 {
            debug!(bucket, removed = outcome.removed, deleted = outcome.deleted, "Cleaned bucket");
        }
        Ok(outcome)
    }

    /// Removes tuples whose key is gone. An emptied GLOBAL index is not announced.
    async fn clean_global(&self, global: &str) -> Result<BucketOutcome> {
        let tuples = self.keyspace.smembers(global).await?;
        let mut outcome = BucketOutcome::default();

        for chunk in tuples.chunks(self.global_batch_size) {
            outcome.removed += self
                .keyspace
                .transaction(|tx| {
                    let dangling: Vec<&String> = chunk
                        .iter()
                        .filter(|raw| match GlobalTuple::decode(raw) {
                            Ok(tuple) => !tx.exists(&tuple.key),
                            Err(_) => false,
                        })
                        .collect();
                    tx.srem(global, dangling)
                })
                .await?;
        }

        if outcome.removed > 0 {
            debug!(global, removed = outcome.removed, "Cleaned GLOBAL index");
        }
        Ok(outcome)
    }
}

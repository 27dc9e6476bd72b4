//! Notification Channel
//!
//! One bucket-deleted topic per environment (`{env}:bucket_del`) carrying the
//! full key of a bucket that was just deleted, plus the keyspace's expired-key
//! events. Reconciliation and any interested observer subscribe here.

use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::warn;

use crate::keyspace::{Keyspace, Transaction, EXPIRED_EVENTS_TOPIC};

// == Notification ==
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// Full key of a deleted bucket
    BucketDeleted(String),
    /// Key removed by passive expiration
    KeyExpired(String),
}

// == Notification Channel ==
/// Publisher and subscription factory for one environment.
#[derive(Debug, Clone)]
pub struct NotificationChannel {
    keyspace: Arc<Keyspace>,
    topic: String,
}

impl NotificationChannel {
    pub fn new(keyspace: Arc<Keyspace>, env: &str) -> Self {
        Self {
            keyspace,
            topic: Self::bucket_deleted_topic(env),
        }
    }

    pub fn bucket_deleted_topic(env: &str) -> String {
        format!("{}:bucket_del", env)
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Announces a deleted bucket as part of an atomic step.
    pub fn publish_bucket_deleted_in(&self, tx: &mut Transaction<'_>, bucket_key: &str) {
        tx.publish(&self.topic, bucket_key);
    }

    /// Subscribes to bucket deletions and key expirations.
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            deleted: self.keyspace.subscribe(&self.topic),
            expired: self.keyspace.subscribe(EXPIRED_EVENTS_TOPIC),
        }
    }
}

// == Subscription ==
/// Receives notifications from both topics.
#[derive(Debug)]
pub struct Subscription {
    deleted: broadcast::Receiver<String>,
    expired: broadcast::Receiver<String>,
}

impl Subscription {
    /// Waits for the next notification; None once the channel is closed.
    ///
    /// Messages lost to lagging are logged and skipped; the collector's sweep
    /// reclaims whatever they would have cleaned up.
    pub async fn recv(&mut self) -> Option<Notification> {
        loop {
            let received = tokio::select! {
                message = self.deleted.recv() => message.map(Notification::BucketDeleted),
                message = self.expired.recv() => message.map(Notification::KeyExpired),
            };
            match received {
                Ok(notification) => return Some(notification),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Notification subscriber lagged, skipped {} messages", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Takes up to `max` already-queued expired keys without waiting.
    pub fn drain_expired(&mut self, max: usize) -> Vec<String> {
        let mut keys = Vec::new();
        while keys.len() < max {
            match self.expired.try_recv() {
                Ok(key) => keys.push(key),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!("Expired-key subscriber lagged, skipped {} messages", skipped);
                }
                Err(_) => break,
            }
        }
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_bucket_deleted_round_trip() {
        let keyspace = Arc::new(Keyspace::new());
        let channel = NotificationChannel::new(keyspace.clone(), "dev");
        let mut subscription = channel.subscribe();

        keyspace
            .transaction(|tx| {
                channel.publish_bucket_deleted_in(tx, "BUCKET.dev.shop.users");
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(
            subscription.recv().await,
            Some(Notification::BucketDeleted("BUCKET.dev.shop.users".to_string()))
        );
        assert_eq!(channel.topic(), "dev:bucket_del");
    }

    #[tokio::test]
    async fn test_expired_keys_are_drained_in_batches() {
        let keyspace = Arc::new(Keyspace::new());
        let channel = NotificationChannel::new(keyspace.clone(), "dev");
        let mut subscription = channel.subscribe();

        keyspace
            .transaction(|tx| {
                for i in 0..5 {
                    let key = format!("k{}", i);
                    tx.hset_all(&key, vec![("data".to_string(), "1".to_string())])?;
                    tx.pexpire(&key, 10);
                }
                Ok(())
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        keyspace.purge_expired().await;

        let first = subscription.recv().await;
        assert!(matches!(first, Some(Notification::KeyExpired(_))));
        let rest = subscription.drain_expired(3);
        assert_eq!(rest.len(), 3);
        assert_eq!(subscription.drain_expired(10).len(), 1);
    }
}

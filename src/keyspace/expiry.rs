//! Active Expiration Task
//!
//! Background task that periodically removes expired keys from the keyspace,
//! publishing an expired event for each one.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::Keyspace;

/// Spawns a background task that periodically purges expired keys.
///
/// Keys nobody reads again would otherwise linger until the next command
/// touches them; this task makes expiration (and its notifications) timely.
///
/// # Arguments
/// * `keyspace` - shared backing store
/// * `interval` - time between purge runs
///
/// # Returns
/// A JoinHandle for the spawned task, which can be aborted during shutdown.
pub fn spawn_expiry_task(keyspace: Arc<Keyspace>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            "Starting active expiration task with interval of {} ms",
            interval.as_millis()
        );

        loop {
            tokio::time::sleep(interval).await;

            let removed = keyspace.purge_expired().await;

            if removed > 0 {
                debug!("Active expiration: removed {} expired keys", removed);
            }
        }
    })
}

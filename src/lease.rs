//! Lease Primitive
//!
//! Tokened, time-bounded exclusive ownership of a named resource. A lease is a
//! single string key `LOCK.{env}.{resource}` whose value is the owner token and
//! whose expiry is the lease duration. Both operations run as one atomic step.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::error::Result;
use crate::keyspace::Keyspace;

/// Prefix shared by every lease key.
pub const LEASE_KEY_PREFIX: &str = "LOCK.";

// == Lease Manager ==
/// Acquires, renews and releases leases in one environment.
#[derive(Debug, Clone)]
pub struct LeaseManager {
    keyspace: Arc<Keyspace>,
    env: String,
}

impl LeaseManager {
    pub fn new(keyspace: Arc<Keyspace>, env: impl Into<String>) -> Self {
        Self {
            keyspace,
            env: env.into(),
        }
    }

    /// Key holding the lease for `resource`.
    pub fn lease_key(&self, resource: &str) -> String {
        format!("{}{}.{}", LEASE_KEY_PREFIX, self.env, resource)
    }

    // == Acquire Or Renew ==
    /// Takes the lease if it is free, or extends it if `token` already owns it.
    ///
    /// Returns false, leaving the lease untouched, when another token owns it.
    pub async fn acquire_or_renew(
        &self,
        resource: &str,
        token: &str,
        duration: Duration,
    ) -> Result<bool> {
        let key = self.lease_key(resource);
        let millis = duration.as_millis() as u64;

        let acquired = self
            .keyspace
            .transaction(|tx| {
                match tx.get(&key)? {
                    Some(owner) if owner == token => Ok(tx.pexpire(&key, millis)),
                    Some(_) => Ok(false),
                    None => Ok(tx.set_nx_px(&key, token, millis)),
                }
            })
            .await?;

        debug!(resource, token, acquired, "Lease acquire or renew");
        Ok(acquired)
    }

    // == Release ==
    /// Deletes the lease only if `token` owns it.
    pub async fn release(&self, resource: &str, token: &str) -> Result<bool> {
        let key = self.lease_key(resource);

        let released = self
            .keyspace
            .transaction(|tx| match tx.get(&key)? {
                Some(owner) if owner == token => Ok(tx.del([key.as_str()]) == 1),
                _ => Ok(false),
            })
            .await?;

        debug!(resource, token, released, "Lease release");
        Ok(released)
    }

    /// Current owner token of `resource`, if leased.
    pub async fn owner(&self, resource: &str) -> Result<Option<String>> {
        let key = self.lease_key(resource);
        self.keyspace.transaction(|tx| tx.get(&key)).await
    }
}

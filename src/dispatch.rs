//! Method Dispatch
//!
//! Wraps an object's methods with cache behavior chosen from a table declared
//! when the object is bound: cacheable results are read through the cache,
//! mutators purge buckets after running, passthrough methods are untouched.

use std::collections::HashMap;
use std::future::Future;

use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::engine::{Provenance, StorageEngine};

// == Method Policy ==
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MethodPolicy {
    /// Read through the cache; unset fields fall back to the object defaults
    Cacheable {
        ttl: Option<u64>,
        buckets: Option<Vec<String>>,
    },
    /// Always call through
    Passthrough,
    /// Call through, then purge `buckets`
    Mutator { buckets: Vec<String> },
}

// == Dispatch Table ==
/// Per-object method policies plus the defaults cacheable methods inherit.
#[derive(Debug, Clone)]
pub struct DispatchTable {
    object: String,
    default_ttl: u64,
    default_buckets: Vec<String>,
    methods: HashMap<String, MethodPolicy>,
}

impl DispatchTable {
    pub fn new(object: impl Into<String>, default_ttl: u64, default_buckets: Vec<String>) -> Self {
        Self {
            object: object.into(),
            default_ttl,
            default_buckets,
            methods: HashMap::new(),
        }
    }

    pub fn method(mut self, name: impl Into<String>, policy: MethodPolicy) -> Self {
        self.methods.insert(name.into(), policy);
        self
    }

    pub fn object(&self) -> &str {
        &self.object
    }

    /// Resolved policy for `method`. Methods not in the table are cacheable
    /// with the object defaults.
    pub fn policy(&self, method: &str) -> MethodPolicy {
        match self.methods.get(method) {
            Some(MethodPolicy::Cacheable { ttl, buckets }) => MethodPolicy::Cacheable {
                ttl: Some(ttl.unwrap_or(self.default_ttl)),
                buckets: Some(
                    buckets
                        .clone()
                        .unwrap_or_else(|| self.default_buckets.clone()),
                ),
            },
            Some(other) => other.clone(),
            None => MethodPolicy::Cacheable {
                ttl: Some(self.default_ttl),
                buckets: Some(self.default_buckets.clone()),
            },
        }
    }
}

// == Cached Object ==
/// An object whose method calls are routed through its dispatch table.
#[derive(Debug, Clone)]
pub struct CachedObject {
    engine: StorageEngine,
    table: DispatchTable,
}

impl CachedObject {
    pub fn new(engine: StorageEngine, table: DispatchTable) -> Self {
        Self { engine, table }
    }

    pub fn table(&self) -> &DispatchTable {
        &self.table
    }

    /// Cache key of a call: hex SHA-256 over app, environment, object,
    /// method and the JSON-encoded arguments.
    pub fn cache_key<A>(&self, method: &str, args: &A) -> anyhow::Result<String>
    where
        A: Serialize + ?Sized,
    {
        let namespace = self.engine.namespace();
        let material = format!(
            "{}.{}.{}.{}.{}",
            namespace.app(),
            namespace.env(),
            self.table.object,
            method,
            serde_json::to_string(args)?
        );
        Ok(hex::encode(Sha256::digest(material.as_bytes())))
    }

    // == Call ==
    /// Invokes `method` with `args`, where `f` performs the real call.
    ///
    /// Cache failures never fail the call; only validation errors surface.
    pub async fn call<A, T, F, Fut>(&self, method: &str, args: &A, f: F) -> anyhow::Result<T>
    where
        A: Serialize + ?Sized,
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        match self.table.policy(method) {
            MethodPolicy::Passthrough => f().await,
            MethodPolicy::Mutator { buckets } => {
                let result = f().await?;
                if !self.engine.purge_buckets(&buckets).await? {
                    warn!(object = %self.table.object, method, "Mutator purge did not complete");
                }
                Ok(result)
            }
            MethodPolicy::Cacheable { ttl, buckets } => {
                let key = self.cache_key(method, args)?;
                if let Some(raw) = self.engine.get(&key).await? {
                    match serde_json::from_str(&raw) {
                        Ok(value) => return Ok(value),
                        Err(error) => {
                            warn!(key = %key, error = %error, "Cached value does not decode, calling through")
                        }
                    }
                }

                let result = f().await?;
                let provenance = Provenance::new(self.table.object.clone(), method);
                self.engine
                    .set(
                        &key,
                        &result,
                        ttl.unwrap_or(self.table.default_ttl),
                        &buckets.unwrap_or_default(),
                        &provenance,
                    )
                    .await?;
                Ok(result)
            }
        }
    }
}

//! Request DTOs for the cache server API
//!
//! Defines the structure of incoming HTTP request bodies.

use serde::Deserialize;
use serde_json::Value;

use crate::engine::Provenance;

/// Request body for the SET operation (PUT /set)
#[derive(Debug, Clone, Deserialize)]
pub struct SetRequest {
    /// The cache key
    pub key: String,
    /// Any JSON value
    pub value: Value,
    /// Sliding TTL in seconds
    pub ttl: u64,
    /// Buckets the entry joins; may be empty
    #[serde(default)]
    pub buckets: Vec<String>,
    #[serde(default, rename = "sourceObject")]
    pub source_object: Option<String>,
    #[serde(default, rename = "sourceMethod")]
    pub source_method: Option<String>,
}

impl SetRequest {
    /// Provenance recorded with the entry. Unset parts default to "http".
    pub fn provenance(&self) -> Provenance {
        Provenance::new(
            self.source_object.as_deref().unwrap_or("http"),
            self.source_method.as_deref().unwrap_or("set"),
        )
    }
}

/// Request body for the PURGE operation (POST /purge)
#[derive(Debug, Clone, Deserialize)]
pub struct PurgeRequest {
    /// Bucket names, qualified names or wildcards
    pub buckets: Vec<String>,
}

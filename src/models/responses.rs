//! Response DTOs for the cache server API
//!
//! Defines the structure of outgoing HTTP response bodies.

use serde::Serialize;
use serde_json::Value;

use crate::gc::GcState;
use crate::keyspace::KeyspaceStats;

/// Response body for the GET operation (GET /get/:key)
#[derive(Debug, Clone, Serialize)]
pub struct GetResponse {
    /// The requested key
    pub key: String,
    /// The stored value
    pub value: Value,
}

impl GetResponse {
    /// Creates a new GetResponse
    pub fn new(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

/// Response body for the SET operation (PUT /set)
#[derive(Debug, Clone, Serialize)]
pub struct SetResponse {
    /// Success message
    pub message: String,
    /// The key that was set
    pub key: String,
    /// Buckets the key was indexed in, as given
    pub buckets: Vec<String>,
}

impl SetResponse {
    /// Creates a new SetResponse
    pub fn new(key: impl Into<String>, buckets: Vec<String>) -> Self {
        let key = key.into();
        Self {
            message: format!("Key '{}' set successfully", key),
            key,
            buckets,
        }
    }
}

/// Response body for the PURGE operation (POST /purge)
#[derive(Debug, Clone, Serialize)]
pub struct PurgeResponse {
    pub message: String,
    pub buckets: Vec<String>,
}

impl PurgeResponse {
    pub fn new(buckets: Vec<String>) -> Self {
        Self {
            message: format!("Purged {} bucket name(s)", buckets.len()),
            buckets,
        }
    }
}

/// Response body for the stats endpoint (GET /stats)
#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    /// Number of entry reads that found a value
    pub hits: u64,
    /// Number of entry reads that found nothing
    pub misses: u64,
    /// Number of keys removed by expiration
    pub expired: u64,
    /// Current number of keys, bucket and lease keys included
    pub total_keys: usize,
    /// Hit rate (hits / (hits + misses))
    pub hit_rate: f64,
}

impl From<KeyspaceStats> for StatsResponse {
    fn from(stats: KeyspaceStats) -> Self {
        Self {
            hit_rate: stats.hit_rate(),
            hits: stats.hits,
            misses: stats.misses,
            expired: stats.expired,
            total_keys: stats.total_keys,
        }
    }
}

/// Response body for the health endpoint (GET /health)
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// "healthy", or "degraded" while the cache fails open
    pub status: String,
    pub backend_available: bool,
    /// Current timestamp in ISO 8601 format
    pub timestamp: String,
}

impl HealthResponse {
    /// Creates a new HealthResponse with current timestamp
    pub fn new(backend_available: bool) -> Self {
        let status = if backend_available { "healthy" } else { "degraded" };
        Self {
            status: status.to_string(),
            backend_available,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Response body for the collector endpoint (GET /gc)
#[derive(Debug, Clone, Serialize)]
pub struct GcStatusResponse {
    pub enabled: bool,
    /// None when this process runs no collector
    pub state: Option<GcState>,
}

/// Error response body for all error conditions
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    /// Error message describing what went wrong
    pub error: String,
}

impl ErrorResponse {
    /// Creates a new ErrorResponse
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_get_response_keeps_json_value() {
        let resp = GetResponse::new("k1", json!({"id": 7}));
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["value"]["id"], 7);
    }

    #[test]
    fn test_set_response_serialize() {
        let resp = SetResponse::new("my_key", vec!["A".to_string()]);
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("my_key"));
        assert!(json.contains("successfully"));
    }

    #[test]
    fn test_stats_response_hit_rate() {
        let stats = KeyspaceStats {
            hits: 80,
            misses: 20,
            expired: 5,
            total_keys: 100,
        };
        let resp = StatsResponse::from(stats);
        assert!((resp.hit_rate - 0.8).abs() < 0.001);
        assert_eq!(resp.expired, 5);
    }

    #[test]
    fn test_health_response_reflects_backend() {
        assert_eq!(HealthResponse::new(true).status, "healthy");
        let degraded = serde_json::to_value(HealthResponse::new(false)).unwrap();
        assert_eq!(degraded["status"], "degraded");
        assert_eq!(degraded["backend_available"], false);
    }

    #[test]
    fn test_gc_status_serialize() {
        let resp = GcStatusResponse {
            enabled: true,
            state: Some(GcState::Leader),
        };
        assert_eq!(
            serde_json::to_value(&resp).unwrap(),
            json!({"enabled": true, "state": "leader"})
        );
    }

    #[test]
    fn test_error_response_serialize() {
        let resp = ErrorResponse::new("Something went wrong");
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("Something went wrong"));
    }
}

//! Cache Entry Module
//!
//! The stored record of one cached value and the GLOBAL index tuple that
//! records its bucket memberships.

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};

pub const FIELD_DATA: &str = "data";
pub const FIELD_READ_COUNT: &str = "readCount";
pub const FIELD_CREATE_DATE: &str = "createDate";
pub const FIELD_SOURCE_OBJECT: &str = "sourceObject";
pub const FIELD_SOURCE_METHOD: &str = "sourceMethod";
pub const FIELD_TTL: &str = "ttl";

// == Provenance ==
/// Object and method that produced a cached value, kept for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub object: String,
    pub method: String,
}

impl Provenance {
    pub fn new(object: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            object: object.into(),
            method: method.into(),
        }
    }
}

// == Cache Entry ==
/// A stored value plus metadata. Every write stores all fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheEntry {
    pub key: String,
    /// Serialized JSON payload
    pub data: String,
    /// Sliding time to live in seconds
    pub ttl: u64,
    /// RFC 3339 creation timestamp
    pub create_date: String,
    pub provenance: Provenance,
    pub read_count: u64,
}

impl CacheEntry {
    // == Constructor ==
    /// Creates a fresh, unread entry stamped with the current time.
    pub fn new(key: &str, data: String, ttl: u64, provenance: Provenance) -> Self {
        Self {
            key: key.to_string(),
            data,
            ttl,
            create_date: Utc::now().to_rfc3339(),
            provenance,
            read_count: 0,
        }
    }

    /// Hash fields written for this entry.
    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            (FIELD_DATA.to_string(), self.data.clone()),
            (FIELD_READ_COUNT.to_string(), self.read_count.to_string()),
            (FIELD_CREATE_DATE.to_string(), self.create_date.clone()),
            (FIELD_SOURCE_OBJECT.to_string(), self.provenance.object.clone()),
            (FIELD_SOURCE_METHOD.to_string(), self.provenance.method.clone()),
            (FIELD_TTL.to_string(), self.ttl.to_string()),
        ]
    }

    /// Rebuilds an entry from its hash fields.
    pub fn from_fields(key: &str, fields: &HashMap<String, String>) -> Result<Self> {
        let field = |name: &str| {
            fields.get(name).cloned().ok_or_else(|| {
                CacheError::Operation(format!("entry {} is missing field {}", key, name))
            })
        };
        let number = |name: &str| -> Result<u64> {
            field(name)?.parse().map_err(|_| {
                CacheError::Operation(format!("entry {} has a non-numeric {}", key, name))
            })
        };

        Ok(Self {
            key: key.to_string(),
            data: field(FIELD_DATA)?,
            ttl: number(FIELD_TTL)?,
            create_date: field(FIELD_CREATE_DATE)?,
            provenance: Provenance {
                object: field(FIELD_SOURCE_OBJECT)?,
                method: field(FIELD_SOURCE_METHOD)?,
            },
            read_count: number(FIELD_READ_COUNT)?,
        })
    }
}

// == Global Tuple ==
/// GLOBAL index member: a key and the short names of its buckets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalTuple {
    pub key: String,
    pub buckets: Vec<String>,
}

impl GlobalTuple {
    pub fn new(key: &str, buckets: Vec<String>) -> Self {
        Self {
            key: key.to_string(),
            buckets,
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Leading text shared by every encoded tuple for `key`.
    pub fn key_prefix(key: &str) -> Result<String> {
        Ok(format!("{{\"key\":{},\"buckets\":", serde_json::to_string(key)?))
    }

    pub fn references(&self, short_name: &str) -> bool {
        self.buckets.iter().any(|bucket| bucket == short_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_fields_complete() {
        let entry = CacheEntry::new("k1", "\"v1\"".to_string(), 60, Provenance::new("Users", "find"));
        let fields: HashMap<String, String> = entry.to_fields().into_iter().collect();

        assert_eq!(fields.len(), 6);
        assert_eq!(fields[FIELD_READ_COUNT], "0");
        assert_eq!(fields[FIELD_SOURCE_METHOD], "find");
        assert_eq!(CacheEntry::from_fields("k1", &fields).unwrap(), entry);
    }

    #[test]
    fn test_entry_missing_field_is_error() {
        let fields: HashMap<String, String> =
            [(FIELD_DATA.to_string(), "1".to_string())].into_iter().collect();
        assert!(matches!(
            CacheEntry::from_fields("k1", &fields),
            Err(CacheError::Operation(_))
        ));
    }

    #[test]
    fn test_tuple_encoding_starts_with_key_prefix() {
        let tuple = GlobalTuple::new("k\"1", vec!["shop.users".to_string()]);
        let encoded = tuple.encode().unwrap();

        assert_eq!(encoded, r#"{"key":"k\"1","buckets":["shop.users"]}"#);
        assert!(encoded.starts_with(&GlobalTuple::key_prefix("k\"1").unwrap()));
        assert!(!encoded.starts_with(&GlobalTuple::key_prefix("k").unwrap()));
        assert!(tuple.references("shop.users"));
        assert_eq!(GlobalTuple::decode(&encoded).unwrap(), tuple);
    }
}

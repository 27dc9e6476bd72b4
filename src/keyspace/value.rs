//! Stored Value Module
//!
//! Defines the values held by the keyspace and their expiry metadata.

use std::collections::{HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

// == Value ==
/// The payload of a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Plain string (used by leases)
    Str(String),
    /// Field map (used by cache entries)
    Hash(HashMap<String, String>),
    /// Unordered string set (used by buckets and the GLOBAL index)
    Set(HashSet<String>),
}

impl Value {
    /// Name of the value kind, for type errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Str(_) => "string",
            Value::Hash(_) => "hash",
            Value::Set(_) => "set",
        }
    }

    /// Collections with no members are not kept in the keyspace.
    pub fn is_empty_collection(&self) -> bool {
        match self {
            Value::Str(_) => false,
            Value::Hash(fields) => fields.is_empty(),
            Value::Set(members) => members.is_empty(),
        }
    }
}

// == Stored Value ==
/// A value plus its absolute expiry.
#[derive(Debug, Clone)]
pub struct StoredValue {
    /// The payload
    pub value: Value,
    /// Expiration timestamp (Unix milliseconds), None = no expiration
    pub expires_at: Option<u64>,
}

impl StoredValue {
    /// Creates a value without expiration.
    pub fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    // == Is Expired ==
    /// Checks if the value has expired at `now`.
    ///
    /// A value is expired once `now` reaches its expiration time.
    pub fn is_expired_at(&self, now: u64) -> bool {
        match self.expires_at {
            Some(expires) => now >= expires,
            None => false,
        }
    }

    /// Remaining time to live in milliseconds at `now`, or None without expiration.
    pub fn ttl_remaining_ms(&self, now: u64) -> Option<u64> {
        self.expires_at.map(|expires| expires.saturating_sub(now))
    }
}

// == Utility Functions ==
/// Returns current Unix timestamp in milliseconds.
pub fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_without_expiry_never_expires() {
        let stored = StoredValue::new(Value::Str("v".to_string()));
        assert!(!stored.is_expired_at(u64::MAX));
        assert!(stored.ttl_remaining_ms(0).is_none());
    }

    #[test]
    fn test_expiration_boundary_condition() {
        let now = current_timestamp_ms();
        let stored = StoredValue {
            value: Value::Str("v".to_string()),
            expires_at: Some(now),
        };

        assert!(stored.is_expired_at(now), "Value should be expired at boundary");
        assert!(!stored.is_expired_at(now - 1));
        assert_eq!(stored.ttl_remaining_ms(now + 10), Some(0));
    }

    #[test]
    fn test_empty_collections() {
        assert!(Value::Set(HashSet::new()).is_empty_collection());
        assert!(Value::Hash(HashMap::new()).is_empty_collection());
        assert!(!Value::Str(String::new()).is_empty_collection());
    }
}

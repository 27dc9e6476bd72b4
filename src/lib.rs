//! Bucket Cache - method-result caching with group invalidation
//!
//! Values are cached with a sliding TTL and tagged with named buckets; purging
//! a bucket invalidates every value in it. A leader-elected garbage collector
//! reclaims bucket members whose entries expired on their own.

pub mod api;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod gc;
pub mod keyspace;
pub mod lease;
pub mod models;
pub mod naming;
pub mod notify;
pub mod tasks;

pub use api::AppState;
pub use config::Config;
pub use dispatch::{CachedObject, DispatchTable, MethodPolicy};
pub use engine::{Provenance, StorageEngine};
pub use error::{CacheError, Result};
pub use gc::{spawn_collector, GarbageCollector, GcState};
pub use keyspace::{spawn_expiry_task, Keyspace};
pub use tasks::spawn_reconciler;

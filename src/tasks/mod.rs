//! Background Tasks Module
//!
//! Contains background tasks that run for the lifetime of the server.
//!
//! # Tasks
//! - Reconciler: keeps the GLOBAL index and named buckets in step with
//!   expired keys and deleted buckets
//!
//! Active expiration lives with the keyspace (`spawn_expiry_task`), the
//! collector in `gc`.

mod reconciler;

pub use reconciler::spawn_reconciler;

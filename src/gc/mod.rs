//! Garbage Collector Module
//!
//! Reclaims what the foreground path cannot: bucket members whose entries
//! expired passively, and GLOBAL tuples of keys that no longer exist.
//!
//! # Components
//! - `GarbageCollector`: leader election and the load-gated main loop
//! - `Sweeper`: size-ordered, chunked cleanup of every bucket
//! - `LoadProbe`: host CPU usage source
//! - `spawn_collector`: worker task plus lifecycle monitor

mod collector;
mod lifecycle;
mod load;
mod sweep;

pub use collector::{session_token, CycleOutcome, GarbageCollector, GcState, GC_LOCK_RESOURCE};
pub use lifecycle::{spawn_collector, CollectorHandle, Lifecycle};
pub use load::{FixedLoad, LoadProbe, SystemLoadProbe};
pub use sweep::{SweepReport, Sweeper};

//! Storage Garbage Collection
//!
//! Periodic reclamation of destroyed volumes, snapshots, unused template
//! copies and expired download URLs.

pub mod collector;
pub mod lock;
pub mod scheduler;

pub use collector::{CleanupReport, CollectorDeps, CycleOutcome, StorageGarbageCollector, CLEANUP_LOCK};
pub use lock::InProcessLock;
pub use scheduler::CleanupScheduler;

//! Placement Engine - Capacity Admission and Storage Placement
//!
//! Decides where virtual machines and their volumes land in an IaaS
//! hierarchy (zone → pod → cluster → host), keeps primary storage pools
//! within their capacity thresholds, drives pool lifecycle transitions and
//! reclaims storage that is no longer referenced.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                              Placement Engine                                │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────────┐  │
//! │  │   Deployment    │  │  Storage Pool   │  │     Storage Garbage         │  │
//! │  │   Scheduler     │  │  Lifecycle      │  │     Collector               │  │
//! │  └────────┬────────┘  └────────┬────────┘  └─────────────┬───────────────┘  │
//! │           │                    │                         │                   │
//! │           └────────────────────┼─────────────────────────┘                   │
//! │                                │                                             │
//! │        ┌───────────────────────┴───────────────────────┐                    │
//! │        │  Capacity Admission   │  Access Group Matcher  │                    │
//! │        └───────────────────────────────────────────────┘                    │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │                                 Ports                                        │
//! │  ┌──────────────┐ ┌──────────────┐ ┌──────────────┐ ┌──────────────────┐    │
//! │  │  Repository  │ │   Catalog    │ │ Host Gateway │ │ Drivers / Lock   │    │
//! │  └──────────────┘ └──────────────┘ └──────────────┘ └──────────────────┘    │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`capacity`]: Space and IOPS admission, capacity records
//! - [`access`]: Storage access group matching
//! - [`scheduler`]: Host and pool selection for deployments
//! - [`lifecycle`]: Pool status transitions and host connections
//! - [`gc`]: Periodic storage reclamation
//! - [`domain`]: Records, request values and ports
//! - [`memory`]: In-process adapters for every port
//! - [`error`]: Error types and handling

pub mod access;
pub mod capacity;
pub mod config;
pub mod domain;
pub mod error;
pub mod events;
pub mod gc;
pub mod lifecycle;
pub mod memory;
pub mod metrics;
pub mod scheduler;

// Re-export commonly used types
pub use access::{MoveVerdict, StorageAccessGroupMatcher};
pub use capacity::{CapacityAdmissionChecker, CapacityTracker, SpaceCheck};
pub use config::{DownloadUrlConfig, EngineConfig, GcConfig, StorageThresholds};
pub use error::{Error, ErrorAction, ErrorClass, Result};
pub use events::{EngineEvent, EventBus};
pub use gc::{CleanupReport, CleanupScheduler, CycleOutcome, StorageGarbageCollector};
pub use lifecycle::{ConnectOptions, StoragePoolLifecycleManager};
pub use metrics::EngineMetrics;
pub use scheduler::{DeploymentPlanningManager, HostFilter};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

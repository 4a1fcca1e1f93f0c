//! Deployment Scheduler
//!
//! Chooses a host and one storage pool per volume for a placement request.
//!
//! ```text
//! AvoidDisabled -> Affinity -> OrderClusters -> per cluster:
//!     FilterHosts -> ReorderByPriority -> per host: FindPools -> Reserve -> Destination
//! ```

pub mod allocator;
pub mod deploy;
pub mod host_filter;
pub mod planner;

pub use allocator::{
    AllocatorChain, ClusterScopeStoragePoolAllocator, LocalStoragePoolAllocator, PoolRequest,
    StoragePoolAllocator, StoragePoolAllocatorRef, ZoneWideStoragePoolAllocator,
};
pub use deploy::{DeploymentPlanningManager, SchedulerDeps};
pub use host_filter::{reorder_by_priority, HostFilter, HostRequirements};
pub use planner::{
    DeploymentPlanner, DeploymentPlannerRef, FirstFitPlanner, ImplicitDedicationPlanner,
    PlannerRegistry,
};

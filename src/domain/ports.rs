//! Domain Ports - Core trait definitions for the placement engine
//!
//! These traits define the boundaries between the placement/admission logic
//! and the collaborators it consumes: the resource repository, the artifact
//! catalog, host agents, storage drivers and the cluster-wide lock service.
//! Adapters implement these traits to provide concrete functionality.

use super::model::*;
use super::plan::{DeploymentPlan, ExcludeList, VmProfile};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Resource Repository Port
// =============================================================================

/// Typed queries and guarded updates over the shared relational store
///
/// Every method is a named access pattern; the engine never composes
/// queries itself.
#[async_trait]
pub trait ResourceRepository: Send + Sync {
    // ---- hierarchy ----

    async fn find_zone(&self, id: ZoneId) -> Result<Option<Zone>>;

    async fn find_pod(&self, id: PodId) -> Result<Option<Pod>>;

    async fn find_cluster(&self, id: ClusterId) -> Result<Option<Cluster>>;

    async fn list_pods_in_zone(&self, zone_id: ZoneId) -> Result<Vec<Pod>>;

    async fn list_clusters_in_zone(&self, zone_id: ZoneId) -> Result<Vec<Cluster>>;

    // ---- hosts ----

    async fn find_host(&self, id: HostId) -> Result<Option<Host>>;

    /// Hosts for the given ids; unknown ids are skipped
    async fn find_hosts(&self, ids: &[HostId]) -> Result<Vec<Host>>;

    async fn list_hosts_in_cluster(&self, cluster_id: ClusterId) -> Result<Vec<Host>>;

    async fn list_hosts_in_zone(&self, zone_id: ZoneId) -> Result<Vec<Host>>;

    /// Compare-and-swap on the host's planner reservation; returns rows updated
    async fn update_host_reservation_if(
        &self,
        id: HostId,
        expected: Option<PlannerResourceUsage>,
        next: Option<PlannerResourceUsage>,
    ) -> Result<u64>;

    // ---- storage pools ----

    async fn find_pool(&self, id: PoolId) -> Result<Option<StoragePool>>;

    async fn find_pool_by_uuid(&self, uuid: &str) -> Result<Option<StoragePool>>;

    /// Pools of one scope in a zone, optionally narrowed to a cluster
    async fn list_pools_by_scope(
        &self,
        zone_id: ZoneId,
        cluster_id: Option<ClusterId>,
        scope: PoolScope,
    ) -> Result<Vec<StoragePool>>;

    async fn list_pools_in_zone(&self, zone_id: ZoneId) -> Result<Vec<StoragePool>>;

    async fn list_all_pools(&self) -> Result<Vec<StoragePool>>;

    async fn list_child_pools(&self, parent: PoolId) -> Result<Vec<StoragePool>>;

    async fn insert_pool(&self, pool: StoragePool) -> Result<()>;

    /// Compare-and-swap on the pool status; returns rows updated
    async fn update_pool_status_if(
        &self,
        id: PoolId,
        expected: StoragePoolStatus,
        next: StoragePoolStatus,
    ) -> Result<u64>;

    async fn update_pool_bytes(&self, id: PoolId, capacity_bytes: u64, used_bytes: u64)
        -> Result<()>;

    /// Expunge the pool record and its host links
    async fn remove_pool(&self, id: PoolId) -> Result<()>;

    // ---- pool/host links ----

    async fn list_pool_host_refs(&self, pool_id: PoolId) -> Result<Vec<PoolHostRef>>;

    async fn upsert_pool_host_ref(&self, link: PoolHostRef) -> Result<()>;

    async fn delete_pool_host_ref(&self, pool_id: PoolId, host_id: HostId) -> Result<()>;

    // ---- volumes ----

    async fn find_volume(&self, id: VolumeId) -> Result<Option<Volume>>;

    async fn list_volumes_by_instance(&self, vm_id: VmId) -> Result<Vec<Volume>>;

    async fn list_volumes_by_pool(&self, pool_id: PoolId) -> Result<Vec<Volume>>;

    async fn list_volumes_in_state(&self, state: VolumeState) -> Result<Vec<Volume>>;

    async fn set_volume_pool(&self, id: VolumeId, pool_id: Option<PoolId>) -> Result<()>;

    async fn set_volume_state(&self, id: VolumeId, state: VolumeState) -> Result<()>;

    async fn set_volume_snapshot_reserve(&self, id: VolumeId, reserve: u32) -> Result<()>;

    async fn remove_volume(&self, id: VolumeId) -> Result<()>;

    /// Bytes accounted against the pool: live volumes plus staged templates
    async fn allocated_bytes_on_pool(&self, pool_id: PoolId) -> Result<u64>;

    /// Sum of min IOPS of the volumes on the pool
    async fn used_iops_on_pool(&self, pool_id: PoolId) -> Result<u64>;

    // ---- instances, offerings, templates ----

    async fn find_vm(&self, id: VmId) -> Result<Option<VirtualMachine>>;

    async fn find_disk_offering(&self, id: DiskOfferingId) -> Result<Option<DiskOffering>>;

    async fn find_template(&self, id: TemplateId) -> Result<Option<Template>>;

    async fn find_template_pool_ref(
        &self,
        template_id: TemplateId,
        pool_id: PoolId,
    ) -> Result<Option<TemplatePoolRef>>;

    // ---- capacity ----

    /// Insert or replace the record for (owner, capacity type)
    async fn upsert_capacity_record(&self, record: CapacityRecord) -> Result<()>;

    async fn find_capacity_record(
        &self,
        owner: CapacityOwner,
        capacity_type: CapacityType,
    ) -> Result<Option<CapacityRecord>>;
}

// =============================================================================
// Artifact Catalog Port
// =============================================================================

/// Template, snapshot and download-URL bookkeeping the collector drives
#[async_trait]
pub trait ArtifactCatalog: Send + Sync {
    /// Template copies on a pool that no volume references
    async fn list_unused_templates_on_pool(&self, pool_id: PoolId)
        -> Result<Vec<TemplatePoolRef>>;

    async fn mark_template_for_gc(&self, template_id: TemplateId, pool_id: PoolId)
        -> Result<()>;

    async fn remove_template_pool_ref(&self, template_id: TemplateId, pool_id: PoolId)
        -> Result<()>;

    async fn list_snapshot_refs_in_state(&self, state: SnapshotState)
        -> Result<Vec<SnapshotStoreRef>>;

    async fn delete_snapshot_ref(&self, snapshot_id: SnapshotId, pool_id: PoolId) -> Result<()>;

    async fn list_snapshots_in_state(&self, state: SnapshotState) -> Result<Vec<Snapshot>>;

    async fn expunge_snapshot(&self, id: SnapshotId) -> Result<()>;

    async fn list_templates_in_states(&self, states: &[TemplateState]) -> Result<Vec<Template>>;

    async fn set_template_state(&self, id: TemplateId, state: TemplateState) -> Result<()>;

    async fn list_download_urls(&self) -> Result<Vec<DownloadUrl>>;

    async fn remove_download_url(&self, id: u64) -> Result<()>;
}

// =============================================================================
// Remote Execution Gateway Port
// =============================================================================

/// Commands the engine sends to host agents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentCommand {
    /// Mount (add) or unmount a shared pool
    ModifyStoragePool {
        pool_id: PoolId,
        uuid: String,
        path: String,
        add: bool,
    },
    DeleteVolume {
        pool_id: PoolId,
        path: String,
    },
    EvictTemplate {
        pool_id: PoolId,
        template_id: TemplateId,
    },
    /// Drop a clustered-filesystem attachment of a managed volume
    ReleaseAttachment {
        pool_id: PoolId,
        path: String,
    },
}

impl AgentCommand {
    pub fn name(&self) -> &'static str {
        match self {
            AgentCommand::ModifyStoragePool { .. } => "ModifyStoragePool",
            AgentCommand::DeleteVolume { .. } => "DeleteVolume",
            AgentCommand::EvictTemplate { .. } => "EvictTemplate",
            AgentCommand::ReleaseAttachment { .. } => "ReleaseAttachment",
        }
    }
}

/// Typed agent answers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentAnswer {
    Ack,
    /// Mount result for a pool
    PoolInfo {
        uuid: String,
        local_path: String,
        capacity_bytes: u64,
        available_bytes: u64,
    },
}

/// Failures raised by the gateway
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("host {0} unavailable")]
    HostUnavailable(HostId),

    #[error("{command} timed out on host {host_id}")]
    Timeout { host_id: HostId, command: String },

    #[error("{command} failed on host {host_id}: {reason}")]
    CommandFailed {
        host_id: HostId,
        command: String,
        reason: String,
    },
}

impl From<GatewayError> for Error {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::HostUnavailable(host_id) => Error::HostUnavailable {
                host_id: host_id.to_string(),
            },
            GatewayError::Timeout { host_id, command } => Error::OperationTimeout {
                host_id: host_id.to_string(),
                command,
            },
            GatewayError::CommandFailed {
                host_id,
                command,
                reason,
            } => Error::CommandFailed {
                host_id: host_id.to_string(),
                command,
                reason,
            },
        }
    }
}

/// Port for sending commands to a host agent
#[async_trait]
pub trait RemoteExecutionGateway: Send + Sync {
    /// Send a command; bounded by the gateway's own timeout
    async fn send(
        &self,
        host_id: HostId,
        command: AgentCommand,
    ) -> std::result::Result<AgentAnswer, GatewayError>;
}

// =============================================================================
// Storage Driver Port
// =============================================================================

/// Capability flags a storage provider advertises
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverCapabilities {
    /// Driver can report live usage for its pools
    pub supports_stats: bool,
    /// Driver allows allocation beyond raw capacity
    pub supports_overprovisioning: bool,
    /// Volumes are provisioned by the storage system itself
    pub managed: bool,
}

/// Pool lifecycle operations of one storage provider
#[async_trait]
pub trait StorageDriver: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> DriverCapabilities;

    async fn initialize(&self, pool: &StoragePool) -> Result<()>;

    async fn attach(&self, pool: &StoragePool, scope: PoolScope) -> Result<()>;

    async fn maintain(&self, pool: &StoragePool) -> Result<()>;

    async fn cancel_maintain(&self, pool: &StoragePool) -> Result<()>;

    async fn delete(&self, pool: &StoragePool) -> Result<()>;

    /// Extra bytes needed to clone a template onto this pool
    fn bytes_required_for_template(&self, template: &Template, _pool: &StoragePool) -> u64 {
        template.size_bytes
    }
}

/// Resolves a pool's provider name to its driver
pub trait StorageDriverProvider: Send + Sync {
    fn driver(&self, provider_name: &str) -> Option<StorageDriverRef>;

    fn require(&self, provider_name: &str) -> Result<StorageDriverRef> {
        self.driver(provider_name).ok_or_else(|| {
            Error::Configuration(format!("no storage driver named {}", provider_name))
        })
    }
}

// =============================================================================
// Cluster Lock Port
// =============================================================================

/// Held lock; dropping it releases the lock
pub struct LockGuard {
    _inner: Box<dyn Send + Sync>,
}

impl LockGuard {
    pub fn new(inner: impl Send + Sync + 'static) -> Self {
        Self {
            _inner: Box::new(inner),
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LockGuard")
    }
}

/// Advisory, time-bounded, cluster-wide named lock
#[async_trait]
pub trait ClusterLock: Send + Sync {
    /// Returns None when the lock is not acquired within `wait`
    async fn try_acquire(&self, name: &str, wait: Duration) -> Result<Option<LockGuard>>;
}

// =============================================================================
// Affinity Port
// =============================================================================

/// External affinity-group evaluation; may exclude hosts outright
#[async_trait]
pub trait AffinityProcessor: Send + Sync {
    async fn process(
        &self,
        profile: &VmProfile,
        plan: &DeploymentPlan,
        avoid: &mut ExcludeList,
    ) -> Result<()>;
}

/// Affinity processor that never excludes anything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAffinity;

#[async_trait]
impl AffinityProcessor for NoAffinity {
    async fn process(
        &self,
        _profile: &VmProfile,
        _plan: &DeploymentPlan,
        _avoid: &mut ExcludeList,
    ) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type ResourceRepositoryRef = Arc<dyn ResourceRepository>;
pub type ArtifactCatalogRef = Arc<dyn ArtifactCatalog>;
pub type RemoteExecutionGatewayRef = Arc<dyn RemoteExecutionGateway>;
pub type StorageDriverRef = Arc<dyn StorageDriver>;
pub type StorageDriverProviderRef = Arc<dyn StorageDriverProvider>;
pub type ClusterLockRef = Arc<dyn ClusterLock>;
pub type AffinityProcessorRef = Arc<dyn AffinityProcessor>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;

    #[test]
    fn test_gateway_error_conversion() {
        let err: Error = GatewayError::HostUnavailable(HostId(3)).into();
        assert_eq!(err.class(), ErrorClass::ResourceUnavailable);
        assert!(err.is_retryable());

        let err: Error = GatewayError::CommandFailed {
            host_id: HostId(3),
            command: "DeleteVolume".into(),
            reason: "busy".into(),
        }
        .into();
        assert_eq!(err.to_string(), "Command DeleteVolume failed on host 3: busy");
    }

    #[test]
    fn test_command_names() {
        let cmd = AgentCommand::ModifyStoragePool {
            pool_id: PoolId(1),
            uuid: "u".into(),
            path: "/export".into(),
            add: true,
        };
        assert_eq!(cmd.name(), "ModifyStoragePool");
    }
}

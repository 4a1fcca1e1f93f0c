//! Domain Records
//!
//! Infrastructure records owned by the resource repository: the
//! zone → pod → cluster → host hierarchy, storage pools, volumes and the
//! catalog objects the admission and garbage-collection logic reads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// Identifiers
// =============================================================================

macro_rules! define_id {
    ($($(#[$meta:meta])* $name:ident),+ $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
            #[serde(transparent)]
            pub struct $name(pub u64);

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}", self.0)
                }
            }

            impl From<u64> for $name {
                fn from(id: u64) -> Self {
                    Self(id)
                }
            }
        )+
    };
}

define_id!(
    /// Zone (data center) identifier
    ZoneId,
    /// Pod identifier
    PodId,
    /// Cluster identifier
    ClusterId,
    /// Host identifier
    HostId,
    /// Primary storage pool identifier
    PoolId,
    /// Volume identifier
    VolumeId,
    /// Virtual machine identifier
    VmId,
    /// Disk offering identifier
    DiskOfferingId,
    /// Service offering identifier
    ServiceOfferingId,
    /// Template identifier
    TemplateId,
    /// Snapshot identifier
    SnapshotId,
);

macro_rules! display_as_debug {
    ($($name:ident),+ $(,)?) => {
        $(
            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    fmt::Debug::fmt(self, f)
                }
            }
        )+
    };
}

// =============================================================================
// States
// =============================================================================

/// Administrative allocation state of a zone, pod or cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum AllocationState {
    #[default]
    Enabled,
    Disabled,
}

/// Hypervisor family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum HypervisorType {
    #[default]
    Kvm,
    VMware,
    XenServer,
    Hyperv,
    Simulator,
}

/// Connection status of a host agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum HostStatus {
    #[default]
    Up,
    Down,
    Disconnected,
    Alert,
    Connecting,
    Updating,
    Removed,
}

/// Administrative resource state of a host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ResourceState {
    #[default]
    Enabled,
    Disabled,
    Maintenance,
    PrepareForMaintenance,
    ErrorInMaintenance,
}

/// Which part of the hierarchy can mount a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum PoolScope {
    Host,
    #[default]
    Cluster,
    Zone,
}

/// Lifecycle status of a storage pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum StoragePoolStatus {
    #[default]
    Up,
    Maintenance,
    PrepareForMaintenance,
    ErrorInMaintenance,
    CancelMaintenance,
    Disabled,
    Removed,
}

/// Storage pool protocol / layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum StoragePoolType {
    #[default]
    NetworkFilesystem,
    Filesystem,
    SharedMountPoint,
    Iscsi,
    Rbd,
    Vmfs,
    PreSetup,
    DatastoreCluster,
    PowerFlex,
    Clvm,
    Lvm,
}

impl StoragePoolType {
    /// Whether allocation accounting may exceed raw capacity
    pub fn supports_overprovisioning(&self) -> bool {
        matches!(
            self,
            StoragePoolType::NetworkFilesystem
                | StoragePoolType::Filesystem
                | StoragePoolType::Vmfs
                | StoragePoolType::PreSetup
                | StoragePoolType::DatastoreCluster
                | StoragePoolType::Rbd
                | StoragePoolType::PowerFlex
        )
    }
}

/// Volume lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum VolumeState {
    #[default]
    Allocated,
    Creating,
    Ready,
    Resizing,
    Migrating,
    Expunging,
    Destroy,
    Expunged,
    UploadOp,
    UploadError,
    UploadAbandoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum VolumeType {
    #[default]
    Root,
    DataDisk,
}

/// Virtual machine power / lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum VmState {
    Starting,
    Running,
    Stopping,
    #[default]
    Stopped,
    Migrating,
    Destroyed,
    Expunging,
    Error,
}

impl VmState {
    /// States in which the VM holds its volumes open
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            VmState::Running | VmState::Starting | VmState::Stopping | VmState::Migrating
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum VmType {
    #[default]
    User,
    DomainRouter,
    ConsoleProxy,
    SecondaryStorageVm,
    InternalLoadBalancer,
}

impl VmType {
    /// Infrastructure VMs managed by the orchestrator itself
    pub fn is_system(&self) -> bool {
        !matches!(self, VmType::User)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ImageFormat {
    #[default]
    Qcow2,
    Raw,
    Vhd,
    Ova,
    Iso,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum TemplateState {
    #[default]
    Active,
    Inactive,
    UploadError,
    UploadAbandoned,
    Removed,
}

/// Staging state of a template copy on a primary pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DownloadState {
    NotDownloaded,
    DownloadInProgress,
    #[default]
    Downloaded,
    DownloadError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SnapshotState {
    #[default]
    BackedUp,
    Destroying,
    Destroyed,
    Error,
}

/// Resource usage class of a deployment planner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum PlannerResourceUsage {
    #[default]
    Shared,
    Dedicated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CapacityType {
    /// Sum of volume sizes against effective (overprovisioned) capacity
    StorageAllocated,
    /// Bytes physically consumed against raw capacity
    StorageUsed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum CapacityState {
    #[default]
    Enabled,
    Disabled,
}

display_as_debug!(
    AllocationState,
    HypervisorType,
    HostStatus,
    ResourceState,
    PoolScope,
    StoragePoolStatus,
    StoragePoolType,
    VolumeState,
    VolumeType,
    VmState,
    VmType,
    ImageFormat,
    TemplateState,
    DownloadState,
    SnapshotState,
    PlannerResourceUsage,
    CapacityType,
    CapacityState,
);

// =============================================================================
// Infrastructure Hierarchy
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Zone {
    pub id: ZoneId,
    pub name: String,
    #[serde(default)]
    pub allocation_state: AllocationState,
    /// Comma-separated label sets are split on load
    #[serde(default)]
    pub storage_access_groups: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pod {
    pub id: PodId,
    pub name: String,
    pub zone_id: ZoneId,
    #[serde(default)]
    pub allocation_state: AllocationState,
    #[serde(default)]
    pub storage_access_groups: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub id: ClusterId,
    pub name: String,
    pub zone_id: ZoneId,
    pub pod_id: PodId,
    #[serde(default)]
    pub hypervisor: HypervisorType,
    #[serde(default)]
    pub allocation_state: AllocationState,
    /// Cluster storage can resignature cloned template copies
    #[serde(default)]
    pub supports_resigning: bool,
    #[serde(default)]
    pub storage_access_groups: Vec<String>,
}

/// A compute host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub id: HostId,
    pub name: String,
    pub zone_id: ZoneId,
    pub pod_id: PodId,
    pub cluster_id: ClusterId,
    #[serde(default)]
    pub status: HostStatus,
    #[serde(default)]
    pub resource_state: ResourceState,
    #[serde(default)]
    pub hypervisor: HypervisorType,
    #[serde(default = "default_arch")]
    pub arch: String,
    #[serde(default)]
    pub storage_access_groups: Vec<String>,
    /// Physical cores
    pub cpu_cores: u32,
    /// Per-core speed
    pub cpu_speed_mhz: u32,
    #[serde(default)]
    pub used_cpu_mhz: u64,
    pub total_memory_bytes: u64,
    #[serde(default)]
    pub used_memory_bytes: u64,
    #[serde(default)]
    pub free_gpus: u32,
    #[serde(default)]
    pub running_guests: u32,
    /// Per-host guest limit; falls back to the engine default
    #[serde(default)]
    pub max_guests: Option<u32>,
    /// Agent advertises LUKS volume encryption
    #[serde(default)]
    pub supports_volume_encryption: bool,
    /// Planner usage class this host is reserved for
    #[serde(default)]
    pub reservation: Option<PlannerResourceUsage>,
}

fn default_arch() -> String {
    "x86_64".to_string()
}

impl Host {
    pub fn is_up_and_enabled(&self) -> bool {
        self.status == HostStatus::Up && self.resource_state == ResourceState::Enabled
    }

    pub fn free_cpu_mhz(&self) -> u64 {
        (self.cpu_cores as u64 * self.cpu_speed_mhz as u64).saturating_sub(self.used_cpu_mhz)
    }

    pub fn free_memory_bytes(&self) -> u64 {
        self.total_memory_bytes.saturating_sub(self.used_memory_bytes)
    }
}

// =============================================================================
// Storage
// =============================================================================

/// A primary storage pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoragePool {
    pub id: PoolId,
    pub name: String,
    /// Identity reported by hosts after mounting
    pub uuid: String,
    pub zone_id: ZoneId,
    #[serde(default)]
    pub pod_id: Option<PodId>,
    #[serde(default)]
    pub cluster_id: Option<ClusterId>,
    /// Owning host of a host-scoped (local) pool
    #[serde(default)]
    pub host_id: Option<HostId>,
    #[serde(default)]
    pub scope: PoolScope,
    #[serde(default)]
    pub pool_type: StoragePoolType,
    #[serde(default)]
    pub status: StoragePoolStatus,
    pub capacity_bytes: u64,
    #[serde(default)]
    pub used_bytes: u64,
    /// None when IOPS are not tracked for this pool
    #[serde(default)]
    pub capacity_iops: Option<u64>,
    #[serde(default = "default_provider")]
    pub provider_name: String,
    #[serde(default)]
    pub managed: bool,
    /// Datastore cluster this pool belongs to
    #[serde(default)]
    pub parent: Option<PoolId>,
    #[serde(default)]
    pub hypervisor: Option<HypervisorType>,
    #[serde(default)]
    pub storage_access_groups: Vec<String>,
    #[serde(default)]
    pub path: String,
}

fn default_provider() -> String {
    "DefaultPrimary".to_string()
}

impl StoragePool {
    pub fn is_datastore_cluster(&self) -> bool {
        self.pool_type == StoragePoolType::DatastoreCluster
    }
}

/// Link between a pool and a host that has it mounted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolHostRef {
    pub pool_id: PoolId,
    pub host_id: HostId,
    pub local_path: String,
}

/// A virtual disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    pub id: VolumeId,
    pub name: String,
    #[serde(default)]
    pub instance_id: Option<VmId>,
    /// None while unplaced
    #[serde(default)]
    pub pool_id: Option<PoolId>,
    #[serde(default)]
    pub state: VolumeState,
    #[serde(default)]
    pub volume_type: VolumeType,
    pub size_bytes: u64,
    pub disk_offering_id: DiskOfferingId,
    #[serde(default)]
    pub min_iops: Option<u64>,
    #[serde(default)]
    pub max_iops: Option<u64>,
    /// Percentage; computed from the disk offering on first use
    #[serde(default)]
    pub hypervisor_snapshot_reserve: Option<u32>,
    #[serde(default)]
    pub template_id: Option<TemplateId>,
    #[serde(default)]
    pub passphrase_id: Option<u64>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Volume {
    pub fn requires_encryption(&self) -> bool {
        self.passphrase_id.is_some()
    }

    /// Volumes that still hold (or will hold) data for their owner
    pub fn is_usable(&self) -> bool {
        !matches!(
            self.state,
            VolumeState::Destroy
                | VolumeState::Expunging
                | VolumeState::Expunged
                | VolumeState::UploadError
                | VolumeState::UploadAbandoned
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskOffering {
    pub id: DiskOfferingId,
    pub name: String,
    pub size_bytes: u64,
    #[serde(default)]
    pub min_iops: Option<u64>,
    #[serde(default)]
    pub max_iops: Option<u64>,
    #[serde(default)]
    pub hypervisor_snapshot_reserve: Option<u32>,
    #[serde(default)]
    pub use_local_storage: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceOffering {
    pub id: ServiceOfferingId,
    pub name: String,
    pub cpus: u32,
    pub speed_mhz: u32,
    pub memory_bytes: u64,
    #[serde(default)]
    pub gpus: u32,
    /// Deployment planner requested by this offering
    #[serde(default)]
    pub planner: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualMachine {
    pub id: VmId,
    pub name: String,
    #[serde(default)]
    pub vm_type: VmType,
    #[serde(default)]
    pub state: VmState,
    #[serde(default)]
    pub host_id: Option<HostId>,
    #[serde(default)]
    pub last_host_id: Option<HostId>,
    #[serde(default)]
    pub owner_is_admin: bool,
    pub service_offering_id: ServiceOfferingId,
    #[serde(default)]
    pub template_id: Option<TemplateId>,
    #[serde(default)]
    pub hypervisor: HypervisorType,
}

// =============================================================================
// Catalog Objects
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: TemplateId,
    pub name: String,
    pub size_bytes: u64,
    #[serde(default)]
    pub format: ImageFormat,
    #[serde(default)]
    pub hypervisor: Option<HypervisorType>,
    #[serde(default)]
    pub state: TemplateState,
}

/// A template copy staged on a primary pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplatePoolRef {
    pub template_id: TemplateId,
    pub pool_id: PoolId,
    #[serde(default)]
    pub download_state: DownloadState,
    /// Set by the first collection pass, evicted on the next
    #[serde(default)]
    pub marked_for_gc: bool,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub volume_id: VolumeId,
    #[serde(default)]
    pub state: SnapshotState,
}

/// A snapshot copy held on a pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotStoreRef {
    pub snapshot_id: SnapshotId,
    pub pool_id: PoolId,
    #[serde(default)]
    pub state: SnapshotState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DownloadTarget {
    Volume(VolumeId),
    Template(TemplateId),
}

/// A signed extract URL handed out to a user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadUrl {
    pub id: u64,
    pub target: DownloadTarget,
    pub url: String,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Capacity Records
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CapacityOwner {
    Pool(PoolId),
    Host(HostId),
}

/// Per (owner, type) capacity bookkeeping row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapacityRecord {
    pub owner: CapacityOwner,
    pub capacity_type: CapacityType,
    pub zone_id: ZoneId,
    pub pod_id: Option<PodId>,
    pub cluster_id: Option<ClusterId>,
    pub allocated: u64,
    pub total: u64,
    pub state: CapacityState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overprovisioning_pool_types() {
        assert!(StoragePoolType::NetworkFilesystem.supports_overprovisioning());
        assert!(StoragePoolType::Vmfs.supports_overprovisioning());
        assert!(!StoragePoolType::Iscsi.supports_overprovisioning());
        assert!(!StoragePoolType::Clvm.supports_overprovisioning());
    }

    #[test]
    fn test_id_display() {
        assert_eq!(PoolId(42).to_string(), "42");
        assert_eq!(HostId::from(7), HostId(7));
        assert_eq!(StoragePoolStatus::ErrorInMaintenance.to_string(), "ErrorInMaintenance");
    }

    #[test]
    fn test_vm_state_activity() {
        assert!(VmState::Migrating.is_active());
        assert!(!VmState::Stopped.is_active());
        assert!(VmType::DomainRouter.is_system());
        assert!(!VmType::User.is_system());
    }
}

//! Request-scoped placement values
//!
//! A [`DeploymentPlan`] and its [`ExcludeList`] live for the duration of one
//! placement decision and are never persisted.

use super::model::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Host priority that removes a host from consideration
pub const PROHIBITED_HOST_PRIORITY: i32 = i32::MIN;

// =============================================================================
// Deployment Plan
// =============================================================================

/// Where a placement request may land
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeploymentPlan {
    pub zone_id: ZoneId,
    #[serde(default)]
    pub pod_id: Option<PodId>,
    #[serde(default)]
    pub cluster_id: Option<ClusterId>,
    /// Fixed destination host
    #[serde(default)]
    pub host_id: Option<HostId>,
    /// Explicit host ordering; lower values are tried first
    #[serde(default)]
    pub host_priorities: HashMap<HostId, i32>,
}

impl DeploymentPlan {
    pub fn new(zone_id: ZoneId) -> Self {
        Self {
            zone_id,
            ..Default::default()
        }
    }

    pub fn with_host(mut self, host_id: HostId) -> Self {
        self.host_id = Some(host_id);
        self
    }

    pub fn with_cluster(mut self, cluster_id: ClusterId) -> Self {
        self.cluster_id = Some(cluster_id);
        self
    }

    pub fn set_host_priority(&mut self, host_id: HostId, priority: i32) {
        self.host_priorities.insert(host_id, priority);
    }

    pub fn prohibit_host(&mut self, host_id: HostId) {
        self.host_priorities.insert(host_id, PROHIBITED_HOST_PRIORITY);
    }
}

// =============================================================================
// Exclude List
// =============================================================================

/// Ids a placement search must not consider
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExcludeList {
    pub zones: HashSet<ZoneId>,
    pub pods: HashSet<PodId>,
    pub clusters: HashSet<ClusterId>,
    pub hosts: HashSet<HostId>,
    pub pools: HashSet<PoolId>,
}

impl ExcludeList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_zone(&mut self, id: ZoneId) {
        self.zones.insert(id);
    }

    pub fn add_pod(&mut self, id: PodId) {
        self.pods.insert(id);
    }

    pub fn add_cluster(&mut self, id: ClusterId) {
        self.clusters.insert(id);
    }

    pub fn add_clusters(&mut self, ids: impl IntoIterator<Item = ClusterId>) {
        self.clusters.extend(ids);
    }

    pub fn add_host(&mut self, id: HostId) {
        self.hosts.insert(id);
    }

    pub fn add_hosts(&mut self, ids: impl IntoIterator<Item = HostId>) {
        self.hosts.extend(ids);
    }

    pub fn add_pool(&mut self, id: PoolId) {
        self.pools.insert(id);
    }

    pub fn should_avoid_zone(&self, id: ZoneId) -> bool {
        self.zones.contains(&id)
    }

    pub fn should_avoid_cluster(&self, cluster: &Cluster) -> bool {
        self.zones.contains(&cluster.zone_id)
            || self.pods.contains(&cluster.pod_id)
            || self.clusters.contains(&cluster.id)
    }

    /// A host is avoided when it or any of its ancestors is listed
    pub fn should_avoid_host(&self, host: &Host) -> bool {
        self.zones.contains(&host.zone_id)
            || self.pods.contains(&host.pod_id)
            || self.clusters.contains(&host.cluster_id)
            || self.hosts.contains(&host.id)
    }

    pub fn should_avoid_pool(&self, pool: &StoragePool) -> bool {
        self.pools.contains(&pool.id)
            || self.zones.contains(&pool.zone_id)
            || pool.pod_id.map_or(false, |p| self.pods.contains(&p))
            || pool.cluster_id.map_or(false, |c| self.clusters.contains(&c))
    }
}

// =============================================================================
// Workload Profile
// =============================================================================

/// Sizing of one disk as requested by the placement caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskProfile {
    pub volume_id: VolumeId,
    pub disk_offering_id: DiskOfferingId,
    pub size_bytes: u64,
    #[serde(default)]
    pub min_iops: Option<u64>,
    #[serde(default)]
    pub use_local_storage: bool,
}

impl DiskProfile {
    /// Profile equal to the volume's current sizing
    pub fn from_volume(volume: &Volume) -> Self {
        Self {
            volume_id: volume.id,
            disk_offering_id: volume.disk_offering_id,
            size_bytes: volume.size_bytes,
            min_iops: volume.min_iops,
            use_local_storage: false,
        }
    }
}

/// A volume paired with the profile it is being admitted under
#[derive(Debug, Clone)]
pub struct VolumeRequest {
    pub volume: Volume,
    pub profile: DiskProfile,
}

impl VolumeRequest {
    pub fn new(volume: Volume, profile: DiskProfile) -> Self {
        Self { volume, profile }
    }

    pub fn of(volume: Volume) -> Self {
        let profile = DiskProfile::from_volume(&volume);
        Self { volume, profile }
    }
}

/// Everything the scheduler needs to know about the workload
#[derive(Debug, Clone)]
pub struct VmProfile {
    pub vm: VirtualMachine,
    pub service_offering: ServiceOffering,
    pub template: Option<Template>,
    /// Overrides for volumes whose requested sizing differs from the record
    pub disks: Vec<DiskProfile>,
}

impl VmProfile {
    pub fn new(vm: VirtualMachine, service_offering: ServiceOffering) -> Self {
        Self {
            vm,
            service_offering,
            template: None,
            disks: Vec::new(),
        }
    }

    pub fn profile_for(&self, volume: &Volume) -> DiskProfile {
        self.disks
            .iter()
            .find(|d| d.volume_id == volume.id)
            .cloned()
            .unwrap_or_else(|| DiskProfile::from_volume(volume))
    }
}

// =============================================================================
// Destination
// =============================================================================

/// Scheduler output: one host plus one pool per volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    pub zone_id: ZoneId,
    pub pod_id: PodId,
    pub cluster_id: ClusterId,
    pub host_id: HostId,
    pub storage: BTreeMap<VolumeId, PoolId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(id: u64, cluster: u64) -> Host {
        Host {
            id: HostId(id),
            name: format!("host-{}", id),
            zone_id: ZoneId(1),
            pod_id: PodId(1),
            cluster_id: ClusterId(cluster),
            status: HostStatus::Up,
            resource_state: ResourceState::Enabled,
            hypervisor: HypervisorType::Kvm,
            arch: "x86_64".into(),
            storage_access_groups: vec![],
            cpu_cores: 8,
            cpu_speed_mhz: 2000,
            used_cpu_mhz: 0,
            total_memory_bytes: 1 << 34,
            used_memory_bytes: 0,
            free_gpus: 0,
            running_guests: 0,
            max_guests: None,
            supports_volume_encryption: false,
            reservation: None,
        }
    }

    #[test]
    fn test_exclude_list_inherits_ancestors() {
        let mut avoid = ExcludeList::new();
        avoid.add_cluster(ClusterId(2));

        assert!(avoid.should_avoid_host(&host(10, 2)));
        assert!(!avoid.should_avoid_host(&host(11, 3)));

        avoid.add_zone(ZoneId(1));
        assert!(avoid.should_avoid_host(&host(11, 3)));
    }

    #[test]
    fn test_plan_prohibit_host() {
        let mut plan = DeploymentPlan::new(ZoneId(1));
        plan.prohibit_host(HostId(5));
        assert_eq!(plan.host_priorities[&HostId(5)], PROHIBITED_HOST_PRIORITY);
    }
}

//! Record builders with workable defaults
//!
//! Zone 1 / pod 1 / cluster 1 unless told otherwise; callers adjust the
//! returned record's fields directly.

use crate::domain::*;
use chrono::{Duration, Utc};

pub const GB: u64 = 1 << 30;

pub fn zone(id: u64) -> Zone {
    Zone {
        id: ZoneId(id),
        name: format!("zone-{}", id),
        allocation_state: AllocationState::Enabled,
        storage_access_groups: vec![],
    }
}

pub fn pod(id: u64, zone_id: u64) -> Pod {
    Pod {
        id: PodId(id),
        name: format!("pod-{}", id),
        zone_id: ZoneId(zone_id),
        allocation_state: AllocationState::Enabled,
        storage_access_groups: vec![],
    }
}

pub fn cluster(id: u64) -> Cluster {
    Cluster {
        id: ClusterId(id),
        name: format!("cluster-{}", id),
        zone_id: ZoneId(1),
        pod_id: PodId(1),
        hypervisor: HypervisorType::Kvm,
        allocation_state: AllocationState::Enabled,
        supports_resigning: false,
        storage_access_groups: vec![],
    }
}

pub fn host(id: u64, cluster_id: u64) -> Host {
    Host {
        id: HostId(id),
        name: format!("host-{}", id),
        zone_id: ZoneId(1),
        pod_id: PodId(1),
        cluster_id: ClusterId(cluster_id),
        status: HostStatus::Up,
        resource_state: ResourceState::Enabled,
        hypervisor: HypervisorType::Kvm,
        arch: "x86_64".to_string(),
        storage_access_groups: vec![],
        cpu_cores: 16,
        cpu_speed_mhz: 2400,
        used_cpu_mhz: 0,
        total_memory_bytes: 64 * GB,
        used_memory_bytes: 0,
        free_gpus: 0,
        running_guests: 0,
        max_guests: None,
        supports_volume_encryption: false,
        reservation: None,
    }
}

/// Cluster-scoped NFS pool in cluster 1
pub fn pool(id: u64, capacity_bytes: u64) -> StoragePool {
    StoragePool {
        id: PoolId(id),
        name: format!("pool-{}", id),
        uuid: format!("pool-uuid-{}", id),
        zone_id: ZoneId(1),
        pod_id: Some(PodId(1)),
        cluster_id: Some(ClusterId(1)),
        host_id: None,
        scope: PoolScope::Cluster,
        pool_type: StoragePoolType::NetworkFilesystem,
        status: StoragePoolStatus::Up,
        capacity_bytes,
        used_bytes: 0,
        capacity_iops: None,
        provider_name: "DefaultPrimary".to_string(),
        managed: false,
        parent: None,
        hypervisor: None,
        storage_access_groups: vec![],
        path: format!("/export/pool-{}", id),
    }
}

/// Unplaced volume on disk offering 1
pub fn volume(id: u64, size_bytes: u64) -> Volume {
    Volume {
        id: VolumeId(id),
        name: format!("vol-{}", id),
        instance_id: None,
        pool_id: None,
        state: VolumeState::Allocated,
        volume_type: VolumeType::DataDisk,
        size_bytes,
        disk_offering_id: DiskOfferingId(1),
        min_iops: None,
        max_iops: None,
        hypervisor_snapshot_reserve: None,
        template_id: None,
        passphrase_id: None,
        path: None,
        updated_at: Utc::now() - Duration::days(30),
    }
}

pub fn disk_offering(id: u64) -> DiskOffering {
    DiskOffering {
        id: DiskOfferingId(id),
        name: format!("disk-offering-{}", id),
        size_bytes: 10 * GB,
        min_iops: None,
        max_iops: None,
        hypervisor_snapshot_reserve: None,
        use_local_storage: false,
    }
}

pub fn service_offering(id: u64) -> ServiceOffering {
    ServiceOffering {
        id: ServiceOfferingId(id),
        name: format!("offering-{}", id),
        cpus: 2,
        speed_mhz: 1000,
        memory_bytes: 2 * GB,
        gpus: 0,
        planner: None,
    }
}

pub fn vm(id: u64) -> VirtualMachine {
    VirtualMachine {
        id: VmId(id),
        name: format!("i-{}", id),
        vm_type: VmType::User,
        state: VmState::Stopped,
        host_id: None,
        last_host_id: None,
        owner_is_admin: false,
        service_offering_id: ServiceOfferingId(1),
        template_id: None,
        hypervisor: HypervisorType::Kvm,
    }
}

pub fn template(id: u64, size_bytes: u64) -> Template {
    Template {
        id: TemplateId(id),
        name: format!("template-{}", id),
        size_bytes,
        format: ImageFormat::Qcow2,
        hypervisor: Some(HypervisorType::Kvm),
        state: TemplateState::Active,
    }
}

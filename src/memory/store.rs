//! In-Memory Repository
//!
//! Concurrent in-memory implementation of [`ResourceRepository`] and
//! [`ArtifactCatalog`] backed by DashMap tables. Compare-and-swap updates
//! hold the record's shard lock between the compare and the write, which
//! gives the same lost-update protection as a row lock.

use crate::domain::*;
use crate::error::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::hash::Hash;
use std::path::Path;

// =============================================================================
// Inventory
// =============================================================================

/// Seed data for the in-memory store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Inventory {
    pub zones: Vec<Zone>,
    pub pods: Vec<Pod>,
    pub clusters: Vec<Cluster>,
    pub hosts: Vec<Host>,
    pub pools: Vec<StoragePool>,
    pub pool_host_refs: Vec<PoolHostRef>,
    pub volumes: Vec<Volume>,
    pub vms: Vec<VirtualMachine>,
    pub disk_offerings: Vec<DiskOffering>,
    pub service_offerings: Vec<ServiceOffering>,
    pub templates: Vec<Template>,
    pub template_pool_refs: Vec<TemplatePoolRef>,
    pub snapshots: Vec<Snapshot>,
    pub snapshot_store_refs: Vec<SnapshotStoreRef>,
    pub download_urls: Vec<DownloadUrl>,
}

impl Inventory {
    /// Load a YAML inventory, or JSON when the file ends in `.json`
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        if path.extension().is_some_and(|ext| ext == "json") {
            return Ok(serde_json::from_str(&contents)?);
        }
        Ok(serde_yaml::from_str(&contents)?)
    }
}

// =============================================================================
// In-Memory Store
// =============================================================================

/// DashMap-backed store used by tests and the standalone binary
#[derive(Default)]
pub struct InMemoryStore {
    zones: DashMap<ZoneId, Zone>,
    pods: DashMap<PodId, Pod>,
    clusters: DashMap<ClusterId, Cluster>,
    hosts: DashMap<HostId, Host>,
    pools: DashMap<PoolId, StoragePool>,
    pool_host_refs: DashMap<(PoolId, HostId), PoolHostRef>,
    volumes: DashMap<VolumeId, Volume>,
    vms: DashMap<VmId, VirtualMachine>,
    disk_offerings: DashMap<DiskOfferingId, DiskOffering>,
    service_offerings: DashMap<ServiceOfferingId, ServiceOffering>,
    templates: DashMap<TemplateId, Template>,
    template_pool_refs: DashMap<(TemplateId, PoolId), TemplatePoolRef>,
    snapshots: DashMap<SnapshotId, Snapshot>,
    snapshot_store_refs: DashMap<(SnapshotId, PoolId), SnapshotStoreRef>,
    download_urls: DashMap<u64, DownloadUrl>,
    capacity: DashMap<(CapacityOwner, CapacityType), CapacityRecord>,
}

/// Values of a table matching a predicate, ordered by key
fn select<K, V, F>(table: &DashMap<K, V>, mut pred: F) -> Vec<V>
where
    K: Eq + Hash + Ord + Copy,
    V: Clone,
    F: FnMut(&V) -> bool,
{
    let mut rows: Vec<(K, V)> = table
        .iter()
        .filter(|r| pred(r.value()))
        .map(|r| (*r.key(), r.value().clone()))
        .collect();
    rows.sort_by(|a, b| a.0.cmp(&b.0));
    rows.into_iter().map(|(_, v)| v).collect()
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_inventory(inventory: Inventory) -> Self {
        let store = Self::new();
        store.load(inventory);
        store
    }

    /// Insert every record of an inventory, replacing existing ids
    pub fn load(&self, inventory: Inventory) {
        for z in inventory.zones {
            self.put_zone(z);
        }
        for p in inventory.pods {
            self.put_pod(p);
        }
        for c in inventory.clusters {
            self.put_cluster(c);
        }
        for h in inventory.hosts {
            self.put_host(h);
        }
        for p in inventory.pools {
            self.put_pool(p);
        }
        for r in inventory.pool_host_refs {
            self.pool_host_refs.insert((r.pool_id, r.host_id), r);
        }
        for v in inventory.volumes {
            self.put_volume(v);
        }
        for vm in inventory.vms {
            self.put_vm(vm);
        }
        for o in inventory.disk_offerings {
            self.put_disk_offering(o);
        }
        for o in inventory.service_offerings {
            self.put_service_offering(o);
        }
        for t in inventory.templates {
            self.put_template(t);
        }
        for r in inventory.template_pool_refs {
            self.put_template_pool_ref(r);
        }
        for s in inventory.snapshots {
            self.put_snapshot(s);
        }
        for r in inventory.snapshot_store_refs {
            self.put_snapshot_store_ref(r);
        }
        for u in inventory.download_urls {
            self.put_download_url(u);
        }
    }

    // ---- direct record access, used for seeding and inspection ----

    pub fn put_zone(&self, zone: Zone) {
        self.zones.insert(zone.id, zone);
    }

    pub fn put_pod(&self, pod: Pod) {
        self.pods.insert(pod.id, pod);
    }

    pub fn put_cluster(&self, cluster: Cluster) {
        self.clusters.insert(cluster.id, cluster);
    }

    pub fn put_host(&self, host: Host) {
        self.hosts.insert(host.id, host);
    }

    pub fn put_pool(&self, pool: StoragePool) {
        self.pools.insert(pool.id, pool);
    }

    pub fn put_volume(&self, volume: Volume) {
        self.volumes.insert(volume.id, volume);
    }

    pub fn put_vm(&self, vm: VirtualMachine) {
        self.vms.insert(vm.id, vm);
    }

    pub fn put_disk_offering(&self, offering: DiskOffering) {
        self.disk_offerings.insert(offering.id, offering);
    }

    pub fn put_service_offering(&self, offering: ServiceOffering) {
        self.service_offerings.insert(offering.id, offering);
    }

    pub fn put_template(&self, template: Template) {
        self.templates.insert(template.id, template);
    }

    pub fn put_template_pool_ref(&self, r: TemplatePoolRef) {
        self.template_pool_refs.insert((r.template_id, r.pool_id), r);
    }

    pub fn put_snapshot(&self, snapshot: Snapshot) {
        self.snapshots.insert(snapshot.id, snapshot);
    }

    pub fn put_snapshot_store_ref(&self, r: SnapshotStoreRef) {
        self.snapshot_store_refs.insert((r.snapshot_id, r.pool_id), r);
    }

    pub fn put_download_url(&self, url: DownloadUrl) {
        self.download_urls.insert(url.id, url);
    }

    pub fn pool(&self, id: PoolId) -> Option<StoragePool> {
        self.pools.get(&id).map(|r| r.value().clone())
    }

    pub fn volume(&self, id: VolumeId) -> Option<Volume> {
        self.volumes.get(&id).map(|r| r.value().clone())
    }

    pub fn host(&self, id: HostId) -> Option<Host> {
        self.hosts.get(&id).map(|r| r.value().clone())
    }

    pub fn service_offering(&self, id: ServiceOfferingId) -> Option<ServiceOffering> {
        self.service_offerings.get(&id).map(|r| r.value().clone())
    }

    pub fn vm(&self, id: VmId) -> Option<VirtualMachine> {
        self.vms.get(&id).map(|r| r.value().clone())
    }

    pub fn template_pool_ref(&self, template: TemplateId, pool: PoolId) -> Option<TemplatePoolRef> {
        self.template_pool_refs
            .get(&(template, pool))
            .map(|r| r.value().clone())
    }

    pub fn snapshot(&self, id: SnapshotId) -> Option<Snapshot> {
        self.snapshots.get(&id).map(|r| r.value().clone())
    }

    pub fn template(&self, id: TemplateId) -> Option<Template> {
        self.templates.get(&id).map(|r| r.value().clone())
    }

    pub fn connected_hosts(&self, pool: PoolId) -> Vec<HostId> {
        let mut hosts: Vec<HostId> = self
            .pool_host_refs
            .iter()
            .filter(|r| r.key().0 == pool)
            .map(|r| r.key().1)
            .collect();
        hosts.sort();
        hosts
    }

    pub fn download_url_count(&self) -> usize {
        self.download_urls.len()
    }

    /// Force a pool status, bypassing the compare step
    pub fn force_pool_status(&self, id: PoolId, status: StoragePoolStatus) {
        if let Some(mut pool) = self.pools.get_mut(&id) {
            pool.status = status;
        }
    }
}

#[async_trait]
impl ResourceRepository for InMemoryStore {
    async fn find_zone(&self, id: ZoneId) -> Result<Option<Zone>> {
        Ok(self.zones.get(&id).map(|r| r.value().clone()))
    }

    async fn find_pod(&self, id: PodId) -> Result<Option<Pod>> {
        Ok(self.pods.get(&id).map(|r| r.value().clone()))
    }

    async fn find_cluster(&self, id: ClusterId) -> Result<Option<Cluster>> {
        Ok(self.clusters.get(&id).map(|r| r.value().clone()))
    }

    async fn list_pods_in_zone(&self, zone_id: ZoneId) -> Result<Vec<Pod>> {
        Ok(select(&self.pods, |p| p.zone_id == zone_id))
    }

    async fn list_clusters_in_zone(&self, zone_id: ZoneId) -> Result<Vec<Cluster>> {
        Ok(select(&self.clusters, |c| c.zone_id == zone_id))
    }

    async fn find_host(&self, id: HostId) -> Result<Option<Host>> {
        Ok(self.host(id))
    }

    async fn find_hosts(&self, ids: &[HostId]) -> Result<Vec<Host>> {
        Ok(ids.iter().filter_map(|id| self.host(*id)).collect())
    }

    async fn list_hosts_in_cluster(&self, cluster_id: ClusterId) -> Result<Vec<Host>> {
        Ok(select(&self.hosts, |h| {
            h.cluster_id == cluster_id && h.status != HostStatus::Removed
        }))
    }

    async fn list_hosts_in_zone(&self, zone_id: ZoneId) -> Result<Vec<Host>> {
        Ok(select(&self.hosts, |h| {
            h.zone_id == zone_id && h.status != HostStatus::Removed
        }))
    }

    async fn update_host_reservation_if(
        &self,
        id: HostId,
        expected: Option<PlannerResourceUsage>,
        next: Option<PlannerResourceUsage>,
    ) -> Result<u64> {
        match self.hosts.get_mut(&id) {
            Some(mut host) if host.reservation == expected => {
                host.reservation = next;
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn find_pool(&self, id: PoolId) -> Result<Option<StoragePool>> {
        Ok(self.pool(id))
    }

    async fn find_pool_by_uuid(&self, uuid: &str) -> Result<Option<StoragePool>> {
        Ok(select(&self.pools, |p| p.uuid == uuid).into_iter().next())
    }

    async fn list_pools_by_scope(
        &self,
        zone_id: ZoneId,
        cluster_id: Option<ClusterId>,
        scope: PoolScope,
    ) -> Result<Vec<StoragePool>> {
        Ok(select(&self.pools, |p| {
            p.zone_id == zone_id
                && p.scope == scope
                && p.status != StoragePoolStatus::Removed
                && cluster_id.map_or(true, |c| p.cluster_id == Some(c))
        }))
    }

    async fn list_pools_in_zone(&self, zone_id: ZoneId) -> Result<Vec<StoragePool>> {
        Ok(select(&self.pools, |p| {
            p.zone_id == zone_id && p.status != StoragePoolStatus::Removed
        }))
    }

    async fn list_all_pools(&self) -> Result<Vec<StoragePool>> {
        Ok(select(&self.pools, |p| p.status != StoragePoolStatus::Removed))
    }

    async fn list_child_pools(&self, parent: PoolId) -> Result<Vec<StoragePool>> {
        Ok(select(&self.pools, |p| p.parent == Some(parent)))
    }

    async fn insert_pool(&self, pool: StoragePool) -> Result<()> {
        if self.pools.contains_key(&pool.id) {
            return Err(Error::InvalidInput(format!("pool {} already exists", pool.id)));
        }
        self.put_pool(pool);
        Ok(())
    }

    async fn update_pool_status_if(
        &self,
        id: PoolId,
        expected: StoragePoolStatus,
        next: StoragePoolStatus,
    ) -> Result<u64> {
        match self.pools.get_mut(&id) {
            Some(mut pool) if pool.status == expected => {
                pool.status = next;
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn update_pool_bytes(&self, id: PoolId, capacity_bytes: u64, used_bytes: u64) -> Result<()> {
        let mut pool = self
            .pools
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("pool", id))?;
        pool.capacity_bytes = capacity_bytes;
        pool.used_bytes = used_bytes;
        Ok(())
    }

    async fn remove_pool(&self, id: PoolId) -> Result<()> {
        self.pools.remove(&id);
        self.pool_host_refs.retain(|(pool, _), _| *pool != id);
        self.capacity.retain(|(owner, _), _| *owner != CapacityOwner::Pool(id));
        Ok(())
    }

    async fn list_pool_host_refs(&self, pool_id: PoolId) -> Result<Vec<PoolHostRef>> {
        let mut refs: Vec<PoolHostRef> = self
            .pool_host_refs
            .iter()
            .filter(|r| r.key().0 == pool_id)
            .map(|r| r.value().clone())
            .collect();
        refs.sort_by_key(|r| r.host_id);
        Ok(refs)
    }

    async fn upsert_pool_host_ref(&self, link: PoolHostRef) -> Result<()> {
        self.pool_host_refs.insert((link.pool_id, link.host_id), link);
        Ok(())
    }

    async fn delete_pool_host_ref(&self, pool_id: PoolId, host_id: HostId) -> Result<()> {
        self.pool_host_refs.remove(&(pool_id, host_id));
        Ok(())
    }

    async fn find_volume(&self, id: VolumeId) -> Result<Option<Volume>> {
        Ok(self.volume(id))
    }

    async fn list_volumes_by_instance(&self, vm_id: VmId) -> Result<Vec<Volume>> {
        Ok(select(&self.volumes, |v| {
            v.instance_id == Some(vm_id) && v.state != VolumeState::Expunged
        }))
    }

    async fn list_volumes_by_pool(&self, pool_id: PoolId) -> Result<Vec<Volume>> {
        Ok(select(&self.volumes, |v| {
            v.pool_id == Some(pool_id) && v.state != VolumeState::Expunged
        }))
    }

    async fn list_volumes_in_state(&self, state: VolumeState) -> Result<Vec<Volume>> {
        Ok(select(&self.volumes, |v| v.state == state))
    }

    async fn set_volume_pool(&self, id: VolumeId, pool_id: Option<PoolId>) -> Result<()> {
        let mut volume = self
            .volumes
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("volume", id))?;
        volume.pool_id = pool_id;
        Ok(())
    }

    async fn set_volume_state(&self, id: VolumeId, state: VolumeState) -> Result<()> {
        let mut volume = self
            .volumes
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("volume", id))?;
        volume.state = state;
        volume.updated_at = chrono::Utc::now();
        Ok(())
    }

    async fn set_volume_snapshot_reserve(&self, id: VolumeId, reserve: u32) -> Result<()> {
        let mut volume = self
            .volumes
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("volume", id))?;
        volume.hypervisor_snapshot_reserve = Some(reserve);
        Ok(())
    }

    async fn remove_volume(&self, id: VolumeId) -> Result<()> {
        self.volumes.remove(&id);
        Ok(())
    }

    async fn allocated_bytes_on_pool(&self, pool_id: PoolId) -> Result<u64> {
        let volumes: u64 = self
            .volumes
            .iter()
            .filter(|v| v.pool_id == Some(pool_id) && v.state != VolumeState::Expunged)
            .map(|v| v.size_bytes)
            .sum();
        let templates: u64 = self
            .template_pool_refs
            .iter()
            .filter(|r| r.pool_id == pool_id)
            .map(|r| r.size_bytes)
            .sum();
        Ok(volumes + templates)
    }

    async fn used_iops_on_pool(&self, pool_id: PoolId) -> Result<u64> {
        Ok(self
            .volumes
            .iter()
            .filter(|v| v.pool_id == Some(pool_id) && v.state != VolumeState::Expunged)
            .filter_map(|v| v.min_iops)
            .sum())
    }

    async fn find_vm(&self, id: VmId) -> Result<Option<VirtualMachine>> {
        Ok(self.vm(id))
    }

    async fn find_disk_offering(&self, id: DiskOfferingId) -> Result<Option<DiskOffering>> {
        Ok(self.disk_offerings.get(&id).map(|r| r.value().clone()))
    }

    async fn find_template(&self, id: TemplateId) -> Result<Option<Template>> {
        Ok(self.template(id))
    }

    async fn find_template_pool_ref(
        &self,
        template_id: TemplateId,
        pool_id: PoolId,
    ) -> Result<Option<TemplatePoolRef>> {
        Ok(self.template_pool_ref(template_id, pool_id))
    }

    async fn upsert_capacity_record(&self, record: CapacityRecord) -> Result<()> {
        self.capacity
            .insert((record.owner, record.capacity_type), record);
        Ok(())
    }

    async fn find_capacity_record(
        &self,
        owner: CapacityOwner,
        capacity_type: CapacityType,
    ) -> Result<Option<CapacityRecord>> {
        Ok(self
            .capacity
            .get(&(owner, capacity_type))
            .map(|r| r.value().clone()))
    }
}

#[async_trait]
impl ArtifactCatalog for InMemoryStore {
    async fn list_unused_templates_on_pool(&self, pool_id: PoolId) -> Result<Vec<TemplatePoolRef>> {
        let mut unused: Vec<TemplatePoolRef> = self
            .template_pool_refs
            .iter()
            .filter(|r| r.pool_id == pool_id)
            .filter(|r| {
                !self.volumes.iter().any(|v| {
                    v.pool_id == Some(pool_id)
                        && v.template_id == Some(r.template_id)
                        && v.is_usable()
                })
            })
            .map(|r| r.value().clone())
            .collect();
        unused.sort_by_key(|r| r.template_id);
        Ok(unused)
    }

    async fn mark_template_for_gc(&self, template_id: TemplateId, pool_id: PoolId) -> Result<()> {
        let mut r = self
            .template_pool_refs
            .get_mut(&(template_id, pool_id))
            .ok_or_else(|| Error::not_found("template_pool_ref", template_id))?;
        r.marked_for_gc = true;
        Ok(())
    }

    async fn remove_template_pool_ref(&self, template_id: TemplateId, pool_id: PoolId) -> Result<()> {
        self.template_pool_refs.remove(&(template_id, pool_id));
        Ok(())
    }

    async fn list_snapshot_refs_in_state(&self, state: SnapshotState) -> Result<Vec<SnapshotStoreRef>> {
        let mut refs: Vec<SnapshotStoreRef> = self
            .snapshot_store_refs
            .iter()
            .filter(|r| r.state == state)
            .map(|r| r.value().clone())
            .collect();
        refs.sort_by_key(|r| (r.snapshot_id, r.pool_id));
        Ok(refs)
    }

    async fn delete_snapshot_ref(&self, snapshot_id: SnapshotId, pool_id: PoolId) -> Result<()> {
        self.snapshot_store_refs.remove(&(snapshot_id, pool_id));
        Ok(())
    }

    async fn list_snapshots_in_state(&self, state: SnapshotState) -> Result<Vec<Snapshot>> {
        Ok(select(&self.snapshots, |s| s.state == state))
    }

    async fn expunge_snapshot(&self, id: SnapshotId) -> Result<()> {
        self.snapshot_store_refs.retain(|(snap, _), _| *snap != id);
        let mut snapshot = self
            .snapshots
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("snapshot", id))?;
        snapshot.state = SnapshotState::Destroyed;
        Ok(())
    }

    async fn list_templates_in_states(&self, states: &[TemplateState]) -> Result<Vec<Template>> {
        Ok(select(&self.templates, |t| states.contains(&t.state)))
    }

    async fn set_template_state(&self, id: TemplateId, state: TemplateState) -> Result<()> {
        let mut template = self
            .templates
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("template", id))?;
        template.state = state;
        Ok(())
    }

    async fn list_download_urls(&self) -> Result<Vec<DownloadUrl>> {
        Ok(select(&self.download_urls, |_| true))
    }

    async fn remove_download_url(&self, id: u64) -> Result<()> {
        self.download_urls.remove(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::fixtures;

    #[tokio::test]
    async fn test_pool_status_compare_and_swap() {
        let store = InMemoryStore::new();
        store.put_pool(fixtures::pool(1, 1000));

        let rows = store
            .update_pool_status_if(PoolId(1), StoragePoolStatus::Up, StoragePoolStatus::Disabled)
            .await
            .unwrap();
        assert_eq!(rows, 1);

        // Stale expectation loses the race
        let rows = store
            .update_pool_status_if(PoolId(1), StoragePoolStatus::Up, StoragePoolStatus::Maintenance)
            .await
            .unwrap();
        assert_eq!(rows, 0);
        assert_eq!(store.pool(PoolId(1)).unwrap().status, StoragePoolStatus::Disabled);
    }

    #[tokio::test]
    async fn test_allocated_bytes_counts_templates_and_skips_expunged() {
        let store = InMemoryStore::new();
        store.put_pool(fixtures::pool(1, 1000));

        let mut live = fixtures::volume(1, 100);
        live.pool_id = Some(PoolId(1));
        store.put_volume(live);

        let mut gone = fixtures::volume(2, 300);
        gone.pool_id = Some(PoolId(1));
        gone.state = VolumeState::Expunged;
        store.put_volume(gone);

        store.put_template_pool_ref(TemplatePoolRef {
            template_id: TemplateId(9),
            pool_id: PoolId(1),
            download_state: DownloadState::Downloaded,
            marked_for_gc: false,
            size_bytes: 50,
        });

        assert_eq!(store.allocated_bytes_on_pool(PoolId(1)).await.unwrap(), 150);
    }

    #[tokio::test]
    async fn test_unused_templates_ignore_referenced_copies() {
        let store = InMemoryStore::new();
        for t in [1, 2] {
            store.put_template_pool_ref(TemplatePoolRef {
                template_id: TemplateId(t),
                pool_id: PoolId(1),
                download_state: DownloadState::Downloaded,
                marked_for_gc: false,
                size_bytes: 10,
            });
        }
        let mut vol = fixtures::volume(1, 100);
        vol.pool_id = Some(PoolId(1));
        vol.template_id = Some(TemplateId(1));
        vol.state = VolumeState::Ready;
        store.put_volume(vol);

        let unused = store.list_unused_templates_on_pool(PoolId(1)).await.unwrap();
        assert_eq!(unused.len(), 1);
        assert_eq!(unused[0].template_id, TemplateId(2));
    }

    #[test]
    fn test_inventory_yaml() {
        let yaml = r#"
zones:
  - id: 1
    name: zone-1
pools:
  - id: 10
    name: nfs-1
    uuid: 5f1c
    zone_id: 1
    cluster_id: 2
    capacity_bytes: 1000
    storage_access_groups: [ssd]
"#;
        let inventory: Inventory = serde_yaml::from_str(yaml).unwrap();
        let store = InMemoryStore::from_inventory(inventory);
        let pool = store.pool(PoolId(10)).unwrap();
        assert_eq!(pool.scope, PoolScope::Cluster);
        assert_eq!(pool.status, StoragePoolStatus::Up);
        assert_eq!(pool.storage_access_groups, vec!["ssd".to_string()]);
    }

    #[test]
    fn test_inventory_json_file() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        std::io::Write::write_all(
            &mut file,
            br#"{"hosts": [], "volumes": [{"id": 3, "name": "vol-3", "size_bytes": 10, "disk_offering_id": 1}]}"#,
        )
        .unwrap();

        let inventory = Inventory::from_file(file.path()).unwrap();
        assert_eq!(inventory.volumes.len(), 1);
        assert_eq!(inventory.volumes[0].state, VolumeState::Allocated);

        let mut broken = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        std::io::Write::write_all(&mut broken, b"{").unwrap();
        assert!(matches!(
            Inventory::from_file(broken.path()),
            Err(Error::JsonParse(_))
        ));
    }
}

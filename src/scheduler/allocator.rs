//! Storage pool allocators
//!
//! Allocators propose candidate pools for one disk on one host. Capacity and
//! access checks are applied by the caller; allocators only narrow by scope,
//! status and the exclude list.

use crate::domain::*;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;

pub const LOCAL_ALLOCATOR: &str = "LocalStoragePoolAllocator";
pub const CLUSTER_SCOPE_ALLOCATOR: &str = "ClusterScopeStoragePoolAllocator";
pub const ZONE_WIDE_ALLOCATOR: &str = "ZoneWideStoragePoolAllocator";

/// One disk to place on one host
#[derive(Debug, Clone, Copy)]
pub struct PoolRequest<'a> {
    pub disk: &'a DiskProfile,
    pub vm: &'a VirtualMachine,
    pub host: &'a Host,
    pub avoid: &'a ExcludeList,
}

#[async_trait]
pub trait StoragePoolAllocator: Send + Sync {
    fn name(&self) -> &str;

    async fn allocate(&self, request: PoolRequest<'_>) -> Result<Vec<StoragePool>>;
}

pub type StoragePoolAllocatorRef = Arc<dyn StoragePoolAllocator>;

/// Pools in Up state that are not avoided; datastore-cluster parents hold no volumes
fn allocatable(pool: &StoragePool, avoid: &ExcludeList) -> bool {
    pool.status == StoragePoolStatus::Up && !pool.is_datastore_cluster() && !avoid.should_avoid_pool(pool)
}

// =============================================================================
// Allocators
// =============================================================================

/// Host-local pools of the candidate host
pub struct LocalStoragePoolAllocator {
    repo: ResourceRepositoryRef,
}

impl LocalStoragePoolAllocator {
    pub fn new(repo: ResourceRepositoryRef) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl StoragePoolAllocator for LocalStoragePoolAllocator {
    fn name(&self) -> &str {
        LOCAL_ALLOCATOR
    }

    async fn allocate(&self, request: PoolRequest<'_>) -> Result<Vec<StoragePool>> {
        if !request.disk.use_local_storage {
            return Ok(Vec::new());
        }
        let host = request.host;
        let pools = self
            .repo
            .list_pools_by_scope(host.zone_id, Some(host.cluster_id), PoolScope::Host)
            .await?;
        Ok(pools
            .into_iter()
            .filter(|p| p.host_id == Some(host.id) && allocatable(p, request.avoid))
            .collect())
    }
}

/// Shared pools of the host's cluster
pub struct ClusterScopeStoragePoolAllocator {
    repo: ResourceRepositoryRef,
}

impl ClusterScopeStoragePoolAllocator {
    pub fn new(repo: ResourceRepositoryRef) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl StoragePoolAllocator for ClusterScopeStoragePoolAllocator {
    fn name(&self) -> &str {
        CLUSTER_SCOPE_ALLOCATOR
    }

    async fn allocate(&self, request: PoolRequest<'_>) -> Result<Vec<StoragePool>> {
        if request.disk.use_local_storage {
            return Ok(Vec::new());
        }
        let host = request.host;
        let pools = self
            .repo
            .list_pools_by_scope(host.zone_id, Some(host.cluster_id), PoolScope::Cluster)
            .await?;
        Ok(pools
            .into_iter()
            .filter(|p| allocatable(p, request.avoid))
            .collect())
    }
}

/// Zone-wide pools usable by the VM's hypervisor
pub struct ZoneWideStoragePoolAllocator {
    repo: ResourceRepositoryRef,
}

impl ZoneWideStoragePoolAllocator {
    pub fn new(repo: ResourceRepositoryRef) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl StoragePoolAllocator for ZoneWideStoragePoolAllocator {
    fn name(&self) -> &str {
        ZONE_WIDE_ALLOCATOR
    }

    async fn allocate(&self, request: PoolRequest<'_>) -> Result<Vec<StoragePool>> {
        if request.disk.use_local_storage {
            return Ok(Vec::new());
        }
        let pools = self
            .repo
            .list_pools_by_scope(request.host.zone_id, None, PoolScope::Zone)
            .await?;
        Ok(pools
            .into_iter()
            .filter(|p| p.hypervisor.map_or(true, |hv| hv == request.vm.hypervisor))
            .filter(|p| allocatable(p, request.avoid))
            .collect())
    }
}

// =============================================================================
// Allocator Chain
// =============================================================================

/// Allocators in configured order
pub struct AllocatorChain {
    allocators: Vec<StoragePoolAllocatorRef>,
}

impl AllocatorChain {
    /// Build the chain from configured names; unknown names are a configuration error
    pub fn from_names(repo: ResourceRepositoryRef, names: &[String]) -> Result<Self> {
        let mut allocators: Vec<StoragePoolAllocatorRef> = Vec::with_capacity(names.len());
        for name in names {
            let allocator: StoragePoolAllocatorRef = match name.as_str() {
                LOCAL_ALLOCATOR => Arc::new(LocalStoragePoolAllocator::new(repo.clone())),
                CLUSTER_SCOPE_ALLOCATOR => {
                    Arc::new(ClusterScopeStoragePoolAllocator::new(repo.clone()))
                }
                ZONE_WIDE_ALLOCATOR => Arc::new(ZoneWideStoragePoolAllocator::new(repo.clone())),
                other => {
                    return Err(Error::Configuration(format!(
                        "unknown storage pool allocator: {}",
                        other
                    )))
                }
            };
            allocators.push(allocator);
        }
        Ok(Self { allocators })
    }

    pub fn new(allocators: Vec<StoragePoolAllocatorRef>) -> Self {
        Self { allocators }
    }

    /// Candidates from every allocator, in chain order, without duplicates
    pub async fn candidates(&self, request: PoolRequest<'_>) -> Result<Vec<StoragePool>> {
        let mut pools: Vec<StoragePool> = Vec::new();
        for allocator in &self.allocators {
            for pool in allocator.allocate(request).await? {
                if !pools.iter().any(|p| p.id == pool.id) {
                    pools.push(pool);
                }
            }
        }
        Ok(pools)
    }

    pub fn names(&self) -> Vec<&str> {
        self.allocators.iter().map(|a| a.name()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::memory::{fixtures, InMemoryStore};
    use assert_matches::assert_matches;

    fn store() -> Arc<InMemoryStore> {
        let store = Arc::new(InMemoryStore::new());

        let mut local = fixtures::pool(1, 100);
        local.scope = PoolScope::Host;
        local.host_id = Some(HostId(1));
        store.put_pool(local);

        store.put_pool(fixtures::pool(2, 100));

        let mut other_cluster = fixtures::pool(3, 100);
        other_cluster.cluster_id = Some(ClusterId(2));
        store.put_pool(other_cluster);

        let mut zone_wide = fixtures::pool(4, 100);
        zone_wide.scope = PoolScope::Zone;
        zone_wide.cluster_id = None;
        store.put_pool(zone_wide);

        let mut vmware_only = fixtures::pool(5, 100);
        vmware_only.scope = PoolScope::Zone;
        vmware_only.cluster_id = None;
        vmware_only.hypervisor = Some(HypervisorType::VMware);
        store.put_pool(vmware_only);

        let mut maintained = fixtures::pool(6, 100);
        maintained.status = StoragePoolStatus::Maintenance;
        store.put_pool(maintained);

        store
    }

    fn chain(store: Arc<InMemoryStore>) -> AllocatorChain {
        AllocatorChain::from_names(store, &EngineConfig::default().pool_allocators).unwrap()
    }

    #[tokio::test]
    async fn test_shared_candidates_in_chain_order() {
        let chain = chain(store());
        let host = fixtures::host(1, 1);
        let vm = fixtures::vm(1);
        let disk = DiskProfile::from_volume(&fixtures::volume(1, 10));
        let avoid = ExcludeList::new();

        let pools = chain
            .candidates(PoolRequest {
                disk: &disk,
                vm: &vm,
                host: &host,
                avoid: &avoid,
            })
            .await
            .unwrap();
        let ids: Vec<PoolId> = pools.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![PoolId(2), PoolId(4)]);
    }

    #[tokio::test]
    async fn test_local_candidates_and_avoid() {
        let chain = chain(store());
        let host = fixtures::host(1, 1);
        let vm = fixtures::vm(1);
        let mut disk = DiskProfile::from_volume(&fixtures::volume(1, 10));
        disk.use_local_storage = true;

        let mut avoid = ExcludeList::new();
        let request = PoolRequest {
            disk: &disk,
            vm: &vm,
            host: &host,
            avoid: &avoid,
        };
        let ids: Vec<PoolId> = chain.candidates(request).await.unwrap().iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![PoolId(1)]);

        avoid.add_pool(PoolId(1));
        let request = PoolRequest {
            disk: &disk,
            vm: &vm,
            host: &host,
            avoid: &avoid,
        };
        assert!(chain.candidates(request).await.unwrap().is_empty());
    }

    #[test]
    fn test_unknown_allocator_name() {
        let names = vec!["RandomStoragePoolAllocator".to_string()];
        assert_matches!(
            AllocatorChain::from_names(Arc::new(InMemoryStore::new()), &names).map(|_| ()),
            Err(Error::Configuration(_))
        );
    }
}

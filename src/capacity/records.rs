//! Capacity records
//!
//! Keeps the per-pool `StorageAllocated` and `StorageUsed` rows in step with
//! the pool after connects, status changes and reclamation.

use super::admission::CapacityAdmissionChecker;
use crate::domain::*;
use crate::error::{Error, Result};
use std::sync::Arc;
use tracing::debug;

/// Recomputes capacity bookkeeping rows for pools
pub struct CapacityTracker {
    repo: ResourceRepositoryRef,
    admission: Arc<CapacityAdmissionChecker>,
}

impl CapacityTracker {
    pub fn new(repo: ResourceRepositoryRef, admission: Arc<CapacityAdmissionChecker>) -> Self {
        Self { repo, admission }
    }

    /// Rewrite both capacity rows of a pool from its current counters
    pub async fn recompute_pool(&self, pool_id: PoolId) -> Result<()> {
        let pool = self
            .repo
            .find_pool(pool_id)
            .await?
            .ok_or_else(|| Error::not_found("pool", pool_id))?;

        let state = self.record_state(&pool).await?;
        let allocated = self.repo.allocated_bytes_on_pool(pool.id).await?;
        let effective = self.admission.effective_capacity(&pool)?;

        let base = CapacityRecord {
            owner: CapacityOwner::Pool(pool.id),
            capacity_type: CapacityType::StorageAllocated,
            zone_id: pool.zone_id,
            pod_id: pool.pod_id,
            cluster_id: pool.cluster_id,
            allocated,
            total: effective,
            state,
        };
        self.repo.upsert_capacity_record(base.clone()).await?;
        self.repo
            .upsert_capacity_record(CapacityRecord {
                capacity_type: CapacityType::StorageUsed,
                allocated: pool.used_bytes,
                total: pool.capacity_bytes,
                ..base
            })
            .await?;

        debug!(
            pool_id = %pool.id,
            "Recomputed capacity: allocated {}/{}, used {}/{}, state {:?}",
            allocated, effective, pool.used_bytes, pool.capacity_bytes, state
        );
        Ok(())
    }

    /// Rows of pools in a disabled pool, cluster or zone are disabled too
    async fn record_state(&self, pool: &StoragePool) -> Result<CapacityState> {
        if pool.status == StoragePoolStatus::Disabled {
            return Ok(CapacityState::Disabled);
        }
        if let Some(cluster_id) = pool.cluster_id {
            if let Some(cluster) = self.repo.find_cluster(cluster_id).await? {
                if cluster.allocation_state == AllocationState::Disabled {
                    return Ok(CapacityState::Disabled);
                }
            }
        }
        if let Some(zone) = self.repo.find_zone(pool.zone_id).await? {
            if zone.allocation_state == AllocationState::Disabled {
                return Ok(CapacityState::Disabled);
            }
        }
        Ok(CapacityState::Enabled)
    }
}

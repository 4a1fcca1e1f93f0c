//! Capacity Admission Checker
//!
//! Answers whether a pool can take a set of volumes (bytes) or a number of
//! guaranteed IOPS. Decisions are computed from repository counters read on
//! every call; the checker holds no state and changes no capacity figures.

use crate::config::{EngineConfig, StorageThresholds};
use crate::domain::*;
use crate::error::{Error, Result};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

// =============================================================================
// Space Decision
// =============================================================================

/// Pure allocation-threshold arithmetic for one pool
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpaceCheck {
    /// Capacity after overprovisioning
    pub effective_capacity: u64,
    pub allocated: u64,
    pub asking: u64,
}

impl SpaceCheck {
    pub fn allocated_ratio(&self) -> f64 {
        if self.effective_capacity == 0 {
            return f64::INFINITY;
        }
        (self.allocated as f64 + self.asking as f64) / self.effective_capacity as f64
    }

    /// Threshold policy followed by the hard ceiling
    pub fn admits(&self, thresholds: &StorageThresholds, is_resize: bool) -> bool {
        let ratio = self.allocated_ratio();

        if ratio > thresholds.allocated_capacity_disable_threshold {
            if !is_resize || !thresholds.allow_resize_beyond_allocated_threshold {
                return false;
            }
            if ratio > thresholds.allocated_resize_disable_threshold {
                return false;
            }
        }

        self.effective_capacity >= self.allocated.saturating_add(self.asking)
    }
}

// =============================================================================
// Admission Checker
// =============================================================================

/// Capacity and IOPS admission for storage pools
pub struct CapacityAdmissionChecker {
    repo: ResourceRepositoryRef,
    drivers: StorageDriverProviderRef,
    config: Arc<EngineConfig>,
}

impl CapacityAdmissionChecker {
    pub fn new(
        repo: ResourceRepositoryRef,
        drivers: StorageDriverProviderRef,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            repo,
            drivers,
            config,
        }
    }

    /// Capacity available for allocation accounting
    pub fn effective_capacity(&self, pool: &StoragePool) -> Result<u64> {
        let caps = self.drivers.require(&pool.provider_name)?.capabilities();
        Ok(self.effective_capacity_with(pool, &caps))
    }

    fn effective_capacity_with(&self, pool: &StoragePool, caps: &DriverCapabilities) -> u64 {
        if pool.pool_type.supports_overprovisioning() || caps.supports_overprovisioning {
            let factor = self.config.thresholds_for(pool.id).overprovisioning_factor;
            (factor * pool.capacity_bytes as f64) as u64
        } else {
            pool.capacity_bytes
        }
    }

    /// Physical usage gate; unmeasurable managed pools always pass
    fn check_used_space(&self, pool: &StoragePool, caps: &DriverCapabilities) -> bool {
        if pool.managed && !caps.supports_stats {
            return true;
        }
        if pool.capacity_bytes == 0 {
            debug!(pool_id = %pool.id, "Pool reports zero capacity");
            return false;
        }

        let threshold = self.config.thresholds_for(pool.id).capacity_disable_threshold;
        let used_pct = pool.used_bytes as f64 / pool.capacity_bytes as f64;
        if used_pct >= threshold {
            debug!(
                pool_id = %pool.id,
                "Insufficient space on pool: usage {:.4} crossed disable threshold {}",
                used_pct, threshold
            );
            return false;
        }
        true
    }

    async fn check_pool_for_space(
        &self,
        pool: &StoragePool,
        caps: &DriverCapabilities,
        allocated: u64,
        asking: u64,
        is_resize: bool,
    ) -> bool {
        let thresholds = self.config.thresholds_for(pool.id);
        let check = SpaceCheck {
            effective_capacity: self.effective_capacity_with(pool, caps),
            allocated,
            asking,
        };
        let admits = check.admits(&thresholds, is_resize);

        debug!(
            pool_id = %pool.id,
            "Checking pool for allocation: effective {}, allocated {}, asking {}, ratio {:.4}, threshold {}, admitted {}",
            check.effective_capacity,
            allocated,
            asking,
            check.allocated_ratio(),
            thresholds.allocated_capacity_disable_threshold,
            admits
        );
        admits
    }

    /// Can the pool take every requested volume
    ///
    /// `cluster_id` enables template clone accounting for managed pools.
    pub async fn has_enough_space(
        &self,
        pool: &StoragePool,
        requests: &[VolumeRequest],
        cluster_id: Option<ClusterId>,
    ) -> Result<bool> {
        if requests.is_empty() {
            return Err(Error::InvalidInput(format!(
                "no volumes to admit on pool {}",
                pool.id
            )));
        }

        let caps = self.drivers.require(&pool.provider_name)?.capabilities();
        if !self.check_used_space(pool, &caps) {
            return Ok(false);
        }

        let allocated = self.repo.allocated_bytes_on_pool(pool.id).await?;
        let mut asking = 0u64;
        let mut templates_counted = HashSet::new();

        for request in requests {
            let volume = &request.volume;

            // Ready volumes already on this pool are part of `allocated`
            if volume.state == VolumeState::Ready && volume.pool_id == Some(pool.id) {
                continue;
            }

            asking = asking.saturating_add(self.asking_size(request, pool).await?);

            if let Some(template_id) = volume.template_id {
                if templates_counted.insert(template_id) {
                    asking = asking.saturating_add(
                        self.template_asking_size(template_id, cluster_id, pool).await?,
                    );
                }
            }
        }

        Ok(self
            .check_pool_for_space(pool, &caps, allocated, asking, false)
            .await)
    }

    /// Can the pool absorb growing `volume` to `new_size`
    pub async fn has_enough_space_for_resize(
        &self,
        pool: &StoragePool,
        volume: &Volume,
        new_size: u64,
    ) -> Result<bool> {
        let caps = self.drivers.require(&pool.provider_name)?.capabilities();
        if !self.check_used_space(pool, &caps) {
            return Ok(false);
        }

        let asking = new_size as i128 - volume.size_bytes as i128;
        if asking <= 0 {
            return Ok(true);
        }

        let allocated = self.repo.allocated_bytes_on_pool(pool.id).await?;
        Ok(self
            .check_pool_for_space(pool, &caps, allocated, asking as u64, true)
            .await)
    }

    /// Size of a volume including the hypervisor snapshot reserve
    async fn asking_size(&self, request: &VolumeRequest, pool: &StoragePool) -> Result<u64> {
        let volume = &request.volume;
        if volume.disk_offering_id != request.profile.disk_offering_id {
            return Ok(request.profile.size_bytes);
        }
        if !pool.managed {
            return Ok(volume.size_bytes);
        }

        let reserve = match volume.hypervisor_snapshot_reserve {
            Some(reserve) => Some(reserve),
            None => self.resolve_snapshot_reserve(volume).await?,
        };
        Ok(match reserve {
            Some(pct) => volume
                .size_bytes
                .saturating_add(volume.size_bytes.saturating_mul(u64::from(pct)) / 100),
            None => volume.size_bytes,
        })
    }

    /// Fill a missing reserve from the disk offering and remember it on the volume
    async fn resolve_snapshot_reserve(&self, volume: &Volume) -> Result<Option<u32>> {
        let offering = self.repo.find_disk_offering(volume.disk_offering_id).await?;
        let reserve = offering.and_then(|o| o.hypervisor_snapshot_reserve);
        if let Some(reserve) = reserve {
            self.repo
                .set_volume_snapshot_reserve(volume.id, reserve)
                .await?;
        }
        Ok(reserve)
    }

    /// Bytes needed to clone a template onto a managed pool
    async fn template_asking_size(
        &self,
        template_id: TemplateId,
        cluster_id: Option<ClusterId>,
        pool: &StoragePool,
    ) -> Result<u64> {
        let Some(cluster_id) = cluster_id else {
            return Ok(0);
        };
        if !pool.managed {
            return Ok(0);
        }

        let Some(template) = self.repo.find_template(template_id).await? else {
            return Ok(0);
        };
        if template.format == ImageFormat::Iso {
            return Ok(0);
        }

        let supports_resigning = self
            .repo
            .find_cluster(cluster_id)
            .await?
            .map_or(false, |c| c.supports_resigning);
        let clones_on_storage = supports_resigning
            || matches!(
                template.hypervisor,
                Some(HypervisorType::VMware) | Some(HypervisorType::Kvm)
            );
        if !clones_on_storage {
            return Ok(0);
        }

        if self
            .repo
            .find_template_pool_ref(template_id, pool.id)
            .await?
            .is_some()
        {
            return Ok(0);
        }

        let driver = self.drivers.require(&pool.provider_name)?;
        Ok(driver.bytes_required_for_template(&template, pool))
    }

    // =========================================================================
    // IOPS
    // =========================================================================

    /// Can the pool guarantee the minimum IOPS of every requested volume
    pub async fn has_enough_iops(&self, pool: &StoragePool, requests: &[VolumeRequest]) -> Result<bool> {
        if requests.is_empty() {
            return Err(Error::InvalidInput(format!(
                "no volumes to admit on pool {}",
                pool.id
            )));
        }
        let Some(capacity_iops) = pool.capacity_iops else {
            debug!(pool_id = %pool.id, "Pool does not track IOPS, assuming enough capacity");
            return Ok(true);
        };

        let requested: u64 = requests
            .iter()
            .filter_map(|r| {
                if r.volume.disk_offering_id != r.profile.disk_offering_id {
                    r.profile.min_iops
                } else {
                    r.volume.min_iops
                }
            })
            .filter(|iops| *iops > 0)
            .sum();

        self.iops_fit(pool, capacity_iops, requested).await
    }

    /// Single-value variant; nothing requested always fits
    pub async fn has_enough_iops_value(&self, pool: &StoragePool, requested: Option<u64>) -> Result<bool> {
        let requested = match requested {
            None | Some(0) => return Ok(true),
            Some(iops) => iops,
        };
        match pool.capacity_iops {
            None => Ok(true),
            Some(capacity_iops) => self.iops_fit(pool, capacity_iops, requested).await,
        }
    }

    async fn iops_fit(&self, pool: &StoragePool, capacity_iops: u64, requested: u64) -> Result<bool> {
        let used = self.repo.used_iops_on_pool(pool.id).await?;
        let fits = used.saturating_add(requested) <= capacity_iops;
        debug!(
            pool_id = %pool.id,
            "Pool {} enough IOPS: used {}, requested {}, capacity {}",
            if fits { "has" } else { "does not have" },
            used,
            requested,
            capacity_iops
        );
        Ok(fits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{fixtures, DriverRegistry, InMemoryStore, SimulatedDriver};
    use assert_matches::assert_matches;

    fn checker(store: Arc<InMemoryStore>, config: EngineConfig) -> CapacityAdmissionChecker {
        let unmeasured = Arc::new(SimulatedDriver::new(
            "Unmeasured",
            DriverCapabilities {
                supports_stats: false,
                supports_overprovisioning: false,
                managed: true,
            },
        ));
        let drivers = DriverRegistry::new()
            .with(SimulatedDriver::default_primary())
            .with(unmeasured);
        CapacityAdmissionChecker::new(store, Arc::new(drivers), Arc::new(config))
    }

    fn request(id: u64, size: u64) -> VolumeRequest {
        VolumeRequest::of(fixtures::volume(id, size))
    }

    #[tokio::test]
    async fn test_overprovisioning_boundary() {
        // capacity 100, factor 2.0, threshold 0.85: 170 passes, 171 fails
        let store = Arc::new(InMemoryStore::new());
        let pool = fixtures::pool(1, 100);
        store.put_pool(pool.clone());
        let mut existing = fixtures::volume(100, 120);
        existing.pool_id = Some(pool.id);
        existing.state = VolumeState::Ready;
        store.put_volume(existing);

        let checker = checker(store, EngineConfig::default());
        assert!(checker.has_enough_space(&pool, &[request(1, 50)], None).await.unwrap());
        assert!(!checker.has_enough_space(&pool, &[request(1, 51)], None).await.unwrap());
    }

    #[tokio::test]
    async fn test_admission_is_monotonic() {
        let store = Arc::new(InMemoryStore::new());
        let pool = fixtures::pool(1, 100);
        store.put_pool(pool.clone());
        let checker = checker(store, EngineConfig::default());

        let base = vec![request(1, 100), request(2, 80)];
        assert!(!checker.has_enough_space(&pool, &base, None).await.unwrap());

        for extra_size in [0, 1, 50] {
            let mut grown = base.clone();
            grown.push(request(3, extra_size));
            assert!(!checker.has_enough_space(&pool, &grown, None).await.unwrap());
        }

        // A Ready volume already on the pool adds nothing, still rejected
        let mut ready = fixtures::volume(4, 500);
        ready.state = VolumeState::Ready;
        ready.pool_id = Some(pool.id);
        let mut grown = base.clone();
        grown.push(VolumeRequest::of(ready));
        assert!(!checker.has_enough_space(&pool, &grown, None).await.unwrap());
    }

    #[tokio::test]
    async fn test_non_overprovisioned_pool_type() {
        let store = Arc::new(InMemoryStore::new());
        let mut pool = fixtures::pool(1, 100);
        pool.pool_type = StoragePoolType::Iscsi;
        store.put_pool(pool.clone());
        let checker = checker(store, EngineConfig::default());

        assert_eq!(checker.effective_capacity(&pool).unwrap(), 100);
        assert!(checker.has_enough_space(&pool, &[request(1, 85)], None).await.unwrap());
        assert!(!checker.has_enough_space(&pool, &[request(1, 86)], None).await.unwrap());
    }

    #[tokio::test]
    async fn test_physical_usage_gate() {
        let store = Arc::new(InMemoryStore::new());
        let mut pool = fixtures::pool(1, 100);
        pool.used_bytes = 85;
        store.put_pool(pool.clone());
        let checker = checker(store, EngineConfig::default());

        assert!(!checker.has_enough_space(&pool, &[request(1, 1)], None).await.unwrap());

        // Managed pool whose driver cannot report stats skips the gate
        let mut managed = pool.clone();
        managed.managed = true;
        managed.provider_name = "Unmeasured".into();
        assert!(checker.has_enough_space(&managed, &[request(1, 1)], None).await.unwrap());
    }

    #[tokio::test]
    async fn test_empty_request_is_input_error() {
        let store = Arc::new(InMemoryStore::new());
        let pool = fixtures::pool(1, 100);
        let checker = checker(store, EngineConfig::default());
        assert_matches!(
            checker.has_enough_space(&pool, &[], None).await,
            Err(Error::InvalidInput(_))
        );
    }

    #[tokio::test]
    async fn test_profile_size_used_when_offering_changes() {
        let store = Arc::new(InMemoryStore::new());
        let pool = fixtures::pool(1, 100);
        store.put_pool(pool.clone());
        let checker = checker(store, EngineConfig::default());

        let volume = fixtures::volume(1, 10);
        let mut profile = DiskProfile::from_volume(&volume);
        profile.disk_offering_id = DiskOfferingId(2);
        profile.size_bytes = 180;
        let req = VolumeRequest::new(volume, profile);
        assert!(!checker.has_enough_space(&pool, &[req], None).await.unwrap());
    }

    #[tokio::test]
    async fn test_managed_pool_snapshot_reserve_and_template_cost() {
        let store = Arc::new(InMemoryStore::new());
        let mut pool = fixtures::pool(1, 100);
        pool.managed = true;
        pool.pool_type = StoragePoolType::Iscsi;
        store.put_pool(pool.clone());
        store.put_cluster(fixtures::cluster(1));
        store.put_template(fixtures::template(5, 20));
        let mut offering = fixtures::disk_offering(1);
        offering.hypervisor_snapshot_reserve = Some(50);
        store.put_disk_offering(offering);

        let mut volume = fixtures::volume(1, 40);
        volume.template_id = Some(TemplateId(5));
        store.put_volume(volume.clone());
        let checker = checker(store.clone(), EngineConfig::default());

        // 40 + 50% reserve = 60, plus template 20 = 80 < 85
        let reqs = [VolumeRequest::of(volume.clone())];
        assert!(checker.has_enough_space(&pool, &reqs, Some(ClusterId(1))).await.unwrap());
        assert_eq!(
            store.volume(VolumeId(1)).unwrap().hypervisor_snapshot_reserve,
            Some(50)
        );

        // Bigger template pushes it past the threshold
        store.put_template(fixtures::template(5, 30));
        assert!(!checker.has_enough_space(&pool, &reqs, Some(ClusterId(1))).await.unwrap());

        // Staged template costs nothing
        store.put_template_pool_ref(TemplatePoolRef {
            template_id: TemplateId(5),
            pool_id: pool.id,
            download_state: DownloadState::Downloaded,
            marked_for_gc: false,
            size_bytes: 0,
        });
        assert!(checker.has_enough_space(&pool, &reqs, Some(ClusterId(1))).await.unwrap());

        // No cluster means no clone accounting
        store.put_template(fixtures::template(6, 1000));
        let mut other = volume;
        other.template_id = Some(TemplateId(6));
        let reqs = [VolumeRequest::of(other)];
        assert!(checker.has_enough_space(&pool, &reqs, None).await.unwrap());
    }

    #[tokio::test]
    async fn test_huge_volume_with_reserve_is_rejected() {
        let store = Arc::new(InMemoryStore::new());
        let mut pool = fixtures::pool(1, 100);
        pool.managed = true;
        pool.pool_type = StoragePoolType::Iscsi;
        store.put_pool(pool.clone());
        let checker = checker(store, EngineConfig::default());

        let mut volume = fixtures::volume(1, u64::MAX / 2);
        volume.hypervisor_snapshot_reserve = Some(300);
        let reqs = [VolumeRequest::of(volume)];
        assert!(!checker.has_enough_space(&pool, &reqs, None).await.unwrap());
    }

    #[tokio::test]
    async fn test_resize_threshold() {
        let store = Arc::new(InMemoryStore::new());
        let pool = fixtures::pool(1, 100);
        store.put_pool(pool.clone());
        let mut existing = fixtures::volume(1, 160);
        existing.pool_id = Some(pool.id);
        existing.state = VolumeState::Ready;
        store.put_volume(existing.clone());

        let strict = checker(store.clone(), EngineConfig::default());
        // 160 -> 175 is 0.875 of 200
        assert!(!strict.has_enough_space_for_resize(&pool, &existing, 175).await.unwrap());
        assert!(strict.has_enough_space_for_resize(&pool, &existing, 100).await.unwrap());

        let mut config = EngineConfig::default();
        config.storage.allow_resize_beyond_allocated_threshold = true;
        let loose = checker(store, config);
        assert!(loose.has_enough_space_for_resize(&pool, &existing, 175).await.unwrap());
        // 0.905 crosses the resize threshold of 0.90
        assert!(!loose.has_enough_space_for_resize(&pool, &existing, 181).await.unwrap());
    }

    #[tokio::test]
    async fn test_iops_untracked_pool_accepts_anything() {
        let store = Arc::new(InMemoryStore::new());
        let pool = fixtures::pool(1, 100);
        let checker = checker(store, EngineConfig::default());

        let mut volume = fixtures::volume(1, 1);
        volume.min_iops = Some(u64::MAX / 2);
        assert!(checker
            .has_enough_iops(&pool, &[VolumeRequest::of(volume)])
            .await
            .unwrap());
        assert!(checker
            .has_enough_iops_value(&pool, Some(u64::MAX))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_iops_capacity() {
        let store = Arc::new(InMemoryStore::new());
        let mut pool = fixtures::pool(1, 100);
        pool.capacity_iops = Some(1000);
        store.put_pool(pool.clone());
        let mut existing = fixtures::volume(1, 1);
        existing.pool_id = Some(pool.id);
        existing.min_iops = Some(600);
        store.put_volume(existing);
        let checker = checker(store, EngineConfig::default());

        let mut fits = fixtures::volume(2, 1);
        fits.min_iops = Some(400);
        assert!(checker
            .has_enough_iops(&pool, &[VolumeRequest::of(fits.clone())])
            .await
            .unwrap());

        // Profile from a different offering overrides the volume's own value
        let mut profile = DiskProfile::from_volume(&fits);
        profile.disk_offering_id = DiskOfferingId(9);
        profile.min_iops = Some(401);
        assert!(!checker
            .has_enough_iops(&pool, &[VolumeRequest::new(fits, profile)])
            .await
            .unwrap());

        assert!(checker.has_enough_iops_value(&pool, Some(0)).await.unwrap());
        assert!(!checker.has_enough_iops_value(&pool, Some(401)).await.unwrap());
    }

    #[test]
    fn test_space_check_hard_ceiling() {
        // A threshold above 1.0 leaves only the ceiling
        let thresholds = StorageThresholds {
            allocated_capacity_disable_threshold: 2.0,
            ..Default::default()
        };
        let check = SpaceCheck {
            effective_capacity: 100,
            allocated: 60,
            asking: 41,
        };
        assert!(!check.admits(&thresholds, false));

        let check = SpaceCheck {
            effective_capacity: 100,
            allocated: 60,
            asking: 40,
        };
        assert!(check.admits(&thresholds, false));
    }
}

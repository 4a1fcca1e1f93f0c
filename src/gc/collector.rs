//! Storage Garbage Collector
//!
//! One cleanup cycle reclaims unused template copies, destroyed snapshots,
//! destroyed volumes and abandoned uploads. Cycles are serialized across
//! management nodes by a named lock; a node that cannot take the lock in
//! time skips the cycle. Failures are per item: they are logged and counted
//! and the sweep carries on.

use crate::capacity::CapacityTracker;
use crate::config::{DownloadUrlConfig, GcConfig};
use crate::domain::*;
use crate::error::{Error, Result};
use crate::events::{EngineEvent, EventBus};
use crate::lifecycle::{ExpungeMode, VolumeExpunger};
use crate::metrics::EngineMetrics;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Name of the cluster-wide lock guarding a cycle
pub const CLEANUP_LOCK: &str = "storagemgr.cleanup";

/// Counts of one completed cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub templates_marked: u64,
    pub templates_evicted: u64,
    pub snapshot_refs_deleted: u64,
    pub volumes_expunged: u64,
    pub volumes_skipped: u64,
    pub snapshots_expunged: u64,
    pub uploads_destroyed: u64,
    pub templates_removed: u64,
    pub failures: u64,
}

impl CleanupReport {
    /// Items actually removed or destroyed
    pub fn deleted(&self) -> u64 {
        self.templates_evicted
            + self.snapshot_refs_deleted
            + self.volumes_expunged
            + self.snapshots_expunged
            + self.uploads_destroyed
            + self.templates_removed
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed(CleanupReport),
    /// Another node holds the cleanup lock
    Skipped,
}

/// Collaborators of the collector
pub struct CollectorDeps {
    pub repo: ResourceRepositoryRef,
    pub catalog: ArtifactCatalogRef,
    pub gateway: RemoteExecutionGatewayRef,
    pub tracker: Arc<CapacityTracker>,
    pub lock: ClusterLockRef,
    pub events: EventBus,
    pub metrics: EngineMetrics,
}

pub struct StorageGarbageCollector {
    repo: ResourceRepositoryRef,
    catalog: ArtifactCatalogRef,
    gateway: RemoteExecutionGatewayRef,
    tracker: Arc<CapacityTracker>,
    lock: ClusterLockRef,
    expunger: VolumeExpunger,
    events: EventBus,
    metrics: EngineMetrics,
    config: GcConfig,
    urls: DownloadUrlConfig,
}

/// Why a Destroy volume is left alone this cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SkipReason {
    RootOfDestroyedVm,
    InUse,
    SuspectedDuplicate,
}

impl StorageGarbageCollector {
    pub fn new(deps: CollectorDeps, config: GcConfig, urls: DownloadUrlConfig) -> Self {
        let expunger = VolumeExpunger::new(deps.repo.clone(), deps.gateway.clone(), deps.events.clone());
        Self {
            repo: deps.repo,
            catalog: deps.catalog,
            gateway: deps.gateway,
            tracker: deps.tracker,
            lock: deps.lock,
            expunger,
            events: deps.events,
            metrics: deps.metrics,
            config,
            urls,
        }
    }

    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    pub fn download_url_config(&self) -> &DownloadUrlConfig {
        &self.urls
    }

    fn count(&self, kind: &str, n: u64) {
        if n > 0 {
            self.metrics.gc_items.with_label_values(&[kind]).inc_by(n);
        }
    }

    // =========================================================================
    // Cycle
    // =========================================================================

    /// Run one cleanup cycle if the cluster-wide lock can be taken
    pub async fn run_cleanup_cycle(&self, recurring: bool) -> Result<CycleOutcome> {
        let Some(_guard) = self
            .lock
            .try_acquire(CLEANUP_LOCK, self.config.lock_timeout())
            .await?
        else {
            info!("Cleanup lock held elsewhere, skipping cycle");
            self.metrics.gc_cycles.with_label_values(&["skipped"]).inc();
            self.events.publish(EngineEvent::CleanupCycleFinished {
                skipped: true,
                deleted: 0,
            });
            return Ok(CycleOutcome::Skipped);
        };

        info!(
            "Starting {} storage cleanup cycle",
            if recurring { "scheduled" } else { "manual" }
        );
        let mut report = CleanupReport::default();

        if self.config.template_cleanup_enabled {
            self.evict_unused_templates(&mut report).await;
        }
        self.delete_destroying_snapshot_refs(&mut report).await;
        self.expunge_destroyed_volumes(&mut report).await;
        self.expunge_error_snapshots(&mut report).await;
        self.destroy_abandoned_uploads(&mut report).await;
        self.remove_inactive_templates(&mut report).await;

        self.count("template", report.templates_evicted + report.templates_removed);
        self.count("snapshot", report.snapshot_refs_deleted + report.snapshots_expunged);
        self.count("volume", report.volumes_expunged + report.uploads_destroyed);
        self.metrics.gc_cycles.with_label_values(&["completed"]).inc();
        self.events.publish(EngineEvent::CleanupCycleFinished {
            skipped: false,
            deleted: report.deleted(),
        });

        info!(
            deleted = report.deleted(),
            skipped = report.volumes_skipped,
            failures = report.failures,
            "Storage cleanup cycle finished"
        );
        Ok(CycleOutcome::Completed(report))
    }

    /// Unused, fully downloaded copies are marked first and evicted the next cycle
    async fn evict_unused_templates(&self, report: &mut CleanupReport) {
        let pools = match self.repo.list_all_pools().await {
            Ok(pools) => pools,
            Err(err) => {
                error!("Unable to list pools for template cleanup: {}", err);
                report.failures += 1;
                return;
            }
        };

        for pool in pools {
            if let Err(err) = self.evict_templates_on_pool(&pool, report).await {
                error!(pool_id = %pool.id, "Failed to clean up templates: {}", err);
                report.failures += 1;
            }
        }
    }

    async fn evict_templates_on_pool(&self, pool: &StoragePool, report: &mut CleanupReport) -> Result<()> {
        let unused = self.catalog.list_unused_templates_on_pool(pool.id).await?;
        debug!(pool_id = %pool.id, "{} unused template copies", unused.len());

        let mut evicted = false;
        for copy in unused {
            if copy.download_state != DownloadState::Downloaded {
                debug!(pool_id = %pool.id, "Template {} not fully downloaded, skipping", copy.template_id);
                continue;
            }
            if !copy.marked_for_gc {
                self.catalog
                    .mark_template_for_gc(copy.template_id, pool.id)
                    .await?;
                report.templates_marked += 1;
                continue;
            }
            match self.evict_template(pool, &copy).await {
                Ok(()) => {
                    report.templates_evicted += 1;
                    evicted = true;
                }
                Err(err) => {
                    error!(pool_id = %pool.id, "Unable to evict template {}: {}", copy.template_id, err);
                    report.failures += 1;
                }
            }
        }

        if evicted {
            self.tracker.recompute_pool(pool.id).await?;
        }
        Ok(())
    }

    async fn evict_template(&self, pool: &StoragePool, copy: &TemplatePoolRef) -> Result<()> {
        let host_id = self
            .expunger
            .connected_up_host(pool.id)
            .await?
            .ok_or_else(|| Error::StorageUnavailable {
                pool_id: pool.id.to_string(),
                reason: "no up host connected to evict a template".into(),
            })?;
        self.gateway
            .send(
                host_id,
                AgentCommand::EvictTemplate {
                    pool_id: pool.id,
                    template_id: copy.template_id,
                },
            )
            .await?;
        self.catalog
            .remove_template_pool_ref(copy.template_id, pool.id)
            .await?;
        debug!(pool_id = %pool.id, "Evicted template {}", copy.template_id);
        Ok(())
    }

    async fn delete_destroying_snapshot_refs(&self, report: &mut CleanupReport) {
        let refs = match self
            .catalog
            .list_snapshot_refs_in_state(SnapshotState::Destroying)
            .await
        {
            Ok(refs) => refs,
            Err(err) => {
                error!("Unable to list destroying snapshot copies: {}", err);
                report.failures += 1;
                return;
            }
        };

        for r in refs {
            match self.catalog.delete_snapshot_ref(r.snapshot_id, r.pool_id).await {
                Ok(()) => report.snapshot_refs_deleted += 1,
                Err(err) => {
                    error!("Unable to delete snapshot {} from pool {}: {}", r.snapshot_id, r.pool_id, err);
                    report.failures += 1;
                }
            }
        }
    }

    // =========================================================================
    // Volumes
    // =========================================================================

    async fn expunge_destroyed_volumes(&self, report: &mut CleanupReport) {
        let cutoff = match age_cutoff(self.config.cleanup_delay_secs) {
            Ok(cutoff) => cutoff,
            Err(err) => {
                error!("Unable to expunge destroyed volumes: {}", err);
                report.failures += 1;
                return;
            }
        };
        let volumes = match self.repo.list_volumes_in_state(VolumeState::Destroy).await {
            Ok(volumes) => volumes,
            Err(err) => {
                error!("Unable to list destroyed volumes: {}", err);
                report.failures += 1;
                return;
            }
        };

        for volume in volumes.into_iter().filter(|v| v.updated_at <= cutoff) {
            match self.skip_reason(&volume).await {
                Ok(Some(reason)) => {
                    debug!("Volume {} not expunged: {:?}", volume.id, reason);
                    if reason == SkipReason::SuspectedDuplicate {
                        warn!(
                            "Volume {} may duplicate another volume on the same pool and path, skipping",
                            volume.id
                        );
                    }
                    report.volumes_skipped += 1;
                    continue;
                }
                Ok(None) => {}
                Err(err) => {
                    error!("Unable to inspect volume {}: {}", volume.id, err);
                    report.failures += 1;
                    continue;
                }
            }

            if let Err(err) = self.release_attachment(&volume).await {
                error!("Unable to release host-side attachment of volume {}: {}", volume.id, err);
            }

            match self.expunger.expunge(&volume, ExpungeMode::Agent).await {
                Ok(()) => {
                    report.volumes_expunged += 1;
                    if let Some(pool_id) = volume.pool_id {
                        if let Err(err) = self.tracker.recompute_pool(pool_id).await {
                            warn!(pool_id = %pool_id, "Unable to recompute capacity: {}", err);
                        }
                    }
                }
                Err(err) => {
                    error!("Unable to expunge volume {}: {}", volume.id, err);
                    report.failures += 1;
                }
            }
        }
    }

    async fn skip_reason(&self, volume: &Volume) -> Result<Option<SkipReason>> {
        let Some(vm_id) = volume.instance_id else {
            return Ok(None);
        };
        let Some(vm) = self.repo.find_vm(vm_id).await? else {
            return Ok(None);
        };

        if volume.volume_type == VolumeType::Root && vm.state == VmState::Destroyed {
            return Ok(Some(SkipReason::RootOfDestroyedVm));
        }
        if vm.state.is_active() {
            return Ok(Some(SkipReason::InUse));
        }
        if self.is_suspected_duplicate(volume).await? {
            return Ok(Some(SkipReason::SuspectedDuplicate));
        }
        Ok(None)
    }

    /// Another usable volume of the same VM sits on the same pool and path
    async fn is_suspected_duplicate(&self, volume: &Volume) -> Result<bool> {
        let (Some(vm_id), Some(pool_id), Some(path)) =
            (volume.instance_id, volume.pool_id, volume.path.as_ref())
        else {
            return Ok(false);
        };

        Ok(self
            .repo
            .list_volumes_by_instance(vm_id)
            .await?
            .iter()
            .any(|other| {
                other.id != volume.id
                    && other.is_usable()
                    && other.pool_id == Some(pool_id)
                    && other.path.as_ref() == Some(path)
            }))
    }

    /// Managed volumes may still be attached on the VM's last host
    async fn release_attachment(&self, volume: &Volume) -> Result<()> {
        let (Some(vm_id), Some(pool_id), Some(path)) =
            (volume.instance_id, volume.pool_id, volume.path.as_ref())
        else {
            return Ok(());
        };
        let Some(pool) = self.repo.find_pool(pool_id).await? else {
            return Ok(());
        };
        if !pool.managed {
            return Ok(());
        }
        let Some(host_id) = self.repo.find_vm(vm_id).await?.and_then(|vm| vm.last_host_id) else {
            return Ok(());
        };

        self.gateway
            .send(
                host_id,
                AgentCommand::ReleaseAttachment {
                    pool_id,
                    path: path.clone(),
                },
            )
            .await?;
        debug!("Released attachment of volume {} on host {}", volume.id, host_id);
        Ok(())
    }

    // =========================================================================
    // Snapshots, Uploads and Templates
    // =========================================================================

    async fn expunge_error_snapshots(&self, report: &mut CleanupReport) {
        let snapshots = match self.catalog.list_snapshots_in_state(SnapshotState::Error).await {
            Ok(snapshots) => snapshots,
            Err(err) => {
                error!("Unable to list failed snapshots: {}", err);
                report.failures += 1;
                return;
            }
        };

        for snapshot in snapshots {
            match self.catalog.expunge_snapshot(snapshot.id).await {
                Ok(()) => report.snapshots_expunged += 1,
                Err(err) => {
                    error!("Unable to expunge snapshot {}: {}", snapshot.id, err);
                    report.failures += 1;
                }
            }
        }
    }

    async fn destroy_abandoned_uploads(&self, report: &mut CleanupReport) {
        for state in [VolumeState::UploadError, VolumeState::UploadAbandoned] {
            let volumes = match self.repo.list_volumes_in_state(state).await {
                Ok(volumes) => volumes,
                Err(err) => {
                    error!("Unable to list {} volumes: {}", state, err);
                    report.failures += 1;
                    continue;
                }
            };
            for volume in volumes {
                match self.expunger.expunge(&volume, ExpungeMode::Agent).await {
                    Ok(()) => report.uploads_destroyed += 1,
                    Err(err) => {
                        error!("Unable to destroy uploaded volume {}: {}", volume.id, err);
                        report.failures += 1;
                    }
                }
            }
        }

        let templates = match self
            .catalog
            .list_templates_in_states(&[TemplateState::UploadError, TemplateState::UploadAbandoned])
            .await
        {
            Ok(templates) => templates,
            Err(err) => {
                error!("Unable to list abandoned template uploads: {}", err);
                report.failures += 1;
                return;
            }
        };
        for template in templates {
            match self
                .catalog
                .set_template_state(template.id, TemplateState::Inactive)
                .await
            {
                Ok(()) => report.uploads_destroyed += 1,
                Err(err) => {
                    error!("Unable to destroy uploaded template {}: {}", template.id, err);
                    report.failures += 1;
                }
            }
        }
    }

    async fn remove_inactive_templates(&self, report: &mut CleanupReport) {
        let templates = match self
            .catalog
            .list_templates_in_states(&[TemplateState::Inactive])
            .await
        {
            Ok(templates) => templates,
            Err(err) => {
                error!("Unable to list inactive templates: {}", err);
                report.failures += 1;
                return;
            }
        };

        for template in templates {
            match self
                .catalog
                .set_template_state(template.id, TemplateState::Removed)
                .await
            {
                Ok(()) => report.templates_removed += 1,
                Err(err) => {
                    error!("Unable to remove template {}: {}", template.id, err);
                    report.failures += 1;
                }
            }
        }
    }

    // =========================================================================
    // Download URLs
    // =========================================================================

    /// Drop expired extract URLs; returns how many were removed
    pub async fn cleanup_download_urls(&self) -> Result<u64> {
        let cutoff = age_cutoff(self.urls.expiration_secs)?;
        let mut removed = 0;

        for url in self.catalog.list_download_urls().await? {
            if url.created_at > cutoff {
                continue;
            }
            if let Err(err) = self.remove_download_url(&url).await {
                error!("Unable to remove download URL {}: {}", url.id, err);
                continue;
            }
            removed += 1;
        }

        if removed > 0 {
            info!("Removed {} expired download URL(s)", removed);
        }
        Ok(removed)
    }

    async fn remove_download_url(&self, url: &DownloadUrl) -> Result<()> {
        self.catalog.remove_download_url(url.id).await?;
        if let DownloadTarget::Volume(volume_id) = url.target {
            if let Some(volume) = self.repo.find_volume(volume_id).await? {
                if volume.state == VolumeState::Expunged {
                    self.repo.remove_volume(volume_id).await?;
                    debug!("Removed record of expunged volume {}", volume_id);
                }
            }
        }
        Ok(())
    }
}

/// Instant `age_secs` ago; out-of-range ages are a configuration error
fn age_cutoff(age_secs: u64) -> Result<DateTime<Utc>> {
    i64::try_from(age_secs)
        .ok()
        .and_then(ChronoDuration::try_seconds)
        .and_then(|age| Utc::now().checked_sub_signed(age))
        .ok_or_else(|| Error::Configuration(format!("age of {} seconds is out of range", age_secs)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capacity::CapacityAdmissionChecker;
    use crate::config::EngineConfig;
    use crate::gc::InProcessLock;
    use crate::memory::{fixtures, DriverRegistry, InMemoryStore, SimulatedFailure, SimulatedDriver, SimulatedGateway};
    use assert_matches::assert_matches;
    use std::time::Duration;

    struct Harness {
        store: Arc<InMemoryStore>,
        gateway: Arc<SimulatedGateway>,
        lock: Arc<InProcessLock>,
        collector: StorageGarbageCollector,
    }

    fn harness() -> Harness {
        let store = Arc::new(InMemoryStore::new());
        store.put_zone(fixtures::zone(1));
        store.put_cluster(fixtures::cluster(1));
        store.put_host(fixtures::host(1, 1));
        store.put_pool(fixtures::pool(1, 1000 * fixtures::GB));

        let config = Arc::new(EngineConfig {
            gc: GcConfig {
                lock_timeout_ms: 10,
                ..GcConfig::default()
            },
            ..EngineConfig::default()
        });
        let drivers = Arc::new(DriverRegistry::new().with(SimulatedDriver::default_primary()));
        let admission = Arc::new(CapacityAdmissionChecker::new(store.clone(), drivers, config.clone()));
        let gateway = Arc::new(SimulatedGateway::new());
        let lock = Arc::new(InProcessLock::new());
        let deps = CollectorDeps {
            repo: store.clone(),
            catalog: store.clone(),
            gateway: gateway.clone(),
            tracker: Arc::new(CapacityTracker::new(store.clone(), admission)),
            lock: lock.clone(),
            events: EventBus::default(),
            metrics: EngineMetrics::new().unwrap(),
        };
        Harness {
            collector: StorageGarbageCollector::new(deps, config.gc.clone(), config.download_urls.clone()),
            store,
            gateway,
            lock,
        }
    }

    async fn connect_host(h: &Harness) {
        h.store
            .upsert_pool_host_ref(PoolHostRef {
                pool_id: PoolId(1),
                host_id: HostId(1),
                local_path: "/mnt/pool-1".into(),
            })
            .await
            .unwrap();
    }

    fn destroyed_volume(id: u64, path: &str) -> Volume {
        let mut volume = fixtures::volume(id, 10 * fixtures::GB);
        volume.pool_id = Some(PoolId(1));
        volume.path = Some(path.into());
        volume.state = VolumeState::Destroy;
        volume
    }

    async fn run(h: &Harness) -> CleanupReport {
        match h.collector.run_cleanup_cycle(true).await.unwrap() {
            CycleOutcome::Completed(report) => report,
            CycleOutcome::Skipped => panic!("cycle skipped"),
        }
    }

    fn seed(h: &Harness) {
        // Plain orphan
        h.store.put_volume(destroyed_volume(1, "v1"));

        // Owner still running
        let mut running = fixtures::vm(2);
        running.state = VmState::Running;
        h.store.put_vm(running);
        let mut busy = destroyed_volume(2, "v2");
        busy.instance_id = Some(VmId(2));
        h.store.put_volume(busy);

        // Same VM holds a usable volume on the same pool and path
        h.store.put_vm(fixtures::vm(3));
        let mut duplicate = destroyed_volume(3, "shared");
        duplicate.instance_id = Some(VmId(3));
        h.store.put_volume(duplicate);
        let mut live = destroyed_volume(4, "shared");
        live.instance_id = Some(VmId(3));
        live.state = VolumeState::Ready;
        h.store.put_volume(live);

        // ROOT of a destroyed VM goes with the VM
        let mut destroyed_vm = fixtures::vm(5);
        destroyed_vm.state = VmState::Destroyed;
        h.store.put_vm(destroyed_vm);
        let mut root = destroyed_volume(5, "root");
        root.instance_id = Some(VmId(5));
        root.volume_type = VolumeType::Root;
        h.store.put_volume(root);

        // Too recent
        let mut fresh = destroyed_volume(6, "v6");
        fresh.updated_at = Utc::now();
        h.store.put_volume(fresh);

        // Abandoned upload
        let mut upload = fixtures::volume(7, fixtures::GB);
        upload.state = VolumeState::UploadError;
        h.store.put_volume(upload);

        h.store.put_snapshot(Snapshot {
            id: SnapshotId(1),
            volume_id: VolumeId(4),
            state: SnapshotState::Error,
        });
        h.store.put_snapshot_store_ref(SnapshotStoreRef {
            snapshot_id: SnapshotId(2),
            pool_id: PoolId(1),
            state: SnapshotState::Destroying,
        });

        let mut inactive = fixtures::template(1, fixtures::GB);
        inactive.state = TemplateState::Inactive;
        h.store.put_template(inactive);
    }

    #[tokio::test]
    async fn test_cycle_reclaims_and_is_idempotent() {
        let h = harness();
        connect_host(&h).await;
        seed(&h);

        let first = run(&h).await;
        assert_eq!(first.volumes_expunged, 1);
        assert_eq!(first.volumes_skipped, 3);
        assert_eq!(first.snapshot_refs_deleted, 1);
        assert_eq!(first.snapshots_expunged, 1);
        assert_eq!(first.uploads_destroyed, 1);
        assert_eq!(first.templates_removed, 1);
        assert_eq!(first.failures, 0);

        assert_eq!(h.store.volume(VolumeId(1)).unwrap().state, VolumeState::Expunged);
        assert_eq!(h.store.volume(VolumeId(2)).unwrap().state, VolumeState::Destroy);
        assert_eq!(h.store.volume(VolumeId(3)).unwrap().state, VolumeState::Destroy);
        assert_eq!(h.store.volume(VolumeId(6)).unwrap().state, VolumeState::Destroy);
        assert_eq!(h.gateway.hosts_sent("DeleteVolume"), vec![HostId(1)]);

        let second = run(&h).await;
        assert_eq!(second.deleted(), 0);
        assert_eq!(second.volumes_skipped, 3);
    }

    #[tokio::test]
    async fn test_templates_are_evicted_on_second_pass() {
        let h = harness();
        connect_host(&h).await;
        for (t, state) in [(1, DownloadState::Downloaded), (2, DownloadState::DownloadInProgress)] {
            h.store.put_template_pool_ref(TemplatePoolRef {
                template_id: TemplateId(t),
                pool_id: PoolId(1),
                download_state: state,
                marked_for_gc: false,
                size_bytes: fixtures::GB,
            });
        }

        let first = run(&h).await;
        assert_eq!((first.templates_marked, first.templates_evicted), (1, 0));
        assert!(h.store.template_pool_ref(TemplateId(1), PoolId(1)).unwrap().marked_for_gc);

        let second = run(&h).await;
        assert_eq!(second.templates_evicted, 1);
        assert!(h.store.template_pool_ref(TemplateId(1), PoolId(1)).is_none());
        assert!(h.store.template_pool_ref(TemplateId(2), PoolId(1)).is_some());
        assert_eq!(h.gateway.hosts_sent("EvictTemplate"), vec![HostId(1)]);

        let third = run(&h).await;
        assert_eq!(third.deleted(), 0);
    }

    #[tokio::test]
    async fn test_template_cleanup_can_be_disabled() {
        let mut h = harness();
        h.collector.config.template_cleanup_enabled = false;
        h.store.put_template_pool_ref(TemplatePoolRef {
            template_id: TemplateId(1),
            pool_id: PoolId(1),
            download_state: DownloadState::Downloaded,
            marked_for_gc: true,
            size_bytes: fixtures::GB,
        });

        let report = run(&h).await;
        assert_eq!(report.templates_evicted, 0);
        assert!(h.store.template_pool_ref(TemplateId(1), PoolId(1)).is_some());
    }

    #[tokio::test]
    async fn test_held_lock_skips_cycle() {
        let h = harness();
        h.store.put_volume(destroyed_volume(1, "v1"));
        let _held = h
            .lock
            .try_acquire(CLEANUP_LOCK, Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();

        assert_matches!(
            h.collector.run_cleanup_cycle(true).await,
            Ok(CycleOutcome::Skipped)
        );
        assert_eq!(h.store.volume(VolumeId(1)).unwrap().state, VolumeState::Destroy);
    }

    #[tokio::test]
    async fn test_item_failure_does_not_stop_sweep() {
        let h = harness();
        connect_host(&h).await;
        h.gateway.fail_host(HostId(1), SimulatedFailure::Unavailable);
        h.store.put_volume(destroyed_volume(1, "v1"));
        let mut unplaced = fixtures::volume(2, fixtures::GB);
        unplaced.state = VolumeState::Destroy;
        h.store.put_volume(unplaced);

        let report = run(&h).await;
        assert_eq!(report.failures, 1);
        assert_eq!(report.volumes_expunged, 1);
        assert_eq!(h.store.volume(VolumeId(1)).unwrap().state, VolumeState::Destroy);
        assert_eq!(h.store.volume(VolumeId(2)).unwrap().state, VolumeState::Expunged);
    }

    #[tokio::test]
    async fn test_managed_volume_attachment_released() {
        let h = harness();
        connect_host(&h).await;
        let mut pool = h.store.pool(PoolId(1)).unwrap();
        pool.managed = true;
        h.store.put_pool(pool);
        h.store.put_host(fixtures::host(9, 1));
        let mut vm = fixtures::vm(1);
        vm.last_host_id = Some(HostId(9));
        h.store.put_vm(vm);
        let mut volume = destroyed_volume(1, "lun-1");
        volume.instance_id = Some(VmId(1));
        h.store.put_volume(volume);

        // Release failing is tolerated
        h.gateway.fail_host(HostId(9), SimulatedFailure::Timeout);
        let report = run(&h).await;
        assert_eq!(report.volumes_expunged, 1);
        assert_eq!(h.gateway.hosts_sent("ReleaseAttachment"), vec![HostId(9)]);
    }

    #[test]
    fn test_age_cutoff_rejects_out_of_range() {
        assert_matches!(age_cutoff(u64::MAX), Err(Error::Configuration(_)));
        assert_matches!(age_cutoff(10_000_000_000_000_000), Err(Error::Configuration(_)));
        assert!(age_cutoff(86_400).unwrap() < Utc::now());
    }

    #[tokio::test]
    async fn test_unbounded_delay_expunges_nothing() {
        let mut h = harness();
        connect_host(&h).await;
        h.collector.config.cleanup_delay_secs = u64::MAX;
        h.collector.urls.expiration_secs = u64::MAX;
        h.store.put_volume(destroyed_volume(1, "v1"));

        let report = run(&h).await;
        assert_eq!(report.volumes_expunged, 0);
        assert_eq!(report.failures, 1);
        assert_eq!(h.store.volume(VolumeId(1)).unwrap().state, VolumeState::Destroy);
        assert_matches!(
            h.collector.cleanup_download_urls().await,
            Err(Error::Configuration(_))
        );
    }

    #[tokio::test]
    async fn test_expired_download_urls() {
        let h = harness();
        let mut expunged = fixtures::volume(1, fixtures::GB);
        expunged.state = VolumeState::Expunged;
        h.store.put_volume(expunged);
        h.store.put_volume(fixtures::volume(2, fixtures::GB));

        let old = Utc::now() - ChronoDuration::days(1);
        for (id, target, created_at) in [
            (1, DownloadTarget::Volume(VolumeId(1)), old),
            (2, DownloadTarget::Volume(VolumeId(2)), old),
            (3, DownloadTarget::Template(TemplateId(1)), old),
            (4, DownloadTarget::Template(TemplateId(1)), Utc::now()),
        ] {
            h.store.put_download_url(DownloadUrl {
                id,
                target,
                url: format!("https://ssvm/extract/{}", id),
                created_at,
            });
        }

        assert_eq!(tokio_test::assert_ok!(h.collector.cleanup_download_urls().await), 3);
        assert_eq!(h.store.download_url_count(), 1);
        assert!(h.store.volume(VolumeId(1)).is_none());
        assert!(h.store.volume(VolumeId(2)).is_some());
    }
}

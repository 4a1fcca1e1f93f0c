//! Deployment Planning
//!
//! Turns a placement request into a [`Destination`]: one host plus one pool
//! per volume, or nothing when every candidate is exhausted. Exhaustion is a
//! normal outcome and is never reported as an error.

use super::allocator::{AllocatorChain, PoolRequest};
use super::host_filter::{reorder_by_priority, reservation_compatible, HostFilter, HostRequirements};
use super::planner::{DeploymentPlannerRef, PlannerRegistry};
use crate::access::StorageAccessGroupMatcher;
use crate::capacity::CapacityAdmissionChecker;
use crate::config::EngineConfig;
use crate::domain::*;
use crate::error::{Error, Result};
use crate::events::{EngineEvent, EventBus};
use crate::metrics::EngineMetrics;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Collaborators of the planning manager
pub struct SchedulerDeps {
    pub repo: ResourceRepositoryRef,
    pub admission: Arc<CapacityAdmissionChecker>,
    pub matcher: Arc<StorageAccessGroupMatcher>,
    pub affinity: AffinityProcessorRef,
    pub events: EventBus,
    pub metrics: EngineMetrics,
}

/// Request-scoped state shared by the per-host attempts
struct Attempt<'a> {
    profile: &'a VmProfile,
    zone_id: ZoneId,
    volumes: Vec<Volume>,
    requirements: HostRequirements,
}

/// Places VMs and their volumes
pub struct DeploymentPlanningManager {
    repo: ResourceRepositoryRef,
    admission: Arc<CapacityAdmissionChecker>,
    matcher: Arc<StorageAccessGroupMatcher>,
    affinity: AffinityProcessorRef,
    planners: PlannerRegistry,
    allocators: AllocatorChain,
    host_filter: HostFilter,
    config: Arc<EngineConfig>,
    events: EventBus,
    metrics: EngineMetrics,
}

impl DeploymentPlanningManager {
    /// Build with the standard planners and the configured allocator chain
    pub fn new(deps: SchedulerDeps, config: Arc<EngineConfig>) -> Result<Self> {
        let planners = PlannerRegistry::standard(deps.repo.clone(), config.planner_name.clone());
        let allocators = AllocatorChain::from_names(deps.repo.clone(), &config.pool_allocators)?;
        Ok(Self::with_components(deps, config, planners, allocators))
    }

    pub fn with_components(
        deps: SchedulerDeps,
        config: Arc<EngineConfig>,
        planners: PlannerRegistry,
        allocators: AllocatorChain,
    ) -> Self {
        let host_filter = HostFilter::new(deps.matcher.clone(), config.default_host_max_guests);
        Self {
            repo: deps.repo,
            admission: deps.admission,
            matcher: deps.matcher,
            affinity: deps.affinity,
            planners,
            allocators,
            host_filter,
            config,
            events: deps.events,
            metrics: deps.metrics,
        }
    }

    /// Find a host and one pool per volume for the workload
    ///
    /// Returns `Ok(None)` when no combination fits. `avoid` is extended with
    /// everything ruled out along the way.
    pub async fn plan_deployment(
        &self,
        profile: &VmProfile,
        plan: &DeploymentPlan,
        avoid: &mut ExcludeList,
        planner_override: Option<&str>,
    ) -> Result<Option<Destination>> {
        let started = Instant::now();
        debug!(vm_id = %profile.vm.id, "Planning deployment in zone {}", plan.zone_id);
        let result = self.plan(profile, plan, avoid, planner_override).await;

        let outcome = match &result {
            Ok(Some(destination)) => {
                self.events.publish(EngineEvent::PlacementSucceeded {
                    vm_id: profile.vm.id,
                    host_id: destination.host_id,
                });
                "placed"
            }
            Ok(None) => {
                self.events
                    .publish(EngineEvent::PlacementExhausted { vm_id: profile.vm.id });
                "exhausted"
            }
            Err(_) => "error",
        };
        self.metrics.placements.with_label_values(&[outcome]).inc();
        self.metrics
            .placement_seconds
            .with_label_values(&[outcome])
            .observe(started.elapsed().as_secs_f64());

        result
    }

    async fn plan(
        &self,
        profile: &VmProfile,
        plan: &DeploymentPlan,
        avoid: &mut ExcludeList,
        planner_override: Option<&str>,
    ) -> Result<Option<Destination>> {
        let zone = self
            .repo
            .find_zone(plan.zone_id)
            .await?
            .ok_or_else(|| Error::InvalidInput(format!("zone {} does not exist", plan.zone_id)))?;

        if avoid.should_avoid_zone(zone.id) {
            info!("Zone {} is in the avoid set, no destination", zone.id);
            return Ok(None);
        }

        self.avoid_disabled_resources(profile, &zone, avoid).await?;
        self.affinity.process(profile, plan, avoid).await?;

        let planner = self
            .planners
            .resolve(planner_override, &profile.service_offering)?;

        let volumes = self.repo.list_volumes_by_instance(profile.vm.id).await?;
        let volume_pools = self.existing_volume_pools(&volumes).await?;
        let mut attempt = Attempt {
            profile,
            zone_id: zone.id,
            requirements: HostRequirements::new(
                profile,
                &volumes,
                volume_pools,
                planner.resource_usage(),
            ),
            volumes,
        };

        // Fixed destination host: evaluate it alone
        if let Some(host_id) = plan.host_id {
            let host = self
                .repo
                .find_host(host_id)
                .await?
                .ok_or_else(|| Error::InvalidInput(format!("host {} does not exist", host_id)))?;
            debug!("Plan names host {}, evaluating it alone", host.id);
            return self.try_host(&host, &mut attempt, avoid).await;
        }

        if let Some(destination) = self.try_last_host(plan, &mut attempt, avoid).await? {
            return Ok(Some(destination));
        }

        self.apply_cross_cluster_guard(&attempt, avoid).await?;

        self.search_clusters(&planner, plan, &mut attempt, avoid).await
    }

    async fn search_clusters(
        &self,
        planner: &DeploymentPlannerRef,
        plan: &DeploymentPlan,
        attempt: &mut Attempt<'_>,
        avoid: &mut ExcludeList,
    ) -> Result<Option<Destination>> {
        if !planner.can_handle(attempt.profile, plan, avoid) {
            info!("Planner {} cannot handle this request", planner.name());
            return Ok(None);
        }

        let clusters = planner.order_clusters(attempt.profile, plan, avoid).await?;
        if clusters.is_empty() {
            info!("Planner {} found no candidate cluster", planner.name());
            return Ok(None);
        }
        debug!("Candidate clusters in order: {:?}", clusters);

        for cluster_id in clusters {
            let Some(cluster) = self.repo.find_cluster(cluster_id).await? else {
                continue;
            };
            if avoid.should_avoid_cluster(&cluster) {
                continue;
            }

            let hosts = self.repo.list_hosts_in_cluster(cluster.id).await?;
            let hosts = self
                .host_filter
                .filter(hosts, &attempt.requirements, avoid)
                .await?;
            let hosts = reorder_by_priority(hosts, &plan.host_priorities);

            for host in hosts {
                if let Some(destination) = self.try_host(&host, attempt, avoid).await? {
                    return Ok(Some(destination));
                }
            }
            debug!("No suitable host and pool combination in cluster {}", cluster.id);
        }

        info!("Placement exhausted all candidate clusters");
        Ok(None)
    }

    // =========================================================================
    // Exclusions
    // =========================================================================

    fn honors_disabled_state(&self, vm: &VirtualMachine) -> bool {
        if vm.vm_type.is_system() {
            !self.config.allow_system_vm_on_disabled_resources
        } else if vm.owner_is_admin {
            !self.config.allow_admin_vm_on_disabled_resources
        } else {
            true
        }
    }

    async fn avoid_disabled_resources(
        &self,
        profile: &VmProfile,
        zone: &Zone,
        avoid: &mut ExcludeList,
    ) -> Result<()> {
        if !self.honors_disabled_state(&profile.vm) {
            debug!("Override allows VM {} on disabled resources", profile.vm.id);
            return Ok(());
        }

        if zone.allocation_state == AllocationState::Disabled {
            avoid.add_zone(zone.id);
        }
        for pod in self.repo.list_pods_in_zone(zone.id).await? {
            if pod.allocation_state == AllocationState::Disabled {
                avoid.add_pod(pod.id);
            }
        }
        for cluster in self.repo.list_clusters_in_zone(zone.id).await? {
            if cluster.allocation_state == AllocationState::Disabled {
                avoid.add_cluster(cluster.id);
            }
        }
        let disabled_hosts = self
            .repo
            .list_hosts_in_zone(zone.id)
            .await?
            .into_iter()
            .filter(|h| h.resource_state == ResourceState::Disabled)
            .map(|h| h.id);
        avoid.add_hosts(disabled_hosts);
        Ok(())
    }

    /// Keep a restarted VM in the clusters its cluster-scoped volumes pin it to
    async fn apply_cross_cluster_guard(
        &self,
        attempt: &Attempt<'_>,
        avoid: &mut ExcludeList,
    ) -> Result<()> {
        let vm = &attempt.profile.vm;
        let restarting = vm.last_host_id.is_some()
            && attempt.volumes.iter().any(|v| v.state == VolumeState::Ready);
        if !restarting || self.config.migrate_vm_across_clusters {
            return Ok(());
        }

        let pinned: BTreeSet<ClusterId> = attempt
            .requirements
            .volume_pools
            .iter()
            .filter(|p| p.scope != PoolScope::Zone)
            .filter_map(|p| p.cluster_id)
            .collect();
        if pinned.is_empty() {
            return Ok(());
        }

        let others: Vec<ClusterId> = self
            .repo
            .list_clusters_in_zone(attempt.zone_id)
            .await?
            .into_iter()
            .map(|c| c.id)
            .filter(|id| !pinned.contains(id))
            .collect();
        debug!(
            "VM {} volumes pin it to clusters {:?}, avoiding {:?}",
            vm.id, pinned, others
        );
        avoid.add_clusters(others);
        Ok(())
    }

    async fn existing_volume_pools(&self, volumes: &[Volume]) -> Result<Vec<StoragePool>> {
        let ids: BTreeSet<PoolId> = volumes
            .iter()
            .filter(|v| v.state == VolumeState::Ready)
            .filter_map(|v| v.pool_id)
            .collect();
        let mut pools = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(pool) = self.repo.find_pool(id).await? {
                pools.push(pool);
            }
        }
        Ok(pools)
    }

    // =========================================================================
    // Host Attempts
    // =========================================================================

    async fn try_last_host(
        &self,
        plan: &DeploymentPlan,
        attempt: &mut Attempt<'_>,
        avoid: &mut ExcludeList,
    ) -> Result<Option<Destination>> {
        let Some(last_host_id) = attempt.profile.vm.last_host_id else {
            return Ok(None);
        };
        let Some(host) = self.repo.find_host(last_host_id).await? else {
            return Ok(None);
        };
        let in_scope = host.zone_id == plan.zone_id
            && plan.pod_id.map_or(true, |p| p == host.pod_id)
            && plan.cluster_id.map_or(true, |c| c == host.cluster_id)
            && plan.host_priorities.get(&host.id) != Some(&PROHIBITED_HOST_PRIORITY);
        if !in_scope {
            return Ok(None);
        }

        debug!("Trying last host {} of VM {}", host.id, attempt.profile.vm.id);
        self.try_host(&host, attempt, avoid).await
    }

    /// Filter the host, resolve every volume's pool, then reserve the host
    async fn try_host(
        &self,
        host: &Host,
        attempt: &mut Attempt<'_>,
        avoid: &mut ExcludeList,
    ) -> Result<Option<Destination>> {
        if !self
            .host_filter
            .accepts(host, &attempt.requirements, avoid)
            .await?
        {
            return Ok(None);
        }

        let Some(storage) = self.find_pools(host, attempt, avoid).await? else {
            self.release_speculative_pools(attempt).await?;
            return Ok(None);
        };

        if !self.reserve_host(host, attempt.requirements.usage).await? {
            avoid.add_host(host.id);
            return Ok(None);
        }

        info!(
            "Placement found host {} in cluster {} with {} volume(s) assigned",
            host.id,
            host.cluster_id,
            storage.len()
        );
        Ok(Some(Destination {
            zone_id: host.zone_id,
            pod_id: host.pod_id,
            cluster_id: host.cluster_id,
            host_id: host.id,
            storage,
        }))
    }

    /// Record the planner usage on the host unless another request got there first
    async fn reserve_host(&self, host: &Host, usage: PlannerResourceUsage) -> Result<bool> {
        if host.reservation == Some(usage) {
            return Ok(true);
        }
        match self
            .repo
            .update_host_reservation_if(host.id, None, Some(usage))
            .await?
        {
            1 => Ok(true),
            0 => {
                // Lost the race: accept only if the winner reserved for our usage
                let current = self.repo.find_host(host.id).await?;
                let compatible = current.map_or(false, |h| reservation_compatible(&h, usage));
                if !compatible {
                    warn!("Host {} was reserved by a concurrent request", host.id);
                }
                Ok(compatible)
            }
            rows => Err(Error::FatalInconsistency(format!(
                "reservation update of host {} affected {} rows",
                host.id, rows
            ))),
        }
    }

    // =========================================================================
    // Pool Resolution
    // =========================================================================

    /// One eligible pool per volume on this host, or None
    async fn find_pools(
        &self,
        host: &Host,
        attempt: &Attempt<'_>,
        avoid: &ExcludeList,
    ) -> Result<Option<BTreeMap<VolumeId, PoolId>>> {
        let mut assigned = BTreeMap::new();
        let mut admitted: HashMap<PoolId, Vec<VolumeRequest>> = HashMap::new();

        let mut volumes: Vec<&Volume> = attempt.volumes.iter().filter(|v| v.is_usable()).collect();
        volumes.sort_by_key(|v| (v.volume_type != VolumeType::Root, v.id));

        for volume in volumes {
            let request = VolumeRequest::new(volume.clone(), attempt.profile.profile_for(volume));

            if volume.state == VolumeState::Ready {
                let Some(pool_id) = volume.pool_id else {
                    return Err(Error::FatalInconsistency(format!(
                        "ready volume {} has no pool",
                        volume.id
                    )));
                };
                let reachable = match self.repo.find_pool(pool_id).await? {
                    Some(pool) => {
                        pool.status == StoragePoolStatus::Up
                            && !avoid.should_avoid_pool(&pool)
                            && self.matcher.can_host_access_pool(host, &pool).await?
                    }
                    None => false,
                };
                if !reachable {
                    debug!(
                        "Ready volume {} on pool {} is not usable from host {}",
                        volume.id, pool_id, host.id
                    );
                    return Ok(None);
                }
                assigned.insert(volume.id, pool_id);
                continue;
            }

            let mut candidates = self
                .allocators
                .candidates(PoolRequest {
                    disk: &request.profile,
                    vm: &attempt.profile.vm,
                    host,
                    avoid,
                })
                .await?;

            // A pool recorded by an earlier attempt is tried first
            if let Some(previous) = volume.pool_id {
                if let Some(pos) = candidates.iter().position(|p| p.id == previous) {
                    let pool = candidates.remove(pos);
                    candidates.insert(0, pool);
                }
            }

            let mut chosen = None;
            for pool in candidates {
                let pending = admitted.get(&pool.id).map(Vec::as_slice).unwrap_or(&[]);
                if self.pool_fits(host, &pool, pending, &request).await? {
                    chosen = Some(pool.id);
                    break;
                }
            }

            match chosen {
                Some(pool_id) => {
                    assigned.insert(volume.id, pool_id);
                    admitted.entry(pool_id).or_default().push(request);
                }
                None => {
                    debug!("No suitable pool for volume {} on host {}", volume.id, host.id);
                    return Ok(None);
                }
            }
        }

        Ok(Some(assigned))
    }

    /// Admission and access checks for one more volume on a pool
    async fn pool_fits(
        &self,
        host: &Host,
        pool: &StoragePool,
        pending: &[VolumeRequest],
        request: &VolumeRequest,
    ) -> Result<bool> {
        if !self.matcher.can_host_access_pool(host, pool).await? {
            return Ok(false);
        }

        let mut requests = pending.to_vec();
        requests.push(request.clone());

        if !self
            .admission
            .has_enough_space(pool, &requests, Some(host.cluster_id))
            .await?
        {
            return Ok(false);
        }
        self.admission.has_enough_iops(pool, &requests).await
    }

    /// Clear pools recorded on not-yet-created volumes after a failed attempt
    async fn release_speculative_pools(&self, attempt: &mut Attempt<'_>) -> Result<()> {
        for volume in attempt.volumes.iter_mut() {
            if volume.state == VolumeState::Allocated && volume.pool_id.is_some() {
                debug!(
                    "Clearing abandoned pool assignment of volume {}",
                    volume.id
                );
                self.repo.set_volume_pool(volume.id, None).await?;
                volume.pool_id = None;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{fixtures, DriverRegistry, InMemoryStore, SimulatedDriver};
    use assert_matches::assert_matches;

    struct Harness {
        store: Arc<InMemoryStore>,
        manager: DeploymentPlanningManager,
        events: EventBus,
    }

    fn harness_with(config: EngineConfig) -> Harness {
        let store = Arc::new(InMemoryStore::new());
        store.put_zone(fixtures::zone(1));
        store.put_pod(fixtures::pod(1, 1));
        store.put_cluster(fixtures::cluster(1));
        let mut cluster2 = fixtures::cluster(2);
        cluster2.pod_id = PodId(1);
        store.put_cluster(cluster2);
        store.put_host(fixtures::host(1, 1));
        store.put_host(fixtures::host(2, 1));
        store.put_host(fixtures::host(3, 2));
        store.put_pool(fixtures::pool(1, 100 * fixtures::GB));
        let mut pool2 = fixtures::pool(2, 100 * fixtures::GB);
        pool2.cluster_id = Some(ClusterId(2));
        store.put_pool(pool2);
        store.put_service_offering(fixtures::service_offering(1));

        let config = Arc::new(config);
        let drivers = Arc::new(DriverRegistry::new().with(SimulatedDriver::default_primary()));
        let events = EventBus::default();
        let deps = SchedulerDeps {
            repo: store.clone(),
            admission: Arc::new(CapacityAdmissionChecker::new(
                store.clone(),
                drivers,
                config.clone(),
            )),
            matcher: Arc::new(StorageAccessGroupMatcher::new(store.clone())),
            affinity: Arc::new(NoAffinity),
            events: events.clone(),
            metrics: EngineMetrics::new().unwrap(),
        };
        let manager = DeploymentPlanningManager::new(deps, config).unwrap();
        Harness {
            store,
            manager,
            events,
        }
    }

    fn harness() -> Harness {
        harness_with(EngineConfig::default())
    }

    /// VM 1 with one unplaced data volume of `size` GB
    fn workload(h: &Harness, size_gb: u64) -> VmProfile {
        let vm = fixtures::vm(1);
        h.store.put_vm(vm.clone());
        let mut volume = fixtures::volume(1, size_gb * fixtures::GB);
        volume.instance_id = Some(vm.id);
        h.store.put_volume(volume);
        VmProfile::new(vm, fixtures::service_offering(1))
    }

    #[tokio::test]
    async fn test_places_vm_and_volume() {
        let h = harness();
        let profile = workload(&h, 10);
        let mut events = h.events.subscribe();

        let destination = h
            .manager
            .plan_deployment(&profile, &DeploymentPlan::new(ZoneId(1)), &mut ExcludeList::new(), None)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(destination.cluster_id, ClusterId(1));
        assert_eq!(destination.host_id, HostId(1));
        assert_eq!(destination.storage[&VolumeId(1)], PoolId(1));
        assert_eq!(
            h.store.host(HostId(1)).unwrap().reservation,
            Some(PlannerResourceUsage::Shared)
        );
        assert_eq!(
            events.recv().await.unwrap(),
            EngineEvent::PlacementSucceeded {
                vm_id: VmId(1),
                host_id: HostId(1)
            }
        );
    }

    #[tokio::test]
    async fn test_all_clusters_avoided_is_exhaustion_not_error() {
        let h = harness();
        let profile = workload(&h, 10);
        let mut avoid = ExcludeList::new();
        avoid.add_clusters([ClusterId(1), ClusterId(2)]);

        let result = h
            .manager
            .plan_deployment(&profile, &DeploymentPlan::new(ZoneId(1)), &mut avoid, None)
            .await;
        assert_matches!(result, Ok(None));
    }

    #[tokio::test]
    async fn test_unknown_zone_is_input_error() {
        let h = harness();
        let profile = workload(&h, 10);
        let result = h
            .manager
            .plan_deployment(&profile, &DeploymentPlan::new(ZoneId(9)), &mut ExcludeList::new(), None)
            .await;
        assert_matches!(result, Err(Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_host_priorities_decide_order() {
        let h = harness();
        let profile = workload(&h, 10);
        let mut plan = DeploymentPlan::new(ZoneId(1)).with_cluster(ClusterId(1));
        plan.prohibit_host(HostId(1));

        let destination = h
            .manager
            .plan_deployment(&profile, &plan, &mut ExcludeList::new(), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(destination.host_id, HostId(2));
    }

    #[tokio::test]
    async fn test_falls_through_to_next_cluster_when_pool_full() {
        let h = harness();
        let profile = workload(&h, 10);
        let mut full = fixtures::pool(1, 100 * fixtures::GB);
        full.used_bytes = 90 * fixtures::GB;
        h.store.put_pool(full);

        let destination = h
            .manager
            .plan_deployment(&profile, &DeploymentPlan::new(ZoneId(1)), &mut ExcludeList::new(), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(destination.host_id, HostId(3));
        assert_eq!(destination.storage[&VolumeId(1)], PoolId(2));
    }

    #[tokio::test]
    async fn test_volume_too_large_everywhere_exhausts() {
        let h = harness();
        let profile = workload(&h, 500);
        let result = h
            .manager
            .plan_deployment(&profile, &DeploymentPlan::new(ZoneId(1)), &mut ExcludeList::new(), None)
            .await;
        assert_matches!(result, Ok(None));
    }

    #[tokio::test]
    async fn test_disabled_cluster_avoided_unless_admin_override() {
        let mut cluster = fixtures::cluster(1);
        cluster.allocation_state = AllocationState::Disabled;

        let h = harness();
        h.store.put_cluster(cluster.clone());
        let profile = workload(&h, 10);
        let mut avoid = ExcludeList::new();
        let destination = h
            .manager
            .plan_deployment(&profile, &DeploymentPlan::new(ZoneId(1)), &mut avoid, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(destination.cluster_id, ClusterId(2));
        assert!(avoid.clusters.contains(&ClusterId(1)));

        let mut config = EngineConfig::default();
        config.allow_admin_vm_on_disabled_resources = true;
        let h = harness_with(config);
        h.store.put_cluster(cluster);
        let mut profile = workload(&h, 10);
        profile.vm.owner_is_admin = true;
        let destination = h
            .manager
            .plan_deployment(&profile, &DeploymentPlan::new(ZoneId(1)), &mut ExcludeList::new(), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(destination.cluster_id, ClusterId(1));
    }

    #[tokio::test]
    async fn test_encrypted_volume_needs_capable_host() {
        let h = harness();
        let profile = workload(&h, 10);
        let mut volume = h.store.volume(VolumeId(1)).unwrap();
        volume.passphrase_id = Some(77);
        h.store.put_volume(volume);

        let mut capable = fixtures::host(3, 2);
        capable.supports_volume_encryption = true;
        h.store.put_host(capable);

        let destination = h
            .manager
            .plan_deployment(&profile, &DeploymentPlan::new(ZoneId(1)), &mut ExcludeList::new(), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(destination.host_id, HostId(3));
    }

    #[tokio::test]
    async fn test_restart_stays_in_pinned_cluster() {
        let h = harness();
        let mut profile = workload(&h, 10);
        let mut volume = h.store.volume(VolumeId(1)).unwrap();
        volume.state = VolumeState::Ready;
        volume.pool_id = Some(PoolId(1));
        h.store.put_volume(volume);

        // Last host went down; the VM must stay in cluster 1
        let mut last = fixtures::host(1, 1);
        last.status = HostStatus::Down;
        h.store.put_host(last);
        profile.vm.last_host_id = Some(HostId(1));

        let mut avoid = ExcludeList::new();
        let destination = h
            .manager
            .plan_deployment(&profile, &DeploymentPlan::new(ZoneId(1)), &mut avoid, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(destination.host_id, HostId(2));
        assert_eq!(destination.storage[&VolumeId(1)], PoolId(1));
        assert!(avoid.clusters.contains(&ClusterId(2)));
    }

    #[tokio::test]
    async fn test_last_host_preferred() {
        let h = harness();
        let mut profile = workload(&h, 10);
        profile.vm.last_host_id = Some(HostId(2));

        let destination = h
            .manager
            .plan_deployment(&profile, &DeploymentPlan::new(ZoneId(1)), &mut ExcludeList::new(), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(destination.host_id, HostId(2));
    }

    #[tokio::test]
    async fn test_abandoned_pool_assignment_is_cleared() {
        let h = harness();
        let profile = workload(&h, 10);
        let mut volume = h.store.volume(VolumeId(1)).unwrap();
        volume.pool_id = Some(PoolId(1));
        h.store.put_volume(volume);

        // Pin the plan to host 1, whose only pool is now out of room
        let mut full = fixtures::pool(1, 100 * fixtures::GB);
        full.used_bytes = 95 * fixtures::GB;
        h.store.put_pool(full);

        let plan = DeploymentPlan::new(ZoneId(1)).with_host(HostId(1));
        let result = h
            .manager
            .plan_deployment(&profile, &plan, &mut ExcludeList::new(), None)
            .await
            .unwrap();
        assert!(result.is_none());
        assert_eq!(h.store.volume(VolumeId(1)).unwrap().pool_id, None);
    }

    #[tokio::test]
    async fn test_planner_that_cannot_handle_yields_none() {
        let h = harness();
        let mut profile = workload(&h, 10);
        profile.vm.vm_type = VmType::DomainRouter;

        let result = h
            .manager
            .plan_deployment(
                &profile,
                &DeploymentPlan::new(ZoneId(1)),
                &mut ExcludeList::new(),
                Some("ImplicitDedicationPlanner"),
            )
            .await;
        assert_matches!(result, Ok(None));
    }

    #[tokio::test]
    async fn test_two_volumes_count_against_same_pool() {
        let h = harness();
        let profile = workload(&h, 80);
        let mut second = fixtures::volume(2, 80 * fixtures::GB);
        second.instance_id = Some(VmId(1));
        h.store.put_volume(second);

        // 80 + 80 of 200 effective passes; a third would not fit on one pool
        let destination = h
            .manager
            .plan_deployment(&profile, &DeploymentPlan::new(ZoneId(1)), &mut ExcludeList::new(), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(destination.storage.len(), 2);

        let mut third = fixtures::volume(3, 80 * fixtures::GB);
        third.instance_id = Some(VmId(1));
        h.store.put_volume(third);
        let result = h
            .manager
            .plan_deployment(&profile, &DeploymentPlan::new(ZoneId(1)), &mut ExcludeList::new(), None)
            .await
            .unwrap();
        assert!(result.is_none());
    }
}

//! Storage access group matching
//!
//! Hosts inherit access group labels from their cluster, pod and zone. A pool
//! with no groups is open to every host; otherwise a host must share at least
//! one label with it.

use crate::domain::*;
use crate::error::{Error, Result};
use std::collections::BTreeSet;
use tracing::debug;

/// Reason reported when a stopped volume's pools have no host in common
pub const NO_COMMON_HOST: &str = "No common host connected to source and destination storages";

/// Split comma-separated label lists into a set, dropping blanks
pub fn parse_groups<S: AsRef<str>>(labels: &[S]) -> BTreeSet<String> {
    labels
        .iter()
        .flat_map(|l| l.as_ref().split(','))
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

fn intersects(a: &BTreeSet<String>, b: &BTreeSet<String>) -> bool {
    a.intersection(b).next().is_some()
}

/// Outcome of a volume move check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MoveVerdict {
    Allowed,
    Denied(String),
}

impl MoveVerdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, MoveVerdict::Allowed)
    }
}

/// Host to pool connectivity by storage access groups
pub struct StorageAccessGroupMatcher {
    repo: ResourceRepositoryRef,
}

impl StorageAccessGroupMatcher {
    pub fn new(repo: ResourceRepositoryRef) -> Self {
        Self { repo }
    }

    /// Union of the labels declared on the given hierarchy levels
    ///
    /// Missing ids are skipped; ids that do not resolve are an error.
    pub async fn effective_groups(
        &self,
        zone_id: Option<ZoneId>,
        pod_id: Option<PodId>,
        cluster_id: Option<ClusterId>,
        host_id: Option<HostId>,
    ) -> Result<BTreeSet<String>> {
        let mut groups = BTreeSet::new();

        if let Some(id) = host_id {
            let host = self
                .repo
                .find_host(id)
                .await?
                .ok_or_else(|| Error::not_found("host", id))?;
            groups.extend(parse_groups(&host.storage_access_groups));
        }
        if let Some(id) = cluster_id {
            let cluster = self
                .repo
                .find_cluster(id)
                .await?
                .ok_or_else(|| Error::not_found("cluster", id))?;
            groups.extend(parse_groups(&cluster.storage_access_groups));
        }
        if let Some(id) = pod_id {
            let pod = self
                .repo
                .find_pod(id)
                .await?
                .ok_or_else(|| Error::not_found("pod", id))?;
            groups.extend(parse_groups(&pod.storage_access_groups));
        }
        if let Some(id) = zone_id {
            let zone = self
                .repo
                .find_zone(id)
                .await?
                .ok_or_else(|| Error::not_found("zone", id))?;
            groups.extend(parse_groups(&zone.storage_access_groups));
        }

        Ok(groups)
    }

    /// Effective groups of a host; ancestors missing from the repository contribute nothing
    pub async fn host_groups(&self, host: &Host) -> Result<BTreeSet<String>> {
        let mut groups = parse_groups(&host.storage_access_groups);
        if let Some(cluster) = self.repo.find_cluster(host.cluster_id).await? {
            groups.extend(parse_groups(&cluster.storage_access_groups));
        }
        if let Some(pod) = self.repo.find_pod(host.pod_id).await? {
            groups.extend(parse_groups(&pod.storage_access_groups));
        }
        if let Some(zone) = self.repo.find_zone(host.zone_id).await? {
            groups.extend(parse_groups(&zone.storage_access_groups));
        }
        Ok(groups)
    }

    pub fn pool_groups(pool: &StoragePool) -> BTreeSet<String> {
        parse_groups(&pool.storage_access_groups)
    }

    /// Group match only; scope is not considered
    pub async fn can_host_reach_pool(&self, host: &Host, pool: &StoragePool) -> Result<bool> {
        let pool_groups = Self::pool_groups(pool);
        if pool_groups.is_empty() {
            return Ok(true);
        }

        let host_groups = self.host_groups(host).await?;
        let reachable = intersects(&host_groups, &pool_groups);
        if !reachable {
            debug!(
                pool_id = %pool.id,
                "Host {} groups {:?} do not match pool groups {:?}",
                host.id, host_groups, pool_groups
            );
        }
        Ok(reachable)
    }

    /// Scope placement followed by the group match
    pub async fn can_host_access_pool(&self, host: &Host, pool: &StoragePool) -> Result<bool> {
        let in_scope = match pool.scope {
            PoolScope::Host => pool.host_id == Some(host.id),
            PoolScope::Cluster => pool.cluster_id == Some(host.cluster_id),
            PoolScope::Zone => {
                pool.zone_id == host.zone_id
                    && pool.hypervisor.map_or(true, |hv| hv == host.hypervisor)
            }
        };
        if !in_scope {
            return Ok(false);
        }
        self.can_host_reach_pool(host, pool).await
    }

    // =========================================================================
    // Volume Moves
    // =========================================================================

    /// May `volume` move from its current pool to `destination`
    pub async fn check_volume_move(
        &self,
        volume: &Volume,
        destination: &StoragePool,
    ) -> Result<MoveVerdict> {
        let Some(source_id) = volume.pool_id else {
            return Ok(MoveVerdict::Allowed);
        };
        let source = self
            .repo
            .find_pool(source_id)
            .await?
            .ok_or_else(|| Error::not_found("pool", source_id))?;

        let vm = match volume.instance_id {
            Some(vm_id) => self.repo.find_vm(vm_id).await?,
            None => None,
        };

        let source_groups = Self::pool_groups(&source);
        let destination_groups = Self::pool_groups(destination);

        match vm {
            Some(vm) if vm.state == VmState::Running => {
                let host_id = vm.host_id.ok_or_else(|| {
                    Error::FatalInconsistency(format!("running VM {} has no host", vm.id))
                })?;
                let host = self
                    .repo
                    .find_host(host_id)
                    .await?
                    .ok_or_else(|| Error::not_found("host", host_id))?;
                let host_groups = self.host_groups(&host).await?;
                Ok(Self::running_move_verdict(
                    &source_groups,
                    &destination_groups,
                    &host_groups,
                    host.id,
                ))
            }
            _ => {
                self.stopped_move_verdict(&source, destination, &source_groups, &destination_groups)
                    .await
            }
        }
    }

    /// Attached volume: the current host must reach both pools
    fn running_move_verdict(
        source: &BTreeSet<String>,
        destination: &BTreeSet<String>,
        host: &BTreeSet<String>,
        host_id: HostId,
    ) -> MoveVerdict {
        match (source.is_empty(), destination.is_empty()) {
            (_, true) => MoveVerdict::Allowed,
            (false, false) => {
                let common = source
                    .intersection(destination)
                    .any(|g| host.contains(g));
                if common {
                    MoveVerdict::Allowed
                } else {
                    MoveVerdict::Denied(format!(
                        "No common storage access group among source pool, destination pool and host {}",
                        host_id
                    ))
                }
            }
            (true, false) => {
                if intersects(host, destination) {
                    MoveVerdict::Allowed
                } else {
                    MoveVerdict::Denied(format!(
                        "Host {} is not in any storage access group of the destination pool",
                        host_id
                    ))
                }
            }
        }
    }

    /// Detached volume: the pools only need a host connected to both
    async fn stopped_move_verdict(
        &self,
        source: &StoragePool,
        destination: &StoragePool,
        source_groups: &BTreeSet<String>,
        destination_groups: &BTreeSet<String>,
    ) -> Result<MoveVerdict> {
        if source_groups.is_empty()
            || destination_groups.is_empty()
            || intersects(source_groups, destination_groups)
        {
            return Ok(MoveVerdict::Allowed);
        }

        let source_hosts: BTreeSet<HostId> = self
            .repo
            .list_pool_host_refs(source.id)
            .await?
            .into_iter()
            .map(|r| r.host_id)
            .collect();
        let shared: Vec<HostId> = self
            .repo
            .list_pool_host_refs(destination.id)
            .await?
            .into_iter()
            .map(|r| r.host_id)
            .filter(|h| source_hosts.contains(h))
            .collect();

        let hosts = self.repo.find_hosts(&shared).await?;
        if hosts.iter().any(Host::is_up_and_enabled) {
            Ok(MoveVerdict::Allowed)
        } else {
            Ok(MoveVerdict::Denied(NO_COMMON_HOST.to_string()))
        }
    }
}

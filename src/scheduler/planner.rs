//! Deployment Planners
//!
//! A planner decides which clusters a placement request should try, and in
//! what order. Planners are registered by name and resolved from the request
//! override, the service offering, or the configured default.

use crate::domain::*;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

pub const FIRST_FIT_PLANNER: &str = "FirstFitPlanner";
pub const IMPLICIT_DEDICATION_PLANNER: &str = "ImplicitDedicationPlanner";

// =============================================================================
// Planner Trait
// =============================================================================

#[async_trait]
pub trait DeploymentPlanner: Send + Sync {
    fn name(&self) -> &str;

    /// Host reservation class this planner places into
    fn resource_usage(&self) -> PlannerResourceUsage;

    fn can_handle(&self, profile: &VmProfile, plan: &DeploymentPlan, avoid: &ExcludeList) -> bool;

    /// Candidate clusters, best first, honoring the exclude list
    async fn order_clusters(
        &self,
        profile: &VmProfile,
        plan: &DeploymentPlan,
        avoid: &ExcludeList,
    ) -> Result<Vec<ClusterId>>;
}

pub type DeploymentPlannerRef = Arc<dyn DeploymentPlanner>;

// =============================================================================
// Cluster Candidates
// =============================================================================

/// Aggregate headroom of one cluster's usable hosts
#[derive(Debug, Clone)]
struct ClusterHeadroom {
    cluster_id: ClusterId,
    free_memory_bytes: u64,
    hosts: Vec<Host>,
}

/// Clusters in the plan's scope that are not avoided and have at least one
/// usable host able to fit the offering, ordered by free memory
async fn clusters_with_capacity(
    repo: &ResourceRepositoryRef,
    profile: &VmProfile,
    plan: &DeploymentPlan,
    avoid: &ExcludeList,
) -> Result<Vec<ClusterHeadroom>> {
    let offering = &profile.service_offering;
    let needed_cpu = offering.cpus as u64 * offering.speed_mhz as u64;

    let mut clusters = repo.list_clusters_in_zone(plan.zone_id).await?;
    clusters.retain(|c| {
        plan.cluster_id.map_or(true, |id| id == c.id)
            && plan.pod_id.map_or(true, |id| id == c.pod_id)
            && !avoid.should_avoid_cluster(c)
    });

    let mut candidates = Vec::with_capacity(clusters.len());
    for cluster in clusters {
        let hosts: Vec<Host> = repo
            .list_hosts_in_cluster(cluster.id)
            .await?
            .into_iter()
            .filter(|h| h.is_up_and_enabled() && !avoid.should_avoid_host(h))
            .collect();

        let fits = hosts.iter().any(|h| {
            h.free_cpu_mhz() >= needed_cpu && h.free_memory_bytes() >= offering.memory_bytes
        });
        if !fits {
            debug!(
                "Cluster {} has no host with capacity for offering {}, skipping",
                cluster.id, offering.id
            );
            continue;
        }

        candidates.push(ClusterHeadroom {
            cluster_id: cluster.id,
            free_memory_bytes: hosts.iter().map(Host::free_memory_bytes).sum(),
            hosts,
        });
    }

    // Stable: equal headroom keeps id order
    candidates.sort_by_key(|c| Reverse(c.free_memory_bytes));
    Ok(candidates)
}

// =============================================================================
// First Fit
// =============================================================================

/// Shared placement across every cluster with room, most free memory first
pub struct FirstFitPlanner {
    repo: ResourceRepositoryRef,
}

impl FirstFitPlanner {
    pub fn new(repo: ResourceRepositoryRef) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl DeploymentPlanner for FirstFitPlanner {
    fn name(&self) -> &str {
        FIRST_FIT_PLANNER
    }

    fn resource_usage(&self) -> PlannerResourceUsage {
        PlannerResourceUsage::Shared
    }

    fn can_handle(&self, _profile: &VmProfile, _plan: &DeploymentPlan, _avoid: &ExcludeList) -> bool {
        true
    }

    async fn order_clusters(
        &self,
        profile: &VmProfile,
        plan: &DeploymentPlan,
        avoid: &ExcludeList,
    ) -> Result<Vec<ClusterId>> {
        let ordered = clusters_with_capacity(&self.repo, profile, plan, avoid).await?;
        Ok(ordered.into_iter().map(|c| c.cluster_id).collect())
    }
}

// =============================================================================
// Implicit Dedication
// =============================================================================

/// Places onto hosts that carry no shared workload
///
/// Clusters already holding dedicated hosts come first; clusters whose
/// hosts are all reserved for shared use are dropped.
pub struct ImplicitDedicationPlanner {
    repo: ResourceRepositoryRef,
}

impl ImplicitDedicationPlanner {
    pub fn new(repo: ResourceRepositoryRef) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl DeploymentPlanner for ImplicitDedicationPlanner {
    fn name(&self) -> &str {
        IMPLICIT_DEDICATION_PLANNER
    }

    fn resource_usage(&self) -> PlannerResourceUsage {
        PlannerResourceUsage::Dedicated
    }

    /// System VMs never take dedicated hosts
    fn can_handle(&self, profile: &VmProfile, _plan: &DeploymentPlan, _avoid: &ExcludeList) -> bool {
        !profile.vm.vm_type.is_system()
    }

    async fn order_clusters(
        &self,
        profile: &VmProfile,
        plan: &DeploymentPlan,
        avoid: &ExcludeList,
    ) -> Result<Vec<ClusterId>> {
        let mut ordered = clusters_with_capacity(&self.repo, profile, plan, avoid).await?;
        ordered.retain(|c| {
            c.hosts.iter().any(|h| match h.reservation {
                Some(PlannerResourceUsage::Dedicated) => true,
                Some(PlannerResourceUsage::Shared) => false,
                None => h.running_guests == 0,
            })
        });
        ordered.sort_by_key(|c| {
            !c.hosts
                .iter()
                .any(|h| h.reservation == Some(PlannerResourceUsage::Dedicated))
        });
        Ok(ordered.into_iter().map(|c| c.cluster_id).collect())
    }
}

// =============================================================================
// Planner Registry
// =============================================================================

/// Exact-name lookup of planners with a configured default
pub struct PlannerRegistry {
    planners: HashMap<String, DeploymentPlannerRef>,
    default_name: String,
}

impl PlannerRegistry {
    pub fn new(default_name: impl Into<String>) -> Self {
        Self {
            planners: HashMap::new(),
            default_name: default_name.into(),
        }
    }

    /// Registry holding the built-in planners
    pub fn standard(repo: ResourceRepositoryRef, default_name: impl Into<String>) -> Self {
        Self::new(default_name)
            .with(Arc::new(FirstFitPlanner::new(repo.clone())))
            .with(Arc::new(ImplicitDedicationPlanner::new(repo)))
    }

    pub fn register(&mut self, planner: DeploymentPlannerRef) {
        self.planners.insert(planner.name().to_string(), planner);
    }

    pub fn with(mut self, planner: DeploymentPlannerRef) -> Self {
        self.register(planner);
        self
    }

    /// Request override, then the offering's planner, then the default
    pub fn resolve(
        &self,
        override_name: Option<&str>,
        offering: &ServiceOffering,
    ) -> Result<DeploymentPlannerRef> {
        let name = override_name
            .or(offering.planner.as_deref())
            .unwrap_or(&self.default_name);
        self.planners
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Configuration(format!("no deployment planner named {}", name)))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.planners.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

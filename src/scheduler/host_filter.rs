//! Host Filtering and Ordering
//!
//! Narrows a cluster's hosts to those able to run the workload, then orders
//! them by the plan's explicit host priorities.

use crate::access::StorageAccessGroupMatcher;
use crate::domain::*;
use crate::error::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// What a host must offer to be considered
#[derive(Debug, Clone)]
pub struct HostRequirements {
    pub cpus: u32,
    pub speed_mhz: u32,
    pub memory_bytes: u64,
    pub gpus: u32,
    pub hypervisor: HypervisorType,
    /// Any volume carries a passphrase
    pub requires_encryption: bool,
    /// Pools the workload's existing volumes sit on
    pub volume_pools: Vec<StoragePool>,
    /// Reservation class of the selected planner
    pub usage: PlannerResourceUsage,
}

impl HostRequirements {
    pub fn new(
        profile: &VmProfile,
        volumes: &[Volume],
        volume_pools: Vec<StoragePool>,
        usage: PlannerResourceUsage,
    ) -> Self {
        let offering = &profile.service_offering;
        Self {
            cpus: offering.cpus,
            speed_mhz: offering.speed_mhz,
            memory_bytes: offering.memory_bytes,
            gpus: offering.gpus,
            hypervisor: profile.vm.hypervisor,
            requires_encryption: volumes.iter().any(Volume::requires_encryption),
            volume_pools,
            usage,
        }
    }
}

/// May a host with `reservation` take a workload of class `usage`
pub fn reservation_compatible(host: &Host, usage: PlannerResourceUsage) -> bool {
    match host.reservation {
        Some(reserved) => reserved == usage,
        // An unreserved host can only become dedicated while empty
        None => usage == PlannerResourceUsage::Shared || host.running_guests == 0,
    }
}

// =============================================================================
// Host Filter
// =============================================================================

pub struct HostFilter {
    matcher: Arc<StorageAccessGroupMatcher>,
    default_max_guests: u32,
}

impl HostFilter {
    pub fn new(matcher: Arc<StorageAccessGroupMatcher>, default_max_guests: u32) -> Self {
        Self {
            matcher,
            default_max_guests,
        }
    }

    /// Hosts that pass every check, original order kept
    pub async fn filter(
        &self,
        hosts: Vec<Host>,
        requirements: &HostRequirements,
        avoid: &ExcludeList,
    ) -> Result<Vec<Host>> {
        let mut suitable = Vec::with_capacity(hosts.len());
        for host in hosts {
            if self.accepts(&host, requirements, avoid).await? {
                suitable.push(host);
            }
        }
        Ok(suitable)
    }

    pub async fn accepts(
        &self,
        host: &Host,
        requirements: &HostRequirements,
        avoid: &ExcludeList,
    ) -> Result<bool> {
        if let Some(reason) = self.rejection(host, requirements, avoid) {
            debug!("Host {} rejected: {}", host.id, reason);
            return Ok(false);
        }

        for pool in &requirements.volume_pools {
            if !self.matcher.can_host_reach_pool(host, pool).await? {
                debug!(
                    "Host {} rejected: cannot reach pool {} of an existing volume",
                    host.id, pool.id
                );
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// First failed synchronous check, if any
    fn rejection(
        &self,
        host: &Host,
        requirements: &HostRequirements,
        avoid: &ExcludeList,
    ) -> Option<&'static str> {
        if avoid.should_avoid_host(host) {
            return Some("in avoid set");
        }
        if !host.is_up_and_enabled() {
            return Some("not up and enabled");
        }
        if requirements.requires_encryption && !host.supports_volume_encryption {
            return Some("volume encryption not supported");
        }
        if host.hypervisor != requirements.hypervisor {
            return Some("hypervisor mismatch");
        }
        let max_guests = host.max_guests.unwrap_or(self.default_max_guests);
        if host.running_guests >= max_guests {
            return Some("maximum guest count reached");
        }
        if requirements.cpus > host.cpu_cores || requirements.speed_mhz > host.cpu_speed_mhz {
            return Some("cpu capability insufficient");
        }
        let needed_cpu = requirements.cpus as u64 * requirements.speed_mhz as u64;
        if host.free_cpu_mhz() < needed_cpu {
            return Some("not enough free cpu");
        }
        if host.free_memory_bytes() < requirements.memory_bytes {
            return Some("not enough free memory");
        }
        if requirements.gpus > host.free_gpus {
            return Some("not enough free gpus");
        }
        if !reservation_compatible(host, requirements.usage) {
            return Some("reserved for another planner usage");
        }
        None
    }
}

// =============================================================================
// Priority Ordering
// =============================================================================

/// Stable ascending reorder by explicit priority
///
/// Hosts without an entry follow every prioritized host; prohibited hosts
/// are dropped.
pub fn reorder_by_priority(hosts: Vec<Host>, priorities: &HashMap<HostId, i32>) -> Vec<Host> {
    if priorities.is_empty() {
        return hosts;
    }

    let mut ordered: Vec<Host> = hosts
        .into_iter()
        .filter(|h| priorities.get(&h.id) != Some(&PROHIBITED_HOST_PRIORITY))
        .collect();
    ordered.sort_by_key(|h| match priorities.get(&h.id) {
        Some(priority) => (0u8, *priority),
        None => (1u8, 0),
    });
    ordered
}

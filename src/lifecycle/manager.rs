//! Storage Pool Lifecycle Manager
//!
//! Drives pools through their status machine:
//!
//! ```text
//!   Up <-> Disabled
//!   Up -> PrepareForMaintenance -> Maintenance -> CancelMaintenance -> Up
//!   any failure -> ErrorInMaintenance -> PrepareForMaintenance (retry)
//!   Maintenance -> Removed (delete)
//! ```
//!
//! Every status change is a compare-and-swap on the pool row. A swap that
//! matches no row lost a race and is reported, never overwritten.

use super::connect::{ConnectOptions, HostConnector};
use super::expunge::{ExpungeMode, VolumeExpunger};
use crate::access::StorageAccessGroupMatcher;
use crate::capacity::CapacityTracker;
use crate::config::EngineConfig;
use crate::domain::*;
use crate::error::{Error, Result};
use crate::events::{EngineEvent, EventBus};
use crate::metrics::EngineMetrics;
use backoff::ExponentialBackoff;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Retry policy for status updates that hit a repository error
fn status_update_policy() -> ExponentialBackoff {
    const INITIAL_INTERVAL: Duration = Duration::from_millis(50);
    ExponentialBackoff {
        current_interval: INITIAL_INTERVAL,
        initial_interval: INITIAL_INTERVAL,
        multiplier: 2.0,
        max_interval: Duration::from_secs(1),
        max_elapsed_time: Some(Duration::from_secs(2)),
        ..ExponentialBackoff::default()
    }
}

/// Collaborators of the lifecycle manager
pub struct LifecycleDeps {
    pub repo: ResourceRepositoryRef,
    pub drivers: StorageDriverProviderRef,
    pub gateway: RemoteExecutionGatewayRef,
    pub matcher: Arc<StorageAccessGroupMatcher>,
    pub tracker: Arc<CapacityTracker>,
    pub events: EventBus,
    pub metrics: EngineMetrics,
}

pub struct StoragePoolLifecycleManager {
    repo: ResourceRepositoryRef,
    drivers: StorageDriverProviderRef,
    matcher: Arc<StorageAccessGroupMatcher>,
    tracker: Arc<CapacityTracker>,
    connector: HostConnector,
    expunger: VolumeExpunger,
    events: EventBus,
    metrics: EngineMetrics,
}

impl StoragePoolLifecycleManager {
    pub fn new(deps: LifecycleDeps, config: &EngineConfig) -> Self {
        let connector = HostConnector::new(
            deps.repo.clone(),
            deps.gateway.clone(),
            deps.tracker.clone(),
            deps.events.clone(),
            deps.metrics.clone(),
            config.host_connect_workers,
        );
        let expunger = VolumeExpunger::new(deps.repo.clone(), deps.gateway, deps.events.clone());
        Self {
            repo: deps.repo,
            drivers: deps.drivers,
            matcher: deps.matcher,
            tracker: deps.tracker,
            connector,
            expunger,
            events: deps.events,
            metrics: deps.metrics,
        }
    }

    async fn load(&self, pool_id: PoolId) -> Result<StoragePool> {
        self.repo
            .find_pool(pool_id)
            .await?
            .ok_or_else(|| Error::not_found("pool", pool_id))
    }

    // =========================================================================
    // Status Updates
    // =========================================================================

    /// Move a pool from `expected` to `next` if it is still in `expected`
    pub async fn update_status_if(
        &self,
        pool_id: PoolId,
        expected: StoragePoolStatus,
        next: StoragePoolStatus,
    ) -> Result<()> {
        let rows = backoff::future::retry(status_update_policy(), || async {
            self.repo
                .update_pool_status_if(pool_id, expected, next)
                .await
                .map_err(|err| match err {
                    Error::Repository(_) => {
                        warn!(pool_id = %pool_id, "Status update failed, retrying: {}", err);
                        backoff::Error::transient(err)
                    }
                    other => backoff::Error::permanent(other),
                })
        })
        .await?;

        match rows {
            0 => Err(Error::LostUpdate {
                kind: "pool".into(),
                id: pool_id.to_string(),
                expected: expected.to_string(),
            }),
            1 => {
                debug!(pool_id = %pool_id, "Status {} -> {}", expected, next);
                let to = next.to_string();
                self.metrics
                    .pool_transitions
                    .with_label_values(&[to.as_str()])
                    .inc();
                self.events.publish(EngineEvent::PoolStatusChanged {
                    pool_id,
                    from: expected,
                    to: next,
                });
                Ok(())
            }
            n => {
                error!(pool_id = %pool_id, "Status update {} -> {} touched {} rows", expected, next, n);
                Err(Error::FatalInconsistency(format!(
                    "status update of pool {} affected {} rows",
                    pool_id, n
                )))
            }
        }
    }

    /// Best-effort move to ErrorInMaintenance from whatever status the pool holds
    async fn mark_error_in_maintenance(&self, pool_id: PoolId) {
        let current = match self.repo.find_pool(pool_id).await {
            Ok(Some(pool)) => pool.status,
            Ok(None) => return,
            Err(err) => {
                error!(pool_id = %pool_id, "Unable to load pool to flag maintenance error: {}", err);
                return;
            }
        };
        if current == StoragePoolStatus::ErrorInMaintenance {
            return;
        }
        if let Err(err) = self
            .update_status_if(pool_id, current, StoragePoolStatus::ErrorInMaintenance)
            .await
        {
            error!(pool_id = %pool_id, "Unable to flag maintenance error: {}", err);
        }
    }

    // =========================================================================
    // Creation and Host Connection
    // =========================================================================

    /// Initialize a new pool with its driver and record it
    pub async fn create_pool(&self, pool: StoragePool) -> Result<StoragePool> {
        if pool.capacity_bytes == 0 && !pool.managed {
            return Err(Error::InvalidInput(format!(
                "pool {} must declare a capacity",
                pool.name
            )));
        }
        if self.repo.find_pool_by_uuid(&pool.uuid).await?.is_some() {
            return Err(Error::StorageConflict {
                pool_id: pool.id.to_string(),
                reason: format!("uuid {} is already registered", pool.uuid),
            });
        }

        let driver = self.drivers.require(&pool.provider_name)?;
        driver.initialize(&pool).await?;
        self.repo.insert_pool(pool.clone()).await?;
        self.tracker.recompute_pool(pool.id).await?;

        info!(pool_id = %pool.id, "Created {} pool {} ({})", pool.scope, pool.name, pool.pool_type);
        Ok(pool)
    }

    /// Up and Enabled hosts that may mount the pool
    pub async fn hosts_in_scope(&self, pool: &StoragePool) -> Result<Vec<Host>> {
        let candidates = match pool.scope {
            PoolScope::Host => match pool.host_id {
                Some(host_id) => self.repo.find_hosts(&[host_id]).await?,
                None => Vec::new(),
            },
            PoolScope::Cluster => match pool.cluster_id {
                Some(cluster_id) => self.repo.list_hosts_in_cluster(cluster_id).await?,
                None => Vec::new(),
            },
            PoolScope::Zone => self.repo.list_hosts_in_zone(pool.zone_id).await?,
        };

        let mut hosts = Vec::with_capacity(candidates.len());
        for host in candidates {
            if host.is_up_and_enabled() && self.matcher.can_host_access_pool(&host, pool).await? {
                hosts.push(host);
            }
        }
        Ok(hosts)
    }

    /// Attach a created pool to its scope and mount it on every eligible host
    pub async fn attach_pool(&self, pool_id: PoolId, options: ConnectOptions) -> Result<Vec<HostId>> {
        let pool = self.load(pool_id).await?;
        let driver = self.drivers.require(&pool.provider_name)?;
        driver.attach(&pool, pool.scope).await?;

        let host_ids: Vec<HostId> = self.hosts_in_scope(&pool).await?.iter().map(|h| h.id).collect();
        self.connect_hosts_to_pool(pool_id, &host_ids, pool.scope, options)
            .await
    }

    /// Mount a shared pool on the given hosts
    ///
    /// A conflicting or fatal host failure disconnects the hosts already
    /// connected and removes the pool record.
    pub async fn connect_hosts_to_pool(
        &self,
        pool_id: PoolId,
        host_ids: &[HostId],
        scope: PoolScope,
        options: ConnectOptions,
    ) -> Result<Vec<HostId>> {
        let pool = self.load(pool_id).await?;
        if pool.scope != scope {
            return Err(Error::InvalidInput(format!(
                "pool {} has scope {}, not {}",
                pool.id, pool.scope, scope
            )));
        }
        if pool.status != StoragePoolStatus::Up {
            return Err(Error::state_conflict("pool", pool.id, pool.status, "connect hosts to"));
        }
        self.connector.connect_hosts(&pool, host_ids, options).await
    }

    // =========================================================================
    // Enable / Disable
    // =========================================================================

    pub async fn enable_pool(&self, pool_id: PoolId) -> Result<StoragePool> {
        self.toggle(pool_id, StoragePoolStatus::Disabled, StoragePoolStatus::Up, "enable")
            .await
    }

    pub async fn disable_pool(&self, pool_id: PoolId) -> Result<StoragePool> {
        self.toggle(pool_id, StoragePoolStatus::Up, StoragePoolStatus::Disabled, "disable")
            .await
    }

    async fn toggle(
        &self,
        pool_id: PoolId,
        from: StoragePoolStatus,
        to: StoragePoolStatus,
        operation: &str,
    ) -> Result<StoragePool> {
        let pool = self.load(pool_id).await?;
        if pool.status != from {
            return Err(Error::state_conflict("pool", pool.id, pool.status, operation));
        }
        self.update_status_if(pool_id, from, to).await?;
        self.tracker.recompute_pool(pool_id).await?;
        info!(pool_id = %pool_id, "Pool {}d", operation);
        self.load(pool_id).await
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Enter maintenance; a datastore cluster takes its children along
    pub async fn prepare_for_maintenance(&self, pool_id: PoolId) -> Result<StoragePool> {
        let pool = self.load(pool_id).await?;
        if !matches!(
            pool.status,
            StoragePoolStatus::Up | StoragePoolStatus::ErrorInMaintenance
        ) {
            return Err(Error::state_conflict(
                "pool",
                pool.id,
                pool.status,
                "prepare for maintenance",
            ));
        }

        info!(pool_id = %pool.id, "Preparing pool {} for maintenance", pool.name);
        self.update_status_if(pool.id, pool.status, StoragePoolStatus::PrepareForMaintenance)
            .await?;

        if pool.is_datastore_cluster() {
            self.maintain_children(&pool).await?;
        }

        if let Err(err) = self.enter_maintenance(&pool).await {
            error!(pool_id = %pool.id, "Maintenance failed: {}", err);
            self.mark_error_in_maintenance(pool.id).await;
            return Err(err);
        }
        self.load(pool_id).await
    }

    /// Children go to maintenance one by one; one failure fails them all
    async fn maintain_children(&self, parent: &StoragePool) -> Result<()> {
        let children = self.repo.list_child_pools(parent.id).await?;
        debug!(pool_id = %parent.id, "Cascading maintenance to {} child pool(s)", children.len());

        let mut result = Ok(());
        for child in &children {
            if child.status != StoragePoolStatus::PrepareForMaintenance {
                result = self
                    .update_status_if(child.id, child.status, StoragePoolStatus::PrepareForMaintenance)
                    .await;
                if result.is_err() {
                    break;
                }
            }
        }
        if result.is_ok() {
            for child in &children {
                result = self.enter_maintenance(child).await;
                if result.is_err() {
                    break;
                }
            }
        }

        if let Err(err) = result {
            error!(
                pool_id = %parent.id,
                "Child pool failed to enter maintenance, flagging the datastore cluster: {}",
                err
            );
            for child in &children {
                self.mark_error_in_maintenance(child.id).await;
            }
            self.mark_error_in_maintenance(parent.id).await;
            return Err(err);
        }
        Ok(())
    }

    /// PrepareForMaintenance -> Maintenance for one pool
    async fn enter_maintenance(&self, pool: &StoragePool) -> Result<()> {
        let driver = self.drivers.require(&pool.provider_name)?;
        driver.maintain(pool).await?;
        self.unmount_everywhere(pool).await?;
        self.update_status_if(
            pool.id,
            StoragePoolStatus::PrepareForMaintenance,
            StoragePoolStatus::Maintenance,
        )
        .await
    }

    /// Ask every connected host to unmount; unreachable hosts lose the link anyway
    async fn unmount_everywhere(&self, pool: &StoragePool) -> Result<()> {
        let links = self.repo.list_pool_host_refs(pool.id).await?;
        let results = futures::future::join_all(
            links
                .iter()
                .map(|link| self.connector.disconnect(pool, link.host_id)),
        )
        .await;

        for (link, result) in links.iter().zip(results) {
            if let Err(err) = result {
                warn!(pool_id = %pool.id, "Host {} did not unmount: {}", link.host_id, err);
                self.repo.delete_pool_host_ref(pool.id, link.host_id).await?;
            }
        }
        Ok(())
    }

    /// Leave maintenance and remount the pool where it belongs
    ///
    /// A datastore cluster brings its children back first and then itself;
    /// one failure flags the parent and every child ErrorInMaintenance.
    pub async fn cancel_maintenance(&self, pool_id: PoolId) -> Result<StoragePool> {
        let pool = self.load(pool_id).await?;
        if !matches!(
            pool.status,
            StoragePoolStatus::Maintenance | StoragePoolStatus::ErrorInMaintenance
        ) {
            return Err(Error::state_conflict("pool", pool.id, pool.status, "cancel maintenance of"));
        }

        info!(pool_id = %pool.id, "Cancelling maintenance of pool {}", pool.name);
        if pool.is_datastore_cluster() {
            self.update_status_if(pool.id, pool.status, StoragePoolStatus::CancelMaintenance)
                .await?;
            let children = self.cancel_children(&pool).await?;

            if let Err(err) = self.exit_maintenance(&pool).await {
                error!(pool_id = %pool.id, "Cancel maintenance failed: {}", err);
                for child in &children {
                    self.mark_error_in_maintenance(child.id).await;
                }
                self.mark_error_in_maintenance(pool.id).await;
                return Err(err);
            }

            // The aggregate itself is never mounted
            for child in &children {
                self.remount(child).await?;
            }
            return self.load(pool_id).await;
        }

        self.update_status_if(pool.id, pool.status, StoragePoolStatus::CancelMaintenance)
            .await?;
        if let Err(err) = self.exit_maintenance(&pool).await {
            error!(pool_id = %pool.id, "Cancel maintenance failed: {}", err);
            self.mark_error_in_maintenance(pool.id).await;
            return Err(err);
        }
        self.remount(&pool).await?;
        self.load(pool_id).await
    }

    /// Children leave maintenance one by one; one failure fails them all
    async fn cancel_children(&self, parent: &StoragePool) -> Result<Vec<StoragePool>> {
        let children = self.repo.list_child_pools(parent.id).await?;
        debug!(pool_id = %parent.id, "Cancelling maintenance of {} child pool(s)", children.len());

        let mut result = Ok(());
        for child in &children {
            if child.status != StoragePoolStatus::CancelMaintenance {
                result = self
                    .update_status_if(child.id, child.status, StoragePoolStatus::CancelMaintenance)
                    .await;
                if result.is_err() {
                    break;
                }
            }
        }
        if result.is_ok() {
            for child in &children {
                result = self.exit_maintenance(child).await;
                if result.is_err() {
                    break;
                }
            }
        }

        if let Err(err) = result {
            error!(
                pool_id = %parent.id,
                "Child pool failed to leave maintenance, flagging the datastore cluster: {}",
                err
            );
            for child in &children {
                self.mark_error_in_maintenance(child.id).await;
            }
            self.mark_error_in_maintenance(parent.id).await;
            return Err(err);
        }
        Ok(children)
    }

    /// CancelMaintenance -> Up for one pool
    async fn exit_maintenance(&self, pool: &StoragePool) -> Result<()> {
        let driver = self.drivers.require(&pool.provider_name)?;
        driver.cancel_maintain(pool).await?;
        self.update_status_if(
            pool.id,
            StoragePoolStatus::CancelMaintenance,
            StoragePoolStatus::Up,
        )
        .await
    }

    /// Reconnect hosts in scope; individual failures are only logged
    async fn remount(&self, pool: &StoragePool) -> Result<()> {
        let hosts = self.hosts_in_scope(pool).await?;
        let results = futures::future::join_all(
            hosts.iter().map(|host| self.connector.connect(pool, host.id)),
        )
        .await;

        let mut connected = 0usize;
        for (host, result) in hosts.iter().zip(results) {
            match result {
                Ok(()) => connected += 1,
                Err(err) => warn!(pool_id = %pool.id, "Host {} did not remount: {}", host.id, err),
            }
        }
        info!(pool_id = %pool.id, "Remounted on {} of {} host(s)", connected, hosts.len());
        Ok(())
    }

    // =========================================================================
    // Deletion
    // =========================================================================

    /// Delete a pool in maintenance
    ///
    /// Unforced deletion refuses while any volume remains. Forced deletion
    /// expunges Destroy volumes first and refuses while any other remains.
    /// Children of a datastore cluster are deleted before the parent.
    pub async fn delete_pool(&self, pool_id: PoolId, forced: bool) -> Result<()> {
        let pool = self.load(pool_id).await?;
        if pool.status != StoragePoolStatus::Maintenance {
            return Err(Error::state_conflict("pool", pool.id, pool.status, "delete"));
        }

        if pool.is_datastore_cluster() {
            let children = self.repo.list_child_pools(pool.id).await?;
            if let Some(busy) = children
                .iter()
                .find(|c| c.status != StoragePoolStatus::Maintenance)
            {
                return Err(Error::state_conflict("pool", busy.id, busy.status, "delete"));
            }
            for child in &children {
                self.delete_one(child, forced).await?;
            }
        }
        self.delete_one(&pool, forced).await
    }

    async fn delete_one(&self, pool: &StoragePool, forced: bool) -> Result<()> {
        let volumes: Vec<Volume> = self
            .repo
            .list_volumes_by_pool(pool.id)
            .await?
            .into_iter()
            .filter(|v| v.state != VolumeState::Expunged)
            .collect();
        let blocking = volumes
            .iter()
            .filter(|v| !forced || v.state != VolumeState::Destroy)
            .count();
        if blocking > 0 {
            return Err(Error::StateConflict {
                kind: "pool".into(),
                id: pool.id.to_string(),
                current: format!("{} with {} volume(s)", pool.status, blocking),
                operation: if forced { "force delete" } else { "delete" }.into(),
            });
        }
        for volume in &volumes {
            self.expunger.expunge(volume, ExpungeMode::RecordOnly).await?;
        }

        self.update_status_if(pool.id, StoragePoolStatus::Maintenance, StoragePoolStatus::Removed)
            .await?;
        let driver = self.drivers.require(&pool.provider_name)?;
        if let Err(err) = driver.delete(pool).await {
            error!(pool_id = %pool.id, "Driver failed to delete pool: {}", err);
            self.update_status_if(pool.id, StoragePoolStatus::Removed, StoragePoolStatus::Maintenance)
                .await?;
            return Err(err);
        }

        self.repo.remove_pool(pool.id).await?;
        self.events.publish(EngineEvent::PoolRemoved { pool_id: pool.id });
        info!(pool_id = %pool.id, "Deleted pool {}", pool.name);
        Ok(())
    }
}

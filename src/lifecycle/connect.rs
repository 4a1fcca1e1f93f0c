//! Host connection
//!
//! Mounts a shared pool on hosts through their agents. Batches run on a
//! bounded worker pool; a conflicting or fatal failure stops new work, rolls
//! back every host already connected and removes the pool record.

use crate::capacity::CapacityTracker;
use crate::domain::*;
use crate::error::{Error, Result};
use crate::events::{EngineEvent, EventBus};
use crate::metrics::EngineMetrics;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Batch behaviour for [`HostConnector::connect_hosts`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Keep going past ordinary per-host failures
    pub partial_ok: bool,
    /// Fail and remove the pool when no host connects
    pub error_on_no_up_host: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            partial_ok: true,
            error_on_no_up_host: true,
        }
    }
}

impl ConnectOptions {
    fn aborts(&self, err: &Error) -> bool {
        err.aborts_batch() || !self.partial_ok
    }
}

/// Connects and disconnects hosts to pools
#[derive(Clone)]
pub struct HostConnector {
    repo: ResourceRepositoryRef,
    gateway: RemoteExecutionGatewayRef,
    tracker: Arc<CapacityTracker>,
    events: EventBus,
    metrics: EngineMetrics,
    max_workers: usize,
}

impl HostConnector {
    pub fn new(
        repo: ResourceRepositoryRef,
        gateway: RemoteExecutionGatewayRef,
        tracker: Arc<CapacityTracker>,
        events: EventBus,
        metrics: EngineMetrics,
        max_workers: usize,
    ) -> Self {
        Self {
            repo,
            gateway,
            tracker,
            events,
            metrics,
            max_workers: max_workers.max(1),
        }
    }

    // =========================================================================
    // Single Host
    // =========================================================================

    /// Mount the pool on one host and record the link
    pub async fn connect(&self, pool: &StoragePool, host_id: HostId) -> Result<()> {
        let result = self.try_connect(pool, host_id).await;
        let label = if result.is_ok() { "connected" } else { "failed" };
        self.metrics.host_connects.with_label_values(&[label]).inc();
        result
    }

    async fn try_connect(&self, pool: &StoragePool, host_id: HostId) -> Result<()> {
        let command = AgentCommand::ModifyStoragePool {
            pool_id: pool.id,
            uuid: pool.uuid.clone(),
            path: pool.path.clone(),
            add: true,
        };

        let answer = match self.gateway.send(host_id, command).await {
            Ok(answer) => answer,
            Err(GatewayError::CommandFailed { reason, .. })
                if reason.to_lowercase().contains("mount options") =>
            {
                return Err(Error::MountFailure {
                    pool_id: pool.id.to_string(),
                    host_id: host_id.to_string(),
                    reason,
                });
            }
            Err(err) => return Err(err.into()),
        };

        let local_path = match answer {
            AgentAnswer::PoolInfo {
                uuid,
                local_path,
                capacity_bytes,
                available_bytes,
            } => {
                if uuid != pool.uuid {
                    if let Some(other) = self.repo.find_pool_by_uuid(&uuid).await? {
                        if other.id != pool.id {
                            return Err(Error::StorageConflict {
                                pool_id: pool.id.to_string(),
                                reason: format!(
                                    "host {} already knows this storage as pool {} ({})",
                                    host_id, other.id, uuid
                                ),
                            });
                        }
                    }
                }
                if capacity_bytes > 0 {
                    self.repo
                        .update_pool_bytes(
                            pool.id,
                            capacity_bytes,
                            capacity_bytes.saturating_sub(available_bytes),
                        )
                        .await?;
                }
                local_path
            }
            AgentAnswer::Ack => pool.path.clone(),
        };

        self.repo
            .upsert_pool_host_ref(PoolHostRef {
                pool_id: pool.id,
                host_id,
                local_path,
            })
            .await?;
        self.tracker.recompute_pool(pool.id).await?;

        self.events.publish(EngineEvent::HostConnected {
            pool_id: pool.id,
            host_id,
        });
        debug!(pool_id = %pool.id, "Host {} connected", host_id);
        Ok(())
    }

    /// Unmount the pool from one host and drop the link
    pub async fn disconnect(&self, pool: &StoragePool, host_id: HostId) -> Result<()> {
        self.gateway
            .send(
                host_id,
                AgentCommand::ModifyStoragePool {
                    pool_id: pool.id,
                    uuid: pool.uuid.clone(),
                    path: pool.path.clone(),
                    add: false,
                },
            )
            .await?;
        self.repo.delete_pool_host_ref(pool.id, host_id).await?;
        self.events.publish(EngineEvent::HostDisconnected {
            pool_id: pool.id,
            host_id,
        });
        Ok(())
    }

    // =========================================================================
    // Batch
    // =========================================================================

    /// Connect many hosts concurrently; returns the hosts that connected
    pub async fn connect_hosts(
        &self,
        pool: &StoragePool,
        host_ids: &[HostId],
        options: ConnectOptions,
    ) -> Result<Vec<HostId>> {
        if host_ids.is_empty() {
            debug!(pool_id = %pool.id, "No hosts to connect");
            return Ok(Vec::new());
        }

        let workers = host_ids.len().min(self.max_workers);
        let semaphore = Arc::new(Semaphore::new(workers));
        let abort = Arc::new(AtomicBool::new(false));
        let mut tasks = JoinSet::new();

        info!(
            pool_id = %pool.id,
            "Connecting {} host(s) with {} worker(s)",
            host_ids.len(),
            workers
        );

        for &host_id in host_ids {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| Error::Internal(format!("connect worker pool closed: {}", e)))?;
            if abort.load(Ordering::SeqCst) {
                debug!(pool_id = %pool.id, "Batch aborted, not submitting host {}", host_id);
                break;
            }

            let connector = self.clone();
            let pool = pool.clone();
            let abort = abort.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let result = connector.connect(&pool, host_id).await;
                if let Err(err) = &result {
                    if options.aborts(err) {
                        abort.store(true, Ordering::SeqCst);
                    }
                }
                (host_id, result)
            });
        }

        let mut connected = Vec::new();
        let mut abort_error: Option<Error> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((host_id, Ok(()))) => connected.push(host_id),
                Ok((host_id, Err(err))) if options.aborts(&err) => {
                    error!(pool_id = %pool.id, "Host {} failed, aborting batch: {}", host_id, err);
                    abort_error.get_or_insert(err);
                }
                Ok((host_id, Err(err))) => {
                    warn!(pool_id = %pool.id, "Unable to connect host {}: {}", host_id, err);
                }
                Err(join_err) => {
                    abort_error
                        .get_or_insert(Error::Internal(format!("connect task failed: {}", join_err)));
                }
            }
        }
        connected.sort();

        if let Some(err) = abort_error {
            self.roll_back(pool, &connected).await;
            return Err(err);
        }

        if connected.is_empty() {
            warn!(pool_id = %pool.id, "No host connected to pool");
            if options.error_on_no_up_host {
                self.remove_pool(pool).await;
                return Err(Error::StorageUnavailable {
                    pool_id: pool.id.to_string(),
                    reason: "no up host could access the pool".into(),
                });
            }
        }

        info!(
            pool_id = %pool.id,
            "Connected {} of {} host(s)",
            connected.len(),
            host_ids.len()
        );
        Ok(connected)
    }

    /// Disconnect every connected host, then drop the pool record
    async fn roll_back(&self, pool: &StoragePool, connected: &[HostId]) {
        warn!(
            pool_id = %pool.id,
            "Rolling back {} connected host(s)",
            connected.len()
        );
        let results =
            futures::future::join_all(connected.iter().map(|h| self.disconnect(pool, *h))).await;
        for (host_id, result) in connected.iter().zip(results) {
            if let Err(err) = result {
                warn!(pool_id = %pool.id, "Unable to disconnect host {}: {}", host_id, err);
            }
        }
        self.remove_pool(pool).await;
    }

    async fn remove_pool(&self, pool: &StoragePool) {
        match self.repo.remove_pool(pool.id).await {
            Ok(()) => self.events.publish(EngineEvent::PoolRemoved { pool_id: pool.id }),
            Err(err) => error!(pool_id = %pool.id, "Unable to remove pool record: {}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capacity::CapacityAdmissionChecker;
    use crate::config::EngineConfig;
    use crate::memory::{fixtures, DriverRegistry, InMemoryStore, SimulatedDriver, SimulatedFailure, SimulatedGateway};
    use assert_matches::assert_matches;

    fn setup(workers: usize) -> (Arc<InMemoryStore>, Arc<SimulatedGateway>, HostConnector) {
        let store = Arc::new(InMemoryStore::new());
        for id in 1..=5 {
            store.put_host(fixtures::host(id, 1));
        }
        store.put_pool(fixtures::pool(1, 1000));

        let gateway = Arc::new(SimulatedGateway::with_store(store.clone()));
        let drivers = Arc::new(DriverRegistry::new().with(SimulatedDriver::default_primary()));
        let admission = Arc::new(CapacityAdmissionChecker::new(
            store.clone(),
            drivers,
            Arc::new(EngineConfig::default()),
        ));
        let tracker = Arc::new(CapacityTracker::new(store.clone(), admission));
        let connector = HostConnector::new(
            store.clone(),
            gateway.clone(),
            tracker,
            EventBus::default(),
            EngineMetrics::new().unwrap(),
            workers,
        );
        (store, gateway, connector)
    }

    fn hosts() -> Vec<HostId> {
        (1..=5).map(HostId).collect()
    }

    #[tokio::test]
    async fn test_connects_all_hosts() {
        let (store, _, connector) = setup(4);
        let pool = store.pool(PoolId(1)).unwrap();

        let connected = connector
            .connect_hosts(&pool, &hosts(), ConnectOptions::default())
            .await
            .unwrap();
        assert_eq!(connected, hosts());
        assert_eq!(store.connected_hosts(PoolId(1)), hosts());
        assert!(store
            .find_capacity_record(CapacityOwner::Pool(PoolId(1)), CapacityType::StorageUsed)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_conflict_rolls_back_batch() {
        let (store, gateway, connector) = setup(1);
        let mut other = fixtures::pool(2, 1000);
        other.uuid = "already-known".into();
        store.put_pool(other);
        gateway.fail_host(HostId(3), SimulatedFailure::ReportsUuid("already-known".into()));
        let pool = store.pool(PoolId(1)).unwrap();

        let result = connector
            .connect_hosts(&pool, &hosts(), ConnectOptions::default())
            .await;
        assert_matches!(result, Err(Error::StorageConflict { .. }));

        // Hosts 1 and 2 mounted then rolled back; 4 and 5 never tried
        assert_eq!(
            gateway.pool_modifications(true),
            vec![HostId(1), HostId(2), HostId(3)]
        );
        assert_eq!(gateway.pool_modifications(false), vec![HostId(1), HostId(2)]);
        assert!(store.pool(PoolId(1)).is_none());
        assert!(store.connected_hosts(PoolId(1)).is_empty());
        assert!(store.pool(PoolId(2)).is_some());
    }

    #[tokio::test]
    async fn test_concurrent_conflict_rolls_back_every_connected_host() {
        let (store, gateway, connector) = setup(4);
        let mut other = fixtures::pool(2, 1000);
        other.uuid = "already-known".into();
        store.put_pool(other);
        gateway.fail_host(HostId(3), SimulatedFailure::ReportsUuid("already-known".into()));
        gateway.fail_host(HostId(5), SimulatedFailure::Unavailable);
        let pool = store.pool(PoolId(1)).unwrap();

        let result = connector
            .connect_hosts(&pool, &hosts(), ConnectOptions::default())
            .await;
        assert_matches!(result, Err(Error::StorageConflict { .. }));

        // Whatever finished mounting before or after the conflict is unmounted
        let mut mounted: Vec<HostId> = gateway
            .pool_modifications(true)
            .into_iter()
            .filter(|h| *h != HostId(3) && *h != HostId(5))
            .collect();
        mounted.sort();
        let mut unmounted = gateway.pool_modifications(false);
        unmounted.sort();
        assert!(gateway.pool_modifications(true).contains(&HostId(3)));
        assert!(!mounted.is_empty());
        assert_eq!(unmounted, mounted);

        assert!(store.connected_hosts(PoolId(1)).is_empty());
        assert!(store.pool(PoolId(1)).is_none());
        assert!(store.pool(PoolId(2)).is_some());
    }

    #[tokio::test]
    async fn test_mount_option_failure_is_fatal() {
        let (store, gateway, connector) = setup(2);
        gateway.fail_host(
            HostId(1),
            SimulatedFailure::Fails("invalid mount options: vers=5".into()),
        );
        let pool = store.pool(PoolId(1)).unwrap();

        let result = connector
            .connect_hosts(&pool, &hosts(), ConnectOptions::default())
            .await;
        assert_matches!(result, Err(Error::MountFailure { .. }));
        assert!(store.pool(PoolId(1)).is_none());
    }

    #[tokio::test]
    async fn test_partial_failures_are_skipped() {
        let (store, gateway, connector) = setup(3);
        gateway.fail_host(HostId(2), SimulatedFailure::Unavailable);
        gateway.fail_host(HostId(4), SimulatedFailure::Timeout);
        let pool = store.pool(PoolId(1)).unwrap();

        let connected = connector
            .connect_hosts(&pool, &hosts(), ConnectOptions::default())
            .await
            .unwrap();
        assert_eq!(connected, vec![HostId(1), HostId(3), HostId(5)]);
        assert!(store.pool(PoolId(1)).is_some());
    }

    #[tokio::test]
    async fn test_strict_batch_aborts_on_any_failure() {
        let (store, gateway, connector) = setup(1);
        gateway.fail_host(HostId(2), SimulatedFailure::Unavailable);
        let pool = store.pool(PoolId(1)).unwrap();

        let options = ConnectOptions {
            partial_ok: false,
            error_on_no_up_host: true,
        };
        let result = connector.connect_hosts(&pool, &hosts(), options).await;
        assert_matches!(result, Err(Error::HostUnavailable { .. }));
        assert_eq!(gateway.pool_modifications(false), vec![HostId(1)]);
        assert!(store.pool(PoolId(1)).is_none());
    }

    #[tokio::test]
    async fn test_no_host_connected() {
        let (store, gateway, connector) = setup(4);
        for id in 1..=2 {
            gateway.fail_host(HostId(id), SimulatedFailure::Unavailable);
        }
        let pool = store.pool(PoolId(1)).unwrap();
        let two = [HostId(1), HostId(2)];

        let lenient = ConnectOptions {
            partial_ok: true,
            error_on_no_up_host: false,
        };
        assert!(connector.connect_hosts(&pool, &two, lenient).await.unwrap().is_empty());
        assert!(store.pool(PoolId(1)).is_some());

        let result = connector
            .connect_hosts(&pool, &two, ConnectOptions::default())
            .await;
        assert_matches!(result, Err(Error::StorageUnavailable { .. }));
        assert!(store.pool(PoolId(1)).is_none());
    }

    #[tokio::test]
    async fn test_empty_host_list() {
        let (store, gateway, connector) = setup(4);
        let pool = store.pool(PoolId(1)).unwrap();
        assert!(connector
            .connect_hosts(&pool, &[], ConnectOptions::default())
            .await
            .unwrap()
            .is_empty());
        assert!(gateway.sent().is_empty());
    }
}

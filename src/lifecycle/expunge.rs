//! Volume expunge
//!
//! Removes a volume's data through a host connected to its pool and marks
//! the record expunged. Shared by forced pool deletion and the collector.

use crate::domain::*;
use crate::error::{Error, Result};
use crate::events::{EngineEvent, EventBus};
use tracing::{debug, warn};

/// How the on-storage data is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpungeMode {
    /// Delete through an Up host connected to the pool
    Agent,
    /// Mark the record only; the backing store is being deleted as a whole
    RecordOnly,
}

#[derive(Clone)]
pub struct VolumeExpunger {
    repo: ResourceRepositoryRef,
    gateway: RemoteExecutionGatewayRef,
    events: EventBus,
}

impl VolumeExpunger {
    pub fn new(
        repo: ResourceRepositoryRef,
        gateway: RemoteExecutionGatewayRef,
        events: EventBus,
    ) -> Self {
        Self {
            repo,
            gateway,
            events,
        }
    }

    /// First Up and Enabled host with the pool mounted
    pub async fn connected_up_host(&self, pool_id: PoolId) -> Result<Option<HostId>> {
        let ids: Vec<HostId> = self
            .repo
            .list_pool_host_refs(pool_id)
            .await?
            .into_iter()
            .map(|r| r.host_id)
            .collect();
        let hosts = self.repo.find_hosts(&ids).await?;
        Ok(hosts.into_iter().find(Host::is_up_and_enabled).map(|h| h.id))
    }

    pub async fn expunge(&self, volume: &Volume, mode: ExpungeMode) -> Result<()> {
        if let (ExpungeMode::Agent, Some(pool_id), Some(path)) =
            (mode, volume.pool_id, volume.path.as_ref())
        {
            let host_id = self.connected_up_host(pool_id).await?.ok_or_else(|| {
                Error::StorageUnavailable {
                    pool_id: pool_id.to_string(),
                    reason: format!("no up host connected to delete volume {}", volume.id),
                }
            })?;
            self.gateway
                .send(
                    host_id,
                    AgentCommand::DeleteVolume {
                        pool_id,
                        path: path.clone(),
                    },
                )
                .await?;
            debug!("Deleted volume {} data on pool {} via host {}", volume.id, pool_id, host_id);
        } else if mode == ExpungeMode::RecordOnly && volume.path.is_some() {
            warn!(
                "Volume {} data left on storage, its pool is being removed",
                volume.id
            );
        }

        self.repo
            .set_volume_state(volume.id, VolumeState::Expunged)
            .await?;
        self.events
            .publish(EngineEvent::VolumeExpunged { volume_id: volume.id });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{fixtures, InMemoryStore, SimulatedGateway};
    use assert_matches::assert_matches;
    use std::sync::Arc;

    fn setup() -> (Arc<InMemoryStore>, Arc<SimulatedGateway>, VolumeExpunger) {
        let store = Arc::new(InMemoryStore::new());
        let gateway = Arc::new(SimulatedGateway::new());
        let expunger = VolumeExpunger::new(store.clone(), gateway.clone(), EventBus::default());
        (store, gateway, expunger)
    }

    fn placed_volume(store: &InMemoryStore) -> Volume {
        store.put_pool(fixtures::pool(1, 100));
        let mut volume = fixtures::volume(1, 10);
        volume.pool_id = Some(PoolId(1));
        volume.path = Some("vol-1.qcow2".into());
        volume.state = VolumeState::Destroy;
        store.put_volume(volume.clone());
        volume
    }

    #[tokio::test]
    async fn test_expunge_through_connected_host() {
        let (store, gateway, expunger) = setup();
        let volume = placed_volume(&store);
        let mut down = fixtures::host(1, 1);
        down.status = HostStatus::Down;
        store.put_host(down);
        store.put_host(fixtures::host(2, 1));
        for host in [1, 2] {
            store
                .upsert_pool_host_ref(PoolHostRef {
                    pool_id: PoolId(1),
                    host_id: HostId(host),
                    local_path: "/mnt".into(),
                })
                .await
                .unwrap();
        }

        expunger.expunge(&volume, ExpungeMode::Agent).await.unwrap();
        assert_eq!(gateway.hosts_sent("DeleteVolume"), vec![HostId(2)]);
        assert_eq!(store.volume(VolumeId(1)).unwrap().state, VolumeState::Expunged);
    }

    #[tokio::test]
    async fn test_agent_mode_needs_a_host() {
        let (store, _, expunger) = setup();
        let volume = placed_volume(&store);

        assert_matches!(
            expunger.expunge(&volume, ExpungeMode::Agent).await,
            Err(Error::StorageUnavailable { .. })
        );
        assert_eq!(store.volume(VolumeId(1)).unwrap().state, VolumeState::Destroy);

        expunger.expunge(&volume, ExpungeMode::RecordOnly).await.unwrap();
        assert_eq!(store.volume(VolumeId(1)).unwrap().state, VolumeState::Expunged);
    }
}

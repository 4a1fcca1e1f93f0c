//! Engine Events
//!
//! Events emitted by the scheduler, lifecycle manager and collector for
//! external consumers (alerting, usage accounting) to react to.

use crate::domain::{HostId, PoolId, StoragePoolStatus, VmId, VolumeId};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Events emitted by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EngineEvent {
    /// A pool moved between lifecycle states
    PoolStatusChanged {
        pool_id: PoolId,
        from: StoragePoolStatus,
        to: StoragePoolStatus,
    },

    /// A pool record was expunged
    PoolRemoved { pool_id: PoolId },

    /// A host mounted a pool
    HostConnected { pool_id: PoolId, host_id: HostId },

    /// A host unmounted a pool
    HostDisconnected { pool_id: PoolId, host_id: HostId },

    /// A placement request found a destination
    PlacementSucceeded { vm_id: VmId, host_id: HostId },

    /// A placement request exhausted every candidate
    PlacementExhausted { vm_id: VmId },

    /// The collector expunged a volume
    VolumeExpunged { volume_id: VolumeId },

    /// A cleanup cycle finished or was skipped
    CleanupCycleFinished { skipped: bool, deleted: u64 },
}

impl EngineEvent {
    /// Pool this event concerns, if any
    pub fn pool_id(&self) -> Option<PoolId> {
        match self {
            EngineEvent::PoolStatusChanged { pool_id, .. }
            | EngineEvent::PoolRemoved { pool_id }
            | EngineEvent::HostConnected { pool_id, .. }
            | EngineEvent::HostDisconnected { pool_id, .. } => Some(*pool_id),
            _ => None,
        }
    }

    pub fn is_pool_event(&self) -> bool {
        self.pool_id().is_some()
    }
}

/// Broadcast fan-out of engine events
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Publish; dropped silently when nobody listens
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

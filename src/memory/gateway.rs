//! Simulated host agents
//!
//! Answers every command successfully unless a failure has been scripted for
//! the target host. Sent commands are recorded in order.

use super::store::InMemoryStore;
use crate::domain::*;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;

/// Scripted agent behaviour for one host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimulatedFailure {
    Unavailable,
    Timeout,
    /// Command fails with this message
    Fails(String),
    /// Mount succeeds but reports this pool uuid
    ReportsUuid(String),
}

#[derive(Default)]
pub struct SimulatedGateway {
    failures: DashMap<HostId, SimulatedFailure>,
    sent: Mutex<Vec<(HostId, AgentCommand)>>,
    store: Option<Arc<InMemoryStore>>,
}

impl SimulatedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report pool sizes from the store when mounting
    pub fn with_store(store: Arc<InMemoryStore>) -> Self {
        Self {
            store: Some(store),
            ..Default::default()
        }
    }

    pub fn fail_host(&self, host_id: HostId, failure: SimulatedFailure) {
        self.failures.insert(host_id, failure);
    }

    pub fn heal_host(&self, host_id: HostId) {
        self.failures.remove(&host_id);
    }

    pub fn sent(&self) -> Vec<(HostId, AgentCommand)> {
        self.sent.lock().clone()
    }

    /// Hosts that received a command with the given name
    pub fn hosts_sent(&self, command: &str) -> Vec<HostId> {
        self.sent
            .lock()
            .iter()
            .filter(|(_, c)| c.name() == command)
            .map(|(h, _)| *h)
            .collect()
    }

    /// Hosts that received a mount (`add`) or unmount request
    pub fn pool_modifications(&self, add: bool) -> Vec<HostId> {
        self.sent
            .lock()
            .iter()
            .filter(|(_, c)| matches!(c, AgentCommand::ModifyStoragePool { add: a, .. } if *a == add))
            .map(|(h, _)| *h)
            .collect()
    }
}

#[async_trait]
impl RemoteExecutionGateway for SimulatedGateway {
    async fn send(
        &self,
        host_id: HostId,
        command: AgentCommand,
    ) -> std::result::Result<AgentAnswer, GatewayError> {
        self.sent.lock().push((host_id, command.clone()));

        let failure = self.failures.get(&host_id).map(|f| f.value().clone());
        let reported_uuid = match failure {
            Some(SimulatedFailure::Unavailable) => {
                return Err(GatewayError::HostUnavailable(host_id))
            }
            Some(SimulatedFailure::Timeout) => {
                return Err(GatewayError::Timeout {
                    host_id,
                    command: command.name().to_string(),
                })
            }
            Some(SimulatedFailure::Fails(reason)) => {
                return Err(GatewayError::CommandFailed {
                    host_id,
                    command: command.name().to_string(),
                    reason,
                })
            }
            Some(SimulatedFailure::ReportsUuid(uuid)) => Some(uuid),
            None => None,
        };

        match command {
            AgentCommand::ModifyStoragePool {
                pool_id,
                uuid,
                add: true,
                ..
            } => {
                let (capacity_bytes, used_bytes) = self
                    .store
                    .as_ref()
                    .and_then(|s| s.pool(pool_id))
                    .map(|p| (p.capacity_bytes, p.used_bytes))
                    .unwrap_or((0, 0));
                let uuid = reported_uuid.unwrap_or(uuid);
                Ok(AgentAnswer::PoolInfo {
                    local_path: format!("/mnt/{}", uuid),
                    uuid,
                    capacity_bytes,
                    available_bytes: capacity_bytes.saturating_sub(used_bytes),
                })
            }
            _ => Ok(AgentAnswer::Ack),
        }
    }
}

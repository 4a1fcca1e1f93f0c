//! In-process named locks
//!
//! Single-node implementation of [`ClusterLock`]. A multi-node deployment
//! plugs in a lock backed by the shared database instead.

use crate::domain::{ClusterLock, LockGuard};
use crate::error::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Default)]
pub struct InProcessLock {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl InProcessLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ClusterLock for InProcessLock {
    async fn try_acquire(&self, name: &str, wait: Duration) -> Result<Option<LockGuard>> {
        let lock = self
            .locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        match tokio::time::timeout(wait, lock.lock_owned()).await {
            Ok(guard) => Ok(Some(LockGuard::new(guard))),
            Err(_) => {
                debug!("Lock {} not acquired within {:?}", name, wait);
                Ok(None)
            }
        }
    }
}

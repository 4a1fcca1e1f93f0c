//! Storage driver registry and a scriptable driver

use crate::domain::*;
use crate::error::{Error, Result};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

// =============================================================================
// Driver Registry
// =============================================================================

/// Exact-name lookup of registered drivers
#[derive(Default, Clone)]
pub struct DriverRegistry {
    drivers: HashMap<String, StorageDriverRef>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, driver: StorageDriverRef) {
        self.drivers.insert(driver.name().to_string(), driver);
    }

    pub fn with(mut self, driver: StorageDriverRef) -> Self {
        self.register(driver);
        self
    }
}

impl StorageDriverProvider for DriverRegistry {
    fn driver(&self, provider_name: &str) -> Option<StorageDriverRef> {
        self.drivers.get(provider_name).cloned()
    }
}

// =============================================================================
// Simulated Driver
// =============================================================================

/// Driver whose lifecycle calls succeed unless a pool is scripted to fail
pub struct SimulatedDriver {
    name: String,
    capabilities: DriverCapabilities,
    failing: DashSet<(PoolId, &'static str)>,
    calls: Mutex<Vec<(&'static str, PoolId)>>,
    template_overhead: DashMap<TemplateId, u64>,
}

impl SimulatedDriver {
    pub fn new(name: &str, capabilities: DriverCapabilities) -> Self {
        Self {
            name: name.to_string(),
            capabilities,
            failing: DashSet::new(),
            calls: Mutex::new(Vec::new()),
            template_overhead: DashMap::new(),
        }
    }

    /// Default primary storage: reports stats, no overprovisioning override
    pub fn default_primary() -> Arc<Self> {
        Arc::new(Self::new(
            "DefaultPrimary",
            DriverCapabilities {
                supports_stats: true,
                supports_overprovisioning: false,
                managed: false,
            },
        ))
    }

    /// Make `operation` ("maintain", "cancel_maintain", "delete", ...) fail for a pool
    pub fn fail_on(&self, pool_id: PoolId, operation: &'static str) {
        self.failing.insert((pool_id, operation));
    }

    pub fn set_template_bytes(&self, template_id: TemplateId, bytes: u64) {
        self.template_overhead.insert(template_id, bytes);
    }

    pub fn calls(&self) -> Vec<(&'static str, PoolId)> {
        self.calls.lock().clone()
    }

    fn record(&self, operation: &'static str, pool: &StoragePool) -> Result<()> {
        self.calls.lock().push((operation, pool.id));
        if self.failing.contains(&(pool.id, operation)) {
            return Err(Error::StorageUnavailable {
                pool_id: pool.id.to_string(),
                reason: format!("{} failed", operation),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl StorageDriver for SimulatedDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> DriverCapabilities {
        self.capabilities
    }

    async fn initialize(&self, pool: &StoragePool) -> Result<()> {
        self.record("initialize", pool)
    }

    async fn attach(&self, pool: &StoragePool, _scope: PoolScope) -> Result<()> {
        self.record("attach", pool)
    }

    async fn maintain(&self, pool: &StoragePool) -> Result<()> {
        self.record("maintain", pool)
    }

    async fn cancel_maintain(&self, pool: &StoragePool) -> Result<()> {
        self.record("cancel_maintain", pool)
    }

    async fn delete(&self, pool: &StoragePool) -> Result<()> {
        self.record("delete", pool)
    }

    fn bytes_required_for_template(&self, template: &Template, _pool: &StoragePool) -> u64 {
        self.template_overhead
            .get(&template.id)
            .map(|b| *b.value())
            .unwrap_or(template.size_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::fixtures;

    #[tokio::test]
    async fn test_registry_exact_name_lookup() {
        let registry = DriverRegistry::new().with(SimulatedDriver::default_primary());
        assert!(registry.driver("DefaultPrimary").is_some());
        assert!(registry.driver("defaultprimary").is_none());
        assert!(registry.require("PowerFlex").is_err());
    }

    #[tokio::test]
    async fn test_scripted_failure() {
        let driver = SimulatedDriver::default_primary();
        let pool = fixtures::pool(3, 100);
        driver.fail_on(PoolId(3), "maintain");

        assert!(driver.maintain(&pool).await.is_err());
        assert!(driver.cancel_maintain(&pool).await.is_ok());
        assert_eq!(
            driver.calls(),
            vec![("maintain", PoolId(3)), ("cancel_maintain", PoolId(3))]
        );
    }
}

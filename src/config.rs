//! Engine Configuration
//!
//! Global settings with per-pool overrides for the capacity thresholds.
//! Loaded from YAML; every field has a default so a partial file is valid.

use crate::domain::PoolId;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Planner used when an offering names none
pub const DEFAULT_PLANNER: &str = "FirstFitPlanner";

// =============================================================================
// Storage Thresholds
// =============================================================================

/// Capacity policy of a storage pool
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageThresholds {
    /// Multiplier applied to raw capacity for overprovisionable pool types
    pub overprovisioning_factor: f64,
    /// Physical used/capacity ratio at which the pool stops admitting
    pub capacity_disable_threshold: f64,
    /// Allocated/effective ratio above which the pool rejects
    pub allocated_capacity_disable_threshold: f64,
    /// Let resizes fall back to the resize threshold
    pub allow_resize_beyond_allocated_threshold: bool,
    /// Allocated ratio limit for resize requests
    pub allocated_resize_disable_threshold: f64,
}

impl Default for StorageThresholds {
    fn default() -> Self {
        Self {
            overprovisioning_factor: 2.0,
            capacity_disable_threshold: 0.85,
            allocated_capacity_disable_threshold: 0.85,
            allow_resize_beyond_allocated_threshold: false,
            allocated_resize_disable_threshold: 0.90,
        }
    }
}

/// Per-pool values; unset fields inherit the global thresholds
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolOverrides {
    pub overprovisioning_factor: Option<f64>,
    pub capacity_disable_threshold: Option<f64>,
    pub allocated_capacity_disable_threshold: Option<f64>,
    pub allow_resize_beyond_allocated_threshold: Option<bool>,
    pub allocated_resize_disable_threshold: Option<f64>,
}

impl StorageThresholds {
    fn merged(mut self, o: &PoolOverrides) -> Self {
        if let Some(v) = o.overprovisioning_factor {
            self.overprovisioning_factor = v;
        }
        if let Some(v) = o.capacity_disable_threshold {
            self.capacity_disable_threshold = v;
        }
        if let Some(v) = o.allocated_capacity_disable_threshold {
            self.allocated_capacity_disable_threshold = v;
        }
        if let Some(v) = o.allow_resize_beyond_allocated_threshold {
            self.allow_resize_beyond_allocated_threshold = v;
        }
        if let Some(v) = o.allocated_resize_disable_threshold {
            self.allocated_resize_disable_threshold = v;
        }
        self
    }

    fn validate(&self, scope: &str) -> Result<()> {
        if !(self.overprovisioning_factor.is_finite() && self.overprovisioning_factor > 0.0) {
            return Err(Error::Configuration(format!(
                "{}: overprovisioning factor must be positive, got {}",
                scope, self.overprovisioning_factor
            )));
        }
        for (name, value) in [
            ("capacity_disable_threshold", self.capacity_disable_threshold),
            (
                "allocated_capacity_disable_threshold",
                self.allocated_capacity_disable_threshold,
            ),
            (
                "allocated_resize_disable_threshold",
                self.allocated_resize_disable_threshold,
            ),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::Configuration(format!(
                    "{}: {} must be within [0, 1], got {}",
                    scope, name, value
                )));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Background Jobs
// =============================================================================

/// Storage garbage collector settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    pub enabled: bool,
    pub template_cleanup_enabled: bool,
    pub interval_secs: u64,
    /// Minimum age of a Destroy-state volume before it is expunged
    pub cleanup_delay_secs: u64,
    pub lock_timeout_ms: u64,
    pub max_initial_delay_secs: u64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            template_cleanup_enabled: true,
            interval_secs: 86_400,
            cleanup_delay_secs: 86_400,
            lock_timeout_ms: 3_000,
            max_initial_delay_secs: 60,
        }
    }
}

/// Upper bound for every job period, delay and age setting (100 years)
pub const MAX_JOB_SECS: u64 = 100 * 365 * 86_400;

fn check_job_secs(name: &str, value: u64) -> Result<()> {
    if value > MAX_JOB_SECS {
        return Err(Error::Configuration(format!(
            "{} must be at most {} seconds, got {}",
            name, MAX_JOB_SECS, value
        )));
    }
    Ok(())
}

impl GcConfig {
    fn validate(&self) -> Result<()> {
        check_job_secs("gc.interval_secs", self.interval_secs)?;
        check_job_secs("gc.cleanup_delay_secs", self.cleanup_delay_secs)?;
        check_job_secs("gc.max_initial_delay_secs", self.max_initial_delay_secs)?;
        check_job_secs("gc.lock_timeout_ms", self.lock_timeout_ms / 1000)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadUrlConfig {
    pub cleanup_interval_secs: u64,
    pub expiration_secs: u64,
}

impl DownloadUrlConfig {
    fn validate(&self) -> Result<()> {
        check_job_secs("download_urls.cleanup_interval_secs", self.cleanup_interval_secs)?;
        check_job_secs("download_urls.expiration_secs", self.expiration_secs)
    }
}

impl Default for DownloadUrlConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_secs: 7_200,
            expiration_secs: 14_400,
        }
    }
}

// =============================================================================
// Engine Configuration
// =============================================================================

/// Configuration for the placement engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Global capacity thresholds
    pub storage: StorageThresholds,
    /// Per-pool threshold overrides
    pub pool_overrides: HashMap<PoolId, PoolOverrides>,
    /// Upper bound of the host connection worker pool
    pub host_connect_workers: usize,
    /// When false, restarted VMs stay in clusters their volumes pin them to
    pub migrate_vm_across_clusters: bool,
    pub allow_system_vm_on_disabled_resources: bool,
    pub allow_admin_vm_on_disabled_resources: bool,
    /// Guest limit for hosts without their own
    pub default_host_max_guests: u32,
    /// Planner used when the offering names none
    pub planner_name: String,
    /// Pool allocators, tried in order
    pub pool_allocators: Vec<String>,
    pub gc: GcConfig,
    pub download_urls: DownloadUrlConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            storage: StorageThresholds::default(),
            pool_overrides: HashMap::new(),
            host_connect_workers: 4,
            migrate_vm_across_clusters: false,
            allow_system_vm_on_disabled_resources: false,
            allow_admin_vm_on_disabled_resources: false,
            default_host_max_guests: 50,
            planner_name: DEFAULT_PLANNER.to_string(),
            pool_allocators: vec![
                "LocalStoragePoolAllocator".to_string(),
                "ClusterScopeStoragePoolAllocator".to_string(),
                "ZoneWideStoragePoolAllocator".to_string(),
            ],
            gc: GcConfig::default(),
            download_urls: DownloadUrlConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Parse and validate a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: EngineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        self.storage.validate("storage")?;
        for (pool_id, overrides) in &self.pool_overrides {
            self.storage
                .merged(overrides)
                .validate(&format!("pool {}", pool_id))?;
        }
        if self.host_connect_workers == 0 {
            return Err(Error::Configuration(
                "host_connect_workers must be at least 1".into(),
            ));
        }
        if self.pool_allocators.is_empty() {
            return Err(Error::Configuration(
                "at least one pool allocator is required".into(),
            ));
        }
        self.gc.validate()?;
        self.download_urls.validate()
    }

    /// Effective thresholds for one pool
    pub fn thresholds_for(&self, pool_id: PoolId) -> StorageThresholds {
        match self.pool_overrides.get(&pool_id) {
            Some(overrides) => self.storage.merged(overrides),
            None => self.storage,
        }
    }
}

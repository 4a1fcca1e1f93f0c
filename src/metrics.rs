//! Engine Metrics
//!
//! Prometheus counters for placement, lifecycle and collection outcomes,
//! registered on a private registry so several engines can coexist in one
//! process (tests).

use crate::error::{Error, Result};
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};

/// Metric handles shared by the engine components
#[derive(Clone)]
pub struct EngineMetrics {
    registry: Registry,
    /// Placement outcomes by result (placed, exhausted, error)
    pub placements: IntCounterVec,
    /// Placement latency by result
    pub placement_seconds: HistogramVec,
    /// Pool status transitions by target status
    pub pool_transitions: IntCounterVec,
    /// Host connection attempts by result
    pub host_connects: IntCounterVec,
    /// Items removed by the collector, by kind
    pub gc_items: IntCounterVec,
    /// Collector cycles by outcome (completed, skipped)
    pub gc_cycles: IntCounterVec,
}

impl EngineMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("placement_engine".into()), None)
            .map_err(metrics_error)?;

        let placements = IntCounterVec::new(
            Opts::new("placements_total", "Placement requests by outcome"),
            &["outcome"],
        )
        .map_err(metrics_error)?;
        let placement_seconds = HistogramVec::new(
            HistogramOpts::new("placement_duration_seconds", "Duration of placement requests"),
            &["outcome"],
        )
        .map_err(metrics_error)?;
        let pool_transitions = IntCounterVec::new(
            Opts::new("pool_transitions_total", "Storage pool status transitions"),
            &["to"],
        )
        .map_err(metrics_error)?;
        let host_connects = IntCounterVec::new(
            Opts::new("host_connects_total", "Host to pool connection attempts"),
            &["result"],
        )
        .map_err(metrics_error)?;
        let gc_items = IntCounterVec::new(
            Opts::new("gc_items_total", "Artifacts reclaimed by the storage collector"),
            &["kind"],
        )
        .map_err(metrics_error)?;
        let gc_cycles = IntCounterVec::new(
            Opts::new("gc_cycles_total", "Storage collector cycles"),
            &["outcome"],
        )
        .map_err(metrics_error)?;

        for collector in [
            Box::new(placements.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(placement_seconds.clone()),
            Box::new(pool_transitions.clone()),
            Box::new(host_connects.clone()),
            Box::new(gc_items.clone()),
            Box::new(gc_cycles.clone()),
        ] {
            registry.register(collector).map_err(metrics_error)?;
        }

        Ok(Self {
            registry,
            placements,
            placement_seconds,
            pool_transitions,
            host_connects,
            gc_items,
            gc_cycles,
        })
    }

    /// Text exposition of every registered metric
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        Ok(buffer)
    }
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics: {}", e))
}

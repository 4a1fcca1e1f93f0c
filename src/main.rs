//! Placement Engine
//!
//! Standalone process running the engine against the in-memory adapters:
//! the inventory file seeds the store, shared pools are remounted on
//! startup, and the cleanup jobs run until the process is interrupted.
//! Health and Prometheus endpoints are served over HTTP.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use placement_engine::domain::{PoolScope, StoragePoolStatus};
use placement_engine::gc::{CollectorDeps, InProcessLock};
use placement_engine::lifecycle::LifecycleDeps;
use placement_engine::memory::{DriverRegistry, InMemoryStore, Inventory, SimulatedDriver, SimulatedGateway};
use placement_engine::{
    CapacityAdmissionChecker, CapacityTracker, CleanupScheduler, ConnectOptions,
    EngineConfig, EngineMetrics, Error, EventBus, Result,
    StorageAccessGroupMatcher, StorageGarbageCollector, StoragePoolLifecycleManager,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Placement Engine - capacity admission and storage placement
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Engine configuration file (YAML)
    #[arg(long, env = "ENGINE_CONFIG")]
    config: Option<PathBuf>,

    /// Inventory file seeding the in-memory store (YAML)
    #[arg(long, env = "ENGINE_INVENTORY")]
    inventory: Option<PathBuf>,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting Placement Engine");
    info!("  Version: {}", placement_engine::VERSION);

    let config = match &args.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    config.validate()?;
    let config = Arc::new(config);
    info!("  Planner: {}", config.planner_name);
    info!("  Pool allocators: {:?}", config.pool_allocators);

    let inventory = match &args.inventory {
        Some(path) => Inventory::from_file(path)?,
        None => Inventory::default(),
    };
    info!(
        "Inventory loaded: {} host(s), {} pool(s), {} volume(s)",
        inventory.hosts.len(),
        inventory.pools.len(),
        inventory.volumes.len()
    );

    // Adapters
    let store = Arc::new(InMemoryStore::from_inventory(inventory));
    let gateway = Arc::new(SimulatedGateway::with_store(store.clone()));
    let drivers = Arc::new(DriverRegistry::new().with(SimulatedDriver::default_primary()));
    let events = EventBus::default();
    let metrics = EngineMetrics::new()?;

    // Components
    let admission = Arc::new(CapacityAdmissionChecker::new(
        store.clone(),
        drivers.clone(),
        config.clone(),
    ));
    let tracker = Arc::new(CapacityTracker::new(store.clone(), admission));
    let matcher = Arc::new(StorageAccessGroupMatcher::new(store.clone()));

    let lifecycle = StoragePoolLifecycleManager::new(
        LifecycleDeps {
            repo: store.clone(),
            drivers,
            gateway: gateway.clone(),
            matcher,
            tracker: tracker.clone(),
            events: events.clone(),
            metrics: metrics.clone(),
        },
        &config,
    );
    remount_shared_pools(&store, &lifecycle).await;

    let collector = Arc::new(StorageGarbageCollector::new(
        CollectorDeps {
            repo: store.clone(),
            catalog: store.clone(),
            gateway,
            tracker,
            lock: Arc::new(InProcessLock::new()),
            events,
            metrics: metrics.clone(),
        },
        config.gc.clone(),
        config.download_urls.clone(),
    ));

    let cancel = CancellationToken::new();
    let jobs = CleanupScheduler::new(collector, cancel.clone()).start();

    let ready = Arc::new(AtomicBool::new(false));

    // Start health server
    let health_addr = args.health_addr.clone();
    let health_ready = ready.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_ready).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, metrics).await {
            error!("Metrics server error: {}", e);
        }
    });

    ready.store(true, Ordering::SeqCst);
    info!("Placement Engine running");

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| Error::Internal(format!("Unable to listen for shutdown signal: {}", e)))?;

    info!("Shutdown requested");
    ready.store(false, Ordering::SeqCst);
    cancel.cancel();
    futures::future::join_all(jobs).await;

    info!("Placement Engine shutdown complete");
    Ok(())
}

/// Mount every Up shared pool on the hosts in its scope
async fn remount_shared_pools(store: &InMemoryStore, lifecycle: &StoragePoolLifecycleManager) {
    use placement_engine::domain::ResourceRepository;

    let pools = match store.list_all_pools().await {
        Ok(pools) => pools,
        Err(e) => {
            error!("Unable to list pools: {}", e);
            return;
        }
    };

    let lenient = ConnectOptions {
        partial_ok: true,
        error_on_no_up_host: false,
    };
    for pool in pools {
        if pool.scope == PoolScope::Host || pool.status != StoragePoolStatus::Up {
            continue;
        }
        let hosts = match lifecycle.hosts_in_scope(&pool).await {
            Ok(hosts) => hosts.iter().map(|h| h.id).collect::<Vec<_>>(),
            Err(e) => {
                warn!(pool_id = %pool.id, "Unable to resolve hosts in scope: {}", e);
                continue;
            }
        };
        match lifecycle
            .connect_hosts_to_pool(pool.id, &hosts, pool.scope, lenient)
            .await
        {
            Ok(connected) => info!(pool_id = %pool.id, "Pool mounted on {} host(s)", connected.len()),
            Err(e) => warn!(pool_id = %pool.id, "Unable to mount pool: {}", e),
        }
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    if let Ok(directive) = "hyper=warn".parse() {
        filter = filter.add_directive(directive);
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Health Server
// =============================================================================

fn text_response(status: hyper::StatusCode, body: impl Into<hyper::Body>) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(body.into());
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: &str, ready: Arc<AtomicBool>) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let ready = ready.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let ready = ready.load(Ordering::SeqCst);
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => text_response(StatusCode::OK, "ok"),
                        "/readyz" if ready => text_response(StatusCode::OK, "ok"),
                        "/readyz" => text_response(StatusCode::SERVICE_UNAVAILABLE, "starting"),
                        _ => text_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid health server address: {}", e))
    })?;

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str, metrics: EngineMetrics) -> Result<()> {
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let metrics = metrics.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let metrics = metrics.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => match metrics.encode() {
                            Ok(buffer) => {
                                let mut response = text_response(StatusCode::OK, buffer);
                                response.headers_mut().insert(
                                    CONTENT_TYPE,
                                    HeaderValue::from_static("text/plain; version=0.0.4"),
                                );
                                response
                            }
                            Err(e) => text_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
                        },
                        _ => text_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid metrics server address: {}", e))
    })?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}

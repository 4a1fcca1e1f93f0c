//! Background cleanup jobs
//!
//! Runs the storage cleanup cycle and the download-URL sweep on fixed
//! intervals. The storage job starts after a random delay so that several
//! management nodes do not contend for the cleanup lock at the same moment.

use super::collector::StorageGarbageCollector;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub struct CleanupScheduler {
    collector: Arc<StorageGarbageCollector>,
    cancel: CancellationToken,
}

impl CleanupScheduler {
    pub fn new(collector: Arc<StorageGarbageCollector>, cancel: CancellationToken) -> Self {
        Self { collector, cancel }
    }

    /// Spawn the enabled jobs
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(2);

        let gc = self.collector.config().clone();
        if gc.enabled {
            let initial = initial_delay(gc.max_initial_delay_secs);
            info!(
                "Storage cleanup every {:?}, first run in {:?}",
                gc.interval(),
                initial
            );
            let collector = self.collector.clone();
            handles.push(spawn_periodic(
                "storage cleanup",
                initial,
                gc.interval(),
                self.cancel.clone(),
                move || {
                    let collector = collector.clone();
                    async move {
                        if let Err(err) = collector.run_cleanup_cycle(true).await {
                            error!("Storage cleanup cycle failed: {}", err);
                        }
                    }
                },
            ));
        } else {
            info!("Storage cleanup disabled");
        }

        let every = Duration::from_secs(self.collector.download_url_config().cleanup_interval_secs);
        let collector = self.collector.clone();
        handles.push(spawn_periodic(
            "download url cleanup",
            every,
            every,
            self.cancel.clone(),
            move || {
                let collector = collector.clone();
                async move {
                    if let Err(err) = collector.cleanup_download_urls().await {
                        error!("Download URL cleanup failed: {}", err);
                    }
                }
            },
        ));

        handles
    }
}

fn initial_delay(max_secs: u64) -> Duration {
    if max_secs == 0 {
        return Duration::ZERO;
    }
    Duration::from_secs(rand::thread_rng().gen_range(0..=max_secs))
}

fn spawn_periodic<F, Fut>(
    name: &'static str,
    first: Duration,
    every: Duration,
    cancel: CancellationToken,
    mut job: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let now = Instant::now();
        let start = now.checked_add(first).unwrap_or(now);
        let mut ticker = interval_at(start, every.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Stopping {} job", name);
                    break;
                }
                _ = ticker.tick() => job().await,
            }
        }
    })
}

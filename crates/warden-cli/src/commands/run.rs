//! Run command - execute jobs until interrupted
//!
//! Usage:
//! ```bash
//! warden run --workers 4 --lease-secs 600
//! ```

use anyhow::Result;
use chrono::Utc;
use clap::Args;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use warden_persist::SqliteJobStore;
use warden_queue::gc::heartbeat_job;
use warden_queue::{GarbageCollector, JobStore, MaintenanceProcessor, WorkerConfig, WorkerPool};

/// Arguments for the run command. Unset options fall back to the
/// `WARDEN_*` environment variables, then to the defaults.
#[derive(Args)]
pub struct RunArgs {
    /// Number of concurrent workers
    #[arg(long)]
    workers: Option<usize>,

    /// Idle poll interval in milliseconds
    #[arg(long)]
    poll_ms: Option<u64>,

    /// Lease duration in seconds
    #[arg(long)]
    lease_secs: Option<u64>,

    /// Instance name used as the worker identity prefix
    #[arg(long)]
    instance: Option<String>,

    /// Only claim jobs of types this process can run
    #[arg(long)]
    only_registered: bool,

    /// Days finished jobs are kept
    #[arg(long, default_value_t = 30)]
    retention_days: u64,
}

impl RunArgs {
    fn worker_config(&self) -> WorkerConfig {
        let mut config = WorkerConfig::from_env();
        if let Some(workers) = self.workers {
            config.worker_count = workers;
        }
        if let Some(ms) = self.poll_ms {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = self.lease_secs {
            config.lease_duration = Duration::from_secs(secs);
        }
        if let Some(instance) = &self.instance {
            config.instance_name = instance.clone();
        }
        config.only_registered_types = self.only_registered;
        config
    }
}

/// Run the run command
pub async fn run(store: Arc<SqliteJobStore>, args: RunArgs) -> Result<()> {
    let config = args.worker_config();
    let every = config.sweep_interval;
    let collector = GarbageCollector::new(Duration::from_secs(
        args.retention_days.saturating_mul(24 * 60 * 60),
    ));

    let store: Arc<dyn JobStore> = store;
    let pool = WorkerPool::builder(store.clone())
        .config(config)
        .processor(Arc::new(MaintenanceProcessor::new(store.clone(), collector)))
        .build()?;

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            shutdown.cancel();
        });
    }
    let heartbeat = tokio::spawn(heartbeat(
        store,
        pool.waker(),
        every,
        shutdown.clone(),
    ));

    crate::print_info(&format!(
        "Running {} workers as {} (Ctrl+C to stop)",
        pool.config().worker_count,
        pool.config().instance_name
    ));

    let result = pool.start(shutdown.clone()).await;
    shutdown.cancel();
    if let Err(e) = heartbeat.await {
        warn!(error = %e, "Heartbeat task failed");
    }
    result?;

    crate::print_success("Workers stopped");
    Ok(())
}

/// Enqueue one maintenance heartbeat per `every`. Instances sharing the
/// database collide on the bucket reference, so only one heartbeat runs.
async fn heartbeat(
    store: Arc<dyn JobStore>,
    waker: Arc<Notify>,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let now = Utc::now();
        match store.enqueue(heartbeat_job(now, every), now).await {
            Ok(row) => {
                debug!(reference = %row.reference, "Heartbeat enqueued");
                waker.notify_one();
            }
            Err(e) if e.is_duplicate() => {}
            Err(e) => warn!(error = %e, "Failed to enqueue heartbeat"),
        }
    }
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}

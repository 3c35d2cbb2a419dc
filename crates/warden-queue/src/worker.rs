//! Worker pool: claim, execute and retire jobs

use chrono::Utc;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::backend::JobStore;
use crate::error::QueueError;
use crate::handle::JobHandle;
use crate::observer::Observer;
use crate::processor::{JobContext, Processor, ProcessorRegistry};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Number of concurrent workers
    pub worker_count: usize,
    /// Wait between polls when no job is available
    pub poll_interval: Duration,
    /// How long a claimed row stays locked before it may be re-claimed
    pub lease_duration: Duration,
    /// Prefix of every worker identity written to `locked_by`
    pub instance_name: String,
    /// How often expired locks are cleared
    pub sweep_interval: Duration,
    /// Only claim rows whose type has a registered processor. When unset,
    /// rows of unknown types are claimed and failed permanently.
    pub only_registered_types: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_count: 3,
            poll_interval: Duration::from_secs(1),
            lease_duration: Duration::from_secs(5 * 60),
            instance_name: default_instance_name(),
            sweep_interval: Duration::from_secs(60),
            only_registered_types: false,
        }
    }
}

impl WorkerConfig {
    /// Load configuration from environment variables, falling back to the
    /// defaults for anything unset or unparsable.
    ///
    /// Reads `WARDEN_WORKERS`, `WARDEN_POLL_INTERVAL_MS`, `WARDEN_LEASE_SECS`,
    /// `WARDEN_INSTANCE` and `WARDEN_SWEEP_INTERVAL_SECS`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let parse = |key: &str| std::env::var(key).ok().and_then(|v| v.parse::<u64>().ok());

        Self {
            worker_count: parse("WARDEN_WORKERS")
                .map(|n| n as usize)
                .unwrap_or(defaults.worker_count),
            poll_interval: parse("WARDEN_POLL_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            lease_duration: parse("WARDEN_LEASE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.lease_duration),
            instance_name: std::env::var("WARDEN_INSTANCE").unwrap_or(defaults.instance_name),
            sweep_interval: parse("WARDEN_SWEEP_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.sweep_interval),
            only_registered_types: defaults.only_registered_types,
        }
    }

    pub fn with_workers(mut self, count: usize, poll_interval: Duration) -> Self {
        self.worker_count = count;
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease_duration = lease;
        self
    }

    pub fn with_instance_name(mut self, name: impl Into<String>) -> Self {
        self.instance_name = name.into();
        self
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        if self.worker_count == 0 {
            return Err(QueueError::InvalidConfig("worker pool size cannot be zero".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(QueueError::InvalidConfig("poll interval cannot be zero".into()));
        }
        if self.lease_duration.is_zero() {
            return Err(QueueError::InvalidConfig("lock timeout cannot be zero".into()));
        }
        if self.sweep_interval.is_zero() {
            return Err(QueueError::InvalidConfig("sweep interval cannot be zero".into()));
        }
        if self.instance_name.is_empty() {
            return Err(QueueError::InvalidConfig("instance name cannot be empty".into()));
        }
        Ok(())
    }
}

/// `<hostname>-<8 hex>`. The random suffix keeps `locked_by` distinct for
/// processes sharing a hostname.
fn default_instance_name() -> String {
    let host = gethostname::gethostname()
        .into_string()
        .ok()
        .filter(|name| !name.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok().filter(|name| !name.is_empty()))
        .unwrap_or_else(|| "unknown".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", host, &suffix[..8])
}

struct PoolInner {
    store: Arc<dyn JobStore>,
    config: WorkerConfig,
    registry: ProcessorRegistry,
    /// Types passed to `claim`; empty claims any type.
    claim_types: Vec<String>,
    observer: Option<Arc<dyn Observer>>,
    waker: Arc<Notify>,
}

/// A pool of polling workers sharing one store.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

/// Collects the pool options; processor registration errors surface from
/// [`build`](Self::build).
pub struct WorkerPoolBuilder {
    store: Arc<dyn JobStore>,
    config: WorkerConfig,
    registry: ProcessorRegistry,
    observer: Option<Arc<dyn Observer>>,
    error: Option<QueueError>,
}

impl WorkerPoolBuilder {
    pub fn config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn workers(mut self, count: usize, poll_interval: Duration) -> Self {
        self.config = self.config.with_workers(count, poll_interval);
        self
    }

    pub fn lease(mut self, lease: Duration) -> Self {
        self.config = self.config.with_lease(lease);
        self
    }

    pub fn instance_name(mut self, name: impl Into<String>) -> Self {
        self.config = self.config.with_instance_name(name);
        self
    }

    /// Register a processor. Repeatable, one per job type.
    pub fn processor(mut self, processor: Arc<dyn Processor>) -> Self {
        if let Err(e) = self.registry.register(processor) {
            self.error.get_or_insert(e);
        }
        self
    }

    pub fn registry(mut self, registry: ProcessorRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn build(self) -> Result<WorkerPool, QueueError> {
        if let Some(e) = self.error {
            return Err(e);
        }
        self.config.validate()?;
        if self.config.only_registered_types && self.registry.is_empty() {
            return Err(QueueError::InvalidConfig(
                "only_registered_types requires at least one processor".into(),
            ));
        }

        let claim_types = if self.config.only_registered_types {
            self.registry.types()
        } else {
            Vec::new()
        };

        Ok(WorkerPool {
            inner: Arc::new(PoolInner {
                store: self.store,
                config: self.config,
                registry: self.registry,
                claim_types,
                observer: self.observer,
                waker: Arc::new(Notify::new()),
            }),
        })
    }
}

impl WorkerPool {
    pub fn builder(store: Arc<dyn JobStore>) -> WorkerPoolBuilder {
        WorkerPoolBuilder {
            store,
            config: WorkerConfig::default(),
            registry: ProcessorRegistry::new(),
            observer: None,
            error: None,
        }
    }

    pub fn new(
        store: Arc<dyn JobStore>,
        config: WorkerConfig,
        registry: ProcessorRegistry,
    ) -> Result<Self, QueueError> {
        Self::builder(store).config(config).registry(registry).build()
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.inner.store
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.inner.config
    }

    /// Advisory wake-up signal for idle workers. Polling remains the
    /// correctness fallback.
    pub fn waker(&self) -> Arc<Notify> {
        self.inner.waker.clone()
    }

    /// Run the workers and the lock sweeper until `shutdown` is cancelled.
    ///
    /// In-flight jobs observe cancellation through their [`JobContext`] and
    /// are awaited, not aborted. Returns the first fatal store error, if any.
    pub async fn start(&self, shutdown: CancellationToken) -> Result<(), QueueError> {
        let cancel = shutdown.child_token();
        let mut tasks = JoinSet::new();

        info!(
            instance = %self.inner.config.instance_name,
            workers = self.inner.config.worker_count,
            processors = ?self.inner.registry.types(),
            "Worker pool started"
        );

        for n in 0..self.inner.config.worker_count {
            let pool = self.clone();
            let cancel = cancel.clone();
            let worker = format!("{}/{}", self.inner.config.instance_name, n);
            tasks.spawn(async move { pool.run_worker(worker, cancel).await });
        }
        {
            let pool = self.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move { pool.sweep_locks(cancel).await });
        }

        let mut result = Ok(());
        while let Some(joined) = tasks.join_next().await {
            let err = match joined {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(e) => QueueError::Backend(format!("worker task failed: {}", e)),
            };
            error!(error = %err, "Worker stopped, shutting down pool");
            cancel.cancel();
            if result.is_ok() {
                result = Err(err);
            }
        }

        info!("Worker pool stopped");
        result
    }

    async fn run_worker(&self, worker: String, cancel: CancellationToken) -> Result<(), QueueError> {
        debug!(worker = %worker, "Worker started");

        while !cancel.is_cancelled() {
            match self.process_next(&worker, &cancel).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(worker = %worker, error = %e, "Queue poll failed"),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.inner.config.poll_interval) => {}
                _ = self.inner.waker.notified() => {}
            }
        }

        debug!(worker = %worker, "Worker stopped");
        Ok(())
    }

    async fn sweep_locks(&self, cancel: CancellationToken) -> Result<(), QueueError> {
        let mut ticker = tokio::time::interval(self.inner.config.sweep_interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }

            match self.inner.store.release_expired(Utc::now()).await {
                Ok(0) => {}
                Ok(released) => info!(released, "Released expired job locks"),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(error = %e, "Releasing expired locks failed"),
            }
        }
    }

    /// One claim/execute/retire cycle. Returns `false` when no row was
    /// eligible.
    pub async fn process_next(
        &self,
        worker: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, QueueError> {
        let inner = &self.inner;
        let now = Utc::now();
        let row = match inner
            .store
            .claim(worker, &inner.claim_types, now, inner.config.lease_duration)
            .await?
        {
            Some(row) => row,
            None => return Ok(false),
        };

        let span = info_span!(
            "job",
            job_id = %row.id,
            job_type = %row.job_type,
            reference = %row.reference,
            worker = %worker
        );
        self.execute(JobHandle::new(row), JobContext::new(cancel.clone(), worker))
            .instrument(span)
            .await?;
        Ok(true)
    }

    async fn execute(&self, mut job: JobHandle, ctx: JobContext) -> Result<(), QueueError> {
        let inner = &self.inner;

        match inner.registry.get(job.job_type()) {
            None => {
                warn!("No processor registered for job type, failing job");
                job.failed();
            }
            Some(processor) => {
                debug!(error_count = job.error_count(), "Processing job");
                let started = Instant::now();
                let ran = AssertUnwindSafe(processor.run(&ctx, &mut job))
                    .catch_unwind()
                    .await;
                let elapsed_ms = started.elapsed().as_millis() as u64;

                if ran.is_err() {
                    error!(elapsed_ms, "Processor panicked, lock left to expire");
                    return Ok(());
                }
                if !job.is_set() {
                    warn!(elapsed_ms, "Processor returned without outcome, lock left to expire");
                    return Ok(());
                }
                debug!(elapsed_ms, "Processor finished");
            }
        }

        let outcome = job.outcome();
        let row = job.into_row();
        match inner.store.release(&row).await {
            Ok(()) => {}
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                error!(error = %e, "Failed to persist job outcome");
                return Ok(());
            }
        }

        info!(
            outcome = ?outcome,
            error_count = row.error_count,
            next_run_at = %row.next_run_at,
            "Job retired"
        );

        if let Some(observer) = &inner.observer {
            let observed = AssertUnwindSafe(observer.observe(&ctx, &row.job_type, &row.reference))
                .catch_unwind()
                .await;
            if observed.is_err() {
                error!("Observer panicked");
            }
        }
        Ok(())
    }
}

//! Garbage collection and the maintenance heartbeat

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::backend::JobStore;
use crate::backoff::Exponential;
use crate::error::QueueError;
use crate::handle::JobHandle;
use crate::job::NewJob;
use crate::processor::{JobContext, Processor};

/// Finished rows are kept this long before deletion.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Job type of the maintenance heartbeat.
pub const HEARTBEAT_TYPE: &str = "Heartbeat-v1";

/// Result of one collection pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcReport {
    /// Rows whose expired lock was cleared
    pub released: u64,
    /// Finished rows deleted
    pub deleted: u64,
}

/// Deletes finished rows past the retention and clears expired locks.
///
/// Unfinished rows are never deleted; they recover through lease expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GarbageCollector {
    retention: Duration,
}

impl Default for GarbageCollector {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION)
    }
}

impl GarbageCollector {
    pub fn new(retention: Duration) -> Self {
        Self { retention }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Rows finished before this instant are deleted.
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.retention)
            .ok()
            .and_then(|retention| now.checked_sub_signed(retention))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    pub async fn collect(
        &self,
        store: &dyn JobStore,
        now: DateTime<Utc>,
    ) -> Result<GcReport, QueueError> {
        let released = store.release_expired(now).await?;
        let deleted = store.garbage_collect(self.cutoff(now)).await?;

        if released > 0 || deleted > 0 {
            info!(released, deleted, "Job garbage collection finished");
        }
        Ok(GcReport { released, deleted })
    }
}

/// Runs the garbage collector whenever a heartbeat job is executed.
pub struct MaintenanceProcessor {
    store: Arc<dyn JobStore>,
    collector: GarbageCollector,
    backoff: Exponential,
}

impl MaintenanceProcessor {
    pub fn new(store: Arc<dyn JobStore>, collector: GarbageCollector) -> Self {
        Self {
            store,
            collector,
            backoff: Exponential::new(Duration::from_secs(1), Duration::from_secs(60)),
        }
    }
}

#[async_trait]
impl Processor for MaintenanceProcessor {
    fn job_type(&self) -> &str {
        HEARTBEAT_TYPE
    }

    async fn run(&self, ctx: &JobContext, job: &mut JobHandle) {
        if ctx.is_cancelled() {
            job.retry(&self.backoff);
            return;
        }

        match self.collector.collect(self.store.as_ref(), Utc::now()).await {
            Ok(_) => job.done(),
            Err(e) => {
                warn!(error = %e, "Maintenance run failed");
                job.retry(&self.backoff);
            }
        }
    }
}

/// The heartbeat for the bucket of length `every` containing `now`.
///
/// Instances sharing a store derive the same reference for the same bucket,
/// so only one heartbeat per bucket is enqueued.
pub fn heartbeat_job(now: DateTime<Utc>, every: Duration) -> NewJob {
    let width = every.as_secs().max(1) as i64;
    let bucket = now.timestamp().div_euclid(width) * width;
    NewJob::new(
        HEARTBEAT_TYPE,
        format!("heartbeat/{}", bucket),
        serde_json::Value::Null,
        now,
    )
}

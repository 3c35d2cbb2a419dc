//! Job store trait

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::QueueError;
use crate::job::{JobId, JobRow, JobStatus, NewJob};

/// Column used to order [`JobStore::list`] results (newest first).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderBy {
    #[default]
    Id,
    ScheduledAt,
    LockedAt,
    NextRunAt,
    FinishedAt,
    Reference,
}

/// Filter for [`JobStore::list`]. Empty sets do not restrict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFilter {
    pub types: Vec<String>,
    pub references: Vec<String>,
    pub status: Option<JobStatus>,
    pub order_by: OrderBy,
    pub limit: usize,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            types: Vec::new(),
            references: Vec::new(),
            status: None,
            order_by: OrderBy::Id,
            limit: 100,
        }
    }
}

impl JobFilter {
    pub fn matches(&self, row: &JobRow) -> bool {
        (self.types.is_empty() || self.types.contains(&row.job_type))
            && (self.references.is_empty() || self.references.contains(&row.reference))
            && self.status.map_or(true, |s| s == row.status())
    }
}

/// Row count for one `(type, state)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStat {
    pub job_type: String,
    pub state: String,
    pub count: u64,
}

/// Durable storage the worker pool coordinates through.
///
/// `claim` is the only concurrency-control primitive: implementations must
/// select an eligible row and lock it in one atomic step.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new row. Fails with [`QueueError::Duplicate`] if
    /// `(type, reference)` exists, without modifying the existing row.
    async fn enqueue(&self, job: NewJob, now: DateTime<Utc>) -> Result<JobRow, QueueError>;

    /// Claim one eligible row of the given types (any type when `types` is
    /// empty) for `worker` until `now + lease`. Oldest `next_run_at` first.
    async fn claim(
        &self,
        worker: &str,
        types: &[String],
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<JobRow>, QueueError>;

    /// Persist the outcome carried by `row` and clear its lock, provided the
    /// row is still held by `row.locked_by` or not locked at all.
    async fn release(&self, row: &JobRow) -> Result<(), QueueError>;

    /// Clear the lock fields of rows whose lease expired. Returns the count.
    async fn release_expired(&self, now: DateTime<Utc>) -> Result<u64, QueueError>;

    /// Delete finished rows with `finished_at < older_than`. Returns the count.
    async fn garbage_collect(&self, older_than: DateTime<Utc>) -> Result<u64, QueueError>;

    async fn by_id(&self, id: JobId) -> Result<JobRow, QueueError>;

    async fn by_reference(&self, job_type: &str, reference: &str) -> Result<JobRow, QueueError>;

    async fn list(&self, filter: &JobFilter) -> Result<Vec<JobRow>, QueueError>;

    /// True iff every row with one of `references` is finished or was
    /// scheduled before `max_age`. When no row matches, only an empty
    /// reference set is ready.
    async fn are_ready(
        &self,
        references: &[String],
        max_age: DateTime<Utc>,
    ) -> Result<bool, QueueError>;

    async fn stats(&self) -> Result<Vec<QueueStat>, QueueError>;
}

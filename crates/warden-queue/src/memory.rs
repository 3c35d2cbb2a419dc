//! In-memory job store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::backend::{JobFilter, JobStore, OrderBy, QueueStat};
use crate::error::QueueError;
use crate::handle::after;
use crate::job::{JobId, JobRow, NewJob};

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<Uuid, JobRow>,
    /// `(type, reference)` uniqueness index
    references: HashMap<(String, String), Uuid>,
}

/// Job store held in process memory.
///
/// A single lock serializes every operation, which makes `claim` atomic.
/// Intended for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    inner: RwLock<Inner>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.jobs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl JobStore for MemoryQueue {
    async fn enqueue(&self, job: NewJob, now: DateTime<Utc>) -> Result<JobRow, QueueError> {
        let mut inner = self.inner.write().await;
        let key = (job.job_type.clone(), job.reference.clone());
        if inner.references.contains_key(&key) {
            return Err(QueueError::Duplicate {
                job_type: key.0,
                reference: key.1,
            });
        }

        let id = Uuid::new_v4();
        let row = job.into_row(id, now);
        inner.references.insert(key, id);
        inner.jobs.insert(id, row.clone());

        Ok(row)
    }

    async fn claim(
        &self,
        worker: &str,
        types: &[String],
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<JobRow>, QueueError> {
        let mut inner = self.inner.write().await;

        let next = inner
            .jobs
            .values()
            .filter(|row| {
                (types.is_empty() || types.contains(&row.job_type)) && row.is_eligible(now)
            })
            .min_by_key(|row| (row.next_run_at, row.scheduled_at))
            .map(|row| row.id);

        Ok(next.and_then(|id| {
            inner.jobs.get_mut(&id).map(|row| {
                row.lock(worker, now, after(now, lease));
                row.clone()
            })
        }))
    }

    async fn release(&self, row: &JobRow) -> Result<(), QueueError> {
        let mut inner = self.inner.write().await;
        let stored = inner.jobs.get_mut(&row.id).ok_or(QueueError::NotFound)?;

        // finished by a later holder, or re-claimed after our lease expired
        let held_by_other = stored.locked_by.is_some() && stored.locked_by != row.locked_by;
        if held_by_other || stored.successful.is_some() {
            return Err(QueueError::LockLost(row.id));
        }

        stored.next_run_at = row.next_run_at;
        stored.error_count = row.error_count;
        stored.successful = row.successful;
        stored.finished_at = row.finished_at;
        stored.unlock();

        Ok(())
    }

    async fn release_expired(&self, now: DateTime<Utc>) -> Result<u64, QueueError> {
        let mut inner = self.inner.write().await;
        let mut released = 0;
        for row in inner.jobs.values_mut() {
            let locked = row.locked_at.is_some() || row.locked_by.is_some();
            if locked && row.locked_until.map_or(false, |until| until <= now) {
                row.unlock();
                released += 1;
            }
        }
        Ok(released)
    }

    async fn garbage_collect(&self, older_than: DateTime<Utc>) -> Result<u64, QueueError> {
        let mut guard = self.inner.write().await;
        let inner = &mut *guard;
        let before = inner.jobs.len();

        inner
            .jobs
            .retain(|_, row| row.finished_at.map_or(true, |at| at >= older_than));
        let jobs = &inner.jobs;
        inner.references.retain(|_, id| jobs.contains_key(id));

        Ok((before - inner.jobs.len()) as u64)
    }

    async fn by_id(&self, id: JobId) -> Result<JobRow, QueueError> {
        let inner = self.inner.read().await;
        inner.jobs.get(&id).cloned().ok_or(QueueError::NotFound)
    }

    async fn by_reference(&self, job_type: &str, reference: &str) -> Result<JobRow, QueueError> {
        let inner = self.inner.read().await;
        inner
            .references
            .get(&(job_type.to_string(), reference.to_string()))
            .and_then(|id| inner.jobs.get(id))
            .cloned()
            .ok_or(QueueError::NotFound)
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<JobRow>, QueueError> {
        let inner = self.inner.read().await;
        let mut rows: Vec<JobRow> = inner
            .jobs
            .values()
            .filter(|row| filter.matches(row))
            .cloned()
            .collect();

        match filter.order_by {
            OrderBy::Id => rows.sort_by_key(|r| Reverse(r.id)),
            OrderBy::ScheduledAt => rows.sort_by_key(|r| Reverse(r.scheduled_at)),
            OrderBy::LockedAt => rows.sort_by_key(|r| Reverse(r.locked_at)),
            OrderBy::NextRunAt => rows.sort_by_key(|r| Reverse(r.next_run_at)),
            OrderBy::FinishedAt => rows.sort_by_key(|r| Reverse(r.finished_at)),
            OrderBy::Reference => rows.sort_by(|a, b| b.reference.cmp(&a.reference)),
        }
        rows.truncate(filter.limit);

        Ok(rows)
    }

    async fn are_ready(
        &self,
        references: &[String],
        max_age: DateTime<Utc>,
    ) -> Result<bool, QueueError> {
        let inner = self.inner.read().await;
        let mut matched = false;
        for row in inner.jobs.values() {
            if !references.contains(&row.reference) {
                continue;
            }
            matched = true;
            if !(row.is_finished() || max_age > row.scheduled_at) {
                return Ok(false);
            }
        }
        Ok(matched || references.is_empty())
    }

    async fn stats(&self) -> Result<Vec<QueueStat>, QueueError> {
        let inner = self.inner.read().await;
        let mut counts: BTreeMap<(String, &'static str), u64> = BTreeMap::new();
        for row in inner.jobs.values() {
            *counts
                .entry((row.job_type.clone(), row.status().as_state()))
                .or_default() += 1;
        }

        Ok(counts
            .into_iter()
            .map(|((job_type, state), count)| QueueStat {
                job_type,
                state: state.to_string(),
                count,
            })
            .collect())
    }
}

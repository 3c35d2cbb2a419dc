//! Job handle: the outcome state machine of one execution attempt

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, error};

use crate::backoff::Exponential;
use crate::error::QueueError;
use crate::job::{JobId, JobRow};

/// Outcome recorded by a processor for the current attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Terminal success
    Done,
    /// Transient failure, eligible again at `next_run_at`
    Retry { next_run_at: DateTime<Utc> },
    /// Terminal failure that re-execution cannot fix
    Failed,
}

/// Live wrapper around a claimed row.
///
/// A processor must call exactly one of [`done`](Self::done),
/// [`retry`](Self::retry) or [`failed`](Self::failed). The first call wins;
/// later calls are logged and ignored.
#[derive(Debug)]
pub struct JobHandle {
    row: JobRow,
    outcome: Option<Outcome>,
}

impl JobHandle {
    pub fn new(row: JobRow) -> Self {
        Self { row, outcome: None }
    }

    pub fn row(&self) -> &JobRow {
        &self.row
    }

    pub fn id(&self) -> JobId {
        self.row.id
    }

    pub fn job_type(&self) -> &str {
        &self.row.job_type
    }

    pub fn reference(&self) -> &str {
        &self.row.reference
    }

    pub fn error_count(&self) -> u32 {
        self.row.error_count
    }

    pub fn arguments<T: DeserializeOwned>(&self) -> Result<T, QueueError> {
        self.row.arguments()
    }

    pub fn is_set(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.outcome
    }

    /// Mark the job as successfully finished.
    pub fn done(&mut self) {
        if self.finalized("done") {
            return;
        }
        let now = Utc::now();
        self.row.successful = Some(true);
        self.row.finished_at = Some(now);
        self.outcome = Some(Outcome::Done);
    }

    /// Mark the job as permanently failed.
    pub fn failed(&mut self) {
        if self.finalized("failed") {
            return;
        }
        let now = Utc::now();
        self.row.successful = Some(false);
        self.row.finished_at = Some(now);
        self.outcome = Some(Outcome::Failed);
    }

    /// Reschedule after a transient failure, waiting according to `policy`.
    pub fn retry(&mut self, policy: &Exponential) {
        let wait = policy.delay(self.row.error_count.saturating_add(1));
        self.retry_after(wait);
    }

    /// Reschedule after a fixed wait.
    pub fn retry_after(&mut self, wait: Duration) {
        let at = after(Utc::now(), wait);
        self.retry_at(at);
    }

    /// Reschedule at an explicit point in time.
    pub fn retry_at(&mut self, at: DateTime<Utc>) {
        if self.finalized("retry") {
            return;
        }
        self.row.error_count = self.row.error_count.saturating_add(1);
        self.row.next_run_at = at;
        self.outcome = Some(Outcome::Retry { next_run_at: at });

        debug!(
            job_id = %self.row.id,
            job_type = %self.row.job_type,
            error_count = self.row.error_count,
            next_run_at = %at,
            "Job scheduled for retry"
        );
    }

    /// Consume the handle, yielding the row to persist.
    pub fn into_row(self) -> JobRow {
        self.row
    }

    fn finalized(&self, op: &str) -> bool {
        if self.outcome.is_some() {
            error!(
                job_id = %self.row.id,
                job_type = %self.row.job_type,
                "{}() called on finalized job",
                op
            );
            return true;
        }
        false
    }
}

/// `now + wait`, saturating at the largest representable instant.
pub(crate) fn after(now: DateTime<Utc>, wait: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(wait)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

//! Job record definitions

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::QueueError;

/// Job Identifier, assigned by the store on insert.
pub type JobId = Uuid;

/// Coarse lifecycle state derived from the row's columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for `next_run_at`, not locked
    Queued,
    /// Locked by a worker
    Running,
    /// Finished successfully
    Done,
    /// Finished with a permanent failure
    Failed,
}

impl JobStatus {
    /// Label used by queue statistics.
    pub fn as_state(&self) -> &'static str {
        match self {
            Self::Queued => "waiting",
            Self::Running => "in_progress",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

/// A job to be inserted by [`crate::JobStore::enqueue`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub job_type: String,
    pub reference: String,
    pub args: serde_json::Value,
    /// Earliest time the job may run. May lie in the future.
    pub run_at: DateTime<Utc>,
}

impl NewJob {
    pub fn new(
        job_type: impl Into<String>,
        reference: impl Into<String>,
        args: serde_json::Value,
        run_at: DateTime<Utc>,
    ) -> Self {
        Self {
            job_type: job_type.into(),
            reference: reference.into(),
            args,
            run_at,
        }
    }

    /// Serialize typed arguments into the opaque document.
    pub fn with_args<T: Serialize>(
        job_type: impl Into<String>,
        reference: impl Into<String>,
        args: &T,
        run_at: DateTime<Utc>,
    ) -> Result<Self, QueueError> {
        Ok(Self::new(job_type, reference, serde_json::to_value(args)?, run_at))
    }

    /// Materialize the row a store inserts for this job.
    pub fn into_row(self, id: JobId, now: DateTime<Utc>) -> JobRow {
        JobRow {
            id,
            job_type: self.job_type,
            reference: self.reference,
            args: self.args,
            scheduled_at: now,
            next_run_at: self.run_at,
            last_run_at: None,
            locked_at: None,
            locked_until: None,
            locked_by: None,
            error_count: 0,
            successful: None,
            finished_at: None,
        }
    }
}

/// The durable representation of one unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRow {
    pub id: JobId,
    pub job_type: String,
    pub reference: String,
    pub args: serde_json::Value,
    pub scheduled_at: DateTime<Utc>,
    pub next_run_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_until: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub error_count: u32,
    /// `None` while pending or in flight, `Some(_)` once terminal.
    pub successful: Option<bool>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRow {
    /// Decode the opaque argument document.
    pub fn arguments<T: DeserializeOwned>(&self) -> Result<T, QueueError> {
        if self.args.is_null() {
            return Err(QueueError::NoArguments);
        }
        Ok(serde_json::from_value(self.args.clone())?)
    }

    /// Whether a worker may claim this row at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.successful.is_none()
            && self.next_run_at <= now
            && self.locked_until.map_or(true, |until| until <= now)
    }

    pub fn is_finished(&self) -> bool {
        self.successful.is_some()
    }

    pub fn status(&self) -> JobStatus {
        match self.successful {
            Some(true) => JobStatus::Done,
            Some(false) => JobStatus::Failed,
            None if self.locked_by.is_some() => JobStatus::Running,
            None => JobStatus::Queued,
        }
    }

    /// Take the lease for `worker` until `until`.
    pub fn lock(&mut self, worker: &str, now: DateTime<Utc>, until: DateTime<Utc>) {
        self.locked_at = Some(now);
        self.locked_until = Some(until);
        self.locked_by = Some(worker.to_string());
        self.last_run_at = Some(now);
    }

    pub fn unlock(&mut self) {
        self.locked_at = None;
        self.locked_until = None;
        self.locked_by = None;
    }
}

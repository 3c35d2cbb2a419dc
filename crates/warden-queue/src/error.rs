//! Queue error types

/// Errors surfaced by the queue, its stores and its configuration.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// A row with the same `(type, reference)` already exists.
    #[error("Duplicate job: {job_type} {reference}")]
    Duplicate { job_type: String, reference: String },

    #[error("Job not found")]
    NotFound,

    #[error("Unknown job type: {0}")]
    UnknownJobType(String),

    #[error("Job has no arguments")]
    NoArguments,

    #[error("Invalid job arguments: {0}")]
    InvalidArguments(#[from] serde_json::Error),

    #[error("Invalid queue configuration: {0}")]
    InvalidConfig(String),

    #[error("Processor already registered for type: {0}")]
    DuplicateProcessor(String),

    /// The row was unlocked and re-claimed by another worker before the
    /// outcome could be written.
    #[error("Lock lost on job {0}")]
    LockLost(uuid::Uuid),

    #[error("Backend error: {0}")]
    Backend(String),

    /// The store is shut down and cannot serve further requests.
    #[error("Store closed")]
    Closed,
}

impl QueueError {
    /// Fatal errors stop the worker pool instead of being retried on the
    /// next poll tick.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Closed)
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate { .. })
    }
}

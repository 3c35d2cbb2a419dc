//! Processor capability and registry

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::QueueError;
use crate::handle::JobHandle;

/// Execution context handed to a processor.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Cancelled when the worker pool shuts down.
    pub cancel: CancellationToken,
    /// Identity of the worker holding the lease.
    pub worker: String,
}

impl JobContext {
    pub fn new(cancel: CancellationToken, worker: impl Into<String>) -> Self {
        Self {
            cancel,
            worker: worker.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once shutdown was requested.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

/// A workload handler registered under a job type.
///
/// `run` must finish by calling exactly one of the handle's outcome
/// operations. Returning without an outcome leaves the lease in place, so
/// the row is re-executed once the lease expires. Implementations must be
/// safe to run more than once for the same row, and should treat
/// cancellation as a transient failure.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Dispatch key, e.g. `"Event-v1"`.
    fn job_type(&self) -> &str;

    async fn run(&self, ctx: &JobContext, job: &mut JobHandle);
}

/// Processors keyed by their job type.
#[derive(Clone, Default)]
pub struct ProcessorRegistry {
    processors: HashMap<String, Arc<dyn Processor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a processor. Each job type may only be registered once.
    pub fn register(&mut self, processor: Arc<dyn Processor>) -> Result<(), QueueError> {
        let ty = processor.job_type().to_string();
        if ty.is_empty() {
            return Err(QueueError::InvalidConfig("processor type cannot be empty".into()));
        }
        if self.processors.contains_key(&ty) {
            return Err(QueueError::DuplicateProcessor(ty));
        }
        self.processors.insert(ty, processor);
        Ok(())
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, processor: Arc<dyn Processor>) -> Result<Self, QueueError> {
        self.register(processor)?;
        Ok(self)
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn Processor>> {
        self.processors.get(job_type).cloned()
    }

    /// Registered job types, sorted.
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.processors.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }
}

impl fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorRegistry")
            .field("types", &self.types())
            .finish()
    }
}

//! Post-execution observer hook

use async_trait::async_trait;

use crate::processor::JobContext;

/// Invoked once after each persisted outcome (done, failed or retry).
///
/// Used to chain follow-on work keyed by `(type, reference)`. It may see the
/// same reference several times across retries.
#[async_trait]
pub trait Observer: Send + Sync {
    async fn observe(&self, ctx: &JobContext, job_type: &str, reference: &str);
}

/// Adapts a synchronous closure into an [`Observer`].
pub struct FnObserver<F>(pub F);

#[async_trait]
impl<F> Observer for FnObserver<F>
where
    F: Fn(&str, &str) + Send + Sync,
{
    async fn observe(&self, _ctx: &JobContext, job_type: &str, reference: &str) {
        (self.0)(job_type, reference)
    }
}

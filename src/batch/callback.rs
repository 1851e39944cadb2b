//! The caller-supplied unit of work run once per batch

use async_trait::async_trait;
use std::future::Future;
use tokio_util::sync::CancellationToken;

use crate::BoxError;

/// Processes one flushed batch of jobs.
///
/// Invoked exactly once per batch. Results belong on the jobs themselves
/// (through shared, interior-mutable fields), and become visible to
/// submitters once [`JobHandle::wait`](crate::JobHandle::wait) returns. The
/// returned error, if any, is shared by every job in the batch.
///
/// The token is cancelled when the coordinator is hard-stopped. Honoring it
/// is optional, but a callback that ignores it delays `close`.
///
/// Any `Fn(CancellationToken, Vec<J>) -> impl Future<Output = Result<(), BoxError>>`
/// closure implements this trait.
#[async_trait]
pub trait BatchCallback<J>: Send + Sync + 'static {
    /// Run the batch
    async fn process(&self, token: CancellationToken, jobs: Vec<J>) -> Result<(), BoxError>;
}

#[async_trait]
impl<J, F, Fut> BatchCallback<J> for F
where
    J: Send + 'static,
    F: Fn(CancellationToken, Vec<J>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    async fn process(&self, token: CancellationToken, jobs: Vec<J>) -> Result<(), BoxError> {
        (self)(token, jobs).await
    }
}

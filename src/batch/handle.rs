//! Caller-held handles for waiting on a submitted job's batch

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::batch::state::BatchSignal;
use crate::{MicrobatchError, Result};

/// A submitted job, bound to the batch it was placed into.
///
/// Call [`wait`](Self::wait) before reading any results the callback writes
/// onto the job. Clones share the same batch and observe the same outcome.
#[derive(Debug, Clone)]
pub struct JobHandle<J> {
    job: J,
    batch: Arc<BatchSignal>,
}

impl<J> JobHandle<J> {
    pub(crate) fn new(job: J, batch: Arc<BatchSignal>) -> Self {
        Self { job, batch }
    }

    /// The submitted job.
    ///
    /// The callback may still be using its own copy until the batch completes.
    pub fn job(&self) -> &J {
        &self.job
    }

    /// Consume the handle, returning the job
    pub fn into_job(self) -> J {
        self.job
    }

    /// Identifier of the batch this job was placed into
    pub fn batch_id(&self) -> u64 {
        self.batch.id()
    }

    /// Whether the batch has completed
    pub fn is_done(&self) -> bool {
        self.batch.is_complete()
    }

    /// Wait for the batch to complete, returning its shared outcome.
    ///
    /// Fails with [`MicrobatchError::Canceled`] if `token` fires first; that
    /// only abandons this wait, never the batch.
    pub async fn wait(&self, token: &CancellationToken) -> Result<()> {
        tokio::select! {
            biased;
            outcome = self.batch.wait() => outcome,
            _ = token.cancelled() => Err(MicrobatchError::Canceled),
        }
    }

    /// Like [`wait`](Self::wait), failing with
    /// [`MicrobatchError::DeadlineExceeded`] once `timeout` elapses
    pub async fn wait_timeout(&self, timeout: Duration) -> Result<()> {
        tokio::time::timeout(timeout, self.batch.wait())
            .await
            .unwrap_or(Err(MicrobatchError::DeadlineExceeded))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_cancelled_before_completion() {
        let handle = JobHandle::new("job", BatchSignal::new(1));
        let token = CancellationToken::new();
        token.cancel();

        assert!(matches!(handle.wait(&token).await, Err(MicrobatchError::Canceled)));
        assert!(!handle.is_done());
    }

    #[tokio::test]
    async fn test_completed_outcome_wins_over_cancelled_token() {
        let signal = BatchSignal::new(2);
        let handle = JobHandle::new(10u32, signal.clone());
        signal.complete(Ok(()));

        let token = CancellationToken::new();
        token.cancel();
        assert!(handle.wait(&token).await.is_ok());
        assert!(handle.is_done());
        assert_eq!(handle.batch_id(), 2);
        assert_eq!(handle.into_job(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_timeout() {
        let handle = JobHandle::new((), BatchSignal::new(3));
        let err = handle.wait_timeout(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, MicrobatchError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_clones_share_outcome() {
        let signal = BatchSignal::new(4);
        let first = JobHandle::new("a", signal.clone());
        let second = first.clone();

        let waiter = tokio::spawn(async move { second.wait(&CancellationToken::new()).await });
        signal.complete(Err(MicrobatchError::CallbackPanicked));

        assert!(matches!(waiter.await.unwrap(), Err(MicrobatchError::CallbackPanicked)));
        assert!(matches!(
            first.wait(&CancellationToken::new()).await,
            Err(MicrobatchError::CallbackPanicked)
        ));
    }
}

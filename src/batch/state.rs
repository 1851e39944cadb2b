//! Batch lifecycle: accumulation, dispatch and completion
//!
//! A [`Batch`] is owned by the control loop while it accumulates, then moved
//! wholesale into a dispatch task on flush. Only its [`BatchSignal`] is ever
//! shared, so the job list itself never needs a lock.

use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::batch::callback::BatchCallback;
use crate::batch::limiter::DispatchPermit;
use crate::batch::metrics::{
    DispatchTimer, OUTCOME_DROPPED, OUTCOME_ERROR, OUTCOME_OK, OUTCOME_PANIC,
};
use crate::batch::types::StatsCounters;
use crate::MicrobatchError;

/// Result recorded once per batch and shared by all of its jobs
pub(crate) type Outcome = Result<(), MicrobatchError>;

/// Single-assignment completion signal with any number of observers
#[derive(Debug)]
pub(crate) struct BatchSignal {
    id: u64,
    outcome: watch::Sender<Option<Outcome>>,
}

impl BatchSignal {
    pub(crate) fn new(id: u64) -> Arc<Self> {
        let (outcome, _) = watch::channel(None);
        Arc::new(Self { id, outcome })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.outcome.borrow().is_some()
    }

    /// Record the outcome. Only the first call has any effect.
    pub(crate) fn complete(&self, outcome: Outcome) {
        self.outcome.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome);
            true
        });
    }

    /// Wait for the outcome
    pub(crate) async fn wait(&self) -> Outcome {
        let mut receiver = self.outcome.subscribe();
        let slot = match receiver.wait_for(Option::is_some).await {
            Ok(slot) => slot.clone(),
            // the sender lives as long as self
            Err(_) => None,
        };
        slot.unwrap_or(Err(MicrobatchError::CallbackPanicked))
    }
}

/// One accumulation unit of jobs
#[derive(Debug)]
pub(crate) struct Batch<J> {
    jobs: Vec<J>,
    signal: Arc<BatchSignal>,
}

impl<J: Send + 'static> Batch<J> {
    pub(crate) fn new(id: u64) -> Self {
        Self {
            jobs: Vec::new(),
            signal: BatchSignal::new(id),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.signal.id()
    }

    pub(crate) fn len(&self) -> usize {
        self.jobs.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub(crate) fn signal(&self) -> &Arc<BatchSignal> {
        &self.signal
    }

    pub(crate) fn push(&mut self, job: J) {
        self.jobs.push(job);
    }

    /// Run the callback once over the frozen job list, then complete the batch.
    ///
    /// The token is cancelled as soon as the callback returns. If the callback
    /// panics, every waiter observes [`MicrobatchError::CallbackPanicked`] and
    /// the panic continues out of the dispatch task. If the dispatch future is
    /// dropped mid-callback, e.g. by a runtime shutdown, waiters observe
    /// [`MicrobatchError::Canceled`].
    pub(crate) async fn dispatch(
        self,
        callback: Arc<dyn BatchCallback<J>>,
        token: CancellationToken,
        permit: DispatchPermit,
        counters: Arc<StatsCounters>,
    ) {
        let Batch { jobs, signal } = self;
        let batch_id = signal.id();
        let batch_size = jobs.len();

        // dropped in reverse: permit, then token, then completion
        let mut completion = Completion::new(signal, counters, DispatchTimer::start(batch_size));
        let _cancel_on_exit = token.clone().drop_guard();
        let _permit = permit;

        debug!(batch_id, batch_size, "Dispatching batch");

        let result = callback.process(token, jobs).await;
        completion.outcome = result.map_err(MicrobatchError::from);
    }
}

/// Completes the signal when dropped, with the sentinel outcome unless the
/// callback returned normally. The sentinel only stands for a panic while
/// the thread is actually unwinding.
struct Completion {
    signal: Arc<BatchSignal>,
    counters: Arc<StatsCounters>,
    timer: Option<DispatchTimer>,
    outcome: Outcome,
}

impl Completion {
    fn new(signal: Arc<BatchSignal>, counters: Arc<StatsCounters>, timer: DispatchTimer) -> Self {
        Self {
            signal,
            counters,
            timer: Some(timer),
            outcome: Err(MicrobatchError::CallbackPanicked),
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        let batch_id = self.signal.id();
        let mut outcome = std::mem::replace(&mut self.outcome, Ok(()));

        if matches!(outcome, Err(MicrobatchError::CallbackPanicked)) && !std::thread::panicking() {
            outcome = Err(MicrobatchError::Canceled);
            if let Some(timer) = self.timer.take() {
                timer.finish(OUTCOME_DROPPED);
            }
            debug!(batch_id, "Dispatch dropped before the callback returned");
            self.signal.complete(outcome);
            return;
        }

        let label = match &outcome {
            Ok(()) => {
                debug!(batch_id, "Batch completed");
                OUTCOME_OK
            }
            Err(MicrobatchError::CallbackPanicked) => {
                error!(batch_id, "Batch callback panicked");
                OUTCOME_PANIC
            }
            Err(e) => {
                warn!(batch_id, error = %e, "Batch callback failed");
                OUTCOME_ERROR
            }
        };

        if outcome.is_err() {
            self.counters.record_failure();
        }
        if let Some(timer) = self.timer.take() {
            timer.finish(label);
        }

        self.signal.complete(outcome);
    }
}

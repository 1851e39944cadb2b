//! Batch coordinator
//!
//! Accepts individually submitted jobs and groups them into batches:
//! - A single control loop owns the accumulating batch; submitters rendezvous
//!   with it rather than touching the batch themselves
//! - Size-based and time-based flush triggers
//! - Bounded dispatch concurrency, with backpressure onto submitters
//! - Graceful (`shutdown`) and forced (`close`) stops, both draining fully

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, trace, warn};

use crate::batch::callback::BatchCallback;
use crate::batch::handle::JobHandle;
use crate::batch::limiter::ConcurrencyLimiter;
use crate::batch::metrics;
use crate::batch::state::{Batch, BatchSignal};
use crate::batch::types::{BatchConfig, BatchStats, ConfigError, CoordinatorState, StatsCounters};
use crate::{MicrobatchError, Result};

/// A job on its way to the control loop, with the slot for its batch
struct SubmitRequest<J> {
    job: J,
    reply: oneshot::Sender<Arc<BatchSignal>>,
}

/// Groups submitted jobs into batches for a [`BatchCallback`].
///
/// Must be created from within a tokio runtime. Call [`shutdown`](Self::shutdown)
/// or [`close`](Self::close) when done; dropping the coordinator requests a
/// graceful stop without waiting for it.
///
/// Neither `shutdown` nor `close` may be awaited from inside the callback, as
/// they wait for that very callback to return.
pub struct Coordinator<J> {
    config: BatchConfig,
    submit_tx: mpsc::Sender<SubmitRequest<J>>,
    /// Hard stop; parent of every dispatch token
    ctx: CancellationToken,
    /// Graceful stop
    stopping: CancellationToken,
    /// Fired once the control loop has drained and exited
    done: CancellationToken,
    limiter: ConcurrencyLimiter,
    counters: Arc<StatsCounters>,
}

impl<J> std::fmt::Debug for Coordinator<J> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("config", &self.config)
            .field("state", &self.state())
            .field("stats", &self.stats())
            .finish()
    }
}

impl<J: Send + 'static> Coordinator<J> {
    /// Validate `config` and start the control loop.
    ///
    /// Fails if both flush triggers are disabled, or if there is no current
    /// tokio runtime.
    pub fn new<C>(config: BatchConfig, callback: C) -> Result<Self>
    where
        C: BatchCallback<J>,
    {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| ConfigError::NoRuntime)?;

        let (submit_tx, submit_rx) = mpsc::channel(1);
        let (flush_tx, flush_rx) = mpsc::channel(1);
        let ctx = CancellationToken::new();
        let stopping = CancellationToken::new();
        let done = CancellationToken::new();
        let limiter = ConcurrencyLimiter::new(config.max_concurrency);
        let counters = Arc::new(StatsCounters::default());

        let control = ControlLoop {
            callback: Arc::new(callback),
            config: config.clone(),
            ctx: ctx.clone(),
            stopping: stopping.clone(),
            submit_rx,
            flush_tx,
            flush_rx,
            current: Batch::new(1),
            next_batch_id: 1,
            limiter: limiter.clone(),
            tracker: TaskTracker::new(),
            counters: counters.clone(),
        };
        runtime.spawn(control.run(done.clone()));

        info!(
            max_size = config.max_size,
            flush_interval_ms = config.flush_interval.as_millis() as u64,
            max_concurrency = config.max_concurrency,
            "Coordinator started"
        );

        Ok(Self {
            config,
            submit_tx,
            ctx,
            stopping,
            done,
            limiter,
            counters,
        })
    }

    /// Hand `job` to the control loop, returning a handle to its batch.
    ///
    /// Waits while the control loop is busy, e.g. blocked on a saturated
    /// concurrency limit. Fails with [`MicrobatchError::Canceled`] if `token`
    /// fires first, or if the coordinator is stopping or stopped.
    #[instrument(level = "trace", skip_all)]
    pub async fn submit(&self, token: &CancellationToken, job: J) -> Result<JobHandle<J>>
    where
        J: Clone,
    {
        if token.is_cancelled() || self.ctx.is_cancelled() {
            return Err(MicrobatchError::Canceled);
        }

        let (reply, mut batch_rx) = oneshot::channel();
        let request = SubmitRequest {
            job: job.clone(),
            reply,
        };

        tokio::select! {
            biased;
            _ = self.rejected(token) => return Err(MicrobatchError::Canceled),
            sent = self.submit_tx.send(request) => {
                if sent.is_err() {
                    return Err(MicrobatchError::Canceled);
                }
            }
        }

        let batch = tokio::select! {
            biased;
            batch = &mut batch_rx => batch.map_err(|_| MicrobatchError::Canceled)?,
            _ = self.rejected(token) => {
                // the control loop may have taken the job already
                batch_rx.close();
                batch_rx.try_recv().map_err(|_| MicrobatchError::Canceled)?
            }
        };

        trace!(batch_id = batch.id(), "Job accepted");
        Ok(JobHandle::new(job, batch))
    }

    /// Resolves once a submission can no longer be accepted
    async fn rejected(&self, token: &CancellationToken) {
        tokio::select! {
            _ = token.cancelled() => {}
            _ = self.ctx.cancelled() => {}
            _ = self.stopping.cancelled() => {}
        }
    }
}

impl<J> Coordinator<J> {
    /// Stop accepting jobs, flush the pending batch and wait for every
    /// outstanding batch to complete.
    ///
    /// If `token` fires first, the coordinator is hard-stopped as if by
    /// [`close`](Self::close), and [`MicrobatchError::Canceled`] is returned.
    #[instrument(skip_all)]
    pub async fn shutdown(&self, token: &CancellationToken) -> Result<()> {
        self.shutdown_until(token.cancelled(), MicrobatchError::Canceled)
            .await
    }

    /// Like [`shutdown`](Self::shutdown), forcing a hard stop and returning
    /// [`MicrobatchError::DeadlineExceeded`] once `timeout` elapses
    #[instrument(skip(self))]
    pub async fn shutdown_timeout(&self, timeout: Duration) -> Result<()> {
        self.shutdown_until(tokio::time::sleep(timeout), MicrobatchError::DeadlineExceeded)
            .await
    }

    async fn shutdown_until(
        &self,
        expired: impl Future<Output = ()>,
        expiry_error: MicrobatchError,
    ) -> Result<()> {
        self.request_stop();

        tokio::select! {
            biased;
            _ = self.done.cancelled() => Ok(()),
            _ = expired => {
                // only report the expiry if it is what forced the stop
                let forced = !self.ctx.is_cancelled();
                if forced {
                    warn!("Shutdown interrupted, forcing hard stop");
                }
                self.ctx.cancel();
                self.done.cancelled().await;
                if forced {
                    Err(expiry_error)
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Cancel immediately, then wait for every dispatched batch to finish.
    ///
    /// In-flight callbacks see their token cancelled, and the pending batch is
    /// still dispatched, with an already-cancelled token. Always returns `Ok`.
    #[instrument(skip_all)]
    pub async fn close(&self) -> Result<()> {
        if !self.ctx.is_cancelled() {
            info!("Hard stop requested");
        }
        self.ctx.cancel();
        self.done.cancelled().await;
        Ok(())
    }

    fn request_stop(&self) {
        if !self.stopping.is_cancelled() {
            info!("Graceful shutdown requested");
        }
        self.stopping.cancel();
    }

    /// Current lifecycle state
    pub fn state(&self) -> CoordinatorState {
        if self.ctx.is_cancelled() || self.done.is_cancelled() {
            CoordinatorState::Stopped
        } else if self.stopping.is_cancelled() {
            CoordinatorState::Draining
        } else {
            CoordinatorState::Accepting
        }
    }

    /// Snapshot of the coordinator's counters
    pub fn stats(&self) -> BatchStats {
        self.counters.snapshot(self.limiter.in_flight())
    }

    /// The validated configuration
    pub fn config(&self) -> &BatchConfig {
        &self.config
    }
}

impl<J> Drop for Coordinator<J> {
    fn drop(&mut self) {
        if !self.done.is_cancelled() {
            debug!("Coordinator dropped while running, requesting graceful stop");
        }
        self.stopping.cancel();
    }
}

/// Sole owner of the accumulating batch
struct ControlLoop<J> {
    callback: Arc<dyn BatchCallback<J>>,
    config: BatchConfig,
    ctx: CancellationToken,
    stopping: CancellationToken,
    submit_rx: mpsc::Receiver<SubmitRequest<J>>,
    flush_tx: mpsc::Sender<u64>,
    flush_rx: mpsc::Receiver<u64>,
    current: Batch<J>,
    next_batch_id: u64,
    limiter: ConcurrencyLimiter,
    /// Dispatch and timer tasks, waited on while draining
    tracker: TaskTracker,
    counters: Arc<StatsCounters>,
}

impl<J: Send + 'static> ControlLoop<J> {
    async fn run(mut self, done: CancellationToken) {
        let _done = done.drop_guard();

        let reason = loop {
            tokio::select! {
                biased;
                _ = self.ctx.cancelled() => break "hard stop",
                _ = self.stopping.cancelled() => break "graceful stop",
                Some(request) = self.submit_rx.recv() => self.accept(request).await,
                Some(batch_id) = self.flush_rx.recv() => {
                    if batch_id == self.current.id() {
                        trace!(batch_id, "Flush interval elapsed");
                        self.flush().await;
                    }
                }
            }
        };

        info!(reason, pending_jobs = self.current.len(), "Draining coordinator");

        self.flush().await;
        self.tracker.close();
        self.tracker.wait().await;
        self.ctx.cancel();

        info!(stats = ?self.counters.snapshot(self.limiter.in_flight()), "Coordinator stopped");
    }

    /// Hand the current batch to the submitter, append its job, then apply
    /// the flush triggers. Nothing here yields before the append.
    async fn accept(&mut self, request: SubmitRequest<J>) {
        let SubmitRequest { job, reply } = request;

        if reply.send(self.current.signal().clone()).is_err() {
            trace!("Submitter gave up before the hand-off, discarding job");
            return;
        }

        self.current.push(job);
        self.counters.record_job();
        metrics::record_job_submitted();

        if self
            .config
            .size_trigger()
            .is_some_and(|max_size| self.current.len() >= max_size)
        {
            self.flush().await;
        } else if self.current.len() == 1 {
            if let Some(interval) = self.config.time_trigger() {
                self.arm_flush_timer(interval);
            }
        }
    }

    /// Start the one-shot timer for the current batch
    fn arm_flush_timer(&self, interval: Duration) {
        let batch = self.current.signal().clone();
        let flush_tx = self.flush_tx.clone();
        let ctx = self.ctx.clone();
        let stopping = self.stopping.clone();

        self.tracker.spawn(async move {
            tokio::select! {
                biased;
                _ = ctx.cancelled() => return,
                _ = stopping.cancelled() => return,
                _ = batch.wait() => return,
                _ = tokio::time::sleep(interval) => {}
            }

            tokio::select! {
                biased;
                _ = ctx.cancelled() => {}
                _ = stopping.cancelled() => {}
                _ = batch.wait() => {}
                _ = flush_tx.send(batch.id()) => {}
            }
        });
    }

    /// Detach the current batch and dispatch it, waiting for a permit first.
    /// An empty batch is left in place.
    async fn flush(&mut self) {
        if self.current.is_empty() {
            return;
        }

        self.next_batch_id += 1;
        let batch = std::mem::replace(&mut self.current, Batch::new(self.next_batch_id));

        if self.limiter.is_saturated() {
            debug!(
                batch_id = batch.id(),
                max_concurrency = ?self.limiter.max_concurrency(),
                "Concurrency limit reached, waiting for a running batch to finish"
            );
        }
        let permit = self.limiter.acquire().await;

        self.counters.record_dispatch();
        let token = self.ctx.child_token();
        self.tracker.spawn(batch.dispatch(
            self.callback.clone(),
            token,
            permit,
            self.counters.clone(),
        ));
    }
}

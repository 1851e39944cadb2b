//! Independent operations demo
//!
//! Many concurrent workers submit unrelated operations. Each batch runs every
//! operation it holds and writes the result back onto the job, where the
//! submitter picks it up once its batch completes.
//!
//! Run with `RUST_LOG=microbatch=debug cargo run --example independent_operations`
//! to watch batches being flushed.

use anyhow::Result;
use microbatch::{BatchConfig, BoxError, Coordinator, JobHandle};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

const NUM_WORKERS: usize = 5;
const OPS_PER_WORKER: usize = 1000;

type Operation = Box<dyn Fn(&CancellationToken) -> std::result::Result<u64, String> + Send + Sync>;

/// A unit of work, shared between the submitter and the batch it lands in
struct Job {
    operation: Operation,
    outcome: Mutex<Option<std::result::Result<u64, String>>>,
}

impl Job {
    fn new(operation: Operation) -> Arc<Self> {
        Arc::new(Self {
            operation,
            outcome: Mutex::new(None),
        })
    }

    fn take_outcome(&self) -> Option<std::result::Result<u64, String>> {
        self.outcome.lock().ok()?.take()
    }
}

/// Tracks how many batches run at once
#[derive(Default)]
struct RunningTracker {
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl RunningTracker {
    fn enter(&self) {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Wait for the job's batch, then check what its operation produced
async fn check_outcome(
    handle: JobHandle<Arc<Job>>,
    token: CancellationToken,
    value: u64,
    succeed: bool,
) -> Result<()> {
    handle.wait(&token).await?;
    let outcome = handle
        .job()
        .take_outcome()
        .ok_or_else(|| anyhow::anyhow!("operation {value} produced no outcome"))?;

    match (succeed, outcome) {
        (true, Ok(result)) if result == value * 3 => Ok(()),
        (false, Err(_)) => Ok(()),
        (_, other) => Err(anyhow::anyhow!("operation {value}: unexpected {other:?}")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("microbatch=info")),
        )
        .init();

    let tracker = Arc::new(RunningTracker::default());
    let operations_run = Arc::new(AtomicUsize::new(0));

    // the defaults run one batch at a time; this workload allows 10
    let coordinator = Arc::new(Coordinator::new(
        BatchConfig::default().with_max_concurrency(10),
        {
            let tracker = tracker.clone();
            move |token: CancellationToken, jobs: Vec<Arc<Job>>| {
                let tracker = tracker.clone();
                async move {
                    tracker.enter();

                    // lets close() return promptly
                    if token.is_cancelled() {
                        tracker.exit();
                        return Err::<(), BoxError>("batch cancelled before it started".into());
                    }

                    // in practice this might be a single call to a remote service
                    for job in &jobs {
                        let outcome = (job.operation)(&token);
                        if let Ok(mut slot) = job.outcome.lock() {
                            *slot = Some(outcome);
                        }
                    }

                    // simulated load
                    tokio::time::sleep(Duration::from_millis(20)).await;

                    tracker.exit();
                    Ok(())
                }
            }
        },
    )?);

    let token = CancellationToken::new();
    let mut workers = Vec::with_capacity(NUM_WORKERS);

    for worker in 0..NUM_WORKERS {
        let coordinator = coordinator.clone();
        let operations_run = operations_run.clone();
        let token = token.clone();

        workers.push(tokio::spawn(async move {
            let mut waiters = Vec::with_capacity(OPS_PER_WORKER);

            for op in 0..OPS_PER_WORKER {
                let value = (worker * OPS_PER_WORKER + op) as u64;
                let succeed = value % 2 == 0;
                let operations_run = operations_run.clone();

                let job = Job::new(Box::new(move |_token: &CancellationToken| {
                    operations_run.fetch_add(1, Ordering::SeqCst);
                    if succeed {
                        Ok(value * 3)
                    } else {
                        Err(format!("operation {value} failed"))
                    }
                }));

                let handle = coordinator.submit(&token, job).await?;
                let token = token.clone();

                waiters.push(tokio::spawn(check_outcome(handle, token, value, succeed)));
            }

            for waiter in waiters {
                waiter.await??;
            }
            Ok::<_, anyhow::Error>(())
        }));
    }

    for worker in workers {
        worker.await??;
    }

    coordinator.shutdown(&token).await?;

    let stats = coordinator.stats();
    info!(
        operations = operations_run.load(Ordering::SeqCst),
        batches = stats.batches_dispatched,
        peak_concurrent_batches = tracker.peak.load(Ordering::SeqCst),
        "All operations completed"
    );

    println!(
        "{} operations in {} batches, at most {} running at once",
        operations_run.load(Ordering::SeqCst),
        stats.batches_dispatched,
        tracker.peak.load(Ordering::SeqCst)
    );

    Ok(())
}

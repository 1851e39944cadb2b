//! # Microbatch
//!
//! Groups individually submitted jobs into small batches, so the cost of some
//! downstream operation (a remote call, a bulk write) is amortized across many
//! logically independent callers.
//!
//! ## Overview
//!
//! A [`Coordinator`] owns exactly one accumulating batch at a time. Submitters
//! hand their job to a background control loop, which appends it to the
//! current batch and flushes the batch once it is full or once the flush
//! interval has elapsed since its first job. Each flushed batch is passed to a
//! caller-supplied [`BatchCallback`], with the number of simultaneous callback
//! invocations bounded by the configured concurrency.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::{Arc, Mutex};
//! use microbatch::{BatchConfig, BoxError, Coordinator};
//! use tokio_util::sync::CancellationToken;
//!
//! #[derive(Clone, Default)]
//! struct Job {
//!     input: u64,
//!     output: Arc<Mutex<Option<u64>>>,
//! }
//!
//! # async fn example() -> microbatch::Result<()> {
//! let coordinator = Coordinator::new(
//!     BatchConfig::default().with_max_size(8),
//!     |_token: CancellationToken, jobs: Vec<Job>| async move {
//!         for job in &jobs {
//!             *job.output.lock().unwrap() = Some(job.input * 2);
//!         }
//!         Ok::<_, BoxError>(())
//!     },
//! )?;
//!
//! let token = CancellationToken::new();
//! let handle = coordinator.submit(&token, Job { input: 21, ..Default::default() }).await?;
//! handle.wait(&token).await?;
//! assert_eq!(*handle.job().output.lock().unwrap(), Some(42));
//!
//! coordinator.shutdown(&token).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Key Features
//!
//! - **Size and time triggers**: flush when a batch is full, or after a
//!   fixed interval from its first job
//! - **Bounded concurrency**: at most `max_concurrency` callbacks run at once,
//!   and a saturated limiter applies backpressure to submitters
//! - **Two-phase shutdown**: graceful drain via [`Coordinator::shutdown`],
//!   forced cancellation via [`Coordinator::close`], neither of which leaks
//!   dispatch tasks
//! - **Shared outcomes**: every job in a batch observes the callback's result
//!   through [`JobHandle::wait`]
//!
//! ## Modules
//!
//! - [`batch`]: the coordinator, its configuration, and supporting types

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

use std::sync::Arc;
use thiserror::Error;

/// Result type for microbatch operations
pub type Result<T> = std::result::Result<T, MicrobatchError>;

/// Error type returned by [`BatchCallback`] implementations
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Main error type for microbatch operations
#[derive(Error, Debug, Clone)]
pub enum MicrobatchError {
    /// Construction rejected the supplied configuration
    #[error("Configuration error: {0}")]
    Config(#[from] batch::ConfigError),

    /// The caller's token fired, or the coordinator is stopping or stopped
    #[error("Operation canceled")]
    Canceled,

    /// A caller-supplied deadline elapsed
    #[error("Deadline exceeded")]
    DeadlineExceeded,

    /// The batch callback returned an error, shared by every job in the batch
    #[error("Batch callback failed: {0}")]
    Callback(Arc<dyn std::error::Error + Send + Sync + 'static>),

    /// The batch callback panicked before returning
    #[error("Batch callback panicked")]
    CallbackPanicked,
}

impl MicrobatchError {
    /// Whether this error belongs to the cancellation class
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Canceled | Self::DeadlineExceeded)
    }

    /// The error returned by the batch callback, if this is a callback failure
    pub fn callback_error(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        match self {
            Self::Callback(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<BoxError> for MicrobatchError {
    fn from(err: BoxError) -> Self {
        MicrobatchError::Callback(Arc::from(err))
    }
}

/// Batch coordination: configuration, callbacks, handles and the coordinator
pub mod batch;

pub use batch::{
    BatchCallback, BatchConfig, BatchStats, ConfigError, Coordinator, CoordinatorState, JobHandle,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_class() {
        assert!(MicrobatchError::Canceled.is_cancellation());
        assert!(MicrobatchError::DeadlineExceeded.is_cancellation());
        assert!(!MicrobatchError::CallbackPanicked.is_cancellation());
    }

    #[test]
    fn test_callback_error_from_box() {
        let boxed: BoxError = "remote call failed".into();
        let err = MicrobatchError::from(boxed);

        assert!(!err.is_cancellation());
        assert_eq!(err.to_string(), "Batch callback failed: remote call failed");
        assert_eq!(
            err.callback_error().map(|e| e.to_string()),
            Some("remote call failed".to_string())
        );
    }
}

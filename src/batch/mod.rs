pub mod callback;
pub mod coordinator;
pub mod handle;
pub mod metrics;
pub mod types;

mod limiter;
mod state;

pub use callback::*;
pub use coordinator::*;
pub use handle::*;
pub use metrics::export_metrics;
pub use types::*;

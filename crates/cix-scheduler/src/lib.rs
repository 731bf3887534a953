//! Worker pools for cix.
//!
//! The daemon's main loop never blocks; preprocess jobs and project restores
//! run on bounded rayon pools built here. Pools expose how many workers are
//! busy so the job dispatcher can compute its local slot budget.

mod scheduler;
mod task;

pub use scheduler::{PoolKind, WorkerPools, WorkerPoolsConfig};
pub use task::BlockingTask;

pub use tokio_util::sync::CancellationToken;

/// Marker for cooperative cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

/// Terminal states of a spawned task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskError {
    Cancelled,
    Panicked,
}

impl From<Cancelled> for TaskError {
    fn from(_: Cancelled) -> Self {
        TaskError::Cancelled
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskError::Cancelled => f.write_str("task cancelled"),
            TaskError::Panicked => f.write_str("task panicked"),
        }
    }
}

impl std::error::Error for TaskError {}

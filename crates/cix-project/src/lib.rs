//! Per-project state: the symbol database, source registry, in-flight job
//! bookkeeping, crash accounting and persistence.
//!
//! A `Project` is a passive state machine driven by the daemon's event loop.
//! Operations that require scheduling (dispatching an indexer, re-running
//! the preprocessor for a dirty cascade) return effects for the caller to
//! act on rather than reaching into the scheduler.

mod persist;
mod project;

pub use persist::{
    database_file, decode_project_path, delete_database, encode_project_path, load_database,
    probe_database, save_database, ProjectDatabase, PROJECT_SCHEMA_VERSION,
};
pub use project::{
    Admission, IndexFlags, JobOutcome, PendingJob, Project, ProjectState, DEFAULT_MAX_CRASH_COUNT,
};

/// Errors produced by project persistence.
#[derive(Debug, thiserror::Error)]
pub enum ProjectError {
    #[error("storage error: {0}")]
    Storage(#[from] cix_storage::StorageError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

//! Shared, dependency-minimized core types used across cix.

pub mod id;
pub mod location;
pub mod pattern;
pub mod source;

/// The current cix version.
///
/// Used for on-disk artifact compatibility checks (file ids, project
/// databases).
pub const CIX_VERSION: &str = env!("CARGO_PKG_VERSION");

pub use id::{FileId, JobId};
pub use location::Location;
pub use pattern::Match;
pub use source::{Cpp, Source, SourceKey, SourceLanguage};

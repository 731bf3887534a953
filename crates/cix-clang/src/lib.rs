//! The narrow façade between cix and the C/C++ toolchain.
//!
//! The daemon schedules; it never parses. Everything that touches compiler
//! internals goes through three seams:
//!
//! - [`Preprocessor`]: Source → [`Cpp`] (implemented here by shelling out to
//!   the source's own compiler with `-E`),
//! - [`UnitIndexer`]: Source + Cpp → [`IndexData`] (the libclang-backed
//!   implementation lives in the indexer binary behind its `libclang`
//!   feature),
//! - [`CompletionEngine`]: parsed unit + position → completion candidates.
//!
//! The [`testing`] module provides scriptable implementations for the test
//! suites of the crates that consume these seams.

pub mod testing;

mod preprocess;

use std::path::{Path, PathBuf};

use cix_core::{Cpp, Source};
use cix_index::IndexData;

pub use preprocess::CommandPreprocessor;

#[derive(Debug, thiserror::Error)]
pub enum FacadeError {
    #[error("facade not available: {0}")]
    Unavailable(&'static str),

    #[error("preprocess failed: {0}")]
    Preprocess(String),

    #[error("parse failed: {0}")]
    Parse(String),
}

pub trait Preprocessor: Send + Sync {
    fn preprocess(&self, source: &Source) -> Result<Cpp, FacadeError>;
}

/// Answer to one visit-file question.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VisitAnswer {
    pub file_id: cix_core::FileId,
    pub resolved: PathBuf,
    pub visit: bool,
}

/// The daemon-side arbiter of which files an indexer run may descend into.
pub trait FileVisitor {
    fn should_visit(&mut self, file: &Path) -> VisitAnswer;
}

pub trait UnitIndexer: Send + Sync {
    /// Index one preprocessed translation unit, consulting `visits` before
    /// descending into each file.
    fn index(
        &self,
        source: &Source,
        cpp: &Cpp,
        visits: &mut dyn FileVisitor,
    ) -> Result<IndexData, FacadeError>;
}

/// One completion candidate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub signature: String,
    pub priority: i32,
}

/// Owns parsing for the completion thread. The unit type is opaque to the
/// daemon; the engine decides what a live parse looks like.
pub trait CompletionEngine: Send + 'static {
    type Unit: Send + 'static;

    fn parse(&self, source: &Source, unsaved: Option<&str>) -> Result<Self::Unit, FacadeError>;

    fn reparse(&self, unit: &mut Self::Unit, unsaved: Option<&str>) -> Result<(), FacadeError>;

    fn complete(
        &self,
        unit: &mut Self::Unit,
        line: u32,
        column: u32,
        unsaved: Option<&str>,
    ) -> Result<Vec<Completion>, FacadeError>;
}

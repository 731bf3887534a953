//! The result of one indexer invocation.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use cix_core::{source, FileId, JobId, SourceKey};

use crate::{DependencyMap, FixItMap, SymbolMap, SymbolNameMap, UsrMap};

/// Everything one indexer run over one translation unit produced.
///
/// A crashed run still yields an `IndexData`, empty except for `key` and
/// `message`, so the owning project can account for the crash and promote
/// any queued re-run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexData {
    pub job_id: JobId,
    /// `(source file id, build root id)` key of the translation unit.
    pub key: SourceKey,
    pub parse_duration_ms: u64,
    pub symbols: SymbolMap,
    pub symbol_names: SymbolNameMap,
    pub usrs: UsrMap,
    pub dependencies: DependencyMap,
    pub fix_its: FixItMap,
    /// Human-readable output: dump text, or a crash note.
    pub message: String,
    /// Files the visit-file protocol admitted (`true`) or blocked (`false`)
    /// for this job.
    pub visited: BTreeMap<FileId, bool>,
}

impl IndexData {
    pub fn file_id(&self) -> FileId {
        source::decode_key(self.key).0
    }

    pub fn visited_files(&self) -> BTreeSet<FileId> {
        self.visited
            .iter()
            .filter_map(|(&file, &visited)| visited.then_some(file))
            .collect()
    }

    pub fn blocked_files(&self) -> BTreeSet<FileId> {
        self.visited
            .iter()
            .filter_map(|(&file, &visited)| (!visited).then_some(file))
            .collect()
    }
}

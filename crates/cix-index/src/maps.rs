//! Map aliases shared by the index data model and the per-project store.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use cix_core::{FileId, Location};

use crate::SymbolInfo;

/// Location → occurrence, ordered by location for per-file range scans.
pub type SymbolMap = BTreeMap<Location, SymbolInfo>;

/// Fully-qualified name → every location carrying that name.
pub type SymbolNameMap = BTreeMap<String, BTreeSet<Location>>;

/// USR string → locations.
pub type UsrMap = BTreeMap<String, BTreeSet<Location>>;

/// Reverse dependency edges: `map[y]` is the set of files whose translation
/// depends on `y` (including `y` itself for translation-unit roots). The
/// reverse orientation makes dirty cascades a straight lookup.
pub type DependencyMap = BTreeMap<FileId, BTreeSet<FileId>>;

/// A compiler-suggested edit.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FixIt {
    pub start: u32,
    pub end: u32,
    pub text: String,
}

/// Per-file ordered fix-its.
pub type FixItMap = BTreeMap<FileId, BTreeSet<FixIt>>;

/// Per-file metadata recorded at merge time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Wall-clock milliseconds since the epoch of the last merge that
    /// visited this file.
    pub last_indexed_ms: u64,
}

pub type FilesMap = BTreeMap<FileId, FileInfo>;

//! The cix symbol data model.
//!
//! An indexer run over one translation unit produces an [`IndexData`]; a
//! project's [`SymbolStore`] merges those monotonically, invalidates
//! per-file slices on dirty, and answers the read side of every query.

mod data;
mod maps;
mod store;
mod symbol;

pub use data::IndexData;
pub use maps::{
    DependencyMap, FileInfo, FilesMap, FixIt, FixItMap, SymbolMap, SymbolNameMap, UsrMap,
};
pub use store::{DependencyMode, SortFlags, SortedSymbol, SymbolStore};
pub use symbol::{SymbolData, SymbolInfo, SymbolKind, SymbolTag};

//! The mergeable per-project symbol database.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use cix_core::{FileId, Location};

use crate::{
    DependencyMap, FileInfo, FilesMap, FixIt, FixItMap, IndexData, SymbolInfo, SymbolMap,
    SymbolNameMap, UsrMap,
};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DependencyMode {
    /// Files whose translation depends on the argument. Cheap: one row.
    DependsOnArg,
    /// Files the argument's translation depends on. Slow: full scan.
    ArgDependsOn,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SortFlags {
    pub declaration_only: bool,
    pub reverse: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SortedSymbol {
    pub location: Location,
    pub is_definition: bool,
}

/// Symbols, names, cross-references, dependencies and fix-its for one
/// project.
///
/// Merging is monotonic: nothing is removed except by an explicit
/// [`dirty`](SymbolStore::dirty) step. All mutation happens on the owning
/// event-loop thread.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolStore {
    pub symbols: SymbolMap,
    pub symbol_names: SymbolNameMap,
    pub usrs: UsrMap,
    pub dependencies: DependencyMap,
    pub fix_its: FixItMap,
    pub files: FilesMap,
}

impl SymbolStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Integrate the result of one indexer run.
    ///
    /// Symbols are united record by record; name and USR buckets are
    /// unioned; the dependency row for the unit's root file is replaced
    /// while other rows grow; fix-its for visited files are replaced;
    /// visited files are stamped in `files`.
    pub fn merge(&mut self, data: &IndexData, now_ms: u64) {
        for (&location, incoming) in &data.symbols {
            self.symbols
                .entry(location)
                .or_default()
                .unite(incoming);
        }

        // Re-assert symmetric cross-linking for everything this run touched:
        // each reference edge implies the referring location targets us, and
        // each target implies we are referenced back.
        for (&location, incoming) in &data.symbols {
            for &reference in incoming.references() {
                if let Some(referrer) = self.symbols.get_mut(&reference) {
                    referrer.add_target(location);
                }
            }
            for &target in incoming.targets() {
                if let Some(info) = self.symbols.get_mut(&target) {
                    info.add_reference(location);
                }
            }
        }

        for (name, locations) in &data.symbol_names {
            self.symbol_names
                .entry(name.clone())
                .or_default()
                .extend(locations.iter().copied());
        }
        for (usr, locations) in &data.usrs {
            self.usrs
                .entry(usr.clone())
                .or_default()
                .extend(locations.iter().copied());
        }

        let root = data.file_id();
        for (&file, dependents) in &data.dependencies {
            if file == root {
                self.dependencies.insert(file, dependents.clone());
            } else {
                self.dependencies
                    .entry(file)
                    .or_default()
                    .extend(dependents.iter().copied());
            }
        }

        for (&file, fix_its) in &data.fix_its {
            self.fix_its.insert(file, fix_its.clone());
        }

        for file in data.visited_files() {
            self.files.insert(
                file,
                FileInfo {
                    last_indexed_ms: now_ms,
                },
            );
        }
    }

    /// Drop every trace of the given files: their symbols, their name and
    /// USR bucket entries, every edge pointing into them, and their
    /// fix-its. Dependency rows survive so the caller can still compute the
    /// reindex cascade; merge refreshes them.
    ///
    /// Returns true iff anything was removed.
    pub fn dirty(&mut self, dirty: &BTreeSet<FileId>) -> bool {
        if dirty.is_empty() {
            return false;
        }
        let mut changed = false;

        let before = self.symbols.len();
        self.symbols
            .retain(|location, _| !dirty.contains(&location.file_id()));
        changed |= self.symbols.len() != before;

        for info in self.symbols.values_mut() {
            changed |= info.dirty(dirty);
        }

        self.symbol_names.retain(|_, bucket| {
            let before = bucket.len();
            bucket.retain(|location| !dirty.contains(&location.file_id()));
            changed |= bucket.len() != before;
            !bucket.is_empty()
        });
        self.usrs.retain(|_, bucket| {
            let before = bucket.len();
            bucket.retain(|location| !dirty.contains(&location.file_id()));
            changed |= bucket.len() != before;
            !bucket.is_empty()
        });

        for file in dirty {
            changed |= self.fix_its.remove(file).is_some();
            changed |= self.files.remove(file).is_some();
        }

        changed
    }

    /// Locations of `name`, optionally restricted to one file.
    pub fn locations(&self, name: &str, file: Option<FileId>) -> BTreeSet<Location> {
        let Some(bucket) = self.symbol_names.get(name) else {
            return BTreeSet::new();
        };
        match file {
            None => bucket.clone(),
            Some(file) => bucket
                .iter()
                .filter(|location| location.file_id() == file)
                .copied()
                .collect(),
        }
    }

    /// All symbols in one file, in location order.
    pub fn symbols_in_file(&self, file: FileId) -> SymbolMap {
        self.symbols
            .range(Location::file_start(file)..=Location::file_end(file))
            .map(|(&location, info)| (location, info.clone()))
            .collect()
    }

    pub fn dependencies_of(&self, file: FileId, mode: DependencyMode) -> BTreeSet<FileId> {
        match mode {
            DependencyMode::DependsOnArg => {
                self.dependencies.get(&file).cloned().unwrap_or_default()
            }
            DependencyMode::ArgDependsOn => self
                .dependencies
                .iter()
                .filter(|(_, dependents)| dependents.contains(&file))
                .map(|(&dependency, _)| dependency)
                .collect(),
        }
    }

    /// Transitive closure of files depending on any file in `roots`.
    pub fn dependents_of(&self, roots: &BTreeSet<FileId>) -> BTreeSet<FileId> {
        let mut out: BTreeSet<FileId> = BTreeSet::new();
        let mut queue: Vec<FileId> = roots.iter().copied().collect();
        while let Some(file) = queue.pop() {
            if let Some(dependents) = self.dependencies.get(&file) {
                for &dependent in dependents {
                    if dependent != file && out.insert(dependent) {
                        queue.push(dependent);
                    }
                }
            }
        }
        out
    }

    pub fn fix_its(&self, file: FileId) -> Option<&BTreeSet<FixIt>> {
        self.fix_its.get(&file)
    }

    pub fn is_indexed(&self, file: FileId) -> bool {
        self.files.contains_key(&file)
    }

    /// Order `locations` for presentation: definitions first, then by
    /// location; `declaration_only` drops definitions when a declaration for
    /// the set exists; `reverse` flips the final order.
    pub fn sort_locations(
        &self,
        locations: &BTreeSet<Location>,
        flags: SortFlags,
    ) -> Vec<SortedSymbol> {
        let mut out: Vec<SortedSymbol> = locations
            .iter()
            .map(|&location| SortedSymbol {
                location,
                is_definition: self
                    .symbols
                    .get(&location)
                    .map(SymbolInfo::is_definition)
                    .unwrap_or(false),
            })
            .collect();

        out.sort_by(|a, b| {
            b.is_definition
                .cmp(&a.is_definition)
                .then(a.location.cmp(&b.location))
        });

        if flags.declaration_only && out.iter().any(|s| !s.is_definition) {
            out.retain(|s| !s.is_definition);
        }
        if flags.reverse {
            out.reverse();
        }
        out
    }
}

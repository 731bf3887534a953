//! One symbol occurrence and its copy-on-write payload.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use cix_core::{FileId, Location};

use crate::SymbolMap;

/// The fixed taxonomy of cursor kinds the indexer reports.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SymbolKind {
    #[default]
    Invalid,
    Function,
    Class,
    Constructor,
    Destructor,
    Variable,
    Member,
    Argument,
    EnumConstant,
    Declaration,
    Reference,
    Include,
}

impl SymbolKind {
    pub fn is_class(self) -> bool {
        matches!(self, SymbolKind::Class)
    }
}

/// The `definition`/`enumValue` alternative, discriminated properly instead
/// of reading a union arm by kind.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SymbolTag {
    Definition(bool),
    /// Only produced for [`SymbolKind::EnumConstant`].
    EnumValue(i64),
}

impl Default for SymbolTag {
    fn default() -> Self {
        SymbolTag::Definition(false)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolData {
    /// Byte length of the bare identifier (`foo` => 3). Zero means "no
    /// symbol observed here yet"; such a record only carries edges.
    pub symbol_length: u16,
    /// Fully qualified, e.g. `Foo::Bar::baz`.
    pub symbol_name: String,
    pub kind: SymbolKind,
    /// Raw semantic type tag as reported by the parser facade.
    pub type_kind: u16,
    pub tag: SymbolTag,
    /// Byte offsets in the file; -1 when unknown.
    pub start: i32,
    pub end: i32,
    /// Outgoing edges: what this cursor refers to.
    pub targets: BTreeSet<Location>,
    /// Incoming edges: cursors referring to this one.
    pub references: BTreeSet<Location>,
}

impl SymbolData {
    /// An empty record with unset (-1) byte range.
    pub fn new() -> Self {
        Self {
            start: -1,
            end: -1,
            ..Self::default()
        }
    }
}

/// A symbol occurrence at a [`Location`].
///
/// The payload is shared; many locations can point at the same record until
/// one of them is mutated, at which point the mutator clones
/// (`Arc::make_mut`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SymbolInfo {
    data: Arc<SymbolData>,
}

impl Default for SymbolInfo {
    fn default() -> Self {
        Self {
            data: Arc::new(SymbolData::new()),
        }
    }
}

impl PartialEq for SymbolInfo {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.data, &other.data) || self.data == other.data
    }
}

impl Eq for SymbolInfo {}

impl SymbolInfo {
    pub fn new(data: SymbolData) -> Self {
        Self {
            data: Arc::new(data),
        }
    }

    pub fn data(&self) -> &SymbolData {
        &self.data
    }

    fn detach(&mut self) -> &mut SymbolData {
        Arc::make_mut(&mut self.data)
    }

    pub fn symbol_name(&self) -> &str {
        &self.data.symbol_name
    }

    pub fn kind(&self) -> SymbolKind {
        self.data.kind
    }

    pub fn targets(&self) -> &BTreeSet<Location> {
        &self.data.targets
    }

    pub fn references(&self) -> &BTreeSet<Location> {
        &self.data.references
    }

    pub fn is_definition(&self) -> bool {
        self.data.kind == SymbolKind::EnumConstant
            || matches!(self.data.tag, SymbolTag::Definition(true))
    }

    pub fn is_empty(&self) -> bool {
        let d = &*self.data;
        d.symbol_length == 0
            && d.targets.is_empty()
            && d.references.is_empty()
            && d.start == -1
            && d.end == -1
    }

    pub fn is_valid(&self) -> bool {
        !self.is_empty()
    }

    pub fn add_target(&mut self, location: Location) -> bool {
        if self.data.targets.contains(&location) {
            return false;
        }
        self.detach().targets.insert(location);
        true
    }

    pub fn add_reference(&mut self, location: Location) -> bool {
        if self.data.references.contains(&location) {
            return false;
        }
        self.detach().references.insert(location);
        true
    }

    /// Union `other` into `self`.
    ///
    /// Edge sets are set-unioned; a side with no position inherits the
    /// other's; a side with no observed symbol inherits name, kind, type and
    /// tag. Returns true iff the receiver actually changed.
    pub fn unite(&mut self, other: &SymbolInfo) -> bool {
        if other.is_empty() {
            return false;
        }
        if self.is_empty() {
            self.data = Arc::clone(&other.data);
            return true;
        }

        let mut changed = false;
        let theirs = &*other.data;

        if self.data.targets.is_empty() && !theirs.targets.is_empty() {
            self.detach().targets = theirs.targets.clone();
            changed = true;
        } else if !theirs.targets.is_empty() {
            let missing: Vec<Location> = theirs
                .targets
                .iter()
                .filter(|t| !self.data.targets.contains(t))
                .copied()
                .collect();
            if !missing.is_empty() {
                self.detach().targets.extend(missing);
                changed = true;
            }
        }

        if self.data.start == -1
            && self.data.end == -1
            && theirs.start != -1
            && theirs.end != -1
        {
            let mine = self.detach();
            mine.start = theirs.start;
            mine.end = theirs.end;
            changed = true;
        }

        if self.data.symbol_length == 0 && theirs.symbol_length != 0 {
            let mine = self.detach();
            mine.symbol_length = theirs.symbol_length;
            mine.symbol_name = theirs.symbol_name.clone();
            mine.kind = theirs.kind;
            mine.type_kind = theirs.type_kind;
            mine.tag = theirs.tag;
            changed = true;
        }

        if self.data.references.is_empty() && !theirs.references.is_empty() {
            self.detach().references = theirs.references.clone();
            changed = true;
        } else if !theirs.references.is_empty() {
            let missing: Vec<Location> = theirs
                .references
                .iter()
                .filter(|r| !self.data.references.contains(r))
                .copied()
                .collect();
            if !missing.is_empty() {
                self.detach().references.extend(missing);
                changed = true;
            }
        }

        changed
    }

    /// Drop every edge pointing into `dirty`. Returns true iff anything was
    /// removed.
    pub fn dirty(&mut self, dirty: &BTreeSet<FileId>) -> bool {
        let has_dirty_edge = self
            .data
            .targets
            .iter()
            .chain(self.data.references.iter())
            .any(|loc| dirty.contains(&loc.file_id()));
        if !has_dirty_edge {
            return false;
        }
        let mine = self.detach();
        mine.targets.retain(|loc| !dirty.contains(&loc.file_id()));
        mine.references
            .retain(|loc| !dirty.contains(&loc.file_id()));
        true
    }

    /// Ranking used by [`best_target`](SymbolInfo::best_target): definitions
    /// beat declarations, everything beats an invalid record.
    fn target_rank(target: &SymbolInfo) -> i32 {
        if target.is_empty() {
            return -1;
        }
        if target.is_definition() {
            2
        } else {
            1
        }
    }

    /// Resolve this cursor to its preferred definition.
    ///
    /// Definitions are preferred over declarations; when `errors` is given,
    /// targets present in the error map only win if nothing else does; ties
    /// break by location order.
    pub fn best_target(
        &self,
        map: &SymbolMap,
        errors: Option<&SymbolMap>,
    ) -> Option<(Location, SymbolInfo)> {
        let mut best: Option<(Location, &SymbolInfo, i32, bool)> = None;
        for &target in &self.data.targets {
            let Some(info) = map.get(&target) else {
                continue;
            };
            let is_error = errors.is_some_and(|e| e.contains_key(&target));
            let rank = Self::target_rank(info);
            let better = match &best {
                None => true,
                Some((best_loc, _, best_rank, best_is_error)) => {
                    // A non-error target always beats an error one.
                    (*best_is_error && !is_error)
                        || (*best_is_error == is_error
                            && (rank > *best_rank
                                || (rank == *best_rank && target < *best_loc)))
                }
            };
            if better {
                best = Some((target, info, rank, is_error));
            }
        }
        best.map(|(loc, info, _, _)| (loc, info.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(name: &str, definition: bool) -> SymbolInfo {
        SymbolInfo::new(SymbolData {
            symbol_length: name.len() as u16,
            symbol_name: name.to_string(),
            kind: SymbolKind::Function,
            tag: SymbolTag::Definition(definition),
            start: 0,
            end: name.len() as i32,
            ..SymbolData::new()
        })
    }

    fn loc(file: u32, line: u32, col: u32) -> Location {
        Location::new(FileId::from_raw(file), line, col)
    }

    #[test]
    fn unite_into_empty_shares_the_payload() {
        let mut lhs = SymbolInfo::default();
        let rhs = info("foo", true);
        assert!(lhs.unite(&rhs));
        assert!(Arc::ptr_eq(&lhs.data, &rhs.data));
    }

    #[test]
    fn unite_inherits_name_kind_and_tag() {
        let mut lhs = SymbolInfo::default();
        lhs.add_reference(loc(1, 2, 3));
        let rhs = info("foo", true);

        assert!(lhs.unite(&rhs));
        assert_eq!(lhs.symbol_name(), "foo");
        assert_eq!(lhs.kind(), SymbolKind::Function);
        assert!(lhs.is_definition());
        // The pre-existing reference survives.
        assert!(lhs.references().contains(&loc(1, 2, 3)));
    }

    #[test]
    fn unite_reports_no_change_on_identical_input() {
        let mut lhs = info("foo", true);
        let rhs = lhs.clone();
        assert!(!lhs.unite(&rhs));
    }

    #[test]
    fn mutation_does_not_leak_into_shared_copies() {
        let original = info("foo", false);
        let mut copy = original.clone();
        copy.add_target(loc(2, 1, 1));

        assert!(original.targets().is_empty());
        assert!(copy.targets().contains(&loc(2, 1, 1)));
    }

    #[test]
    fn dirty_strips_edges_into_the_dirty_set() {
        let mut subject = info("foo", false);
        subject.add_target(loc(1, 1, 1));
        subject.add_target(loc(2, 1, 1));
        subject.add_reference(loc(1, 5, 5));

        let dirty: BTreeSet<FileId> = [FileId::from_raw(1)].into_iter().collect();
        assert!(subject.dirty(&dirty));
        assert!(subject.targets().contains(&loc(2, 1, 1)));
        assert!(!subject.targets().contains(&loc(1, 1, 1)));
        assert!(subject.references().is_empty());

        assert!(!subject.dirty(&dirty));
    }

    #[test]
    fn enum_constants_count_as_definitions() {
        let subject = SymbolInfo::new(SymbolData {
            symbol_length: 1,
            symbol_name: "A".into(),
            kind: SymbolKind::EnumConstant,
            tag: SymbolTag::EnumValue(4),
            start: 0,
            end: 1,
            ..SymbolData::new()
        });
        assert!(subject.is_definition());
    }

    #[test]
    fn best_target_prefers_definitions_then_location_order() {
        let decl = loc(1, 1, 1);
        let def = loc(1, 10, 1);
        let mut map = SymbolMap::new();
        map.insert(decl, info("foo", false));
        map.insert(def, info("foo", true));

        let mut subject = SymbolInfo::default();
        subject.add_target(decl);
        subject.add_target(def);

        let (best, _) = subject.best_target(&map, None).unwrap();
        assert_eq!(best, def);
    }

    #[test]
    fn best_target_avoids_error_results_when_possible() {
        let good = loc(1, 10, 1);
        let bad = loc(1, 1, 1);
        let mut map = SymbolMap::new();
        map.insert(good, info("foo", false));
        map.insert(bad, info("foo", true));
        let mut errors = SymbolMap::new();
        errors.insert(bad, info("foo", true));

        let mut subject = SymbolInfo::default();
        subject.add_target(good);
        subject.add_target(bad);

        let (best, _) = subject.best_target(&map, Some(&errors)).unwrap();
        assert_eq!(best, good);
    }
}

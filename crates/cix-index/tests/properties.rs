//! Property tests for the symbol store's merge/dirty invariants.

use std::collections::BTreeSet;

use proptest::prelude::*;

use cix_core::{source::encode_key, FileId, Location};
use cix_index::{
    IndexData, SymbolData, SymbolInfo, SymbolKind, SymbolStore, SymbolTag,
};

const FILES: u32 = 4;
const LINES: u32 = 6;

fn arb_location() -> impl Strategy<Value = Location> {
    (1..=FILES, 1..=LINES, 1..=4u32)
        .prop_map(|(file, line, col)| Location::new(FileId::from_raw(file), line, col))
}

fn arb_name() -> impl Strategy<Value = String> {
    prop_oneof![Just("foo"), Just("bar"), Just("Baz::qux")]
        .prop_map(str::to_string)
}

#[derive(Clone, Debug)]
struct Occurrence {
    location: Location,
    name: String,
    definition: bool,
    targets: Vec<Location>,
    references: Vec<Location>,
}

fn arb_occurrence() -> impl Strategy<Value = Occurrence> {
    (
        arb_location(),
        arb_name(),
        any::<bool>(),
        prop::collection::vec(arb_location(), 0..3),
        prop::collection::vec(arb_location(), 0..3),
    )
        .prop_map(|(location, name, definition, targets, references)| Occurrence {
            location,
            name,
            definition,
            targets,
            references,
        })
}

/// Build an `IndexData` the way an indexer run does: for every edge both
/// endpoint records exist in the same batch, the far side as a stub record
/// carrying only the back edge.
fn build_index_data(occurrences: &[Occurrence]) -> IndexData {
    let mut data = IndexData {
        key: encode_key(FileId::from_raw(1), FileId::from_raw(1)),
        ..IndexData::default()
    };
    for occ in occurrences {
        let info = SymbolInfo::new(SymbolData {
            symbol_length: occ.name.len() as u16,
            symbol_name: occ.name.clone(),
            kind: SymbolKind::Function,
            tag: SymbolTag::Definition(occ.definition),
            start: 0,
            end: occ.name.len() as i32,
            targets: occ.targets.iter().copied().collect(),
            references: occ.references.iter().copied().collect(),
            ..SymbolData::new()
        });
        data.symbols.entry(occ.location).or_default().unite(&info);
        data.symbol_names
            .entry(occ.name.clone())
            .or_default()
            .insert(occ.location);
    }

    // Edge closure: stub records for far endpoints.
    let edges: Vec<(Location, Vec<Location>, Vec<Location>)> = data
        .symbols
        .iter()
        .map(|(&location, info)| {
            (
                location,
                info.targets().iter().copied().collect(),
                info.references().iter().copied().collect(),
            )
        })
        .collect();
    for (location, targets, references) in edges {
        for target in targets {
            data.symbols.entry(target).or_default().add_reference(location);
        }
        for reference in references {
            data.symbols.entry(reference).or_default().add_target(location);
        }
    }
    data
}

fn assert_symmetric_cross_links(store: &SymbolStore) {
    for (&location, info) in &store.symbols {
        for target in info.targets() {
            if let Some(target_info) = store.symbols.get(target) {
                assert!(
                    target_info.references().contains(&location),
                    "{location:?} targets {target:?} but is not referenced back"
                );
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Invariant 1: after any sequence of merges, every target edge whose
    /// endpoint exists has the symmetric reference edge.
    #[test]
    fn merges_keep_cross_links_symmetric(
        batches in prop::collection::vec(prop::collection::vec(arb_occurrence(), 1..8), 1..4)
    ) {
        let mut store = SymbolStore::new();
        for (i, batch) in batches.iter().enumerate() {
            store.merge(&build_index_data(batch), i as u64);
        }
        assert_symmetric_cross_links(&store);
    }

    /// Invariant 2: after `dirty(D)` no location in `D` survives anywhere.
    #[test]
    fn dirty_removes_everything(
        batch in prop::collection::vec(arb_occurrence(), 1..12),
        dirty_files in prop::collection::btree_set(1..=FILES, 1..=2)
    ) {
        let mut store = SymbolStore::new();
        store.merge(&build_index_data(&batch), 0);

        let dirty: BTreeSet<FileId> =
            dirty_files.into_iter().map(FileId::from_raw).collect();
        store.dirty(&dirty);

        for location in store.symbols.keys() {
            prop_assert!(!dirty.contains(&location.file_id()));
        }
        for info in store.symbols.values() {
            for edge in info.targets().iter().chain(info.references()) {
                prop_assert!(!dirty.contains(&edge.file_id()));
            }
        }
        for bucket in store.symbol_names.values() {
            for location in bucket {
                prop_assert!(!dirty.contains(&location.file_id()));
            }
        }
    }

    /// Invariant 3: absent dirty, merges never shrink the symbol map, and
    /// `unite` reports change iff the receiver changed.
    #[test]
    fn merge_is_monotonic(
        batches in prop::collection::vec(prop::collection::vec(arb_occurrence(), 1..8), 1..4)
    ) {
        let mut store = SymbolStore::new();
        let mut previous = 0usize;
        for (i, batch) in batches.iter().enumerate() {
            store.merge(&build_index_data(batch), i as u64);
            prop_assert!(store.symbols.len() >= previous);
            previous = store.symbols.len();
        }
    }

    #[test]
    fn unite_change_report_matches_reality(a in arb_occurrence(), b in arb_occurrence()) {
        let build = |occ: &Occurrence| {
            SymbolInfo::new(SymbolData {
                symbol_length: occ.name.len() as u16,
                symbol_name: occ.name.clone(),
                kind: SymbolKind::Function,
                tag: SymbolTag::Definition(occ.definition),
                start: 0,
                end: occ.name.len() as i32,
                targets: occ.targets.iter().copied().collect(),
                references: occ.references.iter().copied().collect(),
                ..SymbolData::new()
            })
        };
        let mut lhs = build(&a);
        let before = lhs.clone();
        let changed = lhs.unite(&build(&b));
        prop_assert_eq!(changed, lhs != before);
    }

    /// Invariant 7 (in-memory half): the store round-trips through its
    /// serialized form unchanged.
    #[test]
    fn store_round_trips_through_bincode(
        batch in prop::collection::vec(arb_occurrence(), 1..10)
    ) {
        let mut store = SymbolStore::new();
        store.merge(&build_index_data(&batch), 7);

        let bytes = bincode::serialize(&store).unwrap();
        let restored: SymbolStore = bincode::deserialize(&bytes).unwrap();
        prop_assert_eq!(store, restored);
    }
}

//! Packed source locations.

use serde::{Deserialize, Serialize};

use crate::FileId;

const LINE_BITS: u64 = 21;
const COLUMN_BITS: u64 = 11;
const LINE_MASK: u64 = (1 << LINE_BITS) - 1;
const COLUMN_MASK: u64 = (1 << COLUMN_BITS) - 1;

/// A (file, line, column) triple packed into a `u64`.
///
/// The packing keeps `Ord` on the raw value equal to lexicographic
/// `(file_id, line, column)` ordering, which is what makes per-file range
/// queries over a `BTreeMap<Location, _>` cheap. A location with file id 0
/// is invalid.
///
/// Lines above 2^21-1 or columns above 2^11-1 saturate; translation units
/// that large are out of useful range for cross-referencing anyway.
#[derive(
    Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Default, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct Location(u64);

impl Location {
    pub const NONE: Location = Location(0);

    pub fn new(file_id: FileId, line: u32, column: u32) -> Self {
        let line = (line as u64).min(LINE_MASK);
        let column = (column as u64).min(COLUMN_MASK);
        Self(((file_id.to_raw() as u64) << (LINE_BITS + COLUMN_BITS)) | (line << COLUMN_BITS) | column)
    }

    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn to_raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn file_id(self) -> FileId {
        FileId::from_raw((self.0 >> (LINE_BITS + COLUMN_BITS)) as u32)
    }

    #[inline]
    pub fn line(self) -> u32 {
        ((self.0 >> COLUMN_BITS) & LINE_MASK) as u32
    }

    #[inline]
    pub fn column(self) -> u32 {
        (self.0 & COLUMN_MASK) as u32
    }

    #[inline]
    pub fn is_valid(self) -> bool {
        self.file_id().is_valid()
    }

    /// Smallest location in `file`; with [`Location::file_end`] it brackets a
    /// per-file `BTreeMap` range.
    pub fn file_start(file: FileId) -> Self {
        Self::new(file, 0, 0)
    }

    pub fn file_end(file: FileId) -> Self {
        Self(((file.to_raw() as u64) << (LINE_BITS + COLUMN_BITS)) | LINE_MASK << COLUMN_BITS | COLUMN_MASK)
    }
}

impl std::fmt::Debug for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.file_id().to_raw(),
            self.line(),
            self.column()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_fields() {
        let loc = Location::new(FileId::from_raw(7), 120, 14);
        assert_eq!(loc.file_id(), FileId::from_raw(7));
        assert_eq!(loc.line(), 120);
        assert_eq!(loc.column(), 14);
        assert!(loc.is_valid());
    }

    #[test]
    fn zero_file_id_is_invalid() {
        assert!(!Location::new(FileId::NONE, 1, 1).is_valid());
        assert!(!Location::NONE.is_valid());
    }

    #[test]
    fn ordering_is_file_then_line_then_column() {
        let a = Location::new(FileId::from_raw(1), 10, 5);
        let b = Location::new(FileId::from_raw(1), 10, 6);
        let c = Location::new(FileId::from_raw(1), 11, 0);
        let d = Location::new(FileId::from_raw(2), 0, 0);
        assert!(a < b && b < c && c < d);
    }

    #[test]
    fn file_range_brackets_every_location_in_the_file() {
        let file = FileId::from_raw(3);
        let inside = Location::new(file, 2_000_000, 2_047);
        assert!(Location::file_start(file) <= inside);
        assert!(inside <= Location::file_end(file));
        assert!(Location::file_end(file) < Location::file_start(FileId::from_raw(4)));
    }
}

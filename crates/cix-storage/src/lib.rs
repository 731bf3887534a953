//! On-disk storage for cix persisted artifacts.
//!
//! ## Format
//! Each persisted artifact is stored as:
//! - a fixed-size header (64 bytes, little-endian)
//! - a bincode-encoded payload
//!
//! The header embeds:
//! - artifact kind and schema version
//! - cix version string
//! - compression flag (whole-payload zstd or none)
//! - payload length and a truncated blake3 hash of the uncompressed payload
//!
//! A reader verifies the payload length against the actual file size and the
//! content hash before deserializing anything. Callers treat any
//! [`StorageError`] on load as corruption: the file is deleted, never
//! salvaged.

mod header;
mod read;
mod write;

pub use header::{ArtifactKind, Compression, StorageHeader, HEADER_LEN};
pub use read::read_archive;
pub use write::write_archive_atomic;

/// Errors produced by artifact persistence.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("truncated artifact: expected {expected} bytes, found {found}")]
    Truncated { expected: usize, found: usize },

    #[error("invalid header: {0}")]
    InvalidHeader(&'static str),

    #[error("artifact kind mismatch: expected {expected:?}, found {found:?}")]
    KindMismatch {
        expected: ArtifactKind,
        found: ArtifactKind,
    },

    #[error("incompatible schema version: expected {expected}, found {found}")]
    SchemaVersionMismatch { expected: u32, found: u32 },

    #[error("payload length mismatch: header says {expected} bytes, file holds {found}")]
    PayloadLengthMismatch { expected: u64, found: u64 },

    #[error("content hash mismatch: expected {expected:#018x}, found {found:#018x}")]
    HashMismatch { expected: u64, found: u64 },

    #[error("encode error: {0}")]
    Encode(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("decompression error: {0}")]
    Decompression(String),
}

use std::fs;
use std::path::Path;

use crate::header::{ArtifactKind, Compression, StorageHeader, HEADER_LEN};
use crate::StorageError;

/// Read and verify an artifact written by
/// [`write_archive_atomic`](crate::write_archive_atomic).
///
/// Verification order: header shape, kind, schema version, payload length
/// against the actual file size, then the blake3 content hash of the
/// uncompressed payload. Only after all checks pass is the payload handed to
/// bincode.
pub fn read_archive<T>(
    path: &Path,
    kind: ArtifactKind,
    schema_version: u32,
) -> Result<T, StorageError>
where
    T: serde::de::DeserializeOwned,
{
    let bytes = fs::read(path)?;
    let header = StorageHeader::decode(&bytes)?;

    if header.kind != kind {
        return Err(StorageError::KindMismatch {
            expected: kind,
            found: header.kind,
        });
    }
    if header.schema_version != schema_version {
        return Err(StorageError::SchemaVersionMismatch {
            expected: schema_version,
            found: header.schema_version,
        });
    }

    let actual_payload_len = (bytes.len() - HEADER_LEN) as u64;
    if header.payload_len != actual_payload_len {
        return Err(StorageError::PayloadLengthMismatch {
            expected: header.payload_len,
            found: actual_payload_len,
        });
    }

    let payload = &bytes[HEADER_LEN..];
    let uncompressed = match header.compression {
        Compression::None => payload.to_vec(),
        Compression::Zstd => {
            zstd::bulk::decompress(payload, header.uncompressed_len as usize)
                .map_err(|e| StorageError::Decompression(e.to_string()))?
        }
    };

    if uncompressed.len() as u64 != header.uncompressed_len {
        return Err(StorageError::PayloadLengthMismatch {
            expected: header.uncompressed_len,
            found: uncompressed.len() as u64,
        });
    }

    let hash_bytes = blake3::hash(&uncompressed);
    let content_hash =
        u64::from_le_bytes(hash_bytes.as_bytes()[..8].try_into().expect("hash slice"));
    if content_hash != header.content_hash {
        return Err(StorageError::HashMismatch {
            expected: header.content_hash,
            found: content_hash,
        });
    }

    bincode::deserialize(&uncompressed).map_err(|e| StorageError::Decode(e.to_string()))
}

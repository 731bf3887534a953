use std::fs;
use std::io::{self, Write};
use std::path::Path;

use crate::header::{ArtifactKind, Compression, StorageHeader};
use crate::StorageError;

/// Serialize `value` and write it to `path` atomically (temp file + rename).
pub fn write_archive_atomic<T>(
    path: &Path,
    kind: ArtifactKind,
    schema_version: u32,
    value: &T,
    compression: Compression,
) -> Result<(), StorageError>
where
    T: serde::Serialize,
{
    let dir = path
        .parent()
        .ok_or(StorageError::InvalidHeader("missing parent directory"))?;
    fs::create_dir_all(dir)?;

    let uncompressed =
        bincode::serialize(value).map_err(|e| StorageError::Encode(e.to_string()))?;

    let hash_bytes = blake3::hash(&uncompressed);
    let content_hash =
        u64::from_le_bytes(hash_bytes.as_bytes()[..8].try_into().expect("hash slice"));

    let uncompressed_len = uncompressed.len() as u64;
    let payload = match compression {
        Compression::None => uncompressed,
        Compression::Zstd => zstd::bulk::compress(&uncompressed, 0)
            .map_err(|e| StorageError::Decompression(e.to_string()))?,
    };

    let header = StorageHeader::new(
        kind,
        schema_version,
        compression,
        payload.len() as u64,
        uncompressed_len,
        content_hash,
    );

    atomic_write(path, &header.encode(), &payload)
}

fn atomic_write(dest: &Path, header: &[u8], payload: &[u8]) -> Result<(), StorageError> {
    let tmp_path = dest.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(header)?;
        file.write_all(payload)?;
        file.sync_all()?;
    }

    match fs::rename(&tmp_path, dest) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists || dest.exists() => {
            // On Windows, rename doesn't overwrite. Try remove + rename.
            let _ = fs::remove_file(dest);
            fs::rename(&tmp_path, dest).map_err(StorageError::from)
        }
        Err(err) => Err(StorageError::from(err)),
    }
}

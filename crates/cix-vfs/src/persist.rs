//! Persistence of the `fileids` artifact under the daemon's data directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use cix_core::FileId;
use cix_storage::{read_archive, write_archive_atomic, ArtifactKind, Compression, StorageError};

use crate::FileIdRegistry;

pub const FILE_IDS_NAME: &str = "fileids";
pub const FILE_IDS_SCHEMA_VERSION: u32 = 1;

pub fn save_file_ids(data_dir: &Path, registry: &FileIdRegistry) -> Result<(), StorageError> {
    write_archive_atomic(
        &data_dir.join(FILE_IDS_NAME),
        ArtifactKind::FileIds,
        FILE_IDS_SCHEMA_VERSION,
        &registry.paths_to_ids(),
        Compression::None,
    )
}

/// Load the persisted path → id map.
///
/// `Ok(None)` means there was nothing to restore (first run). Any error is
/// corruption; the caller clears the whole project store (fail-closed).
pub fn load_file_ids(data_dir: &Path) -> Result<Option<FileIdRegistry>, StorageError> {
    let path = data_dir.join(FILE_IDS_NAME);
    if !path.exists() {
        return Ok(None);
    }
    let snapshot: BTreeMap<PathBuf, FileId> =
        read_archive(&path, ArtifactKind::FileIds, FILE_IDS_SCHEMA_VERSION)?;
    Ok(Some(FileIdRegistry::from_snapshot(snapshot)))
}

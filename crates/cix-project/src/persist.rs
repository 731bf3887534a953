//! On-disk form of a project database.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use cix_core::{FileId, Source, SourceKey};
use cix_index::SymbolStore;
use cix_storage::{read_archive, write_archive_atomic, ArtifactKind, Compression};

use crate::ProjectError;

pub const PROJECT_SCHEMA_VERSION: u32 = 1;

/// Everything a project persists between runs.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectDatabase {
    pub store: SymbolStore,
    pub sources: BTreeMap<SourceKey, Source>,
    pub visited_files: BTreeSet<FileId>,
    pub suspended_files: BTreeSet<FileId>,
}

/// Encode a project root into a flat file name under `data_dir`.
///
/// `/` becomes `_`; literal `_` and `%` are escaped so the mapping is
/// invertible.
pub fn encode_project_path(path: &Path) -> String {
    let mut out = String::new();
    for ch in path.display().to_string().chars() {
        match ch {
            '/' => out.push('_'),
            '_' => out.push_str("%5f"),
            '%' => out.push_str("%25"),
            other => out.push(other),
        }
    }
    out
}

/// Invert [`encode_project_path`]. Returns `None` for names that are not a
/// valid encoding.
pub fn decode_project_path(name: &str) -> Option<PathBuf> {
    let mut out = String::new();
    let mut chars = name.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '_' => out.push('/'),
            '%' => {
                let hex: String = chars.by_ref().take(2).collect();
                match hex.as_str() {
                    "5f" => out.push('_'),
                    "25" => out.push('%'),
                    _ => return None,
                }
            }
            other => out.push(other),
        }
    }
    out.starts_with('/').then(|| PathBuf::from(out))
}

pub fn database_file(data_dir: &Path, project_path: &Path) -> PathBuf {
    data_dir.join(encode_project_path(project_path))
}

/// Check a database file's header, size and content hash without keeping
/// the decoded payload. A failing file is deleted, as on load.
pub fn probe_database(data_dir: &Path, project_path: &Path) -> bool {
    let file = database_file(data_dir, project_path);
    if !file.exists() {
        return false;
    }
    match read_archive::<ProjectDatabase>(&file, ArtifactKind::ProjectDatabase, PROJECT_SCHEMA_VERSION)
    {
        Ok(_) => true,
        Err(err) => {
            tracing::error!(
                target: "cix.project",
                file = %file.display(),
                error = %err,
                "project database failed verification, removing"
            );
            let _ = std::fs::remove_file(&file);
            false
        }
    }
}

pub fn save_database(
    data_dir: &Path,
    project_path: &Path,
    database: &ProjectDatabase,
) -> Result<(), ProjectError> {
    write_archive_atomic(
        &database_file(data_dir, project_path),
        ArtifactKind::ProjectDatabase,
        PROJECT_SCHEMA_VERSION,
        database,
        Compression::Zstd,
    )?;
    Ok(())
}

/// Load a project database.
///
/// `Ok(None)` when no file exists. On any verification or decode failure the
/// file is deleted (corrupted databases are dropped, not salvaged) and the
/// error is returned so the caller can log it.
pub fn load_database(
    data_dir: &Path,
    project_path: &Path,
) -> Result<Option<ProjectDatabase>, ProjectError> {
    let file = database_file(data_dir, project_path);
    if !file.exists() {
        return Ok(None);
    }
    match read_archive(&file, ArtifactKind::ProjectDatabase, PROJECT_SCHEMA_VERSION) {
        Ok(database) => Ok(Some(database)),
        Err(err) => {
            tracing::error!(
                target: "cix.project",
                file = %file.display(),
                error = %err,
                "project database corrupted, removing"
            );
            let _ = std::fs::remove_file(&file);
            Err(err.into())
        }
    }
}

pub fn delete_database(data_dir: &Path, project_path: &Path) {
    let _ = std::fs::remove_file(database_file(data_dir, project_path));
}

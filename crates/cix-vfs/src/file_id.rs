use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use cix_core::FileId;

/// Allocates stable `FileId`s for absolute paths and supports reverse lookup.
///
/// Id 0 is reserved for "invalid"; allocation starts at 1 and is monotonic
/// within a run. Restoring from a snapshot keeps every previously assigned
/// id so persisted project databases stay valid.
#[derive(Debug)]
pub struct FileIdRegistry {
    path_to_id: HashMap<PathBuf, FileId>,
    id_to_path: HashMap<FileId, PathBuf>,
    next_id: u32,
}

impl Default for FileIdRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FileIdRegistry {
    pub fn new() -> Self {
        Self {
            path_to_id: HashMap::new(),
            id_to_path: HashMap::new(),
            next_id: 1,
        }
    }

    /// Returns the stable id for `path`, allocating a new one if necessary.
    pub fn insert(&mut self, path: impl Into<PathBuf>) -> FileId {
        let path = path.into();
        if let Some(&id) = self.path_to_id.get(&path) {
            return id;
        }

        let id = FileId::from_raw(self.next_id);
        self.next_id = self
            .next_id
            .checked_add(1)
            .expect("too many file ids allocated");
        self.id_to_path.insert(id, path.clone());
        self.path_to_id.insert(path, id);
        id
    }

    /// Returns the id for `path` if it has been interned.
    pub fn get_id(&self, path: &Path) -> Option<FileId> {
        self.path_to_id.get(path).copied()
    }

    /// Returns the path for `id`.
    pub fn get_path(&self, id: FileId) -> Option<&Path> {
        self.id_to_path.get(&id).map(PathBuf::as_path)
    }

    pub fn len(&self) -> usize {
        self.path_to_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.path_to_id.is_empty()
    }

    /// Snapshot of the full mapping, ordered for deterministic persistence.
    pub fn paths_to_ids(&self) -> BTreeMap<PathBuf, FileId> {
        self.path_to_id
            .iter()
            .map(|(path, &id)| (path.clone(), id))
            .collect()
    }

    /// Rebuild a registry from a persisted snapshot.
    ///
    /// Paths present in the snapshot retain their prior ids; the allocator
    /// resumes above the highest restored id.
    pub fn from_snapshot(snapshot: BTreeMap<PathBuf, FileId>) -> Self {
        let mut registry = Self::new();
        for (path, id) in snapshot {
            registry.next_id = registry.next_id.max(id.to_raw() + 1);
            registry.id_to_path.insert(id, path.clone());
            registry.path_to_id.insert(path, id);
        }
        registry
    }
}

/// Shared, internally-guarded handle to the process-wide registry.
#[derive(Debug, Clone, Default)]
pub struct FileIds {
    inner: Arc<Mutex<FileIdRegistry>>,
}

impl FileIds {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(FileIdRegistry::new())),
        }
    }

    pub fn from_registry(registry: FileIdRegistry) -> Self {
        Self {
            inner: Arc::new(Mutex::new(registry)),
        }
    }

    pub fn insert(&self, path: impl Into<PathBuf>) -> FileId {
        self.inner.lock().insert(path)
    }

    pub fn get_id(&self, path: &Path) -> Option<FileId> {
        self.inner.lock().get_id(path)
    }

    pub fn get_path(&self, id: FileId) -> Option<PathBuf> {
        self.inner.lock().get_path(id).map(Path::to_path_buf)
    }

    pub fn paths_to_ids(&self) -> BTreeMap<PathBuf, FileId> {
        self.inner.lock().paths_to_ids()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Replace the mapping wholesale (startup restore).
    pub fn replace(&self, registry: FileIdRegistry) {
        *self.inner.lock() = registry;
    }
}

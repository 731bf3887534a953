//! A bounded, thread-safe cache of parsed translation units.
//!
//! The cache is keyed by file id and owns its units exclusively: evicting an
//! entry drops the parser object (`U`). Entries carry a small state machine
//! so the completion thread can park on an entry until a parse in flight on
//! another thread reaches `Ready`.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use cix_core::FileId;

/// Identity of a parse: a cache hit requires the compiler and the argument
/// vector to match exactly, argument order included.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnitDescription {
    pub file_id: FileId,
    pub compiler: PathBuf,
    pub arguments: Vec<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UnitState {
    Invalid,
    Parsing,
    Reparsing,
    Completing,
    Ready,
}

struct UnitSlot<U> {
    state: UnitState,
    unit: Option<U>,
}

/// One cached translation unit.
///
/// The parser object is set by whichever thread finishes parsing, via
/// [`transition_with`](TranslationUnit::transition_with).
pub struct TranslationUnit<U> {
    description: UnitDescription,
    slot: Mutex<UnitSlot<U>>,
    ready: Condvar,
}

impl<U> TranslationUnit<U> {
    pub fn new(description: UnitDescription) -> Arc<Self> {
        Arc::new(Self {
            description,
            slot: Mutex::new(UnitSlot {
                state: UnitState::Invalid,
                unit: None,
            }),
            ready: Condvar::new(),
        })
    }

    pub fn description(&self) -> &UnitDescription {
        &self.description
    }

    pub fn file_id(&self) -> FileId {
        self.description.file_id
    }

    pub fn state(&self) -> UnitState {
        self.slot.lock().state
    }

    pub fn transition(&self, state: UnitState) {
        let mut slot = self.slot.lock();
        slot.state = state;
        self.ready.notify_all();
    }

    pub fn transition_with(&self, state: UnitState, unit: U) {
        let mut slot = self.slot.lock();
        slot.state = state;
        slot.unit = Some(unit);
        self.ready.notify_all();
    }

    /// Block until the entry reaches `Ready`.
    pub fn wait_for_ready(&self) {
        let mut slot = self.slot.lock();
        while slot.state != UnitState::Ready {
            self.ready.wait(&mut slot);
        }
    }

    /// Run `f` with the parser object while holding the entry lock.
    pub fn with_unit<R>(&self, f: impl FnOnce(Option<&U>) -> R) -> R {
        let slot = self.slot.lock();
        f(slot.unit.as_ref())
    }

    /// Run `f` with mutable access to the parser object (reparse in place).
    pub fn with_unit_mut<R>(&self, f: impl FnOnce(Option<&mut U>) -> R) -> R {
        let mut slot = self.slot.lock();
        f(slot.unit.as_mut())
    }
}

struct CacheInner<U> {
    units: HashMap<FileId, Arc<TranslationUnit<U>>>,
    /// LRU order, least recent first.
    order: VecDeque<FileId>,
}

/// Bounded LRU of [`TranslationUnit`]s keyed by file id.
pub struct TranslationUnitCache<U> {
    inner: Mutex<CacheInner<U>>,
    max_size: usize,
}

impl<U> TranslationUnitCache<U> {
    pub fn new(max_size: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                units: HashMap::new(),
                order: VecDeque::new(),
            }),
            max_size: max_size.max(1),
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn len(&self) -> usize {
        self.inner.lock().units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().units.is_empty()
    }

    /// Look up by file id alone; touches the entry.
    pub fn find(&self, file_id: FileId) -> Option<Arc<TranslationUnit<U>>> {
        let mut inner = self.inner.lock();
        let unit = inner.units.get(&file_id).cloned()?;
        move_to_back(&mut inner.order, file_id);
        Some(unit)
    }

    /// Look up by full description; a hit requires the cached entry's
    /// compiler and argument vector to match exactly.
    pub fn get(&self, description: &UnitDescription) -> Option<Arc<TranslationUnit<U>>> {
        let mut inner = self.inner.lock();
        let unit = inner.units.get(&description.file_id).cloned()?;
        if unit.description.compiler != description.compiler
            || unit.description.arguments != description.arguments
        {
            return None;
        }
        move_to_back(&mut inner.order, description.file_id);
        Some(unit)
    }

    /// Insert at the MRU end, evicting from the LRU end until the cache fits.
    pub fn insert(&self, unit: Arc<TranslationUnit<U>>) {
        let mut inner = self.inner.lock();
        let file_id = unit.file_id();
        let replaced = inner.units.insert(file_id, unit).is_some();
        if replaced {
            move_to_back(&mut inner.order, file_id);
        } else {
            inner.order.push_back(file_id);
            while inner.units.len() > self.max_size {
                let Some(evicted) = inner.order.pop_front() else {
                    break;
                };
                inner.units.remove(&evicted);
            }
        }
    }
}

fn move_to_back(order: &mut VecDeque<FileId>, file_id: FileId) {
    if let Some(pos) = order.iter().position(|&f| f == file_id) {
        order.remove(pos);
    }
    order.push_back(file_id);
}

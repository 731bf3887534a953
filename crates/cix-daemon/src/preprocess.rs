//! Admission FIFO for the preprocess stage.
//!
//! Preprocess work is queued here and drained onto the worker pool only
//! while the pipeline as a whole holds fewer than [`MAX_PENDING`] items,
//! which backpressures compile-command floods against the scheduler.

use std::collections::VecDeque;
use std::path::PathBuf;

use cix_core::Source;
use cix_project::IndexFlags;

/// Bound on in-flight pipeline items, measured as pending indexer jobs +
/// queued-or-busy preprocess tasks + jobs awaiting results.
pub const MAX_PENDING: usize = 50;

#[derive(Clone, Debug)]
pub struct QueuedPreprocess {
    pub project: PathBuf,
    pub source: Source,
    pub flags: IndexFlags,
}

#[derive(Debug, Default)]
pub struct PreprocessQueue {
    queue: VecDeque<QueuedPreprocess>,
}

impl PreprocessQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item: QueuedPreprocess) {
        self.queue.push_back(item);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Pop items to start now, given how much of the pipeline is already
    /// occupied.
    pub fn drain(&mut self, pipeline_in_flight: usize) -> Vec<QueuedPreprocess> {
        let mut out = Vec::new();
        let mut occupied = pipeline_in_flight;
        while occupied < MAX_PENDING {
            let Some(item) = self.queue.pop_front() else {
                break;
            };
            occupied += 1;
            out.push(item);
        }
        out
    }
}

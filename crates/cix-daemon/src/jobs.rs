//! Indexer job bookkeeping and dispatch arithmetic.
//!
//! The tracker is pure state: the server performs the IO (launching
//! processes, sending datagrams) that the tracker's decisions call for.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cix_core::{Cpp, JobId, Source};
use cix_project::{IndexFlags, PendingJob};

use crate::events::ConnId;

/// Core job state; exactly one at a time.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Complete,
    Crashed,
    Aborted,
}

/// Orthogonal modifiers on top of [`JobState`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct JobModifiers {
    /// This job originated on a peer; we run it and return the result.
    pub from_remote: bool,
    /// This local job was handed to a peer and runs there.
    pub remote: bool,
    pub dirty: bool,
    pub dump: bool,
}

#[derive(Clone, Debug)]
pub struct IndexerJob {
    pub id: JobId,
    pub project: PathBuf,
    pub source: Source,
    pub cpp: Arc<Cpp>,
    pub state: JobState,
    pub modifiers: JobModifiers,
    /// Origin daemon for `from_remote` jobs: visit-file questions and the
    /// result go back there.
    pub origin: Option<(String, u16)>,
    /// Set when the job was handed to a peer; drives rescheduling.
    pub started: Option<Instant>,
}

impl IndexerJob {
    pub fn new(
        id: JobId,
        project: PathBuf,
        pending: PendingJob,
        modifiers: JobModifiers,
    ) -> Self {
        Self {
            id,
            project,
            source: pending.source,
            cpp: pending.cpp,
            state: JobState::Pending,
            modifiers: JobModifiers {
                dirty: pending.flags.dirty,
                dump: pending.flags.dump,
                ..modifiers
            },
            origin: None,
            started: None,
        }
    }

    pub fn index_flags(&self) -> IndexFlags {
        IndexFlags {
            dirty: self.modifiers.dirty,
            dump: self.modifiers.dump,
        }
    }
}

/// What one dispatch pass decided for each popped job.
#[derive(Debug, PartialEq, Eq)]
pub enum Dispatch {
    /// Launch the indexer process for this job.
    Launch(JobId),
    /// A peer's job whose project is not loaded here: dropped, the peer
    /// will time out and resend.
    DropForeign(JobId),
}

pub struct JobTracker {
    jobs: HashMap<JobId, IndexerJob>,
    pending: VecDeque<JobId>,
    /// Jobs whose result the daemon is waiting for, local or remote.
    processing: HashMap<JobId, ()>,
    /// Locally launched processes and their start time.
    local: HashMap<JobId, Instant>,
    /// Outstanding `JobRequestMessage`s by connection.
    pending_job_requests: HashMap<ConnId, u16>,
    remote_pending: usize,
    next_id: u64,
    job_count: usize,
}

impl JobTracker {
    pub fn new(job_count: usize) -> Self {
        Self {
            jobs: HashMap::new(),
            pending: VecDeque::new(),
            processing: HashMap::new(),
            local: HashMap::new(),
            pending_job_requests: HashMap::new(),
            remote_pending: 0,
            next_id: 1,
            job_count: job_count.max(1),
        }
    }

    pub fn job_count(&self) -> usize {
        self.job_count
    }

    pub fn set_job_count(&mut self, job_count: usize) {
        self.job_count = job_count.max(1);
    }

    /// Seed the id counter so ids from different daemons in a cluster do
    /// not collide.
    pub fn seed_ids(&mut self, seed: u64) {
        self.next_id = seed.max(1);
    }

    pub fn next_job_id(&mut self) -> JobId {
        let id = JobId::from_raw(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn get(&self, id: JobId) -> Option<&IndexerJob> {
        self.jobs.get(&id)
    }

    pub fn local_in_flight(&self) -> usize {
        self.local.len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn processing_len(&self) -> usize {
        self.processing.len()
    }

    /// Local slot budget. The `max(.., 1)` guarantees indexing progress
    /// even when every preprocess worker is busy.
    pub fn available_local(&self, busy_preprocess_workers: usize) -> usize {
        self.job_count.saturating_sub(busy_preprocess_workers).max(1)
    }

    /// Slots we may promise to peers.
    pub fn available_remote(&self, busy_preprocess_workers: usize) -> usize {
        let promised: usize = self
            .pending_job_requests
            .values()
            .map(|&n| n as usize)
            .sum();
        self.available_local(busy_preprocess_workers)
            .saturating_sub(self.local.len())
            .saturating_sub(promised)
    }

    pub fn add_job(&mut self, job: IndexerJob) {
        if job.modifiers.from_remote {
            self.remote_pending += 1;
        }
        self.pending.push_back(job.id);
        self.jobs.insert(job.id, job);
    }

    /// One dispatch pass: pop heads while local slots remain.
    ///
    /// Launched jobs become `Running` and enter `processing` and `local`;
    /// foreign jobs without a loaded project are dropped.
    pub fn start_next(
        &mut self,
        busy_preprocess_workers: usize,
        project_loaded: impl Fn(&Path) -> bool,
        now: Instant,
    ) -> Vec<Dispatch> {
        let mut out = Vec::new();
        while !self.pending.is_empty()
            && self.local.len() < self.available_local(busy_preprocess_workers)
        {
            let id = self.pending.pop_front().expect("checked non-empty");
            let Some(job) = self.jobs.get_mut(&id) else {
                continue;
            };
            if job.state == JobState::Complete || job.state == JobState::Aborted {
                continue;
            }
            if job.modifiers.from_remote && !project_loaded(&job.project) {
                self.remote_pending = self.remote_pending.saturating_sub(1);
                self.jobs.remove(&id);
                out.push(Dispatch::DropForeign(id));
                continue;
            }
            job.state = JobState::Running;
            // Once it runs locally the process exit is authoritative; only
            // remotely-held jobs are subject to the reschedule scan.
            job.started = None;
            self.processing.insert(id, ());
            self.local.insert(id, now);
            out.push(Dispatch::Launch(id));
        }
        out
    }

    /// Pending jobs not owned by peers, i.e. what we announce.
    pub fn surplus(&self) -> u16 {
        self.pending.len().saturating_sub(self.remote_pending) as u16
    }

    /// Hand up to `count` pending local jobs to a peer. They stay in
    /// `processing` with `started` stamped so the reschedule scan can
    /// reclaim them.
    pub fn take_jobs_for_peer(&mut self, count: u16, now: Instant) -> Vec<IndexerJob> {
        let mut out = Vec::new();
        let mut remaining: VecDeque<JobId> = VecDeque::new();
        while let Some(id) = self.pending.pop_front() {
            if out.len() == count as usize {
                remaining.push_back(id);
                continue;
            }
            let Some(job) = self.jobs.get_mut(&id) else {
                continue;
            };
            if job.modifiers.from_remote {
                remaining.push_back(id);
                continue;
            }
            job.state = JobState::Running;
            job.modifiers.remote = true;
            job.started = Some(now);
            self.processing.insert(id, ());
            out.push(job.clone());
        }
        self.pending = remaining;
        out
    }

    /// Periodic scan: re-queue remotely-running jobs that have been out
    /// longer than `timeout`. They are *not* removed from `processing`; a
    /// late result is still accepted and the duplicate dropped by job id.
    pub fn reschedule(&mut self, timeout: Duration, now: Instant) -> Vec<JobId> {
        let mut rescheduled = Vec::new();
        for (&id, _) in self.processing.iter() {
            let Some(job) = self.jobs.get(&id) else {
                continue;
            };
            let Some(started) = job.started else {
                // Local job; process exit handles it.
                continue;
            };
            if now.duration_since(started) >= timeout && !self.pending.contains(&id) {
                rescheduled.push(id);
            }
        }
        for &id in &rescheduled {
            if let Some(job) = self.jobs.get_mut(&id) {
                job.state = JobState::Pending;
            }
            self.pending.push_back(id);
        }
        rescheduled
    }

    /// An `IndexerMessage` arrived for `id`. Returns the job if it was
    /// still awaited; `None` means a duplicate or unknown result to drop.
    ///
    /// An aborted job is never marked complete ("aborted wins"); its entry
    /// is still cleared so duplicates drop.
    pub fn complete(&mut self, id: JobId) -> Option<IndexerJob> {
        self.processing.remove(&id)?;
        let mut job = self.jobs.remove(&id)?;
        self.local.remove(&id);
        if job.state != JobState::Aborted {
            job.state = JobState::Complete;
        }
        Some(job)
    }

    /// A locally launched process exited. Returns `(job, crashed)`; `None`
    /// when the job's result already arrived through the socket.
    pub fn on_local_exit(&mut self, id: JobId, success: bool) -> Option<(IndexerJob, bool)> {
        let started_here = self.local.remove(&id).is_some();
        if !started_here || !self.processing.contains_key(&id) {
            // Result already handled (or never ours).
            self.processing.remove(&id);
            self.jobs.remove(&id);
            return None;
        }
        self.processing.remove(&id);
        let mut job = self.jobs.remove(&id)?;
        if job.modifiers.from_remote {
            self.remote_pending = self.remote_pending.saturating_sub(1);
        }
        let crashed = job.state != JobState::Aborted && !success;
        job.state = if job.state == JobState::Aborted {
            JobState::Aborted
        } else if crashed {
            JobState::Crashed
        } else {
            JobState::Complete
        };
        Some((job, crashed))
    }

    /// Externally cancel a job. Returns true if a local process should be
    /// killed.
    pub fn abort(&mut self, id: JobId) -> bool {
        let Some(job) = self.jobs.get_mut(&id) else {
            return false;
        };
        let was_running = job.state == JobState::Running;
        job.state = JobState::Aborted;
        was_running && self.local.contains_key(&id)
    }

    pub fn abort_project(&mut self, project: &Path) -> Vec<JobId> {
        let ids: Vec<JobId> = self
            .jobs
            .values()
            .filter(|job| job.project == project)
            .map(|job| job.id)
            .collect();
        ids.into_iter().filter(|&id| self.abort(id)).collect()
    }

    pub fn running_job_ids(&self) -> Vec<JobId> {
        self.local.keys().copied().collect()
    }

    // ---- peer request bookkeeping -------------------------------------

    pub fn record_job_request(&mut self, conn: ConnId, count: u16) {
        self.pending_job_requests.insert(conn, count);
    }

    pub fn clear_job_request(&mut self, conn: ConnId) {
        self.pending_job_requests.remove(&conn);
    }

    pub fn dump(&self, source_of: impl Fn(JobId) -> Option<String>) -> String {
        use std::fmt::Write as _;

        let mut out = String::new();
        let _ = writeln!(
            out,
            "jobs: {} pending, {} processing, {} local",
            self.pending.len(),
            self.processing.len(),
            self.local.len()
        );
        for id in &self.pending {
            if let Some(desc) = source_of(*id) {
                let _ = writeln!(out, "  pending {id}: {desc}");
            }
        }
        for id in self.processing.keys() {
            if let Some(desc) = source_of(*id) {
                let _ = writeln!(out, "  processing {id}: {desc}");
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cix_core::{FileId, SourceLanguage};

    fn pending_job(file: u32) -> PendingJob {
        PendingJob {
            source: Source {
                file_id: FileId::from_raw(file),
                build_root_id: FileId::from_raw(100),
                source_file: PathBuf::from(format!("/src/f{file}.c")),
                build_root: PathBuf::from("/build"),
                compiler: PathBuf::from("/usr/bin/cc"),
                language: SourceLanguage::C,
                arguments: Vec::new(),
            },
            cpp: Arc::new(Cpp::default()),
            flags: IndexFlags::default(),
        }
    }

    fn add(tracker: &mut JobTracker, file: u32, modifiers: JobModifiers) -> JobId {
        let id = tracker.next_job_id();
        tracker.add_job(IndexerJob::new(
            id,
            PathBuf::from("/src"),
            pending_job(file),
            modifiers,
        ));
        id
    }

    #[test]
    fn local_budget_keeps_one_slot_under_preprocess_pressure() {
        let tracker = JobTracker::new(4);
        assert_eq!(tracker.available_local(0), 4);
        assert_eq!(tracker.available_local(3), 1);
        assert_eq!(tracker.available_local(4), 1);
        assert_eq!(tracker.available_local(100), 1);
    }

    #[test]
    fn remote_budget_subtracts_running_and_promised() {
        let mut tracker = JobTracker::new(4);
        let now = Instant::now();
        add(&mut tracker, 1, JobModifiers::default());
        add(&mut tracker, 2, JobModifiers::default());
        let dispatched = tracker.start_next(0, |_| true, now);
        assert_eq!(dispatched.len(), 2);
        assert_eq!(tracker.available_remote(0), 2);

        tracker.record_job_request(ConnId::from_raw(1), 1);
        assert_eq!(tracker.available_remote(0), 1);
        tracker.clear_job_request(ConnId::from_raw(1));
        assert_eq!(tracker.available_remote(0), 2);
    }

    #[test]
    fn dispatch_makes_progress_when_pending_and_slots_exist() {
        let mut tracker = JobTracker::new(1);
        let now = Instant::now();
        add(&mut tracker, 1, JobModifiers::default());

        // Even with every preprocess worker busy, one job launches.
        let dispatched = tracker.start_next(64, |_| true, now);
        assert_eq!(dispatched.len(), 1);
        assert!(matches!(dispatched[0], Dispatch::Launch(_)));
        assert_eq!(tracker.local_in_flight(), 1);

        // No further slots: nothing else launches.
        add(&mut tracker, 2, JobModifiers::default());
        assert!(tracker.start_next(0, |_| true, now).is_empty());
    }

    #[test]
    fn foreign_jobs_without_a_project_are_dropped() {
        let mut tracker = JobTracker::new(2);
        let now = Instant::now();
        let id = add(
            &mut tracker,
            1,
            JobModifiers {
                from_remote: true,
                ..JobModifiers::default()
            },
        );
        let dispatched = tracker.start_next(0, |_| false, now);
        assert_eq!(dispatched, vec![Dispatch::DropForeign(id)]);
        assert_eq!(tracker.surplus(), 0);
        assert_eq!(tracker.local_in_flight(), 0);
    }

    #[test]
    fn surplus_excludes_foreign_jobs() {
        let mut tracker = JobTracker::new(1);
        let now = Instant::now();
        add(&mut tracker, 1, JobModifiers::default());
        tracker.start_next(0, |_| true, now);

        add(&mut tracker, 2, JobModifiers::default());
        add(&mut tracker, 3, JobModifiers::default());
        add(
            &mut tracker,
            4,
            JobModifiers {
                from_remote: true,
                ..JobModifiers::default()
            },
        );
        assert_eq!(tracker.surplus(), 2);
    }

    #[test]
    fn peers_receive_only_local_jobs() {
        let mut tracker = JobTracker::new(1);
        let now = Instant::now();
        add(&mut tracker, 1, JobModifiers::default());
        tracker.start_next(0, |_| true, now);

        let local = add(&mut tracker, 2, JobModifiers::default());
        add(
            &mut tracker,
            3,
            JobModifiers {
                from_remote: true,
                ..JobModifiers::default()
            },
        );

        let handed = tracker.take_jobs_for_peer(5, now);
        assert_eq!(handed.len(), 1);
        assert_eq!(handed[0].id, local);
        assert!(handed[0].modifiers.remote);
        assert!(handed[0].started.is_some());
        // The foreign job stays queued.
        assert_eq!(tracker.pending_len(), 1);
    }

    #[test]
    fn reschedule_requeues_but_keeps_processing() {
        let mut tracker = JobTracker::new(1);
        let start = Instant::now();
        add(&mut tracker, 1, JobModifiers::default());
        tracker.start_next(0, |_| true, start);

        let remote = add(&mut tracker, 2, JobModifiers::default());
        tracker.take_jobs_for_peer(1, start);

        let later = start + Duration::from_secs(60);
        let rescheduled = tracker.reschedule(Duration::from_secs(15), later);
        assert_eq!(rescheduled, vec![remote]);
        assert_eq!(tracker.pending_len(), 1);
        // A second scan does not duplicate the queue entry.
        assert!(tracker.reschedule(Duration::from_secs(15), later).is_empty());

        // The late remote result is still accepted once...
        assert!(tracker.complete(remote).is_some());
        // ...and the duplicate (from the re-dispatched run) drops.
        assert!(tracker.complete(remote).is_none());
    }

    #[test]
    fn local_jobs_are_not_rescheduled() {
        let mut tracker = JobTracker::new(1);
        let start = Instant::now();
        add(&mut tracker, 1, JobModifiers::default());
        tracker.start_next(0, |_| true, start);

        let later = start + Duration::from_secs(600);
        assert!(tracker.reschedule(Duration::from_secs(15), later).is_empty());
    }

    #[test]
    fn local_exit_classifies_crashes() {
        let mut tracker = JobTracker::new(2);
        let now = Instant::now();
        let ok = add(&mut tracker, 1, JobModifiers::default());
        let bad = add(&mut tracker, 2, JobModifiers::default());
        tracker.start_next(0, |_| true, now);

        let (_, crashed) = tracker.on_local_exit(bad, false).unwrap();
        assert!(crashed);
        let (_, crashed) = tracker.on_local_exit(ok, true).unwrap();
        assert!(!crashed);
    }

    #[test]
    fn aborted_jobs_do_not_count_as_crashes() {
        let mut tracker = JobTracker::new(1);
        let now = Instant::now();
        let id = add(&mut tracker, 1, JobModifiers::default());
        tracker.start_next(0, |_| true, now);

        assert!(tracker.abort(id));
        let (job, crashed) = tracker.on_local_exit(id, false).unwrap();
        assert!(!crashed);
        assert_eq!(job.state, JobState::Aborted);
    }

    #[test]
    fn exit_after_socket_result_is_ignored() {
        let mut tracker = JobTracker::new(1);
        let now = Instant::now();
        let id = add(&mut tracker, 1, JobModifiers::default());
        tracker.start_next(0, |_| true, now);

        assert!(tracker.complete(id).is_some());
        assert!(tracker.on_local_exit(id, true).is_none());
    }
}

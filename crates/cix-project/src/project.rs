//! The project state machine.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use cix_core::{Cpp, FileId, JobId, Location, Match, Source, SourceKey};
use cix_index::{
    DependencyMode, IndexData, SortFlags, SortedSymbol, SymbolInfo, SymbolMap, SymbolStore,
};

use crate::ProjectDatabase;

pub const DEFAULT_MAX_CRASH_COUNT: usize = 5;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProjectState {
    Unloaded,
    Inited,
    Loading,
    Loaded,
}

impl ProjectState {
    pub fn label(self) -> &'static str {
        match self {
            ProjectState::Unloaded => "(unloaded)",
            ProjectState::Inited => "(inited)",
            ProjectState::Loading => "(loading)",
            ProjectState::Loaded => "(loaded)",
        }
    }
}

/// Modifiers a job admission carries into the indexer run.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct IndexFlags {
    /// Re-run caused by a dirty cascade.
    pub dirty: bool,
    /// Diagnostic dump; the result's message is shown, not merged.
    pub dump: bool,
}

/// A fully-prepared unit of indexing work.
#[derive(Clone, Debug)]
pub struct PendingJob {
    pub source: Source,
    pub cpp: Arc<Cpp>,
    pub flags: IndexFlags,
}

/// What [`Project::admit`] decided.
#[derive(Debug)]
pub enum Admission {
    /// Nothing in flight for this key: dispatch now.
    Dispatch(PendingJob),
    /// An indexer for this key is running; the work is queued and will be
    /// promoted when the active run finishes.
    Queued,
    /// The file is suspended; never indexed.
    Suspended,
}

/// What happened when an indexer result (or crash) came back.
#[derive(Debug)]
pub enum JobOutcome {
    /// Result merged. `next` is a queued admission to dispatch now.
    Merged { next: Option<PendingJob> },
    /// Dump result: hand `message` to whoever asked, nothing merged.
    Dumped {
        message: String,
        next: Option<PendingJob>,
    },
    /// Crash under the retry bound: dispatch `job` again.
    Retry { job: PendingJob, crash_count: usize },
    /// Crash at the bound; not retried until an explicit reindex.
    GaveUp { crash_count: usize },
    /// No bookkeeping for this result (superseded or duplicate): dropped.
    Stale,
}

struct ActiveJob {
    job_id: JobId,
    job: PendingJob,
    visited: BTreeSet<FileId>,
}

#[derive(Default)]
struct JobData {
    active: Option<ActiveJob>,
    pending: Option<PendingJob>,
    crash_count: usize,
}

pub struct Project {
    path: PathBuf,
    state: ProjectState,
    store: SymbolStore,
    sources: BTreeMap<SourceKey, Source>,
    visited_files: BTreeSet<FileId>,
    suspended_files: BTreeSet<FileId>,
    jobs: HashMap<SourceKey, JobData>,
    job_counter: usize,
    max_crash_count: usize,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl Project {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: ProjectState::Unloaded,
            store: SymbolStore::new(),
            sources: BTreeMap::new(),
            visited_files: BTreeSet::new(),
            suspended_files: BTreeSet::new(),
            jobs: HashMap::new(),
            job_counter: 0,
            max_crash_count: DEFAULT_MAX_CRASH_COUNT,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> ProjectState {
        self.state
    }

    pub fn store(&self) -> &SymbolStore {
        &self.store
    }

    pub fn sources(&self) -> &BTreeMap<SourceKey, Source> {
        &self.sources
    }

    pub fn job_counter(&self) -> usize {
        self.job_counter
    }

    // ---- lifecycle ----------------------------------------------------

    pub fn init(&mut self) {
        if self.state == ProjectState::Unloaded {
            self.state = ProjectState::Inited;
        }
    }

    pub fn begin_load(&mut self) {
        self.state = ProjectState::Loading;
    }

    /// Apply a restored database (or none, for a fresh project) and become
    /// `Loaded`.
    pub fn finish_load(&mut self, database: Option<ProjectDatabase>) {
        if let Some(database) = database {
            self.store = database.store;
            self.sources = database.sources;
            self.visited_files = database.visited_files;
            self.suspended_files = database.suspended_files;
        }
        self.state = ProjectState::Loaded;
    }

    pub fn unload(&mut self) {
        self.store = SymbolStore::new();
        self.sources.clear();
        self.visited_files.clear();
        self.jobs.clear();
        self.state = ProjectState::Unloaded;
    }

    pub fn is_indexing(&self) -> bool {
        self.jobs.values().any(|data| data.active.is_some())
    }

    /// Snapshot for persistence.
    pub fn to_database(&self) -> ProjectDatabase {
        ProjectDatabase {
            store: self.store.clone(),
            sources: self.sources.clone(),
            visited_files: self.visited_files.clone(),
            suspended_files: self.suspended_files.clone(),
        }
    }

    pub fn matches(&self, pattern: &Match) -> bool {
        if pattern.matches_path(&self.path) {
            return true;
        }
        self.sources
            .values()
            .any(|source| pattern.matches_path(&source.source_file))
    }

    // ---- admission ----------------------------------------------------

    /// Record the source and decide whether to dispatch an indexer for it.
    pub fn admit(&mut self, source: Source, cpp: Arc<Cpp>, flags: IndexFlags) -> Admission {
        if self.suspended_files.contains(&source.file_id) {
            return Admission::Suspended;
        }

        let key = source.key();
        self.sources.insert(key, source.clone());

        let job = PendingJob { source, cpp, flags };
        let data = self.jobs.entry(key).or_default();
        if data.active.is_some() {
            data.pending = Some(job);
            return Admission::Queued;
        }
        Admission::Dispatch(job)
    }

    /// Attach the dispatched job id to its key. Must follow every
    /// `Admission::Dispatch`, `JobOutcome::Retry` and promoted `next`.
    pub fn job_started(&mut self, job_id: JobId, job: PendingJob) {
        let key = job.source.key();
        let data = self.jobs.entry(key).or_default();
        data.active = Some(ActiveJob {
            job_id,
            job,
            visited: BTreeSet::new(),
        });
    }

    /// Answer one visit-file question: true exactly once per file within
    /// this project until the file is dirtied.
    pub fn visit_file(&mut self, file_id: FileId, job_key: SourceKey) -> bool {
        if !self.visited_files.insert(file_id) {
            return false;
        }
        if job_key != 0 {
            if let Some(active) = self.jobs.get_mut(&job_key).and_then(|d| d.active.as_mut()) {
                active.visited.insert(file_id);
            }
        }
        true
    }

    // ---- completion ---------------------------------------------------

    /// Integrate one indexer result. `crashed` marks a run that exited
    /// abnormally; its `data` carries only the key.
    pub fn on_job_finished(&mut self, data: &IndexData, crashed: bool) -> JobOutcome {
        let Some(job_data) = self.jobs.get_mut(&data.key) else {
            return JobOutcome::Stale;
        };
        let Some(active) = job_data.active.as_ref() else {
            return JobOutcome::Stale;
        };
        if active.job_id != data.job_id {
            return JobOutcome::Stale;
        }

        self.job_counter += 1;

        if crashed {
            let active = job_data.active.take().expect("checked above");
            job_data.crash_count += 1;
            let crash_count = job_data.crash_count;
            // The crashed run may have claimed visits it never delivered.
            for file in &active.visited {
                self.visited_files.remove(file);
            }
            if crash_count < self.max_crash_count {
                tracing::warn!(
                    target: "cix.project",
                    file = %active.job.source.source_file.display(),
                    crash_count,
                    "indexer crashed, retrying"
                );
                return JobOutcome::Retry {
                    job: active.job,
                    crash_count,
                };
            }
            tracing::error!(
                target: "cix.project",
                file = %active.job.source.source_file.display(),
                crash_count,
                "indexer crashed too often, giving up"
            );
            job_data.pending = None;
            return JobOutcome::GaveUp { crash_count };
        }

        let active = job_data.active.take().expect("checked above");
        job_data.crash_count = 0;
        let next = job_data.pending.take();

        if active.job.flags.dump {
            return JobOutcome::Dumped {
                message: data.message.clone(),
                next,
            };
        }

        self.store.merge(data, now_ms());
        self.visited_files.extend(data.visited_files());

        JobOutcome::Merged { next }
    }

    // ---- dirty / reindex ----------------------------------------------

    /// Invalidate `files` plus everything transitively depending on them.
    ///
    /// Returns the sources to re-preprocess, suspended files excluded. The
    /// dirtied files are also un-visited so the next indexer run may visit
    /// them again.
    pub fn dirty(&mut self, files: &BTreeSet<FileId>) -> Vec<Source> {
        if files.is_empty() {
            return Vec::new();
        }
        let mut all: BTreeSet<FileId> = files.clone();
        all.extend(self.store.dependents_of(files));

        self.store.dirty(&all);
        for file in &all {
            self.visited_files.remove(file);
        }

        self.sources
            .values()
            .filter(|source| {
                all.contains(&source.file_id)
                    && !self.suspended_files.contains(&source.file_id)
            })
            .cloned()
            .collect()
    }

    /// Mark every source matching `pattern` dirty. Returns the sources to
    /// re-preprocess.
    pub fn reindex(&mut self, pattern: &Match) -> Vec<Source> {
        let files: BTreeSet<FileId> = self
            .sources
            .values()
            .filter(|source| pattern.is_empty() || pattern.matches_path(&source.source_file))
            .map(|source| source.file_id)
            .collect();
        self.dirty(&files)
    }

    /// Like reindex, but drops the matching sources entirely. Returns the
    /// number of sources removed.
    pub fn remove_sources(&mut self, pattern: &Match) -> usize {
        let removed: Vec<(SourceKey, FileId)> = self
            .sources
            .iter()
            .filter(|(_, source)| pattern.matches_path(&source.source_file))
            .map(|(&key, source)| (key, source.file_id))
            .collect();

        let files: BTreeSet<FileId> = removed.iter().map(|&(_, file)| file).collect();
        for (key, _) in &removed {
            self.sources.remove(key);
            self.jobs.remove(key);
        }
        self.store.dirty(&files);
        for file in &files {
            self.visited_files.remove(file);
        }
        removed.len()
    }

    // ---- suspension ---------------------------------------------------

    pub fn toggle_suspend(&mut self, file_id: FileId) -> bool {
        if self.suspended_files.remove(&file_id) {
            false
        } else {
            self.suspended_files.insert(file_id);
            true
        }
    }

    pub fn is_suspended(&self, file_id: FileId) -> bool {
        self.suspended_files.contains(&file_id)
    }

    pub fn suspended_files(&self) -> &BTreeSet<FileId> {
        &self.suspended_files
    }

    pub fn clear_suspended_files(&mut self) {
        self.suspended_files.clear();
    }

    // ---- queries ------------------------------------------------------

    pub fn is_indexed(&self, file_id: FileId) -> bool {
        self.visited_files.contains(&file_id) || self.store.is_indexed(file_id)
    }

    pub fn sources_for(&self, file_id: FileId) -> Vec<&Source> {
        self.sources
            .values()
            .filter(|source| source.file_id == file_id)
            .collect()
    }

    pub fn has_source(&self, source: &Source) -> bool {
        self.sources.contains_key(&source.key())
    }

    pub fn locations(&self, name: &str, file: Option<FileId>) -> BTreeSet<Location> {
        self.store.locations(name, file)
    }

    pub fn symbols_in_file(&self, file: FileId) -> SymbolMap {
        self.store.symbols_in_file(file)
    }

    pub fn sort_locations(
        &self,
        locations: &BTreeSet<Location>,
        flags: SortFlags,
    ) -> Vec<SortedSymbol> {
        self.store.sort_locations(locations, flags)
    }

    /// The symbol at `location`: exact hit, or the closest earlier
    /// occurrence on the same line (cursor in the middle of an identifier).
    pub fn symbol_at(&self, location: Location) -> Option<(Location, &SymbolInfo)> {
        let file = location.file_id();
        self.store
            .symbols
            .range(Location::file_start(file)..=location)
            .next_back()
            .filter(|(&candidate, _)| candidate.line() == location.line())
            .map(|(&candidate, info)| (candidate, info))
    }

    /// Go-to-definition.
    pub fn follow_location(&self, location: Location) -> Option<Location> {
        let (_, info) = self.symbol_at(location)?;
        info.best_target(&self.store.symbols, None)
            .map(|(target, _)| target)
    }

    /// Every reference to the symbol under `location`. If the cursor sits
    /// on a use, the edges of its best target are reported.
    pub fn references_for(&self, location: Location) -> BTreeSet<Location> {
        let Some((own_location, info)) = self.symbol_at(location) else {
            return BTreeSet::new();
        };
        let (anchor, anchor_info) = if info.is_definition() || info.targets().is_empty() {
            (own_location, info.clone())
        } else {
            match info.best_target(&self.store.symbols, None) {
                Some((target, target_info)) => (target, target_info),
                None => (own_location, info.clone()),
            }
        };
        let mut out = anchor_info.references().clone();
        out.remove(&anchor);
        out
    }

    pub fn cursor_info(&self, location: Location) -> Option<(Location, SymbolInfo)> {
        self.symbol_at(location)
            .map(|(loc, info)| (loc, info.clone()))
    }

    pub fn symbol_names(&self, pattern: &Match) -> Vec<String> {
        self.store
            .symbol_names
            .keys()
            .filter(|name| pattern.is_empty() || pattern.matches(name))
            .cloned()
            .collect()
    }

    pub fn dependencies(&self, file: FileId, mode: DependencyMode) -> BTreeSet<FileId> {
        self.store.dependencies_of(file, mode)
    }

    pub fn fix_its(&self, file: FileId) -> String {
        let mut out = String::new();
        if let Some(fix_its) = self.store.fix_its(file) {
            for fix_it in fix_its {
                let _ = writeln!(out, "{}-{}: {}", fix_it.start, fix_it.end, fix_it.text);
            }
        }
        out
    }

    pub fn dump_jobs(&self) -> String {
        let mut out = String::new();
        for (key, data) in &self.jobs {
            let state = match (&data.active, &data.pending) {
                (Some(active), Some(_)) => format!("running (job {}), one queued", active.job_id),
                (Some(active), None) => format!("running (job {})", active.job_id),
                (None, Some(_)) => "queued".to_string(),
                (None, None) => continue,
            };
            let source = self
                .sources
                .get(key)
                .map(|s| s.source_file.display().to_string())
                .unwrap_or_else(|| format!("key {key:#x}"));
            let _ = writeln!(out, "{source}: {state} crashes: {}", data.crash_count);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cix_core::SourceLanguage;

    fn source(file: u32, path: &str) -> Source {
        Source {
            file_id: FileId::from_raw(file),
            build_root_id: FileId::from_raw(100),
            source_file: PathBuf::from(path),
            build_root: PathBuf::from("/build"),
            compiler: PathBuf::from("/usr/bin/cc"),
            language: SourceLanguage::C,
            arguments: vec!["-O2".into()],
        }
    }

    fn cpp() -> Arc<Cpp> {
        Arc::new(Cpp {
            preprocessed: "int x;\n".into(),
            duration_ms: 1,
        })
    }

    fn loaded_project() -> Project {
        let mut project = Project::new("/src/proj");
        project.init();
        project.begin_load();
        project.finish_load(None);
        project
    }

    fn result_for(job_id: u64, src: &Source) -> IndexData {
        IndexData {
            job_id: JobId::from_raw(job_id),
            key: src.key(),
            ..IndexData::default()
        }
    }

    #[test]
    fn same_key_admissions_serialize() {
        let mut project = loaded_project();
        let src = source(1, "/src/a.c");

        let first = project.admit(src.clone(), cpp(), IndexFlags::default());
        let Admission::Dispatch(job) = first else {
            panic!("expected dispatch");
        };
        project.job_started(JobId::from_raw(1), job);

        // Second admission while the first is running queues.
        match project.admit(src.clone(), cpp(), IndexFlags::default()) {
            Admission::Queued => {}
            other => panic!("unexpected admission: {other:?}"),
        }

        // Completion promotes the queued work.
        match project.on_job_finished(&result_for(1, &src), false) {
            JobOutcome::Merged { next: Some(_) } => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn crash_retry_bounds() {
        let mut project = loaded_project();
        project.max_crash_count = 3;
        let src = source(1, "/src/a.c");

        let Admission::Dispatch(job) = project.admit(src.clone(), cpp(), IndexFlags::default())
        else {
            panic!("expected dispatch");
        };
        project.job_started(JobId::from_raw(1), job);

        // Two crashes retry.
        for attempt in 1..=2u64 {
            match project.on_job_finished(&result_for(attempt, &src), true) {
                JobOutcome::Retry { job, crash_count } => {
                    assert_eq!(crash_count, attempt as usize);
                    project.job_started(JobId::from_raw(attempt + 1), job);
                }
                other => panic!("unexpected outcome: {other:?}"),
            }
        }

        // Success resets the counter.
        match project.on_job_finished(&result_for(3, &src), false) {
            JobOutcome::Merged { next: None } => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(project.jobs[&src.key()].crash_count, 0);

        // A fresh run that crashes to the bound gives up.
        let Admission::Dispatch(job) = project.admit(src.clone(), cpp(), IndexFlags::default())
        else {
            panic!("expected dispatch");
        };
        project.job_started(JobId::from_raw(10), job);
        project.jobs.get_mut(&src.key()).unwrap().crash_count = 2;
        match project.on_job_finished(&result_for(10, &src), true) {
            JobOutcome::GaveUp { crash_count: 3 } => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn stale_results_are_dropped() {
        let mut project = loaded_project();
        let src = source(1, "/src/a.c");
        assert!(matches!(
            project.on_job_finished(&result_for(7, &src), false),
            JobOutcome::Stale
        ));

        let Admission::Dispatch(job) = project.admit(src.clone(), cpp(), IndexFlags::default())
        else {
            panic!("expected dispatch");
        };
        project.job_started(JobId::from_raw(1), job);
        assert!(matches!(
            project.on_job_finished(&result_for(99, &src), false),
            JobOutcome::Stale
        ));
    }

    #[test]
    fn visit_file_is_at_most_once() {
        let mut project = loaded_project();
        let src = source(1, "/src/a.c");
        let Admission::Dispatch(job) = project.admit(src.clone(), cpp(), IndexFlags::default())
        else {
            panic!("expected dispatch");
        };
        project.job_started(JobId::from_raw(1), job);

        assert!(project.visit_file(FileId::from_raw(5), src.key()));
        assert!(!project.visit_file(FileId::from_raw(5), src.key()));
        assert!(project.visit_file(FileId::from_raw(6), 0));
    }

    #[test]
    fn suspended_files_are_never_admitted() {
        let mut project = loaded_project();
        let src = source(1, "/src/a.c");
        project.toggle_suspend(FileId::from_raw(1));
        assert!(matches!(
            project.admit(src, cpp(), IndexFlags::default()),
            Admission::Suspended
        ));
    }

    #[test]
    fn dirty_cascade_returns_dependent_sources() {
        let mut project = loaded_project();
        let a = source(1, "/src/a.c");
        let header = FileId::from_raw(2);

        let Admission::Dispatch(job) = project.admit(a.clone(), cpp(), IndexFlags::default())
        else {
            panic!("expected dispatch");
        };
        project.job_started(JobId::from_raw(1), job);

        let mut data = result_for(1, &a);
        data.dependencies
            .entry(header)
            .or_default()
            .insert(a.file_id);
        data.dependencies
            .entry(a.file_id)
            .or_default()
            .insert(a.file_id);
        data.visited.insert(a.file_id, true);
        data.visited.insert(header, true);
        assert!(matches!(
            project.on_job_finished(&data, false),
            JobOutcome::Merged { .. }
        ));
        assert!(project.is_indexed(header));

        let to_reindex = project.dirty(&[header].into_iter().collect());
        assert_eq!(to_reindex.len(), 1);
        assert_eq!(to_reindex[0].source_file, PathBuf::from("/src/a.c"));
        // Dirtied files may be visited again.
        assert!(!project.is_indexed(header));
    }

    #[test]
    fn suspended_sources_are_skipped_by_dirty() {
        let mut project = loaded_project();
        let a = source(1, "/src/a.c");
        project.admit(a.clone(), cpp(), IndexFlags::default());
        project.toggle_suspend(a.file_id);

        let to_reindex = project.dirty(&[a.file_id].into_iter().collect());
        assert!(to_reindex.is_empty());
    }

    #[test]
    fn remove_sources_drops_rows_and_data() {
        let mut project = loaded_project();
        let a = source(1, "/src/a.c");
        let b = source(2, "/src/b.c");
        project.admit(a, cpp(), IndexFlags::default());
        project.admit(b, cpp(), IndexFlags::default());

        assert_eq!(project.remove_sources(&Match::new("a.c")), 1);
        assert_eq!(project.sources().len(), 1);
    }

    #[test]
    fn reindex_matches_sources() {
        let mut project = loaded_project();
        let a = source(1, "/src/a.c");
        let b = source(2, "/src/b.c");
        project.admit(a, cpp(), IndexFlags::default());
        project.admit(b, cpp(), IndexFlags::default());
        // Nothing in flight; clear bookkeeping so dirty returns them.
        project.jobs.clear();

        assert_eq!(project.reindex(&Match::default()).len(), 2);
        assert_eq!(project.reindex(&Match::new("b.c")).len(), 1);
    }
}

//! The daemon's main-loop state and event handling.

mod queries;

#[cfg(test)]
mod tests;

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use cix_core::{FileId, JobId, Location, Source, SourceKey};
use cix_index::IndexData;
use cix_project::{
    load_database, probe_database, save_database, Admission, IndexFlags, JobOutcome, PendingJob,
    Project, ProjectDatabase, ProjectState,
};
use cix_proto::{
    write_message, IndexerMessage, JobRequestMessage, JobResponseMessage, LogLevel, Message,
    MulticastForwardMessage, VisitFileMessage, VisitFileResponseMessage, WireJob,
};
use cix_scheduler::{PoolKind, WorkerPools, WorkerPoolsConfig};
use cix_vfs::{load_file_ids, save_file_ids, FileIds};

use crate::cluster::{ForwardAddr, ForwardRegistry};
use crate::completion::{CompletionRequest, CompletionThread};
use crate::config::Options;
use crate::events::{
    ConnId, ConnPurpose, ConnectionRegistry, EventSender, ServerEvent,
};
use crate::jobs::{Dispatch, IndexerJob, JobModifiers, JobTracker};
use crate::preprocess::{PreprocessQueue, QueuedPreprocess};

/// Launches indexer processes. Production spawns `cix-indexer`; tests
/// substitute a recorder.
pub trait IndexerLauncher {
    /// Start the indexer for `job`. The returned token kills the process
    /// when cancelled. Completion must arrive as
    /// [`ServerEvent::IndexerExited`].
    fn launch(
        &self,
        job: &IndexerJob,
        options: &Options,
        events: EventSender,
    ) -> Result<CancellationToken, String>;
}

/// Spawns the real external indexer binary with the job on stdin.
pub struct ProcessLauncher;

impl IndexerLauncher for ProcessLauncher {
    fn launch(
        &self,
        job: &IndexerJob,
        options: &Options,
        events: EventSender,
    ) -> Result<CancellationToken, String> {
        use std::process::Stdio;

        let mut command = tokio::process::Command::new(&options.indexer_command);
        match (&job.origin, job.modifiers.from_remote) {
            (Some((host, port)), true) => {
                command.arg("--destination").arg(format!("{host}:{port}"));
            }
            _ => {
                command.arg("--socket").arg(&options.socket_file);
            }
        }
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|err| err.to_string())?;
        let mut stdin = child.stdin.take().ok_or("indexer stdin not captured")?;

        let wire = Message::JobResponse(JobResponseMessage {
            job: WireJob {
                id: job.id,
                project: job.project.clone(),
                source: job.source.clone(),
                cpp: (*job.cpp).clone(),
                dirty: job.modifiers.dirty,
                dump: job.modifiers.dump,
            },
            tcp_port: 0,
        });

        let token = CancellationToken::new();
        let job_id = job.id;
        let watch_token = token.clone();
        tokio::task::spawn_local(async move {
            if write_message(&mut stdin, &wire).await.is_err() {
                // The child will fail on EOF; the exit path reports it.
            }
            drop(stdin);

            // Stderr is drained concurrently so a chatty child can't block
            // on a full pipe; only the first 64KiB is kept.
            let stderr_pipe = child.stderr.take();
            let stderr_handle = tokio::task::spawn_local(async move {
                use tokio::io::AsyncReadExt;
                let mut buf = Vec::new();
                if let Some(mut pipe) = stderr_pipe {
                    let _ = (&mut pipe).take(64 * 1024).read_to_end(&mut buf).await;
                    let _ = tokio::io::copy(&mut pipe, &mut tokio::io::sink()).await;
                }
                String::from_utf8_lossy(&buf).into_owned()
            });

            tokio::select! {
                biased;
                _ = watch_token.cancelled() => {
                    let _ = child.kill().await;
                }
                _ = child.wait() => {}
            }
            let status = child.wait().await.ok();
            let stderr = stderr_handle.await.unwrap_or_default();

            let success = status.map(|s| s.success()).unwrap_or(false);
            let _ = events.send(ServerEvent::IndexerExited {
                job_id,
                success,
                stderr,
            });
        });

        Ok(token)
    }
}

pub struct Server {
    pub options: Options,
    file_ids: FileIds,
    projects: HashMap<PathBuf, Project>,
    current_project: Option<PathBuf>,
    tracker: JobTracker,
    forwards: ForwardRegistry,
    preprocess_queue: PreprocessQueue,
    pools: WorkerPools,
    pub conns: ConnectionRegistry,
    events: EventSender,
    preprocessor: Arc<dyn cix_clang::Preprocessor>,
    launcher: Box<dyn IndexerLauncher>,
    completion: Option<CompletionThread>,
    multicast: Option<Arc<UdpSocket>>,
    /// Admissions parked until their project finishes loading.
    waiting_for_load: HashMap<PathBuf, Vec<(Source, Arc<cix_core::Cpp>, IndexFlags)>>,
    /// Connections waiting for a dump result, by source key.
    dump_waiters: HashMap<SourceKey, ConnId>,
    kill_switches: HashMap<JobId, CancellationToken>,
    sync_timers: HashMap<PathBuf, CancellationToken>,
    unload_timer: Option<CancellationToken>,
    reconnect_timer: Option<CancellationToken>,
    shutting_down: bool,
}

impl Server {
    pub fn new(
        options: Options,
        preprocessor: Arc<dyn cix_clang::Preprocessor>,
        launcher: Box<dyn IndexerLauncher>,
        completion: Option<CompletionThread>,
        events: EventSender,
    ) -> Self {
        let pools = WorkerPools::new(WorkerPoolsConfig {
            preprocess_threads: options.job_count,
            background_threads: 2,
        });
        // Ids must not collide across daemons in a cluster: seed the
        // counter from pid and wall clock.
        let seed = ((std::process::id() as u64) << 48)
            | (SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0)
                & 0xffff_ffff_ffff);
        let mut tracker = JobTracker::new(options.job_count);
        tracker.seed_ids(seed);

        Self {
            file_ids: FileIds::new(),
            projects: HashMap::new(),
            current_project: None,
            tracker,
            forwards: ForwardRegistry::new(),
            preprocess_queue: PreprocessQueue::new(),
            pools,
            conns: ConnectionRegistry::new(),
            events,
            preprocessor,
            launcher,
            completion,
            multicast: None,
            waiting_for_load: HashMap::new(),
            dump_waiters: HashMap::new(),
            kill_switches: HashMap::new(),
            sync_timers: HashMap::new(),
            unload_timer: None,
            reconnect_timer: None,
            shutting_down: false,
            options,
        }
    }

    pub fn set_multicast_socket(&mut self, socket: Arc<UdpSocket>) {
        self.multicast = Some(socket);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    pub fn file_ids(&self) -> &FileIds {
        &self.file_ids
    }

    pub fn projects(&self) -> &HashMap<PathBuf, Project> {
        &self.projects
    }

    /// Startup: restore file ids (clearing the store when corrupted),
    /// re-register persisted projects, restore the current project and
    /// begin forward dialing.
    pub fn init(&mut self) {
        std::fs::create_dir_all(&self.options.data_dir).ok();

        if self.options.flags.clear_projects {
            self.clear_projects();
        }

        match load_file_ids(&self.options.data_dir) {
            Ok(Some(registry)) => self.file_ids.replace(registry),
            Ok(None) => {}
            Err(err) => {
                tracing::error!(
                    target: "cix.server",
                    error = %err,
                    "fileids corrupted, clearing the project store"
                );
                self.clear_projects();
            }
        }

        self.reload_projects();

        if !self.options.flags.no_startup_current_project {
            let current = self.options.data_dir.join(".currentProject");
            if let Ok(contents) = std::fs::read_to_string(&current) {
                let path = PathBuf::from(contents.trim_end_matches('\n'));
                if self.projects.contains_key(&path) {
                    self.select_project(path);
                } else {
                    tracing::error!(target: "cix.server", path = %path.display(), "can't restore project");
                    let _ = std::fs::remove_file(&current);
                }
            }
        }

        for forward in self.options.multicast_forwards.clone() {
            self.forwards.add(forward);
        }
        self.reconnect_forwards();
    }

    /// Drop every project from memory and every database file from disk.
    pub fn clear_projects(&mut self) {
        self.projects.clear();
        self.current_project = None;
        if let Ok(entries) = std::fs::read_dir(&self.options.data_dir) {
            for entry in entries.flatten() {
                let _ = std::fs::remove_file(entry.path());
            }
        }
        self.file_ids.replace(cix_vfs::FileIdRegistry::new());
    }

    /// Rebuild the project registry from the data directory. Databases
    /// failing verification are deleted and omitted.
    pub fn reload_projects(&mut self) -> usize {
        self.projects.clear();
        let Ok(entries) = std::fs::read_dir(&self.options.data_dir) else {
            return 0;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name == cix_vfs::FILE_IDS_NAME || name.starts_with('.') || name.ends_with(".tmp") {
                continue;
            }
            let Some(path) = cix_project::decode_project_path(name) else {
                continue;
            };
            if probe_database(&self.options.data_dir, &path) {
                let mut project = Project::new(&path);
                project.init();
                self.projects.insert(path, project);
            }
        }
        self.projects.len()
    }

    // ---- event dispatch ------------------------------------------------

    pub fn handle_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::NewConnection {
                stream,
                peer,
                purpose,
            } => {
                let id = self.conns.register(stream, peer, self.events.clone());
                match purpose {
                    ConnPurpose::Incoming => {}
                    ConnPurpose::Forward(addr) => {
                        tracing::info!(
                            target: "cix.cluster",
                            host = %addr.0, port = addr.1,
                            "connected to forwarding address"
                        );
                        self.forwards.connected(&addr, id);
                    }
                    ConnPurpose::JobPull { jobs, .. } => {
                        self.tracker.record_job_request(id, jobs);
                        self.conns
                            .send(id, Message::JobRequest(JobRequestMessage { num_jobs: jobs }));
                    }
                }
            }
            ServerEvent::DialFailed { purpose, error } => match purpose {
                ConnPurpose::Forward(addr) => {
                    tracing::error!(
                        target: "cix.cluster",
                        host = %addr.0, port = addr.1, error = %error,
                        "can't connect to multicast forwarding address"
                    );
                    self.forwards.connect_failed(&addr);
                    self.schedule_forward_reconnect();
                }
                purpose => {
                    tracing::debug!(target: "cix.cluster", ?purpose, error = %error, "dial failed");
                }
            },
            ServerEvent::ConnMessage { id, message } => {
                self.restart_unload_timer();
                self.handle_message(id, *message);
            }
            ServerEvent::ConnClosed { id } => {
                self.conns.close(id);
                self.tracker.clear_job_request(id);
                if let Some(addr) = self.forwards.connection_lost(id) {
                    tracing::warn!(
                        target: "cix.cluster",
                        host = %addr.0, port = addr.1,
                        "disconnected from forward"
                    );
                    self.schedule_forward_reconnect();
                }
            }
            ServerEvent::MulticastDatagram { ip, port, payload } => {
                self.handle_multicast_data(&ip, port, &payload, None);
            }
            ServerEvent::PreprocessDone {
                project,
                source,
                result,
                flags,
            } => {
                match result {
                    Ok(cpp) => self.index(project, source, Arc::new(cpp), flags),
                    Err(error) => {
                        tracing::error!(
                            target: "cix.preprocess",
                            file = %source.source_file.display(),
                            error = %error,
                            "couldn't preprocess"
                        );
                    }
                }
                self.start_preprocess_jobs();
            }
            ServerEvent::ProjectLoaded { path, database } => {
                self.on_project_loaded(path, database);
            }
            ServerEvent::IndexerExited {
                job_id,
                success,
                stderr,
            } => {
                self.on_local_job_finished(job_id, success, stderr);
            }
            ServerEvent::SyncProject { path } => {
                self.sync_timers.remove(&path);
                self.save_project(&path);
            }
            ServerEvent::RescheduleTick => {
                let rescheduled = self
                    .tracker
                    .reschedule(self.options.reschedule_timeout, Instant::now());
                if !rescheduled.is_empty() {
                    tracing::debug!(target: "cix.jobs", count = rescheduled.len(), "rescheduling jobs");
                    self.start_next_jobs();
                }
            }
            ServerEvent::UnloadTick => self.on_unload_tick(),
            ServerEvent::ReconnectForwards => {
                self.reconnect_timer = None;
                self.reconnect_forwards();
            }
            ServerEvent::Shutdown => self.shutdown(),
        }
    }

    // ---- message dispatch ----------------------------------------------

    fn handle_message(&mut self, id: ConnId, message: Message) {
        match message {
            Message::Compile(m) => {
                self.conns.close(id);
                self.compile(&m.arguments, &m.working_directory, &m.projects);
            }
            Message::Query(m) => self.handle_query(id, m),
            Message::Indexer(m) => self.handle_indexer_message(id, m),
            Message::VisitFile(m) => self.handle_visit_file(id, m),
            Message::CreateOutput(m) => {
                self.conns.set_log_level(id, m.level);
            }
            Message::JobRequest(m) => self.handle_job_request(id, m),
            Message::JobResponse(m) => self.handle_job_response(id, m),
            Message::MulticastForward(m) => self.handle_multicast_forward_message(id, m),
            Message::Finish => {
                // The peer finished the exchange (e.g. the tail of a job
                // pull); release the connection and its promises.
                self.tracker.clear_job_request(id);
                self.conns.close(id);
            }
            Message::Response(text) => {
                tracing::debug!(target: "cix.server", %id, text = %text, "stray response");
            }
            Message::VisitFileResponse(_) => {
                tracing::error!(target: "cix.server", %id, "unexpected message");
                self.conns.finish(id);
            }
        }
    }

    // ---- compile admission ---------------------------------------------

    /// Parse and admit one compile command.
    pub fn compile(&mut self, arguments: &str, cwd: &Path, with_projects: &[String]) {
        let Some(mut source) = Source::parse(arguments, cwd) else {
            return;
        };
        if self.options.is_ignored_compiler(&source.compiler) {
            return;
        }
        if self.options.is_excluded(&source.source_file) {
            return;
        }
        source.arguments.extend(self.options.derived_arguments());

        source.file_id = self.file_ids.insert(source.source_file.clone());
        source.build_root_id = self.file_ids.insert(source.build_root.clone());

        let project_root = self.find_project_root(&source, with_projects);
        self.projects
            .entry(project_root.clone())
            .or_insert_with(|| {
                let mut project = Project::new(&project_root);
                project.init();
                project
            });
        self.ensure_loading(&project_root);

        self.preprocess_queue.push(QueuedPreprocess {
            project: project_root,
            source,
            flags: IndexFlags::default(),
        });
        self.start_preprocess_jobs();
    }

    /// Resolve which project root a source belongs to: explicit hints, then
    /// existing projects, then build markers above the source, then the
    /// build root.
    fn find_project_root(&self, source: &Source, with_projects: &[String]) -> PathBuf {
        for hint in with_projects {
            let path = PathBuf::from(hint);
            if !hint.is_empty() {
                return path;
            }
        }
        for root in self.projects.keys() {
            if source.source_file.starts_with(root) {
                return root.clone();
            }
        }
        const MARKERS: &[&str] = &[
            "configure",
            "CMakeLists.txt",
            "compile_commands.json",
            ".git",
            "Makefile",
        ];
        let mut dir = source.source_file.parent();
        while let Some(candidate) = dir {
            if MARKERS
                .iter()
                .any(|marker| candidate.join(marker).exists())
            {
                return candidate.to_path_buf();
            }
            dir = candidate.parent();
        }
        source.build_root.clone()
    }

    fn ensure_loading(&mut self, path: &Path) {
        let Some(project) = self.projects.get_mut(path) else {
            return;
        };
        match project.state() {
            ProjectState::Unloaded | ProjectState::Inited => {
                project.begin_load();
                let data_dir = self.options.data_dir.clone();
                let project_path = path.to_path_buf();
                let events = self.events.clone();
                self.pools.spawn_background(move |_token| {
                    let database = match load_database(&data_dir, &project_path) {
                        Ok(database) => database,
                        Err(_) => None,
                    };
                    let _ = events.send(ServerEvent::ProjectLoaded {
                        path: project_path,
                        database,
                    });
                    Ok(())
                });
            }
            ProjectState::Loading | ProjectState::Loaded => {}
        }
    }

    fn on_project_loaded(&mut self, path: PathBuf, database: Option<ProjectDatabase>) {
        if let Some(project) = self.projects.get_mut(&path) {
            project.finish_load(database);
            tracing::info!(target: "cix.project", path = %path.display(), "project loaded");
        }
        for (source, cpp, flags) in self
            .waiting_for_load
            .remove(&path)
            .unwrap_or_default()
        {
            self.index(path.clone(), source, cpp, flags);
        }
        self.start_next_jobs();
    }

    // ---- preprocess stage ----------------------------------------------

    /// Drain the preprocess FIFO up to the pipeline bound.
    pub fn start_preprocess_jobs(&mut self) -> usize {
        let in_flight = self.tracker.pending_len()
            + self.tracker.processing_len()
            + self.pools.busy(PoolKind::Preprocess);
        let started = self.preprocess_queue.drain(in_flight);
        let count = started.len();
        for item in started {
            let preprocessor = Arc::clone(&self.preprocessor);
            let events = self.events.clone();
            self.pools.spawn_preprocess(move |_token| {
                let result = preprocessor
                    .preprocess(&item.source)
                    .map_err(|err| err.to_string());
                let _ = events.send(ServerEvent::PreprocessDone {
                    project: item.project,
                    source: item.source,
                    result,
                    flags: item.flags,
                });
                Ok(())
            });
        }
        count
    }

    // ---- index stage ---------------------------------------------------

    /// Admit a preprocessed source into the scheduler.
    pub fn index(
        &mut self,
        project_path: PathBuf,
        source: Source,
        cpp: Arc<cix_core::Cpp>,
        flags: IndexFlags,
    ) {
        let Some(project) = self.projects.get_mut(&project_path) else {
            return;
        };
        if project.state() != ProjectState::Loaded {
            self.ensure_loading(&project_path);
            self.waiting_for_load
                .entry(project_path)
                .or_default()
                .push((source, cpp, flags));
            return;
        }

        match project.admit(source, cpp, flags) {
            Admission::Dispatch(pending) => {
                self.dispatch(project_path, pending, JobModifiers::default());
            }
            Admission::Queued | Admission::Suspended => {}
        }
    }

    /// Create the indexer job, register it everywhere and run a dispatch
    /// pass.
    fn dispatch(&mut self, project_path: PathBuf, pending: PendingJob, modifiers: JobModifiers) {
        let id = self.tracker.next_job_id();
        if let Some(project) = self.projects.get_mut(&project_path) {
            project.job_started(id, pending.clone());
        }
        let job = IndexerJob::new(id, project_path, pending, modifiers);
        self.tracker.add_job(job);
        self.start_next_jobs();
    }

    /// One dispatch pass plus the announcement of any remaining surplus.
    pub fn start_next_jobs(&mut self) {
        let busy = self.pools.busy(PoolKind::Preprocess);
        let projects = &self.projects;
        let actions = self.tracker.start_next(
            busy,
            |path| {
                projects
                    .get(path)
                    .map(|project| project.state() == ProjectState::Loaded)
                    .unwrap_or(false)
            },
            Instant::now(),
        );

        for action in actions {
            match action {
                Dispatch::Launch(id) => self.launch(id),
                Dispatch::DropForeign(id) => {
                    tracing::debug!(target: "cix.jobs", job = %id, "dropping foreign job, project not loaded");
                }
            }
        }

        self.announce_jobs();
    }

    fn launch(&mut self, id: JobId) {
        let Some(job) = self.tracker.get(id).cloned() else {
            return;
        };
        match self.launcher.launch(&job, &self.options, self.events.clone()) {
            Ok(token) => {
                self.kill_switches.insert(id, token);
            }
            Err(error) => {
                tracing::error!(target: "cix.jobs", job = %id, error = %error, "failed to launch indexer");
                // Route through the normal exit path so crash accounting
                // runs.
                let _ = self.events.send(ServerEvent::IndexerExited {
                    job_id: id,
                    success: false,
                    stderr: error,
                });
            }
        }
    }

    /// Publish pending non-remote surplus to the cluster.
    fn announce_jobs(&mut self) {
        let surplus = self.tracker.surplus();
        if surplus == 0 {
            return;
        }
        let payload = cix_proto::encode_announcement(cix_proto::JobAnnouncement {
            jobs: surplus,
            tcp_port: self.options.tcp_port,
        });

        if let (Some(socket), Some(group)) = (
            self.multicast.clone(),
            self.options.multicast_address.clone(),
        ) {
            let port = self.options.multicast_port;
            tokio::task::spawn_local(async move {
                let _ = socket.send_to(&payload, (group.as_str(), port)).await;
            });
        }

        let forward = Message::MulticastForward(MulticastForwardMessage {
            ip: String::new(),
            port: 0,
            payload: payload.to_vec(),
        });
        for conn in self.forwards.send_targets(None) {
            if !self.conns.send(conn, forward.clone()) {
                tracing::error!(target: "cix.cluster", %conn, "unable to forward announcement");
            }
        }
    }

    // ---- job completion ------------------------------------------------

    fn handle_indexer_message(&mut self, id: ConnId, message: IndexerMessage) {
        let job = self.tracker.complete(message.data.job_id);
        self.conns.finish(id);
        let Some(job) = job else {
            tracing::debug!(
                target: "cix.jobs",
                job = %message.data.job_id,
                "dropping duplicate or unknown indexer result"
            );
            return;
        };
        self.kill_switches.remove(&job.id);
        self.finish_job(&job.project, &message.data, false);
        self.start_preprocess_jobs();
    }

    fn on_local_job_finished(&mut self, job_id: JobId, success: bool, stderr: String) {
        self.kill_switches.remove(&job_id);
        let Some((job, crashed)) = self.tracker.on_local_exit(job_id, success) else {
            self.start_next_jobs();
            self.start_preprocess_jobs();
            return;
        };

        if job.modifiers.from_remote {
            if crashed {
                tracing::warn!(
                    target: "cix.jobs",
                    file = %job.source.source_file.display(),
                    "foreign job crashed here; origin will reschedule"
                );
            } else if let Some((host, port)) = &job.origin {
                tracing::info!(
                    target: "cix.jobs",
                    file = %job.source.source_file.display(),
                    origin = %format!("{host}:{port}"),
                    "built remote job"
                );
            }
        } else if crashed {
            tracing::warn!(
                target: "cix.jobs",
                job = %job_id,
                stderr = %stderr,
                "indexer crashed"
            );
            // Surface an empty result carrying the key so the project's
            // crash counter and pending promotion still run.
            let data = IndexData {
                job_id,
                key: job.source.key(),
                message: stderr,
                ..IndexData::default()
            };
            self.finish_job(&job.project.clone(), &data, true);
        }

        self.start_next_jobs();
        self.start_preprocess_jobs();
    }

    fn finish_job(&mut self, project_path: &Path, data: &IndexData, crashed: bool) {
        let Some(project) = self.projects.get_mut(project_path) else {
            tracing::error!(
                target: "cix.jobs",
                project = %project_path.display(),
                "can't find project for indexer result"
            );
            return;
        };

        match project.on_job_finished(data, crashed) {
            JobOutcome::Merged { next } => {
                self.conns.log(
                    LogLevel::Debug,
                    &format!(
                        "indexed {} symbols for job {}",
                        data.symbols.len(),
                        data.job_id
                    ),
                );
                if let Some(next) = next {
                    self.dispatch(project_path.to_path_buf(), next, JobModifiers::default());
                }
                self.maybe_schedule_sync(project_path);
            }
            JobOutcome::Dumped { message, next } => {
                if let Some(conn) = self.dump_waiters.remove(&data.key) {
                    self.conns.write(conn, message);
                    self.conns.finish(conn);
                }
                if let Some(next) = next {
                    self.dispatch(project_path.to_path_buf(), next, JobModifiers::default());
                }
            }
            JobOutcome::Retry { job, crash_count } => {
                tracing::warn!(
                    target: "cix.jobs",
                    file = %job.source.source_file.display(),
                    crash_count,
                    "retrying crashed job"
                );
                self.dispatch(project_path.to_path_buf(), job, JobModifiers::default());
            }
            JobOutcome::GaveUp { crash_count } => {
                self.conns.log(
                    LogLevel::Error,
                    &format!(
                        "giving up on {} after {crash_count} crashes",
                        data.file_id().to_raw()
                    ),
                );
                self.maybe_schedule_sync(project_path);
            }
            JobOutcome::Stale => {
                tracing::debug!(target: "cix.jobs", job = %data.job_id, "stale job result");
            }
        }
    }

    // ---- visit-file protocol -------------------------------------------

    fn handle_visit_file(&mut self, id: ConnId, message: VisitFileMessage) {
        let mut file_id = FileId::NONE;
        let mut visit = false;
        let mut resolved = PathBuf::new();

        if let Some(project) = self.projects.get_mut(&message.project) {
            resolved = std::fs::canonicalize(&message.file).unwrap_or(message.file.clone());
            file_id = self.file_ids.insert(resolved.clone());
            visit = project.visit_file(file_id, message.job_key);
        }

        self.conns.send(
            id,
            Message::VisitFileResponse(VisitFileResponseMessage {
                file_id,
                resolved,
                visit,
            }),
        );
    }

    // ---- cluster -------------------------------------------------------

    fn handle_job_request(&mut self, id: ConnId, message: JobRequestMessage) {
        let jobs = self
            .tracker
            .take_jobs_for_peer(message.num_jobs, Instant::now());
        for job in jobs {
            tracing::debug!(
                target: "cix.cluster",
                file = %job.source.source_file.display(),
                "sending job to peer"
            );
            self.conns.send(
                id,
                Message::JobResponse(JobResponseMessage {
                    job: WireJob {
                        id: job.id,
                        project: job.project.clone(),
                        source: job.source.clone(),
                        cpp: (*job.cpp).clone(),
                        dirty: job.modifiers.dirty,
                        dump: job.modifiers.dump,
                    },
                    tcp_port: self.options.tcp_port,
                }),
            );
        }
        self.conns.finish(id);
    }

    fn handle_job_response(&mut self, id: ConnId, message: JobResponseMessage) {
        let Some((peer_ip, _)) = self.conns.peer(id) else {
            tracing::error!(target: "cix.cluster", %id, "job response without a peer address");
            return;
        };
        let JobResponseMessage { job, tcp_port } = message;
        let pending = PendingJob {
            source: job.source,
            cpp: Arc::new(job.cpp),
            flags: IndexFlags {
                dirty: job.dirty,
                dump: job.dump,
            },
        };
        let mut indexer_job = IndexerJob::new(
            job.id,
            job.project,
            pending,
            JobModifiers {
                from_remote: true,
                ..JobModifiers::default()
            },
        );
        indexer_job.origin = Some((peer_ip, tcp_port));
        self.tracker.add_job(indexer_job);
        self.start_next_jobs();
    }

    fn handle_multicast_forward_message(
        &mut self,
        id: ConnId,
        message: MulticastForwardMessage,
    ) {
        let (ip, port) = if message.ip.is_empty() || message.port == 0 {
            match self.conns.peer(id) {
                Some(peer) => peer,
                None => {
                    tracing::error!(target: "cix.cluster", %id, "unable to get peer from socket");
                    return;
                }
            }
        } else {
            (message.ip.clone(), message.port)
        };
        self.handle_multicast_data(&ip, port, &message.payload, Some(id));
    }

    /// Parse an announcement packet: fan it out over the overlay
    /// (split-horizon), then decide whether to pull jobs from the sender.
    pub fn handle_multicast_data(
        &mut self,
        ip: &str,
        port: u16,
        payload: &[u8],
        source_conn: Option<ConnId>,
    ) {
        let forward = Message::MulticastForward(MulticastForwardMessage {
            ip: ip.to_string(),
            port,
            payload: payload.to_vec(),
        });
        for conn in self.forwards.send_targets(source_conn) {
            if !self.conns.send(conn, forward.clone()) {
                tracing::error!(target: "cix.cluster", %conn, "unable to forward datagram");
            }
        }

        let records = match cix_proto::decode_announcements(payload) {
            Ok(records) => records,
            Err(err) => {
                tracing::error!(target: "cix.cluster", from = ip, error = %err, "bad multicast packet");
                return;
            }
        };
        let Some(record) = records.last().copied() else {
            return;
        };
        if record.jobs == 0 || record.tcp_port == 0 {
            return;
        }

        let available = self.tracker.available_remote(self.pools.busy(PoolKind::Preprocess));
        let wanted = (record.jobs as usize).min(available) as u16;
        if wanted > 0 {
            self.fetch_remote_jobs(ip.to_string(), record.tcp_port, wanted);
        }
    }

    fn fetch_remote_jobs(&mut self, ip: String, port: u16, jobs: u16) {
        tracing::debug!(target: "cix.cluster", peer = %format!("{ip}:{port}"), jobs, "fetching remote jobs");
        let events = self.events.clone();
        tokio::task::spawn_local(async move {
            let purpose = ConnPurpose::JobPull {
                peer: (ip.clone(), port),
                jobs,
            };
            match tokio::net::TcpStream::connect((ip.as_str(), port)).await {
                Ok(stream) => {
                    let _ = events.send(ServerEvent::NewConnection {
                        stream: Box::new(stream),
                        peer: Some((ip, port)),
                        purpose,
                    });
                }
                Err(err) => {
                    let _ = events.send(ServerEvent::DialFailed {
                        purpose,
                        error: err.to_string(),
                    });
                }
            }
        });
    }

    // ---- forwards ------------------------------------------------------

    pub fn add_forward(&mut self, addr: ForwardAddr) -> bool {
        let added = self.forwards.add(addr);
        if added {
            self.reconnect_forwards();
        }
        added
    }

    pub fn remove_forward(&mut self, addr: &ForwardAddr) -> Option<Option<ConnId>> {
        let removed = self.forwards.remove(addr);
        if let Some(Some(conn)) = &removed {
            self.conns.finish(*conn);
            self.conns.close(*conn);
        }
        removed
    }

    pub fn forwards(&self) -> &ForwardRegistry {
        &self.forwards
    }

    /// Dial every due forward; arm the single timer for the earliest
    /// not-yet-due one.
    pub fn reconnect_forwards(&mut self) {
        let now = Instant::now();
        let (due, next) = self.forwards.due_reconnects(now);
        for addr in due {
            self.forwards.dialing(&addr, now);
            let events = self.events.clone();
            let dial = addr.clone();
            tokio::task::spawn_local(async move {
                let purpose = ConnPurpose::Forward(dial.clone());
                match tokio::net::TcpStream::connect((dial.0.as_str(), dial.1)).await {
                    Ok(stream) => {
                        let _ = events.send(ServerEvent::NewConnection {
                            stream: Box::new(stream),
                            peer: Some(dial),
                            purpose,
                        });
                    }
                    Err(err) => {
                        let _ = events.send(ServerEvent::DialFailed {
                            purpose,
                            error: err.to_string(),
                        });
                    }
                }
            });
        }
        if let Some(wait) = next {
            self.arm_reconnect_timer(wait);
        }
    }

    fn schedule_forward_reconnect(&mut self) {
        // Collapse the work onto the next loop turn; the handler computes
        // due forwards and re-arms the timer.
        let _ = self.events.send(ServerEvent::ReconnectForwards);
    }

    fn arm_reconnect_timer(&mut self, wait: Duration) {
        if let Some(previous) = self.reconnect_timer.take() {
            previous.cancel();
        }
        let token = CancellationToken::new();
        let events = self.events.clone();
        let timer = token.clone();
        tokio::task::spawn_local(async move {
            tokio::select! {
                _ = timer.cancelled() => {}
                _ = tokio::time::sleep(wait) => {
                    let _ = events.send(ServerEvent::ReconnectForwards);
                }
            }
        });
        self.reconnect_timer = Some(token);
    }

    // ---- timers --------------------------------------------------------

    fn restart_unload_timer(&mut self) {
        if self.options.unload_timer_minutes == 0 {
            return;
        }
        if let Some(previous) = self.unload_timer.take() {
            previous.cancel();
        }
        let token = CancellationToken::new();
        let events = self.events.clone();
        let timer = token.clone();
        let wait = Duration::from_secs(self.options.unload_timer_minutes * 60);
        tokio::task::spawn_local(async move {
            tokio::select! {
                _ = timer.cancelled() => {}
                _ = tokio::time::sleep(wait) => {
                    let _ = events.send(ServerEvent::UnloadTick);
                }
            }
        });
        self.unload_timer = Some(token);
    }

    fn on_unload_tick(&mut self) {
        let current = self.current_project.clone();
        for (path, project) in self.projects.iter_mut() {
            if Some(path.as_path()) != current.as_deref()
                && project.state() != ProjectState::Unloaded
                && !project.is_indexing()
            {
                tracing::info!(target: "cix.project", path = %path.display(), "unloading idle project");
                project.unload();
            }
        }
    }

    /// Debounced persistence: once a project's indexing quiesces, write it
    /// out after `sync_timeout`.
    fn maybe_schedule_sync(&mut self, path: &Path) {
        let Some(project) = self.projects.get(path) else {
            return;
        };
        if project.is_indexing() {
            return;
        }
        if let Some(previous) = self.sync_timers.remove(path) {
            previous.cancel();
        }
        let token = CancellationToken::new();
        let events = self.events.clone();
        let timer = token.clone();
        let wait = self.options.sync_timeout;
        let sync_path = path.to_path_buf();
        tokio::task::spawn_local(async move {
            tokio::select! {
                _ = timer.cancelled() => {}
                _ = tokio::time::sleep(wait) => {
                    let _ = events.send(ServerEvent::SyncProject { path: sync_path });
                }
            }
        });
        self.sync_timers.insert(path.to_path_buf(), token);
    }

    fn save_project(&mut self, path: &Path) {
        let Some(project) = self.projects.get(path) else {
            return;
        };
        if project.state() != ProjectState::Loaded {
            return;
        }
        let database = project.to_database();
        if let Err(err) = save_database(&self.options.data_dir, path, &database) {
            tracing::error!(target: "cix.project", path = %path.display(), error = %err, "save failed");
        }
        if let Err(err) = save_file_ids(
            &self.options.data_dir,
            &cix_vfs::FileIdRegistry::from_snapshot(self.file_ids.paths_to_ids()),
        ) {
            tracing::error!(target: "cix.server", error = %err, "saving fileids failed");
        }
    }

    // ---- project selection ---------------------------------------------

    pub fn current_project(&self) -> Option<&Path> {
        self.current_project.as_deref()
    }

    pub fn select_project(&mut self, path: PathBuf) -> bool {
        if !self.projects.contains_key(&path) {
            return false;
        }
        self.ensure_loading(&path);
        self.current_project = Some(path.clone());
        let marker = self.options.data_dir.join(".currentProject");
        let contents = format!("{}\n", path.display());
        if let Err(err) = std::fs::write(&marker, contents) {
            tracing::error!(target: "cix.server", error = %err, "can't persist current project");
        }
        true
    }

    // ---- shutdown ------------------------------------------------------

    pub fn shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;

        // Mark first so the exit events are not mistaken for crashes.
        for id in self.tracker.running_job_ids() {
            self.tracker.abort(id);
        }
        for (_, token) in self.kill_switches.drain() {
            token.cancel();
        }
        let paths: Vec<PathBuf> = self.projects.keys().cloned().collect();
        for path in paths {
            self.save_project(&path);
            if let Some(project) = self.projects.get_mut(&path) {
                project.unload();
            }
        }
        if let Some(mut completion) = self.completion.take() {
            completion.stop();
        }
    }

    // ---- helpers shared with the query surface -------------------------

    pub(crate) fn dump_tracker(&self) -> String {
        let tracker = &self.tracker;
        tracker.dump(|id| {
            tracker
                .get(id)
                .map(|job| job.source.source_file.display().to_string())
        })
    }

    pub(crate) fn parse_location(&self, spec: &str) -> Option<Location> {
        let mut parts = spec.rsplitn(3, ':');
        let column: u32 = parts.next()?.parse().ok()?;
        let line: u32 = parts.next()?.parse().ok()?;
        let path = parts.next()?;
        let file_id = self.file_ids.get_id(Path::new(path))?;
        Some(Location::new(file_id, line, column))
    }

    pub(crate) fn format_location(&self, location: Location) -> String {
        let path = self
            .file_ids
            .get_path(location.file_id())
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| format!("<file {}>", location.file_id().to_raw()));
        format!("{}:{}:{}", path, location.line(), location.column())
    }

    pub(crate) fn completion_request(&self, request: CompletionRequest) -> bool {
        match &self.completion {
            Some(thread) => {
                thread.request(request);
                true
            }
            None => false,
        }
    }

    pub(crate) fn register_dump_waiter(&mut self, key: SourceKey, conn: ConnId) {
        self.dump_waiters.insert(key, conn);
    }

    /// Dirty a set of files in a project and re-preprocess the affected
    /// sources.
    pub(crate) fn start_dirty_jobs(&mut self, project_path: &Path, files: BTreeSet<FileId>) -> usize {
        let Some(project) = self.projects.get_mut(project_path) else {
            return 0;
        };
        let sources = project.dirty(&files);
        let count = sources.len();
        for source in sources {
            self.preprocess_queue.push(QueuedPreprocess {
                project: project_path.to_path_buf(),
                source,
                flags: IndexFlags {
                    dirty: true,
                    ..IndexFlags::default()
                },
            });
        }
        self.start_preprocess_jobs();
        count
    }
}

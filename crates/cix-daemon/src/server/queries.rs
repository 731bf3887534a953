//! The query surface: each handler reads the project state and finishes
//! the connection explicitly.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use cix_core::{FileId, Match};
use cix_index::{DependencyMode, SortFlags};
use cix_project::{delete_database, ProjectState};
use cix_proto::{QueryFlags, QueryKind, QueryMessage};

use crate::cluster::parse_host;
use crate::completion::CompletionRequest;
use crate::events::{ConnId, ServerEvent};
use crate::preprocess::QueuedPreprocess;
use cix_project::IndexFlags;

use super::Server;

/// Outcome of locating the project a query applies to.
enum ProjectFor {
    Loaded(PathBuf),
    Loading,
    None,
}

impl Server {
    pub(crate) fn handle_query(&mut self, id: ConnId, query: QueryMessage) {
        if !query.flags.silent {
            tracing::debug!(
                target: "cix.server",
                kind = ?query.kind,
                query = %query.query,
                "query"
            );
        }
        match query.kind {
            QueryKind::Sources => self.query_sources(id, &query),
            QueryKind::FollowLocation => self.query_follow_location(id, &query),
            QueryKind::ReferencesLocation => self.query_references_location(id, &query),
            QueryKind::ReferencesName => self.query_references_name(id, &query),
            QueryKind::ListSymbols => self.query_list_symbols(id, &query),
            QueryKind::FindSymbols => self.query_find_symbols(id, &query),
            QueryKind::CursorInfo => self.query_cursor_info(id, &query),
            QueryKind::Dependencies => self.query_dependencies(id, &query),
            QueryKind::FixIts => self.query_fix_its(id, &query),
            QueryKind::FindFile => self.query_find_file(id, &query),
            QueryKind::DumpFile => self.query_dump_file(id, &query),
            QueryKind::IsIndexed => self.query_is_indexed(id, &query),
            QueryKind::IsIndexing => self.query_is_indexing(id),
            QueryKind::Status => self.query_status(id),
            QueryKind::PreprocessFile => self.query_preprocess_file(id, &query),
            QueryKind::CodeCompleteAt | QueryKind::PrepareCodeCompleteAt => {
                self.query_code_complete(id, &query)
            }
            QueryKind::Reindex => self.query_reindex(id, &query),
            QueryKind::RemoveFile => self.query_remove_file(id, &query),
            QueryKind::DeleteProject => self.query_remove_project(id, &query, true),
            QueryKind::UnloadProject => self.query_remove_project(id, &query, false),
            QueryKind::ReloadProjects => {
                let count = self.reload_projects();
                self.conns.write(id, format!("{count} projects"));
                self.conns.finish(id);
            }
            QueryKind::Project => self.query_project(id, &query),
            QueryKind::JobCount => self.query_job_count(id, &query),
            QueryKind::ClearProjects => {
                self.clear_projects();
                self.conns.write(id, "Cleared projects");
                self.conns.finish(id);
            }
            QueryKind::ReloadFileManager => {
                self.conns.write(id, "Reloaded");
                self.conns.finish(id);
            }
            QueryKind::HasFileManager => {
                let has = matches!(self.project_for_query(&query), ProjectFor::Loaded(_));
                self.conns.write(id, if has { "1" } else { "0" });
                self.conns.finish(id);
            }
            QueryKind::SuspendFile => self.query_suspend_file(id, &query),
            QueryKind::SendDiagnostics => {
                self.conns.log(cix_proto::LogLevel::Debug, &query.query);
                self.conns.finish(id);
            }
            QueryKind::MulticastForward => self.query_multicast_forward(id, &query, true),
            QueryKind::RemoveMulticastForward => self.query_multicast_forward(id, &query, false),
            QueryKind::LoadCompilationDatabase => self.query_load_compilation_database(id, &query),
            QueryKind::Shutdown => {
                self.conns.write(id, "Shutting down");
                self.conns.finish(id);
                let _ = self.events.send(ServerEvent::Shutdown);
            }
        }
    }

    // ---- project resolution -------------------------------------------

    /// Project for a query: explicit project hints, then the path/pattern
    /// in the query, then the current project.
    fn project_for_query(&mut self, query: &QueryMessage) -> ProjectFor {
        for hint in &query.projects {
            let path = PathBuf::from(hint);
            if self.projects.contains_key(&path) {
                return self.classify(path);
            }
        }

        let pattern = Match::new(query.query.clone());
        if !pattern.is_empty() {
            let matching: Vec<PathBuf> = self
                .projects
                .iter()
                .filter(|(_, project)| project.matches(&pattern))
                .map(|(path, _)| path.clone())
                .collect();
            if let Some(path) = matching.first() {
                return self.classify(path.clone());
            }
        }

        match self.current_project.clone() {
            Some(path) => self.classify(path),
            None => ProjectFor::None,
        }
    }

    fn classify(&mut self, path: PathBuf) -> ProjectFor {
        self.ensure_loading(&path);
        match self.projects.get(&path).map(|p| p.state()) {
            Some(ProjectState::Loaded) => ProjectFor::Loaded(path),
            Some(_) => ProjectFor::Loading,
            None => ProjectFor::None,
        }
    }

    /// Standard preamble: resolve to a loaded project or answer the error
    /// replies of the protocol.
    fn loaded_project_or_reply(&mut self, id: ConnId, query: &QueryMessage) -> Option<PathBuf> {
        match self.project_for_query(query) {
            ProjectFor::Loaded(path) => Some(path),
            ProjectFor::Loading => {
                self.conns.write(id, "Project loading");
                self.conns.finish(id);
                None
            }
            ProjectFor::None => {
                self.conns.write(id, "No project");
                self.conns.finish(id);
                None
            }
        }
    }

    fn sort_flags(flags: &QueryFlags) -> SortFlags {
        SortFlags {
            declaration_only: flags.declaration_only,
            reverse: flags.reverse_sort,
        }
    }

    fn file_id_for(&self, path: &str) -> Option<FileId> {
        self.file_ids().get_id(Path::new(path))
    }

    // ---- handlers ------------------------------------------------------

    fn query_sources(&mut self, id: ConnId, query: &QueryMessage) {
        let Some(path) = self.loaded_project_or_reply(id, query) else {
            return;
        };
        let project = &self.projects[&path];
        let pattern = Match::new(query.query.clone());
        let mut lines = Vec::new();
        for source in project.sources().values() {
            if !pattern.is_empty() && !pattern.matches_path(&source.source_file) {
                continue;
            }
            if query.flags.compilation_flags_only {
                lines.push(format!(
                    "{}: {} {}",
                    source.source_file.display(),
                    source.compiler.display(),
                    source.arguments.join(" ")
                ));
            } else {
                lines.push(format!(
                    "{} ({:?}, build root {})",
                    source.source_file.display(),
                    source.language,
                    source.build_root.display()
                ));
            }
        }
        for line in lines {
            self.conns.write(id, line);
        }
        self.conns.finish(id);
    }

    fn query_follow_location(&mut self, id: ConnId, query: &QueryMessage) {
        let Some(location) = self.parse_location(&query.query) else {
            self.conns.write(id, "Not indexed");
            self.conns.finish(id);
            return;
        };
        let Some(path) = self.loaded_project_or_reply(id, query) else {
            return;
        };
        let project = &self.projects[&path];
        if let Some(target) = project.follow_location(location) {
            let line = self.format_location(target);
            self.conns.write(id, line);
        }
        self.conns.finish(id);
    }

    fn query_references_location(&mut self, id: ConnId, query: &QueryMessage) {
        let Some(location) = self.parse_location(&query.query) else {
            self.conns.write(id, "Not indexed");
            self.conns.finish(id);
            return;
        };
        let Some(path) = self.loaded_project_or_reply(id, query) else {
            return;
        };
        let project = &self.projects[&path];
        let references = project.references_for(location);
        let sorted = project.sort_locations(&references, Self::sort_flags(&query.flags));
        let lines: Vec<String> = sorted
            .iter()
            .map(|symbol| self.format_location(symbol.location))
            .collect();
        for line in lines {
            self.conns.write(id, line);
        }
        self.conns.finish(id);
    }

    fn query_references_name(&mut self, id: ConnId, query: &QueryMessage) {
        let Some(path) = self.loaded_project_or_reply(id, query) else {
            return;
        };
        let project = &self.projects[&path];
        let mut references: BTreeSet<cix_core::Location> = BTreeSet::new();
        for location in project.locations(&query.query, None) {
            references.extend(project.references_for(location));
        }
        let sorted = project.sort_locations(&references, Self::sort_flags(&query.flags));
        let lines: Vec<String> = sorted
            .iter()
            .map(|symbol| self.format_location(symbol.location))
            .collect();
        for line in lines {
            self.conns.write(id, line);
        }
        self.conns.finish(id);
    }

    fn query_list_symbols(&mut self, id: ConnId, query: &QueryMessage) {
        let Some(path) = self.loaded_project_or_reply(id, query) else {
            return;
        };
        let project = &self.projects[&path];
        let mut names = project.symbol_names(&Match::new(query.query.clone()));
        names.sort();
        for name in names {
            self.conns.write(id, name);
        }
        self.conns.finish(id);
    }

    fn query_find_symbols(&mut self, id: ConnId, query: &QueryMessage) {
        let Some(path) = self.loaded_project_or_reply(id, query) else {
            return;
        };
        let project = &self.projects[&path];
        let locations = project.locations(&query.query, None);
        let sorted = project.sort_locations(&locations, Self::sort_flags(&query.flags));
        let lines: Vec<String> = sorted
            .iter()
            .map(|symbol| self.format_location(symbol.location))
            .collect();
        for line in lines {
            self.conns.write(id, line);
        }
        self.conns.finish(id);
    }

    fn query_cursor_info(&mut self, id: ConnId, query: &QueryMessage) {
        let Some(location) = self.parse_location(&query.query) else {
            self.conns.finish(id);
            return;
        };
        let Some(path) = self.loaded_project_or_reply(id, query) else {
            return;
        };
        let project = &self.projects[&path];
        if let Some((at, info)) = project.cursor_info(location) {
            let data = info.data();
            let mut lines = vec![format!(
                "{} symbolName: {} kind: {:?} {}",
                self.format_location(at),
                data.symbol_name,
                data.kind,
                if info.is_definition() {
                    "definition"
                } else {
                    "declaration"
                }
            )];
            lines.push(format!(
                "  range: {}-{} targets: {} references: {}",
                data.start,
                data.end,
                data.targets.len(),
                data.references.len()
            ));
            for line in lines {
                self.conns.write(id, line);
            }
        }
        self.conns.finish(id);
    }

    fn query_dependencies(&mut self, id: ConnId, query: &QueryMessage) {
        let Some(file) = self.file_id_for(&query.query) else {
            self.conns.finish(id);
            return;
        };
        let Some(path) = self.loaded_project_or_reply(id, query) else {
            return;
        };
        let project = &self.projects[&path];
        let mode = if query.flags.arg_depends_on {
            DependencyMode::ArgDependsOn
        } else {
            DependencyMode::DependsOnArg
        };
        let lines: Vec<String> = project
            .dependencies(file, mode)
            .into_iter()
            .filter_map(|dep| self.file_ids().get_path(dep))
            .map(|p| p.display().to_string())
            .collect();
        for line in lines {
            self.conns.write(id, line);
        }
        self.conns.finish(id);
    }

    fn query_fix_its(&mut self, id: ConnId, query: &QueryMessage) {
        if let ProjectFor::Loaded(path) = self.project_for_query(query) {
            if let Some(file) = self.file_id_for(&query.query) {
                let out = self.projects[&path].fix_its(file);
                if !out.is_empty() {
                    self.conns.write(id, out);
                }
            }
        }
        self.conns.finish(id);
    }

    fn query_find_file(&mut self, id: ConnId, query: &QueryMessage) {
        let Some(path) = self.loaded_project_or_reply(id, query) else {
            return;
        };
        let project = &self.projects[&path];
        let pattern = Match::new(query.query.clone());
        let mut lines = Vec::new();
        for &file in project.store().files.keys() {
            if let Some(file_path) = self.file_ids().get_path(file) {
                if pattern.is_empty() || pattern.matches_path(&file_path) {
                    lines.push(file_path.display().to_string());
                }
            }
        }
        lines.sort();
        for line in lines {
            self.conns.write(id, line);
        }
        self.conns.finish(id);
    }

    fn query_dump_file(&mut self, id: ConnId, query: &QueryMessage) {
        let Some(file) = self.file_id_for(&query.query) else {
            self.conns.write(id, format!("{} is not indexed", query.query));
            self.conns.finish(id);
            return;
        };
        let Some(path) = self.loaded_project_or_reply(id, query) else {
            return;
        };
        let project = &self.projects[&path];
        let Some(source) = project
            .sources_for(file)
            .into_iter()
            .nth(query.build_index as usize)
            .cloned()
        else {
            self.conns
                .write(id, format!("{} build: {} not found", query.query, query.build_index));
            self.conns.finish(id);
            return;
        };

        self.register_dump_waiter(source.key(), id);
        self.preprocess_queue.push(QueuedPreprocess {
            project: path,
            source,
            flags: IndexFlags {
                dump: true,
                ..IndexFlags::default()
            },
        });
        self.start_preprocess_jobs();
        // The connection finishes when the dump result arrives.
    }

    fn query_is_indexed(&mut self, id: ConnId, query: &QueryMessage) {
        let indexed = match self.project_for_query(query) {
            ProjectFor::Loaded(path) => self
                .file_id_for(&query.query)
                .map(|file| self.projects[&path].is_indexed(file))
                .unwrap_or(false),
            _ => false,
        };
        self.conns.write(id, if indexed { "1" } else { "0" });
        self.conns.finish(id);
    }

    fn query_is_indexing(&mut self, id: ConnId) {
        let indexing = self.projects.values().any(|project| project.is_indexing());
        self.conns.write(id, if indexing { "1" } else { "0" });
        self.conns.finish(id);
    }

    fn query_status(&mut self, id: ConnId) {
        let current = self.current_project().map(Path::to_path_buf);
        let mut lines = vec![format!("projects: {}", self.projects.len())];
        for (path, project) in &self.projects {
            lines.push(format!(
                "  {} {}{}{}",
                path.display(),
                project.state().label(),
                if project.is_indexing() {
                    " indexing"
                } else {
                    ""
                },
                if Some(path) == current.as_ref() {
                    " <="
                } else {
                    ""
                }
            ));
            let jobs = project.dump_jobs();
            if !jobs.is_empty() {
                lines.push(jobs.trim_end().to_string());
            }
        }
        lines.push(self.dump_tracker());
        lines.push("forwards:".to_string());
        for line in self.forwards().status() {
            lines.push(format!("  {line}"));
        }
        for line in lines {
            self.conns.write(id, line);
        }
        self.conns.finish(id);
    }

    fn query_preprocess_file(&mut self, id: ConnId, query: &QueryMessage) {
        let Some(file) = self.file_id_for(&query.query) else {
            self.conns.write(id, "No source");
            self.conns.finish(id);
            return;
        };
        let Some(path) = self.loaded_project_or_reply(id, query) else {
            return;
        };
        let project = &self.projects[&path];
        let Some(source) = project
            .sources_for(file)
            .into_iter()
            .nth(query.build_index as usize)
            .cloned()
        else {
            self.conns.write(id, "No source");
            self.conns.finish(id);
            return;
        };

        let Some(reply) = self.conns.sender(id) else {
            return;
        };
        let preprocessor = std::sync::Arc::clone(&self.preprocessor);
        self.pools.spawn_preprocess(move |_token| {
            match preprocessor.preprocess(&source) {
                Ok(cpp) => {
                    let _ = reply.send(cix_proto::Message::Response(cpp.preprocessed));
                }
                Err(err) => {
                    let _ = reply.send(cix_proto::Message::Response(format!(
                        "preprocess failed: {err}"
                    )));
                }
            }
            let _ = reply.send(cix_proto::Message::Finish);
            Ok(())
        });
    }

    fn query_code_complete(&mut self, id: ConnId, query: &QueryMessage) {
        // The payload is `path:line:col`; the file may not be indexed yet,
        // so split it without consulting the registry.
        let mut parts = query.query.rsplitn(3, ':');
        let column: Option<u32> = parts.next().and_then(|s| s.parse().ok());
        let line: Option<u32> = parts.next().and_then(|s| s.parse().ok());
        let file = parts.next().map(PathBuf::from);
        let (Some(column), Some(line), Some(file)) = (column, line, file) else {
            self.conns.write(id, "Invalid location");
            self.conns.finish(id);
            return;
        };

        let Some(path) = self.loaded_project_or_reply(id, query) else {
            return;
        };
        let project = &self.projects[&path];
        let Some(file_id) = self.file_id_for(&file.display().to_string()) else {
            self.conns.write(id, format!("No source found for {}", file.display()));
            self.conns.finish(id);
            return;
        };
        let Some(source) = project
            .sources_for(file_id)
            .into_iter()
            .nth(query.build_index as usize)
            .cloned()
        else {
            self.conns.write(id, format!("No source found for {}", file.display()));
            self.conns.finish(id);
            return;
        };

        let reply = self.conns.sender(id);
        let request = CompletionRequest {
            source,
            line,
            column,
            unsaved: None,
            refresh_only: query.kind == QueryKind::PrepareCodeCompleteAt,
            reply,
        };
        if !self.completion_request(request) {
            self.conns.write(id, "Completions not available");
            self.conns.finish(id);
        }
        // Otherwise the completion thread finishes the connection.
    }

    fn query_reindex(&mut self, id: ConnId, query: &QueryMessage) {
        let Some(path) = self.loaded_project_or_reply(id, query) else {
            return;
        };
        let pattern = Match::new(query.query.clone());
        let sources = self
            .projects
            .get_mut(&path)
            .map(|project| project.reindex(&pattern))
            .unwrap_or_default();
        let count = sources.len();
        for source in sources {
            self.preprocess_queue.push(QueuedPreprocess {
                project: path.clone(),
                source,
                flags: IndexFlags {
                    dirty: true,
                    ..IndexFlags::default()
                },
            });
        }
        self.start_preprocess_jobs();
        if count > 0 {
            self.conns.write(id, format!("Dirtied {count} files"));
        } else {
            self.conns.write(id, "No matches");
        }
        self.conns.finish(id);
    }

    fn query_remove_file(&mut self, id: ConnId, query: &QueryMessage) {
        let Some(path) = self.loaded_project_or_reply(id, query) else {
            return;
        };
        let pattern = Match::new(query.query.clone());
        let count = self
            .projects
            .get_mut(&path)
            .map(|project| project.remove_sources(&pattern))
            .unwrap_or(0);
        if count > 0 {
            self.conns.write(id, format!("Removed {count} files"));
        } else {
            self.conns.write(id, "No matches");
        }
        self.conns.finish(id);
    }

    fn query_remove_project(&mut self, id: ConnId, query: &QueryMessage, delete: bool) {
        let pattern = Match::new(query.query.clone());
        let matching: Vec<PathBuf> = self
            .projects
            .iter()
            .filter(|(path, project)| {
                pattern.matches_path(path) || project.matches(&pattern)
            })
            .map(|(path, _)| path.clone())
            .collect();

        for path in &matching {
            if let Some(project) = self.projects.get_mut(path) {
                project.unload();
            }
            if delete {
                delete_database(&self.options.data_dir, path);
                self.projects.remove(path);
                if self.current_project() == Some(path.as_path()) {
                    self.current_project = None;
                    let _ = std::fs::remove_file(self.options.data_dir.join(".currentProject"));
                }
                self.conns.write(id, format!("Deleted project: {}", path.display()));
            } else {
                self.conns.write(id, format!("Unloaded project: {}", path.display()));
            }
        }
        if matching.is_empty() {
            self.conns.write(id, "No matches");
        }
        self.conns.finish(id);
    }

    fn query_project(&mut self, id: ConnId, query: &QueryMessage) {
        if query.query.is_empty() {
            let current = self.current_project().map(Path::to_path_buf);
            let mut lines: Vec<String> = self
                .projects
                .iter()
                .map(|(path, project)| {
                    format!(
                        "{} {}{}",
                        path.display(),
                        project.state().label(),
                        if Some(path) == current.as_ref() { " <=" } else { "" }
                    )
                })
                .collect();
            lines.sort();
            for line in lines {
                self.conns.write(id, line);
            }
            self.conns.finish(id);
            return;
        }

        let exact = PathBuf::from(&query.query);
        let selected = if self.projects.contains_key(&exact) {
            Some(exact)
        } else {
            let pattern = Match::new(query.query.clone());
            let mut matching: Vec<PathBuf> = self
                .projects
                .iter()
                .filter(|(_, project)| project.matches(&pattern))
                .map(|(path, _)| path.clone())
                .collect();
            matching.sort();
            if matching.len() > 1 {
                self.conns
                    .write(id, format!("Multiple matches for {}", query.query));
                for path in &matching {
                    let line = path.display().to_string();
                    self.conns.write(id, line);
                }
                self.conns.finish(id);
                return;
            }
            matching.pop()
        };

        match selected {
            Some(path) => {
                if self.current_project() != Some(path.as_path()) {
                    self.select_project(path.clone());
                    self.conns
                        .write(id, format!("Selected project: {}", path.display()));
                }
            }
            None => {
                self.conns
                    .write(id, format!("No matches for {}", query.query));
            }
        }
        self.conns.finish(id);
    }

    fn query_job_count(&mut self, id: ConnId, query: &QueryMessage) {
        if query.query.is_empty() {
            self.conns
                .write(id, format!("Running with {} jobs", self.options.job_count));
        } else {
            match query.query.parse::<usize>() {
                Ok(count) if (1..=100).contains(&count) => {
                    self.options.job_count = count;
                    self.tracker.set_job_count(count);
                    self.conns.write(id, format!("Changed jobs to {count}"));
                }
                _ => {
                    self.conns
                        .write(id, format!("Invalid job count {}", query.query));
                }
            }
        }
        self.conns.finish(id);
    }

    fn query_suspend_file(&mut self, id: ConnId, query: &QueryMessage) {
        let Some(path) = self.loaded_project_or_reply(id, query) else {
            return;
        };

        if query.query.is_empty() {
            let suspended = self.projects[&path].suspended_files().clone();
            if suspended.is_empty() {
                self.conns.write(
                    id,
                    format!("No files suspended for project {}", path.display()),
                );
            } else {
                let lines: Vec<String> = suspended
                    .iter()
                    .filter_map(|&file| self.file_ids().get_path(file))
                    .map(|p| format!("{} is suspended", p.display()))
                    .collect();
                for line in lines {
                    self.conns.write(id, line);
                }
            }
        } else if query.query == "clear" {
            if let Some(project) = self.projects.get_mut(&path) {
                project.clear_suspended_files();
            }
            self.conns.write(id, "No files are suspended");
        } else if !Path::new(&query.query).is_file() {
            self.conns
                .write(id, format!("{} doesn't seem to exist", query.query));
        } else {
            let file = self.file_ids().insert(PathBuf::from(&query.query));
            let suspended = self
                .projects
                .get_mut(&path)
                .map(|project| project.toggle_suspend(file))
                .unwrap_or(false);
            self.conns.write(
                id,
                format!(
                    "{} is {} suspended",
                    query.query,
                    if suspended { "now" } else { "no longer" }
                ),
            );
        }
        self.conns.finish(id);
    }

    fn query_multicast_forward(&mut self, id: ConnId, query: &QueryMessage, add: bool) {
        if query.query.is_empty() {
            self.reconnect_forwards();
            let lines = self.forwards().status();
            for line in lines {
                self.conns.write(id, line);
            }
            self.conns.finish(id);
            return;
        }

        let Some(host) = parse_host(&query.query, self.options.tcp_port) else {
            self.conns.write(id, format!("Invalid host {}", query.query));
            self.conns.finish(id);
            return;
        };

        if add {
            if self.forwards().is_connected(&host) {
                self.conns
                    .write(id, format!("Already connected to host {}:{}", host.0, host.1));
            } else if self.add_forward(host.clone()) {
                self.conns
                    .write(id, format!("Connecting to host {}:{}", host.0, host.1));
            } else {
                // Known but disconnected: the reconnect pass picks it up.
                self.reconnect_forwards();
                self.conns
                    .write(id, format!("Connecting to host {}:{}", host.0, host.1));
            }
        } else {
            match self.remove_forward(&host) {
                Some(Some(_)) => self
                    .conns
                    .write(id, format!("Disconnecting forward to {}:{}", host.0, host.1)),
                Some(None) => self
                    .conns
                    .write(id, format!("Removed forward to {}:{}", host.0, host.1)),
                None => self
                    .conns
                    .write(id, format!("No forward to {}:{}", host.0, host.1)),
            }
        }
        self.conns.finish(id);
    }

    fn query_load_compilation_database(&mut self, id: ConnId, query: &QueryMessage) {
        let dir = PathBuf::from(&query.query);
        let file = if dir.is_dir() {
            dir.join("compile_commands.json")
        } else {
            dir
        };

        #[derive(serde::Deserialize)]
        struct Entry {
            directory: PathBuf,
            #[serde(default)]
            command: Option<String>,
            #[serde(default)]
            arguments: Option<Vec<String>>,
        }

        let entries: Vec<Entry> = match std::fs::read_to_string(&file)
            .map_err(|err| err.to_string())
            .and_then(|text| serde_json::from_str(&text).map_err(|err| err.to_string()))
        {
            Ok(entries) => entries,
            Err(error) => {
                tracing::error!(target: "cix.server", file = %file.display(), error = %error, "can't load compilation database");
                self.conns.write(id, "Can't load compilation database");
                self.conns.finish(id);
                return;
            }
        };

        let mut count = 0usize;
        for entry in entries {
            let command = match (entry.command, entry.arguments) {
                (Some(command), _) => command,
                (None, Some(arguments)) => arguments.join(" "),
                (None, None) => continue,
            };
            self.compile(&command, &entry.directory, &query.projects);
            count += 1;
        }
        self.conns
            .write(id, format!("Compilation database loaded ({count} commands)"));
        self.conns.finish(id);
    }
}

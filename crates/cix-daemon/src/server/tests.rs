//! End-to-end pipeline tests: compile admission through preprocess,
//! dispatch, merge and the query surface, with a recording launcher in
//! place of real indexer processes.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::LocalSet;
use tokio_util::sync::CancellationToken;

use cix_clang::testing::FakePreprocessor;
use cix_core::Location;
use cix_index::{IndexData, SymbolData, SymbolInfo, SymbolKind, SymbolTag};
use cix_proto::{
    read_message, write_message, IndexerMessage, JobRequestMessage, Message, QueryKind,
    QueryMessage,
};

use crate::config::Options;
use crate::events::{event_channel, EventReceiver, EventSender, ServerEvent};
use crate::jobs::IndexerJob;

use super::{IndexerLauncher, Server};

#[derive(Clone, Default)]
struct RecordingLauncher {
    launched: Rc<RefCell<Vec<IndexerJob>>>,
}

impl IndexerLauncher for RecordingLauncher {
    fn launch(
        &self,
        job: &IndexerJob,
        _options: &Options,
        _events: EventSender,
    ) -> Result<CancellationToken, String> {
        self.launched.borrow_mut().push(job.clone());
        Ok(CancellationToken::new())
    }
}

struct Fixture {
    server: Server,
    events: EventSender,
    event_rx: EventReceiver,
    launched: Rc<RefCell<Vec<IndexerJob>>>,
    _data_dir: tempfile::TempDir,
    root: tempfile::TempDir,
}

fn fixture() -> Fixture {
    let data_dir = tempfile::TempDir::new().unwrap();
    let root = tempfile::TempDir::new().unwrap();
    // A build marker so project-root discovery lands on the temp root.
    std::fs::write(root.path().join("Makefile"), "all:\n").unwrap();

    let options = Options {
        job_count: 2,
        data_dir: data_dir.path().to_path_buf(),
        sync_timeout: Duration::from_millis(10),
        ..Options::default()
    };

    let (events, event_rx) = event_channel();
    let launcher = RecordingLauncher::default();
    let launched = Rc::clone(&launcher.launched);
    let mut server = Server::new(
        options,
        Arc::new(FakePreprocessor::default()),
        Box::new(launcher),
        None,
        events.clone(),
    );
    server.init();

    Fixture {
        server,
        events,
        event_rx,
        launched,
        _data_dir: data_dir,
        root,
    }
}

impl Fixture {
    /// Pump events until `predicate` holds or a timeout hits.
    async fn drain_until(&mut self, predicate: impl Fn(&Server) -> bool) {
        for _ in 0..200 {
            if predicate(&self.server) {
                return;
            }
            match tokio::time::timeout(Duration::from_millis(50), self.event_rx.recv()).await {
                Ok(Some(event)) => self.server.handle_event(event),
                Ok(None) => break,
                Err(_) => {}
            }
        }
        assert!(predicate(&self.server), "timed out waiting for condition");
    }

    fn source_path(&self) -> PathBuf {
        self.root.path().join("a.c")
    }

    fn compile_one(&mut self) {
        std::fs::write(self.source_path(), "int foo();\nint main() { return foo(); }\n")
            .unwrap();
        let command = format!("cc -c {}", self.source_path().display());
        self.server.compile(&command, self.root.path(), &[]);
    }

    /// The canonical one-unit result: `foo` declared at 1:5, called at 2:5.
    fn result_for(&self, job: &IndexerJob) -> IndexData {
        let file = job.source.file_id;
        let decl = Location::new(file, 1, 5);
        let call = Location::new(file, 2, 5);

        let mut data = IndexData {
            job_id: job.id,
            key: job.source.key(),
            parse_duration_ms: 1,
            ..IndexData::default()
        };
        let mut declaration = SymbolData {
            symbol_length: 3,
            symbol_name: "foo".into(),
            kind: SymbolKind::Function,
            tag: SymbolTag::Definition(true),
            start: 4,
            end: 7,
            ..SymbolData::new()
        };
        declaration.references.insert(call);
        data.symbols.insert(decl, SymbolInfo::new(declaration));

        let mut call_site = SymbolData {
            symbol_length: 3,
            symbol_name: "foo".into(),
            kind: SymbolKind::Reference,
            tag: SymbolTag::Definition(false),
            start: 30,
            end: 33,
            ..SymbolData::new()
        };
        call_site.targets.insert(decl);
        data.symbols.insert(call, SymbolInfo::new(call_site));

        data.symbol_names
            .entry("foo".into())
            .or_default()
            .extend([decl, call]);
        data.dependencies.entry(file).or_default().insert(file);
        data.visited.insert(file, true);
        data
    }

    fn project_path(&self) -> PathBuf {
        self.root.path().to_path_buf()
    }
}

#[tokio::test]
async fn compile_flows_through_preprocess_to_a_launched_job() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let mut fx = fixture();
            fx.compile_one();

            let launched = fx_launched(&fx);
            fx.drain_until(move |_| false_or(&launched, 1)).await;

            let launched = fx.launched.borrow();
            assert_eq!(launched.len(), 1);
            assert_eq!(launched[0].source.source_file, fx.source_path());
            assert!(!launched[0].modifiers.from_remote);
        })
        .await;
}

// Helper because closures in drain_until can't borrow fx twice.
fn fx_launched(fx: &Fixture) -> Rc<RefCell<Vec<IndexerJob>>> {
    Rc::clone(&fx.launched)
}

fn false_or(launched: &Rc<RefCell<Vec<IndexerJob>>>, want: usize) -> bool {
    launched.borrow().len() >= want
}

#[tokio::test]
async fn index_then_query_follows_the_call() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let mut fx = fixture();
            fx.compile_one();
            let launched = fx_launched(&fx);
            fx.drain_until(move |_| false_or(&launched, 1)).await;

            let job = fx.launched.borrow()[0].clone();
            let data = fx.result_for(&job);

            // The indexer reports over a connection, then the process
            // exits cleanly.
            let (_indexer_conn, daemon_side) = tokio::io::duplex(1 << 20);
            let id = fx
                .server
                .conns
                .register(Box::new(daemon_side), None, fx.events.clone());
            fx.server.handle_message(
                id,
                Message::Indexer(IndexerMessage {
                    project: job.project.clone(),
                    data,
                }),
            );
            fx.server.handle_event(ServerEvent::IndexerExited {
                job_id: job.id,
                success: true,
                stderr: String::new(),
            });

            let project = &fx.server.projects()[&fx.project_path()];
            let file = job.source.file_id;
            let decl = Location::new(file, 1, 5);
            let call = Location::new(file, 2, 5);

            assert_eq!(
                project.locations("foo", None),
                [decl, call].into_iter().collect::<BTreeSet<_>>()
            );
            assert_eq!(project.follow_location(call), Some(decl));
            assert!(project
                .references_for(Location::new(file, 1, 6))
                .contains(&call));
            assert!(!project.is_indexing());

            // And over the wire: a follow-location query on its own
            // connection.
            let (mut client, daemon_side) = tokio::io::duplex(1 << 20);
            fx.server
                .conns
                .register(Box::new(daemon_side), None, fx.events.clone());
            let spec = format!("{}:2:5", fx.source_path().display());
            write_message(
                &mut client,
                &Message::Query(QueryMessage::new(QueryKind::FollowLocation, spec)),
            )
            .await
            .unwrap();
            fx.drain_until(|server| server.projects().len() == 1).await;
            // Pump the query through.
            for _ in 0..10 {
                if let Ok(Some(event)) =
                    tokio::time::timeout(Duration::from_millis(50), fx.event_rx.recv()).await
                {
                    fx.server.handle_event(event);
                }
            }
            let reply = read_message(&mut client).await.unwrap();
            let expected = format!("{}:1:5", fx.source_path().display());
            assert_eq!(reply, Message::Response(expected));
            assert_eq!(read_message(&mut client).await.unwrap(), Message::Finish);
        })
        .await;
}

#[tokio::test]
async fn crashes_retry_then_succeed() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let mut fx = fixture();
            fx.compile_one();
            let launched = fx_launched(&fx);
            fx.drain_until(move |_| false_or(&launched, 1)).await;

            // Two crashes: each exit triggers a retry dispatch.
            for attempt in 1..=2usize {
                let job = fx.launched.borrow().last().unwrap().clone();
                fx.server.handle_event(ServerEvent::IndexerExited {
                    job_id: job.id,
                    success: false,
                    stderr: "segfault".into(),
                });
                let launched = fx_launched(&fx);
                let want = attempt + 1;
                fx.drain_until(move |_| false_or(&launched, want)).await;
            }

            // Third attempt succeeds and resets the crash counter.
            let job = fx.launched.borrow().last().unwrap().clone();
            let data = fx.result_for(&job);
            let (_client, daemon_side) = tokio::io::duplex(1 << 16);
            let id = fx
                .server
                .conns
                .register(Box::new(daemon_side), None, fx.events.clone());
            fx.server.handle_message(
                id,
                Message::Indexer(IndexerMessage {
                    project: job.project.clone(),
                    data,
                }),
            );
            fx.server.handle_event(ServerEvent::IndexerExited {
                job_id: job.id,
                success: true,
                stderr: String::new(),
            });

            let project = &fx.server.projects()[&fx.project_path()];
            assert!(project.locations("foo", None).len() == 2);
            assert!(!project.is_indexing());
        })
        .await;
}

#[tokio::test]
async fn dirty_cascade_reindexes_dependents() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let mut fx = fixture();
            fx.compile_one();
            let launched = fx_launched(&fx);
            fx.drain_until(move |_| false_or(&launched, 1)).await;

            let job = fx.launched.borrow()[0].clone();
            let header = fx.server.file_ids().insert(fx.root.path().join("h.h"));
            let mut data = fx.result_for(&job);
            data.dependencies
                .entry(header)
                .or_default()
                .insert(job.source.file_id);
            data.visited.insert(header, true);

            let (_client, daemon_side) = tokio::io::duplex(1 << 16);
            let id = fx
                .server
                .conns
                .register(Box::new(daemon_side), None, fx.events.clone());
            fx.server.handle_message(
                id,
                Message::Indexer(IndexerMessage {
                    project: job.project.clone(),
                    data,
                }),
            );
            fx.server.handle_event(ServerEvent::IndexerExited {
                job_id: job.id,
                success: true,
                stderr: String::new(),
            });

            // Dirty the header: its dependent source reindexes with the
            // dirty modifier, and no symbol in the header survives.
            let count = fx
                .server
                .start_dirty_jobs(&fx.project_path(), [header].into_iter().collect());
            assert_eq!(count, 1);

            let launched = fx_launched(&fx);
            fx.drain_until(move |_| false_or(&launched, 2)).await;
            let redispatched = fx.launched.borrow().last().unwrap().clone();
            assert!(redispatched.modifiers.dirty);
            assert_eq!(redispatched.source.source_file, fx.source_path());

            let project = &fx.server.projects()[&fx.project_path()];
            assert!(!project.is_indexed(header));
        })
        .await;
}

#[tokio::test]
async fn peers_pull_jobs_and_results_merge_once() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let mut fx = fixture();
            // Saturate the single local slot so a second job stays pending.
            fx.server.options.job_count = 1;
            fx.server.tracker.set_job_count(1);

            fx.compile_one();
            let launched = fx_launched(&fx);
            fx.drain_until(move |_| false_or(&launched, 1)).await;

            // A second source for the same project.
            let second = fx.root.path().join("b.c");
            std::fs::write(&second, "int bar() { return 0; }\n").unwrap();
            let command = format!("cc -c {}", second.display());
            fx.server.compile(&command, fx.root.path(), &[]);
            fx.drain_until(|server| server.tracker.pending_len() == 1).await;

            // A peer connects and asks for jobs.
            let (mut peer, daemon_side) = tokio::io::duplex(1 << 20);
            let id = fx.server.conns.register(
                Box::new(daemon_side),
                Some(("10.0.0.9".into(), 9999)),
                fx.events.clone(),
            );
            fx.server
                .handle_message(id, Message::JobRequest(JobRequestMessage { num_jobs: 4 }));

            let Message::JobResponse(response) = read_message(&mut peer).await.unwrap() else {
                panic!("expected a job response");
            };
            assert_eq!(response.job.source.source_file, second);
            assert_eq!(read_message(&mut peer).await.unwrap(), Message::Finish);
            assert_eq!(fx.server.tracker.pending_len(), 0);

            // The peer's result comes back as an indexer message and
            // merges; a late duplicate is dropped.
            let handed = fx.server.tracker.get(response.job.id).cloned().unwrap();
            assert!(handed.modifiers.remote);
            let data = fx.result_for(&handed);
            fx.server.handle_message(
                id,
                Message::Indexer(IndexerMessage {
                    project: handed.project.clone(),
                    data: data.clone(),
                }),
            );
            let before = fx.server.projects()[&fx.project_path()]
                .locations("foo", None)
                .len();
            fx.server.handle_message(
                id,
                Message::Indexer(IndexerMessage {
                    project: handed.project.clone(),
                    data,
                }),
            );
            let after = fx.server.projects()[&fx.project_path()]
                .locations("foo", None)
                .len();
            assert_eq!(before, after);
        })
        .await;
}

#[tokio::test]
async fn pulled_jobs_are_admitted_as_foreign_with_an_origin() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let mut fx = fixture();
            // A loaded project under the same root the wire job names.
            fx.compile_one();
            let launched = fx_launched(&fx);
            fx.drain_until(move |_| false_or(&launched, 1)).await;

            let second = fx.root.path().join("b.c");
            std::fs::write(&second, "int bar();\n").unwrap();
            let wire = cix_proto::WireJob {
                id: cix_core::JobId::from_raw(0xbeef),
                project: fx.project_path(),
                source: cix_core::Source {
                    file_id: cix_core::FileId::from_raw(77),
                    build_root_id: cix_core::FileId::from_raw(78),
                    source_file: second,
                    build_root: fx.project_path(),
                    compiler: PathBuf::from("cc"),
                    language: cix_core::SourceLanguage::C,
                    arguments: Vec::new(),
                },
                cpp: cix_core::Cpp::default(),
                dirty: false,
                dump: false,
            };

            let (_peer, daemon_side) = tokio::io::duplex(1 << 16);
            let id = fx.server.conns.register(
                Box::new(daemon_side),
                Some(("10.0.0.7".into(), 0)),
                fx.events.clone(),
            );
            fx.server.handle_message(
                id,
                Message::JobResponse(cix_proto::JobResponseMessage {
                    job: wire,
                    tcp_port: 7000,
                }),
            );

            // The foreign job launched (slot free) with its origin filled
            // in from the peer address and the advertised port.
            let launched = fx_launched(&fx);
            fx.drain_until(move |_| false_or(&launched, 2)).await;
            let job = fx.launched.borrow().last().unwrap().clone();
            assert!(job.modifiers.from_remote);
            assert_eq!(job.origin, Some(("10.0.0.7".to_string(), 7000)));
        })
        .await;
}

#[tokio::test]
async fn visit_file_answers_true_exactly_once() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let mut fx = fixture();
            fx.compile_one();
            let launched = fx_launched(&fx);
            fx.drain_until(move |_| false_or(&launched, 1)).await;
            let job = fx.launched.borrow()[0].clone();

            let (mut indexer, daemon_side) = tokio::io::duplex(1 << 16);
            let id = fx
                .server
                .conns
                .register(Box::new(daemon_side), None, fx.events.clone());

            let header = fx.root.path().join("h.h");
            std::fs::write(&header, "int foo();\n").unwrap();

            for expected in [true, false] {
                fx.server.handle_message(
                    id,
                    Message::VisitFile(cix_proto::VisitFileMessage {
                        project: job.project.clone(),
                        file: header.clone(),
                        job_key: job.source.key(),
                    }),
                );
                let Message::VisitFileResponse(response) =
                    read_message(&mut indexer).await.unwrap()
                else {
                    panic!("expected a visit-file response");
                };
                assert_eq!(response.visit, expected);
                assert!(response.file_id.is_valid());
            }
        })
        .await;
}

#[tokio::test]
async fn project_database_syncs_and_reloads() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let mut fx = fixture();
            fx.compile_one();
            let launched = fx_launched(&fx);
            fx.drain_until(move |_| false_or(&launched, 1)).await;

            let job = fx.launched.borrow()[0].clone();
            let data = fx.result_for(&job);
            let (_client, daemon_side) = tokio::io::duplex(1 << 16);
            let id = fx
                .server
                .conns
                .register(Box::new(daemon_side), None, fx.events.clone());
            fx.server.handle_message(
                id,
                Message::Indexer(IndexerMessage {
                    project: job.project.clone(),
                    data,
                }),
            );
            fx.server.handle_event(ServerEvent::IndexerExited {
                job_id: job.id,
                success: true,
                stderr: String::new(),
            });

            // The debounced sync fires and writes the database.
            fx.drain_until(|server| {
                cix_project::database_file(&server.options.data_dir, server.projects().keys().next().unwrap())
                    .exists()
            })
            .await;

            // A fresh server over the same data dir re-registers the
            // project and restores ids for known paths.
            let (events, _rx) = event_channel();
            let mut reloaded = Server::new(
                fx.server.options.clone(),
                Arc::new(FakePreprocessor::default()),
                Box::new(RecordingLauncher::default()),
                None,
                events,
            );
            reloaded.init();
            assert!(reloaded.projects().contains_key(&fx.project_path()));
            assert_eq!(
                reloaded.file_ids().get_id(&fx.source_path()),
                Some(job.source.file_id)
            );
        })
        .await;
}

#[tokio::test]
async fn queries_against_unknown_projects_reply_no_project() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let mut fx = fixture();
            let (mut client, daemon_side) = tokio::io::duplex(1 << 16);
            let id = fx
                .server
                .conns
                .register(Box::new(daemon_side), None, fx.events.clone());

            fx.server.handle_message(
                id,
                Message::Query(QueryMessage::new(QueryKind::ListSymbols, "")),
            );
            assert_eq!(
                read_message(&mut client).await.unwrap(),
                Message::Response("No project".into())
            );
            assert_eq!(read_message(&mut client).await.unwrap(), Message::Finish);
        })
        .await;
}

//! The indexer side of the daemon protocol.
//!
//! One process per translation unit: the job arrives framed on stdin, the
//! daemon connection answers visit-file questions, and the run ends with a
//! single `IndexerMessage`. Parsing itself is delegated to a
//! [`UnitIndexer`] implementation; everything here is plumbing.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};

use cix_clang::{FileVisitor, UnitIndexer, VisitAnswer};
use cix_core::FileId;
use cix_proto::{
    read_message_sync, write_message_sync, IndexerMessage, Message, WireJob,
};

/// Read the job frame the daemon piped to stdin.
pub fn read_job(stdin: &mut impl Read) -> Result<WireJob> {
    match read_message_sync(stdin).context("read job from stdin")? {
        Message::JobResponse(response) => Ok(response.job),
        other => bail!("expected a job on stdin, got {other:?}"),
    }
}

/// Visit-file arbiter backed by the daemon connection: one synchronous
/// round-trip per file.
struct SocketVisitor<'a, S> {
    stream: &'a mut S,
    project: PathBuf,
    job_key: u64,
}

impl<S: Read + Write> FileVisitor for SocketVisitor<'_, S> {
    fn should_visit(&mut self, file: &Path) -> VisitAnswer {
        let blocked = VisitAnswer {
            file_id: FileId::NONE,
            resolved: file.to_path_buf(),
            visit: false,
        };

        let question = Message::VisitFile(cix_proto::VisitFileMessage {
            project: self.project.clone(),
            file: file.to_path_buf(),
            job_key: self.job_key,
        });
        if write_message_sync(self.stream, &question).is_err() {
            return blocked;
        }
        match read_message_sync(self.stream) {
            Ok(Message::VisitFileResponse(response)) => VisitAnswer {
                file_id: response.file_id,
                resolved: response.resolved,
                visit: response.visit,
            },
            _ => blocked,
        }
    }
}

/// Run one job end to end over `stream` and report the result.
///
/// An indexing failure becomes a process-level error (non-zero exit); the
/// daemon's crash accounting takes it from there.
pub fn run_job<S>(job: WireJob, indexer: &dyn UnitIndexer, stream: &mut S) -> Result<()>
where
    S: Read + Write,
{
    let project = job.project.clone();
    let key = job.source.key();

    let mut visitor = SocketVisitor {
        stream,
        project: project.clone(),
        job_key: key,
    };
    let mut data = indexer
        .index(&job.source, &job.cpp, &mut visitor)
        .map_err(|err| anyhow!("indexing {} failed: {err}", job.source.source_file.display()))?;

    data.job_id = job.id;
    data.key = key;
    if job.dump && data.message.is_empty() {
        data.message = format!(
            "{}: {} symbols, {} names",
            job.source.source_file.display(),
            data.symbols.len(),
            data.symbol_names.len()
        );
    }

    write_message_sync(stream, &Message::Indexer(IndexerMessage { project, data }))
        .context("send indexer result")
}

#[cfg(test)]
mod tests {
    use super::*;
    use cix_clang::testing::{FakeIndexer, ScriptedSymbol};
    use cix_core::{Cpp, JobId, Source, SourceLanguage};
    use cix_proto::VisitFileResponseMessage;
    use std::collections::VecDeque;

    /// A scripted daemon: answers every visit question from a queue and
    /// records what the indexer sent.
    struct FakeDaemon {
        answers: VecDeque<VisitFileResponseMessage>,
        inbound: Vec<u8>,
        outbound: VecDeque<u8>,
    }

    impl FakeDaemon {
        fn new(answers: Vec<VisitFileResponseMessage>) -> Self {
            Self {
                answers: answers.into(),
                inbound: Vec::new(),
                outbound: VecDeque::new(),
            }
        }

        fn sent_messages(&mut self) -> Vec<Message> {
            let mut out = Vec::new();
            let mut cursor = std::io::Cursor::new(std::mem::take(&mut self.inbound));
            while let Ok(message) = read_message_sync(&mut cursor) {
                out.push(message);
            }
            out
        }
    }

    impl Read for FakeDaemon {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.outbound.is_empty() {
                // Produce the next scripted answer on demand.
                let Some(answer) = self.answers.pop_front() else {
                    return Ok(0);
                };
                let mut bytes = Vec::new();
                write_message_sync(&mut bytes, &Message::VisitFileResponse(answer)).unwrap();
                self.outbound.extend(bytes);
            }
            let n = buf.len().min(self.outbound.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.outbound.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    impl Write for FakeDaemon {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.inbound.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn wire_job() -> WireJob {
        WireJob {
            id: JobId::from_raw(7),
            project: PathBuf::from("/src/proj"),
            source: Source {
                file_id: FileId::from_raw(1),
                build_root_id: FileId::from_raw(2),
                source_file: PathBuf::from("/src/proj/a.c"),
                build_root: PathBuf::from("/src/proj"),
                compiler: PathBuf::from("cc"),
                language: SourceLanguage::C,
                arguments: Vec::new(),
            },
            cpp: Cpp {
                preprocessed: "int foo();\nfoo();\n".into(),
                duration_ms: 1,
            },
            dirty: false,
            dump: false,
        }
    }

    #[test]
    fn job_round_trip_produces_an_indexer_message() {
        let indexer = FakeIndexer::with_symbols(vec![ScriptedSymbol {
            file: PathBuf::from("/src/proj/a.c"),
            line: 1,
            column: 5,
            name: "foo".into(),
            definition: true,
            target: None,
        }]);
        let mut daemon = FakeDaemon::new(vec![VisitFileResponseMessage {
            file_id: FileId::from_raw(1),
            resolved: PathBuf::from("/src/proj/a.c"),
            visit: true,
        }]);

        run_job(wire_job(), &indexer, &mut daemon).unwrap();

        let messages = daemon.sent_messages();
        // One visit question for the root file, then the result.
        assert!(matches!(messages[0], Message::VisitFile(_)));
        let Some(Message::Indexer(result)) = messages.last() else {
            panic!("expected an indexer message, got {messages:?}");
        };
        assert_eq!(result.data.job_id, JobId::from_raw(7));
        assert_eq!(result.project, PathBuf::from("/src/proj"));
        assert!(result.data.symbol_names.contains_key("foo"));
    }

    #[test]
    fn blocked_files_produce_no_symbols() {
        let indexer = FakeIndexer::with_symbols(vec![ScriptedSymbol {
            file: PathBuf::from("/src/proj/a.c"),
            line: 1,
            column: 5,
            name: "foo".into(),
            definition: true,
            target: None,
        }]);
        let mut daemon = FakeDaemon::new(vec![VisitFileResponseMessage {
            file_id: FileId::from_raw(1),
            resolved: PathBuf::from("/src/proj/a.c"),
            visit: false,
        }]);

        run_job(wire_job(), &indexer, &mut daemon).unwrap();

        let messages = daemon.sent_messages();
        let Some(Message::Indexer(result)) = messages.last() else {
            panic!("expected an indexer message");
        };
        assert!(result.data.symbols.is_empty());
        assert_eq!(
            result.data.blocked_files(),
            [FileId::from_raw(1)].into_iter().collect()
        );
    }

    #[test]
    fn stdin_frame_decodes_to_the_job() {
        let mut bytes = Vec::new();
        write_message_sync(
            &mut bytes,
            &Message::JobResponse(cix_proto::JobResponseMessage {
                job: wire_job(),
                tcp_port: 0,
            }),
        )
        .unwrap();
        let mut cursor = std::io::Cursor::new(bytes);
        let job = read_job(&mut cursor).unwrap();
        assert_eq!(job.id, JobId::from_raw(7));
    }
}

//! Typed messages exchanged over the local control socket and TCP peers.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use cix_core::{Cpp, JobId, Source};
use cix_index::IndexData;

/// Admit a compile command.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileMessage {
    pub arguments: String,
    pub working_directory: PathBuf,
    pub projects: Vec<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryKind {
    Sources,
    FollowLocation,
    ReferencesLocation,
    ReferencesName,
    ListSymbols,
    FindSymbols,
    CursorInfo,
    Dependencies,
    FixIts,
    FindFile,
    DumpFile,
    IsIndexed,
    IsIndexing,
    Status,
    PreprocessFile,
    CodeCompleteAt,
    PrepareCodeCompleteAt,
    Reindex,
    RemoveFile,
    DeleteProject,
    UnloadProject,
    ReloadProjects,
    Project,
    JobCount,
    ClearProjects,
    ReloadFileManager,
    HasFileManager,
    SuspendFile,
    SendDiagnostics,
    MulticastForward,
    RemoveMulticastForward,
    LoadCompilationDatabase,
    Shutdown,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryFlags {
    pub silent: bool,
    pub compilation_flags_only: bool,
    pub declaration_only: bool,
    pub reverse_sort: bool,
    /// For `Dependencies`: report what the argument depends on instead of
    /// what depends on it.
    pub arg_depends_on: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryMessage {
    pub kind: QueryKind,
    /// Free-form payload: a location (`path:line:col`), a path, a match
    /// pattern or a count depending on `kind`.
    pub query: String,
    pub flags: QueryFlags,
    /// Which build of the file to use when several sources exist.
    pub build_index: u32,
    pub projects: Vec<String>,
}

impl QueryMessage {
    pub fn new(kind: QueryKind, query: impl Into<String>) -> Self {
        Self {
            kind,
            query: query.into(),
            flags: QueryFlags::default(),
            build_index: 0,
            projects: Vec::new(),
        }
    }
}

/// Result of one indexer run, sent by the spawned indexer process.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexerMessage {
    pub project: PathBuf,
    pub data: IndexData,
}

/// "Should I visit file F for job J?", asked synchronously by the indexer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitFileMessage {
    pub project: PathBuf,
    pub file: PathBuf,
    /// Source key of the job asking.
    pub job_key: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitFileResponseMessage {
    pub file_id: cix_core::FileId,
    pub resolved: PathBuf,
    pub visit: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    Error,
    Warning,
    Debug,
}

/// Subscribe this connection to log output at `level` and below.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateOutputMessage {
    pub level: LogLevel,
}

/// Ask a peer for up to `num_jobs` of its pending jobs.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequestMessage {
    pub num_jobs: u16,
}

/// A pending job serialized for remote execution.
///
/// The receiving daemon reconstitutes this with the `Remote` origin cleared
/// and `FromRemote` set; the origin address is taken from the TCP peer and
/// `tcp_port`, the same convention the forward overlay uses.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireJob {
    pub id: JobId,
    pub project: PathBuf,
    pub source: Source,
    pub cpp: Cpp,
    pub dirty: bool,
    pub dump: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResponseMessage {
    pub job: WireJob,
    pub tcp_port: u16,
}

/// A multicast datagram relayed over the forward overlay.
///
/// `ip` empty and `port` zero mean "fill in from the TCP peer".
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MulticastForwardMessage {
    pub ip: String,
    pub port: u16,
    pub payload: Vec<u8>,
}

/// Every message that can cross a cix socket.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Compile(CompileMessage),
    Query(QueryMessage),
    Indexer(IndexerMessage),
    VisitFile(VisitFileMessage),
    VisitFileResponse(VisitFileResponseMessage),
    CreateOutput(CreateOutputMessage),
    JobRequest(JobRequestMessage),
    JobResponse(JobResponseMessage),
    MulticastForward(MulticastForwardMessage),
    /// One line of reply text for a query in flight.
    Response(String),
    /// The server is done with this request.
    Finish,
}

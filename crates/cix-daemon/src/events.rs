//! The daemon's single-consumer event stream and connection plumbing.
//!
//! Sockets, timers, worker-pool completions and child processes all post
//! [`ServerEvent`]s into one unbounded channel drained by the main loop;
//! nothing else mutates server state.

use std::collections::HashMap;
use std::path::PathBuf;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use cix_core::{Cpp, JobId, Source};
use cix_project::{IndexFlags, ProjectDatabase};
use cix_proto::{read_message, write_message, LogLevel, Message, ProtocolError};

use crate::cluster::ForwardAddr;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

impl ConnId {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn{}", self.0)
    }
}

pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}
pub type BoxedStream = Box<dyn Stream>;

/// Why a connection exists; outbound dials carry their intent.
#[derive(Clone, Debug)]
pub enum ConnPurpose {
    /// Accepted on the unix or TCP listener.
    Incoming,
    /// Outbound to a forward-overlay peer.
    Forward(ForwardAddr),
    /// Outbound to a peer that announced jobs; ask for `jobs` of them.
    JobPull { peer: ForwardAddr, jobs: u16 },
}

pub enum ServerEvent {
    NewConnection {
        stream: BoxedStream,
        peer: Option<(String, u16)>,
        purpose: ConnPurpose,
    },
    DialFailed {
        purpose: ConnPurpose,
        error: String,
    },
    ConnMessage {
        id: ConnId,
        message: Box<Message>,
    },
    ConnClosed {
        id: ConnId,
    },
    MulticastDatagram {
        ip: String,
        port: u16,
        payload: Vec<u8>,
    },
    PreprocessDone {
        project: PathBuf,
        source: Source,
        result: Result<Cpp, String>,
        flags: IndexFlags,
    },
    ProjectLoaded {
        path: PathBuf,
        database: Option<ProjectDatabase>,
    },
    IndexerExited {
        job_id: JobId,
        success: bool,
        stderr: String,
    },
    SyncProject {
        path: PathBuf,
    },
    RescheduleTick,
    UnloadTick,
    ReconnectForwards,
    Shutdown,
}

pub type EventSender = mpsc::UnboundedSender<ServerEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<ServerEvent>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

struct ConnectionHandle {
    tx: mpsc::UnboundedSender<Message>,
    peer: Option<(String, u16)>,
    log_level: Option<LogLevel>,
}

/// Live connections, owned by the main loop.
#[derive(Default)]
pub struct ConnectionRegistry {
    next: u64,
    conns: HashMap<ConnId, ConnectionHandle>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection and spawn its reader/writer tasks on the
    /// current runtime.
    pub fn register(
        &mut self,
        stream: BoxedStream,
        peer: Option<(String, u16)>,
        events: EventSender,
    ) -> ConnId {
        self.next += 1;
        let id = ConnId(self.next);
        let (tx, rx) = mpsc::unbounded_channel();
        self.conns.insert(
            id,
            ConnectionHandle {
                tx,
                peer,
                log_level: None,
            },
        );
        tokio::task::spawn_local(connection_io(id, stream, rx, events));
        id
    }

    pub fn send(&self, id: ConnId, message: Message) -> bool {
        self.conns
            .get(&id)
            .map(|handle| handle.tx.send(message).is_ok())
            .unwrap_or(false)
    }

    /// Write one reply line.
    pub fn write(&self, id: ConnId, text: impl Into<String>) {
        self.send(id, Message::Response(text.into()));
    }

    /// Tell the client the request is done.
    pub fn finish(&self, id: ConnId) {
        self.send(id, Message::Finish);
    }

    /// Drop the handle; the writer task ends and closes the socket.
    pub fn close(&mut self, id: ConnId) {
        self.conns.remove(&id);
    }

    pub fn peer(&self, id: ConnId) -> Option<(String, u16)> {
        self.conns.get(&id).and_then(|handle| handle.peer.clone())
    }

    /// Raw outbound queue, for replies produced off the main thread (the
    /// completion thread).
    pub fn sender(&self, id: ConnId) -> Option<mpsc::UnboundedSender<Message>> {
        self.conns.get(&id).map(|handle| handle.tx.clone())
    }

    pub fn set_log_level(&mut self, id: ConnId, level: LogLevel) {
        if let Some(handle) = self.conns.get_mut(&id) {
            handle.log_level = Some(level);
        }
    }

    /// Broadcast a log line to every subscriber at `level` or chattier.
    pub fn log(&self, level: LogLevel, text: &str) {
        for handle in self.conns.values() {
            if handle.log_level.is_some_and(|subscribed| subscribed >= level) {
                let _ = handle.tx.send(Message::Response(text.to_string()));
            }
        }
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }
}

/// Pump one connection: writer drains the outbound queue, reader turns
/// frames into events. Ends with a single `ConnClosed`.
async fn connection_io(
    id: ConnId,
    stream: BoxedStream,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    events: EventSender,
) {
    let (mut read_half, mut write_half) = tokio::io::split(stream);

    let writer = async {
        while let Some(message) = outbound.recv().await {
            if write_message(&mut write_half, &message).await.is_err() {
                break;
            }
        }
    };

    let reader = async {
        loop {
            match read_message(&mut read_half).await {
                Ok(message) => {
                    if events
                        .send(ServerEvent::ConnMessage {
                            id,
                            message: Box::new(message),
                        })
                        .is_err()
                    {
                        break;
                    }
                }
                Err(ProtocolError::Disconnected) => break,
                Err(err) => {
                    tracing::debug!(target: "cix.server", %id, error = %err, "connection error");
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = writer => {}
        _ = reader => {}
    }
    let _ = events.send(ServerEvent::ConnClosed { id });
}

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cix_clang::CommandPreprocessor;
use cix_daemon::completion::CompletionThread;
use cix_daemon::config::{OptionFlags, Options};
use cix_daemon::events::{event_channel, ConnPurpose, ServerEvent};
use cix_daemon::server::{ProcessLauncher, Server};

#[derive(Parser, Debug)]
#[command(name = "cixd", about = "C/C++ source intelligence daemon", version)]
struct Args {
    /// Indexer parallelism.
    #[arg(short = 'j', long)]
    job_count: Option<usize>,

    /// Minutes of idle before non-current projects unload (0 disables).
    #[arg(long, default_value_t = 0)]
    unload_timer: u64,

    /// Milliseconds before a remotely-held job is reassignable.
    #[arg(long, default_value_t = 15_000)]
    reschedule_timeout: u64,

    /// Multicast group for cluster announcements.
    #[arg(long)]
    multicast_address: Option<String>,

    #[arg(long, default_value_t = 0)]
    multicast_port: u16,

    #[arg(long, default_value_t = 0)]
    multicast_ttl: u32,

    /// TCP listener for peer job pulls (0 disables).
    #[arg(long, default_value_t = 0)]
    tcp_port: u16,

    /// host[:port] peers that rebroadcast announcements; repeatable.
    #[arg(long = "multicast-forward")]
    multicast_forwards: Vec<String>,

    #[arg(long, default_value = "/tmp/cixd.socket")]
    socket_file: PathBuf,

    #[arg(long, default_value = "/tmp/cix")]
    data_dir: PathBuf,

    /// Extra system include roots; repeatable.
    #[arg(short = 'I', long = "include-path")]
    include_paths: Vec<PathBuf>,

    /// Always-appended compiler flags; repeatable.
    #[arg(long = "default-argument")]
    default_arguments: Vec<String>,

    /// Globs preventing indexing; repeatable.
    #[arg(long = "exclude-filter")]
    exclude_filters: Vec<String>,

    /// Compiler paths never admitted; repeatable.
    #[arg(long = "ignore-compiler")]
    ignored_compilers: Vec<PathBuf>,

    /// Path to the external indexer binary.
    #[arg(long)]
    indexer: Option<PathBuf>,

    #[arg(long, default_value_t = 10)]
    completion_cache_size: usize,

    #[arg(long)]
    unlimited_errors: bool,

    #[arg(long)]
    wall: bool,

    #[arg(long)]
    spell_checking: bool,

    /// Wipe the project store on startup.
    #[arg(long)]
    clear_projects: bool,

    #[arg(long)]
    no_startup_current_project: bool,

    #[arg(long)]
    no_file_manager_watch: bool,
}

impl Args {
    fn into_options(self) -> Options {
        let defaults = Options::default();
        let indexer_command = self.indexer.unwrap_or_else(default_indexer_command);
        Options {
            job_count: self.job_count.unwrap_or(defaults.job_count),
            unload_timer_minutes: self.unload_timer,
            reschedule_timeout: Duration::from_millis(self.reschedule_timeout),
            sync_timeout: defaults.sync_timeout,
            multicast_address: self.multicast_address,
            multicast_port: self.multicast_port,
            multicast_ttl: self.multicast_ttl,
            tcp_port: self.tcp_port,
            multicast_forwards: self
                .multicast_forwards
                .iter()
                .filter_map(|spec| cix_daemon::cluster::parse_host(spec, 0))
                .collect(),
            socket_file: self.socket_file,
            data_dir: self.data_dir,
            include_paths: self.include_paths,
            default_arguments: self.default_arguments,
            exclude_filters: self.exclude_filters,
            ignored_compilers: self.ignored_compilers.into_iter().collect(),
            indexer_command,
            completion_cache_size: self.completion_cache_size,
            flags: OptionFlags {
                unlimited_errors: self.unlimited_errors,
                wall: self.wall,
                spell_checking: self.spell_checking,
                clear_projects: self.clear_projects,
                no_startup_current_project: self.no_startup_current_project,
                no_file_manager_watch: self.no_file_manager_watch,
            },
        }
    }
}

/// Default to a `cix-indexer` sitting next to this binary.
fn default_indexer_command() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("cix-indexer")))
        .unwrap_or_else(|| PathBuf::from("cix-indexer"))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let options = Args::parse().into_options();
    tracing::info!(
        jobs = options.job_count,
        socket = %options.socket_file.display(),
        data_dir = %options.data_dir.display(),
        "starting cixd"
    );

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()
        .context("build runtime")?;
    let local = tokio::task::LocalSet::new();
    runtime.block_on(local.run_until(run(options)))
}

async fn run(options: Options) -> Result<()> {
    let (events, mut event_rx) = event_channel();

    let preprocessor = Arc::new(CommandPreprocessor::new(
        options.include_paths.clone(),
        options.derived_arguments(),
    ));
    let completion = CompletionThread::spawn(
        NoCompletionEngine,
        options.completion_cache_size,
    );

    let mut server = Server::new(
        options.clone(),
        preprocessor,
        Box::new(ProcessLauncher),
        Some(completion),
        events.clone(),
    );

    // Unix listener. A stale socket from a dead daemon is removed; a live
    // one means another cixd owns this socket file.
    let unix = bind_unix(&options.socket_file).await?;
    spawn_unix_acceptor(unix, events.clone());

    if options.tcp_port != 0 {
        let tcp = tokio::net::TcpListener::bind(("0.0.0.0", options.tcp_port))
            .await
            .with_context(|| format!("listen on port {}", options.tcp_port))?;
        spawn_tcp_acceptor(tcp, events.clone());
    }

    if let Some(group) = options.multicast_address.clone() {
        let socket = bind_multicast(&group, options.multicast_port, options.multicast_ttl)
            .context("join multicast group")?;
        let socket = Arc::new(socket);
        server.set_multicast_socket(Arc::clone(&socket));
        spawn_multicast_reader(socket, events.clone());
    }

    server.init();

    let shutdown_events = events.clone();
    tokio::task::spawn_local(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_events.send(ServerEvent::Shutdown);
        }
    });

    let mut reschedule = tokio::time::interval(options.reschedule_timeout.max(Duration::from_millis(100)));
    reschedule.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                server.handle_event(event);
                if server.is_shutting_down() {
                    break;
                }
            }
            _ = reschedule.tick() => {
                server.handle_event(ServerEvent::RescheduleTick);
            }
        }
    }

    let _ = std::fs::remove_file(&options.socket_file);
    tracing::info!("cixd stopped");
    Ok(())
}

async fn bind_unix(socket_file: &std::path::Path) -> Result<tokio::net::UnixListener> {
    match tokio::net::UnixListener::bind(socket_file) {
        Ok(listener) => Ok(listener),
        Err(_) => {
            // If nothing answers, the socket is stale.
            if tokio::net::UnixStream::connect(socket_file).await.is_ok() {
                anyhow::bail!(
                    "another daemon is listening on {}",
                    socket_file.display()
                );
            }
            std::fs::remove_file(socket_file).ok();
            tokio::net::UnixListener::bind(socket_file)
                .with_context(|| format!("listen on {}", socket_file.display()))
        }
    }
}

fn spawn_unix_acceptor(listener: tokio::net::UnixListener, events: cix_daemon::events::EventSender) {
    tokio::task::spawn_local(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let _ = events.send(ServerEvent::NewConnection {
                        stream: Box::new(stream),
                        peer: None,
                        purpose: ConnPurpose::Incoming,
                    });
                }
                Err(err) => {
                    tracing::error!(error = %err, "unix accept failed");
                    break;
                }
            }
        }
    });
}

fn spawn_tcp_acceptor(listener: tokio::net::TcpListener, events: cix_daemon::events::EventSender) {
    tokio::task::spawn_local(async move {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let _ = events.send(ServerEvent::NewConnection {
                        stream: Box::new(stream),
                        peer: Some((addr.ip().to_string(), addr.port())),
                        purpose: ConnPurpose::Incoming,
                    });
                }
                Err(err) => {
                    tracing::error!(error = %err, "tcp accept failed");
                    break;
                }
            }
        }
    });
}

fn bind_multicast(group: &str, port: u16, ttl: u32) -> Result<tokio::net::UdpSocket> {
    use std::net::Ipv4Addr;

    let group: Ipv4Addr = group.parse().context("parse multicast address")?;
    let std_socket = std::net::UdpSocket::bind(("0.0.0.0", port)).context("bind multicast")?;
    std_socket
        .join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)
        .context("add membership")?;
    // The daemon must not hear its own announcements.
    std_socket.set_multicast_loop_v4(false)?;
    if ttl != 0 {
        std_socket.set_multicast_ttl_v4(ttl)?;
    }
    std_socket.set_nonblocking(true)?;
    tokio::net::UdpSocket::from_std(std_socket).context("wrap multicast socket")
}

fn spawn_multicast_reader(
    socket: Arc<tokio::net::UdpSocket>,
    events: cix_daemon::events::EventSender,
) {
    tokio::task::spawn_local(async move {
        let mut buf = [0u8; 1500];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, from)) => {
                    let _ = events.send(ServerEvent::MulticastDatagram {
                        ip: from.ip().to_string(),
                        port: from.port(),
                        payload: buf[..len].to_vec(),
                    });
                }
                Err(err) => {
                    tracing::error!(error = %err, "multicast receive failed");
                    break;
                }
            }
        }
    });
}

/// Placeholder engine until a libclang-backed one is wired in; completion
/// queries answer "not available" through the parse failure path.
struct NoCompletionEngine;

impl cix_clang::CompletionEngine for NoCompletionEngine {
    type Unit = ();

    fn parse(
        &self,
        _source: &cix_core::Source,
        _unsaved: Option<&str>,
    ) -> Result<Self::Unit, cix_clang::FacadeError> {
        Err(cix_clang::FacadeError::Unavailable(
            "built without libclang completions",
        ))
    }

    fn reparse(
        &self,
        _unit: &mut Self::Unit,
        _unsaved: Option<&str>,
    ) -> Result<(), cix_clang::FacadeError> {
        Ok(())
    }

    fn complete(
        &self,
        _unit: &mut Self::Unit,
        _line: u32,
        _column: u32,
        _unsaved: Option<&str>,
    ) -> Result<Vec<cix_clang::Completion>, cix_clang::FacadeError> {
        Ok(Vec::new())
    }
}

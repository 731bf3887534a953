//! Safe helpers for spawning external commands.
//!
//! Preprocessor runs can be extremely chatty. Using
//! `std::process::Command::output()` buffers *all* stdout/stderr in memory,
//! which can lead to OOM when invoked from a long-lived daemon.
//!
//! This crate provides bounded output capture with optional stdin payloads,
//! wall-clock timeouts and cancellation.

use std::{
    fmt,
    io::{self, Read, Write},
    path::{Path, PathBuf},
    process::{Command, ExitStatus, Stdio},
    thread,
    time::{Duration, Instant},
};

pub use tokio_util::sync::CancellationToken;

/// Captured stdout/stderr from a command, truncated to a maximum size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundedOutput {
    pub stdout: Vec<u8>,
    pub stderr: String,
    /// Set when either stdout or stderr had more bytes than were captured.
    pub truncated: bool,
}

impl BoundedOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// Options controlling command execution.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Bytes written to the child's stdin before it is closed.
    pub input: Option<Vec<u8>>,
    /// Kill the process if it hasn't exited after this duration.
    pub timeout: Option<Duration>,
    /// Maximum bytes to capture *per stream* (stdout and stderr).
    pub max_bytes: usize,
    /// Optional cancellation token. When cancelled, the process is
    /// terminated and `cancelled` is set on the result.
    pub cancellation: Option<CancellationToken>,
    /// How long to wait after sending a graceful termination signal before
    /// force-killing the process tree.
    pub kill_grace: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            input: None,
            timeout: None,
            // 64MiB per stream keeps memory bounded while comfortably
            // holding preprocessed translation units.
            max_bytes: 64 * 1024 * 1024,
            cancellation: None,
            kill_grace: Duration::from_millis(250),
        }
    }
}

/// A full command invocation (cwd + program + args).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub cwd: PathBuf,
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(cwd: &Path, program: &Path, args: &[String]) -> Self {
        Self {
            cwd: cwd.to_path_buf(),
            program: program.to_path_buf(),
            args: args.to_vec(),
        }
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Quoting kept simple; the goal is readable debugging output, not
        // round-trippable shell snippets.
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            if arg.contains(' ') || arg.contains('\t') {
                write!(f, " \"{}\"", arg.replace('"', "\\\""))?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

/// Result of running a command with bounded output capture.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub status: ExitStatus,
    pub output: BoundedOutput,
    pub timed_out: bool,
    pub cancelled: bool,
}

/// Structured error describing a command failure (non-zero exit or timeout).
#[derive(Debug, Clone)]
pub struct CommandFailure {
    pub command: CommandSpec,
    pub status: ExitStatus,
    pub stderr: String,
    pub timed_out: bool,
    pub cancelled: bool,
}

impl fmt::Display for CommandFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "`{}` exited with {}", self.command, self.status)?;
        if self.timed_out {
            writeln!(f, "timed_out: true")?;
        }
        if self.cancelled {
            writeln!(f, "cancelled: true")?;
        }
        if !self.stderr.is_empty() {
            writeln!(f, "stderr:\n{}", self.stderr)?;
        }
        Ok(())
    }
}

impl std::error::Error for CommandFailure {}

/// Error returned by [`run_command_checked`].
#[derive(Debug)]
pub enum RunCommandError {
    Io {
        command: CommandSpec,
        source: io::Error,
    },
    Failed(Box<CommandFailure>),
}

impl fmt::Display for RunCommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { command, source } => write!(f, "failed to run `{command}`: {source}"),
            Self::Failed(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for RunCommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Failed(err) => Some(err.as_ref()),
        }
    }
}

/// Run a command, capturing at most `opts.max_bytes` bytes of stdout and
/// stderr each.
///
/// The function always returns the process `ExitStatus`. When the timeout is
/// reached or the cancellation token fires, the process tree is killed and
/// the corresponding flag is set on the result.
pub fn run_command(
    cwd: &Path,
    program: &Path,
    args: &[String],
    opts: RunOptions,
) -> io::Result<CommandResult> {
    let command = CommandSpec::new(cwd, program, args);
    run_command_spec(&command, opts)
}

/// Run a command and treat non-zero exits / timeouts as errors.
pub fn run_command_checked(
    cwd: &Path,
    program: &Path,
    args: &[String],
    opts: RunOptions,
) -> Result<CommandResult, RunCommandError> {
    let command = CommandSpec::new(cwd, program, args);
    let result = run_command_spec(&command, opts).map_err(|source| RunCommandError::Io {
        command: command.clone(),
        source,
    })?;

    if result.timed_out || result.cancelled || !result.status.success() {
        return Err(RunCommandError::Failed(Box::new(CommandFailure {
            command,
            status: result.status,
            stderr: result.output.stderr,
            timed_out: result.timed_out,
            cancelled: result.cancelled,
        })));
    }

    Ok(result)
}

fn run_command_spec(command: &CommandSpec, opts: RunOptions) -> io::Result<CommandResult> {
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .current_dir(&command.cwd)
        .stdin(if opts.input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    // Put the child into its own process group on Unix so timeouts can kill
    // the whole process tree.
    #[cfg(unix)]
    unsafe {
        use std::os::unix::process::CommandExt;

        cmd.pre_exec(|| {
            // SAFETY: `setpgid` is async-signal-safe and does not allocate.
            // This is executed after `fork` in the child process.
            if libc::setpgid(0, 0) != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let mut child = cmd.spawn()?;

    let stdin_handle = match (child.stdin.take(), opts.input) {
        (Some(mut stdin), Some(input)) => Some(thread::spawn(move || {
            // A child that exits early closes the pipe; that is not an
            // error for the caller.
            let _ = stdin.write_all(&input);
        })),
        _ => None,
    };

    let Some(stdout) = child.stdout.take() else {
        return Err(io::Error::other("child stdout was not captured"));
    };
    let Some(stderr) = child.stderr.take() else {
        return Err(io::Error::other("child stderr was not captured"));
    };

    let max_bytes = opts.max_bytes;
    let stdout_handle = thread::spawn(move || read_bounded(stdout, max_bytes));
    let stderr_handle = thread::spawn(move || read_bounded(stderr, max_bytes));

    let start = Instant::now();
    let mut timed_out = false;
    let mut cancelled = false;

    let status = if opts.timeout.is_some() || opts.cancellation.is_some() {
        let poll = Duration::from_millis(50);
        loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }

            if let Some(token) = opts.cancellation.as_ref() {
                if token.is_cancelled() {
                    cancelled = true;
                    break terminate_process_tree(&mut child, opts.kill_grace)?;
                }
            }

            if let Some(timeout) = opts.timeout {
                if start.elapsed() >= timeout {
                    timed_out = true;
                    break terminate_process_tree(&mut child, opts.kill_grace)?;
                }

                thread::sleep(poll.min(timeout.saturating_sub(start.elapsed())));
            } else {
                thread::sleep(poll);
            }
        }
    } else {
        child.wait()?
    };

    if let Some(handle) = stdin_handle {
        let _ = handle.join();
    }

    let (stdout_bytes, stdout_truncated) = join_reader(stdout_handle, "stdout")??;
    let (stderr_bytes, stderr_truncated) = join_reader(stderr_handle, "stderr")??;

    Ok(CommandResult {
        status,
        output: BoundedOutput {
            stdout: stdout_bytes,
            stderr: String::from_utf8_lossy(&stderr_bytes).into_owned(),
            truncated: stdout_truncated || stderr_truncated,
        },
        timed_out,
        cancelled,
    })
}

fn terminate_process_tree(
    child: &mut std::process::Child,
    grace: Duration,
) -> io::Result<ExitStatus> {
    #[cfg(unix)]
    {
        let pid = child.id() as i32;
        // Negative pid targets the process group, which we set to the
        // child's pid via `setpgid(0, 0)` in `pre_exec`.
        unsafe {
            let _ = libc::kill(-pid, libc::SIGTERM);
        }

        let start = Instant::now();
        while start.elapsed() < grace {
            if let Some(status) = child.try_wait()? {
                return Ok(status);
            }
            thread::sleep(Duration::from_millis(25));
        }

        unsafe {
            let _ = libc::kill(-pid, libc::SIGKILL);
        }
        child.wait()
    }

    #[cfg(not(unix))]
    {
        let _ = grace;
        let _ = child.kill();
        child.wait()
    }
}

fn join_reader(
    handle: thread::JoinHandle<io::Result<(Vec<u8>, bool)>>,
    stream: &'static str,
) -> io::Result<io::Result<(Vec<u8>, bool)>> {
    handle
        .join()
        .map_err(|_| io::Error::other(format!("{stream} reader thread panicked")))
}

fn read_bounded(mut reader: impl Read, max_bytes: usize) -> io::Result<(Vec<u8>, bool)> {
    let mut out = Vec::new();
    let mut truncated = false;
    let mut buf = [0u8; 8 * 1024];

    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }

        if out.len() < max_bytes {
            let remaining = max_bytes - out.len();
            let to_store = remaining.min(n);
            out.extend_from_slice(&buf[..to_store]);
            if to_store < n {
                truncated = true;
            }
        } else {
            truncated = true;
        }
    }

    Ok((out, truncated))
}

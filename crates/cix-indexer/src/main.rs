use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};

use cix_indexer::{read_job, run_job};

enum Connect {
    Unix(PathBuf),
    Tcp(String, u16),
}

fn parse_args() -> Result<Connect> {
    let mut connect = None;
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--socket" => {
                let value = iter.next().ok_or_else(|| anyhow!("--socket requires value"))?;
                connect = Some(Connect::Unix(PathBuf::from(value)));
            }
            "--destination" => {
                let value = iter
                    .next()
                    .ok_or_else(|| anyhow!("--destination requires value"))?;
                let (host, port) = value
                    .rsplit_once(':')
                    .ok_or_else(|| anyhow!("--destination expects host:port"))?;
                connect = Some(Connect::Tcp(host.to_string(), port.parse()?));
            }
            other => bail!("unknown argument: {other}"),
        }
    }
    connect.ok_or_else(|| anyhow!("--socket or --destination is required"))
}

/// The parser backend. This tree ships only the protocol plumbing; the
/// libclang-backed `UnitIndexer` is provided by the deployment. Without
/// one, every run reports a structured failure and the daemon's crash
/// accounting retires the source after its retry budget.
fn backend() -> Option<Box<dyn cix_clang::UnitIndexer>> {
    None
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let connect = parse_args()?;
    let job = read_job(&mut std::io::stdin().lock())?;

    let Some(indexer) = backend() else {
        bail!(
            "no indexer backend available for {}",
            job.source.source_file.display()
        );
    };

    match connect {
        Connect::Unix(path) => {
            let mut stream = UnixStream::connect(&path)
                .with_context(|| format!("connect {}", path.display()))?;
            run_job(job, indexer.as_ref(), &mut stream)
        }
        Connect::Tcp(host, port) => {
            let mut stream = TcpStream::connect((host.as_str(), port))
                .with_context(|| format!("connect {host}:{port}"))?;
            run_job(job, indexer.as_ref(), &mut stream)
        }
    }
}

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use rayon::ThreadPool;
use tokio::sync::oneshot;

use crate::{task::BlockingTask, CancellationToken, Cancelled, TaskError};

fn build_rayon_pool(name_prefix: &'static str, threads: usize) -> ThreadPool {
    // Thread creation can fail in constrained CI/sandbox environments (e.g.
    // low RLIMIT_NPROC). Degrade instead of crashing during startup.
    let requested = threads.max(1);
    let mut desired = requested;
    loop {
        match rayon::ThreadPoolBuilder::new()
            .num_threads(desired)
            .thread_name(move |idx| format!("{name_prefix}-{idx}"))
            .build()
        {
            Ok(pool) => return pool,
            Err(_err) if desired > 1 => {
                desired /= 2;
                continue;
            }
            Err(err) => panic!(
                "failed to build {name_prefix} pool (requested {requested} thread(s)): {err}"
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    /// Preprocess workers; their busy count feeds the dispatch budget.
    Preprocess,
    /// Project restores and other background chores.
    Background,
}

#[derive(Debug, Clone)]
pub struct WorkerPoolsConfig {
    pub preprocess_threads: usize,
    pub background_threads: usize,
}

impl Default for WorkerPoolsConfig {
    fn default() -> Self {
        let available = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            // In containers, `available_parallelism()` can report the host
            // CPU count even when the process is constrained; cap the
            // default to keep startup reliable.
            preprocess_threads: available.clamp(1, 16),
            background_threads: available.clamp(1, 4),
        }
    }
}

struct Pool {
    threads: ThreadPool,
    busy: Arc<AtomicUsize>,
}

#[derive(Clone)]
pub struct WorkerPools {
    inner: Arc<PoolsInner>,
}

struct PoolsInner {
    preprocess: Pool,
    background: Pool,
}

impl WorkerPools {
    pub fn new(config: WorkerPoolsConfig) -> Self {
        Self {
            inner: Arc::new(PoolsInner {
                preprocess: Pool {
                    threads: build_rayon_pool("cix-preprocess", config.preprocess_threads),
                    busy: Arc::new(AtomicUsize::new(0)),
                },
                background: Pool {
                    threads: build_rayon_pool("cix-background", config.background_threads),
                    busy: Arc::new(AtomicUsize::new(0)),
                },
            }),
        }
    }

    fn pool(&self, kind: PoolKind) -> &Pool {
        match kind {
            PoolKind::Preprocess => &self.inner.preprocess,
            PoolKind::Background => &self.inner.background,
        }
    }

    /// Workers of `kind` currently executing a task.
    pub fn busy(&self, kind: PoolKind) -> usize {
        self.pool(kind).busy.load(Ordering::Relaxed)
    }

    pub fn spawn<T, F>(&self, kind: PoolKind, token: CancellationToken, f: F) -> BlockingTask<T>
    where
        T: Send + 'static,
        F: FnOnce(CancellationToken) -> Result<T, Cancelled> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        if token.is_cancelled() {
            let _ = tx.send(Err(TaskError::Cancelled));
            return BlockingTask::new(token, rx);
        }

        let pool = self.pool(kind);
        let busy = Arc::clone(&pool.busy);
        let token_for_job = token.clone();
        pool.threads.spawn(move || {
            busy.fetch_add(1, Ordering::Relaxed);
            let result =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(token_for_job)))
                    .map_err(|_| TaskError::Panicked)
                    .and_then(|result| result.map_err(TaskError::from));
            busy.fetch_sub(1, Ordering::Relaxed);
            let _ = tx.send(result);
        });

        BlockingTask::new(token, rx)
    }

    pub fn spawn_preprocess<T, F>(&self, f: F) -> BlockingTask<T>
    where
        T: Send + 'static,
        F: FnOnce(CancellationToken) -> Result<T, Cancelled> + Send + 'static,
    {
        self.spawn(PoolKind::Preprocess, CancellationToken::new(), f)
    }

    pub fn spawn_background<T, F>(&self, f: F) -> BlockingTask<T>
    where
        T: Send + 'static,
        F: FnOnce(CancellationToken) -> Result<T, Cancelled> + Send + 'static,
    {
        self.spawn(PoolKind::Background, CancellationToken::new(), f)
    }
}

impl Default for WorkerPools {
    fn default() -> Self {
        Self::new(WorkerPoolsConfig::default())
    }
}

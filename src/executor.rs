//! Bounded-concurrency execution of final graph tasks.

use std::env;
use std::num::NonZeroUsize;
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tokio::runtime::{Builder, Runtime};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::tasks::{BlockRef, TaskError};

/// How long the scheduler waits before re-polling a full in-flight window.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

pub type Job = Box<dyn FnOnce() -> Result<BlockRef, TaskError> + Send + 'static>;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error("worker task failed: {0}")]
    Join(String),
    #[error("failed to build runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorConfig {
    pub max_concurrent: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1),
        }
    }
}

pub fn executor_config_from_env() -> ExecutorConfig {
    let mut config = ExecutorConfig::default();
    if let Ok(raw) = env::var("FEATURIZER_MAX_CONCURRENT") {
        if let Ok(parsed) = raw.trim().parse::<usize>() {
            if parsed > 0 {
                config.max_concurrent = parsed;
            }
        }
    }
    config
}

/// Submits jobs and reports which of them have finished.
pub trait Executor {
    type Handle: Send;

    fn submit(&self, job: Job) -> Self::Handle;

    /// Splits handles into `(finished, pending)` without blocking.
    fn poll(&self, handles: Vec<Self::Handle>) -> (Vec<Self::Handle>, Vec<Self::Handle>);

    /// Blocks until every handle completes; fails on the first task error.
    fn await_all(&self, handles: Vec<Self::Handle>) -> Result<Vec<BlockRef>, ExecutorError>;
}

/// Runs each job on the calling thread at submit time.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    type Handle = Result<BlockRef, TaskError>;

    fn submit(&self, job: Job) -> Self::Handle {
        job()
    }

    fn poll(&self, handles: Vec<Self::Handle>) -> (Vec<Self::Handle>, Vec<Self::Handle>) {
        (handles, Vec::new())
    }

    fn await_all(&self, handles: Vec<Self::Handle>) -> Result<Vec<BlockRef>, ExecutorError> {
        handles
            .into_iter()
            .map(|handle| handle.map_err(ExecutorError::from))
            .collect()
    }
}

/// Runs jobs on a tokio blocking pool.
#[derive(Debug)]
pub struct TokioExecutor {
    runtime: Runtime,
}

impl TokioExecutor {
    pub fn new(worker_threads: usize) -> Result<Self, ExecutorError> {
        let worker_threads = worker_threads.max(1);
        let runtime = Builder::new_multi_thread()
            .worker_threads(worker_threads)
            .max_blocking_threads(worker_threads)
            .thread_name("featurizer-worker")
            .enable_time()
            .build()?;
        Ok(Self { runtime })
    }

    pub fn from_config(config: &ExecutorConfig) -> Result<Self, ExecutorError> {
        Self::new(config.max_concurrent)
    }
}

impl Executor for TokioExecutor {
    type Handle = JoinHandle<Result<BlockRef, TaskError>>;

    fn submit(&self, job: Job) -> Self::Handle {
        self.runtime.spawn_blocking(job)
    }

    fn poll(&self, handles: Vec<Self::Handle>) -> (Vec<Self::Handle>, Vec<Self::Handle>) {
        handles.into_iter().partition(JoinHandle::is_finished)
    }

    fn await_all(&self, handles: Vec<Self::Handle>) -> Result<Vec<BlockRef>, ExecutorError> {
        self.runtime.block_on(async move {
            let mut results = Vec::with_capacity(handles.len());
            for handle in handles {
                let outcome = handle
                    .await
                    .map_err(|err| ExecutorError::Join(err.to_string()))?;
                results.push(outcome?);
            }
            Ok(results)
        })
    }
}

/// Keeps at most `max_concurrent` jobs in flight until all are submitted, then waits
/// for the rest. Results come back in completion order as observed by polling.
pub fn execute_graph<E: Executor>(
    executor: &E,
    jobs: Vec<Job>,
    max_concurrent: usize,
) -> Result<Vec<BlockRef>, ExecutorError> {
    let max_concurrent = max_concurrent.max(1);
    let total = jobs.len();
    info!(
        component = "executor",
        event = "executor.start",
        jobs = total,
        max_concurrent
    );

    let mut pending = jobs.into_iter();
    let mut in_flight = Vec::new();
    let mut finished = Vec::new();
    let mut submitted = 0usize;
    loop {
        while in_flight.len() < max_concurrent {
            let Some(job) = pending.next() else {
                break;
            };
            in_flight.push(executor.submit(job));
            submitted += 1;
            debug!(
                component = "executor",
                event = "executor.scheduled",
                submitted,
                total
            );
        }
        if submitted == total {
            break;
        }

        let (done, still_running) = executor.poll(in_flight);
        finished.extend(done);
        in_flight = still_running;
        if in_flight.len() >= max_concurrent {
            thread::sleep(POLL_INTERVAL);
        }
    }

    finished.extend(in_flight);
    let results = executor.await_all(finished)?;
    info!(
        component = "executor",
        event = "executor.finish",
        results = results.len()
    );
    Ok(results)
}

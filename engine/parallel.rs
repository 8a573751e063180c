//! The parallel-for primitive the engine dispatches its task waves to.
//!
//! Tasks share nothing mutable except the prediction matrix (disjoint cells) and the
//! cache store, so an executor is free to run them in any order or all at once.

use crate::estimation::EstimationError;
use rayon::prelude::*;

/// One independent unit of work.
pub type Task<'a> = Box<dyn FnOnce() -> Result<(), EstimationError> + Send + 'a>;

pub trait ParallelExecutor: Sync {
    /// Runs every task and returns once all have completed, or with the first failure.
    fn run<'a>(&self, tasks: Vec<Task<'a>>) -> Result<(), EstimationError>;
}

/// Runs tasks on a rayon pool: the global one, or a dedicated pool of a fixed size.
pub struct RayonExecutor {
    pool: Option<rayon::ThreadPool>,
}

impl RayonExecutor {
    pub fn global() -> Self {
        Self { pool: None }
    }

    pub fn with_threads(threads: usize) -> Result<Self, EstimationError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|i| format!("foldstack-worker-{i}"))
            .build()?;
        Ok(Self { pool: Some(pool) })
    }

    /// Joblib-style job count: positive counts are used as is, `-1` means every core,
    /// `-2` every core but one, and so on. `0` uses the global pool.
    pub fn from_n_jobs(n_jobs: i32) -> Result<Self, EstimationError> {
        if n_jobs == 0 {
            return Ok(Self::global());
        }
        Self::with_threads(resolve_n_jobs(n_jobs, num_cpus::get()))
    }

    pub fn threads(&self) -> usize {
        match &self.pool {
            Some(pool) => pool.current_num_threads(),
            None => rayon::current_num_threads(),
        }
    }
}

fn resolve_n_jobs(n_jobs: i32, cpus: usize) -> usize {
    if n_jobs > 0 {
        return n_jobs as usize;
    }
    let back = n_jobs.unsigned_abs() as usize - 1;
    cpus.saturating_sub(back).max(1)
}

impl Default for RayonExecutor {
    fn default() -> Self {
        Self::global()
    }
}

impl ParallelExecutor for RayonExecutor {
    fn run<'a>(&self, tasks: Vec<Task<'a>>) -> Result<(), EstimationError> {
        let dispatch = move || tasks.into_par_iter().try_for_each(|task| task());
        match &self.pool {
            Some(pool) => pool.install(dispatch),
            None => dispatch(),
        }
    }
}

/// Runs tasks one after another on the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequentialExecutor;

impl ParallelExecutor for SequentialExecutor {
    fn run<'a>(&self, tasks: Vec<Task<'a>>) -> Result<(), EstimationError> {
        tasks.into_iter().try_for_each(|task| task())
    }
}

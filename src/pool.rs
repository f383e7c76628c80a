use rayon::prelude::*;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolSizing {
    /// One worker per available core.
    Available,
    Fixed(usize),
    /// `per_core` workers per available core, never fewer than `min`.
    Scaled { per_core: usize, min: usize },
}

impl PoolSizing {
    pub fn threads(&self) -> usize {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        match *self {
            PoolSizing::Available => cores,
            PoolSizing::Fixed(n) => n.max(1),
            PoolSizing::Scaled { per_core, min } => (cores * per_core).max(min).max(1),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub sizing: PoolSizing,
    pub task_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            sizing: PoolSizing::Available,
            task_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
pub enum TaskOutcome<R> {
    Done(R),
    Panicked(String),
    TimedOut,
}

impl<R> TaskOutcome<R> {
    pub fn ok(self) -> Option<R> {
        match self {
            TaskOutcome::Done(r) => Some(r),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, TaskOutcome::Done(_))
    }

    /// Why the task produced no value, if it did not.
    pub fn failure(&self) -> Option<String> {
        match self {
            TaskOutcome::Done(_) => None,
            TaskOutcome::Panicked(msg) => Some(format!("worker panicked: {msg}")),
            TaskOutcome::TimedOut => Some("worker timed out".to_string()),
        }
    }
}

pub struct WorkerPool {
    pool: rayon::ThreadPool,
    threads: usize,
    task_timeout: Duration,
}

impl WorkerPool {
    pub fn new(config: PoolConfig) -> Result<Self> {
        let threads = config.sizing.threads();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("placy-worker-{i}"))
            .build()
            .map_err(|e| Error::pool(e.to_string()))?;
        debug!(threads, timeout_ms = config.task_timeout.as_millis() as u64, "worker pool ready");
        Ok(Self {
            pool,
            threads,
            task_timeout: config.task_timeout,
        })
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Runs `f` over `items` on the pool and returns one outcome per item, in input order.
    /// Waits at most `task_timeout` for each next completion; tasks that have not started
    /// by then are skipped.
    pub fn map_ordered<T, R, F>(&self, items: Vec<T>, f: F) -> Vec<TaskOutcome<R>>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(usize, T) -> R + Send + Sync + 'static,
    {
        if items.is_empty() {
            return Vec::new();
        }
        if self.pool.current_thread_index().is_some() {
            let live = AtomicBool::new(false);
            return self.pool.install(|| {
                items
                    .into_par_iter()
                    .enumerate()
                    .map(|(i, item)| run_guarded(&f, &live, i, item))
                    .collect()
            });
        }

        let count = items.len();
        let f = Arc::new(f);
        let cancelled = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel::<(usize, TaskOutcome<R>)>();
        for (i, item) in items.into_iter().enumerate() {
            let tx = tx.clone();
            let f = Arc::clone(&f);
            let cancelled = Arc::clone(&cancelled);
            self.pool.spawn(move || {
                let outcome = run_guarded(f.as_ref(), &cancelled, i, item);
                let _ = tx.send((i, outcome));
            });
        }
        drop(tx);

        let mut slots: Vec<Option<TaskOutcome<R>>> = (0..count).map(|_| None).collect();
        let mut remaining = count;
        while remaining > 0 {
            match rx.recv_timeout(self.task_timeout) {
                Ok((i, outcome)) => {
                    slots[i] = Some(outcome);
                    remaining -= 1;
                }
                Err(RecvTimeoutError::Timeout) => {
                    warn!(
                        pending = remaining,
                        timeout_ms = self.task_timeout.as_millis() as u64,
                        "no worker finished within the task timeout"
                    );
                    cancelled.store(true, Ordering::Relaxed);
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        slots
            .into_iter()
            .map(|slot| slot.unwrap_or(TaskOutcome::TimedOut))
            .collect()
    }
}

fn run_guarded<T, R, F>(f: &F, cancelled: &AtomicBool, index: usize, item: T) -> TaskOutcome<R>
where
    F: Fn(usize, T) -> R + ?Sized,
{
    if cancelled.load(Ordering::Relaxed) {
        return TaskOutcome::TimedOut;
    }
    match panic::catch_unwind(AssertUnwindSafe(|| f(index, item))) {
        Ok(r) => TaskOutcome::Done(r),
        Err(payload) => TaskOutcome::Panicked(panic_message(payload.as_ref())),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        return (*s).to_string();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    "unknown panic".to_string()
}

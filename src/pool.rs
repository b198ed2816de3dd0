//! Fixed worker pool for operation dispatch.
//!
//! Each worker owns a private FIFO job channel and blocks on it when idle;
//! each submitted job carries a one-shot completion channel that doubles as
//! its future. Teardown drops the job senders and joins the threads, so a
//! worker drains whatever was queued and exits.

use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::error::{EngineError, Result};

/// Hardware-thread count at or above which a machine counts as many-core.
pub(crate) const HW_THREAD_COUNT_THRESHOLD: usize = 16;
/// Minimum pattern count for threaded dispatch on many-core machines.
pub(crate) const MIN_PATTERN_COUNT_LOW: usize = 256;
/// Minimum pattern count for threaded dispatch on few-core machines.
pub(crate) const MIN_PATTERN_COUNT_HIGH: usize = 768;
/// Pattern count at which every configured thread is worth using.
pub(crate) const LIMIT_PATTERN_COUNT: usize = 262144;

/// Threading cutoff for this machine's core class.
pub(crate) fn min_pattern_count(hw_threads: usize) -> usize {
    if hw_threads >= HW_THREAD_COUNT_THRESHOLD {
        MIN_PATTERN_COUNT_LOW
    } else {
        MIN_PATTERN_COUNT_HIGH
    }
}

/// Number of shares (worker jobs plus the caller's own) a dispatch over
/// `patterns` slots should be split into. Below the limit count, shares are
/// capped so each one keeps at least the minimum pattern count.
pub(crate) fn plan_shares(threads: usize, patterns: usize, min_patterns: usize) -> usize {
    if threads <= 1 || patterns < min_patterns {
        return 1;
    }
    if patterns >= LIMIT_PATTERN_COUNT {
        return threads;
    }
    threads.min((patterns / min_patterns).max(2))
}

type Job = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

/// Completion handle for one submitted job.
pub(crate) struct JobTicket {
    done: Receiver<Result<()>>,
}

impl JobTicket {
    /// Block until the job finishes. A worker that died without reporting
    /// shows up as an internal error rather than a hang.
    pub fn wait(&self) -> Result<()> {
        match self.done.recv() {
            Ok(result) => result,
            Err(_) => Err(EngineError::UnidentifiedException),
        }
    }
}

struct Worker {
    jobs: Option<Sender<(Job, Sender<Result<()>>)>>,
    handle: Option<JoinHandle<()>>,
}

pub(crate) struct WorkerPool {
    workers: Vec<Worker>,
}

impl WorkerPool {
    /// Spawn `worker_count` workers. The caller thread is not represented
    /// here; it always executes its own share directly.
    pub fn new(worker_count: usize) -> Self {
        let mut workers = Vec::with_capacity(worker_count);
        for i in 0..worker_count {
            let (tx, rx) = bounded::<(Job, Sender<Result<()>>)>(1024);
            let handle = std::thread::Builder::new()
                .name(format!("felsen-worker-{i}"))
                .spawn(move || {
                    for (job, done) in rx.iter() {
                        let _ = done.send(job());
                    }
                })
                .expect("failed to spawn worker thread");
            workers.push(Worker {
                jobs: Some(tx),
                handle: Some(handle),
            });
        }
        log::debug!("worker pool started with {worker_count} workers");
        Self { workers }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Enqueue a job on one worker's FIFO queue.
    pub fn submit(&self, worker: usize, job: Job) -> JobTicket {
        let (done_tx, done_rx) = bounded(1);
        let sender = self.workers[worker]
            .jobs
            .as_ref()
            .expect("worker queue closed before pool teardown");
        if sender.send((job, done_tx)).is_err() {
            // Worker is gone; the ticket will report the failure on wait.
        }
        JobTicket { done: done_rx }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for worker in &mut self.workers {
            worker.jobs.take();
        }
        for worker in &mut self.workers {
            if let Some(handle) = worker.handle.take() {
                let _ = handle.join();
            }
        }
    }
}

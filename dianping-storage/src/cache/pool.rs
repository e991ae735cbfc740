//! Bounded pool of background cache rebuild workers.
//!
//! Each worker owns a bounded queue. Submissions are spread round-robin and
//! never wait: when every queue is full the job is refused. `shutdown` stops
//! intake, lets every worker finish what is already queued and then joins
//! them.

use dianping_core::CacheConfig;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

enum WorkerMessage {
    Run(Job),
    Shutdown(oneshot::Sender<()>),
}

/// Why a job was not accepted.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("every rebuild worker queue is full")]
    Saturated,

    #[error("rebuild pool is shut down")]
    Closed,
}

#[derive(Debug, Default)]
struct PoolCounters {
    submitted: AtomicU64,
    completed: AtomicU64,
    rejected: AtomicU64,
    panicked: AtomicU64,
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolSnapshot {
    pub submitted: u64,
    pub completed: u64,
    pub rejected: u64,
    pub panicked: u64,
}

pub struct RebuildPool {
    workers: Vec<mpsc::Sender<WorkerMessage>>,
    next_worker: AtomicUsize,
    closed: AtomicBool,
    handles: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<PoolCounters>,
}

impl RebuildPool {
    /// Spawn `workers` workers (at least one), each with a queue of
    /// `queue_capacity` (at least one). Must be called inside a tokio runtime.
    pub fn new(workers: usize, queue_capacity: usize) -> Self {
        let counters = Arc::new(PoolCounters::default());
        let mut senders = Vec::with_capacity(workers.max(1));
        let mut handles = Vec::with_capacity(workers.max(1));
        for worker_id in 0..workers.max(1) {
            let (tx, rx) = mpsc::channel(queue_capacity.max(1));
            senders.push(tx);
            handles.push(tokio::spawn(worker_loop(worker_id, rx, Arc::clone(&counters))));
        }
        Self {
            workers: senders,
            next_worker: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            handles: Mutex::new(handles),
            counters,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.rebuild_workers, config.rebuild_queue)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Queue `job` without waiting. Tries each worker once, starting from the
    /// next one in round-robin order.
    pub fn try_submit<F>(&self, job: F) -> Result<(), SubmitError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(SubmitError::Closed);
        }
        let start = self.next_worker.fetch_add(1, Ordering::Relaxed);
        let mut message = WorkerMessage::Run(Box::pin(job));
        for offset in 0..self.workers.len() {
            let worker = &self.workers[(start + offset) % self.workers.len()];
            match worker.try_send(message) {
                Ok(()) => {
                    self.counters.submitted.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                Err(mpsc::error::TrySendError::Full(returned)) => message = returned,
                Err(mpsc::error::TrySendError::Closed(_)) => return Err(SubmitError::Closed),
            }
        }
        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
        Err(SubmitError::Saturated)
    }

    /// Stop intake, drain every queue and join the workers.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(workers = self.workers.len(), "Draining rebuild pool");

        let mut acks = Vec::with_capacity(self.workers.len());
        for (i, worker) in self.workers.iter().enumerate() {
            let (tx, rx) = oneshot::channel();
            if worker.send(WorkerMessage::Shutdown(tx)).await.is_err() {
                tracing::error!(worker = i, "Rebuild worker exited before shutdown");
            } else {
                acks.push((i, rx));
            }
        }
        for (i, rx) in acks {
            if rx.await.is_err() {
                tracing::warn!(worker = i, "Rebuild worker dropped its shutdown ack");
            }
        }

        let handles = match self.handles.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Rebuild worker failed to join");
            }
        }
        tracing::info!(completed = self.snapshot().completed, "Rebuild pool shut down");
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            panicked: self.counters.panicked.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for RebuildPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RebuildPool")
            .field("workers", &self.workers.len())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .field("counters", &self.snapshot())
            .finish()
    }
}

async fn worker_loop(
    worker_id: usize,
    mut rx: mpsc::Receiver<WorkerMessage>,
    counters: Arc<PoolCounters>,
) {
    while let Some(message) = rx.recv().await {
        match message {
            WorkerMessage::Run(job) => {
                // A panicking job must not take the worker down with it.
                if let Err(e) = tokio::spawn(job).await {
                    counters.panicked.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(worker = worker_id, error = %e, "Rebuild job panicked");
                }
                counters.completed.fetch_add(1, Ordering::Relaxed);
            }
            WorkerMessage::Shutdown(ack) => {
                let _ = ack.send(());
                break;
            }
        }
    }
    tracing::trace!(worker = worker_id, "Rebuild worker stopped");
}

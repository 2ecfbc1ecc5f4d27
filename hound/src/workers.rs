//! Bounded worker pool.
//!
//! A fixed set of workers drains one shared queue (capacity = workers × 10).
//! When the queue is full, `submit` runs the job inline in the caller, which
//! keeps the search producer from building unbounded backlog. A
//! submit/complete counter pair gives waitgroup semantics: `wait` returns
//! only when no job is queued or running.

use once_cell::sync::OnceCell;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{Mutex, Notify};
use tracing::debug;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Queue slots per worker.
const QUEUE_FACTOR: usize = 10;

struct Inflight {
    count: AtomicUsize,
    idle: Notify,
}

impl Inflight {
    fn add(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn done(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

pub struct WorkerPool {
    tx: mpsc::Sender<Job>,
    inflight: Arc<Inflight>,
}

impl WorkerPool {
    /// Start `workers` draining tasks.
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        let (tx, rx) = mpsc::channel::<Job>(workers * QUEUE_FACTOR);
        let rx = Arc::new(Mutex::new(rx));
        let inflight = Arc::new(Inflight { count: AtomicUsize::new(0), idle: Notify::new() });

        for _ in 0..workers {
            let rx = Arc::clone(&rx);
            let inflight = Arc::clone(&inflight);
            tokio::spawn(async move {
                loop {
                    let job = rx.lock().await.recv().await;
                    match job {
                        Some(job) => {
                            job.await;
                            inflight.done();
                        }
                        None => break,
                    }
                }
            });
        }

        debug!("started worker pool with {workers} workers");
        Self { tx, inflight }
    }

    /// Enqueue a job, or run it inline when the queue is full.
    pub async fn submit<F>(&self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inflight.add();
        match self.tx.try_send(Box::pin(job)) {
            Ok(()) => {}
            Err(TrySendError::Full(job)) | Err(TrySendError::Closed(job)) => {
                job.await;
                self.inflight.done();
            }
        }
    }

    /// Block until every submitted job has completed.
    pub async fn wait(&self) {
        loop {
            let idle = self.inflight.idle.notified();
            if self.inflight.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            idle.await;
        }
    }
}

static POOL: OnceCell<WorkerPool> = OnceCell::new();

/// Start the process-wide pool. Later calls are no-ops.
pub fn init_pool(workers: usize) {
    let _ = POOL.set(WorkerPool::new(workers));
}

pub fn pool() -> &'static WorkerPool {
    POOL.get().expect("worker pool not initialized")
}

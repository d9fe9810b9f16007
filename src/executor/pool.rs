//! Bounded worker pool
//!
//! Submitted jobs go onto a FIFO queue. A single feeder task takes them off
//! in submission order and waits for one of `size` permits before spawning
//! each, so jobs start in the order they were submitted. Submission never
//! fails; saturation only adds latency.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify, Semaphore};
use tracing::{debug, error};

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// A queued job and its outstanding-count ticket
type Queued = (Job, Outstanding);

/// Bounded-concurrency job runner
#[derive(Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
    outstanding: Arc<AtomicUsize>,
    idle: Arc<Notify>,
    queue: mpsc::UnboundedSender<Queued>,
    // Taken by the first `submit`, which starts the feeder
    pending: Arc<Mutex<Option<mpsc::UnboundedReceiver<Queued>>>>,
}

impl WorkerPool {
    /// Create a pool running at most `size` jobs at once (minimum 1)
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let (queue, pending) = mpsc::unbounded_channel();
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
            outstanding: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
            queue,
            pending: Arc::new(Mutex::new(Some(pending))),
        }
    }

    /// Queue a job. Must be called from within a tokio runtime.
    pub fn submit<F>(&self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Some(receiver) = self.pending.lock().take() {
            tokio::spawn(feed(receiver, Arc::clone(&self.permits)));
        }

        self.outstanding.fetch_add(1, Ordering::SeqCst);
        let ticket = Outstanding {
            count: Arc::clone(&self.outstanding),
            idle: Arc::clone(&self.idle),
        };

        if self.queue.send((Box::pin(job), ticket)).is_err() {
            error!("Worker pool closed, dropping job");
            return;
        }
        debug!(
            outstanding = self.outstanding(),
            running = self.running(),
            "Job queued"
        );
    }

    /// Maximum number of concurrently running jobs
    pub fn size(&self) -> usize {
        self.size
    }

    /// Jobs queued or running
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Jobs currently holding a worker
    pub fn running(&self) -> usize {
        self.size - self.permits.available_permits()
    }

    /// Wait until every submitted job has finished
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.outstanding() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Start queued jobs one at a time, each once a permit is free
async fn feed(mut receiver: mpsc::UnboundedReceiver<Queued>, permits: Arc<Semaphore>) {
    while let Some((job, ticket)) = receiver.recv().await {
        let permit = match Arc::clone(&permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                error!("Worker pool closed, dropping job");
                return;
            }
        };

        let handle = tokio::spawn(async move {
            let _ticket = ticket;
            let _permit = permit;
            job.await;
        });

        // A panicking job only takes down its own tokio task
        tokio::spawn(async move {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!(error = %e, "Worker pool job panicked");
                }
            }
        });
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.size)
            .field("outstanding", &self.outstanding())
            .field("running", &self.running())
            .finish()
    }
}

/// Decrements the outstanding count when a job ends, including by panic
struct Outstanding {
    count: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl Drop for Outstanding {
    fn drop(&mut self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            debug!("Worker pool idle");
            self.idle.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_runs_all_jobs() {
        let pool = WorkerPool::new(2);
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let done = Arc::clone(&done);
            pool.submit(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                done.fetch_add(1, Ordering::SeqCst);
            });
        }

        pool.wait_idle().await;
        assert_eq!(done.load(Ordering::SeqCst), 10);
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_bounds_concurrency() {
        let pool = WorkerPool::new(3);
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..12 {
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            pool.submit(async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                current.fetch_sub(1, Ordering::SeqCst);
            });
        }

        pool.wait_idle().await;
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_panicking_job_does_not_affect_others() {
        let pool = WorkerPool::new(1);
        let done = Arc::new(AtomicUsize::new(0));

        pool.submit(async { panic!("job exploded") });
        let d = Arc::clone(&done);
        pool.submit(async move {
            d.fetch_add(1, Ordering::SeqCst);
        });

        pool.wait_idle().await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_jobs_start_in_submission_order() {
        let pool = WorkerPool::new(1);
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..40 {
            let order = Arc::clone(&order);
            pool.submit(async move {
                order.lock().push(i);
                tokio::task::yield_now().await;
            });
        }

        pool.wait_idle().await;
        assert_eq!(*order.lock(), (0..40).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_saturated_pool_keeps_order() {
        let pool = WorkerPool::new(3);
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..30usize {
            let order = Arc::clone(&order);
            pool.submit(async move {
                order.lock().push(i);
                tokio::time::sleep(Duration::from_millis(2)).await;
            });
        }

        pool.wait_idle().await;
        let order = order.lock();
        assert_eq!(order.len(), 30);
        // At most `size` jobs can be started ahead of an earlier one
        for (position, job) in order.iter().enumerate() {
            assert!(job.abs_diff(position) < 3, "start order = {:?}", *order);
        }
    }

    #[tokio::test]
    async fn test_zero_size_is_clamped() {
        let pool = WorkerPool::new(0);
        assert_eq!(pool.size(), 1);
        assert_eq!(pool.running(), 0);
        pool.wait_idle().await;
    }
}

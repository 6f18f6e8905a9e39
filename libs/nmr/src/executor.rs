//! # Channel Worker Pool
//!
//! Every channel runs inbound `process` work on its own [`WorkerPool`]. The
//! pool is bounded in two ways:
//!
//! - at most `workers` tasks run concurrently (a semaphore gate), and
//! - at most `queue_capacity` tasks are accepted but unfinished; further
//!   submissions are rejected with [`NmrError::QueueFull`] instead of growing
//!   without limit.
//!
//! Tasks are spawned on the ambient tokio runtime. Shutting a pool down only
//! rejects new submissions: accepted tasks still run to completion.

use crate::config::ExecutorConfig;
use crate::{NmrError, NmrResult};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tracing::{trace, warn};

/// Bounded executor backing one channel
#[derive(Debug)]
pub struct WorkerPool {
    /// Owning channel id, used in logs and errors
    name: String,
    /// Gate limiting concurrently running tasks to `workers`
    permits: Arc<Semaphore>,
    /// Accepted tasks that have not finished yet
    in_flight: Arc<AtomicUsize>,
    /// Maximum concurrently running tasks
    workers: usize,
    /// Maximum accepted but unfinished tasks
    capacity: usize,
    /// Set by `shutdown`; new submissions are rejected
    closed: AtomicBool,
}

/// Releases a queue slot when the task finishes (or panics)
struct SlotGuard(Arc<AtomicUsize>);

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl WorkerPool {
    pub fn new(name: impl Into<String>, config: &ExecutorConfig) -> Self {
        let workers = config.workers.max(1);
        Self {
            name: name.into(),
            permits: Arc::new(Semaphore::new(workers)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            workers,
            capacity: config.queue_capacity.max(workers),
            closed: AtomicBool::new(false),
        }
    }

    /// Accept a task or reject it without blocking
    pub fn submit<F>(&self, task: F) -> NmrResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(NmrError::ChannelClosed(self.name.clone()));
        }

        let handle =
            Handle::try_current().map_err(|_| NmrError::NoRuntime(self.name.clone()))?;

        let capacity = self.capacity;
        if self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < capacity).then_some(n + 1)
            })
            .is_err()
        {
            warn!(pool = %self.name, capacity, "Worker pool full, rejecting task");
            return Err(NmrError::QueueFull {
                channel: self.name.clone(),
                capacity,
            });
        }

        let slot = SlotGuard(self.in_flight.clone());
        let permits = self.permits.clone();
        let name = self.name.clone();
        handle.spawn(async move {
            let _slot = slot;
            // The semaphore is never closed, so acquire only fails if that
            // invariant is broken; run the task regardless.
            let _permit = permits.acquire_owned().await.ok();
            trace!(pool = %name, "Running task");
            task.await;
        });

        Ok(())
    }

    /// Reject further submissions
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_shutdown(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Accepted tasks that have not finished yet
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::{oneshot, Notify};

    fn config(workers: usize, queue_capacity: usize) -> ExecutorConfig {
        ExecutorConfig {
            workers,
            queue_capacity,
        }
    }

    #[tokio::test]
    async fn test_submitted_task_runs() {
        let pool = WorkerPool::new("test", &config(2, 8));
        let (tx, rx) = oneshot::channel();

        pool.submit(async move {
            let _ = tx.send(42);
        })
        .unwrap();

        assert_eq!(rx.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_queue_full_rejects() {
        let pool = WorkerPool::new("bounded", &config(1, 2));
        let gate = Arc::new(Notify::new());

        for _ in 0..2 {
            let gate = gate.clone();
            pool.submit(async move { gate.notified().await }).unwrap();
        }
        assert_eq!(pool.in_flight(), 2);

        let rejected = pool.submit(async {});
        assert!(matches!(
            rejected,
            Err(NmrError::QueueFull { capacity: 2, .. })
        ));

        gate.notify_waiters();
        tokio::time::timeout(Duration::from_secs(1), async {
            while pool.in_flight() > 0 {
                tokio::task::yield_now().await;
                gate.notify_waiters();
            }
        })
        .await
        .unwrap();

        assert!(pool.submit(async {}).is_ok());
    }

    #[tokio::test]
    async fn test_concurrency_limited_to_workers() {
        let pool = WorkerPool::new("gate", &config(1, 4));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (done_tx, mut done_rx) = tokio::sync::mpsc::channel(4);

        for _ in 0..4 {
            let running = running.clone();
            let peak = peak.clone();
            let done_tx = done_tx.clone();
            pool.submit(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                let _ = done_tx.send(()).await;
            })
            .unwrap();
        }

        for _ in 0..4 {
            done_rx.recv().await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_work() {
        let pool = WorkerPool::new("closing", &config(1, 4));
        pool.shutdown();
        assert!(pool.is_shutdown());
        assert!(matches!(
            pool.submit(async {}),
            Err(NmrError::ChannelClosed(name)) if name == "closing"
        ));
    }

    #[test]
    fn test_submit_outside_runtime() {
        let pool = WorkerPool::new("no-rt", &config(1, 4));
        assert!(matches!(pool.submit(async {}), Err(NmrError::NoRuntime(_))));
        assert_eq!(pool.in_flight(), 0);
    }
}

//! Bounded worker pool for background work.
//!
//! Runs identity cache reloads and fire-and-forget group pushes off the
//! caller's path. Submission never waits: tasks beyond the queue bound are
//! rejected, and failures are logged rather than returned.

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Notify, Semaphore};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::WorkerPoolConfig;
use crate::error::{SharePointError, SharePointResult};

#[derive(Debug)]
struct PoolInner {
    semaphore: Arc<Semaphore>,
    tracker: TaskTracker,
    depth: AtomicUsize,
    idle: Notify,
    max_queued: usize,
    next_id: AtomicU64,
    shutdown_timeout: Duration,
}

impl PoolInner {
    fn finish_one(&self) {
        if self.depth.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Worker pool with bounded concurrency and a bounded backlog.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    #[must_use]
    pub fn new(config: &WorkerPoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                semaphore: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
                tracker: TaskTracker::new(),
                depth: AtomicUsize::new(0),
                idle: Notify::new(),
                max_queued: config.max_queued.max(1),
                next_id: AtomicU64::new(1),
                shutdown_timeout: Duration::from_secs(config.shutdown_timeout_secs),
            }),
        }
    }

    /// Tasks submitted and not yet finished.
    pub fn depth(&self) -> usize {
        self.inner.depth.load(Ordering::Acquire)
    }

    /// Submits a task without waiting for it to start.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit<F>(&self, name: &'static str, task: F) -> SharePointResult<u64>
    where
        F: Future<Output = SharePointResult<()>> + Send + 'static,
    {
        if self.inner.tracker.is_closed() {
            return Err(SharePointError::Cancelled);
        }
        let current = self.inner.depth.load(Ordering::Acquire);
        if current >= self.inner.max_queued {
            warn!(task = name, queue_depth = current, "Worker pool full, dropping task");
            return Err(SharePointError::PoolFull {
                queue_depth: current,
            });
        }
        self.inner.depth.fetch_add(1, Ordering::AcqRel);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let inner = self.inner.clone();
        let queued_at = Instant::now();

        self.inner.tracker.spawn(async move {
            let permit = inner.semaphore.clone().acquire_owned().await;
            if permit.is_err() {
                inner.finish_one();
                return;
            }
            let waited = queued_at.elapsed();
            match task.await {
                Ok(()) => debug!(task = name, id, waited_ms = waited.as_millis() as u64, "Background task finished"),
                Err(e) => warn!(task = name, id, error = %e, "Background task failed"),
            }
            drop(permit);
            inner.finish_one();
        });
        Ok(id)
    }

    /// Waits until no submitted task is pending.
    ///
    /// The pool keeps accepting work meanwhile; tasks submitted while
    /// waiting are waited for as well.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.depth() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stops accepting tasks and waits for running ones, up to the timeout.
    ///
    /// Returns false if tasks were still running when the timeout elapsed.
    pub async fn shutdown(&self) -> bool {
        self.inner.tracker.close();
        let drained = tokio::time::timeout(self.inner.shutdown_timeout, self.inner.tracker.wait())
            .await
            .is_ok();
        if drained {
            info!("Worker pool drained");
        } else {
            warn!(pending = self.depth(), "Worker pool shutdown timed out");
        }
        drained
    }
}

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

use crate::observer::{METRIC_POOL_ACTIVE, METRIC_POOL_QUEUED};

/// A unit of work accepted by the pool. It receives the pool's shutdown token and must
/// return promptly once the token is cancelled.
pub type Job = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, ()> + Send>;

/// Snapshot of the pool's load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Jobs currently holding a worker slot.
    pub active: usize,
    /// Jobs waiting for a worker slot.
    pub queued: usize,
    /// Every job the pool still tracks: active, queued and delayed.
    pub pending: usize,
}

/// Bounded pool of worker slots shared by every worker task.
///
/// At most `size` jobs run at once; extra submissions queue in FIFO order until a slot frees
/// up. Cloning the pool shares the same slots and shutdown token.
#[derive(Clone)]
pub struct WorkerPool {
    size: usize,
    slots: Arc<Semaphore>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    active: Arc<AtomicUsize>,
    queued: Arc<AtomicUsize>,
}

impl WorkerPool {
    pub fn new(size: NonZeroUsize) -> Self {
        Self {
            size: size.get(),
            slots: Arc::new(Semaphore::new(size.get())),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            active: Arc::new(AtomicUsize::new(0)),
            queued: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Queue `job` for execution. Returns false, dropping the job, if the pool is shut down.
    pub fn submit(&self, job: Job) -> bool {
        if self.shutdown.is_cancelled() {
            debug!("pool is shut down, dropping submitted job");
            return false;
        }

        let slots = self.slots.clone();
        let shutdown = self.shutdown.clone();
        let queued = Gauge::enter(self.queued.clone(), METRIC_POOL_QUEUED);
        let active = self.active.clone();

        self.tracker.spawn(async move {
            let permit = tokio::select! {
                biased;

                _ = shutdown.cancelled() => return,
                permit = slots.acquire_owned() => match permit {
                    Ok(permit) => permit,
                    // Slots are only closed by shutdown_now.
                    Err(_) => return,
                },
            };
            drop(queued);

            let _active = Gauge::enter(active, METRIC_POOL_ACTIVE);
            job(shutdown).await;
            drop(permit);
        });

        true
    }

    /// Submit `job` once `delay` has elapsed. The job is dropped if the pool shuts down first.
    pub fn schedule_after(&self, job: Job, delay: Duration) -> bool {
        if self.shutdown.is_cancelled() {
            debug!("pool is shut down, dropping scheduled job");
            return false;
        }

        let pool = self.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                biased;

                _ = pool.shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    pool.submit(job);
                }
            }
        });

        true
    }

    /// Cancel every running, queued and delayed job, then wait for all of them to exit.
    /// Must not be awaited from inside a pool job.
    pub async fn shutdown_now(&self) {
        self.shutdown.cancel();
        self.slots.close();
        self.tracker.close();
        self.tracker.wait().await;
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            active: self.active.load(Ordering::SeqCst),
            queued: self.queued.load(Ordering::SeqCst),
            pending: self.tracker.len(),
        }
    }
}

/// Counts a job in one of the pool states for as long as it is alive.
struct Gauge {
    count: Arc<AtomicUsize>,
    metric: &'static str,
}

impl Gauge {
    fn enter(count: Arc<AtomicUsize>, metric: &'static str) -> Self {
        let value = count.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::gauge!(metric).set(value as f64);
        Self { count, metric }
    }
}

impl Drop for Gauge {
    fn drop(&mut self) {
        let value = self.count.fetch_sub(1, Ordering::SeqCst) - 1;
        metrics::gauge!(self.metric).set(value as f64);
    }
}

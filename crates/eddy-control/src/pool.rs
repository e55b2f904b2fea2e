//! Bounded, elastic worker pool for slow operations.
//!
//! Tasks go through a bounded queue. When the queue is full a submission is
//! rejected with [`ControlError::PoolSaturated`] rather than waiting; callers
//! treat that as retryable backpressure.
//!
//! Workers are spawned on demand: up to `min_workers` unconditionally, and up
//! to `max_workers` while no worker is idle. Workers above the minimum exit
//! after `keep_alive` without work.
//!
//! Tasks have no timeout of their own. A hung collaborator call holds its
//! worker until it returns or the pool is shut down.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info_span, warn, Instrument};

use crate::config::PoolConfig;
use crate::error::{ControlError, ControlResult};

type Job = BoxFuture<'static, ()>;

/// Handle to a task running on a [`WorkerPool`].
#[derive(Debug)]
pub struct TaskHandle<T> {
    name: String,
    result: oneshot::Receiver<ControlResult<T>>,
    token: CancellationToken,
}

impl<T> TaskHandle<T> {
    /// Task name given at submission.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request cancellation.
    ///
    /// A task queued with [`WorkerPool::submit`] is dropped at its next
    /// suspension point; one queued with [`WorkerPool::submit_with`] sees its
    /// token fire and decides how to wind down.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Wait for the task's result.
    pub async fn join(self) -> ControlResult<T> {
        self.result.await.unwrap_or(Err(ControlError::TaskCancelled))
    }
}

struct Inner {
    sender: mpsc::Sender<Job>,
    receiver: Mutex<mpsc::Receiver<Job>>,
    capacity: usize,
    min_workers: usize,
    max_workers: usize,
    keep_alive: Duration,
    workers: AtomicUsize,
    idle: AtomicUsize,
    tracker: TaskTracker,
    closing: CancellationToken,
    cancel: CancellationToken,
}

enum Next {
    Job(Job),
    Idle,
    Drain,
}

impl Inner {
    async fn next_job(&self) -> Option<Job> {
        self.receiver.lock().await.recv().await
    }

    async fn try_next_job(&self) -> Option<Job> {
        self.receiver.lock().await.try_recv().ok()
    }

    /// Retire an idle worker unless that would drop below the minimum.
    fn retire(&self) -> bool {
        self.workers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |w| {
                (w > self.min_workers).then(|| w - 1)
            })
            .is_ok()
    }
}

async fn run_worker(inner: Arc<Inner>) {
    loop {
        inner.idle.fetch_add(1, Ordering::SeqCst);
        let next = tokio::select! {
            biased;
            () = inner.closing.cancelled() => Next::Drain,
            job = tokio::time::timeout(inner.keep_alive, inner.next_job()) => match job {
                Ok(Some(job)) => Next::Job(job),
                Ok(None) => Next::Drain,
                Err(_) => Next::Idle,
            },
        };
        inner.idle.fetch_sub(1, Ordering::SeqCst);

        match next {
            Next::Job(job) => job.await,
            Next::Idle => {
                if inner.retire() {
                    debug!("idle worker retired");
                    return;
                }
            }
            Next::Drain => {
                while let Some(job) = inner.try_next_job().await {
                    job.await;
                }
                inner.workers.fetch_sub(1, Ordering::SeqCst);
                return;
            }
        }
    }
}

/// Worker pool with a bounded queue and reject-on-full policy.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<Inner>,
}

impl WorkerPool {
    /// Create a pool; workers are spawned lazily on the current runtime.
    #[must_use]
    pub fn new(config: &PoolConfig) -> Self {
        let capacity = config.queue_capacity.max(1);
        let max_workers = config.max_workers.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        Self {
            inner: Arc::new(Inner {
                sender,
                receiver: Mutex::new(receiver),
                capacity,
                min_workers: config.min_workers.min(max_workers),
                max_workers,
                keep_alive: Duration::from_secs(config.keep_alive_secs),
                workers: AtomicUsize::new(0),
                idle: AtomicUsize::new(0),
                tracker: TaskTracker::new(),
                closing: CancellationToken::new(),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Queue a task.
    ///
    /// Fails with [`ControlError::PoolSaturated`] when the queue is full and
    /// [`ControlError::PoolClosed`] after shutdown has begun. A cancelled task
    /// is dropped at its next suspension point.
    pub fn submit<F, T>(&self, name: impl Into<String>, task: F) -> ControlResult<TaskHandle<T>>
    where
        F: Future<Output = ControlResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.submit_with(name, move |token| async move {
            tokio::select! {
                biased;
                () = token.cancelled() => Err(ControlError::TaskCancelled),
                result = task => result,
            }
        })
    }

    /// Queue a task that observes its own cancellation token.
    ///
    /// The task runs to completion even after [`TaskHandle::cancel`] or a
    /// shutdown past its grace period; it is expected to watch the token and
    /// settle whatever it has started.
    pub fn submit_with<F, Fut, T>(
        &self,
        name: impl Into<String>,
        task: F,
    ) -> ControlResult<TaskHandle<T>>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ControlResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        if self.inner.closing.is_cancelled() {
            return Err(ControlError::PoolClosed);
        }

        let name = name.into();
        let (tx, rx) = oneshot::channel();
        let token = self.inner.cancel.child_token();
        let task = task(token.clone());
        let span = info_span!("pool_task", task = %name);

        let job: Job = Box::pin(
            async move {
                let result = task.await;
                if let Err(e) = &result {
                    debug!(error = %e, "task finished with error");
                }
                let _ = tx.send(result);
            }
            .instrument(span),
        );

        match self.inner.sender.try_send(job) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(task = %name, capacity = self.inner.capacity, "worker pool saturated");
                return Err(ControlError::PoolSaturated {
                    queued: self.queued(),
                });
            }
            Err(mpsc::error::TrySendError::Closed(_)) => return Err(ControlError::PoolClosed),
        }

        self.ensure_worker();
        Ok(TaskHandle {
            name,
            result: rx,
            token,
        })
    }

    fn ensure_worker(&self) {
        let inner = &self.inner;
        let workers = inner.workers.load(Ordering::SeqCst);
        let wanted = workers < inner.min_workers || inner.idle.load(Ordering::SeqCst) == 0;
        if !wanted {
            return;
        }
        let spawned = inner
            .workers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |w| {
                (w < inner.max_workers).then(|| w + 1)
            })
            .is_ok();
        if spawned {
            inner.tracker.spawn(run_worker(Arc::clone(inner)));
        }
    }

    /// Tasks waiting in the queue.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.inner.capacity - self.inner.sender.capacity()
    }

    /// Live workers.
    #[must_use]
    pub fn workers(&self) -> usize {
        self.inner.workers.load(Ordering::SeqCst)
    }

    /// Stop accepting tasks, let queued and running tasks finish within
    /// `grace`, then cancel whatever is left.
    pub async fn shutdown(&self, grace: Duration) {
        self.inner.closing.cancel();
        self.inner.tracker.close();
        if tokio::time::timeout(grace, self.inner.tracker.wait())
            .await
            .is_err()
        {
            warn!(workers = self.workers(), "worker pool did not drain in time, cancelling");
            self.inner.cancel.cancel();
            self.inner.tracker.wait().await;
        }
    }
}

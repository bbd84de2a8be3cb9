//! A fixed-capacity pool for outbound calls: at most `max_concurrency` tasks
//! run at once, each under a hard timeout, and submitting never blocks.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("task timed out after {0:?}")]
    Timeout(time::Duration),
    #[error("executor is shutting down and accepts no new work")]
    ShuttingDown,
    #[error("task was cancelled before completion")]
    Cancelled,
    #[error("task panicked: {0}")]
    Join(#[from] JoinError),
}

/// Completion handle of a submitted task.
pub struct TaskHandle<T> {
    inner: JoinHandle<Result<T, ExecutorError>>,
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T, ExecutorError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match ready!(Pin::new(&mut self.inner).poll(cx)) {
            Ok(result) => Poll::Ready(result),
            Err(e) if e.is_cancelled() => Poll::Ready(Err(ExecutorError::Cancelled)),
            Err(e) => Poll::Ready(Err(ExecutorError::Join(e))),
        }
    }
}

#[derive(Clone)]
pub struct BoundedExecutor {
    name: &'static str,
    max_concurrency: usize,
    timeout: time::Duration,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    /// Fires when shutdown starts: new work is refused and backoff sleeps end early.
    closing: CancellationToken,
    /// Fires when the grace period is over: whatever is still running is dropped.
    abort: CancellationToken,
}

impl BoundedExecutor {
    pub fn new(name: &'static str, max_concurrency: usize, timeout: time::Duration) -> Self {
        let max_concurrency = max_concurrency.max(1);
        Self {
            name,
            max_concurrency,
            timeout,
            permits: Arc::new(Semaphore::new(max_concurrency)),
            tracker: TaskTracker::new(),
            closing: CancellationToken::new(),
            abort: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_closing(&self) -> bool {
        self.closing.is_cancelled()
    }

    /// Resolves once shutdown has started.
    pub async fn closing(&self) {
        self.closing.cancelled().await
    }

    /// Number of tasks not yet in a terminal state, including queued ones.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Queue `task` for execution. The returned handle fails with
    /// `ExecutorError::Timeout` if the task runs longer than the executor
    /// timeout; queueing time waiting for a permit does not count against it.
    pub fn submit<F, T>(&self, task: F) -> Result<TaskHandle<T>, ExecutorError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if self.is_closing() {
            return Err(ExecutorError::ShuttingDown);
        }

        let permits = self.permits.clone();
        let abort = self.abort.clone();
        let timeout = self.timeout;
        let name = self.name;
        let max_concurrency = self.max_concurrency;

        let inner = self.tracker.spawn(async move {
            let permit = tokio::select! {
                permit = permits.clone().acquire_owned() => permit.map_err(|_| ExecutorError::ShuttingDown)?,
                _ = abort.cancelled() => return Err(ExecutorError::Cancelled),
            };
            report_saturation(name, &permits, max_concurrency);

            let result = tokio::select! {
                result = tokio::time::timeout(timeout, task) => result.map_err(|_| ExecutorError::Timeout(timeout)),
                _ = abort.cancelled() => Err(ExecutorError::Cancelled),
            };

            drop(permit);
            report_saturation(name, &permits, max_concurrency);
            result
        });

        Ok(TaskHandle { inner })
    }

    /// Spawn a task that coordinates submitted work (e.g. a retry loop) without
    /// taking a permit or a timeout of its own. It is drained and cancelled
    /// together with the executor's tasks.
    pub fn spawn_driver<F, T>(&self, driver: F) -> Result<TaskHandle<T>, ExecutorError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if self.is_closing() {
            return Err(ExecutorError::ShuttingDown);
        }

        let abort = self.abort.clone();
        let inner = self.tracker.spawn(async move {
            tokio::select! {
                output = driver => Ok(output),
                _ = abort.cancelled() => Err(ExecutorError::Cancelled),
            }
        });

        Ok(TaskHandle { inner })
    }

    /// Stop accepting work, wait up to `grace` for in-flight tasks, then cancel
    /// whatever remains. Returns the number of tasks that had to be cancelled.
    pub async fn shutdown(&self, grace: time::Duration) -> usize {
        self.closing.cancel();
        self.tracker.close();

        if tokio::time::timeout(grace, self.tracker.wait()).await.is_ok() {
            info!(executor = self.name, "executor drained");
            return 0;
        }

        let remaining = self.tracker.len();
        warn!(
            executor = self.name,
            remaining, "grace period elapsed, cancelling remaining tasks"
        );
        self.abort.cancel();
        self.tracker.wait().await;
        remaining
    }
}

fn report_saturation(name: &'static str, permits: &Semaphore, max_concurrency: usize) {
    let busy = max_concurrency.saturating_sub(permits.available_permits());
    metrics::gauge!("executor_saturation_percent", "executor" => name)
        .set(busy as f64 * 100.0 / max_concurrency as f64);
}

//! CountingTask — completes with a fixed payload after N signals.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use tracing::trace;

use crate::error::TaskResult;
use crate::task::{AsyncTask, TaskOutcome};

struct Inner<V> {
    task: AsyncTask<V>,
    payload: V,
    count: AtomicI64,
}

/// A task that completes with `payload` once the count reaches zero.
///
/// Signals arriving after completion are ignored. A counting task built
/// with a count of zero or less is already complete.
pub struct CountingTask<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for CountingTask<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> std::fmt::Debug for CountingTask<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CountingTask")
            .field("count", &self.inner.count.load(Ordering::Acquire))
            .field("task", &self.inner.task)
            .finish()
    }
}

impl<V: Clone + Send + Sync + 'static> CountingTask<V> {
    pub fn new(payload: V, initial_count: i64) -> Self {
        let inner = Arc::new(Inner {
            task: AsyncTask::new(),
            payload,
            count: AtomicI64::new(initial_count),
        });
        if initial_count <= 0 {
            inner.task.complete(inner.payload.clone());
        }
        Self { inner }
    }

    /// Register one more expected signal. Has no effect once complete.
    pub fn increment_count(&self) {
        if !self.inner.task.is_done() {
            self.inner.count.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Deliver one signal. The signal that brings the count to zero
    /// completes the task; later signals are inert.
    pub fn count_down(&self) {
        let remaining = self.inner.count.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining <= 0 && self.inner.task.complete(self.inner.payload.clone()) {
            trace!("counting task reached zero");
        }
    }

    /// Signals still outstanding. Never negative.
    pub fn count(&self) -> i64 {
        self.inner.count.load(Ordering::Acquire).max(0)
    }

    pub fn payload(&self) -> &V {
        &self.inner.payload
    }

    pub fn cancel(&self) -> bool {
        self.inner.task.cancel()
    }

    pub fn is_done(&self) -> bool {
        self.inner.task.is_done()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.task.is_cancelled()
    }

    pub fn add_listener<F>(&self, listener: F) -> &Self
    where
        F: FnOnce(TaskOutcome<'_, V>) + Send + 'static,
    {
        self.inner.task.add_listener(listener);
        self
    }

    /// The underlying task, for composition with `map` and friends.
    pub fn task(&self) -> &AsyncTask<V> {
        &self.inner.task
    }

    pub async fn wait(&self) -> TaskResult<V> {
        self.inner.task.wait().await
    }

    pub async fn wait_timeout(&self, timeout: Duration) -> TaskResult<V> {
        self.inner.task.wait_timeout(timeout).await
    }

    pub async fn wait_or(&self, timeout: Duration, default: V) -> V {
        self.inner.task.wait_or(timeout, default).await
    }

    pub fn blocking_get(&self) -> TaskResult<V> {
        self.inner.task.blocking_get()
    }

    pub fn blocking_get_timeout(&self, timeout: Duration) -> TaskResult<V> {
        self.inner.task.blocking_get_timeout(timeout)
    }
}

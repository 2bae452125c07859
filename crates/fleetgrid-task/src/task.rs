//! AsyncTask — a listenable, cancelable deferred value.
//!
//! The task moves from pending to exactly one terminal state: completed
//! with a value, or cancelled. Both transitions wake every waiter (async
//! and blocking) and drain the listener list. Listeners registered after
//! the task reached a terminal state are invoked immediately on the
//! registering thread.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;
use tracing::trace;

use crate::error::{TaskError, TaskResult};

/// What a listener observes when the task settles.
#[derive(Debug, PartialEq, Eq)]
pub enum TaskOutcome<'a, V> {
    Completed(&'a V),
    Cancelled,
}

type Listener<V> = Box<dyn FnOnce(TaskOutcome<'_, V>) + Send + 'static>;

enum Slot<V> {
    Pending(Vec<Listener<V>>),
    Completed(V),
    Cancelled,
}

impl<V: Clone> Slot<V> {
    fn outcome(&self) -> Option<TaskResult<V>> {
        match self {
            Slot::Pending(_) => None,
            Slot::Completed(value) => Some(Ok(value.clone())),
            Slot::Cancelled => Some(Err(TaskError::Cancelled)),
        }
    }
}

struct Shared<V> {
    slot: Mutex<Slot<V>>,
    /// Wakes threads parked in `blocking_get*`.
    cond: Condvar,
    /// Wakes tasks suspended in `wait*`.
    notify: Notify,
}

/// Cloneable handle to a value that will be produced later.
///
/// All clones observe the same terminal state.
pub struct AsyncTask<V> {
    shared: Arc<Shared<V>>,
}

impl<V> Clone for AsyncTask<V> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<V> fmt::Debug for AsyncTask<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.shared.slot.lock() {
            Slot::Pending(listeners) => format!("pending ({} listeners)", listeners.len()),
            Slot::Completed(_) => "completed".to_string(),
            Slot::Cancelled => "cancelled".to_string(),
        };
        f.debug_struct("AsyncTask").field("state", &state).finish()
    }
}

impl<V: Clone + Send + 'static> Default for AsyncTask<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone + Send + 'static> AsyncTask<V> {
    /// Create a pending task.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                slot: Mutex::new(Slot::Pending(Vec::new())),
                cond: Condvar::new(),
                notify: Notify::new(),
            }),
        }
    }

    /// Create a task that is already completed with `value`.
    pub fn completed(value: V) -> Self {
        let task = Self::new();
        task.complete(value);
        task
    }

    /// Complete the task. Returns `false` if it had already settled.
    pub fn complete(&self, value: V) -> bool {
        let (listeners, value) = {
            let mut slot = self.shared.slot.lock();
            let listeners = match &mut *slot {
                Slot::Pending(listeners) => std::mem::take(listeners),
                _ => return false,
            };
            *slot = Slot::Completed(value.clone());
            (listeners, value)
        };

        self.wake_all();
        trace!(listeners = listeners.len(), "task completed");
        for listener in listeners {
            listener(TaskOutcome::Completed(&value));
        }
        true
    }

    /// Cancel the task. Returns `false` if it had already settled,
    /// including a previous cancellation.
    pub fn cancel(&self) -> bool {
        let listeners = {
            let mut slot = self.shared.slot.lock();
            let listeners = match &mut *slot {
                Slot::Pending(listeners) => std::mem::take(listeners),
                _ => return false,
            };
            *slot = Slot::Cancelled;
            listeners
        };

        self.wake_all();
        trace!(listeners = listeners.len(), "task cancelled");
        for listener in listeners {
            listener(TaskOutcome::Cancelled);
        }
        true
    }

    /// Register a callback invoked exactly once when the task settles.
    ///
    /// If the task has already settled the callback runs immediately on
    /// the calling thread; otherwise it runs on whichever thread completes
    /// or cancels the task.
    pub fn add_listener<F>(&self, listener: F) -> &Self
    where
        F: FnOnce(TaskOutcome<'_, V>) + Send + 'static,
    {
        let settled = {
            let mut slot = self.shared.slot.lock();
            match &mut *slot {
                Slot::Pending(listeners) => {
                    listeners.push(Box::new(listener));
                    return self;
                }
                Slot::Completed(value) => Some(value.clone()),
                Slot::Cancelled => None,
            }
        };

        match settled {
            Some(value) => listener(TaskOutcome::Completed(&value)),
            None => listener(TaskOutcome::Cancelled),
        }
        self
    }

    /// Derive a task holding `f` applied to this task's value.
    ///
    /// Cancelling this task cancels the derived one.
    pub fn map<U, F>(&self, f: F) -> AsyncTask<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(&V) -> U + Send + 'static,
    {
        let mapped = AsyncTask::new();
        let target = mapped.clone();
        self.add_listener(move |outcome| match outcome {
            TaskOutcome::Completed(value) => {
                target.complete(f(value));
            }
            TaskOutcome::Cancelled => {
                target.cancel();
            }
        });
        mapped
    }

    pub fn is_done(&self) -> bool {
        !matches!(&*self.shared.slot.lock(), Slot::Pending(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(&*self.shared.slot.lock(), Slot::Cancelled)
    }

    /// The settled result, without waiting.
    pub fn try_get(&self) -> Option<TaskResult<V>> {
        self.shared.slot.lock().outcome()
    }

    // ── Async waits ────────────────────────────────────────────────

    /// Wait until the task settles.
    pub async fn wait(&self) -> TaskResult<V> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a completion in between is not lost.
            notified.as_mut().enable();

            if let Some(result) = self.try_get() {
                return result;
            }
            notified.await;
        }
    }

    /// Wait at most `timeout`. A timeout is reported as
    /// [`TaskError::Timeout`], distinct from cancellation.
    pub async fn wait_timeout(&self, timeout: Duration) -> TaskResult<V> {
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(result) => result,
            Err(_) => Err(TaskError::Timeout(timeout)),
        }
    }

    /// Wait at most `timeout`, falling back to `default` on timeout or
    /// cancellation. Never fails.
    pub async fn wait_or(&self, timeout: Duration, default: V) -> V {
        self.wait_timeout(timeout).await.unwrap_or(default)
    }

    // ── Blocking waits ─────────────────────────────────────────────

    /// Park the calling thread until the task settles.
    pub fn blocking_get(&self) -> TaskResult<V> {
        let mut slot = self.shared.slot.lock();
        loop {
            if let Some(result) = slot.outcome() {
                return result;
            }
            self.shared.cond.wait(&mut slot);
        }
    }

    /// Park the calling thread for at most `timeout`.
    pub fn blocking_get_timeout(&self, timeout: Duration) -> TaskResult<V> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.shared.slot.lock();
        loop {
            if let Some(result) = slot.outcome() {
                return result;
            }
            if self.shared.cond.wait_until(&mut slot, deadline).timed_out() {
                return slot.outcome().unwrap_or(Err(TaskError::Timeout(timeout)));
            }
        }
    }

    /// Park the calling thread for at most `timeout`, returning `default`
    /// on any failure.
    pub fn blocking_get_or(&self, timeout: Duration, default: V) -> V {
        self.blocking_get_timeout(timeout).unwrap_or(default)
    }

    fn wake_all(&self) {
        self.shared.cond.notify_all();
        self.shared.notify.notify_waiters();
    }
}

//! Pooled Tasks
//!
//! A [`Task`] is a single-assignment promise. Logic suspends on it with
//! `.await` (or registers an [`Task::on_complete`] callback); whoever holds a
//! [`TaskCompleter`] resolves it later. Continuations run in registration
//! order and are cleared afterwards.
//!
//! Slots live in a [`TaskPool`]. Observing the result (or dropping the
//! owning [`Task`]) releases the slot back to the pool and bumps its
//! generation, so completers that outlive their task get
//! [`TaskError::Released`] instead of resolving somebody else's work.

use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use crate::core::pool::{GenerationalPool, PoolHandle, Poolable};
use crate::task::cancel::{CallbackId, CancellationToken};

/// Task lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskStatus {
    /// Not resolved yet.
    #[default]
    Pending,
    /// Resolved with a value.
    Completed,
    /// Resolved with an error.
    Faulted,
    /// Resolved by cancellation.
    Canceled,
}

impl TaskStatus {
    /// True once the task has left `Pending`.
    pub fn is_done(self) -> bool {
        self != TaskStatus::Pending
    }
}

/// Task errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// The task was canceled.
    #[error("task canceled")]
    Canceled,
    /// The producer reported a failure.
    #[error("task faulted: {0}")]
    Faulted(String),
    /// A second resolution was attempted.
    #[error("task already completed")]
    AlreadyCompleted,
    /// The slot was returned to the pool; the handle is stale.
    #[error("task handle released")]
    Released,
}

enum Continuation {
    Wake(Waker),
    Callback(Box<dyn FnOnce(TaskStatus) + Send>),
}

impl Continuation {
    fn run(self, status: TaskStatus) {
        match self {
            Continuation::Wake(waker) => waker.wake(),
            Continuation::Callback(callback) => callback(status),
        }
    }
}

struct TaskSlot<T> {
    status: TaskStatus,
    result: Option<Result<T, TaskError>>,
    continuations: Vec<Continuation>,
}

impl<T> Default for TaskSlot<T> {
    fn default() -> Self {
        Self {
            status: TaskStatus::Pending,
            result: None,
            continuations: Vec::new(),
        }
    }
}

impl<T> Poolable for TaskSlot<T> {
    fn reset(&mut self) {
        self.status = TaskStatus::Pending;
        self.result = None;
        self.continuations.clear();
    }
}

/// Pool occupancy snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Slots owned by live tasks.
    pub live: usize,
    /// Slots waiting for reuse.
    pub free: usize,
    /// Slots ever allocated.
    pub capacity: usize,
}

/// Shared pool of task slots.
pub struct TaskPool<T> {
    slots: Arc<Mutex<GenerationalPool<TaskSlot<T>>>>,
}

impl<T> Clone for TaskPool<T> {
    fn clone(&self) -> Self {
        Self {
            slots: self.slots.clone(),
        }
    }
}

impl<T> Default for TaskPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TaskPool<T> {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(GenerationalPool::new())),
        }
    }

    /// Take a pending task from the pool.
    pub fn create(&self) -> Task<T> {
        let handle = self.slots.lock().acquire();
        Task {
            pool: self.clone(),
            handle,
            released: false,
        }
    }

    /// Occupancy counters.
    pub fn stats(&self) -> PoolStats {
        let slots = self.slots.lock();
        PoolStats {
            live: slots.live(),
            free: slots.free(),
            capacity: slots.capacity(),
        }
    }

    fn status(&self, handle: PoolHandle) -> Result<TaskStatus, TaskError> {
        self.slots
            .lock()
            .get(handle)
            .map(|slot| slot.status)
            .ok_or(TaskError::Released)
    }

    fn complete(&self, handle: PoolHandle, status: TaskStatus, result: Result<T, TaskError>) -> Result<(), TaskError> {
        let continuations = {
            let mut slots = self.slots.lock();
            let slot = slots.get_mut(handle).ok_or(TaskError::Released)?;
            if slot.status.is_done() {
                return Err(TaskError::AlreadyCompleted);
            }
            slot.status = status;
            slot.result = Some(result);
            std::mem::take(&mut slot.continuations)
        };

        // Run outside the lock; continuations may touch the pool.
        for continuation in continuations {
            continuation.run(status);
        }
        Ok(())
    }
}

/// Owning handle of a pooled task. Awaiting it yields the result and
/// returns the slot to the pool.
pub struct Task<T> {
    pool: TaskPool<T>,
    handle: PoolHandle,
    released: bool,
}

impl<T> Task<T> {
    /// Resolver for this task.
    pub fn completer(&self) -> TaskCompleter<T> {
        TaskCompleter {
            pool: self.pool.clone(),
            handle: self.handle,
        }
    }

    /// Current state.
    pub fn status(&self) -> Result<TaskStatus, TaskError> {
        self.pool.status(self.handle)
    }

    /// Pool slot this task occupies.
    pub fn handle(&self) -> PoolHandle {
        self.handle
    }

    /// Register a callback to run once the task resolves. Runs immediately
    /// if it already has.
    pub fn on_complete<F>(&self, callback: F) -> Result<(), TaskError>
    where
        F: FnOnce(TaskStatus) + Send + 'static,
    {
        let status = {
            let mut slots = self.pool.slots.lock();
            let slot = slots.get_mut(self.handle).ok_or(TaskError::Released)?;
            if slot.status == TaskStatus::Pending {
                slot.continuations.push(Continuation::Callback(Box::new(callback)));
                return Ok(());
            }
            slot.status
        };
        callback(status);
        Ok(())
    }

    /// Resolve with a value.
    pub fn set_result(&self, value: T) -> Result<(), TaskError> {
        self.completer().set_result(value)
    }

    /// Resolve with an error.
    pub fn set_exception(&self, message: impl Into<String>) -> Result<(), TaskError> {
        self.completer().set_exception(message)
    }

    /// Resolve as canceled.
    pub fn cancel(&self) -> Result<(), TaskError> {
        self.completer().cancel()
    }

    /// Cancel this task when `token` fires.
    pub fn attach(&self, token: &CancellationToken) -> Option<CallbackId>
    where
        T: Send + 'static,
    {
        let completer = self.completer();
        token.add(move || {
            // Already resolved or released; nothing to cancel.
            let _ = completer.cancel();
        })
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.pool.slots.lock().release(self.handle);
        }
    }
}

impl<T> Future for Task<T> {
    type Output = Result<T, TaskError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.released {
            return Poll::Ready(Err(TaskError::Released));
        }

        let result = {
            let mut slots = self.pool.slots.lock();
            let Some(slot) = slots.get_mut(self.handle) else {
                return Poll::Ready(Err(TaskError::Released));
            };
            if slot.status == TaskStatus::Pending {
                let registered = slot
                    .continuations
                    .iter()
                    .any(|c| matches!(c, Continuation::Wake(w) if w.will_wake(cx.waker())));
                if !registered {
                    slot.continuations.push(Continuation::Wake(cx.waker().clone()));
                }
                return Poll::Pending;
            }
            slot.result.take().unwrap_or(Err(TaskError::Released))
        };

        self.release();
        Poll::Ready(result)
    }
}

impl<T> Drop for Task<T> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Cloneable resolver bound to one generation of a task slot.
pub struct TaskCompleter<T> {
    pool: TaskPool<T>,
    handle: PoolHandle,
}

impl<T> Clone for TaskCompleter<T> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            handle: self.handle,
        }
    }
}

impl<T> TaskCompleter<T> {
    /// Resolve with a value.
    pub fn set_result(&self, value: T) -> Result<(), TaskError> {
        self.pool.complete(self.handle, TaskStatus::Completed, Ok(value))
    }

    /// Resolve with an error.
    pub fn set_exception(&self, message: impl Into<String>) -> Result<(), TaskError> {
        self.pool
            .complete(self.handle, TaskStatus::Faulted, Err(TaskError::Faulted(message.into())))
    }

    /// Resolve as canceled.
    pub fn cancel(&self) -> Result<(), TaskError> {
        self.pool.complete(self.handle, TaskStatus::Canceled, Err(TaskError::Canceled))
    }

    /// State of the task this completer refers to.
    pub fn status(&self) -> Result<TaskStatus, TaskError> {
        self.pool.status(self.handle)
    }
}

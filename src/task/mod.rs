//! Cooperative Task Scheduler
//!
//! Suspension primitives used by scene logic: pooled single-assignment
//! tasks, cancellation tokens and per-key async locks. Scene code never
//! blocks a worker thread; it awaits one of these instead.

pub mod cancel;
pub mod lock;
pub mod promise;

pub use cancel::{CallbackId, CancellationToken};
pub use lock::{KeyedGuard, KeyedLock};
pub use promise::{PoolStats, Task, TaskCompleter, TaskError, TaskPool, TaskStatus};

//! Cancellation tokens.
//!
//! Cancellation is cooperative: firing a token runs its registered
//! callbacks (which typically cancel pending tasks) but never interrupts a
//! handler that is already running.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::error;

/// Identifier of a registered cancellation callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CallbackId(u64);

#[derive(Default)]
struct TokenState {
    canceled: bool,
    next_id: u64,
    callbacks: BTreeMap<CallbackId, Box<dyn FnOnce() + Send>>,
}

/// Shared cancellation flag with cleanup callbacks.
#[derive(Clone, Default)]
pub struct CancellationToken {
    state: Arc<Mutex<TokenState>>,
}

impl CancellationToken {
    /// Create an uncanceled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback. If the token is already canceled the callback
    /// runs immediately and `None` is returned.
    pub fn add<F>(&self, callback: F) -> Option<CallbackId>
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = self.state.lock();
            if !state.canceled {
                state.next_id += 1;
                let id = CallbackId(state.next_id);
                state.callbacks.insert(id, Box::new(callback));
                return Some(id);
            }
        }
        run_callback(Box::new(callback));
        None
    }

    /// Unregister a callback. Returns false if it already ran or was removed.
    pub fn remove(&self, id: CallbackId) -> bool {
        self.state.lock().callbacks.remove(&id).is_some()
    }

    /// Fire the token. Callbacks run in insertion order; later calls are no-ops.
    pub fn cancel(&self) {
        let callbacks = {
            let mut state = self.state.lock();
            if state.canceled {
                return;
            }
            state.canceled = true;
            std::mem::take(&mut state.callbacks)
        };

        for (_, callback) in callbacks {
            run_callback(callback);
        }
    }

    /// True once `cancel` has been called.
    pub fn is_canceled(&self) -> bool {
        self.state.lock().canceled
    }

    /// Registered callbacks still waiting to run.
    pub fn pending_callbacks(&self) -> usize {
        self.state.lock().callbacks.len()
    }
}

fn run_callback(callback: Box<dyn FnOnce() + Send>) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(callback)) {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        error!("Cancellation callback panicked: {}", message);
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CancellationToken")
            .field("canceled", &state.canceled)
            .field("callbacks", &state.callbacks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_runs_in_insertion_order() {
        let token = CancellationToken::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..4 {
            let log = log.clone();
            token.add(move || log.lock().push(i));
        }
        token.cancel();
        assert_eq!(*log.lock(), vec![0, 1, 2, 3]);
        assert!(token.is_canceled());
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let token = CancellationToken::new();
        let count = Arc::new(Mutex::new(0));
        let c = count.clone();
        token.add(move || *c.lock() += 1);

        token.cancel();
        token.cancel();
        assert_eq!(*count.lock(), 1);
    }

    #[test]
    fn test_removed_callback_skipped() {
        let token = CancellationToken::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = {
            let log = log.clone();
            token.add(move || log.lock().push("a")).unwrap()
        };
        {
            let log = log.clone();
            token.add(move || log.lock().push("b"));
        }
        assert!(token.remove(a));
        assert!(!token.remove(a));
        token.cancel();
        assert_eq!(*log.lock(), vec!["b"]);
    }

    #[test]
    fn test_panicking_callback_does_not_stop_others() {
        let token = CancellationToken::new();
        let ran = Arc::new(Mutex::new(false));
        token.add(|| panic!("callback failure"));
        {
            let ran = ran.clone();
            token.add(move || *ran.lock() = true);
        }
        token.cancel();
        assert!(*ran.lock());
        assert_eq!(token.pending_callbacks(), 0);
    }

    #[test]
    fn test_add_after_cancel_runs_immediately() {
        let token = CancellationToken::new();
        token.cancel();
        let ran = Arc::new(Mutex::new(false));
        let r = ran.clone();
        assert!(token.add(move || *r.lock() = true).is_none());
        assert!(*ran.lock());
    }
}

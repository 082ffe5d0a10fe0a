//! Outstanding-call table.
//!
//! One table per channel. A call takes a fresh rpc id, parks a pooled task
//! in the table and waits. Exactly one of three things then removes the
//! entry: the matching response, the deadline sweep or channel disposal.
//! Removal happens under the table lock, so whoever removes the entry is
//! the only one that resolves the task.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::time::Instant;
use tracing::debug;

use super::error_code;
use crate::network::packet::PackInfo;
use crate::task::{Task, TaskCompleter, TaskPool};

/// Outcome of a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcReply {
    /// The peer answered.
    Pack(PackInfo),
    /// The runtime gave up with an error code.
    Error(u32),
}

struct PendingCall {
    op_code: u32,
    deadline: Instant,
    completer: TaskCompleter<RpcReply>,
}

/// Pending calls of one channel, keyed by rpc id.
pub struct RpcTable {
    next_id: AtomicU32,
    pending: Mutex<HashMap<u32, PendingCall>>,
    tasks: TaskPool<RpcReply>,
}

impl Default for RpcTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcTable {
    /// Empty table.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU32::new(0),
            pending: Mutex::new(HashMap::new()),
            tasks: TaskPool::new(),
        }
    }

    /// Allocate an rpc id (never 0) and park a task until `deadline`.
    pub fn register(&self, op_code: u32, deadline: Instant) -> (u32, Task<RpcReply>) {
        let mut rpc_id = self.next_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        if rpc_id == 0 {
            rpc_id = self.next_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        }

        let task = self.tasks.create();
        self.pending.lock().insert(
            rpc_id,
            PendingCall {
                op_code,
                deadline,
                completer: task.completer(),
            },
        );
        (rpc_id, task)
    }

    /// Deliver a response. Returns false when no call is waiting for it
    /// (already timed out, or unknown).
    pub fn resolve(&self, pack: PackInfo) -> bool {
        let Some(call) = self.pending.lock().remove(&pack.rpc_id) else {
            debug!("No pending call for rpc {} (op {})", pack.rpc_id, pack.op_code);
            return false;
        };
        call.completer.set_result(RpcReply::Pack(pack)).is_ok()
    }

    /// Fail one call with `code`.
    pub fn fail(&self, rpc_id: u32, code: u32) -> bool {
        let Some(call) = self.pending.lock().remove(&rpc_id) else {
            return false;
        };
        call.completer.set_result(RpcReply::Error(code)).is_ok()
    }

    /// Time out every call whose deadline is at or before `now`.
    pub fn sweep(&self, now: Instant) -> usize {
        let expired: Vec<(u32, PendingCall)> = {
            let mut pending = self.pending.lock();
            let ids: Vec<u32> = pending
                .iter()
                .filter(|(_, call)| call.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|call| (id, call)))
                .collect()
        };

        for (rpc_id, call) in &expired {
            debug!("Call rpc {} op {} timed out", rpc_id, call.op_code);
            let _ = call.completer.set_result(RpcReply::Error(error_code::ROUTE_TIMEOUT));
        }
        expired.len()
    }

    /// Fail every pending call; used when the channel goes away.
    pub fn fail_all(&self, code: u32) -> usize {
        let drained: Vec<PendingCall> = self.pending.lock().drain().map(|(_, call)| call).collect();
        for call in &drained {
            let _ = call.completer.set_result(RpcReply::Error(code));
        }
        drained.len()
    }

    /// Pending call count.
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// True when nothing is outstanding.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::Arc;
    use std::time::Duration;

    fn reply(rpc_id: u32) -> PackInfo {
        PackInfo::new(120_000_001, Bytes::from_static(b"ok")).with_rpc_id(rpc_id)
    }

    #[tokio::test]
    async fn test_response_resolves_once() {
        let table = RpcTable::new();
        let (rpc_id, task) = table.register(100_000_001, Instant::now() + Duration::from_secs(5));
        assert_eq!(table.len(), 1);

        assert!(table.resolve(reply(rpc_id)));
        assert!(!table.resolve(reply(rpc_id)), "second response must be ignored");
        assert_eq!(table.sweep(Instant::now() + Duration::from_secs(10)), 0);

        assert_eq!(task.await, Ok(RpcReply::Pack(reply(rpc_id))));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_times_out() {
        let table = RpcTable::new();
        let now = Instant::now();
        let (late, late_task) = table.register(1, now + Duration::from_millis(10));
        let (_, fresh_task) = table.register(2, now + Duration::from_secs(60));

        assert_eq!(table.sweep(now + Duration::from_millis(20)), 1);
        assert_eq!(table.len(), 1);
        assert!(!table.resolve(reply(late)), "late response after timeout");
        assert_eq!(late_task.await, Ok(RpcReply::Error(error_code::ROUTE_TIMEOUT)));

        assert_eq!(table.fail_all(error_code::RPC_FAIL), 1);
        assert_eq!(fresh_task.await, Ok(RpcReply::Error(error_code::RPC_FAIL)));
    }

    #[test]
    fn test_ids_are_monotonic_and_nonzero() {
        let table = RpcTable::new();
        table.next_id.store(u32::MAX - 1, Ordering::Relaxed);
        let deadline = Instant::now();
        let (a, _ta) = table.register(1, deadline);
        let (b, _tb) = table.register(1, deadline);
        assert_eq!(a, u32::MAX);
        assert_ne!(b, 0);
    }

    #[test]
    fn test_race_between_response_and_sweep() {
        for _ in 0..200 {
            let table = Arc::new(RpcTable::new());
            let now = Instant::now();
            let (rpc_id, task) = table.register(1, now);

            let responder = {
                let table = table.clone();
                std::thread::spawn(move || table.resolve(reply(rpc_id)))
            };
            let swept = table.sweep(now);
            let resolved = responder.join().unwrap();

            assert!(resolved ^ (swept == 1), "exactly one side must win");
            assert_eq!(task.status().unwrap(), crate::task::TaskStatus::Completed);
            assert!(table.is_empty());
        }
    }
}

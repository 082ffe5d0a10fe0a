//! Core primitives.
//!
//! Identifier packing, the reusable object pool and the deadline queue that
//! the rest of the runtime is built on. Nothing here touches the network.

pub mod id;
pub mod pool;
pub mod timer;

pub use id::{Clock, EntityId, IdError, IdFactory, ManualClock, RuntimeId, SystemClock, RELIC_EPOCH};
pub use pool::{GenerationalPool, PoolHandle, Poolable};
pub use timer::{TimerId, TimerWheel};

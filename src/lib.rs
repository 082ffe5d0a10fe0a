//! # Relic Runtime
//!
//! Distributed scene/actor runtime for game servers: single-threaded
//! scenes, routed RPC between them, and client transports over TCP,
//! WebSocket and a KCP-style reliable UDP.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      RELIC RUNTIME                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/       - Ids, generational pool, timer queue           │
//! │  task/       - Pooled tasks, cancellation, keyed locks       │
//! │  config/     - Topology file and runtime tunables            │
//! │  entity/     - Entity tree, lifecycle hooks, scene threads   │
//! │  network/    - Packet codec, sessions, TCP / WS / KCP        │
//! │  message/    - Opcodes, codecs, dispatcher, RPC table        │
//! │  routing/    - Router, addressable directory, roaming        │
//! │  storage/    - Entity persistence backends                   │
//! │  process/    - Builds a process from the topology            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Threading
//!
//! Transports, the router and the inner listener run on the process's
//! multi-threaded tokio runtime. Every scene owns one OS thread; all
//! entity state lives there and is only touched by that scene's handlers.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod core;
pub mod entity;
pub mod message;
pub mod network;
pub mod process;
pub mod routing;
pub mod storage;
pub mod task;

// Re-export commonly used types
pub use crate::core::id::{EntityId, IdFactory, RuntimeId};
pub use config::{NetworkProtocol, RuntimeConfig, SceneType, Topology};
pub use entity::{LifecycleRegistry, SceneContext, SceneHandle};
pub use message::{error_code, HandlerContext, Message, Request, Response};
pub use network::Session;
pub use process::{Process, ProcessError, ProcessHandle};
pub use routing::{ActorId, Router};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Entity & Scene Model
//!
//! ```text
//!   Scene (thread) ── EntityTree ── entity ── components
//!                                   └─ child entities
//! ```
//!
//! Entities are plain Rust values stored type-erased in the scene's tree and
//! addressed by [`RuntimeId`](crate::core::id::RuntimeId). Lifecycle hooks
//! are registered per type once at startup.

pub mod registry;
pub mod scene;
pub mod tree;

pub use registry::{LifecycleBuilder, LifecycleRegistry};
pub use scene::{Scene, SceneCommand, SceneContext, SceneError, SceneHandle, SceneInfo, SceneServices, SceneSetup};
pub use tree::{EntityError, EntityTree};

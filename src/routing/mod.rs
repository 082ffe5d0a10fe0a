//! Addressable & Roaming Routing
//!
//! Cluster-wide delivery by runtime id, the addressable directory that maps
//! logical actor ids to their current owner, and roaming links that let a
//! gate session talk to entities in other scenes.

pub mod addressable;
pub mod roaming;
pub mod route;
pub mod router;

pub use addressable::{AddressableDirectory, EntryState};
pub use roaming::{SessionRoaming, Terminus};
pub use route::AddressableRoute;
pub use router::{ActorId, Router};

pub(crate) use roaming::forward_roaming;
pub(crate) use route::forward_addressable;

use crate::message::{DispatchError, DispatcherBuilder};

/// Handlers every process registers for its own protocol.
pub fn register_runtime_handlers(builder: &mut DispatcherBuilder) -> Result<(), DispatchError> {
    addressable::register(builder)?;
    roaming::register(builder)?;
    Ok(())
}

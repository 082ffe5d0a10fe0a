//! Session roaming.
//!
//! A gate session can be linked to one terminus per roaming type. The
//! terminus is an ordinary entity in some other scene; client packets in
//! the roaming bands are forwarded to it by the packet's route type, and
//! the terminus talks back to the client through the gate session.
//!
//! ```text
//!   client ──► gate session ──(route_type_code)──► Terminus in map scene
//!      ▲                                               │
//!      └────────────── send_to_client ─────────────────┘
//! ```

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::core::id::RuntimeId;
use crate::entity::SceneContext;
use crate::message::protocol::{LinkRoamingRequest, LinkRoamingResponse, UnlinkRoamingRequest, UnlinkRoamingResponse};
use crate::message::{error_code, DispatchError, DispatcherBuilder, HandlerContext, Message, OpCode, Response, RpcReply};
use crate::network::channel::NetworkError;
use crate::network::packet::PackInfo;
use crate::network::session::Session;
use crate::routing::Router;

#[derive(Clone)]
struct RoamingLink {
    terminus: RuntimeId,
    scene_id: u16,
    gate: Arc<Mutex<()>>,
}

#[derive(Default)]
struct RoamingState {
    links: HashMap<i64, RoamingLink>,
    held: HashMap<i64, OwnedMutexGuard<()>>,
}

/// Session component holding the roaming links of one client.
#[derive(Clone)]
pub struct SessionRoaming {
    session: RuntimeId,
    state: Rc<RefCell<RoamingState>>,
}

impl std::fmt::Debug for SessionRoaming {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("SessionRoaming")
            .field("session", &self.session)
            .field("links", &state.links.len())
            .field("locked", &state.held.len())
            .finish()
    }
}

impl SessionRoaming {
    /// Roaming for the session `session`.
    pub fn new(session: RuntimeId) -> Self {
        Self {
            session,
            state: Rc::new(RefCell::new(RoamingState::default())),
        }
    }

    /// Terminus linked for `roaming_type`.
    pub fn terminus(&self, roaming_type: i64) -> Option<RuntimeId> {
        self.state.borrow().links.get(&roaming_type).map(|link| link.terminus)
    }

    /// Linked roaming types.
    pub fn linked_types(&self) -> Vec<i64> {
        self.state.borrow().links.keys().copied().collect()
    }

    /// Create a terminus for `roaming_type` in `target_scene`.
    pub async fn link(&self, ctx: &SceneContext, target_scene: u16, roaming_type: i64) -> Result<RuntimeId, u32> {
        if self.terminus(roaming_type).is_some() {
            return Err(error_code::ROAMING_ALREADY_LINKED);
        }

        let request = LinkRoamingRequest {
            roaming_id: self.session,
            roaming_type,
            forward_route: self.session,
        };
        let response = ctx.call(RuntimeId::scene_address(target_scene), &request).await;
        if response.error_code() != error_code::SUCCESS {
            return Err(response.error_code());
        }

        let won = {
            let mut state = self.state.borrow_mut();
            if state.links.contains_key(&roaming_type) {
                false
            } else {
                state.links.insert(
                    roaming_type,
                    RoamingLink {
                        terminus: response.terminus_route,
                        scene_id: target_scene,
                        gate: Arc::new(Mutex::new(())),
                    },
                );
                true
            }
        };
        if !won {
            // A concurrent link won; remove the terminus this call created.
            let request = UnlinkRoamingRequest {
                roaming_id: self.session,
                roaming_type,
            };
            let response = ctx.call(RuntimeId::scene_address(target_scene), &request).await;
            if response.error_code() != error_code::SUCCESS {
                warn!(
                    "Orphaned terminus of session {} in scene {}: {}",
                    self.session,
                    target_scene,
                    error_code::name(response.error_code())
                );
            }
            return Err(error_code::ROAMING_ALREADY_LINKED);
        }
        debug!(
            "Session {} roaming type {} linked to {}",
            self.session, roaming_type, response.terminus_route
        );
        Ok(response.terminus_route)
    }

    /// Remove the link for `roaming_type` and dispose its terminus.
    pub async fn unlink(&self, ctx: &SceneContext, roaming_type: i64) -> Result<(), u32> {
        let link = {
            let mut state = self.state.borrow_mut();
            state.held.remove(&roaming_type);
            state.links.remove(&roaming_type)
        };
        let Some(link) = link else {
            return Err(error_code::NOT_FOUND_ROAMING);
        };

        let request = UnlinkRoamingRequest {
            roaming_id: self.session,
            roaming_type,
        };
        let response = ctx.call(RuntimeId::scene_address(link.scene_id), &request).await;
        match response.error_code() {
            error_code::SUCCESS => Ok(()),
            code => Err(code),
        }
    }

    /// Unlink every type, ignoring failures.
    pub async fn unlink_all(&self, ctx: &SceneContext) {
        for roaming_type in self.linked_types() {
            if let Err(code) = self.unlink(ctx, roaming_type).await {
                debug!("Unlink of roaming type {} failed: {}", roaming_type, error_code::name(code));
            }
        }
    }

    /// Hold forwarding for `roaming_type` while its terminus moves.
    pub async fn lock_terminus(&self, roaming_type: i64) -> Result<(), u32> {
        let gate = self
            .state
            .borrow()
            .links
            .get(&roaming_type)
            .map(|link| link.gate.clone())
            .ok_or(error_code::NOT_FOUND_ROAMING)?;
        let guard = gate.lock_owned().await;
        self.state.borrow_mut().held.insert(roaming_type, guard);
        Ok(())
    }

    /// Point `roaming_type` at its new terminus and resume forwarding.
    pub fn unlock_terminus(&self, roaming_type: i64, terminus: RuntimeId, scene_id: u16) -> Result<(), u32> {
        let mut state = self.state.borrow_mut();
        let link = state
            .links
            .get_mut(&roaming_type)
            .ok_or(error_code::NOT_FOUND_ROAMING)?;
        if !terminus.is_none() {
            link.terminus = terminus;
            link.scene_id = scene_id;
        }
        state.held.remove(&roaming_type);
        Ok(())
    }

    async fn current_terminus(&self, ctx: &SceneContext, roaming_type: i64) -> Result<RuntimeId, u32> {
        let gate = self
            .state
            .borrow()
            .links
            .get(&roaming_type)
            .map(|link| link.gate.clone())
            .ok_or(error_code::NOT_FOUND_ROAMING)?;

        match timeout(ctx.config().rpc_timeout, gate.lock()).await {
            Ok(_passed) => {}
            Err(_) => {
                warn!("Roaming type {} of session {} stayed locked", roaming_type, self.session);
                return Err(error_code::ROAMING_TIMEOUT);
            }
        }
        self.terminus(roaming_type).ok_or(error_code::NOT_FOUND_ROAMING)
    }

    /// Forward a client request to the terminus of `pack.route_type_code`.
    pub async fn call(&self, ctx: &SceneContext, pack: PackInfo) -> RpcReply {
        match self.current_terminus(ctx, pack.route_type_code).await {
            Ok(terminus) => ctx.router().call_raw(pack.with_route(terminus)).await,
            Err(code) => RpcReply::Error(code),
        }
    }

    /// Forward a client message to the terminus of `pack.route_type_code`.
    pub async fn send(&self, ctx: &SceneContext, pack: PackInfo) -> Result<(), u32> {
        let terminus = self.current_terminus(ctx, pack.route_type_code).await?;
        ctx.router()
            .send_pack(pack.with_route(terminus))
            .await
            .map_err(|_| error_code::RPC_FAIL)
    }
}

/// Far end of a roaming link, living in the target scene.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Terminus {
    /// Gate session runtime id.
    pub roaming_id: RuntimeId,
    /// Roaming type.
    pub roaming_type: i64,
    /// Where client-bound messages go.
    pub forward_route: RuntimeId,
}

impl Terminus {
    /// Send a message to the linked client through its gate session.
    pub async fn send_to_client<M: Message>(&self, router: &Router, message: &M) -> Result<(), NetworkError> {
        router.send(self.forward_route, message).await
    }
}

fn find_terminus(ctx: &SceneContext, roaming_id: RuntimeId, roaming_type: i64) -> Option<RuntimeId> {
    ctx.tree()
        .iter_of::<Terminus>()
        .find(|(_, t)| t.roaming_id == roaming_id && t.roaming_type == roaming_type)
        .map(|(runtime_id, _)| runtime_id)
}

/// Link and unlink handlers.
pub fn register(builder: &mut DispatcherBuilder) -> Result<(), DispatchError> {
    builder.request(|ctx: HandlerContext, request: LinkRoamingRequest| async move {
        let scene = &ctx.scene;
        if find_terminus(scene, request.roaming_id, request.roaming_type).is_some() {
            return LinkRoamingResponse::from_error(error_code::TERMINUS_ALREADY_EXISTS);
        }
        let terminus = Terminus {
            roaming_id: request.roaming_id,
            roaming_type: request.roaming_type,
            forward_route: request.forward_route,
        };
        let terminus_route = match scene.tree_mut().create_entity(terminus, None) {
            Ok(route) => route,
            Err(e) => {
                warn!("Scene {} cannot create terminus: {}", scene.scene_id(), e);
                return LinkRoamingResponse::from_error(error_code::RPC_FAIL);
            }
        };
        debug!(
            "Scene {} created terminus {} for session {}",
            scene.scene_id(),
            terminus_route,
            request.roaming_id
        );
        LinkRoamingResponse {
            error_code: error_code::SUCCESS,
            terminus_route,
        }
    })?;

    builder.request(|ctx: HandlerContext, request: UnlinkRoamingRequest| async move {
        let scene = &ctx.scene;
        let Some(terminus) = find_terminus(scene, request.roaming_id, request.roaming_type) else {
            return UnlinkRoamingResponse::from_error(error_code::NOT_FOUND_ROAMING);
        };
        let _ = scene.tree_mut().dispose(terminus);
        UnlinkRoamingResponse::default()
    })?;

    Ok(())
}

/// Forward a client packet in the roaming bands.
pub(crate) async fn forward_roaming(ctx: SceneContext, session: Session, pack: PackInfo) {
    let op_code = pack.op_code;
    let rpc_id = pack.rpc_id;
    let roaming = ctx.tree().get_component::<SessionRoaming>(session.runtime_id()).cloned();

    let Some(roaming) = roaming else {
        if rpc_id == 0 {
            warn!("Session {} has no roaming links, dropping opcode {}", session.runtime_id(), op_code);
        }
        ctx.reject(&session, op_code, rpc_id, error_code::NOT_FOUND_ROAMING);
        return;
    };

    if !OpCode(op_code).is_request() {
        if let Err(code) = roaming.send(&ctx, pack).await {
            debug!("Roaming message {} dropped: {}", op_code, error_code::name(code));
        }
        return;
    }

    match roaming.call(&ctx, pack).await {
        RpcReply::Pack(reply) => {
            if let Err(e) = session.send_pack(reply.with_rpc_id(rpc_id)) {
                debug!("Relay to session {} failed: {}", session.runtime_id(), e);
            }
        }
        RpcReply::Error(code) => ctx.reject(&session, op_code, rpc_id, code),
    }
}

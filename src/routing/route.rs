//! Gate-side route to an addressable actor.
//!
//! Attached as a component to a client session. Client packets in the
//! addressable bands are forwarded to whoever owns the actor right now;
//! while the actor migrates the directory lookup waits, and a stale cached
//! route is retried after a short back-off.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::core::id::RuntimeId;
use crate::entity::SceneContext;
use crate::message::{error_code, OpCode, RpcReply};
use crate::network::packet::PackInfo;
use crate::network::session::Session;

/// Route misses tolerated before giving up.
pub const MAX_ROUTE_FAILURES: u32 = 20;
/// Wait after the first miss.
pub const FIRST_RETRY_DELAY: Duration = Duration::from_millis(100);
/// Wait after later misses.
pub const RETRY_DELAY: Duration = Duration::from_millis(500);

struct RouteState {
    addressable_id: i64,
    cached: Cell<RuntimeId>,
    lock: Mutex<()>,
}

/// Session component bound to one addressable actor.
#[derive(Clone)]
pub struct AddressableRoute {
    inner: Rc<RouteState>,
}

impl std::fmt::Debug for AddressableRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressableRoute")
            .field("addressable_id", &self.inner.addressable_id)
            .field("cached", &self.inner.cached.get())
            .finish()
    }
}

impl AddressableRoute {
    /// Route to `addressable_id`, resolved on first use.
    pub fn new(addressable_id: i64) -> Self {
        Self {
            inner: Rc::new(RouteState {
                addressable_id,
                cached: Cell::new(RuntimeId::NONE),
                lock: Mutex::new(()),
            }),
        }
    }

    /// Target actor.
    pub fn addressable_id(&self) -> i64 {
        self.inner.addressable_id
    }

    /// Last resolved owner.
    pub fn cached_route(&self) -> Option<RuntimeId> {
        Some(self.inner.cached.get()).filter(|route| !route.is_none())
    }

    async fn resolve(&self, ctx: &SceneContext) -> Result<RuntimeId, u32> {
        if let Some(route) = self.cached_route() {
            return Ok(route);
        }
        let route = ctx.router().addressable_get(self.inner.addressable_id).await?;
        self.inner.cached.set(route);
        Ok(route)
    }

    /// Call the actor with `pack`, retrying while the cached route is stale.
    /// Calls through one route are serialized.
    pub async fn call(&self, ctx: &SceneContext, pack: PackInfo) -> RpcReply {
        let _serial = self.inner.lock.lock().await;
        let op_code = pack.op_code;
        let mut failures = 0u32;

        loop {
            let route = match self.resolve(ctx).await {
                Ok(route) => route,
                Err(code) => return RpcReply::Error(code),
            };

            let reply = ctx.router().call_raw(pack.clone().with_route(route)).await;
            let code = match &reply {
                RpcReply::Error(code) => *code,
                RpcReply::Pack(response) => ctx
                    .dispatcher()
                    .response_error_code(op_code, &response.body)
                    .unwrap_or(error_code::SUCCESS),
            };
            if code == error_code::ROUTE_TIMEOUT || !error_code::is_route_miss(code) {
                return reply;
            }

            failures += 1;
            if failures > MAX_ROUTE_FAILURES {
                error!(
                    "Addressable {} unreachable after {} attempts",
                    self.inner.addressable_id, failures
                );
                return reply;
            }

            self.inner.cached.set(RuntimeId::NONE);
            let wait = if failures == 1 { FIRST_RETRY_DELAY } else { RETRY_DELAY };
            debug!(
                "Addressable {} missed at {} ({}), retrying in {:?}",
                self.inner.addressable_id,
                route,
                error_code::name(code),
                wait
            );
            if ctx.delay(wait).await.is_err() {
                return RpcReply::Error(error_code::ROUTE_TIMEOUT);
            }
        }
    }

    /// Send a message to the actor once.
    pub async fn send(&self, ctx: &SceneContext, pack: PackInfo) -> Result<(), u32> {
        let route = {
            let _serial = self.inner.lock.lock().await;
            self.resolve(ctx).await?
        };
        ctx.router().send_pack(pack.with_route(route)).await.map_err(|e| {
            warn!("Addressable {} send failed: {}", self.inner.addressable_id, e);
            self.inner.cached.set(RuntimeId::NONE);
            error_code::RPC_FAIL
        })
    }
}

/// Forward a client packet in the addressable bands.
pub(crate) async fn forward_addressable(ctx: SceneContext, session: Session, pack: PackInfo) {
    let op_code = pack.op_code;
    let rpc_id = pack.rpc_id;
    let route = ctx.tree().get_component::<AddressableRoute>(session.runtime_id()).cloned();

    let Some(route) = route else {
        if rpc_id == 0 {
            warn!("Session {} has no addressable route, dropping opcode {}", session.runtime_id(), op_code);
        }
        ctx.reject(&session, op_code, rpc_id, error_code::NOT_FOUND_ROUTE);
        return;
    };

    if !OpCode(op_code).is_request() {
        if let Err(code) = route.send(&ctx, pack).await {
            debug!("Addressable message {} dropped: {}", op_code, error_code::name(code));
        }
        return;
    }

    match route.call(&ctx, pack).await {
        RpcReply::Pack(reply) => {
            if let Err(e) = session.send_pack(reply.with_rpc_id(rpc_id)) {
                debug!("Relay to session {} failed: {}", session.runtime_id(), e);
            }
        }
        RpcReply::Error(code) => ctx.reject(&session, op_code, rpc_id, code),
    }
}

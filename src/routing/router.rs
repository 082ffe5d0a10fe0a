//! Process router.
//!
//! Resolves a [`RuntimeId`] to the scene that owns it and delivers there:
//! through the loopback session when the scene lives in this process,
//! otherwise through the inner TCP session to the owning process. Inner
//! sessions are dialed on first use, one per remote process.
//!
//! ```text
//!   scene A ── call(route) ──► Router ──┬── loopback ──► local scene B
//!                                       └── inner TCP ──► remote process
//! ```

use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::{NetworkProtocol, RuntimeConfig, Topology};
use crate::core::id::{IdFactory, RuntimeId};
use crate::entity::SceneHandle;
use crate::message::protocol::{
    AddressableAddRequest, AddressableGetRequest, AddressableLockRequest, AddressableRemoveRequest,
    AddressableUnlockRequest,
};
use crate::message::{error_code, Message, MessageDispatcher, Request, Response, RpcReply};
use crate::network::channel::{NetworkChannel, NetworkError, QueuedChannel};
use crate::network::packet::PackInfo;
use crate::network::server::{self, ConnectOptions, SessionAcceptor};
use crate::network::session::{decode_reply, InboundHandler, Session, SessionKind};
use crate::task::KeyedLock;

/// How an actor is addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActorId {
    /// Fixed runtime id; the scene is embedded in it.
    Static(RuntimeId),
    /// Logical id looked up in the addressable directory.
    Addressable(i64),
}

/// Routes packets between scenes of the cluster.
pub struct Router {
    process_id: u32,
    topology: Arc<Topology>,
    config: Arc<RuntimeConfig>,
    dispatcher: Arc<MessageDispatcher>,
    scenes: DashMap<u16, SceneHandle>,
    inner: DashMap<u32, Session>,
    accepted: DashMap<RuntimeId, Session>,
    connecting: KeyedLock<u32>,
    loopback: Session,
    ids: Arc<IdFactory>,
    me: Weak<Router>,
    runtime: tokio::runtime::Handle,
    shutdown_tx: broadcast::Sender<()>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("process_id", &self.process_id)
            .field("scenes", &self.scenes.len())
            .field("inner", &self.inner.len())
            .field("accepted", &self.accepted.len())
            .finish()
    }
}

impl Router {
    /// Create the router and its background sweep. Must be called inside a
    /// tokio runtime; inner connections are driven by that runtime.
    pub fn start(
        process_id: u32,
        topology: Arc<Topology>,
        config: Arc<RuntimeConfig>,
        dispatcher: Arc<MessageDispatcher>,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);
        let router = Arc::new_cyclic(|me: &Weak<Router>| {
            let loopback = spawn_loopback(me.clone(), config.rpc_timeout);
            Router {
                process_id,
                topology,
                config,
                dispatcher,
                scenes: DashMap::new(),
                inner: DashMap::new(),
                accepted: DashMap::new(),
                connecting: KeyedLock::new(),
                loopback,
                ids: Arc::new(IdFactory::new(0, 0)),
                me: me.clone(),
                runtime: tokio::runtime::Handle::current(),
                shutdown_tx,
            }
        });
        tokio::spawn(sweep_loop(Arc::downgrade(&router), router.shutdown_tx.subscribe()));
        router
    }

    /// This process.
    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    /// Deployment layout.
    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    /// Handler table.
    pub fn dispatcher(&self) -> &Arc<MessageDispatcher> {
        &self.dispatcher
    }

    /// Make a local scene reachable.
    pub fn register_scene(&self, handle: SceneHandle) {
        self.scenes.insert(handle.scene_id(), handle);
    }

    /// Stop routing to a local scene.
    pub fn unregister_scene(&self, scene_id: u16) -> Option<SceneHandle> {
        self.scenes.remove(&scene_id).map(|(_, handle)| handle)
    }

    /// Local scene by id.
    pub fn scene(&self, scene_id: u16) -> Option<SceneHandle> {
        self.scenes.get(&scene_id).map(|handle| handle.clone())
    }

    /// Open inner sessions, dialed and accepted.
    pub fn inner_session_count(&self) -> usize {
        self.inner.len() + self.accepted.len()
    }

    /// Acceptor for the inner listener.
    pub fn acceptor(&self) -> Arc<dyn SessionAcceptor> {
        Arc::new(RouterInbound { router: self.me.clone() })
    }

    fn new_session(&self, channel: Arc<dyn NetworkChannel>) -> Session {
        let owner = Arc::new(RouterInbound { router: self.me.clone() });
        match self.ids.next_runtime_id() {
            Ok(runtime_id) => Session::new(runtime_id, SessionKind::Inner, channel, owner, self.config.rpc_timeout),
            Err(e) => {
                error!("Process {} refused inner connection: {}", self.process_id, e);
                Session::refused(SessionKind::Inner, channel, owner)
            }
        }
    }

    // =========================================================================
    // RESOLUTION
    // =========================================================================

    /// Session that reaches `scene_id`, dialing the owning process if needed.
    /// Fails with an error code.
    pub async fn session_for(&self, scene_id: u16) -> Result<Session, u32> {
        if self.scenes.contains_key(&scene_id) {
            return Ok(self.loopback.clone());
        }

        let Some(process) = self.topology.process_of_scene(scene_id) else {
            return Err(error_code::NOT_FOUND_ROUTE);
        };
        if process.id == self.process_id {
            // Configured here but not running.
            return Err(error_code::NOT_FOUND_ROUTE);
        }

        self.inner_session(process.id, process.inner_addr).await
    }

    fn live_inner(&self, process_id: u32) -> Option<Session> {
        self.inner
            .get(&process_id)
            .map(|s| s.clone())
            .filter(|s| !s.is_disposed())
    }

    async fn inner_session(&self, process_id: u32, addr: SocketAddr) -> Result<Session, u32> {
        if let Some(session) = self.live_inner(process_id) {
            return Ok(session);
        }

        let _guard = self.connecting.lock(process_id).await;
        if let Some(session) = self.live_inner(process_id) {
            return Ok(session);
        }

        let me = self.me.clone();
        let options = ConnectOptions {
            max_body: self.config.max_body,
            kcp: self.config.kcp.clone(),
            connect_timeout: self.config.rpc_timeout,
        };
        // Dial on the process runtime so the connection outlives the caller's scene.
        let dial = self.runtime.spawn(async move {
            server::connect(addr, NetworkProtocol::Tcp, &options, |channel| match me.upgrade() {
                Some(router) => router.new_session(channel),
                None => Session::refused(SessionKind::Inner, channel, Arc::new(RouterInbound { router: me.clone() })),
            })
            .await
        });

        match dial.await {
            Ok(Ok(session)) => {
                info!("Connected to process {} at {}", process_id, addr);
                self.inner.insert(process_id, session.clone());
                Ok(session)
            }
            Ok(Err(e)) => {
                warn!("Failed to connect to process {} at {}: {}", process_id, addr, e);
                Err(error_code::RPC_FAIL)
            }
            Err(e) => {
                warn!("Dial task for process {} failed: {}", process_id, e);
                Err(error_code::RPC_FAIL)
            }
        }
    }

    // =========================================================================
    // DELIVERY
    // =========================================================================

    /// Send a prepared packet to `pack.route_id`.
    pub async fn send_pack(&self, pack: PackInfo) -> Result<(), NetworkError> {
        let route = pack.route_id;
        match self.session_for(route.scene_id()).await {
            Ok(session) => session.send_pack(pack),
            Err(_) => Err(NetworkError::NoRoute(route)),
        }
    }

    /// Send a message to `route`.
    pub async fn send<M: Message>(&self, route: RuntimeId, message: &M) -> Result<(), NetworkError> {
        let body = message.encode_body()?;
        self.send_pack(PackInfo::new(M::OP_CODE, body).with_route(route)).await
    }

    /// Call with a prepared packet; its rpc id is overwritten.
    pub async fn call_raw(&self, pack: PackInfo) -> RpcReply {
        match self.session_for(pack.route_id.scene_id()).await {
            Ok(session) => session.call_raw(pack).await,
            Err(code) => RpcReply::Error(code),
        }
    }

    /// Call `route`. Failures come back as the response's error code.
    pub async fn call<R: Request>(&self, route: RuntimeId, request: &R) -> R::Response {
        let body = match request.encode_body() {
            Ok(body) => body,
            Err(e) => {
                warn!("Failed to encode opcode {}: {}", R::OP_CODE, e);
                return R::Response::from_error(error_code::RPC_FAIL);
            }
        };
        decode_reply::<R>(self.call_raw(PackInfo::new(R::OP_CODE, body).with_route(route)).await)
    }

    /// Runtime id of an actor.
    pub async fn resolve(&self, actor: ActorId) -> Result<RuntimeId, u32> {
        match actor {
            ActorId::Static(route) => Ok(route),
            ActorId::Addressable(id) => self.addressable_get(id).await,
        }
    }

    /// Call an actor by static or addressable id.
    pub async fn call_actor<R: Request>(&self, actor: ActorId, request: &R) -> R::Response {
        match self.resolve(actor).await {
            Ok(route) => self.call(route, request).await,
            Err(code) => R::Response::from_error(code),
        }
    }

    // =========================================================================
    // ADDRESSABLE DIRECTORY CLIENT
    // =========================================================================

    /// Scene hosting the directory entry of `addressable_id`.
    pub fn directory_scene(&self, addressable_id: i64) -> Option<u16> {
        let scenes = self.topology.addressable_scenes();
        if scenes.is_empty() {
            return None;
        }
        let index = addressable_id.rem_euclid(scenes.len() as i64) as usize;
        Some(scenes[index])
    }

    async fn directory_call<R: Request>(&self, addressable_id: i64, request: &R) -> R::Response {
        match self.directory_scene(addressable_id) {
            Some(scene) => self.call(RuntimeId::scene_address(scene), request).await,
            None => R::Response::from_error(error_code::NOT_FOUND_ROUTE),
        }
    }

    fn check(code: u32) -> Result<(), u32> {
        match code {
            error_code::SUCCESS => Ok(()),
            code => Err(code),
        }
    }

    /// Register `addressable_id` at `route`. With `is_lock` the entry stays
    /// locked until [`addressable_unlock`](Self::addressable_unlock).
    pub async fn addressable_add(&self, addressable_id: i64, route: RuntimeId, is_lock: bool) -> Result<(), u32> {
        let request = AddressableAddRequest {
            addressable_id,
            route_id: route,
            is_lock,
        };
        Self::check(self.directory_call(addressable_id, &request).await.error_code())
    }

    /// Current route of `addressable_id`. Waits while it is migrating.
    pub async fn addressable_get(&self, addressable_id: i64) -> Result<RuntimeId, u32> {
        let response = self
            .directory_call(addressable_id, &AddressableGetRequest { addressable_id })
            .await;
        Self::check(response.error_code())?;
        if response.route_id.is_none() {
            return Err(error_code::NOT_FOUND_ROUTE);
        }
        Ok(response.route_id)
    }

    /// Unregister `addressable_id`.
    pub async fn addressable_remove(&self, addressable_id: i64) -> Result<(), u32> {
        let response = self
            .directory_call(addressable_id, &AddressableRemoveRequest { addressable_id })
            .await;
        Self::check(response.error_code())
    }

    /// Start migrating `addressable_id`.
    pub async fn addressable_lock(&self, addressable_id: i64) -> Result<(), u32> {
        let response = self
            .directory_call(addressable_id, &AddressableLockRequest { addressable_id })
            .await;
        Self::check(response.error_code())
    }

    /// Finish a migration: commit to `route`, or abort with `None`.
    pub async fn addressable_unlock(&self, addressable_id: i64, route: Option<RuntimeId>) -> Result<(), u32> {
        let request = AddressableUnlockRequest {
            addressable_id,
            route_id: route.unwrap_or(RuntimeId::NONE),
        };
        Self::check(self.directory_call(addressable_id, &request).await.error_code())
    }

    // =========================================================================
    // INBOUND
    // =========================================================================

    fn on_inner_packet(&self, session: &Session, pack: PackInfo) {
        let scene_id = pack.route_id.scene_id();
        if let Some(scene) = self.scene(scene_id) {
            if scene.deliver(pack, session.clone()) {
                return;
            }
            warn!("Scene {} stopped, dropping inner packet", scene_id);
            return;
        }

        if pack.rpc_id == 0 {
            warn!("No local scene {} for opcode {}", scene_id, pack.op_code);
            return;
        }
        match self
            .dispatcher
            .error_response(pack.op_code, pack.rpc_id, error_code::NOT_FOUND_ROUTE)
        {
            Some(reply) => {
                if let Err(e) = session.send_pack(reply) {
                    debug!("Failed to answer unroutable call: {}", e);
                }
            }
            None => warn!("No local scene {} and no error reply for opcode {}", scene_id, pack.op_code),
        }
    }

    fn on_inner_disposed(&self, session: &Session) {
        let runtime_id = session.runtime_id();
        self.accepted.remove(&runtime_id);
        self.inner.retain(|_, s| !s.ptr_eq(session));
    }

    fn sweep(&self, now: Instant) {
        self.loopback.sweep(now);
        for entry in self.inner.iter() {
            entry.value().sweep(now);
        }
        for entry in self.accepted.iter() {
            entry.value().sweep(now);
        }
    }

    /// Close every inner session and stop the sweep.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        let sessions: Vec<Session> = self
            .inner
            .iter()
            .map(|e| e.value().clone())
            .chain(self.accepted.iter().map(|e| e.value().clone()))
            .collect();
        for session in sessions {
            session.dispose();
        }
        self.loopback.dispose();
        self.scenes.clear();
    }
}

/// Owner of every session the router holds, and the inner listener's acceptor.
struct RouterInbound {
    router: Weak<Router>,
}

impl InboundHandler for RouterInbound {
    fn on_packet(&self, session: &Session, pack: PackInfo) {
        if let Some(router) = self.router.upgrade() {
            router.on_inner_packet(session, pack);
        }
    }

    fn on_disposed(&self, session: &Session) {
        if let Some(router) = self.router.upgrade() {
            router.on_inner_disposed(session);
        }
    }
}

impl SessionAcceptor for RouterInbound {
    fn accept(&self, channel: Arc<dyn NetworkChannel>) -> Session {
        match self.router.upgrade() {
            Some(router) => {
                let session = router.new_session(channel);
                if !session.is_disposed() {
                    router.accepted.insert(session.runtime_id(), session.clone());
                }
                session
            }
            None => Session::refused(SessionKind::Inner, channel, Arc::new(RouterInbound { router: Weak::new() })),
        }
    }
}

fn spawn_loopback(router: Weak<Router>, rpc_timeout: Duration) -> Session {
    let (channel, mut writer) = QueuedChannel::new(None);
    let session = Session::new(
        RuntimeId::NONE,
        SessionKind::Loopback,
        Arc::new(channel),
        Arc::new(RouterInbound { router }),
        rpc_timeout,
    );

    let receiver = session.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                pack = writer.rx.recv() => match pack {
                    Some(pack) => receiver.receive(pack),
                    None => break,
                },
                _ = writer.closed.notified() => break,
            }
        }
    });
    session
}

async fn sweep_loop(router: Weak<Router>, mut shutdown_rx: broadcast::Receiver<()>) {
    let every = match router.upgrade() {
        Some(router) => router.config.scene_tick.max(Duration::from_millis(10)),
        None => return,
    };
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(router) = router.upgrade() else { break };
                router.sweep(Instant::now());
            }
            _ = shutdown_rx.recv() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProcessConfig, SceneConfig, SceneType, WorldConfig};
    use crate::message::protocol::{PingRequest, PingResponse};
    use crate::message::DispatcherBuilder;

    fn topology() -> Arc<Topology> {
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let scene = |id, process, scene_type| SceneConfig {
            id,
            process,
            world: 1,
            scene_type,
            outer_addr: None,
            outer_protocol: None,
        };
        Arc::new(
            Topology::new(
                vec![
                    ProcessConfig { id: 1, inner_addr: addr },
                    ProcessConfig { id: 2, inner_addr: addr },
                ],
                vec![WorldConfig {
                    id: 1,
                    name: "main".into(),
                }],
                vec![
                    scene(10, 1, SceneType::Map),
                    scene(20, 1, SceneType::Addressable),
                    scene(21, 2, SceneType::Addressable),
                ],
            )
            .unwrap(),
        )
    }

    fn router() -> Arc<Router> {
        let mut config = RuntimeConfig::default();
        config.rpc_timeout = Duration::from_millis(500);
        let mut builder = DispatcherBuilder::new();
        builder.declare::<PingRequest>();
        Router::start(1, topology(), Arc::new(config), Arc::new(builder.build()))
    }

    #[tokio::test]
    async fn test_unknown_scene_is_not_found_route() {
        let router = router();
        let response: PingResponse = router.call(RuntimeId::scene_address(999), &PingRequest {}).await;
        assert_eq!(response.error_code, error_code::NOT_FOUND_ROUTE);

        let err = router.send(RuntimeId::scene_address(999), &PingRequest {}).await.unwrap_err();
        assert!(matches!(err, NetworkError::NoRoute(_)));
    }

    #[tokio::test]
    async fn test_configured_but_stopped_scene_is_not_found_route() {
        let router = router();
        let response: PingResponse = router.call(RuntimeId::scene_address(10), &PingRequest {}).await;
        assert_eq!(response.error_code, error_code::NOT_FOUND_ROUTE);
    }

    #[tokio::test]
    async fn test_unreachable_process_is_rpc_fail() {
        let router = router();
        let response: PingResponse = router.call(RuntimeId::scene_address(21), &PingRequest {}).await;
        assert_eq!(response.error_code, error_code::RPC_FAIL);
    }

    #[tokio::test]
    async fn test_directory_scene_selection() {
        let router = router();
        assert_eq!(router.directory_scene(0), Some(20));
        assert_eq!(router.directory_scene(1), Some(21));
        assert_eq!(router.directory_scene(-1), Some(21));

        let empty = Router::start(
            1,
            Arc::new(Topology::default()),
            Arc::new(RuntimeConfig::default()),
            Arc::new(DispatcherBuilder::new().build()),
        );
        assert_eq!(empty.directory_scene(7), None);
        assert_eq!(empty.addressable_get(7).await, Err(error_code::NOT_FOUND_ROUTE));
    }

    #[tokio::test]
    async fn test_static_actor_resolves_without_directory() {
        let router = router();
        let route = RuntimeId::from_parts(1, 10, 1).unwrap();
        assert_eq!(router.resolve(ActorId::Static(route)).await, Ok(route));
    }
}

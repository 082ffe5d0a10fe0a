//! Scenes
//!
//! A scene owns a set of entities and is the only code that touches them.
//! Each scene runs on its own OS thread with a single-threaded tokio
//! runtime; everything that wants to affect the scene sends it a
//! [`SceneCommand`] through its [`SceneHandle`].
//!
//! ```text
//!   transports ──► Session ──► SceneHandle ──mpsc──► scene thread
//!                                                     │
//!                       ┌─────────────────────────────┤
//!                       ▼                             ▼
//!                 spawn_local(handler)          tick: timers, updates,
//!                  (one task per packet)         rpc sweeps, idle sessions
//! ```
//!
//! Handlers of one scene never run in parallel. They interleave only where
//! one of them awaits.

use std::cell::{Ref, RefCell, RefMut};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::LocalSet;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::registry::LifecycleRegistry;
use super::tree::EntityTree;
use crate::config::{NetworkProtocol, RuntimeConfig, SceneType};
use crate::core::id::{IdFactory, RuntimeId};
use crate::core::timer::TimerWheel;
use crate::message::{
    error_code, DispatchError, HandlerContext, Message, MessageDispatcher, OpCode, OpCodeKind, Request, RpcReply,
};
use crate::network::channel::{NetworkChannel, NetworkError};
use crate::network::packet::PackInfo;
use crate::network::server::{self, ConnectOptions, SessionAcceptor};
use crate::network::session::{InboundHandler, Session, SessionKind};
use crate::routing::{self, ActorId, AddressableDirectory, Router, SessionRoaming};
use crate::storage::Storage;
use crate::task::{CancellationToken, TaskCompleter, TaskError, TaskPool};

/// Scene errors.
#[derive(Debug, thiserror::Error)]
pub enum SceneError {
    /// The scene thread has stopped.
    #[error("Scene {0} is not running")]
    Closed(u16),

    /// The scene thread or its runtime could not be started.
    #[error("Failed to start scene {scene}: {source}")]
    Start {
        /// Scene id.
        scene: u16,
        /// Cause.
        source: std::io::Error,
    },
}

/// Work sent to a scene.
pub enum SceneCommand {
    /// A request or message that arrived on `session`.
    Deliver {
        /// The packet.
        pack: PackInfo,
        /// Where replies go.
        session: Session,
    },
    /// Take ownership of a new client session.
    AddSession(Session),
    /// Forget a disposed session.
    RemoveSession(RuntimeId),
    /// Run a closure on the scene thread.
    Invoke(Box<dyn FnOnce(&SceneContext) + Send>),
    /// Stop the scene.
    Shutdown,
}

/// Static description of a scene.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SceneInfo {
    /// Scene id.
    pub scene_id: u16,
    /// World id.
    pub world_id: u8,
    /// Role.
    pub scene_type: SceneType,
}

impl SceneInfo {
    /// Routable address of the scene itself.
    pub fn address(&self) -> RuntimeId {
        RuntimeId::scene_address(self.scene_id)
    }
}

// =============================================================================
// HANDLE
// =============================================================================

struct HandleInner {
    info: SceneInfo,
    tx: mpsc::UnboundedSender<SceneCommand>,
    ids: Arc<IdFactory>,
    rpc_timeout: Duration,
}

/// Thread-safe handle to a scene.
#[derive(Clone)]
pub struct SceneHandle {
    inner: Arc<HandleInner>,
}

impl std::fmt::Debug for SceneHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SceneHandle").field("info", &self.inner.info).finish()
    }
}

impl SceneHandle {
    /// Scene id.
    pub fn scene_id(&self) -> u16 {
        self.inner.info.scene_id
    }

    /// Scene description.
    pub fn info(&self) -> SceneInfo {
        self.inner.info
    }

    /// Routable address of the scene.
    pub fn address(&self) -> RuntimeId {
        self.inner.info.address()
    }

    /// Id factory of the scene.
    pub fn ids(&self) -> &Arc<IdFactory> {
        &self.inner.ids
    }

    fn command(&self, command: SceneCommand) -> bool {
        self.inner.tx.send(command).is_ok()
    }

    /// Queue a packet for dispatch.
    pub fn deliver(&self, pack: PackInfo, session: Session) -> bool {
        self.command(SceneCommand::Deliver { pack, session })
    }

    /// Hand a session to the scene.
    pub fn add_session(&self, session: Session) -> bool {
        self.command(SceneCommand::AddSession(session))
    }

    /// Run `f` on the scene thread without waiting for it.
    pub fn invoke<F>(&self, f: F) -> bool
    where
        F: FnOnce(&SceneContext) + Send + 'static,
    {
        self.command(SceneCommand::Invoke(Box::new(f)))
    }

    /// Run `f` on the scene thread and wait for its result.
    pub async fn run<F, R>(&self, f: F) -> Result<R, SceneError>
    where
        F: FnOnce(&SceneContext) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let sent = self.invoke(move |ctx| {
            let _ = tx.send(f(ctx));
        });
        if !sent {
            return Err(SceneError::Closed(self.scene_id()));
        }
        rx.await.map_err(|_| SceneError::Closed(self.scene_id()))
    }

    /// Ask the scene to stop.
    pub fn shutdown(&self) {
        self.command(SceneCommand::Shutdown);
    }

    /// True once the scene thread has exited.
    pub fn is_closed(&self) -> bool {
        self.inner.tx.is_closed()
    }

    fn new_session(&self, channel: Arc<dyn NetworkChannel>) -> Session {
        let runtime_id = match self.inner.ids.next_runtime_id() {
            Ok(runtime_id) => runtime_id,
            Err(e) => {
                error!("Scene {} refused connection: {}", self.scene_id(), e);
                return Session::refused(SessionKind::Outer, channel, Arc::new(self.clone()));
            }
        };
        let session = Session::new(runtime_id, SessionKind::Outer, channel, Arc::new(self.clone()), self.inner.rpc_timeout);
        self.add_session(session.clone());
        session
    }

    /// Open a client connection owned by this scene.
    pub async fn connect(
        &self,
        addr: SocketAddr,
        protocol: NetworkProtocol,
        options: &ConnectOptions,
    ) -> Result<Session, NetworkError> {
        server::connect(addr, protocol, options, |channel| self.new_session(channel)).await
    }
}

impl InboundHandler for SceneHandle {
    fn on_packet(&self, session: &Session, pack: PackInfo) {
        if !self.deliver(pack, session.clone()) {
            debug!("Scene {} stopped, dropping packet", self.scene_id());
        }
    }

    fn on_disposed(&self, session: &Session) {
        self.command(SceneCommand::RemoveSession(session.runtime_id()));
    }
}

impl SessionAcceptor for SceneHandle {
    fn accept(&self, channel: Arc<dyn NetworkChannel>) -> Session {
        self.new_session(channel)
    }
}

// =============================================================================
// CONTEXT
// =============================================================================

/// Process-wide services a scene uses.
#[derive(Clone)]
pub struct SceneServices {
    /// Process router.
    pub router: Arc<Router>,
    /// Handler table.
    pub dispatcher: Arc<MessageDispatcher>,
    /// Tunables.
    pub config: Arc<RuntimeConfig>,
    /// Persistence backend.
    pub storage: Arc<dyn Storage>,
    /// Entity lifecycle hooks.
    pub lifecycle: Arc<LifecycleRegistry>,
}

/// Scene state, reachable only from the scene thread.
pub struct SceneState {
    info: SceneInfo,
    handle: SceneHandle,
    ids: Arc<IdFactory>,
    services: SceneServices,
    directory: Option<Arc<AddressableDirectory>>,
    tree: RefCell<EntityTree>,
    sessions: RefCell<HashMap<RuntimeId, Session>>,
    timers: RefCell<TimerWheel<TaskCompleter<()>>>,
    timer_tasks: TaskPool<()>,
}

/// Shared reference to the running scene. Not `Send`.
#[derive(Clone)]
pub struct SceneContext {
    inner: Rc<SceneState>,
}

impl SceneContext {
    /// Scene id.
    pub fn scene_id(&self) -> u16 {
        self.inner.info.scene_id
    }

    /// Scene description.
    pub fn info(&self) -> SceneInfo {
        self.inner.info
    }

    /// Routable address of the scene.
    pub fn address(&self) -> RuntimeId {
        self.inner.info.address()
    }

    /// Handle for other threads.
    pub fn handle(&self) -> &SceneHandle {
        &self.inner.handle
    }

    /// Id factory.
    pub fn ids(&self) -> &Arc<IdFactory> {
        &self.inner.ids
    }

    /// Entity tree. Do not hold the borrow across an await.
    pub fn tree(&self) -> Ref<'_, EntityTree> {
        self.inner.tree.borrow()
    }

    /// Mutable entity tree. Do not hold the borrow across an await.
    pub fn tree_mut(&self) -> RefMut<'_, EntityTree> {
        self.inner.tree.borrow_mut()
    }

    /// Process router.
    pub fn router(&self) -> &Arc<Router> {
        &self.inner.services.router
    }

    /// Handler table.
    pub fn dispatcher(&self) -> &Arc<MessageDispatcher> {
        &self.inner.services.dispatcher
    }

    /// Tunables.
    pub fn config(&self) -> &Arc<RuntimeConfig> {
        &self.inner.services.config
    }

    /// Persistence backend.
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.inner.services.storage
    }

    /// Directory shard hosted here, for addressable scenes.
    pub fn directory(&self) -> Option<&Arc<AddressableDirectory>> {
        self.inner.directory.as_ref()
    }

    /// Client session owned by this scene.
    pub fn session(&self, runtime_id: RuntimeId) -> Option<Session> {
        self.inner.sessions.borrow().get(&runtime_id).cloned()
    }

    /// Number of client sessions.
    pub fn session_count(&self) -> usize {
        self.inner.sessions.borrow().len()
    }

    /// Run a task on this scene.
    pub fn spawn<F>(&self, future: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        tokio::task::spawn_local(future)
    }

    /// Suspend for `duration`. Fails with `Canceled` if the scene stops first.
    pub async fn delay(&self, duration: Duration) -> Result<(), TaskError> {
        self.delay_until(Instant::now() + duration, None).await
    }

    /// Suspend for `duration` unless `token` fires first.
    pub async fn delay_with(&self, duration: Duration, token: &CancellationToken) -> Result<(), TaskError> {
        self.delay_until(Instant::now() + duration, Some(token)).await
    }

    async fn delay_until(&self, deadline: Instant, token: Option<&CancellationToken>) -> Result<(), TaskError> {
        let task = self.inner.timer_tasks.create();
        if let Some(token) = token {
            task.attach(token);
        }
        self.inner.timers.borrow_mut().schedule(deadline, task.completer());
        task.await
    }

    /// Call `route` anywhere in the cluster.
    pub async fn call<R: Request>(&self, route: RuntimeId, request: &R) -> R::Response {
        self.router().call(route, request).await
    }

    /// Call an actor by static or addressable id.
    pub async fn call_actor<R: Request>(&self, actor: ActorId, request: &R) -> R::Response {
        self.router().call_actor(actor, request).await
    }

    /// Send to `route` anywhere in the cluster.
    pub async fn send<M: Message>(&self, route: RuntimeId, message: &M) -> Result<(), NetworkError> {
        self.router().send(route, message).await
    }

    /// Answer a request that cannot be handled with an error code.
    pub fn reject(&self, session: &Session, op_code: u32, rpc_id: u32, code: u32) {
        if rpc_id == 0 {
            return;
        }
        match self.dispatcher().error_response(op_code, rpc_id, code) {
            Some(reply) => {
                if let Err(e) = session.send_pack(reply) {
                    debug!("Failed to send error reply: {}", e);
                }
            }
            None => warn!(
                "No response type known for opcode {}, cannot report {}",
                op_code,
                error_code::name(code)
            ),
        }
    }

    // =========================================================================
    // COMMANDS
    // =========================================================================

    fn handle_command(&self, command: SceneCommand) {
        match command {
            SceneCommand::Deliver { pack, session } => self.on_deliver(pack, session),
            SceneCommand::AddSession(session) => self.on_add_session(session),
            SceneCommand::RemoveSession(runtime_id) => self.on_remove_session(runtime_id),
            SceneCommand::Invoke(f) => f(self),
            SceneCommand::Shutdown => {}
        }
    }

    fn on_add_session(&self, session: Session) {
        let runtime_id = session.runtime_id();
        if session.is_disposed() {
            return;
        }
        if let Err(e) = self.tree_mut().create_entity_at(runtime_id, session.clone()) {
            warn!("Scene {} cannot track session {}: {}", self.scene_id(), runtime_id, e);
            return;
        }
        debug!("Scene {} accepted session {} from {:?}", self.scene_id(), runtime_id, session.remote_addr());
        self.inner.sessions.borrow_mut().insert(runtime_id, session);
    }

    fn on_remove_session(&self, runtime_id: RuntimeId) {
        if self.inner.sessions.borrow_mut().remove(&runtime_id).is_some() {
            let roaming = self.tree().get_component::<SessionRoaming>(runtime_id).cloned();
            if let Some(roaming) = roaming {
                let ctx = self.clone();
                self.spawn(async move { roaming.unlink_all(&ctx).await });
            }
            let _ = self.tree_mut().dispose(runtime_id);
            debug!("Scene {} released session {}", self.scene_id(), runtime_id);
        }
    }

    fn on_deliver(&self, pack: PackInfo, session: Session) {
        if session.kind() == SessionKind::Outer {
            match OpCode(pack.op_code).kind() {
                OpCodeKind::OuterAddressableMessage | OpCodeKind::OuterAddressableRequest => {
                    self.spawn(routing::forward_addressable(self.clone(), session, pack));
                }
                OpCodeKind::OuterRoamingMessage | OpCodeKind::OuterRoamingRequest => {
                    self.spawn(routing::forward_roaming(self.clone(), session, pack));
                }
                // Clients only ever address the scene itself.
                _ => {
                    self.spawn(self.clone().dispatch(session, self.address(), pack));
                }
            }
            return;
        }

        let route = pack.route_id;
        if route.is_none() || route == self.address() {
            self.spawn(self.clone().dispatch(session, self.address(), pack));
            return;
        }

        if let Some(client) = self.session(route) {
            self.spawn(relay_to_client(self.clone(), client, session, pack));
            return;
        }

        if self.tree().contains(route) {
            self.spawn(self.clone().dispatch(session, route, pack));
            return;
        }

        if pack.rpc_id != 0 {
            self.reject(&session, pack.op_code, pack.rpc_id, error_code::ENTITY_NOT_FOUND);
        } else {
            warn!("Scene {} dropping opcode {} for missing entity {}", self.scene_id(), pack.op_code, route);
        }
    }

    async fn dispatch(self, session: Session, target: RuntimeId, pack: PackInfo) {
        let op_code = pack.op_code;
        let rpc_id = pack.rpc_id;
        let ctx = HandlerContext {
            scene: self.clone(),
            session: session.clone(),
            target,
            route_type_code: pack.route_type_code,
        };

        match self.dispatcher().dispatch(ctx, pack).await {
            Ok(Some(reply)) => {
                if let Err(e) = session.send_pack(reply) {
                    debug!("Reply to opcode {} not sent: {}", op_code, e);
                }
            }
            Ok(None) => {}
            Err(DispatchError::HandlerNotFound(_)) => {
                warn!("Scene {} has no handler for opcode {}", self.scene_id(), op_code);
                self.reject(&session, op_code, rpc_id, error_code::HANDLER_NOT_FOUND);
            }
            Err(e @ DispatchError::Decode { .. }) => {
                if session.kind() == SessionKind::Outer {
                    warn!("Protocol error from {:?}: {}", session.remote_addr(), e);
                    session.dispose();
                } else {
                    warn!("Scene {}: {}", self.scene_id(), e);
                    self.reject(&session, op_code, rpc_id, error_code::RPC_FAIL);
                }
            }
            Err(e) => {
                error!("Scene {} handler for opcode {} failed: {}", self.scene_id(), op_code, e);
                self.reject(&session, op_code, rpc_id, error_code::RPC_FAIL);
            }
        }
    }

    // =========================================================================
    // TICK
    // =========================================================================

    fn tick(&self) {
        let now = Instant::now();

        let due = self.inner.timers.borrow_mut().pop_due(now);
        for completer in due {
            let _ = completer.set_result(());
        }

        self.tree_mut().update();

        let idle_timeout = self.config().session_idle_timeout;
        let mut idle = Vec::new();
        for session in self.inner.sessions.borrow().values() {
            session.sweep(now);
            if !idle_timeout.is_zero() && session.is_idle(now, idle_timeout) {
                idle.push(session.clone());
            }
        }
        for session in idle {
            info!("Session {} idle for {:?}, disposing", session.runtime_id(), idle_timeout);
            session.dispose();
        }

        if let Some(directory) = self.directory() {
            directory.sweep_stale(now);
        }
    }

    fn stop(&self) {
        let sessions: Vec<Session> = self.inner.sessions.borrow_mut().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.dispose();
        }
        let pending = self.inner.timers.borrow_mut().pop_due(Instant::now() + Duration::from_secs(u32::MAX as u64));
        for completer in pending {
            let _ = completer.cancel();
        }
        let disposed = self.tree_mut().clear();
        debug!("Scene {} stopped, disposed {} entities", self.scene_id(), disposed);
    }
}

async fn relay_to_client(scene: SceneContext, client: Session, from: Session, pack: PackInfo) {
    let op_code = pack.op_code;
    let rpc_id = pack.rpc_id;
    let pack = pack.with_route(RuntimeId::NONE);

    if rpc_id == 0 {
        if let Err(e) = client.send_pack(pack) {
            debug!("Forward to session {} failed: {}", client.runtime_id(), e);
        }
        return;
    }

    match client.call_raw(pack).await {
        RpcReply::Pack(reply) => {
            if let Err(e) = from.send_pack(reply.with_rpc_id(rpc_id)) {
                debug!("Relay reply failed: {}", e);
            }
        }
        RpcReply::Error(code) => scene.reject(&from, op_code, rpc_id, code),
    }
}

// =============================================================================
// SCENE THREAD
// =============================================================================

/// Everything needed to start a scene.
pub struct SceneSetup {
    /// Scene description.
    pub info: SceneInfo,
    /// Shared services.
    pub services: SceneServices,
}

/// Scene launcher.
pub struct Scene;

impl Scene {
    /// Start the scene thread.
    pub fn spawn(setup: SceneSetup) -> Result<(SceneHandle, JoinHandle<()>), SceneError> {
        let SceneSetup { info, services } = setup;
        let ids = Arc::new(IdFactory::new(info.scene_id, info.world_id));
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = SceneHandle {
            inner: Arc::new(HandleInner {
                info,
                tx,
                ids: ids.clone(),
                rpc_timeout: services.config.rpc_timeout,
            }),
        };

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|source| SceneError::Start {
                scene: info.scene_id,
                source,
            })?;

        let thread_handle = handle.clone();
        let join = std::thread::Builder::new()
            .name(format!("scene-{}", info.scene_id))
            .spawn(move || {
                let local = LocalSet::new();
                local.block_on(&runtime, run(info, thread_handle, ids, services, rx));
            })
            .map_err(|source| SceneError::Start {
                scene: info.scene_id,
                source,
            })?;

        Ok((handle, join))
    }
}

async fn run(
    info: SceneInfo,
    handle: SceneHandle,
    ids: Arc<IdFactory>,
    services: SceneServices,
    mut rx: mpsc::UnboundedReceiver<SceneCommand>,
) {
    let directory = (info.scene_type == SceneType::Addressable)
        .then(|| Arc::new(AddressableDirectory::new(services.config.rpc_timeout)));
    let tree = EntityTree::new(ids.clone(), services.lifecycle.clone());
    let tick_every = services.config.scene_tick;

    let ctx = SceneContext {
        inner: Rc::new(SceneState {
            info,
            handle,
            ids,
            services,
            directory,
            tree: RefCell::new(tree),
            sessions: RefCell::new(HashMap::new()),
            timers: RefCell::new(TimerWheel::new()),
            timer_tasks: TaskPool::new(),
        }),
    };

    info!("Scene {} ({:?}) running", info.scene_id, info.scene_type);
    let mut ticker = interval(tick_every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            command = rx.recv() => {
                match command {
                    Some(SceneCommand::Shutdown) | None => break,
                    Some(command) => ctx.handle_command(command),
                }
            }
            _ = ticker.tick() => ctx.tick(),
        }
    }

    ctx.stop();
    info!("Scene {} stopped", info.scene_id);
}

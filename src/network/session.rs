//! Sessions
//!
//! A [`Session`] is one live connection: a channel, the calls outstanding on
//! it, and the owner that handles what arrives. Client connections belong to
//! the scene that accepted them; server-to-server connections belong to the
//! process router.
//!
//! Responses are matched to their call right on the I/O task, so a scene
//! waiting on a reply never needs its inbox to make progress.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use super::channel::{NetworkChannel, NetworkError};
use super::packet::PackInfo;
use crate::core::id::RuntimeId;
use crate::message::opcode::builtin;
use crate::message::protocol::{PingRequest, PingResponse};
use crate::message::{error_code, Message, OpCode, Request, Response, RpcReply, RpcTable};

/// Receives what a session does not handle itself.
pub trait InboundHandler: Send + Sync {
    /// A request or message arrived.
    fn on_packet(&self, session: &Session, pack: PackInfo);

    /// The session was disposed.
    fn on_disposed(&self, session: &Session);
}

/// Which side of the cluster a session faces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// A game client.
    Outer,
    /// Another process of the cluster.
    Inner,
    /// The local process talking to itself.
    Loopback,
}

struct SessionInner {
    runtime_id: RuntimeId,
    kind: SessionKind,
    channel: Arc<dyn NetworkChannel>,
    rpc: RpcTable,
    owner: Arc<dyn InboundHandler>,
    rpc_timeout: Duration,
    created: Instant,
    last_recv_ms: AtomicU64,
    disposed: AtomicBool,
}

/// Handle to one connection. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("runtime_id", &self.inner.runtime_id)
            .field("kind", &self.inner.kind)
            .field("remote_addr", &self.remote_addr())
            .field("pending", &self.inner.rpc.len())
            .finish()
    }
}

impl Session {
    /// Wrap a channel.
    pub fn new(
        runtime_id: RuntimeId,
        kind: SessionKind,
        channel: Arc<dyn NetworkChannel>,
        owner: Arc<dyn InboundHandler>,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                runtime_id,
                kind,
                channel,
                rpc: RpcTable::new(),
                owner,
                rpc_timeout,
                created: Instant::now(),
                last_recv_ms: AtomicU64::new(0),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// Session for a channel that will not be served. The channel is closed
    /// and the session starts disposed, addressed by [`RuntimeId::NONE`].
    pub fn refused(kind: SessionKind, channel: Arc<dyn NetworkChannel>, owner: Arc<dyn InboundHandler>) -> Self {
        channel.close();
        let session = Self::new(RuntimeId::NONE, kind, channel, owner, Duration::ZERO);
        session.inner.disposed.store(true, Ordering::Release);
        session
    }

    /// Address of this session.
    pub fn runtime_id(&self) -> RuntimeId {
        self.inner.runtime_id
    }

    /// Connection side.
    pub fn kind(&self) -> SessionKind {
        self.inner.kind
    }

    /// Peer address.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.channel.remote_addr()
    }

    /// Outstanding calls.
    pub fn rpc(&self) -> &RpcTable {
        &self.inner.rpc
    }

    /// Deadline applied to calls on this session.
    pub fn rpc_timeout(&self) -> Duration {
        self.inner.rpc_timeout
    }

    /// True once disposed.
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// True if both handles refer to the same connection.
    pub fn ptr_eq(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // =========================================================================
    // INBOUND
    // =========================================================================

    fn touch(&self) {
        let elapsed = self.inner.created.elapsed().as_millis() as u64;
        self.inner.last_recv_ms.store(elapsed, Ordering::Relaxed);
    }

    /// Entry point for every packet the transport decodes.
    pub fn receive(&self, pack: PackInfo) {
        if self.is_disposed() {
            return;
        }
        self.touch();

        let op = OpCode(pack.op_code);
        if op.is_response() {
            self.inner.rpc.resolve(pack);
            return;
        }

        if pack.op_code == builtin::PING_REQUEST {
            let reply = PingResponse {
                error_code: error_code::SUCCESS,
                now_ms: chrono::Utc::now().timestamp_millis(),
            };
            if let Err(e) = self.reply(pack.rpc_id, &reply) {
                debug!("Ping reply on {} failed: {}", self.inner.runtime_id, e);
            }
            return;
        }

        self.inner.owner.on_packet(self, pack);
    }

    // =========================================================================
    // OUTBOUND
    // =========================================================================

    /// Send a raw packet.
    pub fn send_pack(&self, pack: PackInfo) -> Result<(), NetworkError> {
        if self.is_disposed() {
            return Err(NetworkError::Closed);
        }
        self.inner.channel.send(pack)
    }

    /// Send a message to the peer.
    pub fn send<M: Message>(&self, message: &M) -> Result<(), NetworkError> {
        self.send_to(RuntimeId::NONE, message)
    }

    /// Send a message addressed to `route_id` on the peer.
    pub fn send_to<M: Message>(&self, route_id: RuntimeId, message: &M) -> Result<(), NetworkError> {
        let body = message.encode_body()?;
        self.send_pack(PackInfo::new(M::OP_CODE, body).with_route(route_id))
    }

    /// Answer the call `rpc_id`.
    pub fn reply<M: Message>(&self, rpc_id: u32, response: &M) -> Result<(), NetworkError> {
        let body = response.encode_body()?;
        self.send_pack(PackInfo::new(M::OP_CODE, body).with_rpc_id(rpc_id))
    }

    /// Call the peer. Failures come back as the response's error code.
    pub async fn call<R: Request>(&self, request: &R) -> R::Response {
        self.call_to(RuntimeId::NONE, request).await
    }

    /// Call `route_id` on the peer.
    pub async fn call_to<R: Request>(&self, route_id: RuntimeId, request: &R) -> R::Response {
        let body = match request.encode_body() {
            Ok(body) => body,
            Err(e) => {
                error!("Failed to encode opcode {}: {}", R::OP_CODE, e);
                return R::Response::from_error(error_code::RPC_FAIL);
            }
        };
        let pack = PackInfo::new(R::OP_CODE, body).with_route(route_id);
        decode_reply::<R>(self.call_raw(pack).await)
    }

    /// Call with a prepared packet; its rpc id is overwritten.
    pub async fn call_raw(&self, pack: PackInfo) -> RpcReply {
        if self.is_disposed() {
            return RpcReply::Error(error_code::RPC_FAIL);
        }

        let deadline = Instant::now() + self.inner.rpc_timeout;
        let (rpc_id, task) = self.inner.rpc.register(pack.op_code, deadline);
        if let Err(e) = self.inner.channel.send(pack.with_rpc_id(rpc_id)) {
            debug!("Call on {} failed to send: {}", self.inner.runtime_id, e);
            self.inner.rpc.fail(rpc_id, error_code::RPC_FAIL);
        }

        match task.await {
            Ok(reply) => reply,
            Err(_) => RpcReply::Error(error_code::RPC_FAIL),
        }
    }

    /// Round-trip time to the peer.
    pub async fn ping(&self) -> Result<Duration, u32> {
        let started = Instant::now();
        let response = self.call(&PingRequest {}).await;
        match response.error_code() {
            error_code::SUCCESS => Ok(started.elapsed()),
            code => Err(code),
        }
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Time out overdue calls.
    pub fn sweep(&self, now: Instant) -> usize {
        self.inner.rpc.sweep(now)
    }

    /// True if nothing arrived for `timeout`.
    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        let last = self.inner.created + Duration::from_millis(self.inner.last_recv_ms.load(Ordering::Relaxed));
        now.saturating_duration_since(last) >= timeout
    }

    /// Fail pending calls, close the channel and tell the owner. Idempotent.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let failed = self.inner.rpc.fail_all(error_code::RPC_FAIL);
        if failed > 0 {
            warn!("Session {} disposed with {} pending calls", self.inner.runtime_id, failed);
        }
        self.inner.channel.close();
        self.inner.owner.on_disposed(self);
        debug!("Session {} disposed", self.inner.runtime_id);
    }
}

/// Turn a call outcome into the typed response.
pub fn decode_reply<R: Request>(reply: RpcReply) -> R::Response {
    match reply {
        RpcReply::Pack(pack) => match R::Response::decode_body(&pack.body) {
            Ok(response) => response,
            Err(e) => {
                warn!("Failed to decode reply to opcode {}: {}", R::OP_CODE, e);
                R::Response::from_error(error_code::RPC_FAIL)
            }
        },
        RpcReply::Error(code) => R::Response::from_error(code),
    }
}

//! End-to-end tests: real listeners, real scene threads.

use serde::{Deserialize, Serialize};
use std::net::{SocketAddr, TcpListener};
use std::time::Duration;
use tokio::sync::mpsc;

use super::*;
use crate::config::{ProcessConfig, SceneConfig, WorldConfig};
use crate::core::id::RuntimeId;
use crate::message::{error_code, CodecKind, HandlerContext, Message, Request, Response, RpcReply};
use crate::network::packet::PackInfo;
use crate::network::server::ConnectOptions;
use crate::network::session::{decode_reply, Session};
use crate::routing::{AddressableRoute, SessionRoaming, Terminus};

// =============================================================================
// TEST PROTOCOL
// =============================================================================

macro_rules! message {
    ($ty:ident, $op:expr) => {
        impl Message for $ty {
            const OP_CODE: u32 = $op;
        }
    };
    ($ty:ident, $op:expr, json) => {
        impl Message for $ty {
            const OP_CODE: u32 = $op;
            const CODEC: CodecKind = CodecKind::Json;
        }
    };
}

macro_rules! response {
    ($ty:ident) => {
        impl Response for $ty {
            fn error_code(&self) -> u32 {
                self.error_code
            }

            fn set_error_code(&mut self, code: u32) {
                self.error_code = code;
            }
        }
    };
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LoginRequest {
    user_name: String,
    password: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LoginResponse {
    error_code: u32,
    text: String,
}

message!(LoginRequest, 100_000_001, json);
message!(LoginResponse, 120_000_001, json);
response!(LoginResponse);
impl Request for LoginRequest {
    type Response = LoginResponse;
}

/// Attach an addressable route to the calling session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct BindActorRequest {
    addressable_id: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct BindActorResponse {
    error_code: u32,
}

message!(BindActorRequest, 100_000_002);
message!(BindActorResponse, 120_000_002);
response!(BindActorResponse);
impl Request for BindActorRequest {
    type Response = BindActorResponse;
}

/// Link the calling session to a terminus.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RoamRequest {
    scene_id: u16,
    roaming_type: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RoamResponse {
    error_code: u32,
}

message!(RoamRequest, 100_000_003);
message!(RoamResponse, 120_000_003);
response!(RoamResponse);
impl Request for RoamRequest {
    type Response = RoamResponse;
}

/// Pushed to the client by a terminus.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct Notice {
    text: String,
}

message!(Notice, 110_000_001);

/// Sent to the session's addressable actor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct WhereRequest {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct WhereResponse {
    error_code: u32,
    scene_id: u16,
    entity: RuntimeId,
}

message!(WhereRequest, 140_000_001);
message!(WhereResponse, 150_000_001);
response!(WhereResponse);
impl Request for WhereRequest {
    type Response = WhereResponse;
}

/// Sent to the session's terminus.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TerminusRequest {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TerminusResponse {
    error_code: u32,
    scene_id: u16,
    terminus: RuntimeId,
}

message!(TerminusRequest, 170_000_001);
message!(TerminusResponse, 180_000_001);
response!(TerminusResponse);
impl Request for TerminusRequest {
    type Response = TerminusResponse;
}

/// Server-side request that answers after `delay_ms`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SlowRequest {
    delay_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SlowResponse {
    error_code: u32,
    scene_id: u16,
}

message!(SlowRequest, 200_000_101);
message!(SlowResponse, 220_000_101);
response!(SlowResponse);
impl Request for SlowRequest {
    type Response = SlowResponse;
}

/// Known to the dispatcher but handled nowhere.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct UnhandledRequest {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct UnhandledResponse {
    error_code: u32,
}

message!(UnhandledRequest, 100_000_009);
message!(UnhandledResponse, 120_000_009);
response!(UnhandledResponse);
impl Request for UnhandledRequest {
    type Response = UnhandledResponse;
}

#[derive(Debug)]
struct Actor {
    addressable_id: i64,
}

fn register_game(builder: &mut DispatcherBuilder) -> Result<(), DispatchError> {
    builder.request(|_ctx: HandlerContext, request: LoginRequest| async move {
        LoginResponse {
            error_code: error_code::SUCCESS,
            text: format!("received {}", request.user_name),
        }
    })?;

    builder.request(|ctx: HandlerContext, request: BindActorRequest| async move {
        let session = ctx.session.runtime_id();
        let route = AddressableRoute::new(request.addressable_id);
        match ctx.scene.tree_mut().add_component(session, route) {
            Ok(_) => BindActorResponse::default(),
            Err(_) => BindActorResponse::from_error(error_code::RPC_FAIL),
        }
    })?;

    builder.request(|ctx: HandlerContext, request: RoamRequest| async move {
        let session = ctx.session.runtime_id();
        let existing = ctx.scene.tree().get_component::<SessionRoaming>(session).cloned();
        let roaming = match existing {
            Some(roaming) => roaming,
            None => {
                let roaming = SessionRoaming::new(session);
                if ctx.scene.tree_mut().add_component(session, roaming.clone()).is_err() {
                    return RoamResponse::from_error(error_code::RPC_FAIL);
                }
                roaming
            }
        };
        match roaming.link(&ctx.scene, request.scene_id, request.roaming_type).await {
            Ok(_) => RoamResponse::default(),
            Err(code) => RoamResponse::from_error(code),
        }
    })?;

    builder.request(|ctx: HandlerContext, _request: WhereRequest| async move {
        let is_actor = ctx.scene.tree().get::<Actor>(ctx.target).is_some();
        if !is_actor {
            return WhereResponse::from_error(error_code::ENTITY_NOT_FOUND);
        }
        WhereResponse {
            error_code: error_code::SUCCESS,
            scene_id: ctx.scene.scene_id(),
            entity: ctx.target,
        }
    })?;

    builder.request(|ctx: HandlerContext, _request: TerminusRequest| async move {
        let terminus = ctx.scene.tree().get::<Terminus>(ctx.target).cloned();
        let Some(terminus) = terminus else {
            return TerminusResponse::from_error(error_code::ENTITY_NOT_FOUND);
        };
        let notice = Notice {
            text: format!("hello from {}", ctx.scene.scene_id()),
        };
        if terminus.send_to_client(ctx.scene.router(), &notice).await.is_err() {
            return TerminusResponse::from_error(error_code::RPC_FAIL);
        }
        TerminusResponse {
            error_code: error_code::SUCCESS,
            scene_id: ctx.scene.scene_id(),
            terminus: ctx.target,
        }
    })?;

    builder.request(|ctx: HandlerContext, request: SlowRequest| async move {
        if ctx.scene.delay(Duration::from_millis(request.delay_ms)).await.is_err() {
            return SlowResponse::from_error(error_code::RPC_FAIL);
        }
        SlowResponse {
            error_code: error_code::SUCCESS,
            scene_id: ctx.scene.scene_id(),
        }
    })?;

    builder.declare::<UnhandledRequest>();
    Ok(())
}

// =============================================================================
// FIXTURES
// =============================================================================

const GATE: u16 = 1001;
const MAP: u16 = 1002;
const DIRECTORY: u16 = 1003;
const MAP_B: u16 = 1004;

fn free_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

fn scene(id: u16, process: u32, scene_type: SceneType, outer: Option<NetworkProtocol>) -> SceneConfig {
    SceneConfig {
        id,
        process,
        world: 1,
        scene_type,
        outer_addr: outer.map(|_| "127.0.0.1:0".parse().unwrap()),
        outer_protocol: outer,
    }
}

/// Gate, two maps and a directory; `map_process` picks who hosts the maps.
fn topology(protocol: NetworkProtocol, map_process: u32, inner: [SocketAddr; 2]) -> Topology {
    Topology::new(
        vec![
            ProcessConfig {
                id: 1,
                inner_addr: inner[0],
            },
            ProcessConfig {
                id: 2,
                inner_addr: inner[1],
            },
        ],
        vec![WorldConfig {
            id: 1,
            name: "test".into(),
        }],
        vec![
            scene(GATE, 1, SceneType::Gate, Some(protocol)),
            scene(MAP, map_process, SceneType::Map, None),
            scene(DIRECTORY, 1, SceneType::Addressable, None),
            scene(MAP_B, map_process, SceneType::Map, None),
        ],
    )
    .unwrap()
}

fn config() -> RuntimeConfig {
    RuntimeConfig {
        rpc_timeout: Duration::from_millis(800),
        ..RuntimeConfig::default()
    }
}

async fn start_single(protocol: NetworkProtocol) -> ProcessHandle {
    let inner = ["127.0.0.1:0".parse().unwrap(), free_port()];
    Process::start(topology(protocol, 1, inner), 1, config(), &[&register_game], LifecycleRegistry::empty())
        .await
        .unwrap()
}

async fn client(
    process: &ProcessHandle,
    protocol: NetworkProtocol,
    registrars: &[&dyn Registrar],
) -> (ProcessHandle, Session) {
    let client = Process::client_scene(9001, config(), registrars, LifecycleRegistry::empty())
        .await
        .unwrap();
    let addr = process.outer_addr(GATE).unwrap();
    let session = client
        .scene(9001)
        .unwrap()
        .connect(addr, protocol, &ConnectOptions::default())
        .await
        .unwrap();
    (client, session)
}

async fn spawn_actor(process: &ProcessHandle, scene_id: u16, addressable_id: i64) -> RuntimeId {
    process
        .scene(scene_id)
        .unwrap()
        .run(move |ctx| ctx.tree_mut().create_entity(Actor { addressable_id }, None).unwrap())
        .await
        .unwrap()
}

// =============================================================================
// TESTS
// =============================================================================

async fn login_roundtrip(protocol: NetworkProtocol) {
    let process = start_single(protocol).await;
    let (client, session) = client(&process, protocol, &[]).await;

    let response = session
        .call(&LoginRequest {
            user_name: "ada".into(),
            password: "pw".into(),
        })
        .await;
    assert_eq!(response.error_code, error_code::SUCCESS);
    assert_eq!(response.text, "received ada");
    assert!(session.ping().await.is_ok());

    session.dispose();
    client.shutdown().await;
    process.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_login_over_tcp() {
    login_roundtrip(NetworkProtocol::Tcp).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_login_over_websocket() {
    login_roundtrip(NetworkProtocol::Websocket).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_login_over_kcp() {
    login_roundtrip(NetworkProtocol::Kcp).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unroutable_calls_get_error_replies() {
    let process = start_single(NetworkProtocol::Tcp).await;
    let (client, session) = client(&process, NetworkProtocol::Tcp, &[]).await;

    let unhandled = session.call(&UnhandledRequest {}).await;
    assert_eq!(unhandled.error_code, error_code::HANDLER_NOT_FOUND);

    let missing = RuntimeId::from_parts(1, MAP, 77).unwrap();
    let response: SlowResponse = process.router().call(missing, &SlowRequest { delay_ms: 0 }).await;
    assert_eq!(response.error_code, error_code::ENTITY_NOT_FOUND);

    // An unknown opcode has no reply type, so the caller only sees its own timeout.
    let reply = session.call_raw(PackInfo::new(100_000_099, bytes::Bytes::new())).await;
    assert_eq!(reply, RpcReply::Error(error_code::ROUTE_TIMEOUT));

    client.shutdown().await;
    process.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_inner_call_times_out() {
    let process = start_single(NetworkProtocol::Tcp).await;
    let map = RuntimeId::scene_address(MAP);

    let fast: SlowResponse = process.router().call(map, &SlowRequest { delay_ms: 10 }).await;
    assert_eq!(fast.error_code, error_code::SUCCESS);
    assert_eq!(fast.scene_id, MAP);

    let slow: SlowResponse = process.router().call(map, &SlowRequest { delay_ms: 5_000 }).await;
    assert_eq!(slow.error_code, error_code::ROUTE_TIMEOUT);

    process.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_addressable_call_follows_migration() {
    let process = start_single(NetworkProtocol::Tcp).await;
    let router = process.router().clone();
    let (client, session) = client(&process, NetworkProtocol::Tcp, &[]).await;

    let first = spawn_actor(&process, MAP, 77).await;
    router.addressable_add(77, first, false).await.unwrap();
    assert_eq!(router.addressable_get(77).await, Ok(first));

    let bound = session.call(&BindActorRequest { addressable_id: 77 }).await;
    assert_eq!(bound.error_code, error_code::SUCCESS);

    let here = session.call(&WhereRequest {}).await;
    assert_eq!(here.error_code, error_code::SUCCESS);
    assert_eq!((here.scene_id, here.entity), (MAP, first));

    // Move the actor while the directory entry is locked.
    router.addressable_lock(77).await.unwrap();
    process
        .scene(MAP)
        .unwrap()
        .run(move |ctx| ctx.tree_mut().dispose(first).map(|_| ()))
        .await
        .unwrap()
        .unwrap();

    let pending = {
        let session = session.clone();
        tokio::spawn(async move { session.call(&WhereRequest {}).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!pending.is_finished());

    let second = spawn_actor(&process, MAP_B, 77).await;
    router.addressable_unlock(77, Some(second)).await.unwrap();

    let moved = pending.await.unwrap();
    assert_eq!(moved.error_code, error_code::SUCCESS);
    assert_eq!((moved.scene_id, moved.entity), (MAP_B, second));

    let actor_id = process
        .scene(MAP_B)
        .unwrap()
        .run(move |ctx| ctx.tree().get::<Actor>(second).map(|a| a.addressable_id))
        .await
        .unwrap();
    assert_eq!(actor_id, Some(77));

    session.dispose();
    client.shutdown().await;
    process.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_addressable_without_route_is_not_found_route() {
    let process = start_single(NetworkProtocol::Tcp).await;
    let (client, session) = client(&process, NetworkProtocol::Tcp, &[]).await;

    let unbound = session.call(&WhereRequest {}).await;
    assert_eq!(unbound.error_code, error_code::NOT_FOUND_ROUTE);

    session.call(&BindActorRequest { addressable_id: 404 }).await;
    let missing = session.call(&WhereRequest {}).await;
    assert_eq!(missing.error_code, error_code::NOT_FOUND_ROUTE);

    client.shutdown().await;
    process.shutdown().await;
}

fn notice_registrar(tx: mpsc::UnboundedSender<Notice>) -> impl Fn(&mut DispatcherBuilder) -> Result<(), DispatchError> {
    move |builder: &mut DispatcherBuilder| {
        let tx = tx.clone();
        builder.message(move |_ctx: HandlerContext, notice: Notice| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(notice);
            }
        })?;
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_roaming_forward_and_push() {
    let process = start_single(NetworkProtocol::Tcp).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let registrar = notice_registrar(tx);
    let (client, session) = client(&process, NetworkProtocol::Tcp, &[&registrar]).await;

    let linked = session.call(&RoamRequest { scene_id: MAP, roaming_type: 1 }).await;
    assert_eq!(linked.error_code, error_code::SUCCESS);
    let again = session.call(&RoamRequest { scene_id: MAP, roaming_type: 1 }).await;
    assert_eq!(again.error_code, error_code::ROAMING_ALREADY_LINKED);

    let body = TerminusRequest {}.encode_body().unwrap();
    let reply = session
        .call_raw(PackInfo::new(TerminusRequest::OP_CODE, body.clone()).with_route_type(1))
        .await;
    let response = decode_reply::<TerminusRequest>(reply);
    assert_eq!(response.error_code, error_code::SUCCESS);
    assert_eq!(response.scene_id, MAP);
    assert_eq!(response.terminus.scene_id(), MAP);

    let notice = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    assert_eq!(notice.text, format!("hello from {}", MAP));

    let unknown = session
        .call_raw(PackInfo::new(TerminusRequest::OP_CODE, body).with_route_type(9))
        .await;
    assert_eq!(
        decode_reply::<TerminusRequest>(unknown).error_code,
        error_code::NOT_FOUND_ROAMING
    );

    session.dispose();
    client.shutdown().await;
    process.shutdown().await;
}

async fn count_termini(process: &ProcessHandle, scene_id: u16, roaming_type: i64) -> usize {
    process
        .scene(scene_id)
        .unwrap()
        .run(move |ctx| {
            ctx.tree()
                .iter_of::<Terminus>()
                .filter(|(_, terminus)| terminus.roaming_type == roaming_type)
                .count()
        })
        .await
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_racing_links_leave_one_terminus() {
    let process = start_single(NetworkProtocol::Tcp).await;
    let (client, session) = client(&process, NetworkProtocol::Tcp, &[]).await;

    let (to_map, to_map_b) = tokio::join!(
        session.call(&RoamRequest { scene_id: MAP, roaming_type: 2 }),
        session.call(&RoamRequest { scene_id: MAP_B, roaming_type: 2 }),
    );
    let mut codes = [to_map.error_code, to_map_b.error_code];
    codes.sort_unstable();
    assert_eq!(codes, [error_code::SUCCESS, error_code::ROAMING_ALREADY_LINKED]);

    let termini = count_termini(&process, MAP, 2).await + count_termini(&process, MAP_B, 2).await;
    assert_eq!(termini, 1);

    session.dispose();
    client.shutdown().await;
    process.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cross_process_routing() {
    let inner = [free_port(), free_port()];
    let front = Process::start(
        topology(NetworkProtocol::Tcp, 2, inner),
        1,
        config(),
        &[&register_game],
        LifecycleRegistry::empty(),
    )
    .await
    .unwrap();
    let back = Process::start(
        topology(NetworkProtocol::Tcp, 2, inner),
        2,
        config(),
        &[&register_game],
        LifecycleRegistry::empty(),
    )
    .await
    .unwrap();

    let response: SlowResponse = front
        .router()
        .call(RuntimeId::scene_address(MAP), &SlowRequest { delay_ms: 0 })
        .await;
    assert_eq!(response.error_code, error_code::SUCCESS);
    assert_eq!(response.scene_id, MAP);
    assert_eq!(front.router().inner_session_count(), 1);

    // The back process reaches the directory on the front process.
    let actor = spawn_actor(&back, MAP_B, 5).await;
    back.router().addressable_add(5, actor, false).await.unwrap();
    assert_eq!(front.router().addressable_get(5).await, Ok(actor));

    let (client, session) = client(&front, NetworkProtocol::Tcp, &[]).await;
    session.call(&BindActorRequest { addressable_id: 5 }).await;
    let here = session.call(&WhereRequest {}).await;
    assert_eq!((here.error_code, here.scene_id, here.entity), (error_code::SUCCESS, MAP_B, actor));

    session.dispose();
    client.shutdown().await;
    back.shutdown().await;
    front.shutdown().await;
}

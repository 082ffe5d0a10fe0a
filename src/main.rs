//! Relic Runtime
//!
//! Starts one process of the deployment. Without `RELIC_CONFIG` it runs a
//! built-in single-process layout (gate, map and addressable scene) and
//! logs in to its own gate over KCP as a smoke test.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use relic::config::SceneType;
use relic::message::{CodecKind, DispatchError, DispatcherBuilder};
use relic::network::ConnectOptions;
use relic::{
    HandlerContext, LifecycleRegistry, Message, NetworkProtocol, Process, Request, Response, RuntimeConfig, Topology,
    VERSION,
};

const DEFAULT_INNER_ADDR: &str = "127.0.0.1:20000";
const DEFAULT_GATE_ADDR: &str = "127.0.0.1:20001";
const DEMO_CLIENT_SCENE: u16 = 9001;

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

impl Message for LoginRequest {
    const OP_CODE: u32 = 100_000_001;
    const CODEC: CodecKind = CodecKind::Json;
}

impl Request for LoginRequest {
    type Response = LoginResponse;
}

impl Message for LoginResponse {
    const OP_CODE: u32 = 120_000_001;
    const CODEC: CodecKind = CodecKind::Json;
}

impl Response for LoginResponse {
    fn error_code(&self) -> u32 {
        self.error_code
    }

    fn set_error_code(&mut self, code: u32) {
        self.error_code = code;
    }
}

fn register_login(builder: &mut DispatcherBuilder) -> Result<(), DispatchError> {
    builder.request(|ctx: HandlerContext, request: LoginRequest| async move {
        info!(
            "Scene {} login from {} ({:?})",
            ctx.scene.scene_id(),
            request.user_name,
            ctx.session.remote_addr()
        );
        LoginResponse {
            error_code: 0,
            text: "received".to_string(),
        }
    })?;
    Ok(())
}

async fn login_demo(addr: SocketAddr, protocol: NetworkProtocol, config: &RuntimeConfig) -> anyhow::Result<()> {
    let client = Process::client_scene(DEMO_CLIENT_SCENE, config.clone(), &[], LifecycleRegistry::empty()).await?;
    let scene = client
        .scene(DEMO_CLIENT_SCENE)
        .ok_or_else(|| anyhow::anyhow!("client scene did not start"))?;

    let options = ConnectOptions {
        max_body: config.max_body,
        kcp: config.kcp.clone(),
        connect_timeout: Duration::from_secs(5),
    };
    let session = scene.connect(addr, protocol, &options).await?;
    info!("Demo client connected to {} over {:?}", addr, protocol);

    let response = session
        .call(&LoginRequest {
            user_name: "demo".to_string(),
            password: "demo".to_string(),
        })
        .await;
    info!("Login reply: error_code={} text={:?}", response.error_code, response.text);

    match session.ping().await {
        Ok(rtt) => info!("Gate round trip: {:?}", rtt),
        Err(code) => warn!("Ping failed: {}", relic::error_code::name(code)),
    }

    session.dispose();
    client.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Relic Runtime v{}", VERSION);

    let config = RuntimeConfig::from_env();
    let topology = match &config.config_path {
        Some(path) => {
            info!("Loading topology from {}", path.display());
            Topology::load(path)?
        }
        None => {
            info!("No RELIC_CONFIG set, using single-process layout");
            Topology::single_process(DEFAULT_INNER_ADDR.parse()?, DEFAULT_GATE_ADDR.parse()?, NetworkProtocol::Kcp)
        }
    };

    let gate = topology
        .scenes_of_process(config.process_id)
        .find(|scene| scene.scene_type == SceneType::Gate)
        .and_then(|scene| scene.outer_protocol.map(|protocol| (scene.id, protocol)));

    let process = Process::start(topology, config.process_id, config.clone(), &[&register_login], LifecycleRegistry::empty()).await?;

    if let Some((gate_id, protocol)) = gate {
        if let Some(addr) = process.outer_addr(gate_id) {
            if let Err(e) = login_demo(addr, protocol, &config).await {
                warn!("Login demo failed: {}", e);
            }
        }
    }

    info!("Running; press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    process.shutdown().await;
    Ok(())
}

//! Process Host
//!
//! Builds one process of the deployment from the topology:
//!
//! ```text
//!   Topology ──► MessageDispatcher ──► Router ──► inner TCP listener
//!                                        │
//!                                        ├──► scene thread ──► outer listener
//!                                        └──► scene thread
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use crate::config::{ConfigError, NetworkProtocol, RuntimeConfig, SceneType, Topology};
use crate::entity::{LifecycleRegistry, Scene, SceneError, SceneHandle, SceneInfo, SceneServices, SceneSetup};
use crate::message::{DispatchError, DispatcherBuilder, MessageDispatcher, Registrar};
use crate::network::server::{NetworkServer, ServerConfig};
use crate::network::NetworkError;
use crate::routing::{register_runtime_handlers, Router};
use crate::storage::{MemoryStorage, Storage};

/// Startup errors.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// Invalid configuration.
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// A listener could not be bound.
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Handler registration failed.
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// A scene could not be started.
    #[error("Scene error: {0}")]
    Scene(#[from] SceneError),
}

struct RunningScene {
    handle: SceneHandle,
    thread: Option<std::thread::JoinHandle<()>>,
}

/// A running process.
pub struct ProcessHandle {
    process_id: u32,
    router: Arc<Router>,
    scenes: Vec<RunningScene>,
    inner: Option<Arc<NetworkServer>>,
    outer: HashMap<u16, Arc<NetworkServer>>,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("process_id", &self.process_id)
            .field("scenes", &self.scenes.len())
            .field("outer", &self.outer.len())
            .finish()
    }
}

impl ProcessHandle {
    /// Process id.
    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    /// Process router.
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Local scene by id.
    pub fn scene(&self, scene_id: u16) -> Option<SceneHandle> {
        self.scenes
            .iter()
            .find(|s| s.handle.scene_id() == scene_id)
            .map(|s| s.handle.clone())
    }

    /// Bound address of the inner listener.
    pub fn inner_addr(&self) -> Option<SocketAddr> {
        self.inner.as_ref().map(|server| server.local_addr())
    }

    /// Bound address of a scene's outer listener.
    pub fn outer_addr(&self, scene_id: u16) -> Option<SocketAddr> {
        self.outer.get(&scene_id).map(|server| server.local_addr())
    }

    /// Stop listeners, scenes and inner sessions.
    pub async fn shutdown(mut self) {
        info!("Shutting down process {}", self.process_id);
        for server in self.outer.values() {
            server.shutdown();
        }
        if let Some(inner) = &self.inner {
            inner.shutdown();
        }
        for scene in &self.scenes {
            scene.handle.shutdown();
        }

        for scene in &mut self.scenes {
            if let Some(thread) = scene.thread.take() {
                let scene_id = scene.handle.scene_id();
                match tokio::task::spawn_blocking(move || thread.join()).await {
                    Ok(Ok(())) => {}
                    _ => error!("Scene {} thread panicked", scene_id),
                }
            }
        }

        self.router.shutdown();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("Listener task failed: {}", e);
            }
        }
        info!("Process {} stopped", self.process_id);
    }
}

fn build_dispatcher(registrars: &[&dyn Registrar]) -> Result<Arc<MessageDispatcher>, DispatchError> {
    let mut builder = DispatcherBuilder::new();
    builder.register(&register_runtime_handlers)?;
    for registrar in registrars {
        builder.register(*registrar)?;
    }
    let dispatcher = builder.build();
    info!("Registered {} handlers", dispatcher.len());
    Ok(Arc::new(dispatcher))
}

fn spawn_server(server: &Arc<NetworkServer>) -> JoinHandle<()> {
    let server = server.clone();
    tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!("Listener on {} failed: {}", server.local_addr(), e);
        }
    })
}

/// Process launcher.
pub struct Process;

impl Process {
    /// Start `process_id` of `topology` with in-memory storage.
    pub async fn start(
        topology: Topology,
        process_id: u32,
        config: RuntimeConfig,
        registrars: &[&dyn Registrar],
        lifecycle: LifecycleRegistry,
    ) -> Result<ProcessHandle, ProcessError> {
        Self::start_with_storage(topology, process_id, config, registrars, lifecycle, Arc::new(MemoryStorage::new())).await
    }

    /// Start `process_id` of `topology` with the given storage backend.
    #[instrument(skip(topology, config, registrars, lifecycle, storage))]
    pub async fn start_with_storage(
        topology: Topology,
        process_id: u32,
        config: RuntimeConfig,
        registrars: &[&dyn Registrar],
        lifecycle: LifecycleRegistry,
        storage: Arc<dyn Storage>,
    ) -> Result<ProcessHandle, ProcessError> {
        let process = topology
            .process(process_id)
            .cloned()
            .ok_or(ConfigError::ProcessNotInTopology(process_id))?;
        let topology = Arc::new(topology);
        let config = Arc::new(config);
        let dispatcher = build_dispatcher(registrars)?;
        let router = Router::start(process_id, topology.clone(), config.clone(), dispatcher.clone());
        let services = SceneServices {
            router: router.clone(),
            dispatcher,
            config: config.clone(),
            storage,
            lifecycle: Arc::new(lifecycle),
        };

        let mut handle = ProcessHandle {
            process_id,
            router: router.clone(),
            scenes: Vec::new(),
            inner: None,
            outer: HashMap::new(),
            tasks: Vec::new(),
        };

        let inner_config = ServerConfig {
            max_body: config.max_body,
            ..ServerConfig::new(process.inner_addr, NetworkProtocol::Tcp)
        };
        let inner = Arc::new(NetworkServer::bind(inner_config, router.acceptor()).await?);
        info!("Process {} inner listener on {}", process_id, inner.local_addr());
        handle.tasks.push(spawn_server(&inner));
        handle.inner = Some(inner);

        for scene in topology.scenes_of_process(process_id) {
            let info = SceneInfo {
                scene_id: scene.id,
                world_id: scene.world,
                scene_type: scene.scene_type,
            };
            let (scene_handle, thread) = Scene::spawn(SceneSetup {
                info,
                services: services.clone(),
            })?;
            router.register_scene(scene_handle.clone());
            handle.scenes.push(RunningScene {
                handle: scene_handle.clone(),
                thread: Some(thread),
            });

            if let (Some(addr), Some(protocol)) = (scene.outer_addr, scene.outer_protocol) {
                let outer_config = ServerConfig {
                    bind_addr: addr,
                    protocol,
                    max_body: config.max_body,
                    kcp: config.kcp.clone(),
                };
                let server = Arc::new(NetworkServer::bind(outer_config, Arc::new(scene_handle)).await?);
                info!("Scene {} outer {:?} listener on {}", scene.id, protocol, server.local_addr());
                handle.tasks.push(spawn_server(&server));
                handle.outer.insert(scene.id, server);
            }
        }

        info!(
            "Process {} started with {} scenes",
            process_id,
            handle.scenes.len()
        );
        Ok(handle)
    }

    /// Start a standalone scene with no topology, for client-side
    /// connections. Its sessions are never disposed for idleness.
    pub async fn client_scene(
        scene_id: u16,
        config: RuntimeConfig,
        registrars: &[&dyn Registrar],
        lifecycle: LifecycleRegistry,
    ) -> Result<ProcessHandle, ProcessError> {
        let config = Arc::new(RuntimeConfig {
            session_idle_timeout: Duration::ZERO,
            ..config
        });
        let dispatcher = build_dispatcher(registrars)?;
        let router = Router::start(0, Arc::new(Topology::default()), config.clone(), dispatcher.clone());
        let (scene, thread) = Scene::spawn(SceneSetup {
            info: SceneInfo {
                scene_id,
                world_id: 0,
                scene_type: SceneType::Custom,
            },
            services: SceneServices {
                router: router.clone(),
                dispatcher,
                config,
                storage: Arc::new(MemoryStorage::new()),
                lifecycle: Arc::new(lifecycle),
            },
        })?;
        router.register_scene(scene.clone());

        Ok(ProcessHandle {
            process_id: 0,
            router,
            scenes: vec![RunningScene {
                handle: scene,
                thread: Some(thread),
            }],
            inner: None,
            outer: HashMap::new(),
            tasks: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests;

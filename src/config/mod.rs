//! Configuration
//!
//! Two sources: the static deployment [`Topology`] (TOML file) and the
//! process-level [`RuntimeConfig`] tunables read from the environment.
//! Both are fixed once the process starts.

pub mod topology;

use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

use crate::network::kcp::KcpSettings;

pub use topology::{NetworkProtocol, ProcessConfig, SceneConfig, SceneType, Topology, WorldConfig};

/// Configuration errors. All of them are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Topology file could not be read.
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// Topology file is not valid TOML or has unknown values.
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Two scenes share an id.
    #[error("Duplicate scene id {0}")]
    DuplicateSceneId(u16),

    /// Two processes share an id.
    #[error("Duplicate process id {0}")]
    DuplicateProcessId(u32),

    /// Two worlds share an id.
    #[error("Duplicate world id {0}")]
    DuplicateWorldId(u8),

    /// A scene references a missing process.
    #[error("Scene {scene} references unknown process {process}")]
    UnknownProcess {
        /// Scene id.
        scene: u16,
        /// Missing process id.
        process: u32,
    },

    /// A scene references a missing world.
    #[error("Scene {scene} references unknown world {world}")]
    UnknownWorld {
        /// Scene id.
        scene: u16,
        /// Missing world id.
        world: u8,
    },

    /// An outer address was configured without a protocol.
    #[error("Scene {0} has an outer address but no outer protocol")]
    MissingOuterProtocol(u16),

    /// The selected process is not part of the topology.
    #[error("Process {0} is not in the topology")]
    ProcessNotInTopology(u32),
}

/// Process-level tunables.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Topology file; `None` runs the built-in single-process layout.
    pub config_path: Option<PathBuf>,
    /// Which process of the topology this is.
    pub process_id: u32,
    /// Deadline for outstanding calls.
    pub rpc_timeout: Duration,
    /// Sessions without traffic for this long are disposed.
    pub session_idle_timeout: Duration,
    /// Scene tick granularity.
    pub scene_tick: Duration,
    /// Largest accepted packet body.
    pub max_body: usize,
    /// Reliable UDP parameters.
    pub kcp: KcpSettings,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            config_path: None,
            process_id: 1,
            rpc_timeout: Duration::from_secs(30),
            session_idle_timeout: Duration::from_secs(30),
            scene_tick: Duration::from_millis(10),
            max_body: 1024 * 1024,
            kcp: KcpSettings::default(),
        }
    }
}

impl RuntimeConfig {
    /// Create config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let mut kcp = defaults.kcp.clone();
        kcp.max_wait_send = env_parse("RELIC_KCP_MAX_WAIT_SEND", kcp.max_wait_send);

        Self {
            config_path: std::env::var("RELIC_CONFIG").ok().map(PathBuf::from),
            process_id: env_parse("RELIC_PROCESS_ID", defaults.process_id),
            rpc_timeout: Duration::from_millis(env_parse(
                "RELIC_RPC_TIMEOUT_MS",
                defaults.rpc_timeout.as_millis() as u64,
            )),
            session_idle_timeout: Duration::from_millis(env_parse(
                "RELIC_SESSION_IDLE_MS",
                defaults.session_idle_timeout.as_millis() as u64,
            )),
            scene_tick: Duration::from_millis(env_parse(
                "RELIC_SCENE_TICK_MS",
                defaults.scene_tick.as_millis() as u64,
            )),
            max_body: env_parse("RELIC_MAX_BODY", defaults.max_body),
            kcp,
        }
    }
}

fn env_parse<T: std::str::FromStr + Copy>(var: &str, default: T) -> T {
    match std::env::var(var) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("Ignoring invalid {}={:?}", var, raw);
            default
        }),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_config_default() {
        let config = RuntimeConfig::default();
        assert_eq!(config.rpc_timeout, Duration::from_secs(30));
        assert_eq!(config.scene_tick, Duration::from_millis(10));
        assert_eq!(config.max_body, 1 << 20);
        assert!(config.config_path.is_none());
    }

    #[test]
    fn test_env_parse_fallback() {
        std::env::set_var("RELIC_TEST_BAD_NUMBER", "not-a-number");
        assert_eq!(env_parse("RELIC_TEST_BAD_NUMBER", 42u32), 42);
        std::env::set_var("RELIC_TEST_GOOD_NUMBER", "7");
        assert_eq!(env_parse("RELIC_TEST_GOOD_NUMBER", 42u32), 7);
    }
}

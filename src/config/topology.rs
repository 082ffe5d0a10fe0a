//! Deployment Topology
//!
//! Static map of processes, worlds and scenes, loaded once at startup from
//! TOML and read-only afterwards. Scene ids must be unique across the whole
//! deployment: id generation relies on it.
//!
//! ```toml
//! [[process]]
//! id = 1
//! inner_addr = "127.0.0.1:11001"
//!
//! [[world]]
//! id = 1
//! name = "main"
//!
//! [[scene]]
//! id = 1001
//! process = 1
//! world = 1
//! scene_type = "gate"
//! outer_addr = "127.0.0.1:20000"
//! outer_protocol = "kcp"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;

use super::ConfigError;

/// Outer transport protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkProtocol {
    /// Reliable UDP.
    Kcp,
    /// Length-framed TCP.
    Tcp,
    /// Binary WebSocket frames.
    Websocket,
}

/// Role of a scene.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SceneType {
    /// Accepts client connections and forwards routed traffic.
    Gate,
    /// Hosts game entities.
    Map,
    /// Hosts a shard of the addressable directory.
    Addressable,
    /// Anything else.
    Custom,
}

/// One OS process of the deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Process id.
    pub id: u32,
    /// Listener for process-to-process traffic.
    pub inner_addr: SocketAddr,
}

/// A world groups scenes sharing game data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldConfig {
    /// World id, embedded in entity ids.
    pub id: u8,
    /// Display name.
    #[serde(default)]
    pub name: String,
}

/// One scene and its placement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SceneConfig {
    /// Deployment-unique scene id.
    pub id: u16,
    /// Hosting process.
    pub process: u32,
    /// Owning world.
    pub world: u8,
    /// Role.
    pub scene_type: SceneType,
    /// Client-facing listener.
    #[serde(default)]
    pub outer_addr: Option<SocketAddr>,
    /// Protocol of the client-facing listener.
    #[serde(default)]
    pub outer_protocol: Option<NetworkProtocol>,
}

#[derive(Debug, Default, Deserialize)]
struct TopologyFile {
    #[serde(default, rename = "process")]
    processes: Vec<ProcessConfig>,
    #[serde(default, rename = "world")]
    worlds: Vec<WorldConfig>,
    #[serde(default, rename = "scene")]
    scenes: Vec<SceneConfig>,
}

/// Validated, indexed topology.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    processes: Vec<ProcessConfig>,
    worlds: Vec<WorldConfig>,
    scenes: Vec<SceneConfig>,
    process_index: HashMap<u32, usize>,
    scene_index: HashMap<u16, usize>,
    addressable: Vec<u16>,
}

impl Topology {
    /// Validate and index a topology.
    pub fn new(
        processes: Vec<ProcessConfig>,
        worlds: Vec<WorldConfig>,
        scenes: Vec<SceneConfig>,
    ) -> Result<Self, ConfigError> {
        let mut process_index = HashMap::new();
        for (i, process) in processes.iter().enumerate() {
            if process_index.insert(process.id, i).is_some() {
                return Err(ConfigError::DuplicateProcessId(process.id));
            }
        }

        let mut world_ids = HashMap::new();
        for world in &worlds {
            if world_ids.insert(world.id, ()).is_some() {
                return Err(ConfigError::DuplicateWorldId(world.id));
            }
        }

        let mut scene_index = HashMap::new();
        for (i, scene) in scenes.iter().enumerate() {
            if scene_index.insert(scene.id, i).is_some() {
                return Err(ConfigError::DuplicateSceneId(scene.id));
            }
            if !process_index.contains_key(&scene.process) {
                return Err(ConfigError::UnknownProcess {
                    scene: scene.id,
                    process: scene.process,
                });
            }
            if !world_ids.contains_key(&scene.world) {
                return Err(ConfigError::UnknownWorld {
                    scene: scene.id,
                    world: scene.world,
                });
            }
            if scene.outer_addr.is_some() && scene.outer_protocol.is_none() {
                return Err(ConfigError::MissingOuterProtocol(scene.id));
            }
        }

        let mut addressable: Vec<u16> = scenes
            .iter()
            .filter(|s| s.scene_type == SceneType::Addressable)
            .map(|s| s.id)
            .collect();
        addressable.sort_unstable();

        Ok(Self {
            processes,
            worlds,
            scenes,
            process_index,
            scene_index,
            addressable,
        })
    }

    /// Parse and validate TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let file: TopologyFile = toml::from_str(text)?;
        Self::new(file.processes, file.worlds, file.scenes)
    }

    /// Load and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// One process hosting a gate, a map and an addressable scene.
    pub fn single_process(inner_addr: SocketAddr, gate_addr: SocketAddr, protocol: NetworkProtocol) -> Self {
        let scenes = vec![
            SceneConfig {
                id: 1001,
                process: 1,
                world: 1,
                scene_type: SceneType::Gate,
                outer_addr: Some(gate_addr),
                outer_protocol: Some(protocol),
            },
            SceneConfig {
                id: 1002,
                process: 1,
                world: 1,
                scene_type: SceneType::Map,
                outer_addr: None,
                outer_protocol: None,
            },
            SceneConfig {
                id: 1003,
                process: 1,
                world: 1,
                scene_type: SceneType::Addressable,
                outer_addr: None,
                outer_protocol: None,
            },
        ];
        let processes = vec![ProcessConfig { id: 1, inner_addr }];
        let worlds = vec![WorldConfig {
            id: 1,
            name: "main".to_string(),
        }];
        // Ids above are distinct and references resolve, so indexing cannot fail.
        let process_index = HashMap::from([(1, 0)]);
        let scene_index = scenes.iter().enumerate().map(|(i, s)| (s.id, i)).collect();
        Self {
            processes,
            worlds,
            scenes,
            process_index,
            scene_index,
            addressable: vec![1003],
        }
    }

    /// All processes.
    pub fn processes(&self) -> &[ProcessConfig] {
        &self.processes
    }

    /// All worlds.
    pub fn worlds(&self) -> &[WorldConfig] {
        &self.worlds
    }

    /// All scenes.
    pub fn scenes(&self) -> &[SceneConfig] {
        &self.scenes
    }

    /// Look up a process.
    pub fn process(&self, id: u32) -> Option<&ProcessConfig> {
        self.process_index.get(&id).map(|&i| &self.processes[i])
    }

    /// Look up a scene.
    pub fn scene(&self, id: u16) -> Option<&SceneConfig> {
        self.scene_index.get(&id).map(|&i| &self.scenes[i])
    }

    /// Process hosting a scene.
    pub fn process_of_scene(&self, scene_id: u16) -> Option<&ProcessConfig> {
        self.scene(scene_id).and_then(|s| self.process(s.process))
    }

    /// Scenes hosted by a process.
    pub fn scenes_of_process(&self, process_id: u32) -> impl Iterator<Item = &SceneConfig> {
        self.scenes.iter().filter(move |s| s.process == process_id)
    }

    /// Directory shard scenes, sorted by id.
    pub fn addressable_scenes(&self) -> &[u16] {
        &self.addressable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[[process]]
id = 1
inner_addr = "127.0.0.1:11001"

[[process]]
id = 2
inner_addr = "127.0.0.1:11002"

[[world]]
id = 1
name = "main"

[[scene]]
id = 1001
process = 1
world = 1
scene_type = "gate"
outer_addr = "127.0.0.1:20000"
outer_protocol = "kcp"

[[scene]]
id = 2001
process = 2
world = 1
scene_type = "addressable"

[[scene]]
id = 2002
process = 2
world = 1
scene_type = "addressable"
"#;

    #[test]
    fn test_parse_sample() {
        let topology = Topology::from_toml_str(SAMPLE).unwrap();
        assert_eq!(topology.processes().len(), 2);
        assert_eq!(topology.scene(1001).unwrap().outer_protocol, Some(NetworkProtocol::Kcp));
        assert_eq!(topology.process_of_scene(2001).unwrap().id, 2);
        assert_eq!(topology.addressable_scenes(), &[2001, 2002]);
        assert_eq!(topology.scenes_of_process(2).count(), 2);
    }

    #[test]
    fn test_duplicate_scene_id_fatal() {
        let text = format!("{SAMPLE}\n[[scene]]\nid = 1001\nprocess = 2\nworld = 1\nscene_type = \"map\"\n");
        assert!(matches!(
            Topology::from_toml_str(&text),
            Err(ConfigError::DuplicateSceneId(1001))
        ));
    }

    #[test]
    fn test_unknown_process_rejected() {
        let text = format!("{SAMPLE}\n[[scene]]\nid = 3001\nprocess = 9\nworld = 1\nscene_type = \"map\"\n");
        assert!(matches!(
            Topology::from_toml_str(&text),
            Err(ConfigError::UnknownProcess { scene: 3001, process: 9 })
        ));
    }

    #[test]
    fn test_unsupported_protocol_rejected() {
        let text = SAMPLE.replace("\"kcp\"", "\"carrier-pigeon\"");
        assert!(matches!(Topology::from_toml_str(&text), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_single_process_layout() {
        let topology = Topology::single_process(
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:0".parse().unwrap(),
            NetworkProtocol::Tcp,
        );
        assert_eq!(topology.scenes_of_process(1).count(), 3);
        assert_eq!(topology.addressable_scenes(), &[1003]);
        assert_eq!(topology.scene(1002).unwrap().scene_type, SceneType::Map);
    }
}

// related_world_server/server/src/core/config.rs
use super::constants::*;
use super::error::{RelatedWorldError, RelatedWorldResult};
use super::types::{IntVector, NetMode, WorldDomain};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    pub cell_size: f64,
    pub spatial_query_radius: f64,
    pub default_cull_distance: f64,
    pub max_packed_movement_bits: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        ReplicationConfig {
            cell_size: GRID_CELL_SIZE,
            spatial_query_radius: SPATIAL_QUERY_RADIUS,
            default_cull_distance: DEFAULT_NET_CULL_DISTANCE,
            max_packed_movement_bits: MAX_PACKED_MOVEMENT_BITS,
        }
    }
}

/// A related world the server creates (or loads, when `map` is set) at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct RelatedWorldConfig {
    pub name: String,
    #[serde(default)]
    pub map: Option<String>,
    #[serde(default)]
    pub translation: [i32; 3],
    #[serde(default)]
    pub domain: WorldDomain,
    #[serde(default = "default_networked")]
    pub networked: bool,
}

fn default_networked() -> bool {
    true
}

impl RelatedWorldConfig {
    pub fn translation(&self) -> IntVector {
        IntVector::from(self.translation)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub tick_rate: u64,
    pub net_mode: NetMode,
    pub persistent_map: String,
    pub replication: ReplicationConfig,
    pub worlds: Vec<RelatedWorldConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            tick_rate: SERVER_TICK_RATE,
            net_mode: NetMode::DedicatedServer,
            persistent_map: DEFAULT_PERSISTENT_MAP.to_string(),
            replication: ReplicationConfig::default(),
            worlds: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn from_yaml_str(raw: &str) -> RelatedWorldResult<Self> {
        let config: ServerConfig =
            serde_yaml::from_str(raw).map_err(|e| RelatedWorldError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> RelatedWorldResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }

    pub fn tick_seconds(&self) -> f64 {
        1.0 / self.tick_rate.max(1) as f64
    }

    fn validate(&self) -> RelatedWorldResult<()> {
        if self.tick_rate == 0 {
            return Err(RelatedWorldError::Config("tick_rate must be > 0".into()));
        }
        if self.replication.cell_size <= 0.0 {
            return Err(RelatedWorldError::Config("replication.cell_size must be > 0".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for world in &self.worlds {
            if !seen.insert(world.name.as_str()) {
                return Err(RelatedWorldError::Config(format!("duplicate world name '{}'", world.name)));
            }
        }
        Ok(())
    }
}

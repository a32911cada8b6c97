// related_world_server/server/src/core/constants.rs
use std::time::Duration;

pub const SERVER_TICK_RATE: u64 = 30;
pub const TICK_DURATION_MS: u64 = 1000 / SERVER_TICK_RATE;
pub const TICK_DURATION: Duration = Duration::from_millis(TICK_DURATION_MS);

pub const DEFAULT_PERSISTENT_MAP: &str = "/Game/Maps/Persistent";

// Frame timing
pub const MAX_UNDILATED_FRAME_TIME_SECS: f64 = 0.4;
pub const MIN_TIME_DILATION: f64 = 0.0001;
pub const MAX_TIME_DILATION: f64 = 20.0;

// Replication graph
pub const GRID_CELL_SIZE: f64 = 10_000.0;
pub const SPATIAL_QUERY_RADIUS: f64 = 15_000.0;
pub const DEFAULT_NET_CULL_DISTANCE: f64 = 15_000.0;
pub const DEFAULT_NET_UPDATE_FREQUENCY: f64 = 100.0;

// Movement RPC guards
pub const MAX_PACKED_MOVEMENT_BITS: usize = 4096;

// Spawn collision adjustment
pub const SPAWN_ADJUST_ATTEMPTS: usize = 8;
pub const DEFAULT_COLLISION_RADIUS: f64 = 34.0;

pub const SLOW_FRAME_LOG_MS: u64 = 12;

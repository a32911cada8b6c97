// related_world_server/server/src/world/mod.rs
pub mod context;
pub mod director;
pub mod engine;
pub mod events;
pub mod related_world;
pub mod transform;

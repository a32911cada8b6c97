// related_world_server/server/src/operational/mod.rs
pub mod monitoring;

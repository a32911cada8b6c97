// related_world_server/server/src/replication/mod.rs
pub mod domain;
pub mod graph;
pub mod grid;
pub mod node;

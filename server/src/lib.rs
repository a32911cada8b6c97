// related_world_server/server/src/lib.rs

pub mod core;
pub mod entities;
pub mod network;
pub mod operational;
pub mod replication;
pub mod server;
pub mod world;

pub use crate::server::instance::RelatedWorldServer;
pub use crate::world::director::WorldDirector;

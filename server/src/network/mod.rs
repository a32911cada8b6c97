// related_world_server/server/src/network/mod.rs
pub mod correction;
pub mod hooks;
pub mod net_driver;
pub mod packed;
pub mod rpc;

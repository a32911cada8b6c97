// related_world_server/server/src/main.rs
use related_world_server_core::core::config::ServerConfig;
use related_world_server_core::entities::actor::ActorClass;
use related_world_server_core::operational::monitoring::metrics::{init_logging, MetricsSystem};
use related_world_server_core::server::instance::RelatedWorldServer;

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

const CONFIG_ENV: &str = "RELWORLD_CONFIG";

fn load_config() -> anyhow::Result<ServerConfig> {
    match std::env::var(CONFIG_ENV) {
        Ok(path) => {
            let config = ServerConfig::from_yaml_file(&path)
                .map_err(|e| anyhow::anyhow!("Failed to load config from {}: {}", path, e))?;
            info!(path = %path, "Server configuration loaded");
            Ok(config)
        }
        Err(_) => {
            info!("{} not set, using default configuration", CONFIG_ENV);
            Ok(ServerConfig::default())
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = init_logging() {
        eprintln!("Failed to initialize logging: {:?}", e);
        return Err(e);
    }

    info!("Related World Server starting up...");

    let config = Arc::new(load_config()?);
    info!("Server configuration ready. Tick rate: {}", config.tick_rate);

    let _metrics = match MetricsSystem::new() {
        Ok(metrics) => Some(metrics),
        Err(e) => {
            warn!("Metrics exporter unavailable: {:?}", e);
            None
        }
    };

    let server = Arc::new(RelatedWorldServer::new(config.clone()));
    server.register_class(ActorClass::character("Character"));
    server.register_class(ActorClass::new("GameState").always_relevant());
    server.register_class(ActorClass::new("PlayerState").owner_only());
    server.register_class(ActorClass::new("PhysicsProp"));
    server.init_replication_settings();

    let created = server
        .bootstrap_worlds()
        .map_err(|e| anyhow::anyhow!("World bootstrap failed: {}", e))?;
    info!(worlds = created, "Related worlds ready");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server_for_loop = Arc::clone(&server);
    let game_loop = tokio::spawn(async move {
        info!("Starting game loop...");
        server_for_loop.run_game_loop(shutdown_rx).await
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    if shutdown_tx.send(true).is_err() {
        warn!("Game loop already stopped");
    }
    match game_loop.await {
        Ok(frames) => info!(frames, "Game loop joined"),
        Err(e) => error!("Game loop task failed: {:?}", e),
    }

    server.shutdown();
    info!("Related World Server shut down.");
    Ok(())
}

// related_world_server/server/tests/integration/server_frame.rs

use related_world_server_core::core::config::ServerConfig;
use related_world_server_core::core::types::{IntVector, Vec3, WorldDomain};
use related_world_server_core::entities::actor::{ActorClass, SpawnParams};
use related_world_server_core::server::instance::RelatedWorldServer;
use related_world_server_core::world::director::MoveOutcome;
use related_world_server_core::world::engine::MapAsset;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const CONFIG: &str = r#"
tick_rate: 60
worlds:
  - name: Dungeon1
    translation: [100000, 0, 0]
    domain: Isolated
  - name: House7
    map: /Game/Maps/House
    domain: Private
"#;

fn configured_server() -> RelatedWorldServer {
    let config = ServerConfig::from_yaml_str(CONFIG).expect("valid config");
    let server = RelatedWorldServer::new(Arc::new(config));
    server.register_class(ActorClass::new("Crate"));
    server.engine.register_map(MapAsset::new("/Game/Maps/House").with_actor("Crate", Vec3::ZERO));
    server
}

#[test]
fn bootstrap_creates_and_loads_configured_worlds() {
    let server = configured_server();
    assert_eq!(server.bootstrap_worlds().expect("bootstrap"), 2);

    let dungeon = server.director.get_related_world("Dungeon1").expect("dungeon");
    assert_eq!(dungeon.translation(), IntVector::new(100_000, 0, 0));
    assert!(dungeon.actor_ids().is_empty());
    let house = server.director.get_related_world("House7").expect("house");
    assert_eq!(house.domain(), WorldDomain::Private);
    assert_eq!(house.actor_ids().len(), 1);

    assert!(server.bootstrap_worlds().is_err());
}

#[test]
fn frame_ticks_worlds_before_applying_deferred_moves() {
    let server = configured_server();
    server.bootstrap_worlds().expect("bootstrap");
    let dungeon = server.director.get_related_world("Dungeon1").expect("dungeon");
    let class = server.engine.find_class("Crate").expect("class");
    let actor = dungeon.spawn_actor(&SpawnParams::at(class, Vec3::ZERO)).expect("spawn");

    dungeon.set_origin(IntVector::new(0, 0, 256)).expect("alive");
    assert_eq!(
        server.director.try_move_actor_to_world(None, actor, true).ok(),
        Some(MoveOutcome::Deferred)
    );

    let summary = server.process_frame(server.config.tick_seconds());
    assert_eq!(summary.frame, 1);
    assert_eq!(summary.host_worlds_ticked, 1);
    assert_eq!(summary.related_worlds_ticked, 2);
    assert_eq!(summary.deferred_moves_applied, 1);
    assert!(server.director.get_related_world_from_actor(actor).is_none());
    assert_eq!(
        server.director.actor_location_to_world_location(actor),
        Some(Vec3::new(100_000.0, 0.0, 0.0))
    );
    assert_eq!(server.current_frame(), 1);
}

#[test]
fn level_check_follows_client_world_and_levels() {
    let server = configured_server();
    server.bootstrap_worlds().expect("bootstrap");
    let house = server.director.get_related_world("House7").expect("house");
    let crate_actor = house.actor_ids()[0];
    let driver = server.engine.persistent_net_driver().expect("driver");
    let connection = driver.open_connection(None);

    assert!(!server.is_level_initialized_for_actor(connection, crate_actor));
    driver.set_client_world(connection, &server.config.persistent_map);
    driver.mark_level_initialized(connection, "/Game/Maps/House");
    assert!(server.is_level_initialized_for_actor(connection, crate_actor));
}

#[tokio::test]
async fn game_loop_runs_until_shutdown_signal() {
    let server = Arc::new(configured_server());
    server.bootstrap_worlds().expect("bootstrap");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(Arc::clone(&server).run_game_loop(shutdown_rx));

    tokio::time::sleep(Duration::from_millis(200)).await;
    shutdown_tx.send(true).expect("loop still listening");
    let frames = handle.await.expect("loop task");

    assert!(frames >= 1);
    assert_eq!(server.current_frame(), frames);

    server.shutdown();
    assert_eq!(server.director.world_count(), 0);
}

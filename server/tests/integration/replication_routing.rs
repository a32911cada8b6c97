// related_world_server/server/tests/integration/replication_routing.rs

use related_world_server_core::core::config::ServerConfig;
use related_world_server_core::core::types::{ActorId, ConnectionId, IntVector, Vec3, WorldDomain};
use related_world_server_core::entities::actor::{ActorClass, SpawnParams};
use related_world_server_core::network::net_driver::NetDriver;
use related_world_server_core::replication::graph::RouteTarget;
use related_world_server_core::replication::node::ReplicationGraphNode;
use related_world_server_core::server::instance::RelatedWorldServer;

use std::sync::Arc;

struct TestServerContext {
    server: RelatedWorldServer,
    driver: Arc<NetDriver>,
    character: Arc<ActorClass>,
    prop: Arc<ActorClass>,
}

fn setup_test_server() -> TestServerContext {
    let server = RelatedWorldServer::new(Arc::new(ServerConfig::default()));
    let character = server.register_class(ActorClass::character("Character"));
    let prop = server.register_class(ActorClass::new("Prop"));
    let driver = server.engine.persistent_net_driver().expect("dedicated server has a driver");
    TestServerContext { server, driver, character, prop }
}

impl TestServerContext {
    /// Connection whose pawn stands at `location` in the persistent world.
    fn connect_at(&self, location: Vec3) -> (ConnectionId, ActorId) {
        let pawn = self
            .server
            .director
            .spawn_actor(None, &SpawnParams::at(self.character.clone(), location))
            .expect("spawn pawn");
        let connection = self.driver.open_connection(Some(pawn));
        self.server.possess(connection, pawn).expect("possess");
        (connection, pawn)
    }
}

#[test]
fn isolated_actors_are_hidden_from_viewers_outside_the_world() {
    let t = setup_test_server();
    let dungeon = t
        .server
        .director
        .create_world("Dungeon1", IntVector::ZERO, WorldDomain::Isolated, true)
        .expect("create");
    let x = dungeon
        .spawn_actor(&SpawnParams::at(t.prop.clone(), Vec3::new(10.0, 0.0, 0.0)))
        .expect("spawn");
    let (outsider, _) = t.connect_at(Vec3::new(0.0, 200.0, 0.0));
    let (visitor, visitor_pawn) = t.connect_at(Vec3::ZERO);

    let summary = t.server.process_frame(0.033);
    assert!(!summary.replication.actors_for(outsider).contains(&x));
    assert!(!summary.replication.actors_for(visitor).contains(&x));
    assert!(summary.replication.actors_for(outsider).contains(&visitor_pawn));

    assert!(t.server.director.move_actor_to_world(Some(&dungeon), visitor_pawn, true));
    let summary = t.server.process_frame(0.033);
    assert_eq!(summary.replication.rerouted, 1);
    let inside = summary.replication.actors_for(visitor);
    assert!(inside.contains(&x));
    assert!(inside.contains(&visitor_pawn));
    assert!(!summary.replication.actors_for(outsider).contains(&visitor_pawn));
}

#[test]
fn one_routing_rule_serves_every_actor_of_a_world() {
    let t = setup_test_server();
    let house = t
        .server
        .director
        .create_world("House7", IntVector::ZERO, WorldDomain::Private, true)
        .expect("create");
    for i in 0..100 {
        house
            .spawn_actor(&SpawnParams::at(t.prop.clone(), Vec3::new(i as f64 * 50.0, 0.0, 0.0)))
            .expect("spawn");
    }

    t.server.process_frame(0.033);
    t.server.process_frame(0.033);

    let graph = t.server.graph.lock();
    assert_eq!(graph.private_router().rule_count(), 1);
    assert_eq!(graph.private_router().rules_created(), 1);
    let rule = graph.private_router().rule("House7").expect("rule for House7");
    assert_eq!(rule.node.actor_count(), 100);
    assert_eq!(graph.isolated_router().rule_count(), 0);
}

#[test]
fn unloading_a_world_drops_its_routing_rule() {
    let t = setup_test_server();
    let house = t
        .server
        .director
        .create_world("House7", IntVector::ZERO, WorldDomain::Private, true)
        .expect("create");
    house.spawn_actor(&SpawnParams::at(t.prop.clone(), Vec3::ZERO)).expect("spawn");
    t.server.process_frame(0.033);
    assert_eq!(t.server.graph.lock().routing_rule_count(), 1);

    t.server.director.unload_world("House7").expect("unload");
    t.server.process_frame(0.033);
    assert_eq!(t.server.graph.lock().routing_rule_count(), 0);
}

#[test]
fn owner_only_actors_wait_for_a_connection_then_reach_only_their_owner() {
    let t = setup_test_server();
    let player_state = t.server.register_class(ActorClass::new("PlayerState").owner_only());
    let (owner, _) = t.connect_at(Vec3::ZERO);
    let (stranger, _) = t.connect_at(Vec3::new(100.0, 0.0, 0.0));

    let state = t
        .server
        .director
        .spawn_actor(None, &SpawnParams::at(player_state, Vec3::ZERO))
        .expect("spawn");
    let summary = t.server.process_frame(0.033);
    assert!(!summary.replication.actors_for(owner).contains(&state));
    {
        let graph = t.server.graph.lock();
        assert_eq!(graph.route_of(state), Some(&RouteTarget::PendingOwner));
        assert_eq!(graph.pending_owner_count(), 1);
    }

    t.server.engine.with_actor_mut(state, |a| a.net_connection = Some(owner));
    let child = t.driver.open_child_connection(owner, None);
    let summary = t.server.process_frame(0.033);

    assert_eq!(t.server.graph.lock().route_of(state), Some(&RouteTarget::OwnerOnly(owner)));
    assert!(summary.replication.actors_for(owner).contains(&state));
    assert!(summary.replication.actors_for(child).contains(&state));
    assert!(!summary.replication.actors_for(stranger).contains(&state));
}

#[test]
fn world_change_reroutes_on_the_next_pass() {
    let t = setup_test_server();
    let house = t
        .server
        .director
        .create_world("House7", IntVector::ZERO, WorldDomain::Private, true)
        .expect("create");
    let x = house.spawn_actor(&SpawnParams::at(t.prop.clone(), Vec3::ZERO)).expect("spawn");
    t.server.process_frame(0.033);
    assert_eq!(
        t.server.graph.lock().route_of(x),
        Some(&RouteTarget::Spatial { domain: WorldDomain::Private, world: Some(Arc::from("House7")) })
    );

    assert!(t.server.director.move_actor_to_world(None, x, true));
    let summary = t.server.process_frame(0.033);
    assert_eq!(summary.replication.rerouted, 1);

    let graph = t.server.graph.lock();
    assert_eq!(graph.route_of(x), Some(&RouteTarget::Spatial { domain: WorldDomain::Public, world: None }));
    assert!(graph.private_router().world_of(x).is_none());
    assert_eq!(graph.pending_reroute_count(), 0);
}

#[test]
fn overlapping_local_coordinates_bucket_by_common_frame() {
    let t = setup_test_server();
    let far = t
        .server
        .director
        .create_world("House7", IntVector::new(100_000, 0, 0), WorldDomain::Private, true)
        .expect("create");
    let near = t
        .server
        .director
        .create_world("House8", IntVector::ZERO, WorldDomain::Private, true)
        .expect("create");
    let far_prop = far.spawn_actor(&SpawnParams::at(t.prop.clone(), Vec3::ZERO)).expect("spawn");
    let near_prop = near.spawn_actor(&SpawnParams::at(t.prop.clone(), Vec3::ZERO)).expect("spawn");
    let (viewer, _) = t.connect_at(Vec3::new(0.0, 100.0, 0.0));

    let summary = t.server.process_frame(0.033);
    let visible = summary.replication.actors_for(viewer);
    assert!(visible.contains(&near_prop));
    assert!(!visible.contains(&far_prop));
}

#[test]
fn class_cull_distance_and_period_apply() {
    let t = setup_test_server();
    let lamp = t.server.register_class(ActorClass::new("Lamp").with_cull_distance(1_000.0));
    let slow = t.server.register_class(ActorClass::new("Windmill").with_update_frequency(10.0));
    let skeleton = t.server.register_class(ActorClass::new("SKEL_Lamp"));
    assert!(!t.server.graph.lock().has_class_settings(&skeleton.name));
    assert!(t.server.graph.lock().has_class_settings("Lamp"));

    let near_lamp = t
        .server
        .director
        .spawn_actor(None, &SpawnParams::at(lamp.clone(), Vec3::new(500.0, 0.0, 0.0)))
        .expect("spawn");
    let far_lamp = t
        .server
        .director
        .spawn_actor(None, &SpawnParams::at(lamp, Vec3::new(5_000.0, 0.0, 0.0)))
        .expect("spawn");
    let windmill = t
        .server
        .director
        .spawn_actor(None, &SpawnParams::at(slow, Vec3::new(0.0, 500.0, 0.0)))
        .expect("spawn");
    let (viewer, _) = t.connect_at(Vec3::ZERO);

    let mut windmill_frames = Vec::new();
    for _ in 0..4 {
        let summary = t.server.process_frame(0.033);
        let visible = summary.replication.actors_for(viewer);
        assert!(visible.contains(&near_lamp));
        assert!(!visible.contains(&far_lamp));
        if visible.contains(&windmill) {
            windmill_frames.push(summary.frame);
        }
    }
    assert_eq!(windmill_frames, vec![1, 4]);
}

// related_world_server/server/tests/integration/related_worlds.rs

use related_world_server_core::core::constants::DEFAULT_PERSISTENT_MAP;
use related_world_server_core::core::error::RelatedWorldError;
use related_world_server_core::core::types::{ActorId, IntVector, NetMode, Vec3, WorldDomain};
use related_world_server_core::entities::actor::{ActorClass, SpawnParams};
use related_world_server_core::network::correction::{CorrectionState, NetLocCorrectionComponent};
use related_world_server_core::world::director::{MoveOutcome, WorldDirector};
use related_world_server_core::world::engine::{HostEngine, MapAsset};
use related_world_server_core::world::events::WorldEvent;
use related_world_server_core::world::related_world::{Tickable, WorldResolver};

use std::sync::Arc;

struct TestWorlds {
    engine: Arc<HostEngine>,
    director: WorldDirector,
    crate_class: Arc<ActorClass>,
}

fn setup() -> TestWorlds {
    let engine = Arc::new(HostEngine::new(NetMode::DedicatedServer, DEFAULT_PERSISTENT_MAP));
    let crate_class = engine.register_class(ActorClass::new("Crate"));
    let director = WorldDirector::new(engine.clone());
    TestWorlds { engine, director, crate_class }
}

fn location_of(engine: &HostEngine, actor: ActorId) -> Vec3 {
    engine.with_actor(actor, |a| a.location()).expect("actor exists")
}

#[test]
fn second_create_with_same_name_fails_and_keeps_first() {
    let t = setup();
    let first = t
        .director
        .create_world("Arena", IntVector::new(0, 50_000, 0), WorldDomain::Public, true)
        .expect("first create");

    let err = t
        .director
        .load_world("Arena", DEFAULT_PERSISTENT_MAP, IntVector::ZERO, WorldDomain::Private, false)
        .expect_err("duplicate name");
    assert!(matches!(err, RelatedWorldError::NotFound(_) | RelatedWorldError::AlreadyExists(_)));

    let err = t
        .director
        .create_world("Arena", IntVector::ZERO, WorldDomain::Private, false)
        .expect_err("duplicate name");
    assert!(matches!(err, RelatedWorldError::AlreadyExists(ref name) if name == "Arena"));

    assert_eq!(t.director.world_count(), 1);
    let registered = t.director.get_related_world("Arena").expect("still registered");
    assert!(Arc::ptr_eq(&first, &registered));
    assert_eq!(registered.domain(), WorldDomain::Public);
    assert!(registered.is_alive());
}

#[test]
fn dungeon_scenario_translate_then_teleport_in_place() {
    let t = setup();
    let dungeon = t
        .director
        .create_world("Dungeon1", IntVector::new(100_000, 0, 0), WorldDomain::Isolated, true)
        .expect("create");
    let a = dungeon
        .spawn_actor(&SpawnParams::at(t.crate_class.clone(), Vec3::ZERO))
        .expect("spawn");

    let owner = t.director.get_related_world_from_actor(a).expect("in dungeon");
    assert_eq!(&**owner.name(), "Dungeon1");
    assert_eq!(t.director.actor_location_to_world_location(a), Some(Vec3::new(100_000.0, 0.0, 0.0)));

    assert!(t.director.move_actor_to_world(None, a, true));
    assert!(t.director.get_related_world_from_actor(a).is_none());
    assert_eq!(location_of(&t.engine, a), Vec3::new(100_000.0, 0.0, 0.0));
    let state = t.engine.with_actor(a, |x| x.correction.as_ref().map(|c| c.state().clone())).flatten();
    assert_eq!(state, Some(CorrectionState::Untracked));

    assert!(t.director.move_actor_to_world(Some(&dungeon), a, false));
    assert_eq!(location_of(&t.engine, a), Vec3::new(100_000.0, 0.0, 0.0));
    assert_eq!(t.director.get_related_world_from_actor(a).map(|w| w.handle()), Some(dungeon.handle()));
    assert_eq!(
        t.director.actor_location_to_world_location(a),
        Some(Vec3::new(200_000.0, 0.0, 0.0))
    );

    let events = t.director.drain_events();
    let moves: Vec<&WorldEvent> = events
        .iter()
        .filter(|e| matches!(e, WorldEvent::ActorChangedWorld { .. }))
        .collect();
    assert_eq!(moves.len(), 2);
}

#[test]
fn moving_an_invalid_actor_is_a_no_op() {
    let t = setup();
    let dungeon = t
        .director
        .create_world("Dungeon1", IntVector::new(100_000, 0, 0), WorldDomain::Isolated, true)
        .expect("create");
    assert!(!t.director.move_actor_to_world(Some(&dungeon), ActorId(9_999), true));

    let a = dungeon
        .spawn_actor(&SpawnParams::at(t.crate_class.clone(), Vec3::ZERO))
        .expect("spawn");
    t.engine.with_actor_mut(a, |x| x.pending_kill = true);
    assert!(!t.director.move_actor_to_world(None, a, true));
    assert_eq!(t.director.get_related_world_from_actor(a).map(|w| w.handle()), Some(dungeon.handle()));
}

#[test]
fn moving_into_the_current_world_reports_already_there() {
    let t = setup();
    let dungeon = t
        .director
        .create_world("Dungeon1", IntVector::ZERO, WorldDomain::Isolated, true)
        .expect("create");
    let a = dungeon
        .spawn_actor(&SpawnParams::at(t.crate_class.clone(), Vec3::ZERO))
        .expect("spawn");
    assert_eq!(
        t.director.try_move_actor_to_world(Some(&dungeon), a, true).ok(),
        Some(MoveOutcome::AlreadyThere)
    );
}

#[test]
fn networked_ness_change_adds_and_removes_from_shared_driver() {
    let t = setup();
    let driver = t.engine.persistent_net_driver().expect("server driver");
    let connection = driver.open_connection(None);
    let offline = t
        .director
        .create_world("Sandbox", IntVector::ZERO, WorldDomain::Private, false)
        .expect("create");

    let a = t
        .director
        .spawn_actor(None, &SpawnParams::at(t.crate_class.clone(), Vec3::ZERO))
        .expect("spawn");
    assert!(driver.is_network_actor(a));

    assert!(t.director.move_actor_to_world(Some(&offline), a, false));
    assert!(!driver.is_network_actor(a));
    let notices = driver.drain_destroy_notices();
    assert!(notices.iter().any(|n| n.actor == a && n.connection == connection));

    assert!(t.director.move_actor_to_world(None, a, false));
    assert!(driver.is_network_actor(a));
}

#[test]
fn unload_tears_down_everything_and_components_degrade() {
    let t = setup();
    let driver = t.engine.persistent_net_driver().expect("server driver");
    driver.open_connection(None);
    let dungeon = t
        .director
        .create_world("Dungeon1", IntVector::new(100_000, 0, 0), WorldDomain::Isolated, true)
        .expect("create");
    let inside = dungeon
        .spawn_actor(&SpawnParams::at(t.crate_class.clone(), Vec3::ZERO))
        .expect("spawn");

    // A persistent-world actor whose component still follows the dungeon.
    let outside = t
        .director
        .spawn_actor(None, &SpawnParams::at(t.crate_class.clone(), Vec3::ZERO))
        .expect("spawn");
    t.engine.with_actor_mut(outside, |a| {
        let mut component = NetLocCorrectionComponent::new();
        component.notify_world_changed(Some(&dungeon));
        a.correction = Some(component);
    });
    assert_eq!(dungeon.translation_subscriber_count(), 2);

    let contexts_before = t.engine.world_context_count();
    t.director.unload_world("Dungeon1").expect("unload");

    assert!(t.director.get_related_world("Dungeon1").is_none());
    assert!(t.director.related_world_for_handle(dungeon.handle()).is_none());
    assert_eq!(t.engine.world_context_count(), contexts_before - 1);
    assert!(t.engine.context(dungeon.handle()).is_none());
    assert!(!t.engine.is_valid_actor(inside));
    assert!(!dungeon.is_alive());
    assert!(!dungeon.is_tickable());
    assert_eq!(dungeon.translation_subscriber_count(), 0);
    assert!(driver.drain_destroy_notices().iter().any(|n| n.actor == inside));

    let (dirty, state, live) = t
        .engine
        .with_actor_mut(outside, |a| {
            let component = a.correction.as_mut().expect("component");
            let dirty = component.pre_replication();
            (dirty, component.state().clone(), component.live_translation())
        })
        .expect("outside actor alive");
    assert!(dirty);
    assert_eq!(state, CorrectionState::Untracked);
    assert_eq!(live, None);

    assert!(matches!(t.director.unload_world("Dungeon1"), Err(RelatedWorldError::NotFound(_))));
    assert!(!t.director.move_actor_to_world(Some(&dungeon), outside, true));
}

#[test]
fn load_spawns_map_content_and_create_starts_empty() {
    let t = setup();
    t.engine.register_map(
        MapAsset::new("/Game/Maps/Dungeon")
            .with_actor("Crate", Vec3::new(100.0, 0.0, 0.0))
            .with_actor("Crate", Vec3::new(-100.0, 0.0, 0.0)),
    );

    let loaded = t
        .director
        .load_world("Dungeon1", "/Game/Maps/Dungeon", IntVector::new(100_000, 0, 0), WorldDomain::Isolated, true)
        .expect("load");
    let empty = t
        .director
        .create_world("Scratch", IntVector::ZERO, WorldDomain::Public, true)
        .expect("create");

    assert_eq!(loaded.actor_ids().len(), 2);
    assert!(empty.actor_ids().is_empty());
    for actor in loaded.actor_ids() {
        let tracked = t
            .engine
            .with_actor(actor, |a| a.correction.as_ref().and_then(|c| c.live_translation()))
            .flatten();
        assert_eq!(tracked, Some(IntVector::new(100_000, 0, 0)));
        assert!(t.engine.with_actor(actor, |a| a.has_begun_play).unwrap_or(false));
    }

    let missing = t
        .director
        .load_world("Other", "/Game/Maps/Missing", IntVector::ZERO, WorldDomain::Public, true);
    assert!(matches!(missing, Err(RelatedWorldError::NotFound(_))));
    assert_eq!(t.director.world_count(), 2);
}

#[test]
fn related_worlds_do_not_tick_from_the_host_loop() {
    let t = setup();
    let dungeon = t
        .director
        .create_world("Dungeon1", IntVector::ZERO, WorldDomain::Isolated, true)
        .expect("create");

    let host = t.engine.tick_host_worlds(0.033);
    assert!(host.iter().all(|(handle, _)| *handle != dungeon.handle()));

    let related = t.director.tick_worlds(0.033);
    assert_eq!(related.len(), 1);
    assert_eq!(related[0].1.frame, 1);
}

#[test]
fn conversion_utilities_follow_origin_and_translation() {
    let t = setup();
    let a = t
        .director
        .create_world("A", IntVector::new(1_000, 0, 0), WorldDomain::Public, true)
        .expect("create");
    let b = t
        .director
        .create_world("B", IntVector::new(0, 2_000, 0), WorldDomain::Public, true)
        .expect("create");
    a.set_origin(IntVector::new(0, 0, 100)).expect("alive");
    a.tick(0.033);

    let local = Vec3::new(5.0, 5.0, 5.0);
    let world = t.director.related_location_to_world_location(&a, local);
    assert_eq!(world, Vec3::new(1_005.0, 5.0, 105.0));
    assert_eq!(t.director.world_location_to_related_location(&a, world), local);

    let in_b = t.director.related_location_to_related_location(Some(&a), Some(&b), local);
    assert_eq!(in_b, Vec3::new(1_005.0, -1_995.0, 105.0));
    assert_eq!(
        t.director.related_location_to_related_location(Some(&b), Some(&a), in_b),
        local
    );
}

#[test]
fn translating_a_world_marks_tracking_components_dirty() {
    let t = setup();
    let dungeon = t
        .director
        .create_world("Dungeon1", IntVector::new(100_000, 0, 0), WorldDomain::Isolated, true)
        .expect("create");
    let a = dungeon
        .spawn_actor(&SpawnParams::at(t.crate_class.clone(), Vec3::ZERO))
        .expect("spawn");
    t.engine.with_actor_mut(a, |x| x.correction.as_mut().map(|c| c.pre_replication()));

    t.director
        .translate_world("Dungeon1", IntVector::new(200_000, 0, 0))
        .expect("translate");
    let (dirty, snapshot) = t
        .engine
        .with_actor_mut(a, |x| {
            let c = x.correction.as_mut().expect("component");
            (c.pre_replication(), c.replicated_translation())
        })
        .expect("alive");
    assert!(dirty);
    assert_eq!(snapshot, IntVector::new(200_000, 0, 0));
    assert!(t
        .director
        .drain_events()
        .contains(&WorldEvent::WorldTranslated { name: Arc::from("Dungeon1"), translation: IntVector::new(200_000, 0, 0) }));
}

// related_world_server/server/tests/integration/movement_correction.rs

use related_world_server_core::core::config::ServerConfig;
use related_world_server_core::core::constants::MAX_PACKED_MOVEMENT_BITS;
use related_world_server_core::core::error::RelatedWorldError;
use related_world_server_core::core::types::{ActorId, IntVector, NetMode, NetRole, Vec3, WorldDomain, WorldHandle};
use related_world_server_core::entities::actor::{Actor, ActorClass, RepMovement, SpawnParams};
use related_world_server_core::network::correction::{on_rep_initial, on_rep_world_translation, NetLocCorrectionComponent};
use related_world_server_core::network::hooks::install_correction_hooks;
use related_world_server_core::network::packed::{MoveResponseData, PackedMovementBits, ServerMoveData};
use related_world_server_core::network::rpc::{
    CameraUpdate, ClientAdjustment, HostMovementHandlers, RpcCall, RpcDispatchTable, RpcEnv, RpcKind, RpcPayload,
};
use related_world_server_core::server::instance::RelatedWorldServer;
use related_world_server_core::world::related_world::Tickable;

use bytes::Bytes;
use std::sync::Arc;

const DUNGEON: IntVector = IntVector { x: 100_000, y: 0, z: 0 };

struct ServerSide {
    server: RelatedWorldServer,
    pawn: ActorId,
}

/// Pawn at local (10, 0, 0) in a dungeon translated by 100 000 on X whose
/// floating origin has been shifted up by 1 000.
fn server_with_pawn_in_dungeon() -> ServerSide {
    let server = RelatedWorldServer::new(Arc::new(ServerConfig::default()));
    let class = server.register_class(ActorClass::character("Character"));
    let dungeon = server
        .director
        .create_world("Dungeon1", DUNGEON, WorldDomain::Isolated, true)
        .expect("create");
    let pawn = dungeon
        .spawn_actor(&SpawnParams::at(class, Vec3::new(10.0, 0.0, 0.0)))
        .expect("spawn");
    dungeon.set_origin(IntVector::new(0, 0, 1_000)).expect("alive");
    dungeon.tick(0.033);
    ServerSide { server, pawn }
}

fn pawn_location(side: &ServerSide) -> Vec3 {
    side.server.engine.with_actor(side.pawn, |a| a.location()).expect("pawn")
}

#[test]
fn server_rebases_inbound_client_move_into_local_frame() {
    let side = server_with_pawn_in_dungeon();
    assert_eq!(pawn_location(&side), Vec3::new(10.0, 0.0, -1_000.0));

    let bits = ServerMoveData::new(1.0, Vec3::new(100_050.0, 0.0, 0.0)).encode();
    let mut call = RpcCall::server_move(side.pawn, bits);
    side.server.dispatch_rpc(&mut call).expect("dispatch");

    assert_eq!(pawn_location(&side), Vec3::new(50.0, 0.0, -1_000.0));
}

fn client_side_of(side: &ServerSide) -> RepMovement {
    side.server.process_frame(0.033);
    side.server.engine.with_actor(side.pawn, |a| a.replicated_movement).expect("pawn")
}

#[test]
fn gathered_movement_reaches_clients_at_the_server_world_position() {
    let side = server_with_pawn_in_dungeon();
    let movement = client_side_of(&side);
    assert_eq!(movement.location, Vec3::new(10.0, 0.0, 0.0));

    let (table, _natives) = client_table();
    let mut proxy = client_proxy(DUNGEON);
    let env = RpcEnv { net_mode: NetMode::Client, local_origin: IntVector::ZERO, max_packed_bits: MAX_PACKED_MOVEMENT_BITS };
    let mut call = RpcCall::replicated_movement(proxy.id, movement);
    table.dispatch(&mut proxy, &mut call, &env).expect("dispatch");

    let world_space = side.server.director.actor_location_to_world_location(side.pawn);
    assert_eq!(world_space, Some(Vec3::new(100_010.0, 0.0, 0.0)));
    assert_eq!(Some(proxy.location()), world_space);
}

#[test]
fn gathered_physics_movement_rebases_the_client_rigid_body_target() {
    let side = server_with_pawn_in_dungeon();
    side.server.engine.with_actor_mut(side.pawn, |a| {
        if let Some(root) = a.root.as_mut() {
            root.simulating_physics = true;
        }
    });
    let movement = client_side_of(&side);
    assert!(movement.rep_physics);

    let (table, _natives) = client_table();
    let mut proxy = client_proxy(DUNGEON);
    let env = RpcEnv { net_mode: NetMode::Client, local_origin: IntVector::ZERO, max_packed_bits: MAX_PACKED_MOVEMENT_BITS };
    let mut call = RpcCall::replicated_movement(proxy.id, movement);
    table.dispatch(&mut proxy, &mut call, &env).expect("dispatch");

    let target = proxy.root.as_ref().and_then(|r| r.rigid_body_target).expect("target");
    assert_eq!(target.position, Vec3::new(100_010.0, 0.0, 0.0));
}

#[test]
fn persistent_world_corrections_round_trip_after_an_origin_shift() {
    let server = RelatedWorldServer::new(Arc::new(ServerConfig::default()));
    let class = server.register_class(ActorClass::character("Character"));
    let pawn = server
        .director
        .spawn_actor(None, &SpawnParams::at(class, Vec3::new(10.0, 0.0, 0.0)))
        .expect("spawn");
    server
        .engine
        .persistent_context()
        .expect("persistent")
        .write()
        .request_origin_shift(IntVector::new(0, 0, 1_000));
    server.process_frame(0.033);
    let local = server.engine.with_actor(pawn, |a| a.location()).expect("pawn");
    assert_eq!(local, Vec3::new(10.0, 0.0, -1_000.0));

    let mut call = RpcCall::adjust_position(pawn, ClientAdjustment::new(1.0, local, Vec3::ZERO));
    server.dispatch_rpc(&mut call).expect("dispatch");
    let response = MoveResponseData::correction(2.0, Vec3::new(20.0, 0.0, -1_000.0), Vec3::ZERO).encode();
    let mut call = RpcCall::move_response(pawn, response);
    server.dispatch_rpc(&mut call).expect("dispatch");

    let sent = server.drain_outgoing_rpcs();
    let wire = match &sent[0].payload {
        RpcPayload::AdjustPosition(adj) => adj.location,
        other => panic!("unexpected payload {:?}", other),
    };
    assert_eq!(wire, Vec3::new(10.0, 0.0, 0.0));
    match &sent[1].payload {
        RpcPayload::MoveResponse(bits) => {
            let data = MoveResponseData::decode(bits, MAX_PACKED_MOVEMENT_BITS).expect("decode");
            assert_eq!(data.location, Vec3::new(20.0, 0.0, 0.0));
        }
        other => panic!("unexpected payload {:?}", other),
    }

    // The client echoes the corrected position back.
    let mut call = RpcCall::server_move(pawn, ServerMoveData::new(3.0, wire).encode());
    server.dispatch_rpc(&mut call).expect("dispatch");
    assert_eq!(server.engine.with_actor(pawn, |a| a.location()), Some(local));
}

#[test]
fn server_rebases_outbound_corrections_into_the_wire_frame() {
    let side = server_with_pawn_in_dungeon();

    let adjustment = ClientAdjustment::new(2.0, Vec3::new(10.0, 0.0, -1_000.0), Vec3::ZERO);
    let mut call = RpcCall::adjust_position(side.pawn, adjustment);
    side.server.dispatch_rpc(&mut call).expect("dispatch");

    let response = MoveResponseData::correction(3.0, Vec3::new(20.0, 0.0, -1_000.0), Vec3::ZERO).encode();
    let mut call = RpcCall::move_response(side.pawn, response);
    side.server.dispatch_rpc(&mut call).expect("dispatch");

    let sent = side.server.drain_outgoing_rpcs();
    assert_eq!(sent.len(), 2);
    match &sent[0].payload {
        RpcPayload::AdjustPosition(adj) => assert_eq!(adj.location, Vec3::new(100_010.0, 0.0, 0.0)),
        other => panic!("unexpected payload {:?}", other),
    }
    match &sent[1].payload {
        RpcPayload::MoveResponse(bits) => {
            let data = MoveResponseData::decode(bits, MAX_PACKED_MOVEMENT_BITS).expect("decode");
            assert_eq!(data.location, Vec3::new(100_020.0, 0.0, 0.0));
        }
        other => panic!("unexpected payload {:?}", other),
    }
}

#[test]
fn base_relative_corrections_are_left_alone() {
    let side = server_with_pawn_in_dungeon();
    let mut adjustment = ClientAdjustment::new(2.0, Vec3::new(5.0, 0.0, 0.0), Vec3::ZERO);
    adjustment.movement_base = Some(ActorId(77));
    adjustment.base_relative = true;
    let mut call = RpcCall::adjust_position(side.pawn, adjustment);
    side.server.dispatch_rpc(&mut call).expect("dispatch");

    let sent = side.server.drain_outgoing_rpcs();
    match &sent[0].payload {
        RpcPayload::AdjustPosition(adj) => assert_eq!(adj.location, Vec3::new(5.0, 0.0, 0.0)),
        other => panic!("unexpected payload {:?}", other),
    }
}

#[test]
fn camera_updates_land_in_the_local_frame() {
    let side = server_with_pawn_in_dungeon();
    let camera = CameraUpdate { location: Vec3::new(100_000.0, 0.0, 200.0), pitch_yaw: 0 };
    let mut call = RpcCall::update_camera(side.pawn, camera);
    side.server.dispatch_rpc(&mut call).expect("dispatch");

    let camera = side.server.engine.with_actor(side.pawn, |a| a.camera_location).flatten();
    assert_eq!(camera, Some(Vec3::new(0.0, 0.0, -800.0)));
}

#[test]
fn oversized_move_payload_is_rejected_before_decoding() {
    let side = server_with_pawn_in_dungeon();
    let huge = PackedMovementBits::new(Bytes::from(vec![0u8; 16]), MAX_PACKED_MOVEMENT_BITS + 1);
    let mut call = RpcCall::server_move(side.pawn, huge);
    let err = side.server.dispatch_rpc(&mut call).expect_err("rejected");
    assert!(matches!(err, RelatedWorldError::PayloadTooLarge { limit: MAX_PACKED_MOVEMENT_BITS, .. }));
    assert_eq!(pawn_location(&side), Vec3::new(10.0, 0.0, -1_000.0));

    let short = PackedMovementBits::new(Bytes::from_static(&[1, 2]), 64);
    let mut call = RpcCall::server_move(side.pawn, short);
    assert!(matches!(
        side.server.dispatch_rpc(&mut call),
        Err(RelatedWorldError::MalformedPayload(_))
    ));
}

#[test]
fn shutdown_restores_native_handlers() {
    let side = server_with_pawn_in_dungeon();
    side.server.shutdown();
    for kind in RpcKind::ALL {
        assert!(!side.server.rpc.is_hooked(kind));
    }
    assert_eq!(side.server.director.world_count(), 0);
}

fn client_table() -> (RpcDispatchTable, Arc<HostMovementHandlers>) {
    let table = RpcDispatchTable::new();
    let natives = HostMovementHandlers::new();
    natives.register(&table);
    install_correction_hooks(&table);
    (table, natives)
}

fn client_proxy(translation: IntVector) -> Actor {
    let params = SpawnParams::at(Arc::new(ActorClass::new("Prop")), Vec3::ZERO);
    let mut actor = Actor::new(ActorId(42), WorldHandle(1), &params);
    actor.role = NetRole::SimulatedProxy;
    let mut component = NetLocCorrectionComponent::new();
    component.receive_replicated_translation(translation);
    actor.correction = Some(component);
    actor
}

#[test]
fn client_rebases_replicated_movement_onto_its_origin() {
    let (table, _natives) = client_table();
    let mut actor = client_proxy(DUNGEON);
    let env = RpcEnv {
        net_mode: NetMode::Client,
        local_origin: IntVector::new(1_000, 0, 0),
        max_packed_bits: MAX_PACKED_MOVEMENT_BITS,
    };
    let movement = RepMovement { location: Vec3::new(5.0, 0.0, 0.0), ..Default::default() };
    let mut call = RpcCall::replicated_movement(actor.id, movement);
    table.dispatch(&mut actor, &mut call, &env).expect("dispatch");

    assert_eq!(actor.location(), Vec3::new(99_005.0, 0.0, 0.0));
}

#[test]
fn client_physics_proxy_gets_rebased_rigid_body_target() {
    let (table, _natives) = client_table();
    let mut actor = client_proxy(DUNGEON);
    let env = RpcEnv { net_mode: NetMode::Client, local_origin: IntVector::ZERO, max_packed_bits: MAX_PACKED_MOVEMENT_BITS };
    let movement = RepMovement { location: Vec3::new(1.0, 2.0, 3.0), rep_physics: true, ..Default::default() };
    let mut call = RpcCall::replicated_movement(actor.id, movement);
    table.dispatch(&mut actor, &mut call, &env).expect("dispatch");

    let target = actor.root.as_ref().and_then(|r| r.rigid_body_target).expect("target");
    assert_eq!(target.position, Vec3::new(100_001.0, 2.0, 3.0));
    assert!(actor.is_simulating_physics());
}

#[test]
fn client_translation_change_moves_cached_position_without_jump() {
    let mut actor = client_proxy(DUNGEON);
    actor.replicated_movement.location = Vec3::new(5.0, 0.0, 0.0);
    actor.locally_controlled = true;

    let requested = on_rep_world_translation(&mut actor, IntVector::new(200_000, 0, 0), IntVector::ZERO);
    assert_eq!(requested, Some(IntVector::new(200_000, 0, 0)));
    assert_eq!(actor.replicated_movement.location, Vec3::new(-99_995.0, 0.0, 0.0));
    assert_eq!(actor.location(), Vec3::new(100_005.0, 0.0, 0.0));
}

#[test]
fn initial_replication_offsets_zero_placed_actor_once() {
    let mut actor = client_proxy(DUNGEON);
    on_rep_initial(&mut actor);
    assert_eq!(actor.location(), Vec3::new(100_000.0, 0.0, 0.0));
    on_rep_initial(&mut actor);
    assert_eq!(actor.location(), Vec3::new(100_000.0, 0.0, 0.0));
}

#[test]
fn autonomous_proxy_ignores_replicated_location() {
    let (table, _natives) = client_table();
    let mut pawn = client_proxy(DUNGEON);
    pawn.role = NetRole::AutonomousProxy;
    pawn.locally_controlled = true;
    pawn.set_location(Vec3::new(100_050.0, 0.0, 0.0));

    let env = RpcEnv { net_mode: NetMode::Client, local_origin: IntVector::ZERO, max_packed_bits: MAX_PACKED_MOVEMENT_BITS };
    let mut call = RpcCall::replicated_movement(pawn.id, RepMovement::default());
    table.dispatch(&mut pawn, &mut call, &env).expect("dispatch");

    assert_eq!(pawn.location(), Vec3::new(100_050.0, 0.0, 0.0));
}

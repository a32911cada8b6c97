// related_world_server/server/src/network/rpc.rs
//! Dispatch table for the movement RPCs whose coordinates need correcting.
//!
//! Each kind has one native handler. An interceptor can be installed in
//! front of it and later restored; the interceptor decides whether and how
//! to call through.

use crate::core::error::{RelatedWorldError, RelatedWorldResult};
use crate::core::types::{ActorId, IntVector, NetMode, NetRole, Vec3};
use crate::entities::actor::{Actor, RepMovement, RigidBodyState};
use crate::network::packed::{MoveResponseData, PackedMovementBits, ServerMoveData};
use crate::world::transform::{rebase_onto_local_origin, rebase_onto_zero_origin};
use crossbeam_queue::SegQueue;
use dashmap::DashMap;
use metrics::counter;
use std::sync::Arc;
use tracing::{trace, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RpcKind {
    OnRepReplicatedMovement,
    ClientAdjustPosition,
    ClientMoveResponsePacked,
    ServerMovePacked,
    ServerUpdateCamera,
}

impl RpcKind {
    pub const ALL: [RpcKind; 5] = [
        RpcKind::OnRepReplicatedMovement,
        RpcKind::ClientAdjustPosition,
        RpcKind::ClientMoveResponsePacked,
        RpcKind::ServerMovePacked,
        RpcKind::ServerUpdateCamera,
    ];

    pub fn name(self) -> &'static str {
        match self {
            RpcKind::OnRepReplicatedMovement => "OnRep_ReplicatedMovement",
            RpcKind::ClientAdjustPosition => "ClientAdjustPosition",
            RpcKind::ClientMoveResponsePacked => "ClientMoveResponsePacked",
            RpcKind::ServerMovePacked => "ServerMovePacked",
            RpcKind::ServerUpdateCamera => "ServerUpdateCamera",
        }
    }

    /// Runs on the client; on the server dispatching it means sending it.
    pub fn is_client_bound(self) -> bool {
        matches!(
            self,
            RpcKind::OnRepReplicatedMovement | RpcKind::ClientAdjustPosition | RpcKind::ClientMoveResponsePacked
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClientAdjustment {
    pub timestamp: f32,
    pub location: Vec3,
    pub velocity: Vec3,
    pub movement_base: Option<ActorId>,
    pub base_relative: bool,
}

impl ClientAdjustment {
    pub fn new(timestamp: f32, location: Vec3, velocity: Vec3) -> Self {
        ClientAdjustment { timestamp, location, velocity, movement_base: None, base_relative: false }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CameraUpdate {
    pub location: Vec3,
    pub pitch_yaw: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub enum RpcPayload {
    ReplicatedMovement(RepMovement),
    AdjustPosition(ClientAdjustment),
    MoveResponse(PackedMovementBits),
    ServerMove(PackedMovementBits),
    UpdateCamera(CameraUpdate),
}

#[derive(Clone, Debug, PartialEq)]
pub struct RpcCall {
    pub actor: ActorId,
    pub kind: RpcKind,
    pub payload: RpcPayload,
}

impl RpcCall {
    pub fn replicated_movement(actor: ActorId, movement: RepMovement) -> Self {
        RpcCall { actor, kind: RpcKind::OnRepReplicatedMovement, payload: RpcPayload::ReplicatedMovement(movement) }
    }

    pub fn adjust_position(actor: ActorId, adjustment: ClientAdjustment) -> Self {
        RpcCall { actor, kind: RpcKind::ClientAdjustPosition, payload: RpcPayload::AdjustPosition(adjustment) }
    }

    pub fn move_response(actor: ActorId, bits: PackedMovementBits) -> Self {
        RpcCall { actor, kind: RpcKind::ClientMoveResponsePacked, payload: RpcPayload::MoveResponse(bits) }
    }

    pub fn server_move(actor: ActorId, bits: PackedMovementBits) -> Self {
        RpcCall { actor, kind: RpcKind::ServerMovePacked, payload: RpcPayload::ServerMove(bits) }
    }

    pub fn update_camera(actor: ActorId, camera: CameraUpdate) -> Self {
        RpcCall { actor, kind: RpcKind::ServerUpdateCamera, payload: RpcPayload::UpdateCamera(camera) }
    }
}

/// What a handler knows about the side it runs on.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RpcEnv {
    pub net_mode: NetMode,
    /// Applied floating origin of the world the actor lives in.
    pub local_origin: IntVector,
    pub max_packed_bits: usize,
}

impl RpcEnv {
    pub fn with_zero_origin(self) -> Self {
        RpcEnv { local_origin: IntVector::ZERO, ..self }
    }
}

pub trait RpcHandler: Send + Sync {
    fn handle(&self, actor: &mut Actor, call: &mut RpcCall, env: &RpcEnv) -> RelatedWorldResult<()>;
}

pub trait RpcInterceptor: Send + Sync {
    fn intercept(
        &self,
        actor: &mut Actor,
        call: &mut RpcCall,
        env: &RpcEnv,
        next: &dyn RpcHandler,
    ) -> RelatedWorldResult<()>;
}

pub struct RpcDispatchTable {
    natives: DashMap<RpcKind, Arc<dyn RpcHandler>>,
    hooks: DashMap<RpcKind, Arc<dyn RpcInterceptor>>,
}

impl Default for RpcDispatchTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcDispatchTable {
    pub fn new() -> Self {
        RpcDispatchTable { natives: DashMap::new(), hooks: DashMap::new() }
    }

    pub fn register_native(&self, kind: RpcKind, handler: Arc<dyn RpcHandler>) {
        self.natives.insert(kind, handler);
    }

    /// Returns the interceptor it replaced, if any.
    pub fn install_hook(&self, kind: RpcKind, interceptor: Arc<dyn RpcInterceptor>) -> Option<Arc<dyn RpcInterceptor>> {
        trace!(rpc = kind.name(), "Hook installed");
        self.hooks.insert(kind, interceptor)
    }

    pub fn restore(&self, kind: RpcKind) -> bool {
        self.hooks.remove(&kind).is_some()
    }

    pub fn restore_all(&self) -> usize {
        let count = self.hooks.len();
        self.hooks.clear();
        count
    }

    pub fn is_hooked(&self, kind: RpcKind) -> bool {
        self.hooks.contains_key(&kind)
    }

    pub fn dispatch(&self, actor: &mut Actor, call: &mut RpcCall, env: &RpcEnv) -> RelatedWorldResult<()> {
        let native = self
            .natives
            .get(&call.kind)
            .map(|h| h.value().clone())
            .ok_or_else(|| RelatedWorldError::NotFound(format!("native handler for {}", call.kind.name())))?;
        let hook = self.hooks.get(&call.kind).map(|h| h.value().clone());

        let result = match hook {
            Some(hook) => hook.intercept(actor, call, env, native.as_ref()),
            None => native.handle(actor, call, env),
        };

        if let Err(e @ (RelatedWorldError::PayloadTooLarge { .. } | RelatedWorldError::MalformedPayload(_))) = &result {
            warn!(actor = %actor.id, rpc = call.kind.name(), error = %e, "Movement payload rejected");
            counter!("movement_payloads_rejected_total").increment(1);
        }
        result
    }
}

/// Stock handlers for the hooked RPCs. Client-bound calls on a server and
/// server-bound calls on a client are queued in the outbox as "sent".
#[derive(Default)]
pub struct HostMovementHandlers {
    outbox: SegQueue<RpcCall>,
}

impl HostMovementHandlers {
    pub fn new() -> Arc<Self> {
        Arc::new(HostMovementHandlers { outbox: SegQueue::new() })
    }

    pub fn register(self: &Arc<Self>, table: &RpcDispatchTable) {
        for kind in RpcKind::ALL {
            table.register_native(kind, self.clone());
        }
    }

    pub fn drain_outbox(&self) -> Vec<RpcCall> {
        let mut sent = Vec::with_capacity(self.outbox.len());
        while let Some(call) = self.outbox.pop() {
            sent.push(call);
        }
        sent
    }

    fn apply_replicated_movement(actor: &mut Actor, rep: &RepMovement, env: &RpcEnv) {
        if actor.role == NetRole::Authority && env.net_mode.is_server() {
            return;
        }
        if !actor.is_valid() || !actor.is_replicating_movement() {
            return;
        }
        let role = actor.role;
        let Some(root) = actor.root.as_mut() else {
            return;
        };
        let location = rebase_onto_local_origin(rep.location, env.local_origin);
        root.simulating_physics = rep.rep_physics;
        if rep.rep_physics {
            // Welded bodies follow their parent.
            if root.welded {
                return;
            }
            root.rigid_body_target = Some(RigidBodyState {
                position: location,
                rotation: rep.rotation,
                linear_velocity: rep.linear_velocity,
                angular_velocity: rep.angular_velocity,
                sleeping: rep.simulated_physic_sleep,
                needs_update: true,
            });
        } else {
            // Attachment trumps replicated position; autonomous proxies are
            // corrected through the movement RPCs instead.
            if root.attached_to_parent || role != NetRole::SimulatedProxy {
                return;
            }
            actor.set_location_and_rotation(location, rep.rotation);
            actor.velocity = rep.linear_velocity;
        }
    }

    /// Sent positions leave in the zero-origin frame. Replicated movement is
    /// already there once gathered; base-relative positions are left alone.
    fn rebase_outgoing(call: &mut RpcCall, env: &RpcEnv) -> RelatedWorldResult<()> {
        let origin = env.local_origin;
        if origin.is_zero() {
            return Ok(());
        }
        match &mut call.payload {
            RpcPayload::ReplicatedMovement(_) => {}
            RpcPayload::AdjustPosition(adj) => {
                if !adj.base_relative {
                    adj.location = rebase_onto_zero_origin(adj.location, origin);
                }
            }
            RpcPayload::MoveResponse(bits) => {
                let mut data = MoveResponseData::decode(bits, env.max_packed_bits)?;
                if !data.ack_only && !data.base_relative {
                    data.location = rebase_onto_zero_origin(data.location, origin);
                    *bits = data.encode();
                }
            }
            RpcPayload::ServerMove(bits) => {
                let mut data = ServerMoveData::decode(bits, env.max_packed_bits)?;
                if !data.base_relative {
                    data.location = rebase_onto_zero_origin(data.location, origin);
                    *bits = data.encode();
                }
            }
            RpcPayload::UpdateCamera(camera) => {
                camera.location = rebase_onto_zero_origin(camera.location, origin);
            }
        }
        Ok(())
    }

    fn apply_correction(actor: &mut Actor, timestamp: f32, location: Vec3, velocity: Vec3, base_relative: bool, env: &RpcEnv) {
        let location = if base_relative { location } else { rebase_onto_local_origin(location, env.local_origin) };
        actor.set_location(location);
        actor.velocity = velocity;
        actor.last_client_timestamp = timestamp;
    }
}

impl RpcHandler for HostMovementHandlers {
    fn handle(&self, actor: &mut Actor, call: &mut RpcCall, env: &RpcEnv) -> RelatedWorldResult<()> {
        let sending = call.kind.is_client_bound() == env.net_mode.is_server();
        if sending {
            let mut outgoing = call.clone();
            Self::rebase_outgoing(&mut outgoing, env)?;
            self.outbox.push(outgoing);
            return Ok(());
        }
        match &call.payload {
            RpcPayload::ReplicatedMovement(rep) => Self::apply_replicated_movement(actor, rep, env),
            RpcPayload::AdjustPosition(adj) => {
                Self::apply_correction(actor, adj.timestamp, adj.location, adj.velocity, adj.base_relative, env)
            }
            RpcPayload::MoveResponse(bits) => {
                let data = MoveResponseData::decode(bits, env.max_packed_bits)?;
                if data.ack_only {
                    actor.last_client_timestamp = data.timestamp;
                } else {
                    Self::apply_correction(actor, data.timestamp, data.location, data.velocity, data.base_relative, env);
                }
            }
            RpcPayload::ServerMove(bits) => {
                let data = ServerMoveData::decode(bits, env.max_packed_bits)?;
                if data.timestamp < actor.last_client_timestamp {
                    trace!(actor = %actor.id, "Stale server move dropped");
                    return Ok(());
                }
                let velocity = actor.velocity;
                Self::apply_correction(actor, data.timestamp, data.location, velocity, data.base_relative, env);
            }
            RpcPayload::UpdateCamera(camera) => {
                actor.camera_location = Some(rebase_onto_local_origin(camera.location, env.local_origin));
            }
        }
        Ok(())
    }
}

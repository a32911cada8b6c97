// related_world_server/server/src/entities/actor.rs
use crate::core::constants::{DEFAULT_COLLISION_RADIUS, DEFAULT_NET_CULL_DISTANCE, DEFAULT_NET_UPDATE_FREQUENCY};
use crate::core::types::{ActorId, ConnectionId, IntVector, NetRole, Rotator, Transform, Vec3, WorldHandle};
use crate::network::correction::NetLocCorrectionComponent;
use crate::world::transform::rebase_onto_zero_origin;
use std::sync::Arc;

/// Class-default replication and collision settings shared by every actor of a class.
#[derive(Clone, Debug, PartialEq)]
pub struct ActorClass {
    pub name: String,
    pub replicates: bool,
    pub replicate_movement: bool,
    pub always_relevant: bool,
    pub only_relevant_to_owner: bool,
    pub net_update_frequency: f64,
    pub net_cull_distance_squared: f64,
    pub collision_radius: f64,
    pub is_character: bool,
}

impl ActorClass {
    pub fn new(name: impl Into<String>) -> Self {
        ActorClass {
            name: name.into(),
            replicates: true,
            replicate_movement: true,
            always_relevant: false,
            only_relevant_to_owner: false,
            net_update_frequency: DEFAULT_NET_UPDATE_FREQUENCY,
            net_cull_distance_squared: DEFAULT_NET_CULL_DISTANCE * DEFAULT_NET_CULL_DISTANCE,
            collision_radius: DEFAULT_COLLISION_RADIUS,
            is_character: false,
        }
    }

    pub fn character(name: impl Into<String>) -> Self {
        ActorClass { is_character: true, ..Self::new(name) }
    }

    pub fn always_relevant(mut self) -> Self {
        self.always_relevant = true;
        self
    }

    pub fn owner_only(mut self) -> Self {
        self.only_relevant_to_owner = true;
        self
    }

    pub fn not_replicated(mut self) -> Self {
        self.replicates = false;
        self
    }

    pub fn with_cull_distance(mut self, distance: f64) -> Self {
        self.net_cull_distance_squared = distance * distance;
        self
    }

    pub fn with_update_frequency(mut self, hz: f64) -> Self {
        self.net_update_frequency = hz;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpawnCollisionHandling {
    AlwaysSpawn,
    AdjustIfPossibleButAlwaysSpawn,
    AdjustIfPossibleButDontSpawnIfColliding,
    DontSpawnIfColliding,
}

impl Default for SpawnCollisionHandling {
    fn default() -> Self {
        SpawnCollisionHandling::AlwaysSpawn
    }
}

#[derive(Clone, Debug)]
pub struct SpawnParams {
    pub class: Arc<ActorClass>,
    pub transform: Transform,
    pub collision: SpawnCollisionHandling,
    pub owner: Option<ActorId>,
    pub name: Option<String>,
}

impl SpawnParams {
    pub fn new(class: Arc<ActorClass>, transform: Transform) -> Self {
        SpawnParams {
            class,
            transform,
            collision: SpawnCollisionHandling::AlwaysSpawn,
            owner: None,
            name: None,
        }
    }

    pub fn at(class: Arc<ActorClass>, location: Vec3) -> Self {
        Self::new(class, Transform::from_location(location))
    }
}

/// Movement snapshot carried by property replication. Location is in the
/// sender's zero-origin frame.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RepMovement {
    pub location: Vec3,
    pub rotation: Rotator,
    pub linear_velocity: Vec3,
    pub angular_velocity: Vec3,
    pub rep_physics: bool,
    pub simulated_physic_sleep: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RigidBodyState {
    pub position: Vec3,
    pub rotation: Rotator,
    pub linear_velocity: Vec3,
    pub angular_velocity: Vec3,
    pub sleeping: bool,
    pub needs_update: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RootBody {
    pub registered: bool,
    pub simulating_physics: bool,
    pub welded: bool,
    pub attached_to_parent: bool,
    pub rigid_body_target: Option<RigidBodyState>,
}

impl Default for RootBody {
    fn default() -> Self {
        RootBody {
            registered: true,
            simulating_physics: false,
            welded: false,
            attached_to_parent: false,
            rigid_body_target: None,
        }
    }
}

#[derive(Debug)]
pub struct Actor {
    pub id: ActorId,
    pub name: String,
    pub class: Arc<ActorClass>,
    pub world: WorldHandle,
    pub transform: Transform,
    pub velocity: Vec3,
    pub owner: Option<ActorId>,
    pub controller: Option<ActorId>,
    pub net_connection: Option<ConnectionId>,
    pub role: NetRole,
    pub locally_controlled: bool,
    pub pending_kill: bool,
    pub has_begun_play: bool,
    pub replicated_movement: RepMovement,
    pub root: Option<RootBody>,
    pub correction: Option<NetLocCorrectionComponent>,
    pub camera_location: Option<Vec3>,
    pub last_client_timestamp: f32,
}

impl Actor {
    pub fn new(id: ActorId, world: WorldHandle, params: &SpawnParams) -> Self {
        let name = params
            .name
            .clone()
            .unwrap_or_else(|| format!("{}_{}", params.class.name, id.0));
        Actor {
            id,
            name,
            class: params.class.clone(),
            world,
            transform: params.transform,
            velocity: Vec3::ZERO,
            owner: params.owner,
            controller: None,
            net_connection: None,
            role: NetRole::Authority,
            locally_controlled: false,
            pending_kill: false,
            has_begun_play: false,
            replicated_movement: RepMovement::default(),
            root: Some(RootBody::default()),
            correction: None,
            camera_location: None,
            last_client_timestamp: 0.0,
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.pending_kill
    }

    pub fn location(&self) -> Vec3 {
        self.transform.location
    }

    pub fn rotation(&self) -> Rotator {
        self.transform.rotation
    }

    pub fn set_location(&mut self, location: Vec3) {
        self.transform.location = location;
    }

    pub fn set_location_and_rotation(&mut self, location: Vec3, rotation: Rotator) {
        self.transform.location = location;
        self.transform.rotation = rotation;
    }

    pub fn is_simulating_physics(&self) -> bool {
        self.root.as_ref().map_or(false, |r| r.simulating_physics)
    }

    pub fn is_replicating_movement(&self) -> bool {
        self.class.replicates && self.class.replicate_movement
    }

    /// Server side: capture current movement into the replicated snapshot,
    /// rebased from the world's floating origin onto zero origin.
    pub fn gather_current_movement(&mut self, world_origin: IntVector) {
        let rep_physics = self.is_simulating_physics();
        self.replicated_movement = RepMovement {
            location: rebase_onto_zero_origin(self.transform.location, world_origin),
            rotation: self.transform.rotation,
            linear_velocity: self.velocity,
            angular_velocity: Vec3::ZERO,
            rep_physics,
            simulated_physic_sleep: false,
        };
    }

    pub(crate) fn begin_play(&mut self) {
        self.has_begun_play = true;
    }

    /// Tear down components. The actor stays addressable until removed from
    /// its world container.
    pub(crate) fn end_play(&mut self) {
        if let Some(component) = self.correction.as_mut() {
            component.uninitialize();
        }
        self.has_begun_play = false;
    }
}

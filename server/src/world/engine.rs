// related_world_server/server/src/world/engine.rs
use crate::core::constants::SPAWN_ADJUST_ATTEMPTS;
use crate::core::error::{RelatedWorldError, RelatedWorldResult};
use crate::core::types::{ActorId, IntVector, NetMode, Transform, Vec3, WorldHandle};
use crate::entities::actor::{Actor, ActorClass, SpawnCollisionHandling, SpawnParams};
use crate::network::net_driver::NetDriver;
use crate::world::context::{FrameReport, WorldContext};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

pub type ContextRef = Arc<RwLock<WorldContext>>;

pub const PERSISTENT_WORLD: WorldHandle = WorldHandle(1);

#[derive(Clone, Debug, PartialEq)]
pub struct MapActor {
    pub class: String,
    pub transform: Transform,
    pub name: Option<String>,
}

/// A loadable map package and the actors placed in it.
#[derive(Clone, Debug, PartialEq)]
pub struct MapAsset {
    pub package: String,
    pub actors: Vec<MapActor>,
}

impl MapAsset {
    pub fn new(package: impl Into<String>) -> Self {
        MapAsset { package: package.into(), actors: Vec::new() }
    }

    pub fn with_actor(mut self, class: impl Into<String>, location: Vec3) -> Self {
        self.actors.push(MapActor { class: class.into(), transform: Transform::from_location(location), name: None });
        self
    }
}

/// Stand-in for the host engine: the world-context list, the actor index and
/// the asset catalogs every world draws from.
pub struct HostEngine {
    net_mode: NetMode,
    contexts: DashMap<WorldHandle, ContextRef>,
    actor_index: DashMap<ActorId, WorldHandle>,
    maps: DashMap<String, Arc<MapAsset>>,
    classes: DashMap<String, Arc<ActorClass>>,
    next_world_id: AtomicU64,
    next_actor_id: AtomicU64,
    intra_frame_debugging: AtomicBool,
}

impl HostEngine {
    pub fn new(net_mode: NetMode, persistent_map: &str) -> Self {
        let mut persistent = WorldContext::new(PERSISTENT_WORLD, persistent_map, net_mode);
        if net_mode.is_server() {
            persistent.set_owned_net_driver(Arc::new(NetDriver::new("GameNetDriver")));
        }
        let contexts = DashMap::new();
        contexts.insert(PERSISTENT_WORLD, Arc::new(RwLock::new(persistent)));
        info!(?net_mode, map = persistent_map, "Host engine started");
        HostEngine {
            net_mode,
            contexts,
            actor_index: DashMap::new(),
            maps: DashMap::new(),
            classes: DashMap::new(),
            next_world_id: AtomicU64::new(PERSISTENT_WORLD.0 + 1),
            next_actor_id: AtomicU64::new(1),
            intra_frame_debugging: AtomicBool::new(false),
        }
    }

    pub fn net_mode(&self) -> NetMode {
        self.net_mode
    }

    pub fn persistent_handle(&self) -> WorldHandle {
        PERSISTENT_WORLD
    }

    pub fn persistent_context(&self) -> RelatedWorldResult<ContextRef> {
        self.context(PERSISTENT_WORLD)
            .ok_or_else(|| RelatedWorldError::Internal("persistent world context missing".into()))
    }

    pub fn persistent_net_driver(&self) -> Option<Arc<NetDriver>> {
        self.context(PERSISTENT_WORLD).and_then(|ctx| ctx.read().net_driver().cloned())
    }

    // --- World contexts ---

    pub fn context(&self, handle: WorldHandle) -> Option<ContextRef> {
        self.contexts.get(&handle).map(|c| c.value().clone())
    }

    pub fn create_world_context(&self, map_name: &str) -> (WorldHandle, ContextRef) {
        let handle = WorldHandle(self.next_world_id.fetch_add(1, Ordering::Relaxed));
        let context = Arc::new(RwLock::new(WorldContext::new(handle, map_name, self.net_mode)));
        self.contexts.insert(handle, context.clone());
        debug!(world = %handle, map = map_name, "World context created");
        (handle, context)
    }

    /// Clean up and unregister a world context. Returns the actors it held.
    pub fn destroy_world_context(&self, handle: WorldHandle) -> RelatedWorldResult<Vec<ActorId>> {
        if handle == PERSISTENT_WORLD {
            return Err(RelatedWorldError::Internal("the persistent world cannot be destroyed".into()));
        }
        let (_, context) = self
            .contexts
            .remove(&handle)
            .ok_or_else(|| RelatedWorldError::NotFound(format!("world context {}", handle)))?;
        let removed = context.write().cleanup();
        for id in &removed {
            self.actor_index.remove(id);
        }
        debug!(world = %handle, actors = removed.len(), "World context destroyed");
        Ok(removed)
    }

    pub fn world_context_count(&self) -> usize {
        self.contexts.len()
    }

    pub fn world_handles(&self) -> Vec<WorldHandle> {
        let mut handles: Vec<WorldHandle> = self.contexts.iter().map(|c| *c.key()).collect();
        handles.sort_unstable();
        handles
    }

    /// The host's own world loop: ticks every context still flagged for it.
    pub fn tick_host_worlds(&self, delta_seconds: f64) -> Vec<(WorldHandle, FrameReport)> {
        let mut reports = Vec::new();
        for handle in self.world_handles() {
            if let Some(context) = self.context(handle) {
                let mut guard = context.write();
                if guard.should_tick {
                    reports.push((handle, guard.tick(delta_seconds)));
                }
            }
        }
        reports
    }

    pub fn set_intra_frame_debugging(&self, enabled: bool) {
        self.intra_frame_debugging.store(enabled, Ordering::Relaxed);
    }

    pub fn is_intra_frame_debugging(&self) -> bool {
        self.intra_frame_debugging.load(Ordering::Relaxed)
    }

    // --- Catalogs ---

    pub fn register_map(&self, asset: MapAsset) {
        self.maps.insert(asset.package.clone(), Arc::new(asset));
    }

    pub fn find_map(&self, package: &str) -> Option<Arc<MapAsset>> {
        self.maps.get(package).map(|m| m.value().clone())
    }

    pub fn register_class(&self, class: ActorClass) -> Arc<ActorClass> {
        let class = Arc::new(class);
        self.classes.insert(class.name.clone(), class.clone());
        class
    }

    pub fn find_class(&self, name: &str) -> Option<Arc<ActorClass>> {
        self.classes.get(name).map(|c| c.value().clone())
    }

    pub fn classes(&self) -> Vec<Arc<ActorClass>> {
        let mut all: Vec<Arc<ActorClass>> = self.classes.iter().map(|c| c.value().clone()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    // --- Actors ---

    pub fn spawn_actor(&self, handle: WorldHandle, params: &SpawnParams) -> RelatedWorldResult<ActorId> {
        let context = self
            .context(handle)
            .ok_or_else(|| RelatedWorldError::NotFound(format!("world context {}", handle)))?;
        let mut guard = context.write();
        if guard.is_destroyed() {
            return Err(RelatedWorldError::NotFound(format!("world context {}", handle)));
        }

        let location = resolve_spawn_location(&guard, params)?;
        let id = ActorId(self.next_actor_id.fetch_add(1, Ordering::Relaxed));
        let mut actor = Actor::new(id, handle, params);
        actor.transform.location = location;
        if guard.has_begun_play() {
            actor.begin_play();
        }
        let driver = guard.net_driver().cloned();
        guard.add_actor(actor);
        drop(guard);

        self.actor_index.insert(id, handle);
        if let Some(driver) = driver {
            if params.class.replicates && self.net_mode.is_server() {
                driver.add_network_actor(id);
            }
        }
        trace!(actor = %id, world = %handle, class = %params.class.name, "Actor spawned");
        Ok(id)
    }

    pub fn destroy_actor(&self, id: ActorId) -> bool {
        let Some((_, handle)) = self.actor_index.remove(&id) else {
            return false;
        };
        let Some(context) = self.context(handle) else {
            return false;
        };
        let mut guard = context.write();
        let driver = guard.net_driver().cloned();
        let Some(mut actor) = guard.remove_actor(id) else {
            return false;
        };
        drop(guard);
        actor.pending_kill = true;
        actor.end_play();
        if let Some(driver) = driver {
            driver.remove_network_actor(id, true);
        }
        true
    }

    pub fn actor_world(&self, id: ActorId) -> Option<WorldHandle> {
        self.actor_index.get(&id).map(|h| *h.value())
    }

    pub fn is_valid_actor(&self, id: ActorId) -> bool {
        self.with_actor(id, |a| a.is_valid()).unwrap_or(false)
    }

    /// Applied floating origin of the world the actor lives in.
    pub fn actor_origin(&self, id: ActorId) -> Option<IntVector> {
        let context = self.context(self.actor_world(id)?)?;
        let origin = context.read().origin_location();
        Some(origin)
    }

    pub fn actors_in(&self, handle: WorldHandle) -> Vec<ActorId> {
        self.context(handle).map(|c| c.read().actor_ids()).unwrap_or_default()
    }

    pub fn with_actor<R>(&self, id: ActorId, f: impl FnOnce(&Actor) -> R) -> Option<R> {
        let context = self.context(self.actor_world(id)?)?;
        let guard = context.read();
        guard.actor(id).map(f)
    }

    pub fn with_actor_mut<R>(&self, id: ActorId, f: impl FnOnce(&mut Actor) -> R) -> Option<R> {
        let context = self.context(self.actor_world(id)?)?;
        let mut guard = context.write();
        guard.actor_mut(id).map(f)
    }

    /// Move an actor into another world's container. Identity is kept; no
    /// copy is made.
    pub fn rename_actor(&self, id: ActorId, destination: WorldHandle) -> RelatedWorldResult<()> {
        let source = self.actor_world(id).ok_or(RelatedWorldError::InvalidActor(id))?;
        if source == destination {
            return Ok(());
        }
        let dest_context = self
            .context(destination)
            .ok_or_else(|| RelatedWorldError::NotFound(format!("world context {}", destination)))?;
        let source_context = self
            .context(source)
            .ok_or_else(|| RelatedWorldError::NotFound(format!("world context {}", source)))?;

        let mut actor = source_context
            .write()
            .remove_actor(id)
            .ok_or(RelatedWorldError::InvalidActor(id))?;
        actor.world = destination;

        let mut dest = dest_context.write();
        if dest.has_begun_play() && !actor.has_begun_play {
            actor.begin_play();
        }
        dest.add_actor(actor);
        drop(dest);

        self.actor_index.insert(id, destination);
        trace!(actor = %id, from = %source, to = %destination, "Actor renamed into new world");
        Ok(())
    }
}

fn resolve_spawn_location(context: &WorldContext, params: &SpawnParams) -> RelatedWorldResult<Vec3> {
    let desired = params.transform.location;
    if params.collision == SpawnCollisionHandling::AlwaysSpawn || !is_blocked(context, desired, params.class.collision_radius) {
        return Ok(desired);
    }
    let radius = params.class.collision_radius;
    let adjusted = match params.collision {
        SpawnCollisionHandling::AdjustIfPossibleButAlwaysSpawn
        | SpawnCollisionHandling::AdjustIfPossibleButDontSpawnIfColliding => {
            adjustment_candidates(desired, radius).find(|c| !is_blocked(context, *c, radius))
        }
        _ => None,
    };
    match (adjusted, params.collision) {
        (Some(location), _) => Ok(location),
        (None, SpawnCollisionHandling::AdjustIfPossibleButAlwaysSpawn) => Ok(desired),
        _ => {
            warn!(class = %params.class.name, world = %context.handle, "Spawn blocked by collision");
            Err(RelatedWorldError::SpawnBlocked(params.class.name.clone()))
        }
    }
}

fn is_blocked(context: &WorldContext, location: Vec3, radius: f64) -> bool {
    context.actors().any(|other| {
        let reach = radius + other.class.collision_radius;
        other.is_valid() && other.location().dist_squared(&location) < reach * reach
    })
}

/// Two rings of evenly spaced candidates around the desired location.
fn adjustment_candidates(desired: Vec3, radius: f64) -> impl Iterator<Item = Vec3> {
    (1..=2).flat_map(move |ring| {
        let distance = radius * 2.0 * ring as f64;
        (0..SPAWN_ADJUST_ATTEMPTS).map(move |k| {
            let angle = k as f64 * std::f64::consts::TAU / SPAWN_ADJUST_ATTEMPTS as f64;
            Vec3::new(desired.x + distance * angle.cos(), desired.y + distance * angle.sin(), desired.z)
        })
    })
}

// related_world_server/server/src/world/director.rs
//! Registry of related worlds, keyed by name and by context handle.
//!
//! One director lives for the whole server process and is handed to every
//! collaborator that needs it.

use crate::core::error::{RelatedWorldError, RelatedWorldResult};
use crate::core::types::{ActorId, NetMode, RelatedWorldName, Vec3, WorldDomain, WorldHandle, WorldTranslation};
use crate::entities::actor::SpawnParams;
use crate::network::correction::NetLocCorrectionComponent;
use crate::network::net_driver::NetConnection;
use crate::replication::node::{ActorView, ConnectionViewer, ReplicationView, WorldTag};
use crate::world::context::FrameReport;
use crate::world::engine::HostEngine;
use crate::world::events::{Multicast, WorldEvent, WorldEventQueue};
use crate::world::related_world::{RelatedWorld, Tickable, WorldResolver};
use crate::world::transform::{convert, OriginFrame};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MoveOutcome {
    Moved,
    /// An origin shift is pending on one side. Applied by
    /// [`WorldDirector::process_deferred_moves`].
    Deferred,
    AlreadyThere,
}

#[derive(Clone, Debug)]
struct DeferredMove {
    actor: ActorId,
    target: Option<RelatedWorldName>,
    translate_location: bool,
}

pub struct WorldDirector {
    engine: Arc<HostEngine>,
    worlds: DashMap<RelatedWorldName, Arc<RelatedWorld>>,
    by_handle: DashMap<WorldHandle, RelatedWorldName>,
    events: WorldEventQueue,
    pub on_world_event: Multicast<WorldEvent>,
    deferred: Mutex<VecDeque<DeferredMove>>,
}

impl WorldDirector {
    pub fn new(engine: Arc<HostEngine>) -> Self {
        WorldDirector {
            engine,
            worlds: DashMap::new(),
            by_handle: DashMap::new(),
            events: WorldEventQueue::new(),
            on_world_event: Multicast::new(),
            deferred: Mutex::new(VecDeque::new()),
        }
    }

    pub fn engine(&self) -> &Arc<HostEngine> {
        &self.engine
    }

    fn emit(&self, event: WorldEvent) {
        self.on_world_event.broadcast(&event);
        self.events.push(event);
    }

    pub fn drain_events(&self) -> Vec<WorldEvent> {
        self.events.drain()
    }

    // --- Creation ---

    /// Create an empty related world.
    pub fn create_world(
        &self,
        name: &str,
        translation: WorldTranslation,
        domain: WorldDomain,
        networked: bool,
    ) -> RelatedWorldResult<Arc<RelatedWorld>> {
        let rw = self.register_world(name, &format!("/Temp/{}", name), translation, domain, networked)?;
        self.finish_creation(&rw)?;
        Ok(rw)
    }

    /// Create a related world from a map in the host catalog and spawn the
    /// actors placed in it.
    pub fn load_world(
        &self,
        name: &str,
        map: &str,
        translation: WorldTranslation,
        domain: WorldDomain,
        networked: bool,
    ) -> RelatedWorldResult<Arc<RelatedWorld>> {
        let asset = self
            .engine
            .find_map(map)
            .ok_or_else(|| RelatedWorldError::NotFound(format!("map {}", map)))?;
        let rw = self.register_world(name, map, translation, domain, networked)?;
        for placed in &asset.actors {
            let Some(class) = self.engine.find_class(&placed.class) else {
                warn!(world = name, map, class = %placed.class, "Unknown class in map, actor skipped");
                continue;
            };
            let mut params = SpawnParams::new(class, placed.transform);
            params.name = placed.name.clone();
            if let Err(e) = rw.spawn_actor(&params) {
                warn!(world = name, map, error = %e, "Map actor failed to spawn");
            }
        }
        self.finish_creation(&rw)?;
        Ok(rw)
    }

    fn register_world(
        &self,
        name: &str,
        map: &str,
        translation: WorldTranslation,
        domain: WorldDomain,
        networked: bool,
    ) -> RelatedWorldResult<Arc<RelatedWorld>> {
        let key: RelatedWorldName = Arc::from(name);
        let rw = match self.worlds.entry(key.clone()) {
            Entry::Occupied(_) => {
                warn!(world = name, "Related world already exists");
                return Err(RelatedWorldError::AlreadyExists(name.to_string()));
            }
            Entry::Vacant(slot) => {
                let (handle, context) = self.engine.create_world_context(map);
                {
                    let mut guard = context.write();
                    guard.should_tick = false;
                    if networked {
                        guard.set_shared_net_driver(self.engine.persistent_net_driver());
                    }
                }
                let rw = RelatedWorld::new(key.clone(), self.engine.clone(), handle, context, translation, domain, networked);
                slot.insert(rw.clone());
                rw
            }
        };
        self.by_handle.insert(rw.handle(), key);
        Ok(rw)
    }

    fn finish_creation(&self, rw: &Arc<RelatedWorld>) -> RelatedWorldResult<()> {
        rw.begin_play()?;
        self.emit(WorldEvent::WorldLoaded { name: rw.name().clone(), handle: rw.handle() });
        gauge!("related_worlds_loaded").set(self.worlds.len() as f64);
        info!(
            world = %rw.name(),
            handle = %rw.handle(),
            translation = %rw.translation(),
            domain = %rw.domain(),
            networked = rw.is_networked(),
            "Related world loaded"
        );
        Ok(())
    }

    // --- Lookup ---

    pub fn get_related_world(&self, name: &str) -> Option<Arc<RelatedWorld>> {
        self.worlds.get(name).map(|w| w.value().clone())
    }

    /// `None` when the actor lives in the persistent world or is unknown.
    pub fn get_related_world_from_actor(&self, actor: ActorId) -> Option<Arc<RelatedWorld>> {
        let handle = self.engine.actor_world(actor)?;
        self.related_world_for_handle(handle)
    }

    pub fn world_names(&self) -> Vec<RelatedWorldName> {
        let mut names: Vec<RelatedWorldName> = self.worlds.iter().map(|w| w.key().clone()).collect();
        names.sort();
        names
    }

    pub fn world_count(&self) -> usize {
        self.worlds.len()
    }

    /// Every live world, in creation order.
    pub fn worlds(&self) -> Vec<Arc<RelatedWorld>> {
        let mut all: Vec<Arc<RelatedWorld>> = self.worlds.iter().map(|w| w.value().clone()).collect();
        all.sort_by_key(|w| w.handle());
        all
    }

    // --- Actors ---

    /// Spawn into `world`, or into the persistent world when `None`.
    pub fn spawn_actor(&self, world: Option<&Arc<RelatedWorld>>, params: &SpawnParams) -> RelatedWorldResult<ActorId> {
        match world {
            Some(rw) => rw.spawn_actor(params),
            None => self.engine.spawn_actor(self.engine.persistent_handle(), params),
        }
    }

    /// Move `actor` into `target` (`None` is the persistent world). Returns
    /// false when the actor is invalid or the destination is gone.
    pub fn move_actor_to_world(&self, target: Option<&Arc<RelatedWorld>>, actor: ActorId, translate_location: bool) -> bool {
        match self.try_move_actor_to_world(target, actor, translate_location) {
            Ok(_) => true,
            Err(e) => {
                warn!(%actor, error = %e, "Move to world rejected");
                false
            }
        }
    }

    pub fn try_move_actor_to_world(
        &self,
        target: Option<&Arc<RelatedWorld>>,
        actor: ActorId,
        translate_location: bool,
    ) -> RelatedWorldResult<MoveOutcome> {
        if !self.engine.is_valid_actor(actor) {
            return Err(RelatedWorldError::InvalidActor(actor));
        }
        if let Some(rw) = target {
            if !rw.is_alive() || !self.by_handle.contains_key(&rw.handle()) {
                return Err(RelatedWorldError::NotFound(format!("related world {}", rw.name())));
            }
        }
        let source = self.engine.actor_world(actor).ok_or(RelatedWorldError::InvalidActor(actor))?;
        let destination = target.map_or(self.engine.persistent_handle(), |rw| rw.handle());
        if source == destination {
            return Ok(MoveOutcome::AlreadyThere);
        }

        if self.has_pending_origin_shift(source) || self.has_pending_origin_shift(destination) {
            self.deferred.lock().push_back(DeferredMove {
                actor,
                target: target.map(|rw| rw.name().clone()),
                translate_location,
            });
            counter!("deferred_world_moves_total").increment(1);
            debug!(%actor, from = %source, to = %destination, "Origin shift pending, world move deferred");
            return Ok(MoveOutcome::Deferred);
        }

        let source_world = self.related_world_for_handle(source);

        // 1. Network ownership through the shared driver.
        let replicates = self.engine.with_actor(actor, |a| a.class.replicates).unwrap_or(false);
        if replicates && self.engine.net_mode().is_server() {
            if let Some(driver) = self.engine.persistent_net_driver() {
                let was_networked = source_world.as_ref().map_or(true, |rw| rw.is_networked());
                let will_be_networked = target.map_or(true, |rw| rw.is_networked());
                match (was_networked, will_be_networked) {
                    (true, false) => {
                        driver.remove_network_actor(actor, true);
                    }
                    (false, true) => {
                        driver.add_network_actor(actor);
                    }
                    _ => {}
                }
            }
        }

        // 2. Location, read both frames before taking the actor's lock.
        if translate_location {
            let from = self.frame_for_handle(source);
            let to = self.frame_for_handle(destination);
            self.engine.with_actor_mut(actor, |a| {
                let location = convert(from, to, a.location());
                a.set_location(location);
                if let Some(target) = a.root.as_mut().and_then(|r| r.rigid_body_target.as_mut()) {
                    target.position = convert(from, to, target.position);
                }
            });
        }

        // 3. Correction component follows the new owner.
        let attach = self.engine.net_mode() == NetMode::DedicatedServer && target.map_or(false, |rw| rw.is_networked());
        // Listeners run once the actor's context lock is released.
        let world_changed = self
            .engine
            .with_actor_mut(actor, |a| match a.correction.as_mut() {
                Some(component) => Some(component.track_world_change(target)),
                None if attach => {
                    let mut component = NetLocCorrectionComponent::new();
                    let changed = component.track_world_change(target);
                    a.correction = Some(component);
                    Some(changed)
                }
                None => None,
            })
            .flatten();

        // 4. Reparent, identity preserved.
        let renamed = self.engine.rename_actor(actor, destination);
        if let Some(changed) = world_changed {
            changed.deliver();
        }
        renamed?;

        let from = source_world.map(|rw| rw.name().clone());
        let to = target.map(|rw| rw.name().clone());
        debug!(%actor, from = ?from, to = ?to, translate_location, "Actor moved between worlds");
        self.emit(WorldEvent::ActorChangedWorld { actor, from, to });
        Ok(MoveOutcome::Moved)
    }

    fn has_pending_origin_shift(&self, handle: WorldHandle) -> bool {
        self.engine
            .context(handle)
            .map_or(false, |c| c.read().has_pending_origin_shift())
    }

    pub fn deferred_move_count(&self) -> usize {
        self.deferred.lock().len()
    }

    /// Retry moves deferred by origin shifts. Returns how many completed.
    pub fn process_deferred_moves(&self) -> usize {
        let batch = std::mem::take(&mut *self.deferred.lock());
        let mut completed = 0;
        for pending in batch {
            let target = match &pending.target {
                Some(name) => match self.get_related_world(name) {
                    Some(rw) => Some(rw),
                    None => {
                        warn!(actor = %pending.actor, world = %name, "Deferred move target unloaded, dropped");
                        continue;
                    }
                },
                None => None,
            };
            match self.try_move_actor_to_world(target.as_ref(), pending.actor, pending.translate_location) {
                Ok(MoveOutcome::Moved) | Ok(MoveOutcome::AlreadyThere) => completed += 1,
                Ok(MoveOutcome::Deferred) => {}
                Err(e) => warn!(actor = %pending.actor, error = %e, "Deferred move failed"),
            }
        }
        completed
    }

    // --- Unloading ---

    pub fn unload_world(&self, name: &str) -> RelatedWorldResult<()> {
        let rw = self
            .get_related_world(name)
            .ok_or_else(|| RelatedWorldError::NotFound(format!("related world {}", name)))?;
        self.unload_world_handle(&rw)
    }

    /// Full teardown: driver, actors, context, registry, in that order.
    pub fn unload_world_handle(&self, rw: &Arc<RelatedWorld>) -> RelatedWorldResult<()> {
        if !self.by_handle.contains_key(&rw.handle()) {
            return Err(RelatedWorldError::NotFound(format!("related world {}", rw.name())));
        }
        let actors = rw.actor_ids();
        if rw.is_networked() {
            if let Some(driver) = self.engine.persistent_net_driver() {
                for actor in &actors {
                    driver.remove_network_actor(*actor, true);
                }
            }
        }
        let destroyed = self.engine.destroy_world_context(rw.handle())?;
        rw.teardown();
        self.by_handle.remove(&rw.handle());
        self.worlds.remove(rw.name());
        self.deferred
            .lock()
            .retain(|m| m.target.as_ref() != Some(rw.name()) && !destroyed.contains(&m.actor));

        self.emit(WorldEvent::WorldUnloaded { name: rw.name().clone(), handle: rw.handle() });
        gauge!("related_worlds_loaded").set(self.worlds.len() as f64);
        info!(world = %rw.name(), actors = destroyed.len(), "Related world unloaded");
        Ok(())
    }

    pub fn unload_all_worlds(&self) -> usize {
        let mut unloaded = 0;
        for rw in self.worlds().into_iter().rev() {
            match self.unload_world_handle(&rw) {
                Ok(()) => unloaded += 1,
                Err(e) => warn!(world = %rw.name(), error = %e, "Unload failed"),
            }
        }
        unloaded
    }

    // --- Ticking ---

    /// Drive every tickable related world one frame, in creation order.
    pub fn tick_worlds(&self, delta_seconds: f64) -> Vec<(RelatedWorldName, FrameReport)> {
        self.worlds()
            .into_iter()
            .filter(|rw| rw.is_tickable())
            .map(|rw| {
                let report = rw.tick(delta_seconds);
                (rw.name().clone(), report)
            })
            .collect()
    }

    /// Translate a world and queue the matching event.
    pub fn translate_world(&self, name: &str, translation: WorldTranslation) -> RelatedWorldResult<()> {
        let rw = self
            .get_related_world(name)
            .ok_or_else(|| RelatedWorldError::NotFound(format!("related world {}", name)))?;
        if rw.translation() == translation {
            return Ok(());
        }
        rw.translate(translation);
        self.emit(WorldEvent::WorldTranslated { name: rw.name().clone(), translation });
        Ok(())
    }

    // --- Conversions ---

    /// Frame of a world context: its translation and applied origin.
    pub fn frame_for_handle(&self, handle: WorldHandle) -> OriginFrame {
        let translation = self
            .related_world_for_handle(handle)
            .map(|rw| rw.translation())
            .unwrap_or_default();
        let origin = self
            .engine
            .context(handle)
            .map(|c| c.read().origin_location())
            .unwrap_or_default();
        OriginFrame::new(translation, origin)
    }

    fn frame_for_world(&self, world: Option<&Arc<RelatedWorld>>) -> OriginFrame {
        match world {
            Some(rw) => OriginFrame::new(rw.translation(), rw.origin()),
            None => self.frame_for_handle(self.engine.persistent_handle()),
        }
    }

    /// Actor location in the persistent world's local frame.
    pub fn actor_location_to_world_location(&self, actor: ActorId) -> Option<Vec3> {
        let handle = self.engine.actor_world(actor)?;
        let location = self.engine.with_actor(actor, |a| a.location())?;
        let from = self.frame_for_handle(handle);
        let to = self.frame_for_world(None);
        Some(convert(from, to, location))
    }

    pub fn related_location_to_world_location(&self, world: &Arc<RelatedWorld>, location: Vec3) -> Vec3 {
        convert(self.frame_for_world(Some(world)), self.frame_for_world(None), location)
    }

    pub fn world_location_to_related_location(&self, world: &Arc<RelatedWorld>, location: Vec3) -> Vec3 {
        convert(self.frame_for_world(None), self.frame_for_world(Some(world)), location)
    }

    pub fn related_location_to_related_location(
        &self,
        from: Option<&Arc<RelatedWorld>>,
        to: Option<&Arc<RelatedWorld>>,
        location: Vec3,
    ) -> Vec3 {
        convert(self.frame_for_world(from), self.frame_for_world(to), location)
    }

    fn world_tag(&self, handle: WorldHandle) -> Option<WorldTag> {
        self.related_world_for_handle(handle)
            .map(|rw| WorldTag { name: rw.name().clone(), domain: rw.domain() })
    }

    /// Viewer for one connection, placed at its view target (or player
    /// controller) in the common frame.
    pub fn connection_viewer(&self, connection: &NetConnection) -> ConnectionViewer {
        let focus = connection.view_target.or(connection.player_controller);
        let view = focus.and_then(|id| self.actor_view(id));
        ConnectionViewer {
            connection: connection.id,
            parent: connection.parent,
            location: view.as_ref().map_or(Vec3::ZERO, |v| v.common_location),
            world: view.and_then(|v| v.world),
        }
    }
}

impl WorldResolver for WorldDirector {
    fn related_world_for_handle(&self, handle: WorldHandle) -> Option<Arc<RelatedWorld>> {
        let name = self.by_handle.get(&handle)?.value().clone();
        self.get_related_world(&name).filter(|rw| rw.is_alive())
    }
}

impl ReplicationView for WorldDirector {
    fn actor_view(&self, actor: ActorId) -> Option<ActorView> {
        let handle = self.engine.actor_world(actor)?;
        let (class, owner, net_connection, pending_kill, location) = self
            .engine
            .with_actor(actor, |a| (a.class.clone(), a.owner, a.net_connection, a.pending_kill, a.location()))?;
        let frame = self.frame_for_handle(handle);
        Some(ActorView {
            id: actor,
            class,
            owner,
            net_connection,
            pending_kill,
            common_location: convert(frame, OriginFrame::ABSOLUTE, location),
            world: self.world_tag(handle),
        })
    }
}

// related_world_server/server/src/world/context.rs
//! Host world-context model: the actor container, frame timing, floating
//! origin and the ordered tick stages a world runs each frame.

use crate::core::constants::{MAX_TIME_DILATION, MAX_UNDILATED_FRAME_TIME_SECS, MIN_TIME_DILATION};
use crate::core::types::{ActorId, IntVector, NetMode, WorldHandle};
use crate::entities::actor::Actor;
use crate::network::net_driver::NetDriver;
use ahash::AHashMap;
use smallvec::SmallVec;
use std::sync::Arc;
use tracing::{debug, trace};

/// Stages of a single world frame, in execution order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TickStage {
    NetDispatch,
    OriginShift,
    Timing,
    Navigation,
    Streaming,
    PrePhysics,
    StartPhysics,
    DuringPhysics,
    EndPhysics,
    PostPhysics,
    PostUpdateWork,
    LastDemotable,
    Fx,
    SceneCapture,
    NetFlush,
}

impl TickStage {
    pub const ACTOR_GROUPS: [TickStage; 7] = [
        TickStage::PrePhysics,
        TickStage::StartPhysics,
        TickStage::DuringPhysics,
        TickStage::EndPhysics,
        TickStage::PostPhysics,
        TickStage::PostUpdateWork,
        TickStage::LastDemotable,
    ];
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickSkip {
    DebugBreak,
    Reentrant,
    TornDown,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FrameReport {
    pub frame: u64,
    pub delta_seconds: f64,
    pub stages: SmallVec<[TickStage; 16]>,
    pub skipped: Option<TickSkip>,
    pub origin_shift: Option<IntVector>,
}

impl FrameReport {
    pub fn skipped(reason: TickSkip) -> Self {
        FrameReport { skipped: Some(reason), ..Default::default() }
    }

    pub fn ran(&self, stage: TickStage) -> bool {
        self.stages.contains(&stage)
    }
}

/// Per-world settings the host keeps on its world-settings actor.
#[derive(Clone, Debug, PartialEq)]
pub struct WorldSettings {
    pub time_dilation: f64,
    pub max_undilated_frame_time: f64,
    pub enable_world_origin_rebasing: bool,
    pub begun_play_notified: bool,
}

impl Default for WorldSettings {
    fn default() -> Self {
        WorldSettings {
            time_dilation: 1.0,
            max_undilated_frame_time: MAX_UNDILATED_FRAME_TIME_SECS,
            enable_world_origin_rebasing: true,
            begun_play_notified: false,
        }
    }
}

impl WorldSettings {
    pub fn effective_time_dilation(&self) -> f64 {
        self.time_dilation.clamp(MIN_TIME_DILATION, MAX_TIME_DILATION)
    }

    /// Clamp a dilated delta so one long frame can't explode the simulation.
    pub fn fixup_delta_seconds(&self, dilated: f64, real: f64) -> f64 {
        let max = self.max_undilated_frame_time * self.effective_time_dilation();
        if real > self.max_undilated_frame_time {
            dilated.min(max)
        } else {
            dilated
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct StreamingLevel {
    pub package: String,
    pub loaded: bool,
    pub should_be_visible: bool,
    pub visible: bool,
}

/// World-scoped system ticked at a fixed stage.
pub trait WorldSubsystem: Send + Sync {
    fn name(&self) -> &str;
    fn stage(&self) -> TickStage;
    fn tick(&mut self, actors: &mut AHashMap<ActorId, Actor>, delta_seconds: f64);
}

pub struct WorldContext {
    pub handle: WorldHandle,
    pub map_name: String,
    pub net_mode: NetMode,
    pub settings: WorldSettings,

    actors: AHashMap<ActorId, Actor>,

    origin_location: IntVector,
    requested_origin_location: IntVector,
    origin_offset_this_frame: bool,

    pub time_seconds: f64,
    pub unpaused_time_seconds: f64,
    pub real_time_seconds: f64,
    pub delta_seconds: f64,
    pub frame_number: u64,

    pub paused: bool,
    pub players_only: bool,
    pub players_only_pending: bool,

    net_driver: Option<Arc<NetDriver>>,
    owns_net_driver: bool,

    /// Ticked by the host's own world loop. Related worlds clear this.
    pub should_tick: bool,
    in_tick: bool,
    begun_play: bool,
    destroyed: bool,

    pub streaming_levels: Vec<StreamingLevel>,
    subsystems: Vec<Box<dyn WorldSubsystem>>,
}

impl std::fmt::Debug for WorldContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorldContext")
            .field("handle", &self.handle)
            .field("map_name", &self.map_name)
            .field("actors", &self.actors.len())
            .field("origin_location", &self.origin_location)
            .field("frame_number", &self.frame_number)
            .finish()
    }
}

impl WorldContext {
    pub fn new(handle: WorldHandle, map_name: impl Into<String>, net_mode: NetMode) -> Self {
        WorldContext {
            handle,
            map_name: map_name.into(),
            net_mode,
            settings: WorldSettings::default(),
            actors: AHashMap::new(),
            origin_location: IntVector::ZERO,
            requested_origin_location: IntVector::ZERO,
            origin_offset_this_frame: false,
            time_seconds: 0.0,
            unpaused_time_seconds: 0.0,
            real_time_seconds: 0.0,
            delta_seconds: 0.0,
            frame_number: 0,
            paused: false,
            players_only: false,
            players_only_pending: false,
            net_driver: None,
            owns_net_driver: false,
            should_tick: true,
            in_tick: false,
            begun_play: false,
            destroyed: false,
            streaming_levels: Vec::new(),
            subsystems: Vec::new(),
        }
    }

    // --- Net driver ---

    pub fn set_owned_net_driver(&mut self, driver: Arc<NetDriver>) {
        self.net_driver = Some(driver);
        self.owns_net_driver = true;
    }

    /// Share another world's driver. Only the owner dispatches and flushes it.
    pub fn set_shared_net_driver(&mut self, driver: Option<Arc<NetDriver>>) {
        self.net_driver = driver;
        self.owns_net_driver = false;
    }

    pub fn net_driver(&self) -> Option<&Arc<NetDriver>> {
        self.net_driver.as_ref()
    }

    pub fn is_networked(&self) -> bool {
        self.net_driver.is_some()
    }

    // --- Actors ---

    pub fn add_actor(&mut self, actor: Actor) {
        self.actors.insert(actor.id, actor);
    }

    pub fn remove_actor(&mut self, id: ActorId) -> Option<Actor> {
        self.actors.remove(&id)
    }

    pub fn actor(&self, id: ActorId) -> Option<&Actor> {
        self.actors.get(&id)
    }

    pub fn actor_mut(&mut self, id: ActorId) -> Option<&mut Actor> {
        self.actors.get_mut(&id)
    }

    pub fn actors(&self) -> impl Iterator<Item = &Actor> {
        self.actors.values()
    }

    pub fn actors_mut(&mut self) -> impl Iterator<Item = &mut Actor> {
        self.actors.values_mut()
    }

    pub fn actor_ids(&self) -> Vec<ActorId> {
        let mut ids: Vec<ActorId> = self.actors.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn actor_count(&self) -> usize {
        self.actors.len()
    }

    pub fn add_subsystem(&mut self, subsystem: Box<dyn WorldSubsystem>) {
        self.subsystems.push(subsystem);
    }

    // --- Floating origin ---

    pub fn origin_location(&self) -> IntVector {
        self.origin_location
    }

    pub fn requested_origin_location(&self) -> IntVector {
        self.requested_origin_location
    }

    pub fn has_pending_origin_shift(&self) -> bool {
        self.requested_origin_location != self.origin_location
    }

    pub fn origin_offset_this_frame(&self) -> bool {
        self.origin_offset_this_frame
    }

    /// Ask for a floating-origin shift. Applied at the start of the next frame.
    pub fn request_origin_shift(&mut self, origin: IntVector) {
        self.requested_origin_location = origin;
    }

    /// Move the world origin now, shifting every actor so absolute positions
    /// are unchanged. Returns false when the origin is already there.
    pub fn set_new_world_origin(&mut self, new_origin: IntVector) -> bool {
        if new_origin == self.origin_location {
            return false;
        }
        if !self.settings.enable_world_origin_rebasing {
            self.requested_origin_location = self.origin_location;
            return false;
        }
        let offset = (new_origin - self.origin_location).to_vec3();
        for actor in self.actors.values_mut() {
            actor.transform.location -= offset;
            if let Some(target) = actor.root.as_mut().and_then(|r| r.rigid_body_target.as_mut()) {
                target.position -= offset;
            }
        }
        debug!(world = %self.handle, from = %self.origin_location, to = %new_origin, "World origin shifted");
        self.origin_location = new_origin;
        self.requested_origin_location = new_origin;
        self.origin_offset_this_frame = true;
        true
    }

    // --- Lifecycle ---

    pub fn has_begun_play(&self) -> bool {
        self.begun_play
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn is_in_tick(&self) -> bool {
        self.in_tick
    }

    pub fn begin_play(&mut self) {
        if self.begun_play {
            return;
        }
        self.settings.begun_play_notified = true;
        for actor in self.actors.values_mut() {
            actor.begin_play();
        }
        self.begun_play = true;
        debug!(world = %self.handle, map = %self.map_name, actors = self.actors.len(), "World begun play");
    }

    /// End play for every actor and drop them. Returns the ids that were removed.
    pub fn cleanup(&mut self) -> Vec<ActorId> {
        let ids = self.actor_ids();
        for actor in self.actors.values_mut() {
            actor.pending_kill = true;
            actor.end_play();
        }
        self.actors.clear();
        self.subsystems.clear();
        self.streaming_levels.clear();
        self.net_driver = None;
        self.owns_net_driver = false;
        self.begun_play = false;
        self.destroyed = true;
        ids
    }

    // --- Frame ---

    /// Run one frame in host order.
    pub fn tick(&mut self, real_delta_seconds: f64) -> FrameReport {
        if self.destroyed {
            return FrameReport::skipped(TickSkip::TornDown);
        }
        if self.in_tick {
            return FrameReport::skipped(TickSkip::Reentrant);
        }
        self.in_tick = true;
        self.frame_number += 1;
        self.origin_offset_this_frame = false;

        let mut report = FrameReport { frame: self.frame_number, ..Default::default() };

        if self.owns_net_driver {
            if let Some(driver) = &self.net_driver {
                driver.tick_dispatch(real_delta_seconds);
            }
            report.stages.push(TickStage::NetDispatch);
        }

        if self.has_pending_origin_shift() {
            let target = self.requested_origin_location;
            if self.set_new_world_origin(target) {
                report.origin_shift = Some(target);
            }
            report.stages.push(TickStage::OriginShift);
        }

        let delta = self.update_time(real_delta_seconds);
        report.delta_seconds = delta;
        report.stages.push(TickStage::Timing);

        if self.players_only_pending {
            self.players_only = true;
            self.players_only_pending = false;
        }

        let should_tick_actors = !self.paused;
        if should_tick_actors && !self.players_only {
            self.run_subsystems(TickStage::Navigation, delta);
            report.stages.push(TickStage::Navigation);
        }

        self.update_level_streaming();
        report.stages.push(TickStage::Streaming);

        if should_tick_actors {
            for stage in TickStage::ACTOR_GROUPS {
                self.run_tick_group(stage, delta);
                report.stages.push(stage);
            }
        } else {
            trace!(world = %self.handle, "Paused, actor tick groups skipped");
        }

        self.run_subsystems(TickStage::Fx, delta);
        report.stages.push(TickStage::Fx);
        self.run_subsystems(TickStage::SceneCapture, delta);
        report.stages.push(TickStage::SceneCapture);

        if self.owns_net_driver {
            if let Some(driver) = &self.net_driver {
                driver.tick_flush(real_delta_seconds);
            }
            report.stages.push(TickStage::NetFlush);
        }

        self.in_tick = false;
        report
    }

    fn update_time(&mut self, real_delta_seconds: f64) -> f64 {
        let dilated = real_delta_seconds * self.settings.effective_time_dilation();
        let delta = self.settings.fixup_delta_seconds(dilated, real_delta_seconds);
        self.real_time_seconds += real_delta_seconds;
        self.delta_seconds = delta;
        if !self.paused {
            self.time_seconds += delta;
            self.unpaused_time_seconds += delta;
        }
        delta
    }

    fn update_level_streaming(&mut self) {
        for level in &mut self.streaming_levels {
            level.visible = level.loaded && level.should_be_visible;
        }
    }

    fn run_tick_group(&mut self, stage: TickStage, delta: f64) {
        if stage == TickStage::DuringPhysics {
            self.integrate_movement(delta);
        }
        self.run_subsystems(stage, delta);
    }

    /// Kinematic actors integrate velocity; simulated bodies snap to a pending
    /// rigid-body target.
    fn integrate_movement(&mut self, delta: f64) {
        let players_only = self.players_only;
        for actor in self.actors.values_mut() {
            if actor.pending_kill || (players_only && actor.controller.is_none()) {
                continue;
            }
            let simulating = actor.is_simulating_physics();
            if let Some(root) = actor.root.as_mut() {
                if simulating {
                    if let Some(target) = root.rigid_body_target.as_mut() {
                        if target.needs_update {
                            target.needs_update = false;
                            actor.transform.location = target.position;
                            actor.transform.rotation = target.rotation;
                            actor.velocity = target.linear_velocity;
                        }
                    }
                    continue;
                }
                if root.attached_to_parent {
                    continue;
                }
            }
            if !actor.velocity.is_zero() {
                actor.transform.location += actor.velocity * delta;
            }
        }
    }

    fn run_subsystems(&mut self, stage: TickStage, delta: f64) {
        let actors = &mut self.actors;
        for subsystem in self.subsystems.iter_mut().filter(|s| s.stage() == stage) {
            subsystem.tick(actors, delta);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Vec3;
    use crate::entities::actor::{ActorClass, SpawnParams};

    fn context_with_actor(location: Vec3) -> WorldContext {
        let mut ctx = WorldContext::new(WorldHandle(2), "/Game/Maps/Test", NetMode::DedicatedServer);
        let params = SpawnParams::at(Arc::new(ActorClass::new("Crate")), location);
        ctx.add_actor(Actor::new(ActorId(1), ctx.handle, &params));
        ctx
    }

    #[test]
    fn origin_shift_waits_for_next_frame() {
        let mut ctx = context_with_actor(Vec3::new(500.0, 0.0, 0.0));
        ctx.request_origin_shift(IntVector::new(200, 0, 0));
        assert!(ctx.has_pending_origin_shift());
        assert_eq!(ctx.actor(ActorId(1)).map(|a| a.location()), Some(Vec3::new(500.0, 0.0, 0.0)));

        let report = ctx.tick(1.0 / 30.0);
        assert_eq!(report.origin_shift, Some(IntVector::new(200, 0, 0)));
        assert!(!ctx.has_pending_origin_shift());
        assert!(ctx.origin_offset_this_frame());
        assert_eq!(ctx.actor(ActorId(1)).map(|a| a.location()), Some(Vec3::new(300.0, 0.0, 0.0)));
    }

    #[test]
    fn stages_run_in_host_order() {
        let mut ctx = context_with_actor(Vec3::ZERO);
        let report = ctx.tick(0.016);
        let expected = [
            TickStage::Timing,
            TickStage::Navigation,
            TickStage::Streaming,
            TickStage::PrePhysics,
            TickStage::StartPhysics,
            TickStage::DuringPhysics,
            TickStage::EndPhysics,
            TickStage::PostPhysics,
            TickStage::PostUpdateWork,
            TickStage::LastDemotable,
            TickStage::Fx,
            TickStage::SceneCapture,
        ];
        assert_eq!(report.stages.as_slice(), &expected);
        let mut sorted = report.stages.clone();
        sorted.sort();
        assert_eq!(sorted, report.stages);
    }

    #[test]
    fn long_frames_are_clamped_and_pause_freezes_game_time() {
        let mut ctx = context_with_actor(Vec3::ZERO);
        let report = ctx.tick(2.0);
        assert!((report.delta_seconds - MAX_UNDILATED_FRAME_TIME_SECS).abs() < 1e-9);
        assert!((ctx.real_time_seconds - 2.0).abs() < 1e-9);

        ctx.paused = true;
        let before = ctx.time_seconds;
        let report = ctx.tick(0.1);
        assert_eq!(ctx.time_seconds, before);
        assert!(!report.ran(TickStage::DuringPhysics));
    }

    #[test]
    fn kinematic_actors_integrate_velocity() {
        let mut ctx = context_with_actor(Vec3::ZERO);
        if let Some(actor) = ctx.actor_mut(ActorId(1)) {
            actor.velocity = Vec3::new(10.0, 0.0, 0.0);
        }
        ctx.tick(0.25);
        assert_eq!(ctx.actor(ActorId(1)).map(|a| a.location()), Some(Vec3::new(2.5, 0.0, 0.0)));
    }

    #[test]
    fn cleanup_marks_destroyed_and_skips_later_ticks() {
        let mut ctx = context_with_actor(Vec3::ZERO);
        ctx.begin_play();
        assert_eq!(ctx.cleanup(), vec![ActorId(1)]);
        assert!(ctx.is_destroyed());
        assert_eq!(ctx.tick(0.1).skipped, Some(TickSkip::TornDown));
    }
}

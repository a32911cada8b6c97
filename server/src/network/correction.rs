// related_world_server/server/src/network/correction.rs
//! Per-actor location correction across related-world boundaries.
//!
//! Wire conventions:
//! * replicated movement travels in the owning related world's frame
//!   (zero origin) and is rebased by the receiving client;
//! * movement RPCs travel in the persistent world's zero-origin frame and
//!   are rebased by the server on both send and receive.

use crate::core::types::{IntVector, RelatedWorldName, Vec3, WorldHandle};
use crate::entities::actor::Actor;
use crate::world::events::{Multicast, PreparedBroadcast, SubscriptionId};
use crate::world::related_world::{RelatedWorld, WorldResolver};
use crate::world::transform::{convert, rel_to_rel, rel_to_world, OriginFrame};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CorrectionState {
    Uninitialized,
    /// Actor lives in the persistent world. Nothing to rebase.
    Untracked,
    Tracking { world: RelatedWorldName },
    TornDown,
}

#[derive(Debug)]
pub struct NetLocCorrectionComponent {
    state: CorrectionState,
    world: Weak<RelatedWorld>,
    subscription: Option<SubscriptionId>,
    translation_dirty: Arc<AtomicBool>,
    replicated_translation: IntVector,
    needs_correction: bool,
    initial_replication_done: bool,
    pub on_related_world_changed: Multicast<Option<RelatedWorldName>>,
    pub on_translation_changed: Multicast<IntVector>,
}

impl Default for NetLocCorrectionComponent {
    fn default() -> Self {
        Self::new()
    }
}

impl NetLocCorrectionComponent {
    pub fn new() -> Self {
        NetLocCorrectionComponent {
            state: CorrectionState::Uninitialized,
            world: Weak::new(),
            subscription: None,
            translation_dirty: Arc::new(AtomicBool::new(false)),
            replicated_translation: IntVector::ZERO,
            needs_correction: false,
            initial_replication_done: false,
            on_related_world_changed: Multicast::new(),
            on_translation_changed: Multicast::new(),
        }
    }

    pub fn state(&self) -> &CorrectionState {
        &self.state
    }

    pub fn is_tracking(&self) -> bool {
        matches!(self.state, CorrectionState::Tracking { .. })
    }

    pub fn needs_correction(&self) -> bool {
        self.needs_correction
    }

    /// Translation snapshot as last replicated (server) or received (client).
    pub fn replicated_translation(&self) -> IntVector {
        self.replicated_translation
    }

    /// The tracked world, if it is still alive.
    pub fn related_world(&self) -> Option<Arc<RelatedWorld>> {
        if !self.is_tracking() {
            return None;
        }
        self.world.upgrade().filter(|w| w.is_alive())
    }

    /// Current translation of the tracked world. `None` means skip rebasing.
    pub fn live_translation(&self) -> Option<IntVector> {
        self.related_world().map(|w| w.translation())
    }

    pub fn initialize(&mut self, resolver: &dyn WorldResolver, handle: WorldHandle) {
        let world = resolver.related_world_for_handle(handle);
        self.track(world.as_ref());
        trace!(state = ?self.state, "Correction component initialized");
    }

    /// Owning world changed. Drops the old subscription and starts tracking
    /// the new world, if any.
    pub fn notify_world_changed(&mut self, world: Option<&Arc<RelatedWorld>>) {
        self.track_world_change(world).deliver();
    }

    /// Same as `notify_world_changed`, but `on_related_world_changed` fires
    /// only when the returned broadcast is delivered.
    pub fn track_world_change(&mut self, world: Option<&Arc<RelatedWorld>>) -> PreparedBroadcast<Option<RelatedWorldName>> {
        self.track(world);
        self.translation_dirty.store(true, Ordering::Relaxed);
        let name = match &self.state {
            CorrectionState::Tracking { world } => Some(world.clone()),
            _ => None,
        };
        self.on_related_world_changed.prepare(name)
    }

    fn track(&mut self, world: Option<&Arc<RelatedWorld>>) {
        self.stop_tracking();
        match world.filter(|w| w.is_alive()) {
            Some(world) => {
                let dirty = self.translation_dirty.clone();
                self.subscription = Some(world.subscribe_translation(move |_| {
                    dirty.store(true, Ordering::Relaxed);
                }));
                self.world = Arc::downgrade(world);
                self.replicated_translation = world.translation();
                self.needs_correction = true;
                self.state = CorrectionState::Tracking { world: world.name().clone() };
            }
            None => {
                self.replicated_translation = IntVector::ZERO;
                self.needs_correction = false;
                self.state = CorrectionState::Untracked;
            }
        }
    }

    fn stop_tracking(&mut self) {
        if let Some(id) = self.subscription.take() {
            if let Some(world) = self.world.upgrade() {
                world.unsubscribe_translation(id);
            }
        }
        self.world = Weak::new();
    }

    /// Authority side, once per replication pass. Returns true when the
    /// replicated snapshot must be sent.
    pub fn pre_replication(&mut self) -> bool {
        let dirty = self.translation_dirty.swap(false, Ordering::Relaxed);
        if !self.is_tracking() {
            return dirty;
        }
        let Some(world) = self.related_world() else {
            warn!(state = ?self.state, "Tracked related world is gone, correction disabled");
            self.stop_tracking();
            self.state = CorrectionState::Untracked;
            self.needs_correction = false;
            self.replicated_translation = IntVector::ZERO;
            return true;
        };
        let live = world.translation();
        if live != self.replicated_translation {
            debug!(world = %world.name(), from = %self.replicated_translation, to = %live, "Replicated translation updated");
            self.replicated_translation = live;
            self.on_translation_changed.broadcast(&live);
            return true;
        }
        dirty
    }

    /// Client side: a new snapshot arrived. Returns the previous snapshot.
    pub fn receive_replicated_translation(&mut self, translation: IntVector) -> IntVector {
        let previous = self.replicated_translation;
        self.replicated_translation = translation;
        self.needs_correction = true;
        if previous != translation {
            self.on_translation_changed.broadcast(&translation);
        }
        previous
    }

    pub fn uninitialize(&mut self) {
        self.stop_tracking();
        self.state = CorrectionState::TornDown;
        self.needs_correction = false;
        self.on_related_world_changed.clear();
        self.on_translation_changed.clear();
    }

    fn take_initial_replication(&mut self) -> bool {
        !std::mem::replace(&mut self.initial_replication_done, true)
    }
}

/// Client: the actor's replicated translation changed. Cached movement is
/// moved into the new frame and re-applied so the rendered position does not
/// jump. Returns an origin to request for a locally controlled pawn.
pub fn on_rep_world_translation(actor: &mut Actor, translation: IntVector, client_origin: IntVector) -> Option<IntVector> {
    let component = actor.correction.as_mut()?;
    let previous = component.receive_replicated_translation(translation);

    let mut cached = actor.replicated_movement;
    cached.location = rel_to_rel(previous, translation, cached.location);
    actor.replicated_movement = cached;

    let location = convert(OriginFrame::related(translation), OriginFrame::persistent(client_origin), cached.location);
    apply_client_location(actor, location);

    if actor.locally_controlled && translation != client_origin {
        debug!(actor = %actor.id, origin = %translation, "Locally controlled pawn requests origin shift");
        return Some(translation);
    }
    None
}

/// Client: first replication of an actor. Simulated or zero-placed actors are
/// offset by the replicated translation.
pub fn on_rep_initial(actor: &mut Actor) {
    let Some(component) = actor.correction.as_mut() else {
        return;
    };
    if !component.take_initial_replication() {
        return;
    }
    let translation = component.replicated_translation();
    if translation.is_zero() {
        return;
    }
    if actor.is_simulating_physics() || actor.location().is_zero() {
        let location = rel_to_world(translation, actor.location());
        apply_client_location(actor, location);
    }
}

fn apply_client_location(actor: &mut Actor, location: Vec3) {
    if actor.is_simulating_physics() {
        if let Some(target) = actor.root.as_mut().and_then(|r| r.rigid_body_target.as_mut()) {
            target.position = location;
            target.needs_update = true;
            return;
        }
    }
    actor.set_location(location);
}

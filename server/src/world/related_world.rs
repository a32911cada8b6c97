// related_world_server/server/src/world/related_world.rs
use crate::core::error::{RelatedWorldError, RelatedWorldResult};
use crate::core::types::{ActorId, IntVector, NetMode, RelatedWorldName, WorldDomain, WorldHandle, WorldTranslation};
use crate::entities::actor::SpawnParams;
use crate::network::correction::NetLocCorrectionComponent;
use crate::world::context::{FrameReport, TickSkip};
use crate::world::engine::{ContextRef, HostEngine};
use crate::world::events::{Multicast, SubscriptionId};
use metrics::histogram;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{debug, error, info, trace};

/// Object the host ticks once per frame.
pub trait Tickable {
    fn tick(&self, delta_seconds: f64) -> FrameReport;
    fn is_tickable(&self) -> bool;
}

/// Resolves a world-context handle to the related world that owns it.
pub trait WorldResolver {
    fn related_world_for_handle(&self, handle: WorldHandle) -> Option<Arc<RelatedWorld>>;
}

/// A secondary world context running alongside the persistent world, offset
/// from it by an integer translation.
pub struct RelatedWorld {
    name: RelatedWorldName,
    handle: WorldHandle,
    engine: Arc<HostEngine>,
    context: RwLock<Option<ContextRef>>,
    translation: RwLock<WorldTranslation>,
    networked: bool,
    domain: WorldDomain,
    tick_enabled: AtomicBool,
    ticking: AtomicBool,
    translation_changed: Multicast<IntVector>,
    self_ref: Weak<RelatedWorld>,
}

impl std::fmt::Debug for RelatedWorld {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelatedWorld")
            .field("name", &self.name)
            .field("handle", &self.handle)
            .field("translation", &self.translation())
            .field("networked", &self.networked)
            .field("domain", &self.domain)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl RelatedWorld {
    pub(crate) fn new(
        name: RelatedWorldName,
        engine: Arc<HostEngine>,
        handle: WorldHandle,
        context: ContextRef,
        translation: WorldTranslation,
        domain: WorldDomain,
        networked: bool,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| RelatedWorld {
            name,
            handle,
            engine,
            context: RwLock::new(Some(context)),
            translation: RwLock::new(translation),
            networked,
            domain,
            tick_enabled: AtomicBool::new(true),
            ticking: AtomicBool::new(false),
            translation_changed: Multicast::new(),
            self_ref: self_ref.clone(),
        })
    }

    pub fn name(&self) -> &RelatedWorldName {
        &self.name
    }

    pub fn handle(&self) -> WorldHandle {
        self.handle
    }

    pub fn translation(&self) -> WorldTranslation {
        *self.translation.read()
    }

    pub fn domain(&self) -> WorldDomain {
        self.domain
    }

    pub fn is_networked(&self) -> bool {
        self.networked
    }

    pub fn is_alive(&self) -> bool {
        self.context.read().is_some()
    }

    pub fn set_tick_enabled(&self, enabled: bool) {
        self.tick_enabled.store(enabled, Ordering::Relaxed);
    }

    /// The underlying context. Reaching a torn-down context through a live
    /// handle is a contract violation.
    pub fn context(&self) -> RelatedWorldResult<ContextRef> {
        match self.context.read().as_ref() {
            Some(context) => Ok(context.clone()),
            None => {
                error!(world = %self.name, "World context used after teardown");
                debug_assert!(false, "related world {} used after teardown", self.name);
                Err(RelatedWorldError::Internal(format!("related world {} has no context", self.name)))
            }
        }
    }

    /// Applied floating origin of the underlying context.
    pub fn origin(&self) -> IntVector {
        self.context
            .read()
            .as_ref()
            .map(|c| c.read().origin_location())
            .unwrap_or(IntVector::ZERO)
    }

    pub fn has_pending_origin_shift(&self) -> bool {
        self.context
            .read()
            .as_ref()
            .map(|c| c.read().has_pending_origin_shift())
            .unwrap_or(false)
    }

    pub fn map_name(&self) -> Option<String> {
        self.context.read().as_ref().map(|c| c.read().map_name.clone())
    }

    pub fn actor_ids(&self) -> Vec<ActorId> {
        self.engine.actors_in(self.handle)
    }

    pub fn begin_play(&self) -> RelatedWorldResult<()> {
        self.context()?.write().begin_play();
        Ok(())
    }

    /// Spawn into this world. On a dedicated server a networked world gives
    /// the actor a correction component.
    pub fn spawn_actor(&self, params: &SpawnParams) -> RelatedWorldResult<ActorId> {
        self.context()?;
        let id = self.engine.spawn_actor(self.handle, params)?;
        if self.engine.net_mode() == NetMode::DedicatedServer && self.networked {
            self.engine.with_actor_mut(id, |actor| {
                let mut component = NetLocCorrectionComponent::new();
                component.initialize(self, actor.world);
                actor.correction = Some(component);
            });
        }
        Ok(id)
    }

    /// Request a floating-origin shift. It is applied at the start of the
    /// next tick, not here.
    pub fn set_origin(&self, origin: IntVector) -> RelatedWorldResult<()> {
        self.context()?.write().request_origin_shift(origin);
        debug!(world = %self.name, %origin, "Origin shift requested");
        Ok(())
    }

    /// The only way translation changes. Subscribers hear about it in order.
    pub fn translate(&self, translation: WorldTranslation) {
        {
            let mut current = self.translation.write();
            if *current == translation {
                return;
            }
            *current = translation;
        }
        info!(world = %self.name, %translation, "Related world translated");
        self.translation_changed.broadcast(&translation);
    }

    pub fn subscribe_translation<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&IntVector) + Send + Sync + 'static,
    {
        self.translation_changed.subscribe(listener)
    }

    pub fn unsubscribe_translation(&self, id: SubscriptionId) -> bool {
        self.translation_changed.unsubscribe(id)
    }

    pub fn translation_subscriber_count(&self) -> usize {
        self.translation_changed.len()
    }

    /// Drop the context reference and every listener. After this every
    /// accessor degrades to "no world".
    pub(crate) fn teardown(&self) -> Option<ContextRef> {
        self.translation_changed.clear();
        self.tick_enabled.store(false, Ordering::Relaxed);
        self.context.write().take()
    }

    pub fn downgrade(&self) -> Weak<RelatedWorld> {
        self.self_ref.clone()
    }
}

impl Tickable for RelatedWorld {
    fn tick(&self, delta_seconds: f64) -> FrameReport {
        if self.engine.is_intra_frame_debugging() {
            trace!(world = %self.name, "Skipping tick during debug break");
            return FrameReport::skipped(TickSkip::DebugBreak);
        }
        let Some(context) = self.context.read().clone() else {
            return FrameReport::skipped(TickSkip::TornDown);
        };
        if self.ticking.swap(true, Ordering::Acquire) {
            return FrameReport::skipped(TickSkip::Reentrant);
        }
        let started = Instant::now();
        let report = context.write().tick(delta_seconds);
        self.ticking.store(false, Ordering::Release);
        histogram!("related_world_tick_seconds").record(started.elapsed().as_secs_f64());
        report
    }

    fn is_tickable(&self) -> bool {
        self.tick_enabled.load(Ordering::Relaxed) && self.is_alive()
    }
}

impl WorldResolver for RelatedWorld {
    fn related_world_for_handle(&self, handle: WorldHandle) -> Option<Arc<RelatedWorld>> {
        if handle == self.handle && self.is_alive() {
            self.self_ref.upgrade()
        } else {
            None
        }
    }
}

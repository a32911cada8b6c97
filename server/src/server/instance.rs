// related_world_server/server/src/server/instance.rs
use crate::core::config::ServerConfig;
use crate::core::constants::SLOW_FRAME_LOG_MS;
use crate::core::error::{RelatedWorldError, RelatedWorldResult};
use crate::core::types::{ActorId, ConnectionId};
use crate::entities::actor::ActorClass;
use crate::network::hooks::{install_correction_hooks, restore_correction_hooks};
use crate::network::net_driver::{DestroyNotice, NetDriverEvent};
use crate::network::rpc::{HostMovementHandlers, RpcCall, RpcDispatchTable, RpcEnv};
use crate::replication::graph::{ReplicationGraph, ReplicationPass};
use crate::replication::node::{ConnectionViewer, ReplicationView};
use crate::world::director::WorldDirector;
use crate::world::engine::HostEngine;
use crate::world::events::WorldEvent;

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// What one server frame did.
#[derive(Debug, Default)]
pub struct FrameSummary {
    pub frame: u64,
    pub host_worlds_ticked: usize,
    pub related_worlds_ticked: usize,
    pub deferred_moves_applied: usize,
    pub world_events: usize,
    pub replication: ReplicationPass,
    pub destroy_notices: Vec<DestroyNotice>,
    pub duration: Duration,
}

/// Owns the host engine, the related-world registry, the replication graph
/// and the RPC dispatch table, and drives them in a fixed per-frame order.
pub struct RelatedWorldServer {
    pub config: Arc<ServerConfig>,
    pub engine: Arc<HostEngine>,
    pub director: Arc<WorldDirector>,
    pub graph: Mutex<ReplicationGraph>,
    pub rpc: Arc<RpcDispatchTable>,
    pub host_handlers: Arc<HostMovementHandlers>,
    pub frame_counter: AtomicU64,
}

impl RelatedWorldServer {
    pub fn new(config: Arc<ServerConfig>) -> Self {
        let engine = Arc::new(HostEngine::new(config.net_mode, &config.persistent_map));
        let director = Arc::new(WorldDirector::new(engine.clone()));
        let graph = ReplicationGraph::new(config.replication.clone(), config.tick_rate);

        let rpc = Arc::new(RpcDispatchTable::new());
        let host_handlers = HostMovementHandlers::new();
        host_handlers.register(&rpc);
        install_correction_hooks(&rpc);

        info!(
            tick_rate = config.tick_rate,
            net_mode = ?config.net_mode,
            persistent_map = %config.persistent_map,
            "Related world server created"
        );

        RelatedWorldServer {
            config,
            engine,
            director,
            graph: Mutex::new(graph),
            rpc,
            host_handlers,
            frame_counter: AtomicU64::new(0),
        }
    }

    /// Create or load every world listed in the configuration.
    pub fn bootstrap_worlds(&self) -> RelatedWorldResult<usize> {
        for world in &self.config.worlds {
            match &world.map {
                Some(map) => {
                    self.director
                        .load_world(&world.name, map, world.translation(), world.domain, world.networked)?;
                }
                None => {
                    self.director
                        .create_world(&world.name, world.translation(), world.domain, world.networked)?;
                }
            }
        }
        Ok(self.config.worlds.len())
    }

    /// Register an actor class with the engine and the graph's class table.
    pub fn register_class(&self, class: ActorClass) -> Arc<ActorClass> {
        let class = self.engine.register_class(class);
        self.graph.lock().init_global_actor_class_settings([&class]);
        class
    }

    pub fn init_replication_settings(&self) {
        let classes = self.engine.classes();
        self.graph.lock().init_global_actor_class_settings(&classes);
    }

    pub fn current_frame(&self) -> u64 {
        self.frame_counter.load(AtomicOrdering::Relaxed)
    }

    /// Attach a client connection to its pawn.
    pub fn possess(&self, connection: ConnectionId, pawn: ActorId) -> RelatedWorldResult<()> {
        let driver = self
            .engine
            .persistent_net_driver()
            .ok_or_else(|| RelatedWorldError::NotFound("net driver".into()))?;
        if !self.engine.is_valid_actor(pawn) {
            return Err(RelatedWorldError::InvalidActor(pawn));
        }
        if !driver.update_connection(connection, |c| {
            c.player_controller = Some(pawn);
            c.view_target = Some(pawn);
        }) {
            return Err(RelatedWorldError::NotFound(format!("connection {}", connection)));
        }
        self.engine.with_actor_mut(pawn, |a| {
            a.net_connection = Some(connection);
            a.controller = Some(pawn);
        });
        debug!(%connection, %pawn, "Pawn possessed");
        Ok(())
    }

    /// Run one RPC through the hooked dispatch table on the actor's own
    /// world frame.
    pub fn dispatch_rpc(&self, call: &mut RpcCall) -> RelatedWorldResult<()> {
        let local_origin = self
            .engine
            .actor_origin(call.actor)
            .ok_or(RelatedWorldError::InvalidActor(call.actor))?;
        let env = RpcEnv {
            net_mode: self.engine.net_mode(),
            local_origin,
            max_packed_bits: self.config.replication.max_packed_movement_bits,
        };
        let rpc = self.rpc.clone();
        self.engine
            .with_actor_mut(call.actor, |actor| rpc.dispatch(actor, call, &env))
            .ok_or(RelatedWorldError::InvalidActor(call.actor))?
    }

    pub fn drain_outgoing_rpcs(&self) -> Vec<RpcCall> {
        self.host_handlers.drain_outbox()
    }

    /// One server frame:
    /// 1. host-owned world contexts,
    /// 2. related worlds,
    /// 3. moves deferred by origin shifts,
    /// 4. registry and driver events into the graph,
    /// 5. movement snapshots and correction state,
    /// 6. the replication pass.
    pub fn process_frame(&self, delta_seconds: f64) -> FrameSummary {
        let started = Instant::now();
        let frame = self.frame_counter.fetch_add(1, AtomicOrdering::Relaxed) + 1;

        let host_worlds_ticked = self.engine.tick_host_worlds(delta_seconds).len();
        let related_worlds_ticked = self.director.tick_worlds(delta_seconds).len();
        let deferred_moves_applied = self.director.process_deferred_moves();

        let mut graph = self.graph.lock();
        let world_events = self.apply_world_events(&mut graph);
        let driver = self.engine.persistent_net_driver();
        if let Some(driver) = &driver {
            for event in driver.drain_events() {
                self.apply_driver_event(&mut graph, event);
            }
            for actor in driver.network_actors() {
                let origin = self.engine.actor_origin(actor).unwrap_or_default();
                self.engine.with_actor_mut(actor, |a| {
                    a.gather_current_movement(origin);
                    if let Some(component) = a.correction.as_mut() {
                        if component.pre_replication() {
                            trace!(actor = %a.id, translation = %component.replicated_translation(), "Translation snapshot dirty");
                        }
                    }
                });
            }
        }

        let viewers: Vec<ConnectionViewer> = driver
            .as_ref()
            .map(|d| {
                d.connections()
                    .iter()
                    .filter(|c| c.open)
                    .map(|c| self.director.connection_viewer(c))
                    .collect()
            })
            .unwrap_or_default();
        let replication = graph.server_replicate_actors(self.director.as_ref(), &viewers);
        drop(graph);

        let destroy_notices = driver.map(|d| d.drain_destroy_notices()).unwrap_or_default();
        let duration = started.elapsed();
        if duration > Duration::from_millis(SLOW_FRAME_LOG_MS) {
            warn!(frame, ?duration, "Slow server frame");
        }

        FrameSummary {
            frame,
            host_worlds_ticked,
            related_worlds_ticked,
            deferred_moves_applied,
            world_events,
            replication,
            destroy_notices,
            duration,
        }
    }

    fn apply_world_events(&self, graph: &mut ReplicationGraph) -> usize {
        let events = self.director.drain_events();
        for event in &events {
            match event {
                WorldEvent::ActorChangedWorld { actor, .. } => graph.notify_actor_world_changed(*actor),
                WorldEvent::WorldUnloaded { name, .. } => graph.notify_world_unloaded(name),
                WorldEvent::WorldLoaded { name, handle } => trace!(world = %name, %handle, "World loaded event"),
                WorldEvent::WorldTranslated { name, translation } => {
                    trace!(world = %name, %translation, "World translated event")
                }
            }
        }
        events.len()
    }

    fn apply_driver_event(&self, graph: &mut ReplicationGraph, event: NetDriverEvent) {
        match event {
            NetDriverEvent::ConnectionAdded { connection, parent } => graph.add_client_connection(connection, parent),
            NetDriverEvent::ConnectionRemoved { connection } => graph.remove_client_connection(connection),
            NetDriverEvent::ActorAdded { actor } => match self.director.actor_view(actor) {
                Some(view) => graph.add_network_actor(&view),
                None => trace!(%actor, "Network actor vanished before routing"),
            },
            NetDriverEvent::ActorRemoved { actor } => {
                graph.remove_network_actor(actor);
            }
        }
    }

    /// Whether a channel for `actor` may open on `connection`.
    pub fn is_level_initialized_for_actor(&self, connection: ConnectionId, actor: ActorId) -> bool {
        let Some(driver) = self.engine.persistent_net_driver() else {
            return false;
        };
        let Some(level) = self
            .engine
            .actor_world(actor)
            .and_then(|h| self.engine.context(h))
            .map(|c| c.read().map_name.clone())
        else {
            return false;
        };
        driver.is_level_initialized_for_actor(connection, actor, &level, &self.config.persistent_map)
    }

    /// Unload every related world and take the correction hooks out.
    pub fn shutdown(&self) {
        let unloaded = self.director.unload_all_worlds();
        let restored = restore_correction_hooks(&self.rpc);
        info!(unloaded, restored, frames = self.current_frame(), "Related world server shut down");
    }
}

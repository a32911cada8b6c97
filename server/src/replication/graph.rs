// related_world_server/server/src/replication/graph.rs
//! Interest management across related worlds.
//!
//! Routing per actor:
//! * always relevant -> flat global list;
//! * owner-only -> per-connection list once the actor has a connection;
//! * Public (or no related world) -> shared grid;
//! * Private / Isolated -> domain router, one grid per related world.
//!
//! A world change never touches node lists mid-gather: the actor is pulled
//! from its node and re-routed at the start of the next pass.

use super::domain::DomainRouterNode;
use super::grid::GridSpatializationNode;
use super::node::{ActorListNode, ActorView, ConnectionViewer, GatherList, ReplicationGraphNode, ReplicationView};
use crate::core::config::ReplicationConfig;
use crate::core::types::{ActorId, ConnectionId, RelatedWorldName, WorldDomain};
use crate::entities::actor::ActorClass;
use ahash::{AHashMap, AHashSet};
use metrics::{counter, gauge};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, trace, warn};

const IGNORED_CLASS_PREFIXES: [&str; 2] = ["SKEL_", "REINST_"];

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClassReplicationInfo {
    /// Replicate every N graph frames.
    pub replication_period_frame: u32,
    /// 0 disables distance culling.
    pub cull_distance_squared: f64,
}

impl ClassReplicationInfo {
    pub fn for_class(class: &ActorClass, tick_rate: u64) -> Self {
        let frequency = class.net_update_frequency.max(f64::EPSILON);
        let period = (tick_rate as f64 / frequency).round().max(1.0) as u32;
        let cull_distance_squared = if class.always_relevant || class.only_relevant_to_owner {
            0.0
        } else {
            class.net_cull_distance_squared
        };
        ClassReplicationInfo { replication_period_frame: period, cull_distance_squared }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum RouteTarget {
    AlwaysRelevant,
    OwnerOnly(ConnectionId),
    PendingOwner,
    Spatial { domain: WorldDomain, world: Option<RelatedWorldName> },
    /// Pulled from its node after a world change, waiting to be re-routed.
    PendingReroute,
}

#[derive(Clone, Debug)]
pub struct GlobalActorReplicationInfo {
    pub route: RouteTarget,
    pub class: Arc<ActorClass>,
    pub last_replicated_frame: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReplicationPass {
    pub frame: u64,
    pub rerouted: usize,
    pub per_connection: Vec<(ConnectionId, Vec<ActorId>)>,
}

impl ReplicationPass {
    pub fn actors_for(&self, connection: ConnectionId) -> &[ActorId] {
        self.per_connection
            .iter()
            .find(|(c, _)| *c == connection)
            .map(|(_, actors)| actors.as_slice())
            .unwrap_or(&[])
    }
}

pub struct ReplicationGraph {
    config: ReplicationConfig,
    tick_rate: u64,
    frame: u64,
    class_info: AHashMap<String, ClassReplicationInfo>,
    always_relevant: ActorListNode,
    public_grid: GridSpatializationNode,
    private_router: DomainRouterNode,
    isolated_router: DomainRouterNode,
    connection_nodes: AHashMap<ConnectionId, ActorListNode>,
    connection_parents: AHashMap<ConnectionId, ConnectionId>,
    actors_without_net_connection: Vec<ActorId>,
    /// Owner-only actors already warned about an unknown connection.
    unknown_owner_logged: AHashSet<ActorId>,
    pending_reroute: VecDeque<ActorId>,
    global_info: AHashMap<ActorId, GlobalActorReplicationInfo>,
}

impl ReplicationGraph {
    pub fn new(config: ReplicationConfig, tick_rate: u64) -> Self {
        ReplicationGraph {
            public_grid: GridSpatializationNode::new("PublicGrid", config.cell_size, config.spatial_query_radius),
            private_router: DomainRouterNode::new(WorldDomain::Private, config.cell_size, config.spatial_query_radius),
            isolated_router: DomainRouterNode::new(WorldDomain::Isolated, config.cell_size, config.spatial_query_radius),
            config,
            tick_rate: tick_rate.max(1),
            frame: 0,
            class_info: AHashMap::new(),
            always_relevant: ActorListNode::new("AlwaysRelevant"),
            connection_nodes: AHashMap::new(),
            connection_parents: AHashMap::new(),
            actors_without_net_connection: Vec::new(),
            unknown_owner_logged: AHashSet::new(),
            pending_reroute: VecDeque::new(),
            global_info: AHashMap::new(),
        }
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    // --- Class settings ---

    pub fn init_global_actor_class_settings<'a>(&mut self, classes: impl IntoIterator<Item = &'a Arc<ActorClass>>) {
        for class in classes {
            if IGNORED_CLASS_PREFIXES.iter().any(|p| class.name.starts_with(p)) {
                trace!(class = %class.name, "Skipping generated class");
                continue;
            }
            if !class.replicates {
                continue;
            }
            let info = ClassReplicationInfo::for_class(class, self.tick_rate);
            debug!(class = %class.name, period = info.replication_period_frame, cull_sq = info.cull_distance_squared, "Class replication settings");
            self.class_info.insert(class.name.clone(), info);
        }
    }

    pub fn class_info(&self, class: &ActorClass) -> ClassReplicationInfo {
        self.class_info
            .get(&class.name)
            .copied()
            .unwrap_or_else(|| ClassReplicationInfo::for_class(class, self.tick_rate))
    }

    pub fn has_class_settings(&self, name: &str) -> bool {
        self.class_info.contains_key(name)
    }

    // --- Connections ---

    pub fn add_client_connection(&mut self, connection: ConnectionId, parent: Option<ConnectionId>) {
        match parent {
            Some(parent) => {
                self.connection_parents.insert(connection, parent);
            }
            None => {
                self.connection_nodes
                    .entry(connection)
                    .or_insert_with(|| ActorListNode::new(format!("OwnerOnly/{}", connection)));
            }
        }
    }

    pub fn remove_client_connection(&mut self, connection: ConnectionId) {
        self.connection_parents.remove(&connection);
        if let Some(node) = self.connection_nodes.remove(&connection) {
            for actor in node.actors() {
                if let Some(info) = self.global_info.get_mut(actor) {
                    info.route = RouteTarget::PendingOwner;
                    self.actors_without_net_connection.push(*actor);
                }
            }
        }
    }

    /// Child connections share their parent's per-connection lists.
    pub fn resolve_connection(&self, connection: ConnectionId) -> ConnectionId {
        self.connection_parents.get(&connection).copied().unwrap_or(connection)
    }

    // --- Actors ---

    pub fn add_network_actor(&mut self, actor: &ActorView) {
        if self.global_info.contains_key(&actor.id) {
            return;
        }
        self.global_info.insert(
            actor.id,
            GlobalActorReplicationInfo {
                route: RouteTarget::PendingReroute,
                class: actor.class.clone(),
                last_replicated_frame: None,
            },
        );
        self.route_add_network_actor(actor);
    }

    pub fn remove_network_actor(&mut self, actor: ActorId) -> bool {
        let Some(info) = self.global_info.remove(&actor) else {
            return false;
        };
        self.detach(actor, &info.route);
        self.actors_without_net_connection.retain(|a| *a != actor);
        self.unknown_owner_logged.remove(&actor);
        self.pending_reroute.retain(|a| *a != actor);
        true
    }

    /// The actor's related world changed. It leaves its node now and is
    /// re-routed on the next pass.
    pub fn notify_actor_world_changed(&mut self, actor: ActorId) {
        let Some(route) = self.global_info.get(&actor).map(|i| i.route.clone()) else {
            return;
        };
        if route == RouteTarget::PendingReroute {
            return;
        }
        self.detach(actor, &route);
        if let Some(info) = self.global_info.get_mut(&actor) {
            info.route = RouteTarget::PendingReroute;
        }
        self.pending_reroute.push_back(actor);
        debug!(%actor, "Actor queued for re-route after world change");
    }

    pub fn notify_world_unloaded(&mut self, world: &str) {
        let private = self.private_router.remove_rule(world);
        let isolated = self.isolated_router.remove_rule(world);
        if private || isolated {
            debug!(world, "Routing rules dropped for unloaded world");
        }
    }

    pub fn route_of(&self, actor: ActorId) -> Option<&RouteTarget> {
        self.global_info.get(&actor).map(|i| &i.route)
    }

    pub fn routing_rule_count(&self) -> usize {
        self.private_router.rule_count() + self.isolated_router.rule_count()
    }

    pub fn private_router(&self) -> &DomainRouterNode {
        &self.private_router
    }

    pub fn isolated_router(&self) -> &DomainRouterNode {
        &self.isolated_router
    }

    pub fn pending_reroute_count(&self) -> usize {
        self.pending_reroute.len()
    }

    pub fn pending_owner_count(&self) -> usize {
        self.actors_without_net_connection.len()
    }

    fn route_add_network_actor(&mut self, actor: &ActorView) {
        let route = if actor.class.always_relevant {
            self.always_relevant.notify_add_actor(actor);
            RouteTarget::AlwaysRelevant
        } else if actor.class.only_relevant_to_owner {
            match actor.net_connection {
                Some(connection) => self.route_to_connection(actor, connection),
                None => {
                    if !self.actors_without_net_connection.contains(&actor.id) {
                        self.actors_without_net_connection.push(actor.id);
                    }
                    RouteTarget::PendingOwner
                }
            }
        } else {
            let domain = actor.domain();
            match domain {
                WorldDomain::Public => self.public_grid.notify_add_actor(actor),
                WorldDomain::Private => self.private_router.notify_add_actor(actor),
                WorldDomain::Isolated => self.isolated_router.notify_add_actor(actor),
            }
            RouteTarget::Spatial { domain, world: actor.world.as_ref().map(|w| w.name.clone()) }
        };
        trace!(actor = %actor.id, ?route, "Actor routed");
        if let Some(info) = self.global_info.get_mut(&actor.id) {
            info.route = route;
            info.class = actor.class.clone();
        }
    }

    fn route_to_connection(&mut self, actor: &ActorView, connection: ConnectionId) -> RouteTarget {
        let connection = self.resolve_connection(connection);
        match self.connection_nodes.get_mut(&connection) {
            Some(node) => {
                node.notify_add_actor(actor);
                self.unknown_owner_logged.remove(&actor.id);
                RouteTarget::OwnerOnly(connection)
            }
            None => {
                if self.unknown_owner_logged.insert(actor.id) {
                    warn!(actor = %actor.id, %connection, "Owner connection unknown to graph, waiting");
                } else {
                    trace!(actor = %actor.id, %connection, "Owner connection still unknown");
                }
                if !self.actors_without_net_connection.contains(&actor.id) {
                    self.actors_without_net_connection.push(actor.id);
                }
                RouteTarget::PendingOwner
            }
        }
    }

    fn detach(&mut self, actor: ActorId, route: &RouteTarget) {
        match route {
            RouteTarget::AlwaysRelevant => {
                self.always_relevant.notify_remove_actor(actor);
            }
            RouteTarget::OwnerOnly(connection) => {
                if let Some(node) = self.connection_nodes.get_mut(connection) {
                    node.notify_remove_actor(actor);
                }
            }
            RouteTarget::PendingOwner => {
                self.actors_without_net_connection.retain(|a| *a != actor);
            }
            RouteTarget::Spatial { domain, .. } => {
                match domain {
                    WorldDomain::Public => self.public_grid.notify_remove_actor(actor),
                    WorldDomain::Private => self.private_router.notify_remove_actor(actor),
                    WorldDomain::Isolated => self.isolated_router.notify_remove_actor(actor),
                };
            }
            RouteTarget::PendingReroute => {}
        }
    }

    fn process_pending_reroutes(&mut self, view: &dyn ReplicationView) -> usize {
        let mut rerouted = 0;
        let pending: Vec<ActorId> = self.pending_reroute.drain(..).collect();
        for id in pending {
            match view.actor_view(id) {
                Some(actor) if !actor.pending_kill => {
                    self.route_add_network_actor(&actor);
                    rerouted += 1;
                }
                _ => {
                    self.global_info.remove(&id);
                }
            }
        }
        rerouted
    }

    fn poll_actors_without_net_connection(&mut self, view: &dyn ReplicationView) {
        let waiting = std::mem::take(&mut self.actors_without_net_connection);
        for id in waiting {
            let Some(actor) = view.actor_view(id) else {
                self.global_info.remove(&id);
                continue;
            };
            match actor.net_connection {
                Some(connection) => {
                    let route = self.route_to_connection(&actor, connection);
                    if let Some(info) = self.global_info.get_mut(&id) {
                        info.route = route;
                    }
                }
                None => self.actors_without_net_connection.push(id),
            }
        }
    }

    /// One server replication pass: re-route deferred actors, poll owner-only
    /// actors, refresh spatial nodes, then gather and cull per connection.
    pub fn server_replicate_actors(&mut self, view: &dyn ReplicationView, viewers: &[ConnectionViewer]) -> ReplicationPass {
        self.frame += 1;
        let frame = self.frame;

        let rerouted = self.process_pending_reroutes(view);
        self.poll_actors_without_net_connection(view);

        self.public_grid.prepare_for_replication(view);
        self.private_router.prepare_for_replication(view);
        self.isolated_router.prepare_for_replication(view);

        let mut pass = ReplicationPass { frame, rerouted, per_connection: Vec::with_capacity(viewers.len()) };
        let mut replicated_this_frame = AHashSet::new();

        for viewer in viewers {
            let mut gathered = GatherList::new();
            self.always_relevant.gather_actor_lists(viewer, &mut gathered);
            let owner = self.resolve_connection(viewer.parent.unwrap_or(viewer.connection));
            if let Some(node) = self.connection_nodes.get(&owner) {
                node.gather_actor_lists(viewer, &mut gathered);
            }
            self.public_grid.gather_actor_lists(viewer, &mut gathered);
            self.private_router.gather_actor_lists(viewer, &mut gathered);
            self.isolated_router.gather_actor_lists(viewer, &mut gathered);

            let mut seen = AHashSet::with_capacity(gathered.len());
            let mut actors = Vec::with_capacity(gathered.len());
            for id in gathered {
                if !seen.insert(id) {
                    continue;
                }
                if self.is_relevant(view, id, viewer, frame) {
                    actors.push(id);
                    replicated_this_frame.insert(id);
                }
            }
            actors.sort_unstable();
            counter!("replication_actors_gathered_total").increment(actors.len() as u64);
            pass.per_connection.push((viewer.connection, actors));
        }

        for id in replicated_this_frame {
            if let Some(info) = self.global_info.get_mut(&id) {
                info.last_replicated_frame = Some(frame);
            }
        }
        gauge!("replication_routing_rules").set(self.routing_rule_count() as f64);
        pass
    }

    fn is_relevant(&self, view: &dyn ReplicationView, id: ActorId, viewer: &ConnectionViewer, frame: u64) -> bool {
        let Some(info) = self.global_info.get(&id) else {
            return false;
        };
        let Some(actor) = view.actor_view(id) else {
            return false;
        };
        if actor.pending_kill {
            return false;
        }
        let settings = self.class_info(&info.class);
        if let Some(last) = info.last_replicated_frame {
            if last != frame && frame - last < settings.replication_period_frame as u64 {
                return false;
            }
        }
        if settings.cull_distance_squared > 0.0
            && actor.common_location.dist_squared(&viewer.location) > settings.cull_distance_squared
        {
            return false;
        }
        true
    }
}

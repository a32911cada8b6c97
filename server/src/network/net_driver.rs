// related_world_server/server/src/network/net_driver.rs
use crate::core::types::{ActorId, ConnectionId, IntVector};
use ahash::AHashSet;
use crossbeam_queue::SegQueue;
use dashmap::{DashMap, DashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::{debug, info, trace};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NetDriverEvent {
    ConnectionAdded { connection: ConnectionId, parent: Option<ConnectionId> },
    ConnectionRemoved { connection: ConnectionId },
    ActorAdded { actor: ActorId },
    ActorRemoved { actor: ActorId },
}

/// Sent to a client so it tears down its proxy of an actor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DestroyNotice {
    pub connection: ConnectionId,
    pub actor: ActorId,
}

#[derive(Clone, Debug)]
pub struct NetConnection {
    pub id: ConnectionId,
    pub parent: Option<ConnectionId>,
    pub player_controller: Option<ActorId>,
    pub view_target: Option<ActorId>,
    /// Floating origin the client last reported for its own world.
    pub client_origin: IntVector,
    pub client_world_package: String,
    pub initialized_levels: AHashSet<String>,
    pub open: bool,
}

impl NetConnection {
    fn new(id: ConnectionId, parent: Option<ConnectionId>) -> Self {
        NetConnection {
            id,
            parent,
            player_controller: None,
            view_target: None,
            client_origin: IntVector::ZERO,
            client_world_package: String::new(),
            initialized_levels: AHashSet::new(),
            open: true,
        }
    }

    pub fn is_child(&self) -> bool {
        self.parent.is_some()
    }

    pub fn has_initialized_level(&self, package: &str) -> bool {
        self.initialized_levels.contains(package)
    }
}

/// The server's network driver. Networked related worlds share the
/// persistent world's instance, so one client connection sees every world.
pub struct NetDriver {
    name: String,
    connections: DashMap<ConnectionId, NetConnection>,
    network_actors: DashSet<ActorId>,
    events: SegQueue<NetDriverEvent>,
    destroy_notices: SegQueue<DestroyNotice>,
    next_connection_id: AtomicU32,
    dispatch_count: AtomicU64,
    flush_count: AtomicU64,
}

impl std::fmt::Debug for NetDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetDriver")
            .field("name", &self.name)
            .field("connections", &self.connections.len())
            .field("network_actors", &self.network_actors.len())
            .finish()
    }
}

impl NetDriver {
    pub fn new(name: impl Into<String>) -> Self {
        NetDriver {
            name: name.into(),
            connections: DashMap::new(),
            network_actors: DashSet::new(),
            events: SegQueue::new(),
            destroy_notices: SegQueue::new(),
            next_connection_id: AtomicU32::new(1),
            dispatch_count: AtomicU64::new(0),
            flush_count: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // --- Connections ---

    pub fn open_connection(&self, player_controller: Option<ActorId>) -> ConnectionId {
        self.open_connection_inner(player_controller, None)
    }

    /// Split-screen child connection. Replication resolves it to `parent`.
    pub fn open_child_connection(&self, parent: ConnectionId, player_controller: Option<ActorId>) -> ConnectionId {
        self.open_connection_inner(player_controller, Some(parent))
    }

    fn open_connection_inner(&self, player_controller: Option<ActorId>, parent: Option<ConnectionId>) -> ConnectionId {
        let id = ConnectionId(self.next_connection_id.fetch_add(1, Ordering::Relaxed));
        let mut connection = NetConnection::new(id, parent);
        connection.player_controller = player_controller;
        connection.view_target = player_controller;
        self.connections.insert(id, connection);
        self.events.push(NetDriverEvent::ConnectionAdded { connection: id, parent });
        info!(driver = %self.name, connection = %id, ?parent, "Client connection opened");
        id
    }

    pub fn close_connection(&self, id: ConnectionId) -> bool {
        let removed = self.connections.remove(&id).is_some();
        if removed {
            self.events.push(NetDriverEvent::ConnectionRemoved { connection: id });
            info!(driver = %self.name, connection = %id, "Client connection closed");
        }
        removed
    }

    pub fn connection(&self, id: ConnectionId) -> Option<NetConnection> {
        self.connections.get(&id).map(|c| c.value().clone())
    }

    pub fn connections(&self) -> Vec<NetConnection> {
        let mut all: Vec<NetConnection> = self.connections.iter().map(|c| c.value().clone()).collect();
        all.sort_by_key(|c| c.id);
        all
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn update_connection<F>(&self, id: ConnectionId, f: F) -> bool
    where
        F: FnOnce(&mut NetConnection),
    {
        match self.connections.get_mut(&id) {
            Some(mut entry) => {
                f(entry.value_mut());
                true
            }
            None => false,
        }
    }

    pub fn set_view_target(&self, id: ConnectionId, target: Option<ActorId>) -> bool {
        self.update_connection(id, |c| c.view_target = target)
    }

    pub fn set_client_world(&self, id: ConnectionId, package: &str) -> bool {
        self.update_connection(id, |c| c.client_world_package = package.to_string())
    }

    pub fn mark_level_initialized(&self, id: ConnectionId, package: &str) -> bool {
        self.update_connection(id, |c| {
            c.initialized_levels.insert(package.to_string());
        })
    }

    /// A channel may open for `actor` only when the client loaded the right
    /// world and initialised the actor's level. The connection's own player
    /// controller is always allowed.
    pub fn is_level_initialized_for_actor(
        &self,
        id: ConnectionId,
        actor: ActorId,
        actor_level_package: &str,
        world_package: &str,
    ) -> bool {
        let Some(connection) = self.connections.get(&id) else {
            return false;
        };
        let correct_world = connection.client_world_package == world_package
            && connection.has_initialized_level(actor_level_package);
        let is_connection_pc = connection.player_controller == Some(actor);
        correct_world || is_connection_pc
    }

    // --- Network actors ---

    pub fn add_network_actor(&self, actor: ActorId) -> bool {
        let added = self.network_actors.insert(actor);
        if added {
            self.events.push(NetDriverEvent::ActorAdded { actor });
            trace!(driver = %self.name, %actor, "Network actor added");
        }
        added
    }

    /// Stop replicating `actor`. With `notify_clients`, every open connection
    /// gets a destroy notice so no ghost proxy is left behind.
    pub fn remove_network_actor(&self, actor: ActorId, notify_clients: bool) -> bool {
        let removed = self.network_actors.remove(&actor).is_some();
        if !removed {
            return false;
        }
        if notify_clients {
            for connection in self.connections.iter().filter(|c| c.open) {
                self.destroy_notices.push(DestroyNotice { connection: connection.id, actor });
            }
        }
        self.events.push(NetDriverEvent::ActorRemoved { actor });
        debug!(driver = %self.name, %actor, notify_clients, "Network actor removed");
        true
    }

    pub fn is_network_actor(&self, actor: ActorId) -> bool {
        self.network_actors.contains(&actor)
    }

    pub fn network_actors(&self) -> Vec<ActorId> {
        let mut ids: Vec<ActorId> = self.network_actors.iter().map(|a| *a).collect();
        ids.sort_unstable();
        ids
    }

    pub fn network_actor_count(&self) -> usize {
        self.network_actors.len()
    }

    // --- Queues ---

    pub fn drain_events(&self) -> Vec<NetDriverEvent> {
        let mut batch = Vec::with_capacity(self.events.len());
        while let Some(event) = self.events.pop() {
            batch.push(event);
        }
        batch
    }

    pub fn drain_destroy_notices(&self) -> Vec<DestroyNotice> {
        let mut batch = Vec::with_capacity(self.destroy_notices.len());
        while let Some(notice) = self.destroy_notices.pop() {
            batch.push(notice);
        }
        batch
    }

    // --- Frame hooks ---

    pub(crate) fn tick_dispatch(&self, _delta_seconds: f64) {
        self.dispatch_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn tick_flush(&self, _delta_seconds: f64) {
        self.flush_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dispatch_count(&self) -> u64 {
        self.dispatch_count.load(Ordering::Relaxed)
    }

    pub fn flush_count(&self) -> u64 {
        self.flush_count.load(Ordering::Relaxed)
    }
}

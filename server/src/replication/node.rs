// related_world_server/server/src/replication/node.rs
use crate::core::types::{ActorId, ConnectionId, RelatedWorldName, Vec3, WorldDomain};
use crate::entities::actor::ActorClass;
use smallvec::SmallVec;
use std::sync::Arc;

/// Owning related world of an actor or viewer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorldTag {
    pub name: RelatedWorldName,
    pub domain: WorldDomain,
}

/// What the graph needs to know about one actor this frame.
#[derive(Clone, Debug)]
pub struct ActorView {
    pub id: ActorId,
    pub class: Arc<ActorClass>,
    pub owner: Option<ActorId>,
    pub net_connection: Option<ConnectionId>,
    pub pending_kill: bool,
    /// Location in the persistent world's zero-origin frame.
    pub common_location: Vec3,
    pub world: Option<WorldTag>,
}

impl ActorView {
    pub fn domain(&self) -> WorldDomain {
        self.world.as_ref().map_or(WorldDomain::Public, |w| w.domain)
    }
}

/// A connection's point of view for one gather pass.
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectionViewer {
    pub connection: ConnectionId,
    pub parent: Option<ConnectionId>,
    pub location: Vec3,
    pub world: Option<WorldTag>,
}

impl ConnectionViewer {
    pub fn is_in_world(&self, name: &str) -> bool {
        self.world.as_ref().map_or(false, |w| &*w.name == name)
    }
}

/// Read access to actor state, supplied by whoever owns the worlds.
pub trait ReplicationView {
    fn actor_view(&self, actor: ActorId) -> Option<ActorView>;
}

pub type GatherList = SmallVec<[ActorId; 32]>;

pub trait ReplicationGraphNode: Send + Sync {
    fn name(&self) -> &str;
    fn notify_add_actor(&mut self, actor: &ActorView);
    fn notify_remove_actor(&mut self, actor: ActorId) -> bool;
    fn prepare_for_replication(&mut self, _view: &dyn ReplicationView) {}
    fn gather_actor_lists(&self, viewer: &ConnectionViewer, out: &mut GatherList);
    fn actor_count(&self) -> usize;
}

/// Flat list, gathered in full for every viewer.
#[derive(Debug, Default)]
pub struct ActorListNode {
    name: String,
    actors: Vec<ActorId>,
}

impl ActorListNode {
    pub fn new(name: impl Into<String>) -> Self {
        ActorListNode { name: name.into(), actors: Vec::new() }
    }

    pub fn contains(&self, actor: ActorId) -> bool {
        self.actors.contains(&actor)
    }

    pub fn actors(&self) -> &[ActorId] {
        &self.actors
    }
}

impl ReplicationGraphNode for ActorListNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn notify_add_actor(&mut self, actor: &ActorView) {
        if !self.actors.contains(&actor.id) {
            self.actors.push(actor.id);
        }
    }

    fn notify_remove_actor(&mut self, actor: ActorId) -> bool {
        let before = self.actors.len();
        self.actors.retain(|a| *a != actor);
        self.actors.len() != before
    }

    fn gather_actor_lists(&self, _viewer: &ConnectionViewer, out: &mut GatherList) {
        out.extend(self.actors.iter().copied());
    }

    fn actor_count(&self) -> usize {
        self.actors.len()
    }
}

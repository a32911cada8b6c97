// related_world_server/server/src/replication/domain.rs
use super::grid::GridSpatializationNode;
use super::node::{ActorView, ConnectionViewer, GatherList, ReplicationGraphNode, ReplicationView};
use crate::core::types::{ActorId, RelatedWorldName, WorldDomain};
use ahash::AHashMap;
use tracing::{debug, warn};

/// Destination of every actor of one related world within a domain.
#[derive(Debug)]
pub struct DomainRoutingRule {
    pub world: RelatedWorldName,
    pub node: GridSpatializationNode,
}

/// Routes actors of a Private or Isolated domain into one grid per related
/// world. Grids are created from a template on the first actor seen for a
/// world and reused afterwards.
#[derive(Debug)]
pub struct DomainRouterNode {
    name: String,
    domain: WorldDomain,
    cell_size: f64,
    query_radius: f64,
    rules: AHashMap<RelatedWorldName, DomainRoutingRule>,
    actor_rules: AHashMap<ActorId, RelatedWorldName>,
    rules_created: u64,
}

impl DomainRouterNode {
    pub fn new(domain: WorldDomain, cell_size: f64, query_radius: f64) -> Self {
        DomainRouterNode {
            name: format!("{}Router", domain),
            domain,
            cell_size,
            query_radius,
            rules: AHashMap::new(),
            actor_rules: AHashMap::new(),
            rules_created: 0,
        }
    }

    pub fn domain(&self) -> WorldDomain {
        self.domain
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Total rules ever created, including ones dropped on unload.
    pub fn rules_created(&self) -> u64 {
        self.rules_created
    }

    pub fn rule(&self, world: &str) -> Option<&DomainRoutingRule> {
        self.rules.get(world)
    }

    pub fn world_of(&self, actor: ActorId) -> Option<&RelatedWorldName> {
        self.actor_rules.get(&actor)
    }

    /// Forget a world's rule and every actor routed through it.
    pub fn remove_rule(&mut self, world: &str) -> bool {
        let Some(rule) = self.rules.remove(world) else {
            return false;
        };
        self.actor_rules.retain(|_, w| **w != *rule.world);
        debug!(router = %self.name, world = %rule.world, "Routing rule removed");
        true
    }

    fn rule_for(&mut self, world: &RelatedWorldName) -> &mut DomainRoutingRule {
        let (name, domain, cell_size, query_radius) = (&self.name, self.domain, self.cell_size, self.query_radius);
        let created = &mut self.rules_created;
        self.rules.entry(world.clone()).or_insert_with(|| {
            *created += 1;
            debug!(router = %name, %domain, world = %world, "Routing rule created");
            DomainRoutingRule {
                world: world.clone(),
                node: GridSpatializationNode::new(format!("{}/{}", name, world), cell_size, query_radius),
            }
        })
    }
}

impl ReplicationGraphNode for DomainRouterNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn notify_add_actor(&mut self, actor: &ActorView) {
        let Some(world) = actor.world.as_ref().map(|w| w.name.clone()) else {
            warn!(router = %self.name, actor = %actor.id, "Actor without related world sent to domain router");
            return;
        };
        if let Some(previous) = self.actor_rules.get(&actor.id).cloned() {
            if previous != world {
                if let Some(rule) = self.rules.get_mut(&previous) {
                    rule.node.notify_remove_actor(actor.id);
                }
            }
        }
        self.rule_for(&world).node.notify_add_actor(actor);
        self.actor_rules.insert(actor.id, world);
    }

    fn notify_remove_actor(&mut self, actor: ActorId) -> bool {
        let Some(world) = self.actor_rules.remove(&actor) else {
            return false;
        };
        self.rules
            .get_mut(&world)
            .map_or(false, |rule| rule.node.notify_remove_actor(actor))
    }

    fn prepare_for_replication(&mut self, view: &dyn ReplicationView) {
        for rule in self.rules.values_mut() {
            rule.node.prepare_for_replication(view);
        }
        let rules = &self.rules;
        self.actor_rules
            .retain(|actor, world| rules.get(world).map_or(false, |r| r.node.location_of(*actor).is_some()));
    }

    /// Isolated worlds are visible only from inside themselves.
    fn gather_actor_lists(&self, viewer: &ConnectionViewer, out: &mut GatherList) {
        match self.domain {
            WorldDomain::Isolated => {
                if let Some(tag) = viewer.world.as_ref() {
                    if let Some(rule) = self.rules.get(&tag.name) {
                        rule.node.gather_actor_lists(viewer, out);
                    }
                }
            }
            _ => {
                for rule in self.rules.values() {
                    rule.node.gather_actor_lists(viewer, out);
                }
            }
        }
    }

    fn actor_count(&self) -> usize {
        self.actor_rules.len()
    }
}

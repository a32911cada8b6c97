// related_world_server/server/src/replication/grid.rs
use super::node::{ActorView, ConnectionViewer, GatherList, ReplicationGraphNode, ReplicationView};
use crate::core::types::{ActorId, Vec3};
use ahash::AHashMap;
use smallvec::SmallVec;
use tracing::{debug, trace};

type CellKey = (i64, i64);

/// 2D grid over common-frame locations. Every position stored here has
/// already had its world translation and floating origin applied, so actors
/// from different worlds bucket consistently.
#[derive(Debug)]
pub struct GridSpatializationNode {
    name: String,
    cell_size: f64,
    query_radius: f64,
    cells: AHashMap<CellKey, SmallVec<[ActorId; 8]>>,
    actors: AHashMap<ActorId, (Vec3, CellKey)>,
}

impl GridSpatializationNode {
    pub fn new(name: impl Into<String>, cell_size: f64, query_radius: f64) -> Self {
        let name = name.into();
        debug!(node = %name, cell_size, query_radius, "Grid spatialization node created");
        GridSpatializationNode {
            name,
            cell_size: cell_size.max(1.0),
            query_radius,
            cells: AHashMap::new(),
            actors: AHashMap::new(),
        }
    }

    #[inline]
    fn cell_of(&self, location: Vec3) -> CellKey {
        (
            (location.x / self.cell_size).floor() as i64,
            (location.y / self.cell_size).floor() as i64,
        )
    }

    fn cells_in_radius(&self, center: Vec3, radius: f64) -> impl Iterator<Item = CellKey> {
        let (min_x, min_y) = self.cell_of(Vec3::new(center.x - radius, center.y - radius, 0.0));
        let (max_x, max_y) = self.cell_of(Vec3::new(center.x + radius, center.y + radius, 0.0));
        (min_y..=max_y).flat_map(move |y| (min_x..=max_x).map(move |x| (x, y)))
    }

    pub fn update_actor(&mut self, actor: ActorId, location: Vec3) {
        let new_cell = self.cell_of(location);
        match self.actors.get_mut(&actor) {
            Some((stored, old_cell)) => {
                *stored = location;
                if *old_cell != new_cell {
                    let old = *old_cell;
                    *old_cell = new_cell;
                    self.remove_from_cell(old, actor);
                    self.cells.entry(new_cell).or_default().push(actor);
                }
            }
            None => {
                self.actors.insert(actor, (location, new_cell));
                self.cells.entry(new_cell).or_default().push(actor);
            }
        }
    }

    fn remove_from_cell(&mut self, cell: CellKey, actor: ActorId) {
        if let Some(ids) = self.cells.get_mut(&cell) {
            ids.retain(|a| *a != actor);
            if ids.is_empty() {
                self.cells.remove(&cell);
            }
        }
    }

    pub fn location_of(&self, actor: ActorId) -> Option<Vec3> {
        self.actors.get(&actor).map(|(loc, _)| *loc)
    }

    pub fn query(&self, center: Vec3, radius: f64) -> Vec<ActorId> {
        let radius_squared = radius * radius;
        let mut found = Vec::new();
        for cell in self.cells_in_radius(center, radius) {
            let Some(ids) = self.cells.get(&cell) else {
                continue;
            };
            for id in ids {
                if let Some((location, _)) = self.actors.get(id) {
                    if location.dist_squared_2d(&center) <= radius_squared {
                        found.push(*id);
                    }
                }
            }
        }
        found
    }
}

impl ReplicationGraphNode for GridSpatializationNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn notify_add_actor(&mut self, actor: &ActorView) {
        self.update_actor(actor.id, actor.common_location);
    }

    fn notify_remove_actor(&mut self, actor: ActorId) -> bool {
        match self.actors.remove(&actor) {
            Some((_, cell)) => {
                self.remove_from_cell(cell, actor);
                true
            }
            None => false,
        }
    }

    /// Re-read every tracked actor's common-frame location.
    fn prepare_for_replication(&mut self, view: &dyn ReplicationView) {
        let ids: Vec<ActorId> = self.actors.keys().copied().collect();
        for id in ids {
            match view.actor_view(id) {
                Some(actor) if !actor.pending_kill => self.update_actor(id, actor.common_location),
                _ => {
                    trace!(node = %self.name, actor = %id, "Dropping vanished actor from grid");
                    self.notify_remove_actor(id);
                }
            }
        }
    }

    fn gather_actor_lists(&self, viewer: &ConnectionViewer, out: &mut GatherList) {
        out.extend(self.query(viewer.location, self.query_radius));
    }

    fn actor_count(&self) -> usize {
        self.actors.len()
    }
}

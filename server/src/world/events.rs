// related_world_server/server/src/world/events.rs
use crate::core::types::{ActorId, IntVector, RelatedWorldName, WorldHandle};
use crossbeam_queue::SegQueue;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Ordered observer list. Delivery is synchronous and FIFO by subscription
/// order. Listeners may subscribe or unsubscribe from inside a broadcast;
/// the change takes effect on the next broadcast.
pub struct Multicast<T> {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(SubscriptionId, Listener<T>)>>,
}

impl<T> Multicast<T> {
    pub fn new() -> Self {
        Multicast {
            next_id: AtomicU64::new(1),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, Arc::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub fn broadcast(&self, value: &T) {
        for listener in self.snapshot() {
            listener(value);
        }
    }

    /// Snapshot the current listeners for a broadcast delivered later, once
    /// the caller no longer holds any lock a listener might need.
    pub fn prepare(&self, value: T) -> PreparedBroadcast<T> {
        PreparedBroadcast { listeners: self.snapshot(), value }
    }

    fn snapshot(&self) -> Vec<Listener<T>> {
        self.listeners.read().iter().map(|(_, l)| l.clone()).collect()
    }

    pub fn clear(&self) {
        self.listeners.write().clear();
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }
}

#[must_use = "a prepared broadcast does nothing until delivered"]
pub struct PreparedBroadcast<T> {
    listeners: Vec<Listener<T>>,
    value: T,
}

impl<T> PreparedBroadcast<T> {
    pub fn deliver(self) {
        for listener in &self.listeners {
            listener(&self.value);
        }
    }
}

impl<T> std::fmt::Debug for PreparedBroadcast<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedBroadcast").field("listeners", &self.listeners.len()).finish()
    }
}

impl<T> Default for Multicast<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Multicast<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multicast").field("listeners", &self.len()).finish()
    }
}

/// Registry-level notifications. Queued by the director and drained once per
/// frame by the server, never mid-gather.
#[derive(Clone, Debug, PartialEq)]
pub enum WorldEvent {
    WorldLoaded { name: RelatedWorldName, handle: WorldHandle },
    WorldUnloaded { name: RelatedWorldName, handle: WorldHandle },
    WorldTranslated { name: RelatedWorldName, translation: IntVector },
    ActorChangedWorld {
        actor: ActorId,
        from: Option<RelatedWorldName>,
        to: Option<RelatedWorldName>,
    },
}

pub struct WorldEventQueue {
    events: SegQueue<WorldEvent>,
}

impl WorldEventQueue {
    pub fn new() -> Self {
        WorldEventQueue { events: SegQueue::new() }
    }

    pub fn push(&self, event: WorldEvent) {
        self.events.push(event);
    }

    pub fn pop(&self) -> Option<WorldEvent> {
        self.events.pop()
    }

    pub fn drain(&self) -> Vec<WorldEvent> {
        let mut batch = Vec::with_capacity(self.events.len());
        while let Some(event) = self.events.pop() {
            batch.push(event);
        }
        batch
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }
}

impl Default for WorldEventQueue {
    fn default() -> Self {
        Self::new()
    }
}

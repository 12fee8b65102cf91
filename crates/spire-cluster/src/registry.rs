//! Arena of known nodes, addressed by stable index.
//!
//! Readers load the current arena snapshot without locking. Writers (the
//! tender, one per process) copy the arena, change it, and swap it in under
//! a mutex, so a command never observes a half-applied change. Indices are
//! handed out lowest-free-first and, in shared-memory mode, mirror the
//! node's index in the shared segment.

use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use rand::Rng;

use crate::node::Node;

type Arena = Vec<Option<Arc<Node>>>;

pub struct NodeRegistry {
    nodes: ArcSwap<Arena>,
    write: Mutex<()>,
}

impl std::fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRegistry")
            .field("active", &self.active_count())
            .finish_non_exhaustive()
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            nodes: ArcSwap::from_pointee(Vec::new()),
            write: Mutex::new(()),
        }
    }

    /// Adds a node at the lowest free index. `make` receives that index.
    pub fn insert_with(&self, make: impl FnOnce(usize) -> Node) -> Arc<Node> {
        let _guard = self.write.lock();
        let mut arena: Arena = (**self.nodes.load()).clone();
        let index = arena
            .iter()
            .position(Option::is_none)
            .unwrap_or(arena.len());
        let node = Arc::new(make(index));
        if index == arena.len() {
            arena.push(Some(Arc::clone(&node)));
        } else {
            arena[index] = Some(Arc::clone(&node));
        }
        self.nodes.store(Arc::new(arena));
        node
    }

    /// Places a node at a fixed index, replacing (and deactivating) any
    /// node already there.
    pub fn insert_at(&self, node: Node) -> Arc<Node> {
        let _guard = self.write.lock();
        let mut arena: Arena = (**self.nodes.load()).clone();
        let index = node.index();
        if arena.len() <= index {
            arena.resize(index + 1, None);
        }
        let node = Arc::new(node);
        if let Some(old) = arena[index].replace(Arc::clone(&node)) {
            old.deactivate();
        }
        self.nodes.store(Arc::new(arena));
        node
    }

    /// Removes and deactivates the node at `index`.
    pub fn remove(&self, index: usize) -> Option<Arc<Node>> {
        let _guard = self.write.lock();
        let mut arena: Arena = (**self.nodes.load()).clone();
        let removed = arena.get_mut(index).and_then(Option::take);
        if let Some(node) = &removed {
            node.deactivate();
            while matches!(arena.last(), Some(None)) {
                arena.pop();
            }
            self.nodes.store(Arc::new(arena));
        }
        removed
    }

    pub fn get(&self, index: usize) -> Option<Arc<Node>> {
        self.nodes.load().get(index).and_then(Clone::clone)
    }

    pub fn by_name(&self, name: &str) -> Option<Arc<Node>> {
        self.nodes
            .load()
            .iter()
            .flatten()
            .find(|n| n.name() == name)
            .cloned()
    }

    /// All nodes currently in the arena.
    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.nodes.load().iter().flatten().cloned().collect()
    }

    pub fn active_count(&self) -> usize {
        self.nodes
            .load()
            .iter()
            .flatten()
            .filter(|n| n.is_active())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.active_count() == 0
    }

    /// Picks an active node at random, for commands not bound to a
    /// partition (info, scans of a whole node).
    pub fn random_active(&self) -> Option<Arc<Node>> {
        let arena = self.nodes.load();
        let active: Vec<&Arc<Node>> = arena.iter().flatten().filter(|n| n.is_active()).collect();
        if active.is_empty() {
            return None;
        }
        let pick = rand::thread_rng().gen_range(0..active.len());
        Some(Arc::clone(active[pick]))
    }

    /// Deactivates and drops every node.
    pub fn clear(&self) {
        let _guard = self.write.lock();
        for node in self.nodes.load().iter().flatten() {
            node.deactivate();
        }
        self.nodes.store(Arc::new(Vec::new()));
    }
}

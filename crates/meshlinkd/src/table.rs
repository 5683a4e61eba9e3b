//! Live peer table

use crate::node::{Node, NodeSnapshot};
use meshlink_net::peer::PeerId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Live nodes keyed by peer id, at most one per id
#[derive(Default)]
pub struct PeerTable {
    nodes: RwLock<HashMap<PeerId, Arc<Node>>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `node`, returning the node it displaced, if any
    pub fn insert(&self, node: Arc<Node>) -> Option<Arc<Node>> {
        self.nodes.write().insert(node.id(), node)
    }

    /// Remove `node` only if it is still the entry for its id
    pub fn remove_node(&self, node: &Arc<Node>) -> bool {
        let mut nodes = self.nodes.write();
        match nodes.get(&node.id()) {
            Some(current) if Arc::ptr_eq(current, node) => {
                nodes.remove(&node.id());
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.nodes.read().values().cloned().collect()
    }

    /// Snapshots of every node, ordered by id
    pub fn snapshot(&self) -> Vec<NodeSnapshot> {
        let mut snapshot: Vec<_> = self.nodes().iter().map(|n| n.snapshot()).collect();
        snapshot.sort_by_key(|s| s.id);
        snapshot
    }
}

//! Iteration over master nodes that tolerates concurrent refreshes

use super::{Topology, TopologyCell};
use crate::node::ClusterNode;
use phloem_protocol::NodeAddr;
use std::sync::Arc;

/// Yields the masters of the published topology in address order
///
/// The iterator remembers the version it started from. If a newer snapshot
/// is published while iterating, it restarts once from the beginning of the
/// new snapshot; a second change ends the iteration.
pub struct NodeIterator {
    cell: TopologyCell,
    snapshot: Arc<Topology>,
    /// Address of the last node yielded from `snapshot`
    last: Option<NodeAddr>,
    restarted: bool,
    done: bool,
}

impl NodeIterator {
    pub fn new(cell: TopologyCell) -> Self {
        let snapshot = cell.load();
        Self { cell, snapshot, last: None, restarted: false, done: false }
    }

    /// Version of the snapshot currently being walked
    pub fn version(&self) -> u64 {
        self.snapshot.version()
    }
}

impl Iterator for NodeIterator {
    type Item = ClusterNode;

    fn next(&mut self) -> Option<ClusterNode> {
        if self.done {
            return None;
        }
        if self.cell.version() != self.snapshot.version() {
            if self.restarted {
                self.done = true;
                return None;
            }
            self.restarted = true;
            self.snapshot = self.cell.load();
            self.last = None;
        }
        let node = self.snapshot.node_after(self.last.as_ref()).cloned();
        match node {
            Some(node) => {
                self.last = Some(node.addr.clone());
                Some(node)
            }
            None => {
                self.done = true;
                None
            }
        }
    }
}

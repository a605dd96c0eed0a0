//! Cluster topology snapshots
//!
//! A [`Topology`] is an immutable picture of the cluster: the master nodes by
//! address, an id index, and a 16384-entry table mapping every slot to its
//! master. Snapshots are never mutated once published. A refresh builds a new
//! one and swaps it into the shared [`TopologyCell`], so readers always see a
//! complete table.

mod iter;
mod nodes;
mod slots;

pub use iter::NodeIterator;
pub use nodes::parse_cluster_nodes;
pub use slots::parse_cluster_slots;

use crate::error::{ClusterError, Result};
use crate::node::{ClusterNode, SlotRange};
use parking_lot::RwLock;
use phloem_protocol::{NodeAddr, Reply, CLUSTER_SLOTS};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;
use std::time::Instant;

/// Slot table entry for a slot nobody owns
const UNOWNED: u16 = u16::MAX;

/// What discovery records besides masters and their slots
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscoveryOptions {
    pub add_replicas: bool,
    pub expose_open_slots: bool,
}

/// Immutable snapshot of the cluster layout
#[derive(Debug, Clone)]
pub struct Topology {
    nodes: BTreeMap<NodeAddr, ClusterNode>,
    ids: HashMap<String, NodeAddr>,
    /// Index space of `table`
    masters: Vec<NodeAddr>,
    table: Box<[u16]>,
    version: u64,
    refreshed_at: Instant,
}

impl Default for Topology {
    fn default() -> Self {
        Self::empty()
    }
}

impl Topology {
    /// A snapshot with no nodes, served before the first refresh
    pub fn empty() -> Self {
        Self {
            nodes: BTreeMap::new(),
            ids: HashMap::new(),
            masters: Vec::new(),
            table: vec![UNOWNED; usize::from(CLUSTER_SLOTS)].into_boxed_slice(),
            version: 0,
            refreshed_at: Instant::now(),
        }
    }

    /// Validate discovered masters and build the slot table
    ///
    /// Every range must satisfy `start <= end < 16384` and no slot may be
    /// claimed by two ranges. The version is assigned when the snapshot is
    /// published.
    pub fn build(masters: Vec<ClusterNode>) -> Result<Self> {
        let mut nodes = BTreeMap::new();
        let mut stamps = Vec::new();

        for node in masters {
            if !node.is_master() {
                return Err(ClusterError::Topology(format!(
                    "node {} is not a master",
                    node.addr
                )));
            }
            if node.slots.iter().any(|r| !r.is_valid()) {
                return Err(ClusterError::Topology("Slot region for node is invalid".to_string()));
            }
            if nodes.contains_key(&node.addr) {
                return Err(ClusterError::Topology(
                    "Duplicate addresses in cluster nodes response".to_string(),
                ));
            }
            stamps.extend(node.slots.iter().map(|r| (*r, node.addr.clone())));
            nodes.insert(node.addr.clone(), node);
        }
        if stamps.is_empty() {
            return Err(ClusterError::Topology("No slot information".to_string()));
        }

        let masters: Vec<NodeAddr> = nodes.keys().cloned().collect();
        let index: HashMap<&NodeAddr, u16> =
            masters.iter().enumerate().map(|(i, addr)| (addr, i as u16)).collect();

        stamps.sort_by_key(|(range, _)| range.start);
        let mut table = vec![UNOWNED; usize::from(CLUSTER_SLOTS)].into_boxed_slice();
        for (range, addr) in &stamps {
            let owner = index[addr];
            for slot in range.start..=range.end {
                let entry = &mut table[usize::from(slot)];
                if *entry != UNOWNED {
                    return Err(ClusterError::Topology(
                        "Different node holds same slot".to_string(),
                    ));
                }
                *entry = owner;
            }
        }

        let ids = nodes
            .values()
            .filter(|n| !n.id.is_empty())
            .map(|n| (n.id.clone(), n.addr.clone()))
            .collect();

        Ok(Self { nodes, ids, masters, table, version: 0, refreshed_at: Instant::now() })
    }

    /// A copy of this snapshot with `slot` re-pointed to `addr`
    ///
    /// Used when a MOVED redirect arrives but the cluster could not be
    /// rediscovered. An address not yet known is added as an id-less master.
    pub fn with_slot_owner(&self, slot: u16, addr: &NodeAddr) -> Self {
        let mut next = self.clone();
        if let Some(old) = next.addr_for_slot(slot).cloned() {
            if let Some(node) = next.nodes.get_mut(&old) {
                carve_slot(&mut node.slots, slot);
            }
        }

        let owner = match next.masters.iter().position(|a| a == addr) {
            Some(i) => i as u16,
            None => {
                next.masters.push(addr.clone());
                (next.masters.len() - 1) as u16
            }
        };
        next.nodes
            .entry(addr.clone())
            .or_insert_with(|| ClusterNode::master(addr.clone()))
            .slots
            .push(SlotRange::single(slot));
        next.table[usize::from(slot)] = owner;
        next
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn refreshed_at(&self) -> Instant {
        self.refreshed_at
    }

    /// True before the first successful discovery
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn addr_for_slot(&self, slot: u16) -> Option<&NodeAddr> {
        let owner = *self.table.get(usize::from(slot))?;
        self.masters.get(usize::from(owner))
    }

    pub fn node_for_slot(&self, slot: u16) -> Option<&ClusterNode> {
        self.nodes.get(self.addr_for_slot(slot)?)
    }

    pub fn node(&self, addr: &NodeAddr) -> Option<&ClusterNode> {
        self.nodes.get(addr)
    }

    pub fn node_by_id(&self, id: &str) -> Option<&ClusterNode> {
        self.nodes.get(self.ids.get(id)?)
    }

    pub fn contains(&self, addr: &NodeAddr) -> bool {
        self.nodes.contains_key(addr)
    }

    /// Masters ordered by address
    pub fn nodes(&self) -> impl Iterator<Item = &ClusterNode> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// The first master ordered after `addr`, or the first master when
    /// `addr` is `None`
    pub(crate) fn node_after(&self, addr: Option<&NodeAddr>) -> Option<&ClusterNode> {
        match addr {
            Some(addr) => self.nodes.range((Bound::Excluded(addr), Bound::Unbounded)).next(),
            None => self.nodes.iter().next(),
        }
        .map(|(_, node)| node)
    }

    /// Number of slots that have an owner
    pub fn covered_slots(&self) -> usize {
        self.table.iter().filter(|&&owner| owner != UNOWNED).count()
    }

    /// Every master and replica address, masters first
    pub fn all_addrs(&self) -> impl Iterator<Item = &NodeAddr> {
        self.nodes
            .values()
            .map(|n| &n.addr)
            .chain(self.nodes.values().flat_map(|n| n.replicas.iter().map(|r| &r.addr)))
    }
}

fn carve_slot(ranges: &mut Vec<SlotRange>, slot: u16) {
    let mut out = Vec::with_capacity(ranges.len() + 1);
    for range in ranges.drain(..) {
        if !range.contains(slot) {
            out.push(range);
            continue;
        }
        if range.start < slot {
            out.push(SlotRange::new(range.start, slot - 1));
        }
        if slot < range.end {
            out.push(SlotRange::new(slot + 1, range.end));
        }
    }
    *ranges = out;
}

/// Parse a discovery reply into masters (with replicas if requested)
///
/// `source_host` is the host of the node that answered; it replaces empty
/// hosts in the reply.
pub fn parse_discovery_reply(
    reply: &Reply,
    use_cluster_slots: bool,
    source_host: &str,
    options: DiscoveryOptions,
) -> Result<Vec<ClusterNode>> {
    if let Some(msg) = reply.as_error() {
        return Err(ClusterError::Topology(format!("discovery command failed: {msg}")));
    }
    if use_cluster_slots {
        parse_cluster_slots(reply, source_host, options.add_replicas)
    } else {
        let text = reply
            .as_str()
            .ok_or_else(|| ClusterError::Topology("Unexpected reply type".to_string()))?;
        parse_cluster_nodes(text, source_host, options)
    }
}

/// Nodes to ask during a refresh, in order and without repeats
///
/// The hint (typically the node that sent MOVED) goes first, then the known
/// masters, then the configured seeds.
pub fn refresh_candidates(
    hint: Option<&NodeAddr>,
    current: &Topology,
    seeds: &[NodeAddr],
) -> Vec<NodeAddr> {
    let mut out: Vec<NodeAddr> = Vec::with_capacity(current.len() + seeds.len() + 1);
    let all = hint.into_iter().chain(current.nodes.keys()).chain(seeds.iter());
    for addr in all {
        if !out.contains(addr) {
            out.push(addr.clone());
        }
    }
    out
}

/// Shared, atomically replaceable snapshot
#[derive(Debug, Clone, Default)]
pub struct TopologyCell {
    current: Arc<RwLock<Arc<Topology>>>,
}

impl TopologyCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current snapshot
    pub fn load(&self) -> Arc<Topology> {
        self.current.read().clone()
    }

    pub fn version(&self) -> u64 {
        self.current.read().version
    }

    /// Publish `topology` as the next version and return it
    pub fn publish(&self, mut topology: Topology) -> Arc<Topology> {
        let mut current = self.current.write();
        topology.version = current.version + 1;
        let next = Arc::new(topology);
        *current = next.clone();
        next
    }
}

//! Cluster node descriptions

use phloem_protocol::{NodeAddr, MAX_SLOT};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Master,
    Slave,
}

/// Inclusive slot range `[start, end]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotRange {
    pub start: u16,
    pub end: u16,
}

impl SlotRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn single(slot: u16) -> Self {
        Self { start: slot, end: slot }
    }

    /// `start <= end <= 16383`
    pub fn is_valid(&self) -> bool {
        self.start <= self.end && self.end <= MAX_SLOT
    }

    pub fn contains(&self, slot: u16) -> bool {
        (self.start..=self.end).contains(&slot)
    }

    /// Number of slots in the range
    pub fn count(&self) -> usize {
        usize::from(self.end.saturating_sub(self.start)) + 1
    }
}

impl fmt::Display for SlotRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpenSlotState {
    /// This node is handing the slot to `remote`
    Migrating,
    /// This node is receiving the slot from `remote`
    Importing,
}

/// A slot in the middle of a migration, as reported by CLUSTER NODES
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OpenSlot {
    pub slot: u16,
    pub state: OpenSlotState,
    /// Id of the node on the other side of the migration
    pub remote: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterNode {
    /// Node id; empty when discovered through CLUSTER SLOTS without ids
    pub id: String,
    pub addr: NodeAddr,
    pub role: Role,
    /// Slot ranges served by this node (masters only)
    pub slots: Vec<SlotRange>,
    /// Replicas of this master, when replica discovery is on
    pub replicas: Vec<ClusterNode>,
    /// Migrating and importing slots, when open-slot exposure is on
    pub open_slots: Vec<OpenSlot>,
}

impl ClusterNode {
    pub fn new(id: impl Into<String>, addr: NodeAddr, role: Role) -> Self {
        Self {
            id: id.into(),
            addr,
            role,
            slots: Vec::new(),
            replicas: Vec::new(),
            open_slots: Vec::new(),
        }
    }

    pub fn master(addr: NodeAddr) -> Self {
        Self::new(String::new(), addr, Role::Master)
    }

    pub fn is_master(&self) -> bool {
        self.role == Role::Master
    }

    /// Number of slots served
    pub fn slot_count(&self) -> usize {
        self.slots.iter().map(SlotRange::count).sum()
    }
}

//! CLUSTER SLOTS reply parsing
//!
//! Each row is `[start, end, master, replica...]` where a node entry is
//! `[ip, port, id?, ...]`.

use crate::error::{ClusterError, Result};
use crate::node::{ClusterNode, Role, SlotRange};
use phloem_protocol::{NodeAddr, Reply};
use std::collections::HashMap;

fn topology_err(msg: &str) -> ClusterError {
    ClusterError::Topology(msg.to_string())
}

/// Parse a CLUSTER SLOTS reply into masters
///
/// Rows naming the same master are merged into one node. Replicas are kept
/// only when `add_replicas` is set.
pub fn parse_cluster_slots(
    reply: &Reply,
    source_host: &str,
    add_replicas: bool,
) -> Result<Vec<ClusterNode>> {
    let rows = reply.as_array().ok_or_else(|| topology_err("Unexpected reply type"))?;
    if rows.is_empty() {
        return Err(topology_err("No slot information"));
    }

    let mut masters: Vec<ClusterNode> = Vec::new();
    let mut by_addr: HashMap<NodeAddr, usize> = HashMap::new();

    for row in rows {
        let row = row.as_array().ok_or_else(|| topology_err("Unexpected reply type"))?;
        if row.len() < 3 {
            return Err(topology_err("Slot row has too few elements"));
        }
        let start = slot_bound(&row[0])?;
        let end = slot_bound(&row[1])?;
        if start > end {
            return Err(topology_err("Slot region for node is invalid"));
        }

        let master = parse_node_entry(&row[2], source_host, Role::Master)?;
        let index = *by_addr.entry(master.addr.clone()).or_insert_with(|| {
            masters.push(master);
            masters.len() - 1
        });
        let node = &mut masters[index];
        node.slots.push(SlotRange::new(start, end));

        if add_replicas {
            for entry in &row[3..] {
                let replica = parse_node_entry(entry, source_host, Role::Slave)?;
                if !node.replicas.iter().any(|r| r.addr == replica.addr) {
                    node.replicas.push(replica);
                }
            }
        }
    }
    Ok(masters)
}

fn slot_bound(value: &Reply) -> Result<u16> {
    let n = value.as_integer().ok_or_else(|| topology_err("Slot bound is not an integer"))?;
    u16::try_from(n).map_err(|_| topology_err("Slot region for node is invalid"))
}

fn parse_node_entry(entry: &Reply, source_host: &str, role: Role) -> Result<ClusterNode> {
    let fields = entry.as_array().ok_or_else(|| topology_err("Unexpected reply type"))?;
    if fields.len() < 2 {
        return Err(topology_err("Node entry has too few elements"));
    }
    let host = match &fields[0] {
        Reply::Nil => "",
        other => other.as_str().ok_or_else(|| topology_err("Invalid node address"))?,
    };
    let host = if host.is_empty() { source_host } else { host };
    let port = fields[1]
        .as_integer()
        .and_then(|p| u16::try_from(p).ok())
        .filter(|&p| p != 0)
        .ok_or_else(|| topology_err("Invalid port"))?;
    let id = fields.get(2).and_then(Reply::as_str).unwrap_or_default();
    Ok(ClusterNode::new(id, NodeAddr::new(host, port), role))
}

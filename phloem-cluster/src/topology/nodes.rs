//! CLUSTER NODES reply parsing
//!
//! One line per node:
//!
//! ```text
//! <id> <ip:port@cport[,hostname]> <flags> <primary_id> <ping-sent> <pong-recv> <config-epoch> <link-state> [<slot> ...]
//! ```

use super::DiscoveryOptions;
use crate::error::{ClusterError, Result};
use crate::node::{ClusterNode, OpenSlot, OpenSlotState, Role, SlotRange};
use phloem_protocol::NodeAddr;
use std::collections::HashMap;

const MANDATORY_FIELDS: usize = 8;

fn topology_err(msg: &str) -> ClusterError {
    ClusterError::Topology(msg.to_string())
}

/// Parse the text of a CLUSTER NODES reply into masters
///
/// Nodes flagged `noaddr` are skipped. Replicas are attached to their master
/// by primary id when `add_replicas` is set, and dropped otherwise.
pub fn parse_cluster_nodes(
    text: &str,
    source_host: &str,
    options: DiscoveryOptions,
) -> Result<Vec<ClusterNode>> {
    let mut masters: Vec<ClusterNode> = Vec::new();
    let mut replicas: Vec<(String, ClusterNode)> = Vec::new();
    let mut ranges_found = 0;

    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        let Some((node, primary_id)) = parse_line(line, source_host, options)? else {
            continue;
        };
        match node.role {
            Role::Master => {
                if masters.iter().any(|m| m.addr == node.addr) {
                    return Err(topology_err("Duplicate addresses in cluster nodes response"));
                }
                ranges_found += node.slots.len();
                masters.push(node);
            }
            Role::Slave if options.add_replicas => replicas.push((primary_id.to_string(), node)),
            Role::Slave => {}
        }
    }

    if ranges_found == 0 {
        return Err(topology_err("No slot information"));
    }

    if !replicas.is_empty() {
        let by_id: HashMap<String, usize> =
            masters.iter().enumerate().map(|(i, m)| (m.id.clone(), i)).collect();
        for (primary_id, replica) in replicas {
            // replicas of unknown masters are dropped
            if let Some(&i) = by_id.get(&primary_id) {
                masters[i].replicas.push(replica);
            }
        }
    }
    Ok(masters)
}

fn parse_line<'a>(
    line: &'a str,
    source_host: &str,
    options: DiscoveryOptions,
) -> Result<Option<(ClusterNode, &'a str)>> {
    let fields: Vec<&str> = line.split_ascii_whitespace().collect();
    if fields.len() < MANDATORY_FIELDS {
        return Err(topology_err("Mandatory fields missing"));
    }
    let (id, addr, flags, primary_id) = (fields[0], fields[1], fields[2], fields[3]);

    let mut role = None;
    for flag in flags.split(',') {
        match flag {
            "master" => role = Some(Role::Master),
            "slave" => role = Some(Role::Slave),
            "noaddr" => return Ok(None),
            _ => {}
        }
    }
    let role = role.ok_or_else(|| topology_err("Unknown role"))?;

    let mut node = ClusterNode::new(id, parse_node_addr(addr, source_host)?, role);
    if role == Role::Master {
        for token in &fields[MANDATORY_FIELDS..] {
            parse_slot_token(token, &mut node, options.expose_open_slots)?;
        }
    }
    Ok(Some((node, primary_id)))
}

/// `ip:port@cport[,hostname]`, keeping `ip:port`
fn parse_node_addr(field: &str, source_host: &str) -> Result<NodeAddr> {
    let end = field.find(&['@', ','][..]).unwrap_or(field.len());
    let (host, port) =
        field[..end].rsplit_once(':').ok_or_else(|| topology_err("Invalid node address"))?;
    let port = phloem_protocol::parse_port(port).ok_or_else(|| topology_err("Invalid port"))?;
    let host = if host.is_empty() { source_host } else { host };
    Ok(NodeAddr::new(host, port))
}

fn parse_slot_token(token: &str, node: &mut ClusterNode, expose_open_slots: bool) -> Result<()> {
    if let Some(open) = token.strip_prefix('[') {
        if expose_open_slots {
            node.open_slots.push(parse_open_slot(open)?);
        }
        return Ok(());
    }
    let invalid = || topology_err("Slot region for node is invalid");
    let range = match token.split_once('-') {
        Some((start, end)) => SlotRange::new(
            start.parse().map_err(|_| invalid())?,
            end.parse().map_err(|_| invalid())?,
        ),
        None => SlotRange::single(token.parse().map_err(|_| invalid())?),
    };
    node.slots.push(range);
    Ok(())
}

/// `N->-remote]` (migrating) or `N-<-remote]` (importing), opening bracket removed
fn parse_open_slot(token: &str) -> Result<OpenSlot> {
    let invalid = || topology_err("Invalid open slot");
    let body = token.strip_suffix(']').ok_or_else(invalid)?;
    let (slot, state, remote) = if let Some((slot, remote)) = body.split_once("->-") {
        (slot, OpenSlotState::Migrating, remote)
    } else if let Some((slot, remote)) = body.split_once("-<-") {
        (slot, OpenSlotState::Importing, remote)
    } else {
        return Err(invalid());
    };
    let slot = slot.parse().map_err(|_| invalid())?;
    Ok(OpenSlot { slot, state, remote: remote.to_string() })
}

//! Human readable rendering of replies and cluster layout

use phloem_cluster::{ClusterNode, Reply, Topology};
use std::fmt::Write;

/// Render a reply the way redis-cli does, nesting arrays with indentation
pub fn format_reply(reply: &Reply) -> String {
    let mut out = String::new();
    write_reply(&mut out, reply, 0);
    out
}

fn write_reply(out: &mut String, reply: &Reply, indent: usize) {
    match reply {
        Reply::Array(items) if !items.is_empty() => {
            let width = items.len().to_string().len();
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push('\n');
                    out.push_str(&" ".repeat(indent));
                }
                let _ = write!(out, "{:>width$}) ", i + 1);
                write_reply(out, item, indent + width + 2);
            }
        }
        Reply::Map(pairs) if !pairs.is_empty() => {
            for (i, (key, value)) in pairs.iter().enumerate() {
                if i > 0 {
                    out.push('\n');
                    out.push_str(&" ".repeat(indent));
                }
                let _ = write!(out, "{}# {key} => ", i + 1);
                write_reply(out, value, indent + 4);
            }
        }
        other => {
            let _ = write!(out, "{other}");
        }
    }
}

/// One line per slot range: `<range> <addr> <id>`, ordered by slot
pub fn format_slots(topology: &Topology) -> String {
    let mut rows: Vec<(u16, String)> = topology
        .nodes()
        .flat_map(|node| {
            node.slots.iter().map(move |range| (range.start, format!("{range} {} {}", node.addr, node.id)))
        })
        .collect();
    rows.sort_by_key(|(start, _)| *start);
    rows.into_iter().map(|(_, row)| row + "\n").collect()
}

/// One block per master with its slot count and replicas
pub fn format_nodes(topology: &Topology) -> String {
    let mut out = String::new();
    for node in topology.nodes() {
        write_node(&mut out, node);
    }
    let _ = writeln!(
        out,
        "{} masters, {} of 16384 slots covered (version {})",
        topology.len(),
        topology.covered_slots(),
        topology.version()
    );
    out
}

fn write_node(out: &mut String, node: &ClusterNode) {
    let id = if node.id.is_empty() { "-" } else { node.id.as_str() };
    let _ = writeln!(out, "{} {id} master slots={}", node.addr, node.slot_count());
    for open in &node.open_slots {
        let _ = writeln!(out, "  open slot {} {:?} {}", open.slot, open.state, open.remote);
    }
    for replica in &node.replicas {
        let _ = writeln!(out, "  replica {} {}", replica.addr, replica.id);
    }
}

//! Cluster redirect handling
//!
//! Nodes answer with MOVED or ASK when a slot lives elsewhere, and with
//! TRYAGAIN or CLUSTERDOWN while the cluster cannot serve it right now.
//! Every other error reply belongs to the application.

use crate::addr::NodeAddr;
use crate::resp::Reply;
use crate::slot::MAX_SLOT;
use thiserror::Error;

/// A cluster condition carried by an error reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Redirect {
    /// The slot now belongs to `addr`; the slot map is stale
    Moved { slot: u16, addr: NodeAddr },
    /// The slot is being migrated; retry once on `addr` after ASKING
    Ask { slot: u16, addr: NodeAddr },
    /// Multi-key operation during resharding; retry later
    TryAgain,
    /// The cluster is not serving this slot at the moment
    ClusterDown,
}

impl Redirect {
    /// Fill in the host of a redirect that left it empty
    pub fn with_source_host(self, host: &str) -> Self {
        match self {
            Redirect::Moved { slot, addr } => Redirect::Moved { slot, addr: addr.or_host(host) },
            Redirect::Ask { slot, addr } => Redirect::Ask { slot, addr: addr.or_host(host) },
            other => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Failed to parse redirect: {0:?}")]
pub struct RedirectError(pub String);

/// ASKING, sent right before a command retried after an ASK redirect
pub const ASKING: &[u8] = b"*1\r\n$6\r\nASKING\r\n";

/// CLUSTER SLOTS discovery request
pub const CLUSTER_SLOTS_REQUEST: &[u8] = b"*2\r\n$7\r\nCLUSTER\r\n$5\r\nSLOTS\r\n";

/// CLUSTER NODES discovery request
pub const CLUSTER_NODES_REQUEST: &[u8] = b"*2\r\n$7\r\nCLUSTER\r\n$5\r\nNODES\r\n";

/// Classify a reply; anything but a cluster error yields `Ok(None)`
pub fn classify(reply: &Reply) -> Result<Option<Redirect>, RedirectError> {
    match reply.as_error() {
        Some(msg) => parse_redirect(msg),
        None => Ok(None),
    }
}

/// Parse the text of an error reply (without the leading `-`)
///
/// Prefixes are case-sensitive, as nodes always send them upper case.
///
/// ```
/// use phloem_protocol::{parse_redirect, NodeAddr, Redirect};
///
/// let redirect = parse_redirect("MOVED 3999 127.0.0.1:6381").unwrap();
/// assert_eq!(
///     redirect,
///     Some(Redirect::Moved { slot: 3999, addr: NodeAddr::new("127.0.0.1", 6381) })
/// );
/// ```
pub fn parse_redirect(msg: &str) -> Result<Option<Redirect>, RedirectError> {
    let mut parts = msg.split_ascii_whitespace();
    let redirect = match parts.next() {
        Some("MOVED") => {
            let (slot, addr) = slot_and_addr(msg, &mut parts)?;
            Redirect::Moved { slot, addr }
        }
        Some("ASK") => {
            let (slot, addr) = slot_and_addr(msg, &mut parts)?;
            Redirect::Ask { slot, addr }
        }
        Some("TRYAGAIN") => Redirect::TryAgain,
        Some("CLUSTERDOWN") => Redirect::ClusterDown,
        _ => return Ok(None),
    };
    Ok(Some(redirect))
}

fn slot_and_addr<'a>(
    msg: &str,
    parts: &mut impl Iterator<Item = &'a str>,
) -> Result<(u16, NodeAddr), RedirectError> {
    let invalid = || RedirectError(msg.to_string());
    let slot = parts
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .filter(|&s| s <= MAX_SLOT)
        .ok_or_else(invalid)?;
    let addr = parts.next().and_then(|a| NodeAddr::parse(a).ok()).ok_or_else(invalid)?;
    if parts.next().is_some() {
        return Err(invalid());
    }
    Ok((slot, addr))
}

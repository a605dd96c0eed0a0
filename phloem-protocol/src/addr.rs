//! Node addresses as reported by the cluster

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// `host:port` of a cluster node
///
/// The host is kept as text because nodes may announce hostnames as well as
/// IPv4 or IPv6 literals. IPv6 hosts are stored without brackets.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeAddr {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddrError {
    #[error("address {0:?} has no port")]
    MissingPort(String),
    #[error("invalid port in address {0:?}")]
    InvalidPort(String),
}

impl NodeAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }

    /// Parse `host:port`, splitting at the last colon
    ///
    /// An empty host is allowed; callers substitute the host of the node
    /// that reported the address. Ports must be in `1..=65535`.
    ///
    /// ```
    /// use phloem_protocol::NodeAddr;
    ///
    /// let addr = NodeAddr::parse("[::1]:7000").unwrap();
    /// assert_eq!(addr.host, "::1");
    /// assert_eq!(addr.to_string(), "[::1]:7000");
    /// ```
    pub fn parse(s: &str) -> Result<Self, AddrError> {
        let (host, port) = s.rsplit_once(':').ok_or_else(|| AddrError::MissingPort(s.to_string()))?;
        let port = parse_port(port).ok_or_else(|| AddrError::InvalidPort(s.to_string()))?;
        let host = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')).unwrap_or(host);
        Ok(Self::new(host, port))
    }

    /// Replace an empty host with `fallback`
    pub fn or_host(mut self, fallback: &str) -> Self {
        if self.host.is_empty() {
            self.host = fallback.to_string();
        }
        self
    }
}

/// A port in `1..=65535`
pub fn parse_port(s: &str) -> Option<u16> {
    s.parse::<u16>().ok().filter(|&p| p != 0)
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for NodeAddr {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

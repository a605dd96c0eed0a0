//! Client configuration
//!
//! A [`ClusterConfig`] can be built in code or deserialized from TOML:
//!
//! ```toml
//! seeds = ["10.0.0.1:7000", "10.0.0.2:7000"]
//! connect_timeout = "500ms"
//! command_timeout = "2s"
//! max_retry_count = 5
//! password = "secret"
//! ```

use crate::error::{self, ClusterError};
use phloem_protocol::NodeAddr;
use phloem_transport::TransportOptions;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings for a cluster client
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    /// Initial nodes used for discovery, as `host:port`
    #[serde(default)]
    pub seeds: Vec<String>,
    /// Timeout for establishing a connection to a node
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    #[schemars(with = "String")]
    pub connect_timeout: Duration,
    /// Timeout for each send and reply; unset waits forever
    #[serde(default, with = "humantime_serde")]
    #[schemars(with = "Option<String>")]
    pub command_timeout: Option<Duration>,
    /// Retries allowed per command before giving up
    #[serde(default = "default_max_retry_count")]
    pub max_retry_count: u32,
    /// ACL user name sent with AUTH
    #[serde(default)]
    pub username: Option<String>,
    /// Password sent with AUTH on every new connection
    #[serde(default)]
    pub password: Option<String>,
    /// Record replicas in the topology
    #[serde(default)]
    pub add_replicas: bool,
    /// Record migrating and importing slots from CLUSTER NODES
    #[serde(default)]
    pub expose_open_slots: bool,
    /// Discover with CLUSTER SLOTS instead of CLUSTER NODES
    #[serde(default)]
    pub use_cluster_slots: bool,
    /// Logical database selected on every new connection
    #[serde(default)]
    pub select_db: u32,
    /// Minimum spacing of refreshes triggered by node failures
    #[serde(default = "default_refresh_throttle", with = "humantime_serde")]
    #[schemars(with = "String")]
    pub refresh_throttle: Duration,
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_max_retry_count() -> u32 {
    5
}

fn default_refresh_throttle() -> Duration {
    Duration::from_secs(1)
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            seeds: Vec::new(),
            connect_timeout: default_connect_timeout(),
            command_timeout: None,
            max_retry_count: default_max_retry_count(),
            username: None,
            password: None,
            add_replicas: false,
            expose_open_slots: false,
            use_cluster_slots: false,
            select_db: 0,
            refresh_throttle: default_refresh_throttle(),
        }
    }
}

impl ClusterConfig {
    /// Configuration with the given seeds (`host:port[,host:port...]`)
    /// and defaults everywhere else
    pub fn with_seeds(seeds: &str) -> error::Result<Self> {
        let seeds = parse_seeds(seeds)?.iter().map(ToString::to_string).collect();
        Ok(Self { seeds, ..Self::default() })
    }

    pub fn from_toml_str(text: &str) -> error::Result<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|e| ClusterError::Config(format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Parsed seed addresses, in configured order
    pub fn seed_addrs(&self) -> error::Result<Vec<NodeAddr>> {
        self.seeds.iter().map(|s| parse_seed(s)).collect()
    }

    pub fn validate(&self) -> error::Result<()> {
        if self.seeds.is_empty() {
            return Err(ClusterError::Config("at least one seed node is required".to_string()));
        }
        self.seed_addrs()?;
        if self.max_retry_count == 0 {
            return Err(ClusterError::Config("max_retry_count must be >= 1".to_string()));
        }
        if self.connect_timeout.is_zero() {
            return Err(ClusterError::Config("connect_timeout must be > 0".to_string()));
        }
        if self.command_timeout == Some(Duration::ZERO) {
            return Err(ClusterError::Config("command_timeout must be > 0".to_string()));
        }
        if self.username.is_some() && self.password.is_none() {
            return Err(ClusterError::Config("username requires a password".to_string()));
        }
        Ok(())
    }

    pub(crate) fn transport_options(&self) -> TransportOptions {
        TransportOptions { connect_timeout: self.connect_timeout, io_timeout: self.command_timeout }
    }
}

/// Parse a comma separated seed list
///
/// ```
/// use phloem_cluster::config::parse_seeds;
///
/// let seeds = parse_seeds("127.0.0.1:7000, 127.0.0.1:7001").unwrap();
/// assert_eq!(seeds.len(), 2);
/// assert_eq!(seeds[1].port, 7001);
/// ```
pub fn parse_seeds(list: &str) -> error::Result<Vec<NodeAddr>> {
    let seeds = list
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(parse_seed)
        .collect::<error::Result<Vec<_>>>()?;
    if seeds.is_empty() {
        return Err(ClusterError::Config(format!("no seed addresses in {list:?}")));
    }
    Ok(seeds)
}

fn parse_seed(seed: &str) -> error::Result<NodeAddr> {
    let addr = NodeAddr::parse(seed)
        .map_err(|e| ClusterError::Config(format!("invalid seed address: {e}")))?;
    if addr.host.is_empty() {
        return Err(ClusterError::Config(format!("seed {seed:?} has no host")));
    }
    Ok(addr)
}

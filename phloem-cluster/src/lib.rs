//! Redis Cluster client
//!
//! Commands are parsed to find their keys, hashed to one of 16384 slots and
//! sent to the master that owns the slot. The client keeps a slot map
//! discovered with `CLUSTER NODES` (or `CLUSTER SLOTS`) and follows the
//! cluster's redirects:
//!
//! - `MOVED`: the slot map is refreshed and the command is resent to the new owner
//! - `ASK`: the command is resent once to the importing node, preceded by `ASKING`
//! - `TRYAGAIN` / `CLUSTERDOWN`: the command is retried from the current slot map
//!
//! MGET, DEL, EXISTS and MSET whose keys span several slots are split per
//! slot and their replies merged back in key order.
//!
//! Two clients share this machinery: the blocking [`ClusterClient`] and the
//! tokio based [`AsyncClusterClient`].
//!
//! # Example
//!
//! ```no_run
//! use phloem_cluster::{ClusterClient, ClusterConfig};
//!
//! let config = ClusterConfig::with_seeds("127.0.0.1:7000,127.0.0.1:7001")?;
//! let mut client = ClusterClient::new(config)?;
//! client.connect()?;
//!
//! client.command(["MSET", "a", "1", "b", "2"])?;
//! let values = client.command(["MGET", "a", "b"])?;
//! println!("{values}");
//! # Ok::<(), phloem_cluster::ClusterError>(())
//! ```

pub mod async_client;
pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod fragment;
pub mod node;
pub(crate) mod registry;
pub mod topology;

pub use async_client::AsyncClusterClient;
pub use client::ClusterClient;
pub use config::ClusterConfig;
pub use error::{ClusterError, ErrorKind, Result};
pub use event::{ClusterEvent, EventCallback};
pub use node::{ClusterNode, OpenSlot, OpenSlotState, Role, SlotRange};
pub use topology::{NodeIterator, Topology};

pub use phloem_protocol::{slot_for_key, Command, NodeAddr, Reply};

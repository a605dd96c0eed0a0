//! Blocking cluster client
//!
//! [`ClusterClient`] routes every command to the master owning its slot and
//! follows MOVED, ASK, TRYAGAIN and CLUSTERDOWN replies until the command
//! completes or its retry budget runs out. Commands are sent one at a time,
//! or queued with the `append_*` methods and collected with
//! [`ClusterClient::get_reply`].

use crate::config::ClusterConfig;
use crate::error::{ClusterError, Result};
use crate::event::{ClusterEvent, EventSink};
use crate::fragment::Fragments;
use crate::node::ClusterNode;
use crate::registry::NodeRegistry;
use crate::topology::{
    parse_discovery_reply, refresh_candidates, DiscoveryOptions, NodeIterator, Topology,
    TopologyCell,
};
use bytes::{Bytes, BytesMut};
use phloem_protocol::redirect::{ASKING, CLUSTER_NODES_REQUEST, CLUSTER_SLOTS_REQUEST};
use phloem_protocol::{classify, encode_args, format_command, key_hash_slot, Command, NodeAddr};
use phloem_protocol::{Redirect, Reply};
use phloem_transport::{TcpTransportFactory, TransportFactory};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Where the next attempt of a command goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Target {
    /// Look the slot up in the current snapshot
    Resolve,
    /// A MOVED destination
    Node(NodeAddr),
    /// An ASK destination, preceded by ASKING
    Ask(NodeAddr),
}

/// A queued command waiting for [`ClusterClient::get_reply`]
enum Pending {
    Single { addr: NodeAddr, conn: u64 },
    Fragmented { fragments: Fragments, parts: Vec<(NodeAddr, u64)> },
    /// Sub-commands of an append that failed halfway; their replies are dropped
    Discard(Vec<(NodeAddr, u64)>),
}

pub struct ClusterClient {
    config: ClusterConfig,
    seeds: Vec<NodeAddr>,
    topology: TopologyCell,
    registry: NodeRegistry,
    events: EventSink,
    pipeline: VecDeque<Pending>,
}

impl ClusterClient {
    /// Create a client over TCP; no connection is made until [`connect`]
    /// or the first command
    ///
    /// [`connect`]: ClusterClient::connect
    pub fn new(config: ClusterConfig) -> Result<Self> {
        Self::with_factory(config, Box::new(TcpTransportFactory))
    }

    /// Create a client whose node connections come from `factory`
    pub fn with_factory(config: ClusterConfig, factory: Box<dyn TransportFactory>) -> Result<Self> {
        config.validate()?;
        let seeds = config.seed_addrs()?;
        let registry = NodeRegistry::new(&config, factory);
        Ok(Self {
            config,
            seeds,
            topology: TopologyCell::new(),
            registry,
            events: EventSink::default(),
            pipeline: VecDeque::new(),
        })
    }

    /// Load the initial slot map from the seeds
    pub fn connect(&mut self) -> Result<()> {
        self.refresh()
    }

    pub fn set_event_callback<F>(&mut self, callback: F)
    where
        F: Fn(ClusterEvent) + Send + Sync + 'static,
    {
        self.events.set(Arc::new(callback));
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    // ========================================================================
    // Routed commands
    // ========================================================================

    /// Run a command given as an argument list
    ///
    /// ```no_run
    /// use phloem_cluster::{ClusterClient, ClusterConfig};
    ///
    /// let mut client = ClusterClient::new(ClusterConfig::with_seeds("127.0.0.1:7000")?)?;
    /// client.command(["SET", "greeting", "hello"])?;
    /// let reply = client.command(["GET", "greeting"])?;
    /// assert_eq!(reply.as_str(), Some("hello"));
    /// # Ok::<(), phloem_cluster::ClusterError>(())
    /// ```
    pub fn command<I, A>(&mut self, args: I) -> Result<Reply>
    where
        I: IntoIterator<Item = A>,
        A: AsRef<[u8]>,
    {
        self.execute(Command::from_args(args)?)
    }

    /// Run a command built from a format string (see [`format_command`])
    pub fn command_fmt(&mut self, fmt: &str, args: &[&[u8]]) -> Result<Reply> {
        self.formatted_command(format_command(fmt, args)?)
    }

    /// Run an already encoded command
    pub fn formatted_command(&mut self, buf: impl Into<Bytes>) -> Result<Reply> {
        self.execute(Command::parse(buf)?)
    }

    /// Send a command to one node without routing or redirect handling
    pub fn command_to_node<I, A>(&mut self, addr: &NodeAddr, args: I) -> Result<Reply>
    where
        I: IntoIterator<Item = A>,
        A: AsRef<[u8]>,
    {
        self.formatted_command_to_node(addr, encode_args(args))
    }

    pub fn formatted_command_to_node(
        &mut self,
        addr: &NodeAddr,
        buf: impl Into<Bytes>,
    ) -> Result<Reply> {
        let cmd = Command::unrouted(buf)?;
        self.ensure_pipeline_drained()?;
        self.prepare()?;
        self.check_known(addr)?;
        single(self.registry.call(addr, cmd.as_bytes(), 1)?)
    }

    fn execute(&mut self, cmd: Command) -> Result<Reply> {
        self.ensure_pipeline_drained()?;
        if cmd.is_cross_slot() {
            let fragments = Fragments::split(&cmd)?;
            self.prepare()?;
            let mut replies = Vec::with_capacity(fragments.len());
            for part in fragments.parts() {
                replies.push(self.route(part.command.as_bytes(), part.slot)?);
            }
            return fragments.merge(replies);
        }
        let slot = cmd.slot().ok_or_else(ClusterError::no_keys)?;
        self.prepare()?;
        self.route(cmd.as_bytes(), slot)
    }

    /// Send `payload` for `slot`, following redirects
    fn route(&mut self, payload: &[u8], slot: u16) -> Result<Reply> {
        let mut target = Target::Resolve;
        let mut retries = 0;
        loop {
            let (addr, reply) = match target {
                Target::Resolve => {
                    let addr = self.resolve(slot)?;
                    let reply = single(self.registry.call(&addr, payload, 1)?)?;
                    (addr, reply)
                }
                Target::Node(addr) => {
                    let reply = single(self.registry.call(&addr, payload, 1)?)?;
                    (addr, reply)
                }
                Target::Ask(addr) => {
                    let mut buf = BytesMut::with_capacity(ASKING.len() + payload.len());
                    buf.extend_from_slice(ASKING);
                    buf.extend_from_slice(payload);
                    // the ASKING reply is discarded
                    let reply = single(self.registry.call(&addr, &buf, 2)?)?;
                    (addr, reply)
                }
            };

            let redirect = match classify(&reply)? {
                Some(redirect) => redirect.with_source_host(&addr.host),
                None => return Ok(reply),
            };
            retries += 1;
            if retries > self.config.max_retry_count {
                debug!(slot, retries, "retry budget exhausted");
                return Err(ClusterError::TooManyRetries);
            }
            target = match redirect {
                Redirect::Moved { slot: moved, addr: to } => {
                    debug!(slot = moved, from = %addr, to = %to, "MOVED");
                    self.on_moved(moved, &to, &addr);
                    Target::Node(to)
                }
                Redirect::Ask { slot: asked, addr: to } => {
                    debug!(slot = asked, from = %addr, to = %to, "ASK");
                    Target::Ask(to)
                }
                Redirect::TryAgain | Redirect::ClusterDown => {
                    debug!(slot, %addr, reply = %reply, "retrying");
                    Target::Resolve
                }
            };
        }
    }

    fn resolve(&self, slot: u16) -> Result<NodeAddr> {
        self.topology
            .load()
            .addr_for_slot(slot)
            .cloned()
            .ok_or_else(|| ClusterError::slot_unserved(slot))
    }

    fn on_moved(&mut self, slot: u16, to: &NodeAddr, from: &NodeAddr) {
        if self.topology.load().addr_for_slot(slot) == Some(to) {
            return;
        }
        if let Err(e) = self.refresh_from(Some(from)) {
            warn!(slot, %to, error = %e, "refresh after MOVED failed, re-pointing slot");
            let patched = self.topology.load().with_slot_owner(slot, to);
            self.install(patched);
        }
    }

    fn check_known(&self, addr: &NodeAddr) -> Result<()> {
        let topology = self.topology.load();
        if topology.all_addrs().any(|a| a == addr) {
            Ok(())
        } else {
            Err(ClusterError::Routing(format!("node {addr} is not part of the cluster")))
        }
    }

    /// Replies of queued commands share the node connections, so direct
    /// requests have to wait until the pipeline is read or reset
    fn ensure_pipeline_drained(&self) -> Result<()> {
        if self.pipeline.is_empty() {
            Ok(())
        } else {
            Err(ClusterError::pipeline_pending(self.pipeline.len()))
        }
    }

    /// Load the first slot map, or run a refresh that came due
    ///
    /// A due refresh waits while pipelined replies are unread.
    fn prepare(&mut self) -> Result<()> {
        if self.topology.load().is_empty() {
            return self.refresh_from(None).map(|_| ());
        }
        if self.pipeline.is_empty() {
            self.run_due_refresh();
        }
        Ok(())
    }

    fn run_due_refresh(&mut self) {
        if self.registry.schedule.take_due(Instant::now()) {
            if let Err(e) = self.refresh_from(None) {
                warn!(error = %e, "scheduled slot map refresh failed");
            }
        }
    }

    // ========================================================================
    // Topology
    // ========================================================================

    /// Rediscover the cluster now
    ///
    /// Known masters are asked first, then the seeds. When every node fails
    /// the current slot map stays in place. Fails while pipelined commands
    /// are queued.
    pub fn refresh(&mut self) -> Result<()> {
        self.ensure_pipeline_drained()?;
        self.refresh_from(None).map(|_| ())
    }

    fn refresh_from(&mut self, hint: Option<&NodeAddr>) -> Result<Arc<Topology>> {
        let candidates = refresh_candidates(hint, &self.topology.load(), &self.seeds);
        self.registry.schedule.note_attempt(Instant::now());

        let mut last_err = None;
        for addr in &candidates {
            match self.discover(addr) {
                Ok(topology) => return Ok(self.install(topology)),
                Err(e) => {
                    warn!(%addr, error = %e, "slot map discovery failed");
                    last_err = Some(e);
                }
            }
        }
        Err(match last_err {
            Some(e) => ClusterError::Topology(format!("slot map refresh failed: {e}")),
            None => ClusterError::Topology("no nodes to discover the slot map from".to_string()),
        })
    }

    fn discover(&mut self, addr: &NodeAddr) -> Result<Topology> {
        let request =
            if self.config.use_cluster_slots { CLUSTER_SLOTS_REQUEST } else { CLUSTER_NODES_REQUEST };
        let reply = single(self.registry.call(addr, request, 1)?)?;
        let options = DiscoveryOptions {
            add_replicas: self.config.add_replicas,
            expose_open_slots: self.config.expose_open_slots,
        };
        let masters =
            parse_discovery_reply(&reply, self.config.use_cluster_slots, &addr.host, options)?;
        Topology::build(masters)
    }

    fn install(&mut self, topology: Topology) -> Arc<Topology> {
        let published = self.topology.publish(topology);
        self.registry.retain(published.all_addrs());
        info!(
            version = published.version(),
            masters = published.len(),
            slots = published.covered_slots(),
            "slot map updated"
        );
        self.events.slotmap_published();
        published
    }

    /// The current slot map
    pub fn topology(&self) -> Arc<Topology> {
        self.topology.load()
    }

    /// Masters of the current slot map
    pub fn nodes(&self) -> NodeIterator {
        NodeIterator::new(self.topology.clone())
    }

    pub fn node_for_key(&self, key: impl AsRef<[u8]>) -> Option<ClusterNode> {
        self.node_for_slot(key_hash_slot(key.as_ref()))
    }

    pub fn node_for_slot(&self, slot: u16) -> Option<ClusterNode> {
        self.topology.load().node_for_slot(slot).cloned()
    }

    // ========================================================================
    // Pipelining
    // ========================================================================

    /// Queue a routed command; its reply comes from [`get_reply`]
    ///
    /// Queued commands are written on the first `get_reply` call. Redirects
    /// are not followed inside a pipeline: a MOVED reply is handed back
    /// unchanged and the slot map is refreshed on [`reset`] or before the
    /// next routed command. Until every queued reply has been read or
    /// dropped with `reset`, [`command`] and its variants fail with a
    /// routing error.
    ///
    /// [`get_reply`]: ClusterClient::get_reply
    /// [`reset`]: ClusterClient::reset
    /// [`command`]: ClusterClient::command
    pub fn append_command<I, A>(&mut self, args: I) -> Result<()>
    where
        I: IntoIterator<Item = A>,
        A: AsRef<[u8]>,
    {
        self.append(Command::from_args(args)?)
    }

    pub fn append_formatted_command(&mut self, buf: impl Into<Bytes>) -> Result<()> {
        self.append(Command::parse(buf)?)
    }

    pub fn append_command_to_node<I, A>(&mut self, addr: &NodeAddr, args: I) -> Result<()>
    where
        I: IntoIterator<Item = A>,
        A: AsRef<[u8]>,
    {
        self.append_formatted_command_to_node(addr, encode_args(args))
    }

    pub fn append_formatted_command_to_node(
        &mut self,
        addr: &NodeAddr,
        buf: impl Into<Bytes>,
    ) -> Result<()> {
        let cmd = Command::unrouted(buf)?;
        self.prepare()?;
        self.check_known(addr)?;
        let conn = self.registry.queue(addr, cmd.as_bytes())?;
        self.pipeline.push_back(Pending::Single { addr: addr.clone(), conn });
        Ok(())
    }

    fn append(&mut self, cmd: Command) -> Result<()> {
        if cmd.is_cross_slot() {
            let fragments = Fragments::split(&cmd)?;
            self.prepare()?;
            let addrs = fragments
                .parts()
                .iter()
                .map(|part| self.resolve(part.slot))
                .collect::<Result<Vec<_>>>()?;

            let mut parts = Vec::with_capacity(addrs.len());
            for (part, addr) in fragments.parts().iter().zip(addrs) {
                match self.registry.queue(&addr, part.command.as_bytes()) {
                    Ok(conn) => parts.push((addr, conn)),
                    Err(e) => {
                        if !parts.is_empty() {
                            self.pipeline.push_back(Pending::Discard(parts));
                        }
                        return Err(e);
                    }
                }
            }
            self.pipeline.push_back(Pending::Fragmented { fragments, parts });
            return Ok(());
        }

        let slot = cmd.slot().ok_or_else(ClusterError::no_keys)?;
        self.prepare()?;
        let addr = self.resolve(slot)?;
        let conn = self.registry.queue(&addr, cmd.as_bytes())?;
        self.pipeline.push_back(Pending::Single { addr, conn });
        Ok(())
    }

    /// Reply to the oldest queued command, or `None` if nothing is queued
    pub fn get_reply(&mut self) -> Result<Option<Reply>> {
        self.registry.flush_all();
        loop {
            let Some(pending) = self.pipeline.pop_front() else {
                return Ok(None);
            };
            match pending {
                Pending::Single { addr, conn } => {
                    let reply = self.read_pipelined(&addr, conn)?;
                    return Ok(Some(reply));
                }
                Pending::Fragmented { fragments, parts } => {
                    let mut replies = Vec::with_capacity(parts.len());
                    for (addr, conn) in &parts {
                        replies.push(self.read_pipelined(addr, *conn)?);
                    }
                    return fragments.merge(replies).map(Some);
                }
                Pending::Discard(parts) => {
                    for (addr, conn) in &parts {
                        let _ = self.read_pipelined(addr, *conn);
                    }
                }
            }
        }
    }

    fn read_pipelined(&mut self, addr: &NodeAddr, conn: u64) -> Result<Reply> {
        let reply = self.registry.read_from(addr, conn)?;
        if let Ok(Some(Redirect::Moved { slot, .. })) = classify(&reply) {
            debug!(slot, %addr, "MOVED in pipeline, refresh scheduled");
            self.registry.schedule.schedule_now();
        }
        Ok(reply)
    }

    /// Drop every queued command, reading and discarding replies still on
    /// the wire, then run a refresh if one is due
    pub fn reset(&mut self) {
        self.registry.flush_all();
        while let Some(pending) = self.pipeline.pop_front() {
            let parts = match pending {
                Pending::Single { addr, conn } => vec![(addr, conn)],
                Pending::Fragmented { parts, .. } | Pending::Discard(parts) => parts,
            };
            for (addr, conn) in &parts {
                let _ = self.read_pipelined(addr, *conn);
            }
        }
        if !self.topology.load().is_empty() {
            self.run_due_refresh();
        }
    }

    /// Number of queued commands without a collected reply
    pub fn pending(&self) -> usize {
        self.pipeline.iter().filter(|p| !matches!(p, Pending::Discard(_))).count()
    }
}

impl std::fmt::Debug for ClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterClient")
            .field("seeds", &self.seeds)
            .field("version", &self.topology.version())
            .field("pending", &self.pending())
            .finish()
    }
}

/// The last of the replies read for one request
fn single(mut replies: Vec<Reply>) -> Result<Reply> {
    replies.pop().ok_or_else(|| ClusterError::ProtocolMismatch("missing reply".to_string()))
}

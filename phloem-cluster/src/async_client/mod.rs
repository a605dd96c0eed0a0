//! Non-blocking cluster client on tokio
//!
//! [`AsyncClusterClient`] is a cheap handle; clones share the slot map and
//! the node connections. Each node connection multiplexes any number of
//! in-flight requests (see `connection`), so concurrent commands to the same
//! node are pipelined on one socket. Refreshes are serialized: a command that
//! receives MOVED for a slot already re-pointed by another task's refresh
//! retries without refreshing again.

mod connection;

use crate::config::ClusterConfig;
use crate::error::{ClusterError, Result};
use crate::event::{ClusterEvent, EventSink};
use crate::fragment::Fragments;
use crate::node::ClusterNode;
use crate::registry::{FailureCounter, Handshake, RefreshSchedule};
use crate::topology::{
    parse_discovery_reply, refresh_candidates, DiscoveryOptions, NodeIterator, Topology,
    TopologyCell,
};
use bytes::{Bytes, BytesMut};
use connection::{AsyncConnection, ConnectOptions};
use futures::future::try_join_all;
use parking_lot::Mutex;
use phloem_protocol::redirect::{ASKING, CLUSTER_NODES_REQUEST, CLUSTER_SLOTS_REQUEST};
use phloem_protocol::{classify, encode_args, format_command, key_hash_slot, Command, NodeAddr};
use phloem_protocol::{Redirect, Reply};
use phloem_transport::{AsyncConnector, TokioTcpConnector};
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct AsyncClusterClient {
    inner: Arc<Inner>,
}

struct Inner {
    config: ClusterConfig,
    seeds: Vec<NodeAddr>,
    connector: Arc<dyn AsyncConnector>,
    options: ConnectOptions,
    topology: TopologyCell,
    conns: Mutex<HashMap<NodeAddr, Arc<AsyncConnection>>>,
    failures: Mutex<FailureCounter>,
    schedule: Mutex<RefreshSchedule>,
    refresh_lock: tokio::sync::Mutex<()>,
    events: EventSink,
    next_id: AtomicU64,
}

enum Target {
    Resolve,
    Node(NodeAddr),
    Ask(NodeAddr),
}

impl AsyncClusterClient {
    /// Create a client over tokio TCP; nothing is connected until
    /// [`connect`] or the first command
    ///
    /// [`connect`]: AsyncClusterClient::connect
    pub fn new(config: ClusterConfig) -> Result<Self> {
        Self::with_connector(config, Arc::new(TokioTcpConnector))
    }

    pub fn with_connector(config: ClusterConfig, connector: Arc<dyn AsyncConnector>) -> Result<Self> {
        config.validate()?;
        let seeds = config.seed_addrs()?;
        let options = ConnectOptions {
            connect_timeout: config.connect_timeout,
            command_timeout: config.command_timeout,
            handshake: Handshake::from_config(&config),
        };
        let schedule = RefreshSchedule::new(config.refresh_throttle);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                seeds,
                connector,
                options,
                topology: TopologyCell::new(),
                conns: Mutex::new(HashMap::new()),
                failures: Mutex::new(FailureCounter::default()),
                schedule: Mutex::new(schedule),
                refresh_lock: tokio::sync::Mutex::new(()),
                events: EventSink::default(),
                next_id: AtomicU64::new(0),
            }),
        })
    }

    /// Load the initial slot map from the seeds
    pub async fn connect(&self) -> Result<()> {
        self.refresh().await
    }

    pub fn set_event_callback<F>(&self, callback: F)
    where
        F: Fn(ClusterEvent) + Send + Sync + 'static,
    {
        self.inner.events.set(Arc::new(callback));
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.inner.config
    }

    // ========================================================================
    // Commands
    // ========================================================================

    pub async fn command<I, A>(&self, args: I) -> Result<Reply>
    where
        I: IntoIterator<Item = A>,
        A: AsRef<[u8]>,
    {
        let cmd = Command::from_args(args)?;
        self.inner.execute(cmd).await
    }

    pub async fn command_fmt(&self, fmt: &str, args: &[&[u8]]) -> Result<Reply> {
        self.formatted_command(format_command(fmt, args)?).await
    }

    pub async fn formatted_command(&self, buf: impl Into<Bytes>) -> Result<Reply> {
        let cmd = Command::parse(buf)?;
        self.inner.execute(cmd).await
    }

    /// Send a command to one node without routing or redirect handling
    pub async fn command_to_node<I, A>(&self, addr: &NodeAddr, args: I) -> Result<Reply>
    where
        I: IntoIterator<Item = A>,
        A: AsRef<[u8]>,
    {
        self.formatted_command_to_node(addr, encode_args(args)).await
    }

    pub async fn formatted_command_to_node(
        &self,
        addr: &NodeAddr,
        buf: impl Into<Bytes>,
    ) -> Result<Reply> {
        let cmd = Command::unrouted(buf)?;
        self.inner.prepare().await?;
        self.inner.check_known(addr)?;
        single(self.inner.call(addr, cmd.bytes(), 1).await?)
    }

    /// Run a command in a spawned task and hand its outcome to `callback`
    ///
    /// Parse and routing errors that can be detected locally are returned
    /// right away and `callback` is dropped without being called. Otherwise
    /// `callback` runs exactly once, when the command completes or its
    /// retries run out. Must be called from within a tokio runtime.
    ///
    /// ```no_run
    /// # async fn demo(client: phloem_cluster::AsyncClusterClient) -> phloem_cluster::Result<()> {
    /// client.command_with_callback(["INCR", "visits"], |reply| match reply {
    ///     Ok(reply) => println!("visits = {reply}"),
    ///     Err(e) => eprintln!("INCR failed: {e}"),
    /// })?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn command_with_callback<I, A, F>(&self, args: I, callback: F) -> Result<()>
    where
        I: IntoIterator<Item = A>,
        A: AsRef<[u8]>,
        F: FnOnce(Result<Reply>) + Send + 'static,
    {
        let cmd = Command::from_args(args)?;
        self.inner.check_local(&cmd)?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            ClusterError::Config("command_with_callback needs a tokio runtime".to_string())
        })?;
        let inner = self.inner.clone();
        runtime.spawn(async move {
            let result = inner.execute(cmd).await;
            callback(result);
        });
        Ok(())
    }

    // ========================================================================
    // Topology
    // ========================================================================

    /// Rediscover the cluster now
    pub async fn refresh(&self) -> Result<()> {
        let _guard = self.inner.refresh_lock.lock().await;
        self.inner.refresh_locked(None).await.map(|_| ())
    }

    pub fn topology(&self) -> Arc<Topology> {
        self.inner.topology.load()
    }

    pub fn nodes(&self) -> NodeIterator {
        NodeIterator::new(self.inner.topology.clone())
    }

    pub fn node_for_key(&self, key: impl AsRef<[u8]>) -> Option<ClusterNode> {
        self.node_for_slot(key_hash_slot(key.as_ref()))
    }

    pub fn node_for_slot(&self, slot: u16) -> Option<ClusterNode> {
        self.inner.topology.load().node_for_slot(slot).cloned()
    }

    /// Close every node connection; the slot map is kept
    pub fn disconnect(&self) {
        self.inner.conns.lock().clear();
    }
}

impl std::fmt::Debug for AsyncClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncClusterClient")
            .field("seeds", &self.inner.seeds)
            .field("version", &self.inner.topology.version())
            .field("connections", &self.inner.conns.lock().len())
            .finish()
    }
}

impl Inner {
    /// Reject what can be rejected without I/O
    fn check_local(&self, cmd: &Command) -> Result<()> {
        let slots: Vec<u16> = if cmd.is_cross_slot() {
            Fragments::split(cmd)?.parts().iter().map(|p| p.slot).collect()
        } else {
            vec![cmd.slot().ok_or_else(ClusterError::no_keys)?]
        };
        let topology = self.topology.load();
        if topology.is_empty() {
            return Ok(());
        }
        match slots.into_iter().find(|&slot| topology.addr_for_slot(slot).is_none()) {
            Some(slot) => Err(ClusterError::slot_unserved(slot)),
            None => Ok(()),
        }
    }

    async fn execute(&self, cmd: Command) -> Result<Reply> {
        if cmd.is_cross_slot() {
            let fragments = Fragments::split(&cmd)?;
            self.prepare().await?;
            let replies = try_join_all(
                fragments.parts().iter().map(|part| self.route(part.command.bytes(), part.slot)),
            )
            .await?;
            return fragments.merge(replies);
        }
        let slot = cmd.slot().ok_or_else(ClusterError::no_keys)?;
        self.prepare().await?;
        self.route(cmd.bytes(), slot).await
    }

    async fn route(&self, payload: Bytes, slot: u16) -> Result<Reply> {
        let mut target = Target::Resolve;
        let mut retries = 0;
        loop {
            let (addr, reply) = match target {
                Target::Resolve => {
                    let addr = self.resolve(slot)?;
                    let reply = single(self.call(&addr, payload.clone(), 1).await?)?;
                    (addr, reply)
                }
                Target::Node(addr) => {
                    let reply = single(self.call(&addr, payload.clone(), 1).await?)?;
                    (addr, reply)
                }
                Target::Ask(addr) => {
                    let mut buf = BytesMut::with_capacity(ASKING.len() + payload.len());
                    buf.extend_from_slice(ASKING);
                    buf.extend_from_slice(&payload);
                    let reply = single(self.call(&addr, buf.freeze(), 2).await?)?;
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
                    self.on_moved(moved, &to, &addr).await;
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

    fn check_known(&self, addr: &NodeAddr) -> Result<()> {
        if self.topology.load().all_addrs().any(|a| a == addr) {
            Ok(())
        } else {
            Err(ClusterError::Routing(format!("node {addr} is not part of the cluster")))
        }
    }

    async fn on_moved(&self, slot: u16, to: &NodeAddr, from: &NodeAddr) {
        let _guard = self.refresh_lock.lock().await;
        // another task may have refreshed while this one waited
        if self.topology.load().addr_for_slot(slot) == Some(to) {
            return;
        }
        if let Err(e) = self.refresh_locked(Some(from)).await {
            warn!(slot, %to, error = %e, "refresh after MOVED failed, re-pointing slot");
            let patched = self.topology.load().with_slot_owner(slot, to);
            self.install(patched);
        }
    }

    /// Load the first slot map, or run a refresh that came due
    async fn prepare(&self) -> Result<()> {
        if self.topology.load().is_empty() {
            let _guard = self.refresh_lock.lock().await;
            if self.topology.load().is_empty() {
                self.refresh_locked(None).await?;
            }
            return Ok(());
        }
        let due = self.schedule.lock().take_due(Instant::now());
        if due {
            let _guard = self.refresh_lock.lock().await;
            if let Err(e) = self.refresh_locked(None).await {
                warn!(error = %e, "scheduled slot map refresh failed");
            }
        }
        Ok(())
    }

    /// Refresh with the refresh lock held
    async fn refresh_locked(&self, hint: Option<&NodeAddr>) -> Result<Arc<Topology>> {
        let candidates = self.candidates(hint);
        self.schedule.lock().note_attempt(Instant::now());

        let mut last_err = None;
        for addr in &candidates {
            match self.discover(addr).await {
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

    /// Refresh candidates with the known masters rotated to a random start
    /// and connected nodes first, spreading discovery load across the cluster
    fn candidates(&self, hint: Option<&NodeAddr>) -> Vec<NodeAddr> {
        let mut candidates = refresh_candidates(hint, &self.topology.load(), &self.seeds);
        let skip = usize::from(hint.is_some());
        if candidates.len() > skip + 1 {
            let offset = rand::thread_rng().gen_range(0..candidates.len() - skip);
            candidates[skip..].rotate_left(offset);
        }
        let conns = self.conns.lock();
        candidates[skip..].sort_by_key(|addr| !conns.get(addr).is_some_and(|c| !c.is_closed()));
        candidates
    }

    async fn discover(&self, addr: &NodeAddr) -> Result<Topology> {
        let request = if self.config.use_cluster_slots {
            CLUSTER_SLOTS_REQUEST
        } else {
            CLUSTER_NODES_REQUEST
        };
        let reply = single(self.call(addr, Bytes::from_static(request), 1).await?)?;
        let options = DiscoveryOptions {
            add_replicas: self.config.add_replicas,
            expose_open_slots: self.config.expose_open_slots,
        };
        let masters =
            parse_discovery_reply(&reply, self.config.use_cluster_slots, &addr.host, options)?;
        Topology::build(masters)
    }

    fn install(&self, topology: Topology) -> Arc<Topology> {
        let published = self.topology.publish(topology);
        {
            let keep: Vec<&NodeAddr> = published.all_addrs().collect();
            let mut conns = self.conns.lock();
            conns.retain(|addr, _| {
                let kept = keep.contains(&addr);
                if !kept {
                    debug!(%addr, "closing connection to departed node");
                }
                kept
            });
        }
        info!(
            version = published.version(),
            masters = published.len(),
            slots = published.covered_slots(),
            "slot map updated"
        );
        self.events.slotmap_published();
        published
    }

    // ========================================================================
    // Connections
    // ========================================================================

    async fn connection(&self, addr: &NodeAddr) -> Result<Arc<AsyncConnection>> {
        let existing = self.conns.lock().get(addr).filter(|c| !c.is_closed()).cloned();
        if let Some(conn) = existing {
            return Ok(conn);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let conn = AsyncConnection::open(self.connector.as_ref(), addr, id, &self.options).await;
        let conn = match conn {
            Ok(conn) => Arc::new(conn),
            Err(e) => {
                self.on_failure(addr, &e);
                return Err(e);
            }
        };
        let mut conns = self.conns.lock();
        match conns.get(addr) {
            // lost a race with another task opening the same node
            Some(other) if !other.is_closed() => Ok(other.clone()),
            _ => {
                conns.insert(addr.clone(), conn.clone());
                Ok(conn)
            }
        }
    }

    async fn call(&self, addr: &NodeAddr, payload: Bytes, replies: usize) -> Result<Vec<Reply>> {
        let conn = self.connection(addr).await?;
        match conn.request(payload, replies).await {
            Ok(replies) => {
                self.failures.lock().clear(addr);
                Ok(replies)
            }
            Err(e) => {
                {
                    let mut conns = self.conns.lock();
                    if conns.get(addr).is_some_and(|c| c.id == conn.id) {
                        conns.remove(addr);
                    }
                }
                self.on_failure(addr, &e);
                Err(e)
            }
        }
    }

    fn on_failure(&self, addr: &NodeAddr, err: &ClusterError) {
        warn!(%addr, error = %err, "node connection failed");
        if self.failures.lock().record(addr, self.config.max_retry_count) {
            debug!(%addr, "failure limit reached, scheduling slot map refresh");
            self.schedule.lock().schedule_throttled();
        }
    }
}

fn single(mut replies: Vec<Reply>) -> Result<Reply> {
    replies.pop().ok_or_else(|| ClusterError::ProtocolMismatch("missing reply".to_string()))
}

#[cfg(test)]
mod tests {
    use super::connection::tests::PipeConnector;
    use super::*;
    use crate::ErrorKind;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    const NODES: &str = "abc 127.0.0.1:7000@17000 myself,master - 0 0 1 connected 0-16383\n";

    fn client(connector: PipeConnector) -> AsyncClusterClient {
        let config = ClusterConfig::with_seeds("127.0.0.1:7000").unwrap();
        AsyncClusterClient::with_connector(config, Arc::new(connector)).unwrap()
    }

    /// Answer `count` requests on `peer`, one reply chunk per request
    async fn serve(peer: &mut DuplexStream, replies: &[&[u8]]) {
        let mut buf = BytesMut::new();
        for reply in replies {
            loop {
                if let Some(end) = request_end(&buf) {
                    let _ = buf.split_to(end);
                    break;
                }
                peer.read_buf(&mut buf).await.unwrap();
            }
            peer.write_all(reply).await.unwrap();
        }
    }

    /// Length of the first complete request in `buf`
    fn request_end(buf: &[u8]) -> Option<usize> {
        match phloem_protocol::resp::decode(buf) {
            Ok(Some((_, used))) => Some(used),
            _ => None,
        }
    }

    fn nodes_reply() -> Vec<u8> {
        format!("${}\r\n{}\r\n", NODES.len(), NODES).into_bytes()
    }

    #[tokio::test]
    async fn test_local_errors_are_immediate() {
        let (connector, _peers) = PipeConnector::new(0);
        let client = client(connector);
        let called = Arc::new(Mutex::new(false));
        let flag = called.clone();
        let err = client
            .command_with_callback(["PING"], move |_| *flag.lock() = true)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Routing);

        let err = client.command_with_callback(["NOSUCH"], |_| {}).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Parse);
        assert!(!*called.lock());
    }

    #[tokio::test]
    async fn test_command_and_callback() {
        let (connector, mut peers) = PipeConnector::new(1);
        let mut peer = peers.remove(0);
        let client = client(connector);

        let nodes = nodes_reply();
        let (reply, _) = tokio::join!(client.command(["GET", "foo"]), async {
            let replies: [&[u8]; 2] = [&nodes, b"$3\r\nbar\r\n"];
            serve(&mut peer, &replies).await;
        });
        assert_eq!(reply.unwrap(), Reply::bulk("bar"));

        let (tx, rx) = tokio::sync::oneshot::channel();
        client
            .command_with_callback(["INCR", "n"], move |reply| {
                let _ = tx.send(reply);
            })
            .unwrap();
        serve(&mut peer, &[b":1\r\n"]).await;
        assert_eq!(rx.await.unwrap().unwrap(), Reply::Integer(1));
    }

    #[tokio::test]
    async fn test_unreachable_seed() {
        let (connector, _peers) = PipeConnector::new(0);
        let client = client(connector);
        let err = client.command(["GET", "foo"]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Topology);
    }

    #[tokio::test]
    async fn test_callback_without_runtime_handle() {
        let (connector, _peers) = PipeConnector::new(0);
        let client = client(connector);
        let result = std::thread::spawn(move || {
            client.command_with_callback(["GET", "foo"], |_| {}).map_err(|e| e.kind())
        })
        .join()
        .unwrap();
        assert_eq!(result, Err(ErrorKind::Config));
    }
}

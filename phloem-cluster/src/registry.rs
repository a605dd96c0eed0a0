//! Per-node connection lifecycle for the blocking client
//!
//! Connections are opened lazily on first use, authenticated and switched to
//! the configured database, then reused until an I/O error drops them. The
//! registry also counts failures per node and decides when a slot map
//! refresh is due.

use crate::config::ClusterConfig;
use crate::error::{ClusterError, Result};
use bytes::{Bytes, BytesMut};
use phloem_protocol::{encode_args, NodeAddr, Reply, ReplyDecoder};
use phloem_transport::{Transport, TransportFactory, TransportOptions};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// AUTH and SELECT requests sent on every new connection
#[derive(Debug, Clone, Default)]
pub(crate) struct Handshake {
    requests: Vec<Bytes>,
}

impl Handshake {
    pub(crate) fn from_config(config: &ClusterConfig) -> Self {
        let mut requests = Vec::new();
        if let Some(password) = &config.password {
            let auth = match &config.username {
                Some(user) => encode_args(["AUTH", user.as_str(), password.as_str()]),
                None => encode_args(["AUTH", password.as_str()]),
            };
            requests.push(auth);
        }
        if config.select_db != 0 {
            requests.push(encode_args(["SELECT".to_string(), config.select_db.to_string()]));
        }
        Self { requests }
    }

    pub(crate) fn requests(&self) -> &[Bytes] {
        &self.requests
    }

    /// Turn an error reply to a handshake request into a connection error
    pub(crate) fn check(addr: &NodeAddr, reply: &Reply) -> Result<()> {
        match reply.as_error() {
            Some(msg) => Err(ClusterError::Connection(format!("handshake with {addr} failed: {msg}"))),
            None => Ok(()),
        }
    }
}

/// Counts consecutive I/O failures per node
#[derive(Debug, Default)]
pub(crate) struct FailureCounter {
    counts: HashMap<NodeAddr, u32>,
}

impl FailureCounter {
    /// Record a failure; true once the count exceeds `limit`, which resets it
    pub(crate) fn record(&mut self, addr: &NodeAddr, limit: u32) -> bool {
        let count = self.counts.entry(addr.clone()).or_insert(0);
        *count += 1;
        if *count > limit {
            self.counts.remove(addr);
            return true;
        }
        false
    }

    pub(crate) fn clear(&mut self, addr: &NodeAddr) {
        self.counts.remove(addr);
    }

    #[cfg(test)]
    pub(crate) fn get(&self, addr: &NodeAddr) -> u32 {
        self.counts.get(addr).copied().unwrap_or(0)
    }
}

/// When the next background refresh may run
#[derive(Debug)]
pub(crate) struct RefreshSchedule {
    throttle: Duration,
    due: Option<Instant>,
    last_attempt: Option<Instant>,
}

impl RefreshSchedule {
    pub(crate) fn new(throttle: Duration) -> Self {
        Self { throttle, due: None, last_attempt: None }
    }

    /// Refresh before the next routed command
    pub(crate) fn schedule_now(&mut self) {
        self.due = Some(Instant::now());
    }

    /// Refresh no sooner than one throttle window after the last attempt
    pub(crate) fn schedule_throttled(&mut self) {
        let earliest = match self.last_attempt {
            Some(last) => (last + self.throttle).max(Instant::now()),
            None => Instant::now(),
        };
        self.due = Some(match self.due {
            Some(due) => due.min(earliest),
            None => earliest,
        });
    }

    #[cfg(test)]
    pub(crate) fn is_scheduled(&self) -> bool {
        self.due.is_some()
    }

    /// Consume the schedule if its deadline passed
    pub(crate) fn take_due(&mut self, now: Instant) -> bool {
        match self.due {
            Some(due) if due <= now => {
                self.due = None;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn note_attempt(&mut self, now: Instant) {
        self.last_attempt = Some(now);
    }
}

/// A blocking connection with its read buffer and pipelined output
pub(crate) struct NodeConnection {
    pub(crate) id: u64,
    transport: Box<dyn Transport>,
    rbuf: BytesMut,
    decoder: ReplyDecoder,
    out: BytesMut,
}

impl NodeConnection {
    fn send(&mut self, data: &[u8]) -> Result<()> {
        self.transport.send(data)?;
        Ok(())
    }

    fn read_reply(&mut self) -> Result<Reply> {
        loop {
            if let Some(reply) = self.decoder.decode(&mut self.rbuf)? {
                return Ok(reply);
            }
            self.transport.recv(&mut self.rbuf)?;
        }
    }

    fn flush(&mut self) -> Result<()> {
        if self.out.is_empty() {
            return Ok(());
        }
        let out = self.out.split().freeze();
        self.send(&out)
    }
}

pub(crate) struct NodeRegistry {
    factory: Box<dyn TransportFactory>,
    options: TransportOptions,
    handshake: Handshake,
    max_retry: u32,
    conns: HashMap<NodeAddr, NodeConnection>,
    failures: FailureCounter,
    pub(crate) schedule: RefreshSchedule,
    next_id: u64,
}

impl NodeRegistry {
    pub(crate) fn new(config: &ClusterConfig, factory: Box<dyn TransportFactory>) -> Self {
        Self {
            factory,
            options: config.transport_options(),
            handshake: Handshake::from_config(config),
            max_retry: config.max_retry_count,
            conns: HashMap::new(),
            failures: FailureCounter::default(),
            schedule: RefreshSchedule::new(config.refresh_throttle),
            next_id: 0,
        }
    }

    /// The connection to `addr`, opening it if needed
    ///
    /// Failures are counted by the caller through `settle`.
    pub(crate) fn get(&mut self, addr: &NodeAddr) -> Result<&mut NodeConnection> {
        if !self.conns.contains_key(addr) {
            let conn = self.open(addr)?;
            self.conns.insert(addr.clone(), conn);
        }
        self.conns
            .get_mut(addr)
            .ok_or_else(|| ClusterError::Connection(format!("no connection to {addr}")))
    }

    fn open(&mut self, addr: &NodeAddr) -> Result<NodeConnection> {
        let mut transport = self.factory.create(&self.options)?;
        transport.connect(&addr.host, addr.port)?;
        self.next_id += 1;
        let mut conn = NodeConnection {
            id: self.next_id,
            transport,
            rbuf: BytesMut::with_capacity(16 * 1024),
            decoder: ReplyDecoder::new(),
            out: BytesMut::new(),
        };
        for request in self.handshake.requests() {
            conn.send(request)?;
            Handshake::check(addr, &conn.read_reply()?)?;
        }
        debug!(%addr, id = conn.id, "opened node connection");
        Ok(conn)
    }

    /// Send `payload` and read `replies` replies, returning them in order
    pub(crate) fn call(
        &mut self,
        addr: &NodeAddr,
        payload: &[u8],
        replies: usize,
    ) -> Result<Vec<Reply>> {
        let result = self.get(addr).and_then(|conn| {
            conn.flush()?;
            conn.send(payload)?;
            (0..replies).map(|_| conn.read_reply()).collect::<Result<Vec<_>>>()
        });
        self.settle(addr, result)
    }

    /// Queue `payload` for the next flush, returning the connection id
    pub(crate) fn queue(&mut self, addr: &NodeAddr, payload: &[u8]) -> Result<u64> {
        let result = self.get(addr).map(|conn| {
            conn.out.extend_from_slice(payload);
            conn.id
        });
        self.settle(addr, result)
    }

    /// Write every queued payload
    pub(crate) fn flush_all(&mut self) {
        let addrs: Vec<NodeAddr> =
            self.conns.iter().filter(|(_, c)| !c.out.is_empty()).map(|(a, _)| a.clone()).collect();
        for addr in addrs {
            let result = match self.conns.get_mut(&addr) {
                Some(conn) => conn.flush(),
                None => continue,
            };
            if let Err(e) = self.settle(&addr, result) {
                warn!(%addr, error = %e, "pipeline flush failed");
            }
        }
    }

    /// Read the next reply from connection `id` to `addr`
    pub(crate) fn read_from(&mut self, addr: &NodeAddr, id: u64) -> Result<Reply> {
        let result = match self.conns.get_mut(addr) {
            Some(conn) if conn.id == id => conn.read_reply(),
            _ => return Err(ClusterError::Connection(format!("connection to {addr} was lost"))),
        };
        self.settle(addr, result)
    }

    fn settle<T>(&mut self, addr: &NodeAddr, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => self.failures.clear(addr),
            Err(e) if e.is_connection() || e.kind() == crate::ErrorKind::ProtocolMismatch => {
                self.drop_connection(addr);
                self.on_failure(addr, e);
            }
            Err(_) => {}
        }
        result
    }

    fn on_failure(&mut self, addr: &NodeAddr, err: &ClusterError) {
        warn!(%addr, error = %err, "node connection failed");
        if self.failures.record(addr, self.max_retry) {
            debug!(%addr, "failure limit reached, scheduling slot map refresh");
            self.schedule.schedule_throttled();
        }
    }

    pub(crate) fn drop_connection(&mut self, addr: &NodeAddr) {
        if let Some(mut conn) = self.conns.remove(addr) {
            let _ = conn.transport.close();
        }
    }

    /// Close connections to nodes outside `keep`
    pub(crate) fn retain<'a>(&mut self, keep: impl IntoIterator<Item = &'a NodeAddr>) {
        let keep: HashSet<&NodeAddr> = keep.into_iter().collect();
        let gone: Vec<NodeAddr> = self.conns.keys().filter(|a| !keep.contains(a)).cloned().collect();
        for addr in gone {
            debug!(%addr, "closing connection to departed node");
            self.drop_connection(&addr);
        }
    }

    #[cfg(test)]
    pub(crate) fn failures(&self, addr: &NodeAddr) -> u32 {
        self.failures.get(addr)
    }

    #[cfg(test)]
    pub(crate) fn is_connected(&self, addr: &NodeAddr) -> bool {
        self.conns.contains_key(addr)
    }
}

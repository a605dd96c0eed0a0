//! One multiplexed connection to a node
//!
//! A writer task drains a request channel onto the socket and a reader task
//! decodes replies. Both share a FIFO of pending requests: the writer pushes
//! an entry before writing, the reader completes the oldest entry once it has
//! collected that request's replies. Every entry carries a oneshot sender
//! that is completed exactly once, with the replies or with the error that
//! closed the connection.

use crate::error::{ClusterError, Result};
use crate::registry::Handshake;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use phloem_protocol::{NodeAddr, Reply, ReplyDecoder};
use phloem_transport::{AsyncConnector, AsyncStream};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

type ReplySender = oneshot::Sender<Result<Vec<Reply>>>;

struct Request {
    payload: Bytes,
    replies: usize,
    tx: ReplySender,
}

struct Pending {
    expected: usize,
    replies: Vec<Reply>,
    tx: ReplySender,
}

#[derive(Default)]
struct Inbox {
    closed: Option<ClusterError>,
    queue: VecDeque<Pending>,
}

impl Inbox {
    fn fail_all(&mut self, err: ClusterError) {
        for pending in self.queue.drain(..) {
            let _ = pending.tx.send(Err(err.clone()));
        }
        self.closed.get_or_insert(err);
    }
}

/// Per-connection settings
#[derive(Debug, Clone)]
pub(crate) struct ConnectOptions {
    pub(crate) connect_timeout: Duration,
    pub(crate) command_timeout: Option<Duration>,
    pub(crate) handshake: Handshake,
}

pub(crate) struct AsyncConnection {
    pub(crate) id: u64,
    addr: NodeAddr,
    requests: mpsc::UnboundedSender<Request>,
    inbox: Arc<Mutex<Inbox>>,
    timeout: Option<Duration>,
}

impl AsyncConnection {
    /// Connect, start the I/O tasks and run the AUTH / SELECT handshake
    pub(crate) async fn open(
        connector: &dyn AsyncConnector,
        addr: &NodeAddr,
        id: u64,
        options: &ConnectOptions,
    ) -> Result<Self> {
        let stream = connector.connect(&addr.host, addr.port, options.connect_timeout).await?;
        let conn = Self::start(stream, addr.clone(), id, options.command_timeout);
        for request in options.handshake.requests() {
            let reply = conn.request(request.clone(), 1).await?;
            for reply in &reply {
                Handshake::check(addr, reply)?;
            }
        }
        debug!(%addr, id, "opened async node connection");
        Ok(conn)
    }

    fn start(
        stream: Box<dyn AsyncStream>,
        addr: NodeAddr,
        id: u64,
        timeout: Option<Duration>,
    ) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        let (requests, rx) = mpsc::unbounded_channel();
        let inbox = Arc::new(Mutex::new(Inbox::default()));
        tokio::spawn(write_loop(writer, rx, inbox.clone(), addr.clone()));
        tokio::spawn(read_loop(reader, inbox.clone(), addr.clone()));
        Self { id, addr, requests, inbox, timeout }
    }

    /// Send `payload` and wait for `replies` replies
    ///
    /// Dropping the returned future abandons the request; its replies are
    /// still read off the wire and discarded.
    pub(crate) async fn request(&self, payload: Bytes, replies: usize) -> Result<Vec<Reply>> {
        let (tx, rx) = oneshot::channel();
        self.requests.send(Request { payload, replies, tx }).map_err(|_| self.closed_error())?;
        let outcome = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, rx).await.map_err(|_| {
                ClusterError::Connection(format!("timed out waiting for reply from {}", self.addr))
            })?,
            None => rx.await,
        };
        outcome.map_err(|_| self.closed_error())?
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.requests.is_closed() || self.inbox.lock().closed.is_some()
    }

    fn closed_error(&self) -> ClusterError {
        match &self.inbox.lock().closed {
            Some(err) => err.clone(),
            None => ClusterError::Connection(format!("connection to {} closed", self.addr)),
        }
    }
}

async fn write_loop(
    mut writer: WriteHalf<Box<dyn AsyncStream>>,
    mut rx: mpsc::UnboundedReceiver<Request>,
    inbox: Arc<Mutex<Inbox>>,
    addr: NodeAddr,
) {
    while let Some(request) = rx.recv().await {
        {
            let mut inbox = inbox.lock();
            if let Some(err) = &inbox.closed {
                let _ = request.tx.send(Err(err.clone()));
                continue;
            }
            inbox.queue.push_back(Pending {
                expected: request.replies,
                replies: Vec::with_capacity(request.replies),
                tx: request.tx,
            });
        }
        if let Err(e) = writer.write_all(&request.payload).await {
            debug!(%addr, error = %e, "write failed");
            inbox.lock().fail_all(ClusterError::Connection(format!("write to {addr} failed: {e}")));
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop(
    mut reader: ReadHalf<Box<dyn AsyncStream>>,
    inbox: Arc<Mutex<Inbox>>,
    addr: NodeAddr,
) {
    let mut buf = BytesMut::with_capacity(16 * 1024);
    let mut decoder = ReplyDecoder::new();
    let err = 'read: loop {
        loop {
            match decoder.decode(&mut buf) {
                Ok(Some(reply)) => deliver(&inbox, &addr, reply),
                Ok(None) => break,
                Err(e) => break 'read ClusterError::from(e),
            }
        }
        match reader.read_buf(&mut buf).await {
            Ok(0) => break ClusterError::Connection(format!("connection to {addr} closed by peer")),
            Ok(_) => {}
            Err(e) => break ClusterError::Connection(format!("read from {addr} failed: {e}")),
        }
    };
    debug!(%addr, error = %err, "reader stopped");
    inbox.lock().fail_all(err);
}

fn deliver(inbox: &Mutex<Inbox>, addr: &NodeAddr, reply: Reply) {
    let mut inbox = inbox.lock();
    let Some(front) = inbox.queue.front_mut() else {
        trace!(%addr, %reply, "dropping unsolicited reply");
        return;
    };
    front.replies.push(reply);
    if front.replies.len() >= front.expected {
        if let Some(done) = inbox.queue.pop_front() {
            let _ = done.tx.send(Ok(done.replies));
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use phloem_protocol::encode_args;
    use tokio::io::{duplex, DuplexStream};

    /// Hands out the client ends of in-memory pipes
    pub(crate) struct PipeConnector {
        ends: Mutex<VecDeque<DuplexStream>>,
    }

    impl PipeConnector {
        pub(crate) fn new(count: usize) -> (Self, Vec<DuplexStream>) {
            let mut ends = VecDeque::new();
            let mut peers = Vec::new();
            for _ in 0..count {
                let (client, server) = duplex(64 * 1024);
                ends.push_back(client);
                peers.push(server);
            }
            (Self { ends: Mutex::new(ends) }, peers)
        }
    }

    #[async_trait]
    impl AsyncConnector for PipeConnector {
        async fn connect(
            &self,
            host: &str,
            port: u16,
            _timeout: Duration,
        ) -> phloem_transport::Result<Box<dyn AsyncStream>> {
            match self.ends.lock().pop_front() {
                Some(end) => Ok(Box::new(end)),
                None => Err(phloem_transport::Error::Connection(format!("{host}:{port} refused"))),
            }
        }
    }

    fn options() -> ConnectOptions {
        ConnectOptions {
            connect_timeout: Duration::from_secs(1),
            command_timeout: Some(Duration::from_secs(5)),
            handshake: Handshake::default(),
        }
    }

    fn addr() -> NodeAddr {
        NodeAddr::new("127.0.0.1", 7000)
    }

    async fn read_exact_len(peer: &mut DuplexStream, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        peer.read_exact(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn test_replies_follow_request_order() {
        let (connector, mut peers) = PipeConnector::new(1);
        let mut peer = peers.remove(0);
        let conn = AsyncConnection::open(&connector, &addr(), 1, &options()).await.unwrap();

        let get_a = encode_args(["GET", "a"]);
        let get_b = encode_args(["GET", "b"]);
        let (first, second, _) = tokio::join!(
            conn.request(get_a.clone(), 1),
            conn.request(get_b.clone(), 1),
            async {
                read_exact_len(&mut peer, get_a.len() + get_b.len()).await;
                peer.write_all(b"$1\r\n1\r\n$1\r\n2\r\n").await.unwrap();
            }
        );
        assert_eq!(first.unwrap(), vec![Reply::bulk("1")]);
        assert_eq!(second.unwrap(), vec![Reply::bulk("2")]);
    }

    #[tokio::test]
    async fn test_multi_reply_request() {
        let (connector, mut peers) = PipeConnector::new(1);
        let mut peer = peers.remove(0);
        let conn = AsyncConnection::open(&connector, &addr(), 1, &options()).await.unwrap();

        let payload = Bytes::from_static(b"*1\r\n$6\r\nASKING\r\n*2\r\n$3\r\nGET\r\n$1\r\nk\r\n");
        let (replies, _) = tokio::join!(conn.request(payload.clone(), 2), async {
            read_exact_len(&mut peer, payload.len()).await;
            peer.write_all(b"+OK\r\n$1\r\nv\r\n").await.unwrap();
        });
        assert_eq!(replies.unwrap(), vec![Reply::status("OK"), Reply::bulk("v")]);
    }

    #[tokio::test]
    async fn test_abandoned_request_keeps_fifo() {
        let (connector, mut peers) = PipeConnector::new(1);
        let mut peer = peers.remove(0);
        let mut options = options();
        options.command_timeout = Some(Duration::from_millis(50));
        let conn = AsyncConnection::open(&connector, &addr(), 1, &options).await.unwrap();

        let err = conn.request(encode_args(["GET", "slow"]), 1).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Connection);

        // the late reply belongs to the abandoned request
        peer.write_all(b"$4\r\nlate\r\n").await.unwrap();
        let (reply, _) = tokio::join!(conn.request(encode_args(["GET", "next"]), 1), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            peer.write_all(b"$4\r\nnext\r\n").await.unwrap();
        });
        assert_eq!(reply.unwrap(), vec![Reply::bulk("next")]);
    }

    #[tokio::test]
    async fn test_peer_close_fails_pending() {
        let (connector, mut peers) = PipeConnector::new(1);
        let peer = peers.remove(0);
        let conn = AsyncConnection::open(&connector, &addr(), 1, &options()).await.unwrap();

        let (reply, _) = tokio::join!(conn.request(encode_args(["GET", "a"]), 1), async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            drop(peer);
        });
        assert_eq!(reply.unwrap_err().kind(), crate::ErrorKind::Connection);
        assert!(conn.is_closed());
        assert!(conn.request(encode_args(["GET", "a"]), 1).await.is_err());
    }

    #[tokio::test]
    async fn test_handshake_failure() {
        let (connector, mut peers) = PipeConnector::new(1);
        let mut peer = peers.remove(0);
        let mut options = options();
        options.handshake = Handshake::from_config(&{
            let mut config = crate::ClusterConfig::with_seeds("127.0.0.1:7000").unwrap();
            config.password = Some("bad".into());
            config
        });

        let auth = encode_args(["AUTH", "bad"]);
        let addr = addr();
        let (opened, _) = tokio::join!(AsyncConnection::open(&connector, &addr, 1, &options), async {
            assert_eq!(read_exact_len(&mut peer, auth.len()).await, auth.to_vec());
            peer.write_all(b"-WRONGPASS invalid username-password pair\r\n").await.unwrap();
        });
        let err = match opened {
            Ok(_) => panic!("handshake should fail"),
            Err(e) => e,
        };
        assert!(err.to_string().contains("WRONGPASS"));
    }
}

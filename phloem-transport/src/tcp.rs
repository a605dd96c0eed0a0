//! TCP transport implementation using non-blocking I/O with mio

use super::{Transport, TransportFactory, TransportOptions};
use crate::{Error, Result};
use bytes::BytesMut;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::{Duration, Instant};
use tracing::debug;

const SOCKET_TOKEN: Token = Token(0);

const READ_CHUNK: usize = 16 * 1024;

pub struct TcpTransport {
    stream: Option<TcpStream>,
    poll: Poll,
    events: Events,
    options: TransportOptions,
}

impl TcpTransport {
    pub fn new(options: TransportOptions) -> Result<Self> {
        Ok(Self { stream: None, poll: Poll::new()?, events: Events::with_capacity(4), options })
    }

    /// Block until the socket reports an event or `deadline` passes
    fn wait(&mut self, deadline: Option<Instant>, what: &str) -> Result<()> {
        loop {
            let timeout = match deadline {
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Err(Error::Timeout(format!("{what} timed out")));
                    }
                    Some(left)
                }
                None => None,
            };
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) if !self.events.is_empty() => return Ok(()),
                Ok(()) => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn io_deadline(&self) -> Option<Instant> {
        self.options.io_timeout.map(|t| Instant::now() + t)
    }

    fn connect_addr(&mut self, addr: SocketAddr) -> Result<TcpStream> {
        let mut stream = TcpStream::connect(addr)?;
        self.poll.registry().register(
            &mut stream,
            SOCKET_TOKEN,
            Interest::WRITABLE | Interest::READABLE,
        )?;

        let deadline = Instant::now() + self.options.connect_timeout;
        loop {
            if let Err(e) = self.wait(Some(deadline), "connect") {
                let _ = self.poll.registry().deregister(&mut stream);
                return Err(e);
            }
            let writable = self
                .events
                .iter()
                .any(|event| event.token() == SOCKET_TOKEN && event.is_writable());
            if !writable {
                continue;
            }

            // Connection attempt finished - check for errors
            if let Some(err) = stream.take_error()? {
                let _ = self.poll.registry().deregister(&mut stream);
                return Err(Error::Connection(format!("connect to {addr} failed: {err}")));
            }
            match stream.peer_addr() {
                Ok(_) => break,
                Err(e) if e.kind() == io::ErrorKind::NotConnected => continue,
                Err(e) => {
                    let _ = self.poll.registry().deregister(&mut stream);
                    return Err(Error::Connection(format!("connect to {addr} failed: {e}")));
                }
            }
        }
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

impl Transport for TcpTransport {
    fn connect(&mut self, host: &str, port: u16) -> Result<()> {
        self.close()?;
        let addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|e| Error::Connection(format!("cannot resolve {host}:{port}: {e}")))?
            .collect();

        let mut last_err = Error::Connection(format!("{host}:{port} resolved to no address"));
        for addr in addrs {
            match self.connect_addr(addr) {
                Ok(stream) => {
                    debug!(%addr, "connected");
                    self.stream = Some(stream);
                    return Ok(());
                }
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    fn send(&mut self, data: &[u8]) -> Result<()> {
        let deadline = self.io_deadline();
        let mut written = 0;
        while written < data.len() {
            let stream = self
                .stream
                .as_mut()
                .ok_or_else(|| Error::Connection("Not connected".to_string()))?;
            match stream.write(&data[written..]) {
                Ok(0) => return Err(Error::Closed),
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => self.wait(deadline, "send")?,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn recv(&mut self, buf: &mut BytesMut) -> Result<usize> {
        let deadline = self.io_deadline();
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let stream = self
                .stream
                .as_mut()
                .ok_or_else(|| Error::Connection("Not connected".to_string()))?;
            match stream.read(&mut chunk) {
                Ok(0) => return Err(Error::Closed),
                Ok(n) => {
                    buf.extend_from_slice(&chunk[..n]);
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => self.wait(deadline, "receive")?,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            let _ = self.poll.registry().deregister(&mut stream);
        }
        Ok(())
    }
}

/// Creates [`TcpTransport`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTransportFactory;

impl TransportFactory for TcpTransportFactory {
    fn create(&self, options: &TransportOptions) -> Result<Box<dyn Transport>> {
        if options.connect_timeout.is_zero() {
            return Err(Error::Config("connect timeout must be non-zero".to_string()));
        }
        if options.io_timeout == Some(Duration::ZERO) {
            return Err(Error::Config("I/O timeout must be non-zero".to_string()));
        }
        Ok(Box::new(TcpTransport::new(options.clone())?))
    }
}

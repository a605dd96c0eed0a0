//! Phloem Transport Layer
//!
//! Socket plumbing for the cluster client. Two APIs are provided:
//!
//! ## Blocking API (`Transport` trait)
//!
//! One non-blocking mio socket per transport, driven by its own `Poll` so
//! that every connect, send and receive can honor a deadline. Used by the
//! synchronous client.
//!
//! ```rust,no_run
//! use bytes::BytesMut;
//! use phloem_transport::{TcpTransportFactory, TransportFactory, TransportOptions};
//!
//! let factory = TcpTransportFactory;
//! let mut transport = factory.create(&TransportOptions::default()).unwrap();
//! transport.connect("127.0.0.1", 7000).unwrap();
//! transport.send(b"*1\r\n$4\r\nPING\r\n").unwrap();
//!
//! let mut buf = BytesMut::new();
//! transport.recv(&mut buf).unwrap();
//! ```
//!
//! ## Async API (`AsyncConnector` trait)
//!
//! Opens tokio streams for the async client, which splits each stream into
//! a reader task and a writer task.

use std::fmt;
use std::time::Duration;

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, Error>;

/// Transport layer error types
#[derive(Debug)]
pub enum Error {
    /// I/O errors from transport layer
    Io(std::io::Error),

    /// Connection could not be established or is not established
    Connection(String),

    /// A deadline passed before the operation completed
    Timeout(String),

    /// Configuration errors
    Config(String),

    /// The peer closed the connection
    Closed,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::Connection(msg) => write!(f, "Connection error: {msg}"),
            Error::Timeout(msg) => write!(f, "Timeout: {msg}"),
            Error::Config(msg) => write!(f, "Configuration error: {msg}"),
            Error::Closed => write!(f, "Connection closed by peer"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => Error::Timeout(err.to_string()),
            _ => Error::Io(err),
        }
    }
}

/// Timeouts applied to a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOptions {
    /// Upper bound for establishing the TCP connection
    pub connect_timeout: Duration,
    /// Upper bound for each send or receive; `None` waits forever
    pub io_timeout: Option<Duration>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self { connect_timeout: Duration::from_secs(5), io_timeout: None }
    }
}

// =============================================================================
// Blocking API (Transport trait)
// =============================================================================

/// A single blocking connection
///
/// Implementations block the calling thread until the operation completes
/// or the configured timeout elapses.
pub trait Transport: Send {
    /// Connect to `host:port`, resolving the host if needed
    fn connect(&mut self, host: &str, port: u16) -> Result<()>;

    /// Write all of `data`
    fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Append at least one byte to `buf`, returning how many were read
    ///
    /// A peer that closes the connection yields [`Error::Closed`].
    fn recv(&mut self, buf: &mut bytes::BytesMut) -> Result<usize>;

    /// Check if this connection is established
    fn is_connected(&self) -> bool;

    /// Close the connection
    fn close(&mut self) -> Result<()>;
}

/// Factory for blocking transports
///
/// The factory is `Send + Sync` so a client can be moved between threads;
/// tests swap in factories that hand out scripted transports.
pub trait TransportFactory: Send + Sync {
    /// Create an unconnected transport
    fn create(&self, options: &TransportOptions) -> Result<Box<dyn Transport>>;
}

// =============================================================================
// Module declarations
// =============================================================================

pub mod stream;
pub mod tcp;

// =============================================================================
// Re-exports
// =============================================================================

pub use stream::{AsyncConnector, AsyncStream, TokioTcpConnector};
pub use tcp::{TcpTransport, TcpTransportFactory};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timed_out_io_maps_to_timeout() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow").into();
        assert!(matches!(err, Error::Timeout(_)));

        let err: Error = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "rst").into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_display() {
        assert_eq!(Error::Closed.to_string(), "Connection closed by peer");
        assert_eq!(Error::Connection("refused".into()).to_string(), "Connection error: refused");
    }
}

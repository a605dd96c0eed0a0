//! Async stream connector backed by tokio

use crate::{Error, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

/// A bidirectional byte stream usable from tokio tasks
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Opens async streams to cluster nodes
#[async_trait]
pub trait AsyncConnector: Send + Sync {
    /// Connect to `host:port` within `timeout`
    async fn connect(&self, host: &str, port: u16, timeout: Duration)
        -> Result<Box<dyn AsyncStream>>;
}

/// Plain TCP via `tokio::net::TcpStream`
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioTcpConnector;

#[async_trait]
impl AsyncConnector for TokioTcpConnector {
    async fn connect(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<Box<dyn AsyncStream>> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| Error::Timeout(format!("connect to {host}:{port} timed out")))?
            .map_err(|e| Error::Connection(format!("connect to {host}:{port} failed: {e}")))?;
        stream.set_nodelay(true)?;
        debug!(host, port, "connected");
        Ok(Box::new(stream))
    }
}

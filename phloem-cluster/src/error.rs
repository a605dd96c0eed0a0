//! Error types for the cluster client

use phloem_protocol::{ParseError, RedirectError, RespError};
use thiserror::Error;

/// Result type for cluster operations
pub type Result<T> = std::result::Result<T, ClusterError>;

/// Coarse classification of a [`ClusterError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The command could not be parsed or has no usable keys
    Parse,
    /// Memory for the key list could not be reserved
    OutOfMemory,
    /// No node can serve the command
    Routing,
    /// Connecting, sending or receiving failed
    Connection,
    /// A node sent a redirect that could not be understood
    ClusterRedirect,
    /// The retry budget of a command ran out
    TooManyRetries,
    /// A reply did not have the expected shape
    ProtocolMismatch,
    /// A discovery reply was rejected or no node could be asked
    Topology,
    /// Invalid client settings
    Config,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClusterError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("{0}")]
    Routing(String),

    #[error("{0}")]
    Connection(String),

    #[error(transparent)]
    Redirect(#[from] RedirectError),

    #[error("too many cluster retries")]
    TooManyRetries,

    #[error("{0}")]
    ProtocolMismatch(String),

    #[error("{0}")]
    Topology(String),

    #[error("{0}")]
    Config(String),
}

impl ClusterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClusterError::Parse(ParseError::OutOfMemory) => ErrorKind::OutOfMemory,
            ClusterError::Parse(_) => ErrorKind::Parse,
            ClusterError::Routing(_) => ErrorKind::Routing,
            ClusterError::Connection(_) => ErrorKind::Connection,
            ClusterError::Redirect(_) => ErrorKind::ClusterRedirect,
            ClusterError::TooManyRetries => ErrorKind::TooManyRetries,
            ClusterError::ProtocolMismatch(_) => ErrorKind::ProtocolMismatch,
            ClusterError::Topology(_) => ErrorKind::Topology,
            ClusterError::Config(_) => ErrorKind::Config,
        }
    }

    pub(crate) fn no_keys() -> Self {
        ClusterError::Routing("No keys in command (must have keys for cluster mode)".to_string())
    }

    pub(crate) fn pipeline_pending(queued: usize) -> Self {
        ClusterError::Routing(format!(
            "{queued} pipelined commands still queued; call get_reply or reset first"
        ))
    }

    pub(crate) fn slot_unserved(slot: u16) -> Self {
        ClusterError::Routing(format!("slot not served by any node (slot {slot})"))
    }

    pub(crate) fn cross_slot() -> Self {
        ClusterError::Routing("CROSSSLOT Keys in request don't hash to the same slot".to_string())
    }

    /// True for failures that leave the connection in an unknown state
    pub(crate) fn is_connection(&self) -> bool {
        matches!(self, ClusterError::Connection(_))
    }
}

impl From<phloem_transport::Error> for ClusterError {
    fn from(err: phloem_transport::Error) -> Self {
        match err {
            phloem_transport::Error::Config(msg) => ClusterError::Config(msg),
            other => ClusterError::Connection(other.to_string()),
        }
    }
}

impl From<RespError> for ClusterError {
    fn from(err: RespError) -> Self {
        ClusterError::ProtocolMismatch(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(ClusterError::from(ParseError::OutOfMemory).kind(), ErrorKind::OutOfMemory);
        assert_eq!(ClusterError::from(ParseError::MissingKeys("EVAL")).kind(), ErrorKind::Parse);
        assert_eq!(ClusterError::no_keys().kind(), ErrorKind::Routing);
        assert_eq!(
            ClusterError::from(RedirectError("MOVED x".into())).kind(),
            ErrorKind::ClusterRedirect
        );
        assert_eq!(
            ClusterError::from(phloem_transport::Error::Closed).kind(),
            ErrorKind::Connection
        );
    }

    #[test]
    fn test_messages() {
        assert_eq!(ClusterError::TooManyRetries.to_string(), "too many cluster retries");
        assert_eq!(
            ClusterError::no_keys().to_string(),
            "No keys in command (must have keys for cluster mode)"
        );
        assert!(ClusterError::slot_unserved(7).to_string().starts_with("slot not served by any node"));
    }
}

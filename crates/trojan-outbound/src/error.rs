//! Outbound error types.

use std::fmt;
use std::io;

use trojan_core::errors;
use trojan_proto::FrameError;

/// Boxed error carried by handshake failures, which come from several layers
/// (TLS, WebSocket, HTTP upgrade, HTTP/2).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Step of a dial at which an error happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Connect,
    Handshake,
    Header,
    Frame,
}

impl Stage {
    pub const fn as_str(self) -> &'static str {
        match self {
            Stage::Connect => "connect",
            Stage::Handshake => "handshake",
            Stage::Header => "header",
            Stage::Frame => "frame",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by the outbound adapter.
#[derive(Debug, thiserror::Error)]
pub enum OutboundError {
    #[error("{addr} connect error: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("{addr} handshake error: {source}")]
    Handshake {
        addr: String,
        #[source]
        source: BoxError,
    },

    #[error("failed to write request header: {0}")]
    Header(#[source] io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] FrameError),

    #[error("config error: {0}")]
    Config(String),

    #[error("invoke deprecated stream_conn; use stream_conn_context")]
    DeprecatedApi,

    #[error("{stage} cancelled")]
    Cancelled { stage: Stage },

    #[error("{stage} timed out")]
    TimedOut { stage: Stage },

    #[error("connection closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl OutboundError {
    pub(crate) fn handshake(addr: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Handshake {
            addr: addr.into(),
            source: source.into(),
        }
    }

    /// Dial step the error belongs to, if any.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Connect { .. } => Some(Stage::Connect),
            Self::Handshake { .. } => Some(Stage::Handshake),
            Self::Header(_) => Some(Stage::Header),
            Self::Protocol(_) | Self::Closed | Self::Io(_) => Some(Stage::Frame),
            Self::Cancelled { stage } | Self::TimedOut { stage } => Some(*stage),
            Self::Config(_) | Self::DeprecatedApi => None,
        }
    }

    /// Error kind label for logging.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Connect { .. } => errors::ERROR_CONNECT,
            Self::Handshake { .. } => errors::ERROR_HANDSHAKE,
            Self::Header(_) => errors::ERROR_HEADER,
            Self::Protocol(_) => errors::ERROR_PROTOCOL,
            Self::Config(_) => errors::ERROR_CONFIG,
            Self::DeprecatedApi => errors::ERROR_DEPRECATED,
            Self::Cancelled { .. } => errors::ERROR_CANCELLED,
            Self::TimedOut { .. } => errors::ERROR_TIMEOUT,
            Self::Closed | Self::Io(_) => errors::ERROR_IO,
        }
    }
}

impl From<trojan_proto::AddressError> for OutboundError {
    fn from(e: trojan_proto::AddressError) -> Self {
        Self::Config(format!("invalid address: {e}"))
    }
}

impl From<OutboundError> for io::Error {
    fn from(e: OutboundError) -> Self {
        match e {
            OutboundError::Io(e) | OutboundError::Header(e) => e,
            OutboundError::Connect { source, .. } => source,
            OutboundError::Closed => io::Error::new(io::ErrorKind::NotConnected, e),
            OutboundError::TimedOut { .. } => io::Error::new(io::ErrorKind::TimedOut, e),
            OutboundError::Cancelled { .. } => io::Error::new(io::ErrorKind::Interrupted, e),
            OutboundError::Protocol(_) => io::Error::new(io::ErrorKind::InvalidData, e),
            other => io::Error::other(other),
        }
    }
}

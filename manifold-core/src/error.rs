/// Manifold Error Types
///
/// One error enum shared by sockets, queues, AIOs, pipes and transports.
/// AIO results are read by callbacks and waiters alike, so the error is
/// `Clone`; I/O errors are kept behind an `Arc`.
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Main error type for Manifold operations
#[derive(Error, Debug, Clone)]
pub enum ManifoldError {
    /// No protocol is registered under the requested identifier
    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(u16),

    /// Option key is not known to the socket or its protocol
    #[error("Invalid option: {0}")]
    InvalidOption(String),

    /// Option value has the wrong type or is out of range
    #[error("Invalid value for option {0}")]
    InvalidValue(String),

    /// Option can be read but not written
    #[error("Option is read-only: {0}")]
    ReadOnly(String),

    /// Object is shutting down and refuses new work
    #[error("Object is closing")]
    Closing,

    /// Object is closed
    #[error("Object closed")]
    Closed,

    /// Blocking operation did not complete in time
    #[error("Operation timed out")]
    Timeout,

    /// Non-blocking operation could not proceed
    #[error("Operation would block")]
    WouldBlock,

    /// AIO was canceled before completion
    #[error("Operation canceled")]
    Canceled,

    /// AIO deadline passed before completion
    #[error("Operation expired")]
    Expired,

    /// AIO submitted while it was still in flight
    #[error("Operation already in progress")]
    InvalidState,

    /// Operation is not supported by the protocol
    #[error("Operation not supported")]
    NotSupported,

    /// Protocol has no room for another peer
    #[error("Resource busy")]
    Busy,

    /// Remote peer speaks an incompatible protocol
    #[error("Protocol mismatch: local {local}, peer {peer}")]
    ProtocolMismatch { local: u16, peer: u16 },

    /// Address could not be parsed or is not supported here
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Message too large
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// Framing or handshake error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Transport I/O error, surfaced unmodified
    #[error("IO error: {0}")]
    Io(Arc<io::Error>),
}

/// Result type alias for Manifold operations
pub type Result<T> = std::result::Result<T, ManifoldError>;

impl From<io::Error> for ManifoldError {
    fn from(e: io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

impl From<ManifoldError> for io::Error {
    fn from(e: ManifoldError) -> Self {
        let kind = match &e {
            ManifoldError::Io(inner) => inner.kind(),
            ManifoldError::Timeout | ManifoldError::Expired => io::ErrorKind::TimedOut,
            ManifoldError::WouldBlock => io::ErrorKind::WouldBlock,
            ManifoldError::Closed | ManifoldError::Closing => io::ErrorKind::NotConnected,
            ManifoldError::InvalidOption(_)
            | ManifoldError::InvalidValue(_)
            | ManifoldError::InvalidAddress(_) => io::ErrorKind::InvalidInput,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, e)
    }
}

impl ManifoldError {
    /// Create a protocol error with a message
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create an invalid value error for the named option
    pub fn invalid_value(name: impl Into<String>) -> Self {
        Self::InvalidValue(name.into())
    }

    /// Create an invalid option error for the named option
    pub fn invalid_option(name: impl Into<String>) -> Self {
        Self::InvalidOption(name.into())
    }

    /// Map an AIO expiration to the error a blocking caller sees.
    #[must_use]
    pub fn into_blocking(self) -> Self {
        match self {
            Self::Expired => Self::Timeout,
            other => other,
        }
    }

    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
            Self::Timeout | Self::WouldBlock | Self::Expired | Self::Busy => true,
            _ => false,
        }
    }

    /// Check if this is a connection error
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::Closed | Self::ProtocolMismatch { .. } => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::NotConnected
            ),
            _ => false,
        }
    }
}

/// Convert a duration option in milliseconds (`-1` meaning "forever").
pub(crate) fn ms_to_timeout(ms: i64, name: &str) -> Result<Option<Duration>> {
    match ms {
        -1 => Ok(None),
        ms if ms >= 0 => Ok(Some(Duration::from_millis(ms as u64))),
        _ => Err(ManifoldError::invalid_value(name)),
    }
}

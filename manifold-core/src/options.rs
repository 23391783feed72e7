//! Socket configuration options
//!
//! Options can be set in two ways: up front through the [`SocketOptions`]
//! builder handed to [`Socket::create_with`](crate::socket::Socket::create_with),
//! or at runtime through the string-keyed
//! [`Socket::set_option`](crate::socket::Socket::set_option) surface using the
//! names in [`keys`]. Keys the core does not know are forwarded to the
//! socket's protocol.

use crate::error::{ms_to_timeout, ManifoldError, Result};
use std::fmt;
use std::time::Duration;

/// Largest accepted depth for the upper send and receive queues.
pub const MAX_BUFFER: usize = 8192;

/// Option names understood by the socket core.
pub mod keys {
    pub const RECV_BUFFER: &str = "recv-buffer";
    pub const SEND_BUFFER: &str = "send-buffer";
    pub const RECV_TIMEOUT: &str = "recv-timeout";
    pub const SEND_TIMEOUT: &str = "send-timeout";
    pub const RECONNECT_TIME_MIN: &str = "reconnect-time-min";
    pub const RECONNECT_TIME_MAX: &str = "reconnect-time-max";
    pub const LINGER: &str = "linger";
    pub const BEST_EFFORT: &str = "best-effort";
    pub const RECV_SIZE_MAX: &str = "recv-size-max";
    pub const TCP_NODELAY: &str = "tcp-nodelay";
    pub const SOCKET_NAME: &str = "socket-name";

    // Read-only protocol identity.
    pub const PROTOCOL: &str = "protocol";
    pub const PEER: &str = "peer";
    pub const PROTOCOL_NAME: &str = "protocol-name";
    pub const PEER_NAME: &str = "peer-name";
}

/// A typed option value.
///
/// Durations use `None` for "infinite". Integer values are accepted for
/// durations (milliseconds, `-1` = infinite) and sizes, so callers that only
/// deal in integers (like a CLI) can set every numeric option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    Int(i64),
    Bool(bool),
    Duration(Option<Duration>),
    Size(usize),
    Str(String),
}

impl OptionValue {
    /// Interpret as a bounded integer.
    pub fn to_int(&self, name: &str, min: i64, max: i64) -> Result<i64> {
        let v = match *self {
            Self::Int(v) => v,
            Self::Size(v) => i64::try_from(v).map_err(|_| ManifoldError::invalid_value(name))?,
            _ => return Err(ManifoldError::invalid_value(name)),
        };
        if (min..=max).contains(&v) {
            Ok(v)
        } else {
            Err(ManifoldError::invalid_value(name))
        }
    }

    /// Interpret as a duration; integers are milliseconds, `-1` = infinite.
    pub fn to_timeout(&self, name: &str) -> Result<Option<Duration>> {
        match *self {
            Self::Duration(d) => Ok(d),
            Self::Int(ms) => ms_to_timeout(ms, name),
            _ => Err(ManifoldError::invalid_value(name)),
        }
    }

    /// Interpret as a finite duration.
    pub fn to_duration(&self, name: &str) -> Result<Duration> {
        self.to_timeout(name)?
            .ok_or_else(|| ManifoldError::invalid_value(name))
    }

    pub fn to_size(&self, name: &str) -> Result<usize> {
        match *self {
            Self::Size(v) => Ok(v),
            Self::Int(v) => usize::try_from(v).map_err(|_| ManifoldError::invalid_value(name)),
            _ => Err(ManifoldError::invalid_value(name)),
        }
    }

    pub fn to_bool(&self, name: &str) -> Result<bool> {
        match *self {
            Self::Bool(v) => Ok(v),
            _ => Err(ManifoldError::invalid_value(name)),
        }
    }

    pub fn to_str(&self, name: &str) -> Result<&str> {
        match self {
            Self::Str(s) => Ok(s),
            _ => Err(ManifoldError::invalid_value(name)),
        }
    }
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Duration(None) => write!(f, "infinite"),
            Self::Duration(Some(d)) => write!(f, "{}ms", d.as_millis()),
            Self::Size(v) => write!(f, "{v}"),
            Self::Str(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for OptionValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<bool> for OptionValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<Duration> for OptionValue {
    fn from(v: Duration) -> Self {
        Self::Duration(Some(v))
    }
}

impl From<Option<Duration>> for OptionValue {
    fn from(v: Option<Duration>) -> Self {
        Self::Duration(v)
    }
}

impl From<usize> for OptionValue {
    fn from(v: usize) -> Self {
        Self::Size(v)
    }
}

impl From<&str> for OptionValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

/// Socket configuration options.
///
/// # Examples
///
/// ```
/// use manifold_core::options::SocketOptions;
/// use std::time::Duration;
///
/// let opts = SocketOptions::default()
///     .with_recv_timeout(Duration::from_secs(5))
///     .with_send_buffer(256);
/// assert_eq!(opts.send_buffer, 256);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketOptions {
    /// Depth of the upper receive queue (1..=8192).
    pub recv_buffer: usize,

    /// Depth of the upper send queue (1..=8192).
    pub send_buffer: usize,

    /// Receive timeout for blocking calls.
    /// - `None`: block indefinitely (default)
    /// - `Some(Duration::ZERO)`: fail at once with `Timeout` if nothing is queued
    pub recv_timeout: Option<Duration>,

    /// Send timeout for blocking calls; same conventions as `recv_timeout`.
    pub send_timeout: Option<Duration>,

    /// Initial delay before redialing a failed or lost connection.
    pub reconnect_ivl: Duration,

    /// Upper bound for the doubling redial delay.
    /// - `Duration::ZERO`: never grow, always wait `reconnect_ivl`
    pub reconnect_ivl_max: Duration,

    /// How long close waits for queued outbound messages to drain.
    pub linger: Duration,

    /// Drop outbound messages instead of blocking when the send queue is full.
    pub best_effort: bool,

    /// Largest inbound message accepted on stream transports (0 = no limit).
    pub recv_size_max: usize,

    /// Disable Nagle's algorithm on new TCP pipes.
    pub tcp_nodelay: bool,

    /// Diagnostic name. Defaults to the socket id.
    pub socket_name: Option<String>,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            recv_buffer: 128,
            send_buffer: 128,
            recv_timeout: None,
            send_timeout: None,
            reconnect_ivl: Duration::from_millis(100),
            reconnect_ivl_max: Duration::from_millis(5000),
            linger: Duration::ZERO,
            best_effort: false,
            recv_size_max: 0,
            tcp_nodelay: true,
            socket_name: None,
        }
    }
}

impl SocketOptions {
    /// Create new socket options with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_recv_buffer(mut self, depth: usize) -> Self {
        self.recv_buffer = depth;
        self
    }

    #[must_use]
    pub fn with_send_buffer(mut self, depth: usize) -> Self {
        self.send_buffer = depth;
        self
    }

    /// Set receive timeout.
    ///
    /// ```
    /// use manifold_core::options::SocketOptions;
    /// use std::time::Duration;
    ///
    /// // Poll without waiting
    /// let opts = SocketOptions::new().with_recv_timeout(Duration::ZERO);
    /// assert_eq!(opts.recv_timeout, Some(Duration::ZERO));
    /// ```
    #[must_use]
    pub fn with_recv_timeout(mut self, timeout: Duration) -> Self {
        self.recv_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_reconnect_ivl(mut self, ivl: Duration) -> Self {
        self.reconnect_ivl = ivl;
        self
    }

    #[must_use]
    pub fn with_reconnect_ivl_max(mut self, max: Duration) -> Self {
        self.reconnect_ivl_max = max;
        self
    }

    #[must_use]
    pub fn with_linger(mut self, linger: Duration) -> Self {
        self.linger = linger;
        self
    }

    #[must_use]
    pub fn with_best_effort(mut self, enabled: bool) -> Self {
        self.best_effort = enabled;
        self
    }

    #[must_use]
    pub fn with_recv_size_max(mut self, max: usize) -> Self {
        self.recv_size_max = max;
        self
    }

    #[must_use]
    pub fn with_tcp_nodelay(mut self, enabled: bool) -> Self {
        self.tcp_nodelay = enabled;
        self
    }

    #[must_use]
    pub fn with_socket_name(mut self, name: impl Into<String>) -> Self {
        self.socket_name = Some(name.into());
        self
    }

    /// Check the ranges a builder could have violated.
    ///
    /// # Errors
    ///
    /// `InvalidValue` naming the first offending option.
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_BUFFER).contains(&self.recv_buffer) {
            return Err(ManifoldError::invalid_value(keys::RECV_BUFFER));
        }
        if !(1..=MAX_BUFFER).contains(&self.send_buffer) {
            return Err(ManifoldError::invalid_value(keys::SEND_BUFFER));
        }
        Ok(())
    }

    /// Apply one string-keyed option.
    ///
    /// The value is fully validated before anything is written, so on error
    /// the options are unchanged.
    ///
    /// # Errors
    ///
    /// `InvalidOption` for keys the core does not interpret (the caller may
    /// forward those to the protocol), `ReadOnly` for protocol identity keys,
    /// `InvalidValue` for a wrong type or out-of-range value.
    pub fn set(&mut self, key: &str, value: &OptionValue) -> Result<()> {
        let buffer = |value: &OptionValue| {
            value
                .to_int(key, 1, MAX_BUFFER as i64)
                .map(|v| v as usize)
        };
        match key {
            keys::RECV_BUFFER => self.recv_buffer = buffer(value)?,
            keys::SEND_BUFFER => self.send_buffer = buffer(value)?,
            keys::RECV_TIMEOUT => self.recv_timeout = value.to_timeout(key)?,
            keys::SEND_TIMEOUT => self.send_timeout = value.to_timeout(key)?,
            keys::RECONNECT_TIME_MIN => self.reconnect_ivl = value.to_duration(key)?,
            keys::RECONNECT_TIME_MAX => self.reconnect_ivl_max = value.to_duration(key)?,
            keys::LINGER => self.linger = value.to_duration(key)?,
            keys::BEST_EFFORT => self.best_effort = value.to_bool(key)?,
            keys::RECV_SIZE_MAX => self.recv_size_max = value.to_size(key)?,
            keys::TCP_NODELAY => self.tcp_nodelay = value.to_bool(key)?,
            keys::SOCKET_NAME => {
                let name = value.to_str(key)?;
                if name.is_empty() || name.len() > 64 {
                    return Err(ManifoldError::invalid_value(key));
                }
                self.socket_name = Some(name.to_string());
            }
            keys::PROTOCOL | keys::PEER | keys::PROTOCOL_NAME | keys::PEER_NAME => {
                return Err(ManifoldError::ReadOnly(key.to_string()));
            }
            _ => return Err(ManifoldError::invalid_option(key)),
        }
        Ok(())
    }

    /// Read one string-keyed option; `None` if the core does not own `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<OptionValue> {
        let value = match key {
            keys::RECV_BUFFER => OptionValue::Int(self.recv_buffer as i64),
            keys::SEND_BUFFER => OptionValue::Int(self.send_buffer as i64),
            keys::RECV_TIMEOUT => OptionValue::Duration(self.recv_timeout),
            keys::SEND_TIMEOUT => OptionValue::Duration(self.send_timeout),
            keys::RECONNECT_TIME_MIN => OptionValue::from(self.reconnect_ivl),
            keys::RECONNECT_TIME_MAX => OptionValue::from(self.reconnect_ivl_max),
            keys::LINGER => OptionValue::from(self.linger),
            keys::BEST_EFFORT => OptionValue::Bool(self.best_effort),
            keys::RECV_SIZE_MAX => OptionValue::Size(self.recv_size_max),
            keys::TCP_NODELAY => OptionValue::Bool(self.tcp_nodelay),
            keys::SOCKET_NAME => OptionValue::Str(self.socket_name.clone()?),
            _ => return None,
        };
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = SocketOptions::default();
        assert_eq!(opts.recv_buffer, 128);
        assert_eq!(opts.send_buffer, 128);
        assert_eq!(opts.recv_timeout, None);
        assert_eq!(opts.linger, Duration::ZERO);
        assert!(opts.tcp_nodelay);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_set_buffer_range() {
        let mut opts = SocketOptions::default();
        opts.set(keys::SEND_BUFFER, &OptionValue::Int(8192)).unwrap();
        assert_eq!(opts.send_buffer, 8192);
        assert!(matches!(
            opts.set(keys::SEND_BUFFER, &OptionValue::Int(0)),
            Err(ManifoldError::InvalidValue(_))
        ));
        assert!(matches!(
            opts.set(keys::SEND_BUFFER, &OptionValue::Int(8193)),
            Err(ManifoldError::InvalidValue(_))
        ));
        assert_eq!(opts.send_buffer, 8192);
    }

    #[test]
    fn test_timeout_from_millis() {
        let mut opts = SocketOptions::default();
        opts.set(keys::RECV_TIMEOUT, &OptionValue::Int(5000)).unwrap();
        assert_eq!(opts.recv_timeout, Some(Duration::from_secs(5)));
        opts.set(keys::RECV_TIMEOUT, &OptionValue::Int(-1)).unwrap();
        assert_eq!(opts.recv_timeout, None);
        assert!(opts.set(keys::RECV_TIMEOUT, &OptionValue::Int(-2)).is_err());
        assert!(opts.set(keys::LINGER, &OptionValue::Int(-1)).is_err());
    }

    #[test]
    fn test_wrong_type_is_invalid_value() {
        let mut opts = SocketOptions::default();
        assert!(matches!(
            opts.set(keys::BEST_EFFORT, &OptionValue::Int(1)),
            Err(ManifoldError::InvalidValue(_))
        ));
        assert!(!opts.best_effort);
    }

    #[test]
    fn test_unknown_and_read_only() {
        let mut opts = SocketOptions::default();
        assert!(matches!(
            opts.set("no-such-option", &OptionValue::Int(1)),
            Err(ManifoldError::InvalidOption(_))
        ));
        assert!(matches!(
            opts.set(keys::PROTOCOL, &OptionValue::Int(1)),
            Err(ManifoldError::ReadOnly(_))
        ));
        assert_eq!(opts, SocketOptions::default());
    }

    #[test]
    fn test_get_round_trips_set() {
        let mut opts = SocketOptions::default();
        opts.set(keys::SOCKET_NAME, &OptionValue::from("bench")).unwrap();
        assert_eq!(opts.get(keys::SOCKET_NAME), Some(OptionValue::from("bench")));
        assert_eq!(opts.get(keys::RECV_BUFFER), Some(OptionValue::Int(128)));
        assert_eq!(opts.get("unknown"), None);
    }
}

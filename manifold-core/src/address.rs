//! Transport addresses.
//!
//! Provides unified addressing for the built-in transports with parsing
//! support:
//! - `inproc://name`
//! - `tcp://host:port`, where a host of `*` or nothing means "any interface"
//! - `ipc:///path/to/socket` (Unix only)

use crate::error::ManifoldError;
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};
#[cfg(unix)]
use std::path::PathBuf;
use std::str::FromStr;

/// Parsed transport address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// In-process transport: `inproc://name`
    Inproc(String),
    /// TCP transport: `tcp://host:port`. `host` is `None` for the wildcard.
    Tcp { host: Option<String>, port: u16 },
    /// IPC transport (Unix domain socket): `ipc:///path/to/socket`
    #[cfg(unix)]
    Ipc(PathBuf),
}

impl Address {
    /// Parse an address from a URL.
    ///
    /// ```
    /// use manifold_core::address::Address;
    ///
    /// let addr = Address::parse("tcp://127.0.0.1:5555").unwrap();
    /// assert_eq!(addr.scheme(), "tcp");
    ///
    /// let any = Address::parse("tcp://*:5555").unwrap();
    /// assert!(matches!(any, Address::Tcp { host: None, port: 5555 }));
    ///
    /// let addr = Address::parse("inproc://latency_test").unwrap();
    /// assert!(matches!(addr, Address::Inproc(_)));
    /// ```
    pub fn parse(s: &str) -> Result<Self, AddressError> {
        s.parse()
    }

    #[must_use]
    pub fn scheme(&self) -> &'static str {
        match self {
            Self::Inproc(_) => "inproc",
            Self::Tcp { .. } => "tcp",
            #[cfg(unix)]
            Self::Ipc(_) => "ipc",
        }
    }

    /// Resolve a TCP address for connecting.
    ///
    /// The wildcard host resolves to the loopback address.
    pub fn resolve_connect(&self) -> Result<Vec<SocketAddr>, AddressError> {
        match self {
            Self::Tcp { host: None, port } => {
                Ok(vec![SocketAddr::from((Ipv4Addr::LOCALHOST, *port))])
            }
            Self::Tcp {
                host: Some(host),
                port,
            } => resolve(host, *port),
            _ => Err(AddressError::NotTcp(self.to_string())),
        }
    }

    /// Resolve a TCP address for listening.
    ///
    /// The wildcard host binds every IPv4 interface.
    pub fn resolve_listen(&self) -> Result<SocketAddr, AddressError> {
        match self {
            Self::Tcp { host: None, port } => {
                Ok(SocketAddr::from((Ipv4Addr::UNSPECIFIED, *port)))
            }
            Self::Tcp {
                host: Some(host),
                port,
            } => resolve(host, *port)?
                .into_iter()
                .next()
                .ok_or_else(|| AddressError::Unresolved(host.clone())),
            _ => Err(AddressError::NotTcp(self.to_string())),
        }
    }
}

fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>, AddressError> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| AddressError::Resolve(host.to_string(), e))?
        .collect();
    if addrs.is_empty() {
        return Err(AddressError::Unresolved(host.to_string()));
    }
    Ok(addrs)
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix("tcp://") {
            let (host, port) = rest
                .rsplit_once(':')
                .ok_or_else(|| AddressError::InvalidTcpAddress(rest.to_string()))?;
            let port = port
                .parse::<u16>()
                .map_err(|_| AddressError::InvalidTcpAddress(rest.to_string()))?;
            let host = host.trim_start_matches('[').trim_end_matches(']');
            let host = match host {
                "" | "*" => None,
                h => Some(h.to_string()),
            };
            Ok(Self::Tcp { host, port })
        } else if let Some(path) = s.strip_prefix("ipc://") {
            #[cfg(unix)]
            {
                if path.is_empty() {
                    return Err(AddressError::InvalidIpcPath(s.to_string()));
                }
                Ok(Self::Ipc(PathBuf::from(path)))
            }
            #[cfg(not(unix))]
            {
                let _ = path;
                Err(AddressError::IpcNotSupported)
            }
        } else if let Some(name) = s.strip_prefix("inproc://") {
            if name.is_empty() {
                Err(AddressError::InvalidInprocName(
                    "inproc name cannot be empty".to_string(),
                ))
            } else {
                Ok(Self::Inproc(name.to_string()))
            }
        } else {
            Err(AddressError::InvalidScheme(s.to_string()))
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inproc(name) => write!(f, "inproc://{name}"),
            Self::Tcp { host: None, port } => write!(f, "tcp://*:{port}"),
            Self::Tcp {
                host: Some(host),
                port,
            } if host.contains(':') => write!(f, "tcp://[{host}]:{port}"),
            Self::Tcp {
                host: Some(host),
                port,
            } => write!(f, "tcp://{host}:{port}"),
            #[cfg(unix)]
            Self::Ipc(path) => write!(f, "ipc://{}", path.display()),
        }
    }
}

/// Errors that can occur when parsing or resolving addresses.
#[derive(Debug, thiserror::Error)]
pub enum AddressError {
    #[error("Invalid scheme in address: {0} (expected tcp://, ipc://, or inproc://)")]
    InvalidScheme(String),

    #[error("Invalid TCP address: {0}")]
    InvalidTcpAddress(String),

    #[error("Invalid inproc name: {0}")]
    InvalidInprocName(String),

    #[error("Invalid IPC path: {0}")]
    InvalidIpcPath(String),

    #[error("IPC transport not supported on this platform")]
    IpcNotSupported,

    #[error("Not a TCP address: {0}")]
    NotTcp(String),

    #[error("Could not resolve {0}: {1}")]
    Resolve(String, #[source] io::Error),

    #[error("No addresses found for {0}")]
    Unresolved(String),
}

impl From<AddressError> for ManifoldError {
    fn from(e: AddressError) -> Self {
        match e {
            AddressError::Resolve(_, io) => Self::from(io),
            other => Self::InvalidAddress(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp_ipv4() {
        let addr = Address::parse("tcp://127.0.0.1:5555").unwrap();
        assert_eq!(
            addr,
            Address::Tcp {
                host: Some("127.0.0.1".into()),
                port: 5555
            }
        );
        assert_eq!(addr.to_string(), "tcp://127.0.0.1:5555");
        assert_eq!(
            addr.resolve_connect().unwrap()[0],
            "127.0.0.1:5555".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn test_parse_tcp_ipv6() {
        let addr = Address::parse("tcp://[::1]:5555").unwrap();
        assert_eq!(addr.to_string(), "tcp://[::1]:5555");
        assert!(addr.resolve_listen().unwrap().is_ipv6());
    }

    #[test]
    fn test_wildcard_hosts() {
        for url in ["tcp://*:7000", "tcp://:7000"] {
            let addr = Address::parse(url).unwrap();
            assert_eq!(
                addr.resolve_listen().unwrap(),
                "0.0.0.0:7000".parse::<SocketAddr>().unwrap()
            );
        }
    }

    #[test]
    fn test_invalid_tcp_address() {
        assert!(matches!(
            Address::parse("tcp://localhost"),
            Err(AddressError::InvalidTcpAddress(_))
        ));
        assert!(matches!(
            Address::parse("tcp://host:port"),
            Err(AddressError::InvalidTcpAddress(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_parse_ipc() {
        let addr = Address::parse("ipc:///tmp/test.sock").unwrap();
        assert!(matches!(addr, Address::Ipc(_)));
        assert_eq!(addr.to_string(), "ipc:///tmp/test.sock");
    }

    #[test]
    fn test_invalid_scheme() {
        let result = Address::parse("http://127.0.0.1:5555");
        assert!(matches!(result, Err(AddressError::InvalidScheme(_))));
        let err: ManifoldError = result.unwrap_err().into();
        assert!(matches!(err, ManifoldError::InvalidAddress(_)));
    }

    #[test]
    fn test_invalid_inproc_empty() {
        let result = Address::parse("inproc://");
        assert!(matches!(result, Err(AddressError::InvalidInprocName(_))));
    }
}

//! Transport contract and built-in transports.
//!
//! A transport turns an [`Address`] into connected byte pipes. The socket
//! core only sees the three traits below; everything about sockets, files
//! and framing stays inside the transport.

pub mod inproc;
#[cfg(unix)]
pub mod ipc;
pub(crate) mod reactor;
pub(crate) mod stream;
pub mod tcp;

use crate::address::Address;
use crate::aio::Aio;
use crate::error::Result;
use crate::options::SocketOptions;
use crate::protocol::ProtocolInfo;

/// One connected transport pipe.
///
/// `send` and `recv` are AIO submissions: they return `Err` only when the
/// AIO could not be started, and deliver every other outcome through the
/// AIO. After `close`, outstanding and future operations complete with
/// `Closed`.
pub trait TransportPipe: Send + Sync {
    fn send(&self, aio: &Aio) -> Result<()>;
    fn recv(&self, aio: &Aio) -> Result<()>;
    fn close(&self);
    /// Protocol id announced by the remote side.
    fn peer(&self) -> u16;
    fn remote_address(&self) -> String;
}

/// Outgoing connection factory. `connect` blocks until connected or failed.
pub trait TransportDialer: Send + Sync {
    fn connect(&self) -> Result<Box<dyn TransportPipe>>;
    fn close(&self);
}

/// Bound listener. `accept` blocks until a peer connects or `close` is
/// called from another thread, in which case it returns `Closed`.
pub trait TransportListener: Send + Sync {
    fn accept(&self) -> Result<Box<dyn TransportPipe>>;
    fn close(&self);
    fn local_address(&self) -> String;
}

/// Per-socket settings a transport needs.
#[derive(Debug, Clone, Copy)]
pub struct TransportParams {
    pub protocol: ProtocolInfo,
    pub recv_size_max: usize,
    pub tcp_nodelay: bool,
}

impl TransportParams {
    #[must_use]
    pub fn new(protocol: ProtocolInfo, options: &SocketOptions) -> Self {
        Self {
            protocol,
            recv_size_max: options.recv_size_max,
            tcp_nodelay: options.tcp_nodelay,
        }
    }
}

/// Build a dialer for `addr`.
///
/// # Errors
///
/// `InvalidAddress` if the address cannot be used for dialing.
pub fn dialer(addr: &Address, params: TransportParams) -> Result<Box<dyn TransportDialer>> {
    match addr {
        Address::Inproc(name) => Ok(Box::new(inproc::InprocDialer::new(name, params))),
        Address::Tcp { .. } => Ok(Box::new(tcp::TcpDialer::new(addr.clone(), params))),
        #[cfg(unix)]
        Address::Ipc(path) => Ok(Box::new(ipc::IpcDialer::new(path.clone(), params))),
    }
}

/// Bind a listener on `addr`. Binding happens here, so address-in-use and
/// permission errors are reported synchronously.
///
/// # Errors
///
/// Any bind error of the underlying transport.
pub fn listener(addr: &Address, params: TransportParams) -> Result<Box<dyn TransportListener>> {
    match addr {
        Address::Inproc(name) => Ok(Box::new(inproc::InprocListener::bind(name, params)?)),
        Address::Tcp { .. } => Ok(Box::new(tcp::TcpListener::bind(addr, params)?)),
        #[cfg(unix)]
        Address::Ipc(path) => Ok(Box::new(ipc::IpcListener::bind(path, params)?)),
    }
}

//! Sockets.
//!
//! A [`Socket`] owns a protocol instance, an upper write queue (messages the
//! application sent, not yet taken by the protocol) and an upper read queue
//! (messages the protocol delivered, not yet received), plus the endpoints
//! and pipes attached to it. Pipes and endpoints are kept in id-ordered maps
//! and refer back to their socket by [`SocketId`] through a global table.
//!
//! # Locking
//!
//! One mutex guards the socket's mutable state. It is never held while
//! calling into the protocol, a transport, or AIO completion. Attaching and
//! detaching pipes is serialized by a second lock so the protocol always
//! sees `add_pipe` before the matching `remove_pipe`.
//!
//! # Example
//!
//! ```rust,ignore
//! let socket = Socket::create(PAIR_ID)?;
//! socket.listen("inproc://example")?;
//! let msg = socket.recv()?;
//! socket.close();
//! ```

use crate::address::Address;
use crate::aio::{Aio, AioFuture};
use crate::endpoint::{Endpoint, EndpointId};
use crate::error::{ManifoldError, Result};
use crate::message::Message;
use crate::monitor::{MonitorHub, SocketEvent, SocketMonitor};
use crate::msgqueue::MsgQueue;
use crate::options::{keys, OptionValue, SocketOptions};
use crate::pipe::{Pipe, PipeId};
use crate::protocol::{self, Protocol, ProtocolCtx, ProtocolInfo};
use crate::transport::{self, TransportDialer, TransportListener, TransportParams};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

/// Every open socket, by id.
static SOCKETS: Lazy<DashMap<SocketId, Weak<SocketInner>>> = Lazy::new(DashMap::new);

/// Identifier of a socket, unique for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(u64);

impl SocketId {
    fn next() -> Self {
        Self(NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Find an open socket by id.
#[must_use]
pub fn lookup(id: SocketId) -> Option<Socket> {
    SOCKETS
        .get(&id)
        .and_then(|weak| weak.upgrade())
        .map(|inner| Socket { inner })
}

/// Number of sockets created and not yet closed.
#[must_use]
pub fn live_sockets() -> usize {
    SOCKETS.len()
}

struct SocketState {
    closing: bool,
    closed: bool,
    options: SocketOptions,
    send_err: Option<ManifoldError>,
    recv_err: Option<ManifoldError>,
    pipes: BTreeMap<PipeId, Pipe>,
    endpoints: BTreeMap<EndpointId, Endpoint>,
}

struct SocketInner {
    id: SocketId,
    info: ProtocolInfo,
    protocol: Box<dyn Protocol>,
    uwq: MsgQueue,
    urq: MsgQueue,
    best_effort: Arc<AtomicBool>,
    state: Mutex<SocketState>,
    cv: Condvar,
    pipe_ops: Mutex<()>,
    monitors: MonitorHub,
}

/// Handle to a socket. Clones refer to the same socket.
///
/// Dropping handles does not close the socket; call [`Socket::close`].
#[derive(Clone)]
pub struct Socket {
    inner: Arc<SocketInner>,
}

impl Socket {
    /// Create a socket speaking the protocol registered under `protocol_id`.
    ///
    /// # Errors
    ///
    /// `UnsupportedProtocol` if nothing is registered under that id.
    pub fn create(protocol_id: u16) -> Result<Self> {
        Self::create_with(protocol_id, SocketOptions::default())
    }

    /// Create a socket with initial options.
    ///
    /// # Errors
    ///
    /// `UnsupportedProtocol`, `InvalidValue` for out-of-range options, or an
    /// error from the protocol's constructor.
    pub fn create_with(protocol_id: u16, options: SocketOptions) -> Result<Self> {
        options.validate()?;
        let (info, factory) =
            protocol::lookup(protocol_id).ok_or(ManifoldError::UnsupportedProtocol(protocol_id))?;

        let id = SocketId::next();
        let uwq = MsgQueue::new(options.send_buffer);
        let urq = MsgQueue::new(options.recv_buffer);
        let best_effort = Arc::new(AtomicBool::new(options.best_effort));
        let protocol = factory(ProtocolCtx::new(
            id,
            uwq.clone(),
            urq.clone(),
            best_effort.clone(),
        ))?;

        let inner = Arc::new(SocketInner {
            id,
            info,
            protocol,
            uwq,
            urq,
            best_effort,
            state: Mutex::new(SocketState {
                closing: false,
                closed: false,
                options,
                send_err: None,
                recv_err: None,
                pipes: BTreeMap::new(),
                endpoints: BTreeMap::new(),
            }),
            cv: Condvar::new(),
            pipe_ops: Mutex::new(()),
            monitors: MonitorHub::default(),
        });
        SOCKETS.insert(id, Arc::downgrade(&inner));
        let socket = Self { inner };

        if let Err(e) = socket.inner.protocol.open() {
            SOCKETS.remove(&id);
            return Err(e);
        }
        debug!(socket = %id, protocol = %info, "[SOCKET] Created");
        Ok(socket)
    }

    #[must_use]
    pub fn id(&self) -> SocketId {
        self.inner.id
    }

    #[must_use]
    pub fn protocol(&self) -> ProtocolInfo {
        self.inner.info
    }

    /// Snapshot of the current options.
    #[must_use]
    pub fn options(&self) -> SocketOptions {
        self.inner.state.lock().options.clone()
    }

    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.inner.state.lock().closing
    }

    /// Open pipes, in attachment order.
    #[must_use]
    pub fn pipes(&self) -> Vec<PipeId> {
        self.inner.state.lock().pipes.keys().copied().collect()
    }

    /// Endpoints, in creation order.
    #[must_use]
    pub fn endpoints(&self) -> Vec<EndpointId> {
        self.inner.state.lock().endpoints.keys().copied().collect()
    }

    #[must_use]
    pub fn pipe(&self, id: PipeId) -> Option<Pipe> {
        self.inner.state.lock().pipes.get(&id).cloned()
    }

    #[must_use]
    pub fn endpoint(&self, id: EndpointId) -> Option<Endpoint> {
        self.inner.state.lock().endpoints.get(&id).cloned()
    }

    /// Subscribe to lifecycle events.
    #[must_use]
    pub fn monitor(&self) -> SocketMonitor {
        self.inner.monitors.subscribe()
    }

    pub(crate) fn emit(&self, event: SocketEvent) {
        self.inner.monitors.emit(event);
    }

    /// Make every future send fail with `err` (`None` to clear).
    /// Used by receive-only protocols.
    pub fn set_send_error(&self, err: Option<ManifoldError>) {
        self.inner.state.lock().send_err = err;
    }

    /// Make every future receive fail with `err` (`None` to clear).
    /// Used by send-only protocols.
    pub fn set_recv_error(&self, err: Option<ManifoldError>) {
        self.inner.state.lock().recv_err = err;
    }

    // --- close -------------------------------------------------------------

    /// Close the socket.
    ///
    /// Waits up to `linger` for queued outbound messages to drain, closes
    /// both upper queues (pending AIOs complete with `Closed`), closes every
    /// endpoint and pipe, shuts the protocol down, and unregisters the
    /// socket. Idempotent; a concurrent second call waits for the first.
    pub fn close(&self) {
        let linger = {
            let mut st = self.inner.state.lock();
            if st.closing {
                while !st.closed {
                    self.inner.cv.wait(&mut st);
                }
                return;
            }
            st.closing = true;
            st.options.linger
        };
        self.inner.cv.notify_all();
        debug!(socket = %self.inner.id, "[SOCKET] Closing");

        if !linger.is_zero() && !self.inner.uwq.wait_drained(linger) {
            debug!(socket = %self.inner.id, "[SOCKET] Linger expired with messages queued");
        }
        self.inner.uwq.close();
        self.inner.urq.close();

        let endpoints = std::mem::take(&mut self.inner.state.lock().endpoints);
        for ep in endpoints.into_values() {
            ep.close();
        }

        let pipes: Vec<Pipe> = self.inner.state.lock().pipes.values().cloned().collect();
        for pipe in pipes {
            pipe.close();
        }

        self.inner.protocol.close();
        SOCKETS.remove(&self.inner.id);

        {
            let mut st = self.inner.state.lock();
            st.closed = true;
            st.pipes.clear();
        }
        self.inner.cv.notify_all();
        self.inner.monitors.emit(SocketEvent::Closed);
        self.inner.monitors.shutdown();
        debug!(socket = %self.inner.id, "[SOCKET] Closed");
    }

    // --- pipes -------------------------------------------------------------

    /// Attach a connected pipe and hand it to the protocol.
    ///
    /// # Errors
    ///
    /// `Closing` if the socket is closing, or the protocol's rejection (for
    /// example `Busy`). On error the pipe is not attached and the caller is
    /// responsible for closing it.
    pub fn add_pipe(&self, pipe: &Pipe) -> Result<()> {
        let _ops = self.inner.pipe_ops.lock();
        {
            let mut st = self.inner.state.lock();
            if st.closing {
                return Err(ManifoldError::Closing);
            }
            st.pipes.insert(pipe.id(), pipe.clone());
        }
        if let Err(e) = self.inner.protocol.add_pipe(pipe) {
            self.inner.state.lock().pipes.remove(&pipe.id());
            debug!(socket = %self.inner.id, pipe = %pipe.id(), "[SOCKET] Protocol rejected pipe: {}", e);
            return Err(e);
        }
        if !pipe.mark_open() {
            // Closed while the protocol was adopting it.
            drop(_ops);
            self.remove_pipe(pipe);
            return Err(ManifoldError::Closed);
        }
        trace!(socket = %self.inner.id, pipe = %pipe.id(), peer = pipe.peer(), "[SOCKET] Pipe added");
        self.emit(SocketEvent::PipeAdded {
            pipe: pipe.id(),
            endpoint: pipe.endpoint_id(),
        });
        Ok(())
    }

    /// Detach a pipe. Idempotent: the protocol hears about each pipe once.
    /// The pipe is closed if it was still open.
    pub fn remove_pipe(&self, pipe: &Pipe) {
        let endpoint = {
            let _ops = self.inner.pipe_ops.lock();
            let (removed, endpoint) = {
                let mut st = self.inner.state.lock();
                let removed = st.pipes.remove(&pipe.id()).is_some();
                let endpoint = pipe
                    .endpoint_id()
                    .and_then(|id| st.endpoints.get(&id).cloned());
                (removed, endpoint)
            };
            if !removed {
                return;
            }
            self.inner.protocol.remove_pipe(pipe);
            endpoint
        };
        if let Some(ep) = endpoint {
            ep.forget_pipe(pipe.id());
        }
        trace!(socket = %self.inner.id, pipe = %pipe.id(), "[SOCKET] Pipe removed");
        self.emit(SocketEvent::PipeRemoved { pipe: pipe.id() });
        pipe.close();
    }

    // --- endpoints ---------------------------------------------------------

    fn transport_params(&self) -> Result<(TransportParams, SocketOptions)> {
        let st = self.inner.state.lock();
        if st.closing {
            return Err(ManifoldError::Closed);
        }
        Ok((TransportParams::new(self.inner.info, &st.options), st.options.clone()))
    }

    fn register_endpoint(&self, ep: &Endpoint) -> Result<()> {
        let mut st = self.inner.state.lock();
        if st.closing {
            return Err(ManifoldError::Closed);
        }
        st.endpoints.insert(ep.id(), ep.clone());
        Ok(())
    }

    /// Dial `url`. The first attempt runs on the calling thread and its
    /// error is returned; after that the dialer reconnects in the background.
    ///
    /// # Errors
    ///
    /// `InvalidAddress`, `Closed`, or the first connection attempt's error
    /// (for example `ConnectionRefused` or `ProtocolMismatch`).
    pub fn dial(&self, url: &str) -> Result<EndpointId> {
        let addr = Address::parse(url)?;
        let (params, _) = self.transport_params()?;
        self.dial_with(url, transport::dialer(&addr, params)?, true)
    }

    /// Dial `url` with every attempt, including the first, in the background.
    ///
    /// # Errors
    ///
    /// `InvalidAddress` or `Closed`.
    pub fn dial_nonblocking(&self, url: &str) -> Result<EndpointId> {
        let addr = Address::parse(url)?;
        let (params, _) = self.transport_params()?;
        self.dial_with(url, transport::dialer(&addr, params)?, false)
    }

    /// Dial through a caller-supplied transport dialer.
    ///
    /// # Errors
    ///
    /// `Closed`, or with `synchronous` the first attempt's error.
    pub fn dial_with(
        &self,
        url: &str,
        dialer: Box<dyn TransportDialer>,
        synchronous: bool,
    ) -> Result<EndpointId> {
        let (_, options) = self.transport_params()?;
        let ep = Endpoint::dialer(self.inner.id, url.to_string(), dialer, &options);
        self.register_endpoint(&ep)?;

        let first = if synchronous {
            match ep.connect_once() {
                Ok(pipe) => Some(pipe),
                Err(e) => {
                    self.inner.state.lock().endpoints.remove(&ep.id());
                    ep.close();
                    return Err(e);
                }
            }
        } else {
            None
        };
        if let Err(e) = ep.start(first) {
            self.inner.state.lock().endpoints.remove(&ep.id());
            ep.close();
            return Err(e);
        }
        debug!(socket = %self.inner.id, endpoint = %ep.id(), url, "[SOCKET] Dialing");
        Ok(ep.id())
    }

    /// Listen on `url`. Binding happens before this returns.
    ///
    /// # Errors
    ///
    /// `InvalidAddress`, `Closed`, or the bind error (e.g. `AddrInUse`).
    pub fn listen(&self, url: &str) -> Result<EndpointId> {
        let addr = Address::parse(url)?;
        let (params, _) = self.transport_params()?;
        self.listen_with(url, transport::listener(&addr, params)?)
    }

    /// Listen through a caller-supplied, already bound transport listener.
    ///
    /// # Errors
    ///
    /// `Closed` if the socket is closing.
    pub fn listen_with(&self, url: &str, listener: Box<dyn TransportListener>) -> Result<EndpointId> {
        let (_, options) = self.transport_params()?;
        let ep = Endpoint::listener(self.inner.id, url.to_string(), listener, &options);
        if let Err(e) = self.register_endpoint(&ep) {
            ep.close();
            return Err(e);
        }
        if let Err(e) = ep.start(None) {
            self.inner.state.lock().endpoints.remove(&ep.id());
            ep.close();
            return Err(e);
        }
        debug!(socket = %self.inner.id, endpoint = %ep.id(), url, "[SOCKET] Listening");
        self.emit(SocketEvent::Listening {
            endpoint: ep.id(),
            url: url.to_string(),
        });
        Ok(ep.id())
    }

    /// Close one endpoint and the pipes it created.
    ///
    /// # Errors
    ///
    /// `InvalidValue` if the socket has no endpoint with that id.
    pub fn close_endpoint(&self, id: EndpointId) -> Result<()> {
        let ep = self
            .inner
            .state
            .lock()
            .endpoints
            .remove(&id)
            .ok_or_else(|| ManifoldError::invalid_value("endpoint"))?;
        ep.close();
        Ok(())
    }

    /// Bound address of a listener, with the real port for `:0` binds.
    #[must_use]
    pub fn listener_address(&self, id: EndpointId) -> Option<String> {
        self.endpoint(id).and_then(|ep| ep.local_address())
    }

    // --- options -----------------------------------------------------------

    /// Set an option by name.
    ///
    /// # Errors
    ///
    /// `InvalidOption` for unknown keys, `InvalidValue` for a wrong type or
    /// range, `ReadOnly` for protocol identity keys, `Closed` once closing.
    /// A failed call changes nothing.
    pub fn set_option(&self, key: &str, value: impl Into<OptionValue>) -> Result<()> {
        let value = value.into();
        let applied = {
            let mut st = self.inner.state.lock();
            if st.closing {
                return Err(ManifoldError::Closed);
            }
            let mut next = st.options.clone();
            match next.set(key, &value) {
                Ok(()) => {
                    st.options = next;
                    Some(st.options.clone())
                }
                Err(ManifoldError::InvalidOption(_)) => None,
                Err(e) => return Err(e),
            }
        };
        let Some(options) = applied else {
            return self.inner.protocol.set_option(key, &value);
        };
        match key {
            keys::SEND_BUFFER => self.inner.uwq.resize(options.send_buffer),
            keys::RECV_BUFFER => self.inner.urq.resize(options.recv_buffer),
            keys::BEST_EFFORT => self.inner.best_effort.store(options.best_effort, Ordering::Relaxed),
            _ => {}
        }
        trace!(socket = %self.inner.id, key, %value, "[SOCKET] Option set");
        Ok(())
    }

    /// Read an option by name.
    ///
    /// # Errors
    ///
    /// `InvalidOption` if neither the core nor the protocol knows `key`.
    pub fn get_option(&self, key: &str) -> Result<OptionValue> {
        let info = self.inner.info;
        match key {
            keys::PROTOCOL => return Ok(OptionValue::Int(i64::from(info.id))),
            keys::PEER => return Ok(OptionValue::Int(i64::from(info.peer_id))),
            keys::PROTOCOL_NAME => return Ok(OptionValue::from(info.name)),
            keys::PEER_NAME => return Ok(OptionValue::from(info.peer_name)),
            keys::SOCKET_NAME => {
                let name = self.inner.state.lock().options.socket_name.clone();
                return Ok(OptionValue::Str(name.unwrap_or_else(|| self.inner.id.to_string())));
            }
            _ => {}
        }
        let core = self.inner.state.lock().options.get(key);
        match core {
            Some(value) => Ok(value),
            None => self.inner.protocol.get_option(key),
        }
    }

    // --- send / recv -------------------------------------------------------

    /// Submit a send of the message attached to `aio`.
    ///
    /// # Errors
    ///
    /// `InvalidState` if `aio` is busy; every other outcome, including
    /// `Closed`, is delivered through the AIO.
    pub fn send_aio(&self, aio: &Aio) -> Result<()> {
        let refused = {
            let st = self.inner.state.lock();
            if st.closing {
                Some(ManifoldError::Closed)
            } else {
                st.send_err.clone()
            }
        };
        if let Some(e) = refused {
            aio.begin()?;
            aio.finish_error(e);
            return Ok(());
        }
        self.inner.protocol.send(aio)
    }

    /// Submit a receive; on success the message is attached to `aio`.
    ///
    /// # Errors
    ///
    /// `InvalidState` if `aio` is busy; every other outcome is delivered
    /// through the AIO.
    pub fn recv_aio(&self, aio: &Aio) -> Result<()> {
        let refused = {
            let st = self.inner.state.lock();
            if st.closing {
                Some(ManifoldError::Closed)
            } else {
                st.recv_err.clone()
            }
        };
        if let Some(e) = refused {
            aio.begin()?;
            aio.finish_error(e);
            return Ok(());
        }
        self.inner.protocol.recv(aio)
    }

    /// Send `msg`, blocking up to the `send-timeout` option.
    ///
    /// # Errors
    ///
    /// `Timeout`, `Closed`, or a protocol error such as `NotSupported`.
    pub fn send(&self, msg: Message) -> Result<()> {
        let timeout = self.inner.state.lock().options.send_timeout;
        let (result, _unsent) = Aio::run_blocking(timeout, Some(msg), |aio| self.send_aio(aio));
        result
    }

    /// Receive a message, blocking up to the `recv-timeout` option.
    ///
    /// # Errors
    ///
    /// `Timeout`, `Closed`, or a protocol error such as `NotSupported`.
    pub fn recv(&self) -> Result<Message> {
        let timeout = self.inner.state.lock().options.recv_timeout;
        let (result, msg) = Aio::run_blocking(timeout, None, |aio| self.recv_aio(aio));
        result?;
        msg.ok_or_else(|| ManifoldError::protocol("receive completed without a message"))
    }

    fn submit_async(&self, msg: Option<Message>, timeout: Option<std::time::Duration>, send: bool) -> AioFuture {
        let aio = Aio::new();
        aio.set_timeout(timeout);
        if let Some(msg) = msg {
            aio.set_msg(msg);
        }
        let submitted = if send {
            self.send_aio(&aio)
        } else {
            self.recv_aio(&aio)
        };
        match submitted {
            Ok(()) => aio.completion(),
            Err(e) => AioFuture::failed(aio, e),
        }
    }

    /// Send `msg` asynchronously, honoring the `send-timeout` option.
    /// Dropping the future cancels the send.
    ///
    /// # Errors
    ///
    /// As [`send`](Self::send).
    pub async fn send_async(&self, msg: Message) -> Result<()> {
        let timeout = self.inner.state.lock().options.send_timeout;
        self.submit_async(Some(msg), timeout, true)
            .await
            .map(|_| ())
            .map_err(ManifoldError::into_blocking)
    }

    /// Receive asynchronously, honoring the `recv-timeout` option.
    /// Dropping the future cancels the receive.
    ///
    /// # Errors
    ///
    /// As [`recv`](Self::recv).
    pub async fn recv_async(&self) -> Result<Message> {
        let timeout = self.inner.state.lock().options.recv_timeout;
        self.submit_async(None, timeout, false)
            .await
            .map_err(ManifoldError::into_blocking)?
            .ok_or_else(|| ManifoldError::protocol("receive completed without a message"))
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.inner.id)
            .field("protocol", &self.inner.info)
            .finish()
    }
}

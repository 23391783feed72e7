//! Endpoints: dialers and listeners that create pipes for a socket.
//!
//! Each endpoint runs one worker thread.
//!
//! - A **dialer** connects, hands the pipe to its socket, waits for that pipe
//!   to close, and dials again. Failed attempts back off exponentially
//!   ([`ReconnectState`]); a successful connection resets the backoff.
//! - A **listener** accepts connections and hands each one to its socket.
//!   Transient accept errors back off the same way.
//!
//! Closing an endpoint stops its worker, unblocks a pending accept, and
//! closes every pipe the endpoint created.

use crate::error::{ManifoldError, Result};
use crate::monitor::SocketEvent;
use crate::options::SocketOptions;
use crate::pipe::{Pipe, PipeId};
use crate::reconnect::ReconnectState;
use crate::socket::{self, SocketId};
use crate::transport::{TransportDialer, TransportListener, TransportPipe};
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, trace, warn};

static NEXT_ENDPOINT_ID: AtomicU64 = AtomicU64::new(1);

/// Identifier of an endpoint, unique for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId(u64);

impl EndpointId {
    fn next() -> Self {
        Self(NEXT_ENDPOINT_ID.fetch_add(1, Ordering::Relaxed))
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

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointMode {
    Dialer,
    Listener,
}

impl EndpointMode {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Dialer => "dialer",
            Self::Listener => "listener",
        }
    }
}

enum Transport {
    Dialer(Box<dyn TransportDialer>),
    Listener(Box<dyn TransportListener>),
}

struct EndpointInner {
    id: EndpointId,
    socket: SocketId,
    url: String,
    transport: Transport,
    closed: Mutex<bool>,
    wake: Condvar,
    pipes: Mutex<BTreeMap<PipeId, Pipe>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    backoff: Mutex<ReconnectState>,
}

/// Handle to a dialer or listener. Clones refer to the same endpoint.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<EndpointInner>,
}

impl Endpoint {
    pub(crate) fn dialer(
        socket: SocketId,
        url: String,
        dialer: Box<dyn TransportDialer>,
        options: &SocketOptions,
    ) -> Self {
        Self::build(socket, url, Transport::Dialer(dialer), options)
    }

    pub(crate) fn listener(
        socket: SocketId,
        url: String,
        listener: Box<dyn TransportListener>,
        options: &SocketOptions,
    ) -> Self {
        Self::build(socket, url, Transport::Listener(listener), options)
    }

    fn build(socket: SocketId, url: String, transport: Transport, options: &SocketOptions) -> Self {
        Self {
            inner: Arc::new(EndpointInner {
                id: EndpointId::next(),
                socket,
                url,
                transport,
                closed: Mutex::new(false),
                wake: Condvar::new(),
                pipes: Mutex::new(BTreeMap::new()),
                worker: Mutex::new(None),
                backoff: Mutex::new(ReconnectState::new(options)),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> EndpointId {
        self.inner.id
    }

    #[must_use]
    pub fn mode(&self) -> EndpointMode {
        match self.inner.transport {
            Transport::Dialer(_) => EndpointMode::Dialer,
            Transport::Listener(_) => EndpointMode::Listener,
        }
    }

    /// URL the endpoint was created with.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Bound address of a listener (with the actual port for `:0`).
    #[must_use]
    pub fn local_address(&self) -> Option<String> {
        match &self.inner.transport {
            Transport::Listener(l) => Some(l.local_address()),
            Transport::Dialer(_) => None,
        }
    }

    /// Pipes this endpoint created that are still open.
    #[must_use]
    pub fn pipes(&self) -> Vec<PipeId> {
        self.inner.pipes.lock().keys().copied().collect()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.inner.closed.lock()
    }

    /// One synchronous connection attempt on the caller's thread.
    pub(crate) fn connect_once(&self) -> Result<Pipe> {
        self.inner.connect_once()
    }

    /// Start the worker thread. A dialer passes the pipe of its synchronous
    /// first attempt, if any.
    pub(crate) fn start(&self, first: Option<Pipe>) -> Result<()> {
        let inner = self.inner.clone();
        let name = format!("manifold-{}-{}", self.mode().as_str(), self.inner.id);
        let handle = thread::Builder::new().name(name).spawn(move || match inner.transport {
            Transport::Dialer(_) => inner.run_dialer(first),
            Transport::Listener(_) => inner.run_listener(),
        })?;
        *self.inner.worker.lock() = Some(handle);
        Ok(())
    }

    pub(crate) fn forget_pipe(&self, pipe: PipeId) {
        self.inner.pipes.lock().remove(&pipe);
    }

    /// Stop the worker and close every pipe this endpoint created.
    /// Idempotent. Waits for the worker unless called from it.
    pub fn close(&self) {
        {
            let mut closed = self.inner.closed.lock();
            if *closed {
                return;
            }
            *closed = true;
        }
        self.inner.wake.notify_all();
        match &self.inner.transport {
            Transport::Dialer(d) => d.close(),
            Transport::Listener(l) => l.close(),
        }
        let pipes = std::mem::take(&mut *self.inner.pipes.lock());
        for pipe in pipes.into_values() {
            pipe.close();
        }
        let worker = self.inner.worker.lock().take();
        if let Some(handle) = worker {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                warn!(endpoint = %self.inner.id, "[ENDPOINT] Worker panicked");
            }
        }
        debug!(endpoint = %self.inner.id, url = %self.inner.url, "[ENDPOINT] Closed");
    }
}

impl EndpointInner {
    fn is_closed(&self) -> bool {
        *self.closed.lock()
    }

    /// Sleep for `delay` unless closed first. Returns `false` once closed.
    fn pause(&self, delay: Duration) -> bool {
        let mut closed = self.closed.lock();
        self.wake.wait_while_for(&mut closed, |closed| !*closed, delay);
        !*closed
    }

    fn next_delay(&self) -> Duration {
        self.backoff.lock().next_delay()
    }

    fn emit(&self, event: SocketEvent) {
        if let Some(sock) = socket::lookup(self.socket) {
            sock.emit(event);
        }
    }

    fn connect_once(&self) -> Result<Pipe> {
        let Transport::Dialer(dialer) = &self.transport else {
            return Err(ManifoldError::NotSupported);
        };
        let transport = dialer.connect()?;
        let pipe = self.attach(transport)?;
        self.emit(SocketEvent::Dialed {
            endpoint: self.id,
            url: self.url.clone(),
        });
        Ok(pipe)
    }

    /// Wrap a transport pipe and hand it to the socket.
    fn attach(&self, transport: Box<dyn TransportPipe>) -> Result<Pipe> {
        let pipe = Pipe::new(self.socket, Some(self.id), transport);
        let Some(sock) = socket::lookup(self.socket) else {
            pipe.close();
            return Err(ManifoldError::Closed);
        };
        {
            let closed = self.closed.lock();
            if *closed {
                drop(closed);
                pipe.close();
                return Err(ManifoldError::Closed);
            }
            self.pipes.lock().insert(pipe.id(), pipe.clone());
        }
        if let Err(e) = sock.add_pipe(&pipe) {
            self.pipes.lock().remove(&pipe.id());
            pipe.close();
            return Err(e);
        }
        self.backoff.lock().reset();
        Ok(pipe)
    }

    fn run_dialer(&self, first: Option<Pipe>) {
        trace!(endpoint = %self.id, url = %self.url, "[ENDPOINT] Dialer running");
        let mut current = first;
        loop {
            if let Some(pipe) = current.take() {
                pipe.wait_closed();
                if !self.pause(self.next_delay()) {
                    break;
                }
            }
            if self.is_closed() {
                break;
            }
            match self.connect_once() {
                Ok(pipe) => current = Some(pipe),
                Err(e) => {
                    if self.is_closed() {
                        break;
                    }
                    debug!(endpoint = %self.id, url = %self.url, "[ENDPOINT] Dial failed: {}", e);
                    self.emit(SocketEvent::ConnectFailed {
                        endpoint: self.id,
                        url: self.url.clone(),
                        reason: e.to_string(),
                    });
                    if !self.pause(self.next_delay()) {
                        break;
                    }
                }
            }
        }
        trace!(endpoint = %self.id, "[ENDPOINT] Dialer stopped");
    }

    fn run_listener(&self) {
        let Transport::Listener(listener) = &self.transport else {
            return;
        };
        trace!(endpoint = %self.id, url = %self.url, "[ENDPOINT] Listener running");
        loop {
            match listener.accept() {
                Ok(transport) => match self.attach(transport) {
                    Ok(pipe) => {
                        trace!(endpoint = %self.id, pipe = %pipe.id(), "[ENDPOINT] Accepted");
                        self.emit(SocketEvent::Accepted {
                            endpoint: self.id,
                            url: self.url.clone(),
                        });
                    }
                    Err(e) => {
                        debug!(endpoint = %self.id, "[ENDPOINT] Pipe rejected: {}", e);
                    }
                },
                Err(ManifoldError::Closed) => break,
                Err(e) => {
                    if self.is_closed() {
                        break;
                    }
                    warn!(endpoint = %self.id, url = %self.url, "[ENDPOINT] Accept failed: {}", e);
                    if !self.pause(self.next_delay()) {
                        break;
                    }
                }
            }
            if self.is_closed() {
                break;
            }
        }
        trace!(endpoint = %self.id, "[ENDPOINT] Listener stopped");
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.inner.id)
            .field("mode", &self.mode())
            .field("url", &self.inner.url)
            .field("socket", &self.inner.socket)
            .finish()
    }
}

//! In-process transport.
//!
//! Connections between sockets of the same process, without any I/O: a
//! connection is two cross-wired [`MsgQueue`]s, and messages move between
//! sockets by value.
//!
//! Listeners register their name in a global registry protected by
//! `DashMap`. Dialing an unbound name fails with `ConnectionRefused`, and a
//! peer whose protocol does not match is refused before any pipe exists.

use super::{TransportDialer, TransportListener, TransportParams, TransportPipe};
use crate::aio::Aio;
use crate::error::{ManifoldError, Result};
use crate::msgqueue::MsgQueue;
use dashmap::DashMap;
use flume::{Receiver, Sender};
use once_cell::sync::Lazy;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, trace};

/// Messages in flight per direction of one connection.
const INPROC_DEPTH: usize = 16;

enum AcceptItem {
    Conn(InprocPipe),
    Shutdown,
}

struct Binding {
    id: u64,
    protocol: u16,
    tx: Sender<AcceptItem>,
}

/// Global registry of bound inproc names.
static INPROC_REGISTRY: Lazy<DashMap<String, Binding>> = Lazy::new(DashMap::new);

static NEXT_BINDING: AtomicU64 = AtomicU64::new(1);

/// Number of currently bound inproc names.
#[must_use]
pub fn bound_count() -> usize {
    INPROC_REGISTRY.len()
}

/// Check if `name` is currently bound.
#[must_use]
pub fn is_bound(name: &str) -> bool {
    INPROC_REGISTRY.contains_key(name)
}

/// One end of an inproc connection.
pub struct InprocPipe {
    tx: MsgQueue,
    rx: MsgQueue,
    peer: u16,
    name: String,
}

impl TransportPipe for InprocPipe {
    fn send(&self, aio: &Aio) -> Result<()> {
        self.tx.push_aio(aio)
    }

    fn recv(&self, aio: &Aio) -> Result<()> {
        self.rx.pop_aio(aio)
    }

    fn close(&self) {
        self.tx.close();
        self.rx.close();
    }

    fn peer(&self) -> u16 {
        self.peer
    }

    fn remote_address(&self) -> String {
        format!("inproc://{}", self.name)
    }
}

impl Drop for InprocPipe {
    fn drop(&mut self) {
        self.close();
    }
}

/// Connect to the listener bound under `name`.
fn connect(name: &str, params: TransportParams) -> Result<InprocPipe> {
    let local = params.protocol;
    let (peer, accept_tx) = {
        let binding = INPROC_REGISTRY.get(name).ok_or_else(|| {
            ManifoldError::from(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("inproc endpoint '{name}' is not bound"),
            ))
        })?;
        (binding.protocol, binding.tx.clone())
    };
    if !local.is_compatible(peer) {
        return Err(ManifoldError::ProtocolMismatch {
            local: local.id,
            peer,
        });
    }

    let to_listener = MsgQueue::new(INPROC_DEPTH);
    let to_dialer = MsgQueue::new(INPROC_DEPTH);
    let server_end = InprocPipe {
        tx: to_dialer.clone(),
        rx: to_listener.clone(),
        peer: local.id,
        name: name.to_string(),
    };
    let client_end = InprocPipe {
        tx: to_listener,
        rx: to_dialer,
        peer,
        name: name.to_string(),
    };

    if let Err(flume::SendError(item)) = accept_tx.send(AcceptItem::Conn(server_end)) {
        if let AcceptItem::Conn(pipe) = item {
            pipe.close();
        }
        return Err(io::Error::from(io::ErrorKind::ConnectionRefused).into());
    }
    trace!(name, "[INPROC] Connected");
    Ok(client_end)
}

/// Dialer for `inproc://name`.
pub struct InprocDialer {
    name: String,
    params: TransportParams,
}

impl InprocDialer {
    #[must_use]
    pub fn new(name: &str, params: TransportParams) -> Self {
        Self {
            name: name.to_string(),
            params,
        }
    }
}

impl TransportDialer for InprocDialer {
    fn connect(&self) -> Result<Box<dyn TransportPipe>> {
        Ok(Box::new(connect(&self.name, self.params)?))
    }

    fn close(&self) {}
}

/// Listener bound to `inproc://name`.
pub struct InprocListener {
    id: u64,
    name: String,
    tx: Sender<AcceptItem>,
    rx: Receiver<AcceptItem>,
    closed: AtomicBool,
}

impl InprocListener {
    /// Register `name` in the global registry.
    ///
    /// # Errors
    ///
    /// `AddrInUse` if the name is already bound.
    pub fn bind(name: &str, params: TransportParams) -> Result<Self> {
        let (tx, rx) = flume::unbounded();
        let id = NEXT_BINDING.fetch_add(1, Ordering::Relaxed);
        match INPROC_REGISTRY.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("inproc endpoint '{name}' is already bound"),
                )
                .into());
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Binding {
                    id,
                    protocol: params.protocol.id,
                    tx: tx.clone(),
                });
            }
        }
        debug!(name, "[INPROC] Bound");
        Ok(Self {
            id,
            name: name.to_string(),
            tx,
            rx,
            closed: AtomicBool::new(false),
        })
    }
}

impl TransportListener for InprocListener {
    fn accept(&self) -> Result<Box<dyn TransportPipe>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ManifoldError::Closed);
        }
        match self.rx.recv() {
            Ok(AcceptItem::Conn(pipe)) => {
                if self.closed.load(Ordering::Acquire) {
                    pipe.close();
                    return Err(ManifoldError::Closed);
                }
                Ok(Box::new(pipe))
            }
            Ok(AcceptItem::Shutdown) | Err(_) => Err(ManifoldError::Closed),
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        INPROC_REGISTRY.remove_if(&self.name, |_, binding| binding.id == self.id);
        // Refuse connections that raced with the close, then wake accept.
        for item in self.rx.drain() {
            if let AcceptItem::Conn(pipe) = item {
                pipe.close();
            }
        }
        let _ = self.tx.send(AcceptItem::Shutdown);
        debug!(name = %self.name, "[INPROC] Unbound");
    }

    fn local_address(&self) -> String {
        format!("inproc://{}", self.name)
    }
}

impl Drop for InprocListener {
    fn drop(&mut self) {
        self.close();
    }
}

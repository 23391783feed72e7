//! Protocol contract and registry.
//!
//! A socket's messaging pattern is supplied by a [`Protocol`] trait object,
//! built once at socket creation by the [`ProtocolFactory`] registered under
//! the requested protocol id. The core owns the socket, its pipes and its
//! upper queues; the protocol decides how messages move between the upper
//! queues and the pipes.
//!
//! Protocols never hold a pointer to their socket. They receive the socket's
//! id in [`ProtocolCtx`] and look it up when they need it.

use crate::aio::Aio;
use crate::error::{ManifoldError, Result};
use crate::msgqueue::MsgQueue;
use crate::options::OptionValue;
use crate::pipe::Pipe;
use crate::socket::{self, Socket, SocketId};
use hashbrown::HashMap;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Identity of a protocol and of the peer protocol it talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtocolInfo {
    pub id: u16,
    pub name: &'static str,
    pub peer_id: u16,
    pub peer_name: &'static str,
}

impl ProtocolInfo {
    /// Check if a remote protocol id may be connected to this one.
    #[must_use]
    pub const fn is_compatible(&self, peer: u16) -> bool {
        self.peer_id == peer
    }
}

impl fmt::Display for ProtocolInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:#x})", self.name, self.id)
    }
}

/// What a protocol gets to work with.
#[derive(Clone)]
pub struct ProtocolCtx {
    socket: SocketId,
    /// Upper write queue: messages the application sent.
    pub uwq: MsgQueue,
    /// Upper read queue: messages waiting for the application.
    pub urq: MsgQueue,
    best_effort: Arc<AtomicBool>,
}

impl ProtocolCtx {
    pub(crate) fn new(
        socket: SocketId,
        uwq: MsgQueue,
        urq: MsgQueue,
        best_effort: Arc<AtomicBool>,
    ) -> Self {
        Self {
            socket,
            uwq,
            urq,
            best_effort,
        }
    }

    #[must_use]
    pub fn socket_id(&self) -> SocketId {
        self.socket
    }

    /// The owning socket, if it is still open.
    #[must_use]
    pub fn socket(&self) -> Option<Socket> {
        socket::lookup(self.socket)
    }

    /// Current value of the `best-effort` option.
    #[must_use]
    pub fn best_effort(&self) -> bool {
        self.best_effort.load(Ordering::Relaxed)
    }

    /// Queue the message attached to `aio` on the upper write queue.
    ///
    /// In best-effort mode a full queue drops the message and the send
    /// still succeeds.
    ///
    /// # Errors
    ///
    /// Only submission errors from [`Aio::begin`].
    pub fn send_upper(&self, aio: &Aio) -> Result<()> {
        if !self.best_effort() {
            return self.uwq.push_aio(aio);
        }
        aio.begin()?;
        let Some(msg) = aio.take_msg() else {
            aio.finish_error(ManifoldError::invalid_value("message"));
            return Ok(());
        };
        match self.uwq.push_nowait(msg) {
            Ok(()) => {}
            Err(e) if matches!(e.error, ManifoldError::WouldBlock) => {
                debug!(socket = %self.socket, "[PROTO] Send queue full, message dropped");
            }
            Err(e) => {
                aio.set_msg(e.msg);
                aio.finish_error(e.error);
                return Ok(());
            }
        }
        aio.finish(Ok(()));
        Ok(())
    }
}

/// Operations table of a messaging protocol.
///
/// `send` and `recv` follow the submission rules of every AIO provider: they
/// return `Err` only when the AIO could not be started; all other outcomes
/// are delivered through the AIO.
pub trait Protocol: Send + Sync {
    fn info(&self) -> ProtocolInfo;

    /// Called once after the socket is fully constructed.
    fn open(&self) -> Result<()> {
        Ok(())
    }

    /// Called once while the socket closes, after every pipe was removed.
    fn close(&self);

    /// A new pipe joined the socket. Returning an error rejects it.
    fn add_pipe(&self, pipe: &Pipe) -> Result<()>;

    /// A pipe left the socket. Called exactly once per accepted pipe.
    fn remove_pipe(&self, pipe: &Pipe);

    fn send(&self, aio: &Aio) -> Result<()>;

    fn recv(&self, aio: &Aio) -> Result<()>;

    /// Protocol-specific option. Keys the socket core does not know end up
    /// here.
    fn set_option(&self, key: &str, _value: &OptionValue) -> Result<()> {
        Err(ManifoldError::invalid_option(key))
    }

    fn get_option(&self, key: &str) -> Result<OptionValue> {
        Err(ManifoldError::invalid_option(key))
    }
}

/// Builds a protocol instance for a new socket.
pub type ProtocolFactory = fn(ProtocolCtx) -> Result<Box<dyn Protocol>>;

#[derive(Clone, Copy)]
struct Registration {
    info: ProtocolInfo,
    factory: ProtocolFactory,
}

static REGISTRY: Lazy<RwLock<HashMap<u16, Registration>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Register `factory` under `info.id`, replacing any previous registration.
pub fn register_protocol(info: ProtocolInfo, factory: ProtocolFactory) {
    debug!(id = info.id, name = info.name, "[PROTO] Registered");
    REGISTRY
        .write()
        .insert(info.id, Registration { info, factory });
}

/// Find the protocol registered under `id`.
#[must_use]
pub fn lookup(id: u16) -> Option<(ProtocolInfo, ProtocolFactory)> {
    REGISTRY.read().get(&id).map(|r| (r.info, r.factory))
}

/// All registered protocols, sorted by id.
#[must_use]
pub fn registered() -> Vec<ProtocolInfo> {
    let mut all: Vec<ProtocolInfo> = REGISTRY.read().values().map(|r| r.info).collect();
    all.sort_by_key(|info| info.id);
    all
}

//! Pipes: one live connection between a socket and a peer.
//!
//! A pipe wraps a [`TransportPipe`] and knows its socket and endpoint by id
//! only. Closing a pipe closes the transport (outstanding AIOs complete with
//! `Closed`), detaches it from its socket, and releases anyone waiting in
//! [`Pipe::wait_closed`], such as the dialer that created it.
//!
//! ```text
//! Connecting ──add_pipe ok──▶ Open ──close()──▶ Closing ──▶ Closed
//!      │                                           ▲
//!      └──────────────────close()──────────────────┘
//! ```

use crate::aio::Aio;
use crate::endpoint::EndpointId;
use crate::error::{ManifoldError, Result};
use crate::socket::{self, SocketId};
use crate::transport::TransportPipe;
use crate::waitblock::Waitblock;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

static NEXT_PIPE_ID: AtomicU64 = AtomicU64::new(1);

/// Identifier of a pipe, unique for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipeId(u64);

impl PipeId {
    fn next() -> Self {
        Self(NEXT_PIPE_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PipeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeState {
    Connecting,
    Open,
    Closing,
    Closed,
}

struct PipeInner {
    id: PipeId,
    socket: SocketId,
    endpoint: Option<EndpointId>,
    transport: Box<dyn TransportPipe>,
    state: Mutex<PipeState>,
    closed: Waitblock,
}

/// Handle to a pipe. Clones refer to the same pipe.
#[derive(Clone)]
pub struct Pipe {
    inner: Arc<PipeInner>,
}

impl Pipe {
    /// Wrap a connected transport pipe for `socket`.
    #[must_use]
    pub fn new(
        socket: SocketId,
        endpoint: Option<EndpointId>,
        transport: Box<dyn TransportPipe>,
    ) -> Self {
        Self {
            inner: Arc::new(PipeInner {
                id: PipeId::next(),
                socket,
                endpoint,
                transport,
                state: Mutex::new(PipeState::Connecting),
                closed: Waitblock::new(),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> PipeId {
        self.inner.id
    }

    #[must_use]
    pub fn socket_id(&self) -> SocketId {
        self.inner.socket
    }

    #[must_use]
    pub fn endpoint_id(&self) -> Option<EndpointId> {
        self.inner.endpoint
    }

    /// Protocol id of the remote side.
    #[must_use]
    pub fn peer(&self) -> u16 {
        self.inner.transport.peer()
    }

    #[must_use]
    pub fn remote_address(&self) -> String {
        self.inner.transport.remote_address()
    }

    #[must_use]
    pub fn state(&self) -> PipeState {
        *self.inner.state.lock()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self.state(), PipeState::Closing | PipeState::Closed)
    }

    /// Connecting → Open. Returns `false` if the pipe is already closing.
    pub(crate) fn mark_open(&self) -> bool {
        let mut state = self.inner.state.lock();
        if *state == PipeState::Connecting {
            *state = PipeState::Open;
            true
        } else {
            false
        }
    }

    /// Send the message attached to `aio` to the peer.
    ///
    /// # Errors
    ///
    /// Only submission errors; a closed pipe completes the AIO with `Closed`.
    pub fn send(&self, aio: &Aio) -> Result<()> {
        if self.is_closed() {
            aio.begin()?;
            aio.finish_error(ManifoldError::Closed);
            return Ok(());
        }
        self.inner.transport.send(aio)
    }

    /// Receive the next message from the peer into `aio`.
    ///
    /// # Errors
    ///
    /// Only submission errors; a closed pipe completes the AIO with `Closed`.
    pub fn recv(&self, aio: &Aio) -> Result<()> {
        if self.is_closed() {
            aio.begin()?;
            aio.finish_error(ManifoldError::Closed);
            return Ok(());
        }
        self.inner.transport.recv(aio)
    }

    /// Close the pipe. Idempotent, non-blocking, safe from callbacks.
    pub fn close(&self) {
        {
            let mut state = self.inner.state.lock();
            if matches!(*state, PipeState::Closing | PipeState::Closed) {
                return;
            }
            *state = PipeState::Closing;
        }
        debug!(pipe = %self.id(), socket = %self.inner.socket, "[PIPE] Closing");
        self.inner.transport.close();
        if let Some(sock) = socket::lookup(self.inner.socket) {
            sock.remove_pipe(self);
        }
        *self.inner.state.lock() = PipeState::Closed;
        self.inner.closed.done();
    }

    /// Block until the pipe is closed.
    pub fn wait_closed(&self) {
        self.inner.closed.wait();
    }

    /// Block until the pipe is closed or `timeout` passes; `true` if closed.
    pub fn wait_closed_timeout(&self, timeout: Duration) -> bool {
        self.inner.closed.wait_timeout(timeout)
    }
}

impl PartialEq for Pipe {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Pipe {}

impl fmt::Debug for Pipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipe")
            .field("id", &self.inner.id)
            .field("socket", &self.inner.socket)
            .field("endpoint", &self.inner.endpoint)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::msgqueue::MsgQueue;

    /// Loopback transport: whatever is sent can be received.
    struct Loop {
        q: MsgQueue,
    }

    impl TransportPipe for Loop {
        fn send(&self, aio: &Aio) -> Result<()> {
            self.q.push_aio(aio)
        }
        fn recv(&self, aio: &Aio) -> Result<()> {
            self.q.pop_aio(aio)
        }
        fn close(&self) {
            self.q.close();
        }
        fn peer(&self) -> u16 {
            0
        }
        fn remote_address(&self) -> String {
            "loop".into()
        }
    }

    fn loop_pipe() -> Pipe {
        Pipe::new(
            SocketId::from_raw(u64::MAX - 1),
            None,
            Box::new(Loop { q: MsgQueue::new(4) }),
        )
    }

    #[test]
    fn test_state_transitions() {
        let pipe = loop_pipe();
        assert_eq!(pipe.state(), PipeState::Connecting);
        assert!(pipe.mark_open());
        assert!(!pipe.mark_open());
        pipe.close();
        assert_eq!(pipe.state(), PipeState::Closed);
        assert!(!pipe.mark_open());
        assert!(pipe.wait_closed_timeout(Duration::ZERO));
    }

    #[test]
    fn test_close_completes_pending_recv() {
        let pipe = loop_pipe();
        let rx = Aio::new();
        pipe.recv(&rx).unwrap();
        pipe.close();
        pipe.close();
        rx.wait();
        assert!(matches!(rx.result(), Err(ManifoldError::Closed)));
    }

    #[test]
    fn test_send_after_close() {
        let pipe = loop_pipe();
        pipe.close();
        let tx = Aio::new();
        tx.set_msg(Message::from("late"));
        pipe.send(&tx).unwrap();
        tx.wait();
        assert!(matches!(tx.result(), Err(ManifoldError::Closed)));
        assert!(tx.has_msg());
    }

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(loop_pipe().id(), loop_pipe().id());
    }
}

//! TCP transport.
//!
//! Connections are driven by the reactor's I/O threads. Each accepted
//! connection runs its handshake in its own task, so a silent peer never
//! holds up the next one. `TCP_NODELAY` and keepalive are applied through
//! `socket2`.
//!
//! # Safety
//!
//! Tuning a compio stream needs a borrowed `socket2::Socket` over its raw
//! descriptor. The borrow is never dropped as an owner, so the descriptor
//! stays with the stream.

#![allow(unsafe_code)]

use super::reactor::{self, or_closed, CloseSignal};
use super::stream::StreamPipe;
use super::{TransportDialer, TransportListener, TransportParams, TransportPipe};
use crate::address::Address;
use crate::error::{ManifoldError, Result};
use flume::{Receiver, Sender};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, trace, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Pause after a failed accept (e.g. out of descriptors).
const ACCEPT_RETRY: Duration = Duration::from_millis(10);

/// Apply per-connection socket options.
///
/// # Errors
///
/// Returns an error if a socket option cannot be set.
pub fn configure_stream(stream: &compio::net::TcpStream, nodelay: bool) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::mem::ManuallyDrop;
        use std::os::unix::io::{AsRawFd, FromRawFd};
        let sock = ManuallyDrop::new(unsafe { socket2::Socket::from_raw_fd(stream.as_raw_fd()) });
        sock.set_nodelay(nodelay)?;
        sock.set_keepalive(true)?;
    }

    #[cfg(windows)]
    {
        use std::mem::ManuallyDrop;
        use std::os::windows::io::{AsRawSocket, FromRawSocket};
        let sock =
            ManuallyDrop::new(unsafe { socket2::Socket::from_raw_socket(stream.as_raw_socket()) });
        sock.set_nodelay(nodelay)?;
        sock.set_keepalive(true)?;
    }

    #[cfg(not(any(unix, windows)))]
    let _ = (stream, nodelay);

    Ok(())
}

/// Try each resolved target in turn.
async fn connect_any(
    targets: Vec<SocketAddr>,
    params: TransportParams,
    abort: &CloseSignal,
) -> Result<Box<dyn TransportPipe>> {
    let mut last_err = None;
    for target in targets {
        let connecting = compio::net::TcpStream::connect(target);
        let connected = compio::time::timeout(CONNECT_TIMEOUT, connecting)
            .await
            .unwrap_or_else(|_| Err(io::ErrorKind::TimedOut.into()));
        match connected {
            Ok(stream) => {
                configure_stream(&stream, params.tcp_nodelay)?;
                trace!(%target, "[TCP] Connected");
                let pipe =
                    StreamPipe::establish(stream, params, format!("tcp://{target}"), abort).await?;
                return Ok(Box::new(pipe));
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.map_or(ManifoldError::Closed, ManifoldError::from))
}

/// Dialer for `tcp://host:port`.
pub struct TcpDialer {
    addr: Address,
    params: TransportParams,
    closed: CloseSignal,
}

impl TcpDialer {
    #[must_use]
    pub fn new(addr: Address, params: TransportParams) -> Self {
        Self {
            addr,
            params,
            closed: CloseSignal::new(),
        }
    }
}

impl TransportDialer for TcpDialer {
    fn connect(&self) -> Result<Box<dyn TransportPipe>> {
        if self.closed.is_fired() {
            return Err(ManifoldError::Closed);
        }
        let targets = self.addr.resolve_connect()?;
        if targets.is_empty() {
            return Err(ManifoldError::InvalidAddress(self.addr.to_string()));
        }
        let (params, abort) = (self.params, self.closed.clone());
        reactor::block_on(move || async move {
            or_closed(&abort, connect_any(targets, params, &abort)).await
        })
    }

    /// Abort a connect or handshake in progress; later connects fail with
    /// `Closed`.
    fn close(&self) {
        if self.closed.fire() {
            debug!(addr = %self.addr, "[TCP] Dialer closed");
        }
    }
}

/// Bound TCP listener.
pub struct TcpListener {
    local: SocketAddr,
    accepted: Receiver<Box<dyn TransportPipe>>,
    closed: CloseSignal,
}

impl TcpListener {
    /// Bind and start accepting on an I/O thread.
    ///
    /// # Errors
    ///
    /// Resolution or bind errors, e.g. `AddrInUse`.
    pub fn bind(addr: &Address, params: TransportParams) -> Result<Self> {
        let target = addr.resolve_listen()?;
        let closed = CloseSignal::new();
        let (ready, accepted) = flume::unbounded();
        let signal = closed.clone();
        let local = reactor::block_on(move || async move {
            let listener = compio::net::TcpListener::bind(target).await?;
            let local = listener.local_addr()?;
            reactor::spawn_local(accept_loop(listener, params, signal, ready));
            Ok::<_, ManifoldError>(local)
        })?;
        debug!(%local, "[TCP] Listening");
        Ok(Self {
            local,
            accepted,
            closed,
        })
    }
}

/// Accept until closed. Handshakes run in their own tasks and finished
/// pipes are queued for [`TcpListener::accept`].
async fn accept_loop(
    listener: compio::net::TcpListener,
    params: TransportParams,
    closed: CloseSignal,
    ready: Sender<Box<dyn TransportPipe>>,
) {
    loop {
        let accepted =
            or_closed(&closed, async { Ok::<_, ManifoldError>(listener.accept().await) }).await;
        let (stream, peer) = match accepted {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                warn!("[TCP] Accept failed: {}", e);
                let pause = async {
                    compio::time::sleep(ACCEPT_RETRY).await;
                    Ok::<(), ManifoldError>(())
                };
                if or_closed(&closed, pause).await.is_err() {
                    break;
                }
                continue;
            }
            Err(_) => break,
        };
        if let Err(e) = configure_stream(&stream, params.tcp_nodelay) {
            debug!(%peer, "[TCP] Failed to tune connection: {}", e);
        }
        let (closed, ready) = (closed.clone(), ready.clone());
        reactor::spawn_local(async move {
            match StreamPipe::establish(stream, params, format!("tcp://{peer}"), &closed).await {
                Ok(pipe) => {
                    if let Err(flume::SendError(pipe)) = ready.send(Box::new(pipe)) {
                        pipe.close();
                    }
                }
                // A failed handshake only loses that one connection.
                Err(e) => debug!(%peer, "[TCP] Handshake failed: {}", e),
            }
        });
    }
    trace!("[TCP] Accept loop stopped");
}

impl TransportListener for TcpListener {
    fn accept(&self) -> Result<Box<dyn TransportPipe>> {
        if self.closed.is_fired() {
            return Err(ManifoldError::Closed);
        }
        // Disconnects once the accept loop and every handshake are gone.
        let pipe = self.accepted.recv().map_err(|_| ManifoldError::Closed)?;
        if self.closed.is_fired() {
            pipe.close();
            return Err(ManifoldError::Closed);
        }
        Ok(pipe)
    }

    /// Stop accepting and abort handshakes in progress.
    fn close(&self) {
        if !self.closed.fire() {
            return;
        }
        for pipe in self.accepted.drain() {
            pipe.close();
        }
        debug!(local = %self.local, "[TCP] Listener closed");
    }

    fn local_address(&self) -> String {
        format!("tcp://{}", self.local)
    }
}

impl Drop for TcpListener {
    fn drop(&mut self) {
        self.close();
    }
}

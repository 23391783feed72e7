//! IPC transport over Unix domain sockets (`ipc:///path`).
//!
//! Same stream pipe, framing and I/O threads as TCP. A listener removes a
//! stale socket file left behind by a dead process before binding, and
//! unlinks its own file on close.

use super::reactor::{self, or_closed, CloseSignal};
use super::stream::StreamPipe;
use super::{TransportDialer, TransportListener, TransportParams, TransportPipe};
use crate::error::{ManifoldError, Result};
use compio::net::{UnixListener, UnixStream};
use flume::{Receiver, Sender};
use std::fs;
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, trace, warn};

const ACCEPT_RETRY: Duration = Duration::from_millis(10);

fn url(path: &Path) -> String {
    format!("ipc://{}", path.display())
}

/// Dialer for `ipc:///path`.
pub struct IpcDialer {
    path: PathBuf,
    params: TransportParams,
    closed: CloseSignal,
}

impl IpcDialer {
    #[must_use]
    pub fn new(path: PathBuf, params: TransportParams) -> Self {
        Self {
            path,
            params,
            closed: CloseSignal::new(),
        }
    }
}

impl TransportDialer for IpcDialer {
    fn connect(&self) -> Result<Box<dyn TransportPipe>> {
        if self.closed.is_fired() {
            return Err(ManifoldError::Closed);
        }
        let (path, params, abort) = (self.path.clone(), self.params, self.closed.clone());
        reactor::block_on(move || async move {
            or_closed(&abort, async {
                let stream = UnixStream::connect(&path).await?;
                trace!(path = %path.display(), "[IPC] Connected");
                let pipe = StreamPipe::establish(stream, params, url(&path), &abort).await?;
                Ok::<_, ManifoldError>(Box::new(pipe) as Box<dyn TransportPipe>)
            })
            .await
        })
    }

    fn close(&self) {
        if self.closed.fire() {
            debug!(path = %self.path.display(), "[IPC] Dialer closed");
        }
    }
}

/// Remove `path` if it is a socket nobody listens on.
async fn remove_stale(path: &Path) {
    let Ok(meta) = fs::symlink_metadata(path) else {
        return;
    };
    if !meta.file_type().is_socket() {
        return;
    }
    match UnixStream::connect(path).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
            debug!(path = %path.display(), "[IPC] Removing stale socket");
            if let Err(e) = fs::remove_file(path) {
                debug!(path = %path.display(), "[IPC] Failed to remove stale socket: {}", e);
            }
        }
        Err(e) => debug!(path = %path.display(), "[IPC] Stale socket probe failed: {}", e),
    }
}

/// Bound IPC listener.
pub struct IpcListener {
    path: PathBuf,
    accepted: Receiver<Box<dyn TransportPipe>>,
    closed: CloseSignal,
}

impl IpcListener {
    /// Bind the socket file at `path` and start accepting on an I/O thread.
    ///
    /// # Errors
    ///
    /// `AddrInUse` if a live listener owns the path, or any bind error.
    pub fn bind(path: &Path, params: TransportParams) -> Result<Self> {
        let closed = CloseSignal::new();
        let (ready, accepted) = flume::unbounded();
        let (owned, signal) = (path.to_path_buf(), closed.clone());
        reactor::block_on(move || async move {
            remove_stale(&owned).await;
            let listener = UnixListener::bind(&owned).await?;
            reactor::spawn_local(accept_loop(listener, owned, params, signal, ready));
            Ok::<_, ManifoldError>(())
        })?;
        debug!(path = %path.display(), "[IPC] Listening");
        Ok(Self {
            path: path.to_path_buf(),
            accepted,
            closed,
        })
    }
}

async fn accept_loop(
    listener: UnixListener,
    path: PathBuf,
    params: TransportParams,
    closed: CloseSignal,
    ready: Sender<Box<dyn TransportPipe>>,
) {
    loop {
        let accepted =
            or_closed(&closed, async { Ok::<_, ManifoldError>(listener.accept().await) }).await;
        let stream = match accepted {
            Ok(Ok((stream, _))) => stream,
            Ok(Err(e)) => {
                warn!(path = %path.display(), "[IPC] Accept failed: {}", e);
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
        let (closed, ready, path) = (closed.clone(), ready.clone(), path.clone());
        reactor::spawn_local(async move {
            match StreamPipe::establish(stream, params, url(&path), &closed).await {
                Ok(pipe) => {
                    if let Err(flume::SendError(pipe)) = ready.send(Box::new(pipe)) {
                        pipe.close();
                    }
                }
                Err(e) => debug!(path = %path.display(), "[IPC] Handshake failed: {}", e),
            }
        });
    }
    trace!(path = %path.display(), "[IPC] Accept loop stopped");
}

impl TransportListener for IpcListener {
    fn accept(&self) -> Result<Box<dyn TransportPipe>> {
        if self.closed.is_fired() {
            return Err(ManifoldError::Closed);
        }
        let pipe = self.accepted.recv().map_err(|_| ManifoldError::Closed)?;
        if self.closed.is_fired() {
            pipe.close();
            return Err(ManifoldError::Closed);
        }
        Ok(pipe)
    }

    fn close(&self) {
        if !self.closed.fire() {
            return;
        }
        for pipe in self.accepted.drain() {
            pipe.close();
        }
        if let Err(e) = fs::remove_file(&self.path) {
            debug!(path = %self.path.display(), "[IPC] Failed to remove socket file: {}", e);
        }
        debug!(path = %self.path.display(), "[IPC] Listener closed");
    }

    fn local_address(&self) -> String {
        url(&self.path)
    }
}

impl Drop for IpcListener {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aio::Aio;
    use crate::message::Message;
    use crate::protocol::ProtocolInfo;
    use std::sync::Arc;
    use std::time::Instant;

    const P: ProtocolInfo = ProtocolInfo {
        id: 0x7b10,
        name: "p",
        peer_id: 0x7b10,
        peer_name: "p",
    };

    fn params() -> TransportParams {
        TransportParams {
            protocol: P,
            recv_size_max: 0,
            tcp_nodelay: true,
        }
    }

    fn temp_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("manifold-{tag}-{}.sock", std::process::id()))
    }

    #[test]
    fn test_ipc_exchange_and_cleanup() {
        let path = temp_path("exchange");
        let listener = Arc::new(IpcListener::bind(&path, params()).unwrap());
        let l = listener.clone();
        let server = std::thread::spawn(move || l.accept().map_err(|e| e.to_string()));
        let client = IpcDialer::new(path.clone(), params()).connect().unwrap();
        let server = server.join().unwrap().unwrap();

        let tx = Aio::new();
        tx.set_msg(Message::from("over ipc"));
        server.send(&tx).unwrap();
        tx.wait();

        let rx = Aio::new();
        client.recv(&rx).unwrap();
        rx.wait();
        assert_eq!(rx.take_msg().unwrap().body(), b"over ipc");

        listener.close();
        assert!(!path.exists());
    }

    #[test]
    fn test_stale_socket_is_replaced() {
        let path = temp_path("stale");
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());
        let listener = IpcListener::bind(&path, params()).unwrap();
        listener.close();
    }

    #[test]
    fn test_close_with_silent_peer_is_prompt() {
        let path = temp_path("silent");
        let listener = Arc::new(IpcListener::bind(&path, params()).unwrap());
        let silent = std::os::unix::net::UnixStream::connect(&path).unwrap();

        let l = listener.clone();
        let waiter = std::thread::spawn(move || l.accept().err());
        std::thread::sleep(Duration::from_millis(50));
        let start = Instant::now();
        listener.close();
        assert!(matches!(waiter.join().unwrap(), Some(ManifoldError::Closed)));
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(!path.exists());
        drop(silent);
    }
}

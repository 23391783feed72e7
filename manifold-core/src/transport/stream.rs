//! Byte-stream pipes shared by the tcp and ipc transports.
//!
//! # Wire format
//!
//! On connect both sides send an 8-byte hello and read the peer's:
//!
//! ```text
//! +------+-----+-----+------+-------------+------+------+
//! | 0x00 | 'S' | 'P' | 0x00 | proto (u16) | 0x00 | 0x00 |
//! +------+-----+-----+------+-------------+------+------+
//! ```
//!
//! A peer with a bad hello or an incompatible protocol is refused. After the
//! hello, every message is a big-endian u64 length followed by that many
//! bytes (header, then body).
//!
//! Each pipe runs one reader and one writer task on an I/O thread. They talk
//! to the AIO world through two small [`MsgQueue`]s, so `send`/`recv` on the
//! pipe are plain queue submissions.

use super::reactor::{self, or_closed, CloseSignal};
use super::{TransportParams, TransportPipe};
use crate::aio::Aio;
use crate::error::{ManifoldError, Result};
use crate::message::Message;
use crate::msgqueue::MsgQueue;
use compio::buf::BufResult;
use compio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use compio::runtime::TryClone;
use std::time::Duration;
use tracing::{debug, trace};

const HELLO_LEN: usize = 8;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Messages buffered per direction between the AIO side and the I/O tasks.
const STREAM_DEPTH: usize = 16;

/// A connected compio stream usable by [`StreamPipe`].
pub(crate) trait Stream: AsyncRead + AsyncWrite + TryClone + 'static {}

impl<S: AsyncRead + AsyncWrite + TryClone + 'static> Stream for S {}

fn hello(protocol: u16) -> [u8; HELLO_LEN] {
    let [hi, lo] = protocol.to_be_bytes();
    [0, b'S', b'P', 0, hi, lo, 0, 0]
}

/// Validate the peer's hello and return its protocol id.
fn check_hello(peer: [u8; HELLO_LEN], params: &TransportParams) -> Result<u16> {
    if peer[..4] != [0, b'S', b'P', 0] || peer[6..] != [0, 0] {
        return Err(ManifoldError::protocol("bad connection header"));
    }
    let peer_id = u16::from_be_bytes([peer[4], peer[5]]);
    if !params.protocol.is_compatible(peer_id) {
        return Err(ManifoldError::ProtocolMismatch {
            local: params.protocol.id,
            peer: peer_id,
        });
    }
    Ok(peer_id)
}

/// Exchange hellos and return the peer's protocol id.
async fn handshake<S: Stream>(stream: &mut S, params: &TransportParams) -> Result<u16> {
    let BufResult(res, _) = stream.write_all(hello(params.protocol.id)).await;
    res?;
    let BufResult(res, peer) = stream.read_exact([0u8; HELLO_LEN]).await;
    res?;
    check_hello(peer, params)
}

/// Encode one length-prefixed frame.
fn encode_frame(msg: Message) -> Vec<u8> {
    let len = msg.wire_len() as u64;
    let (header, body) = msg.into_parts();
    let mut frame = Vec::with_capacity(8 + header.len() + body.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&header);
    frame.extend_from_slice(&body);
    frame
}

/// Decode a frame length prefix, enforcing `max` when it is non-zero.
fn frame_len(prefix: [u8; 8], max: usize) -> Result<usize> {
    let size = usize::try_from(u64::from_be_bytes(prefix)).map_err(|_| {
        ManifoldError::MessageTooLarge {
            size: usize::MAX,
            max,
        }
    })?;
    if max > 0 && size > max {
        return Err(ManifoldError::MessageTooLarge { size, max });
    }
    Ok(size)
}

/// Read one length-prefixed frame into a message body.
async fn read_frame<S: AsyncRead>(stream: &mut S, max: usize) -> Result<Message> {
    let BufResult(res, prefix) = stream.read_exact([0u8; 8]).await;
    res?;
    let size = frame_len(prefix, max)?;
    if size == 0 {
        return Ok(Message::new());
    }
    let BufResult(res, body) = stream.read_exact(vec![0u8; size]).await;
    res?;
    Ok(Message::from(body))
}

/// Socket to peer: pop from the AIO side, write frames.
async fn pump_out<S: AsyncWrite>(mut stream: S, tx: MsgQueue) -> Result<()> {
    let aio = Aio::new();
    loop {
        tx.pop_aio(&aio)?;
        let Some(msg) = aio.clone().completion().await? else {
            return Err(ManifoldError::protocol("empty send"));
        };
        let BufResult(res, _) = stream.write_all(encode_frame(msg)).await;
        res?;
    }
}

/// Peer to socket: read frames, push to the AIO side.
async fn pump_in<S: AsyncRead>(mut stream: S, rx: MsgQueue, max: usize) -> Result<()> {
    let aio = Aio::new();
    loop {
        let msg = read_frame(&mut stream, max).await?;
        aio.set_msg(msg);
        rx.push_aio(&aio)?;
        aio.clone().completion().await?;
    }
}

/// Pipe over a connected byte stream.
///
/// The stream itself lives in the I/O tasks; the pipe keeps the queues and
/// the signal that stops them.
pub(crate) struct StreamPipe {
    tx: MsgQueue,
    rx: MsgQueue,
    shutdown: CloseSignal,
    peer: u16,
    remote: String,
}

impl StreamPipe {
    /// Run the handshake on `stream` and start the I/O tasks.
    ///
    /// Must run on an I/O thread. The handshake gives up after a fixed
    /// timeout, or as soon as `abort` fires.
    pub(crate) async fn establish<S: Stream>(
        mut stream: S,
        params: TransportParams,
        remote: String,
        abort: &CloseSignal,
    ) -> Result<Self> {
        let peer = or_closed(abort, async {
            compio::time::timeout(HANDSHAKE_TIMEOUT, handshake(&mut stream, &params))
                .await
                .unwrap_or(Err(ManifoldError::Timeout))
        })
        .await?;

        let reader = stream.try_clone()?;
        let pipe = Self {
            tx: MsgQueue::new(STREAM_DEPTH),
            rx: MsgQueue::new(STREAM_DEPTH),
            shutdown: CloseSignal::new(),
            peer,
            remote,
        };

        let max = params.recv_size_max;
        reactor::spawn_local(pipe.task("reader", pump_in(reader, pipe.rx.clone(), max)));
        reactor::spawn_local(pipe.task("writer", pump_out(stream, pipe.tx.clone())));

        trace!(remote = %pipe.remote, peer, "[STREAM] Established");
        Ok(pipe)
    }

    /// Wrap one direction: stop when the pipe closes, and close the pipe
    /// when the direction fails.
    fn task(
        &self,
        direction: &'static str,
        work: impl std::future::Future<Output = Result<()>> + 'static,
    ) -> impl std::future::Future<Output = ()> + 'static {
        let (tx, rx, shutdown) = (self.tx.clone(), self.rx.clone(), self.shutdown.clone());
        let remote = self.remote.clone();
        async move {
            if let Err(e) = or_closed(&shutdown, work).await {
                debug!(remote = %remote, "[STREAM] {} stopped: {}", direction, e);
            }
            shutdown.fire();
            tx.close();
            rx.close();
        }
    }
}

impl TransportPipe for StreamPipe {
    fn send(&self, aio: &Aio) -> Result<()> {
        self.tx.push_aio(aio)
    }

    fn recv(&self, aio: &Aio) -> Result<()> {
        self.rx.pop_aio(aio)
    }

    fn close(&self) {
        if self.shutdown.fire() {
            trace!(remote = %self.remote, "[STREAM] Closing");
        }
        self.tx.close();
        self.rx.close();
    }

    fn peer(&self) -> u16 {
        self.peer
    }

    fn remote_address(&self) -> String {
        self.remote.clone()
    }
}

impl Drop for StreamPipe {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ProtocolInfo;

    const PAIRISH: ProtocolInfo = ProtocolInfo {
        id: 0x7d10,
        name: "x",
        peer_id: 0x7d10,
        peer_name: "x",
    };

    fn params(protocol: ProtocolInfo) -> TransportParams {
        TransportParams {
            protocol,
            recv_size_max: 0,
            tcp_nodelay: true,
        }
    }

    #[test]
    fn test_hello_layout() {
        assert_eq!(hello(0x10), [0, b'S', b'P', 0, 0x00, 0x10, 0, 0]);
        assert_eq!(hello(0x0151), [0, b'S', b'P', 0, 0x01, 0x51, 0, 0]);
    }

    #[test]
    fn test_frame_layout() {
        let mut msg = Message::from("body");
        msg.header_append_u32(1);
        let wire = encode_frame(msg);
        assert_eq!(&wire[..8], &8u64.to_be_bytes());
        assert_eq!(&wire[8..12], &[0, 0, 0, 1]);
        assert_eq!(&wire[12..], b"body");
        assert_eq!(frame_len(8u64.to_be_bytes(), 0).unwrap(), 8);
    }

    #[test]
    fn test_recv_size_max() {
        let wire = encode_frame(Message::zeroed(100));
        let prefix: [u8; 8] = wire[..8].try_into().unwrap();
        assert!(matches!(
            frame_len(prefix, 64),
            Err(ManifoldError::MessageTooLarge { size: 100, max: 64 })
        ));
        assert_eq!(frame_len(prefix, 100).unwrap(), 100);
    }

    #[test]
    fn test_hello_checks() {
        assert_eq!(check_hello(hello(0x7d10), &params(PAIRISH)).unwrap(), 0x7d10);
        assert!(matches!(
            check_hello(hello(0x7d20), &params(PAIRISH)),
            Err(ManifoldError::ProtocolMismatch { local: 0x7d10, peer: 0x7d20 })
        ));
        let mut bad = hello(0x7d10);
        bad[1] = b'X';
        assert!(matches!(
            check_hello(bad, &params(PAIRISH)),
            Err(ManifoldError::Protocol(_))
        ));
    }

    #[test]
    fn test_truncated_frame_is_io_error() {
        use std::io::Write;
        let server = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap();
        let feeder = std::thread::spawn(move || {
            let (mut peer, _) = server.accept().unwrap();
            let wire = encode_frame(Message::zeroed(10));
            peer.write_all(&wire[..12]).unwrap();
        });
        let err = reactor::block_on(move || async move {
            let mut stream = compio::net::TcpStream::connect(addr).await?;
            read_frame(&mut stream, 0).await
        })
        .unwrap_err();
        feeder.join().unwrap();
        assert!(matches!(err, ManifoldError::Io(_)));
    }
}

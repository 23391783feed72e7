//! PAIR protocol (version 0).
//!
//! PAIR sockets connect exactly two peers and carry messages both ways.
//!
//! # Characteristics
//!
//! - **Exclusive**: one pipe at a time; further pipes are refused with
//!   `Busy` until the current one goes away
//! - **Bidirectional**: sends and receives
//! - **Buffered**: messages sent with no peer attached wait in the send
//!   queue up to `send-buffer`

use crate::link::{Direction, Link};
use manifold_core::aio::Aio;
use manifold_core::error::{ManifoldError, Result};
use manifold_core::pipe::Pipe;
use manifold_core::protocol::{Protocol, ProtocolCtx, ProtocolInfo};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

pub const PAIR_V0: u16 = 0x10;

pub const INFO: ProtocolInfo = ProtocolInfo {
    id: PAIR_V0,
    name: "pair",
    peer_id: PAIR_V0,
    peer_name: "pair",
};

pub(crate) struct Pair {
    ctx: ProtocolCtx,
    peer: Mutex<Option<Arc<Link>>>,
}

pub(crate) fn factory(ctx: ProtocolCtx) -> Result<Box<dyn Protocol>> {
    Ok(Box::new(Pair {
        ctx,
        peer: Mutex::new(None),
    }))
}

impl Protocol for Pair {
    fn info(&self) -> ProtocolInfo {
        INFO
    }

    fn close(&self) {
        if let Some(link) = self.peer.lock().take() {
            link.close();
        }
    }

    fn add_pipe(&self, pipe: &Pipe) -> Result<()> {
        let mut peer = self.peer.lock();
        if peer.is_some() {
            debug!(socket = %self.ctx.socket_id(), pipe = %pipe.id(), "[PAIR] Already paired, refusing pipe");
            return Err(ManifoldError::Busy);
        }
        let link = Link::new(pipe.clone(), self.ctx.clone(), Direction::Both);
        link.start()?;
        *peer = Some(link);
        Ok(())
    }

    fn remove_pipe(&self, pipe: &Pipe) {
        let mut peer = self.peer.lock();
        if peer.as_ref().is_some_and(|link| link.pipe() == pipe) {
            if let Some(link) = peer.take() {
                link.close();
            }
        }
    }

    fn send(&self, aio: &Aio) -> Result<()> {
        self.ctx.send_upper(aio)
    }

    fn recv(&self, aio: &Aio) -> Result<()> {
        self.ctx.urq.pop_aio(aio)
    }
}

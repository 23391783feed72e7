//! Per-pipe message pumps shared by the built-in protocols.
//!
//! A [`Link`] moves messages between a socket's upper queues and one pipe
//! with up to two AIO chains:
//!
//! ```text
//! outbound:  uwq.pop ──▶ pipe.send ──▶ uwq.pop ...
//! inbound:   pipe.recv ──▶ urq.push ──▶ pipe.recv ...
//! ```
//!
//! Any failure in either chain closes the pipe, which removes it from the
//! socket; the protocol then closes the link. AIO callbacks hold only a
//! `Weak` reference to the link.

use manifold_core::aio::Aio;
use manifold_core::error::Result;
use manifold_core::pipe::Pipe;
use manifold_core::protocol::ProtocolCtx;
use std::sync::{Arc, Weak};
use tracing::trace;

/// Which chains a link runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    /// Send from `uwq` and deliver inbound messages to `urq`.
    Both,
    /// Send from `uwq`; inbound messages are read and discarded so a peer
    /// hang-up is still noticed.
    SendOnly,
    /// Deliver inbound messages to `urq`.
    RecvOnly,
}

impl Direction {
    const fn sends(self) -> bool {
        matches!(self, Self::Both | Self::SendOnly)
    }

    const fn delivers(self) -> bool {
        matches!(self, Self::Both | Self::RecvOnly)
    }
}

pub(crate) struct Link {
    pipe: Pipe,
    ctx: ProtocolCtx,
    direction: Direction,
    getq: Aio,
    tx: Aio,
    rx: Aio,
    putq: Aio,
}

fn callback(weak: &Weak<Link>, step: fn(&Link, &Aio)) -> impl Fn(&Aio) + Send + Sync + 'static {
    let weak = weak.clone();
    move |aio| {
        if let Some(link) = weak.upgrade() {
            step(&link, aio);
        }
    }
}

impl Link {
    pub(crate) fn new(pipe: Pipe, ctx: ProtocolCtx, direction: Direction) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            pipe,
            ctx,
            direction,
            getq: Aio::with_callback(callback(weak, Self::on_getq)),
            tx: Aio::with_callback(callback(weak, Self::on_send)),
            rx: Aio::with_callback(callback(weak, Self::on_recv)),
            putq: Aio::with_callback(callback(weak, Self::on_putq)),
        })
    }

    pub(crate) fn pipe(&self) -> &Pipe {
        &self.pipe
    }

    /// Start the chains. On error the link is closed and the caller
    /// rejects the pipe.
    pub(crate) fn start(&self) -> Result<()> {
        trace!(pipe = %self.pipe.id(), direction = ?self.direction, "[LINK] Started");
        let started = if self.direction.sends() {
            self.ctx.uwq.pop_aio(&self.getq)
        } else {
            Ok(())
        };
        if let Err(e) = started.and_then(|()| self.pipe.recv(&self.rx)) {
            self.close();
            return Err(e);
        }
        Ok(())
    }

    /// Abort both chains. Does not wait for callbacks.
    pub(crate) fn close(&self) {
        self.getq.close();
        self.tx.close();
        self.rx.close();
        self.putq.close();
    }

    fn on_getq(&self, aio: &Aio) {
        if aio.result().is_err() {
            self.pipe.close();
            return;
        }
        let Some(msg) = aio.take_msg() else {
            self.pipe.close();
            return;
        };
        self.tx.set_msg(msg);
        if self.pipe.send(&self.tx).is_err() {
            self.pipe.close();
        }
    }

    fn on_send(&self, aio: &Aio) {
        if let Err(e) = aio.result() {
            trace!(pipe = %self.pipe.id(), "[LINK] Send failed: {}", e);
            aio.take_msg();
            self.pipe.close();
            return;
        }
        if self.ctx.uwq.pop_aio(&self.getq).is_err() {
            self.pipe.close();
        }
    }

    fn on_recv(&self, aio: &Aio) {
        if let Err(e) = aio.result() {
            trace!(pipe = %self.pipe.id(), "[LINK] Receive failed: {}", e);
            self.pipe.close();
            return;
        }
        let Some(mut msg) = aio.take_msg() else {
            self.pipe.close();
            return;
        };
        if !self.direction.delivers() {
            if self.pipe.recv(&self.rx).is_err() {
                self.pipe.close();
            }
            return;
        }
        msg.set_pipe(self.pipe.id());
        self.putq.set_msg(msg);
        if self.ctx.urq.push_aio(&self.putq).is_err() {
            self.pipe.close();
        }
    }

    fn on_putq(&self, aio: &Aio) {
        if aio.result().is_err() {
            aio.take_msg();
            self.pipe.close();
            return;
        }
        if self.pipe.recv(&self.rx).is_err() {
            self.pipe.close();
        }
    }
}

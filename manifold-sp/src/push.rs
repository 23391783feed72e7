//! PUSH protocol (pipeline, version 0).
//!
//! PUSH sockets send only. Every attached PULL peer pulls from the same send
//! queue, so messages are spread across peers as each one becomes ready.
//! Receiving fails with `NotSupported`.

use crate::link::{Direction, Link};
use manifold_core::aio::Aio;
use manifold_core::error::{ManifoldError, Result};
use manifold_core::pipe::{Pipe, PipeId};
use manifold_core::protocol::{Protocol, ProtocolCtx, ProtocolInfo};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

pub const PUSH_V0: u16 = 0x50;

pub const INFO: ProtocolInfo = ProtocolInfo {
    id: PUSH_V0,
    name: "push",
    peer_id: crate::pull::PULL_V0,
    peer_name: "pull",
};

pub(crate) struct Push {
    ctx: ProtocolCtx,
    links: Mutex<BTreeMap<PipeId, Arc<Link>>>,
}

pub(crate) fn factory(ctx: ProtocolCtx) -> Result<Box<dyn Protocol>> {
    Ok(Box::new(Push {
        ctx,
        links: Mutex::new(BTreeMap::new()),
    }))
}

impl Protocol for Push {
    fn info(&self) -> ProtocolInfo {
        INFO
    }

    fn open(&self) -> Result<()> {
        if let Some(sock) = self.ctx.socket() {
            sock.set_recv_error(Some(ManifoldError::NotSupported));
        }
        Ok(())
    }

    fn close(&self) {
        let links = std::mem::take(&mut *self.links.lock());
        for link in links.into_values() {
            link.close();
        }
    }

    fn add_pipe(&self, pipe: &Pipe) -> Result<()> {
        let link = Link::new(pipe.clone(), self.ctx.clone(), Direction::SendOnly);
        let mut links = self.links.lock();
        link.start()?;
        links.insert(pipe.id(), link);
        Ok(())
    }

    fn remove_pipe(&self, pipe: &Pipe) {
        if let Some(link) = self.links.lock().remove(&pipe.id()) {
            link.close();
        }
    }

    fn send(&self, aio: &Aio) -> Result<()> {
        self.ctx.send_upper(aio)
    }

    fn recv(&self, aio: &Aio) -> Result<()> {
        aio.begin()?;
        aio.finish_error(ManifoldError::NotSupported);
        Ok(())
    }
}

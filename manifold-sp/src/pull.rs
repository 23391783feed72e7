//! PULL protocol (pipeline, version 0).
//!
//! PULL sockets receive only, from any number of PUSH peers. Sending fails
//! with `NotSupported`.

use crate::link::{Direction, Link};
use manifold_core::aio::Aio;
use manifold_core::error::{ManifoldError, Result};
use manifold_core::pipe::{Pipe, PipeId};
use manifold_core::protocol::{Protocol, ProtocolCtx, ProtocolInfo};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

pub const PULL_V0: u16 = 0x51;

pub const INFO: ProtocolInfo = ProtocolInfo {
    id: PULL_V0,
    name: "pull",
    peer_id: crate::push::PUSH_V0,
    peer_name: "push",
};

pub(crate) struct Pull {
    ctx: ProtocolCtx,
    links: Mutex<BTreeMap<PipeId, Arc<Link>>>,
}

pub(crate) fn factory(ctx: ProtocolCtx) -> Result<Box<dyn Protocol>> {
    Ok(Box::new(Pull {
        ctx,
        links: Mutex::new(BTreeMap::new()),
    }))
}

impl Protocol for Pull {
    fn info(&self) -> ProtocolInfo {
        INFO
    }

    fn open(&self) -> Result<()> {
        if let Some(sock) = self.ctx.socket() {
            sock.set_send_error(Some(ManifoldError::NotSupported));
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
        let link = Link::new(pipe.clone(), self.ctx.clone(), Direction::RecvOnly);
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
        aio.begin()?;
        aio.finish_error(ManifoldError::NotSupported);
        Ok(())
    }

    fn recv(&self, aio: &Aio) -> Result<()> {
        self.ctx.urq.pop_aio(aio)
    }
}

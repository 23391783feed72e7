//! Manifold Core
//!
//! This crate contains the protocol- and transport-independent machinery:
//! - Asynchronous operations and their completion rules (`aio`)
//! - Bounded message queues (`msgqueue`)
//! - Sockets, pipes and endpoints (`socket`, `pipe`, `endpoint`)
//! - The protocol contract and registry (`protocol`)
//! - Built-in transports: inproc, TCP, IPC (`transport`)
//! - Options, addresses, reconnect backoff and lifecycle events
//!
//! Messaging patterns live in `manifold-sp`; applications use the
//! `manifold` crate.

#![cfg_attr(not(test), deny(unsafe_code))]
// Allow some pedantic lints that are intentional in this crate
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::match_same_arms)]

pub mod address;
pub mod aio;
pub mod endpoint;
pub mod error;
mod expire;
pub mod message;
pub mod monitor;
pub mod msgqueue;
pub mod options;
pub mod pipe;
pub mod protocol;
pub mod reconnect;
pub mod socket;
pub mod transport;
pub mod waitblock;

mod taskq;

/// Number of threads running AIO callbacks.
pub use taskq::worker_count;

// Optional: a small prelude to make downstream crates ergonomic.
// Keep it minimal to avoid API lock-in.
pub mod prelude {
    pub use crate::address::Address;
    pub use crate::aio::{Aio, AioList, AioPhase, CancelFn, WeakAio};
    pub use crate::endpoint::{Endpoint, EndpointId, EndpointMode};
    pub use crate::error::{ManifoldError, Result};
    pub use crate::message::Message;
    pub use crate::monitor::{SocketEvent, SocketMonitor};
    pub use crate::msgqueue::{MsgQueue, PushError};
    pub use crate::options::{keys, OptionValue, SocketOptions};
    pub use crate::pipe::{Pipe, PipeId, PipeState};
    pub use crate::protocol::{register_protocol, Protocol, ProtocolCtx, ProtocolInfo};
    pub use crate::reconnect::ReconnectState;
    pub use crate::socket::{Socket, SocketId};
}

//! # Manifold
//!
//! Message-oriented sockets with pluggable protocols and transports.
//!
//! ## Architecture
//!
//! - **`manifold-core`**: sockets, pipes, endpoints, bounded message queues,
//!   asynchronous operations (AIO), and the inproc, TCP and IPC transports
//! - **`manifold-sp`**: the PAIR, PUSH and PULL protocols
//! - **`manifold`**: public API surface (this crate) and the `perf` benchmark
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use manifold::prelude::*;
//!
//! # fn main() -> manifold::Result<()> {
//! let server = manifold::pair::open()?;
//! server.listen("tcp://127.0.0.1:5555")?;
//!
//! let client = manifold::pair::open()?;
//! client.dial("tcp://127.0.0.1:5555")?;
//!
//! client.send(Message::from("Hello"))?;
//! let msg = server.recv()?;
//! assert_eq!(msg.body(), b"Hello");
//!
//! client.close();
//! server.close();
//! # Ok(())
//! # }
//! ```
//!
//! ## Asynchronous use
//!
//! Every blocking call has an AIO form (`send_aio`/`recv_aio`) that completes
//! through a callback, and a future form (`send_async`/`recv_async`) that
//! works with any executor.

pub mod dev_tracing;
pub mod perf;

pub use bytes::Bytes;
pub use manifold_core::address::Address;
pub use manifold_core::aio::{Aio, AioFuture};
pub use manifold_core::error::{ManifoldError, Result};
pub use manifold_core::message::Message;
pub use manifold_core::monitor::{SocketEvent, SocketMonitor};
pub use manifold_core::options::{keys, OptionValue, SocketOptions};
pub use manifold_core::socket::{live_sockets, Socket, SocketId};
pub use manifold_core::{endpoint, msgqueue, pipe, protocol, transport};

/// Open a socket for any registered protocol id.
///
/// The built-in protocols are registered on first use.
///
/// # Errors
///
/// `UnsupportedProtocol` if nothing is registered under `protocol`.
pub fn open(protocol: u16) -> Result<Socket> {
    open_with(protocol, SocketOptions::default())
}

/// Open a socket with initial options.
///
/// # Errors
///
/// `UnsupportedProtocol`, or `InvalidValue` for out-of-range options.
pub fn open_with(protocol: u16, options: SocketOptions) -> Result<Socket> {
    manifold_sp::register_all();
    Socket::create_with(protocol, options)
}

macro_rules! protocol_module {
    ($name:ident, $id:path, $doc:literal) => {
        #[doc = $doc]
        pub mod $name {
            use super::{Result, Socket, SocketOptions};

            /// Protocol id.
            pub const ID: u16 = $id;

            /// Open a socket speaking this protocol.
            ///
            /// # Errors
            ///
            /// Only if the protocol cannot be instantiated.
            pub fn open() -> Result<Socket> {
                super::open(ID)
            }

            /// Open with initial options.
            ///
            /// # Errors
            ///
            /// `InvalidValue` for out-of-range options.
            pub fn open_with(options: SocketOptions) -> Result<Socket> {
                super::open_with(ID, options)
            }
        }
    };
}

protocol_module!(pair, manifold_sp::pair::PAIR_V0, "PAIR: one exclusive, bidirectional peer.");
protocol_module!(push, manifold_sp::push::PUSH_V0, "PUSH: send-only side of a pipeline.");
protocol_module!(pull, manifold_sp::pull::PULL_V0, "PULL: receive-only side of a pipeline.");

pub mod prelude {
    pub use crate::{
        keys, Aio, ManifoldError, Message, OptionValue, Socket, SocketEvent, SocketOptions,
    };
}

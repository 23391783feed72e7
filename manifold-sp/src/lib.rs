//! # Manifold SP
//!
//! Built-in scalability protocols for Manifold sockets:
//! - **PAIR** (`0x10`): exclusive bidirectional peer
//! - **PUSH** (`0x50`): send-only side of a pipeline
//! - **PULL** (`0x51`): receive-only side of a pipeline
//!
//! Each protocol registers a factory with the core protocol registry.
//! Call [`register_all`] once before creating sockets; it is idempotent.
//!
//! ```rust,no_run
//! use manifold_core::socket::Socket;
//!
//! manifold_sp::register_all();
//! let socket = Socket::create(manifold_sp::pair::PAIR_V0)?;
//! socket.listen("inproc://example")?;
//! # Ok::<(), manifold_core::error::ManifoldError>(())
//! ```

#![cfg_attr(not(test), deny(unsafe_code))]
#![allow(clippy::module_name_repetitions)]

mod link;
pub mod pair;
pub mod pull;
pub mod push;

use manifold_core::protocol::{register_protocol, ProtocolInfo};
use once_cell::sync::Lazy;

static REGISTERED: Lazy<()> = Lazy::new(|| {
    register_protocol(pair::INFO, pair::factory);
    register_protocol(push::INFO, push::factory);
    register_protocol(pull::INFO, pull::factory);
});

/// Register PAIR, PUSH and PULL with the core registry.
pub fn register_all() {
    Lazy::force(&REGISTERED);
}

/// Protocols provided by this crate.
#[must_use]
pub const fn protocols() -> [ProtocolInfo; 3] {
    [pair::INFO, push::INFO, pull::INFO]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_peers_match() {
        assert!(push::INFO.is_compatible(pull::PULL_V0));
        assert!(pull::INFO.is_compatible(push::PUSH_V0));
        assert!(!push::INFO.is_compatible(push::PUSH_V0));
        assert!(pair::INFO.is_compatible(pair::PAIR_V0));
    }

    #[test]
    fn test_register_all_is_idempotent() {
        register_all();
        register_all();
        let ids: Vec<u16> = manifold_core::protocol::registered()
            .iter()
            .map(|p| p.id)
            .collect();
        for info in protocols() {
            assert!(ids.contains(&info.id));
        }
    }
}

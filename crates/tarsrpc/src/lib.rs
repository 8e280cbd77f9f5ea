//! RPC over the TARS tagged binary protocol.
//!
//! # Crate Structure
//!
//! - [`transport`]: blocking TCP listener and streams
//! - [`codec`]: tagged field encoding, request/response envelopes and length framing
//! - [`peer`]: correlation, load balancing, sessions, servant hosting and client proxies
//!   (behind the `peer` feature)

/// Re-export transport types.
pub mod transport {
    pub use tarsrpc_transport::*;
}

/// Re-export codec types.
pub mod codec {
    pub use tarsrpc_codec::*;
}

/// Re-export peer types (requires `peer` feature).
#[cfg(feature = "peer")]
pub mod peer {
    pub use tarsrpc_peer::*;
}

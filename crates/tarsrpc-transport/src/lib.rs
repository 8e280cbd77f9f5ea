//! Blocking TCP transport for tarsrpc.
//!
//! This is the lowest layer of tarsrpc. Sessions, the server and the
//! connection pool all build on the [`RpcStream`] type provided here.

pub mod error;
pub mod tcp;
pub mod traits;

pub use error::{Result, TransportError};
pub use tcp::TcpTransport;
pub use traits::RpcStream;

use std::time::Duration;

use tarsrpc_codec::ResultCode;

/// Failures reported by a registry client.
///
/// Only `Unreachable` and `Empty` make the resolver fall back to the local
/// endpoint cache; anything else is surfaced to the caller as is.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// The registry could not be contacted.
    #[error("registry unreachable: {0}")]
    Unreachable(String),

    /// The registry answered with no endpoints for the servant.
    #[error("registry has no endpoints for {0}")]
    Empty(String),

    /// The registry refused the query.
    #[error("registry rejected query: {0}")]
    Rejected(String),
}

impl RegistryError {
    /// Whether the local endpoint cache may stand in for the registry.
    pub fn allows_cache_fallback(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::Empty(_))
    }
}

/// Failure raised by a servant method; travels back to the caller as the
/// response's result code and description.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ServantError {
    pub code: ResultCode,
    pub message: String,
}

impl ServantError {
    pub fn new(code: ResultCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// A servant-level failure with the generic `Unknown` code.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(ResultCode::Unknown, message)
    }
}

/// Errors that can occur while making or serving calls.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] tarsrpc_transport::TransportError),

    /// Encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(#[from] tarsrpc_codec::CodecError),

    /// Endpoint resolution through the registry failed.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Local I/O error (endpoint cache, thread spawn).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// No endpoint is available for the servant.
    #[error("no reachable endpoint for {0}")]
    NoEndpoint(String),

    /// The configuration cannot be used.
    #[error("configuration error: {0}")]
    Config(String),

    /// An endpoint string could not be parsed.
    #[error("invalid endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    /// The call did not complete before its deadline.
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// The servant answered with a non-success result.
    #[error("remote call failed with {code}: {message}")]
    Remote { code: ResultCode, message: String },

    /// The method is not part of the proxy's interface, or cannot be
    /// called this way.
    #[error("method '{0}' cannot be invoked")]
    UnknownMethod(String),

    /// A live ticket already exists for the request id.
    #[error("request id {0} already has a live ticket")]
    DuplicateTicket(i32),

    /// The session closed while the call was in flight.
    #[error("session disconnected: {0}")]
    Disconnected(String),

    /// The communicator or server has been shut down.
    #[error("shut down")]
    Shutdown,
}

impl RpcError {
    pub(crate) fn invalid_endpoint(endpoint: &str, reason: impl Into<String>) -> Self {
        Self::InvalidEndpoint {
            endpoint: endpoint.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;

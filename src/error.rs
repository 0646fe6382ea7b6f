//! Error types for value synchronization and its transports.
//!
//! The value core itself only fails when a value cannot be encoded as a
//! payload. Everything else here comes from the transport boundary and is
//! surfaced to callers of the transport, never as a state change.

use thiserror::Error;

/// Result type for ws-value operations.
pub type Result<T> = std::result::Result<T, Error>;

/// JSON-RPC 2.0 error codes.
pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
}

/// Errors that can occur while synchronizing a value.
#[derive(Debug, Error)]
pub enum Error {
    /// No live connection to the remote side
    #[error("not connected")]
    NotConnected,

    /// The connection dropped before a response arrived
    #[error("connection closed before a response arrived")]
    ConnectionClosed,

    /// A remote call did not complete within the configured timeout
    #[error("call to `{0}` timed out")]
    Timeout(String),

    /// The remote side answered with a JSON-RPC error
    #[error("remote error {code}: {message}")]
    Remote { code: i64, message: String },

    /// A procedure received parameters it cannot use
    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// No procedure is registered under this name
    #[error("method not found: {0}")]
    MethodNotFound(String),

    /// Malformed endpoint URL
    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// WebSocket error
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A transport was created outside of a tokio runtime
    #[error("no tokio runtime: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
}

impl Error {
    /// JSON-RPC error code used when this error is reported to a peer.
    pub fn rpc_code(&self) -> i64 {
        match self {
            Error::Remote { code, .. } => *code,
            Error::InvalidParams(_) => codes::INVALID_PARAMS,
            Error::MethodNotFound(_) => codes::METHOD_NOT_FOUND,
            Error::Serialization(_) => codes::PARSE_ERROR,
            _ => codes::INTERNAL_ERROR,
        }
    }

    /// Whether the error is a connectivity problem rather than a rejected call.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::NotConnected
                | Error::ConnectionClosed
                | Error::Timeout(_)
                | Error::WebSocket(_)
                | Error::Io(_)
        )
    }
}

//! Error types for the callback server.

use std::net::SocketAddr;

use rpc_codec::CodecError;

use crate::listener::ListenerError;

/// Errors raised while starting or stopping the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The listening socket could not be bound
    #[error("Failed to bind callback server to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Invalid configuration provided
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A socket operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The codec could not be constructed
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// The accept loop did not stop cleanly
    #[error("Shutdown error: {0}")]
    Shutdown(String),
}

/// Errors that end a single callback connection.
///
/// None of these affect other connections or the accept loop.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// The peer closed the socket in the middle of a frame
    #[error("Connection closed before the full {expected}-byte frame arrived")]
    Truncated { expected: usize },

    /// The declared message size exceeds the configured limit
    #[error("Message of {declared} bytes exceeds the {limit}-byte limit")]
    FrameTooLarge { declared: usize, limit: usize },

    /// An HTTP request arrived without a body
    #[error("HTTP request has no body")]
    EmptyBody,

    /// An HTTP request used a method other than POST
    #[error("Unsupported HTTP method: {0}")]
    UnsupportedHttpMethod(String),

    /// Reading or writing the socket failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The request could not be decoded
    #[error("Failed to decode request: {0}")]
    Decode(#[source] CodecError),

    /// The reply could not be encoded
    #[error("Failed to encode reply: {0}")]
    Encode(#[source] CodecError),

    /// The HTTP layer failed
    #[error("HTTP error: {0}")]
    Http(String),
}

/// Errors from dispatching one RPC call.
///
/// These are logged and never change the reply sent to the gateway.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The call's parameters do not have the expected shape
    #[error("Invalid parameters for {method}: {reason}")]
    InvalidParams { method: &'static str, reason: String },

    /// The event listener reported a failure
    #[error("Listener callback failed: {0}")]
    Listener(#[source] ListenerError),

    /// A multicall was nested inside too many other multicalls
    #[error("Multicall nested {depth} levels deep")]
    MulticallTooDeep { depth: usize },
}

impl DispatchError {
    pub(crate) fn invalid(method: &'static str, reason: impl Into<String>) -> Self {
        DispatchError::InvalidParams {
            method,
            reason: reason.into(),
        }
    }
}

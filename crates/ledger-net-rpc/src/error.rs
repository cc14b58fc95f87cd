//! Error types for the RPC layer.

use ledger_net_core::SubscriberId;
use thiserror::Error;

/// Errors that can occur on a channel or transport.
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    /// Connect refused, write failed, socket reset.
    #[error("transport error: {0}")]
    Transport(String),

    /// The connection closed before the operation completed.
    #[error("connection closed")]
    ConnectionClosed,

    /// No response within the call timeout.
    #[error("timeout: {0}")]
    Timeout(String),

    /// A frame or result could not be decoded.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// The node answered with a JSON-RPC error object.
    #[error("server error {code}: {message}")]
    Server {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// The node refused to start a subscription.
    #[error("subscription {subscriber_id} rejected: {reason}")]
    SubscriptionRejected {
        subscriber_id: SubscriberId,
        reason: String,
    },

    /// The subscriber id is already routed on this channel.
    #[error("duplicate subscriber id {0}")]
    DuplicateSubscriber(SubscriberId),

    /// The transport cannot serve this node.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl From<serde_json::Error> for RpcError {
    fn from(e: serde_json::Error) -> Self {
        RpcError::Malformed(e.to_string())
    }
}

impl From<std::io::Error> for RpcError {
    fn from(e: std::io::Error) -> Self {
        RpcError::Transport(e.to_string())
    }
}

/// Result type for RPC operations.
pub type Result<T> = std::result::Result<T, RpcError>;

//! Error types for the network layer.

use ledger_net_core::{CoreError, Node, UniverseId};
use ledger_net_rpc::RpcError;
use thiserror::Error;

/// Errors that can occur during network operations.
///
/// Most failures never surface here: they become actions
/// (`NodeStatus(Failed)`, `FetchAtomsError`, `SubmissionStatus::Failed`).
/// This type covers direct calls into the façade and its collaborators.
#[derive(Debug, Clone, Error)]
pub enum NetworkError {
    /// RPC error.
    #[error("rpc error: {0}")]
    Rpc(#[from] RpcError),

    /// Core primitive error.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// HTTP bootstrap failed.
    #[error("bootstrap error: {0}")]
    Bootstrap(String),

    /// A node or bootstrap endpoint belongs to another universe.
    #[error("universe mismatch: expected {expected}, got {actual}")]
    UniverseMismatch {
        expected: UniverseId,
        actual: UniverseId,
    },

    /// Opening a connection to a node failed.
    #[error("connection to {node} failed: {reason}")]
    ConnectionFailed { node: Node, reason: String },

    /// The controller or connection manager is no longer running.
    #[error("network controller stopped")]
    ControllerStopped,
}

impl From<reqwest::Error> for NetworkError {
    fn from(e: reqwest::Error) -> Self {
        NetworkError::Bootstrap(e.to_string())
    }
}

/// Result type for network operations.
pub type Result<T> = std::result::Result<T, NetworkError>;

//! Peer nodes and what they report about themselves.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{CoreError, Result};
use crate::types::{Shard, UniverseId};

/// A peer endpoint. Identity is `(host, port, tls)`; connection state lives
/// in [`crate::NetworkState`], never here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Node {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub tls: bool,
}

impl Node {
    pub fn new(host: impl Into<String>, port: u16, tls: bool) -> Self {
        Self {
            host: host.into(),
            port,
            tls,
        }
    }

    /// `host:port`, suitable for socket connects.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls { "wss" } else { "ws" };
        write!(f, "{}://{}:{}", scheme, self.host, self.port)
    }
}

/// Inclusive range of routing keys a node serves.
///
/// Deserialization goes through [`ShardSpace::new`], so a decoded range is
/// never inverted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawShardSpace")]
pub struct ShardSpace {
    pub lower: i64,
    pub upper: i64,
}

#[derive(Deserialize)]
struct RawShardSpace {
    lower: i64,
    upper: i64,
}

impl TryFrom<RawShardSpace> for ShardSpace {
    type Error = CoreError;

    fn try_from(raw: RawShardSpace) -> Result<Self> {
        Self::new(raw.lower, raw.upper)
    }
}

impl ShardSpace {
    pub fn new(lower: i64, upper: i64) -> Result<Self> {
        if lower > upper {
            return Err(CoreError::InvalidShardSpace { lower, upper });
        }
        Ok(Self { lower, upper })
    }

    /// The whole key space.
    pub const FULL: Self = Self {
        lower: i64::MIN,
        upper: i64::MAX,
    };

    pub fn contains(&self, shard: Shard) -> bool {
        self.lower <= shard.0 && shard.0 <= self.upper
    }

    /// True if at least one of `shards` falls inside this range.
    pub fn intersects<'a>(&self, shards: impl IntoIterator<Item = &'a Shard>) -> bool {
        shards.into_iter().any(|shard| self.contains(*shard))
    }
}

/// Peer-reported metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub universe: UniverseId,
    pub shard_space: ShardSpace,
}

/// Connection status of a node as seen by this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Closing,
    Failed,
}

impl ConnectionStatus {
    /// Whether a fresh acquire may be attempted against the node.
    pub fn is_usable(&self) -> bool {
        !matches!(self, ConnectionStatus::Failed | ConnectionStatus::Closing)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Closing => "closing",
            ConnectionStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Everything the client knows about one node.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NodeState {
    pub status: ConnectionStatus,
    pub info: Option<NodeInfo>,
}

impl NodeState {
    pub fn with_info(status: ConnectionStatus, info: NodeInfo) -> Self {
        Self {
            status,
            info: Some(info),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_identity_ignores_nothing_but_identity() {
        let a = Node::new("10.0.0.1", 8080, false);
        let b = Node::new("10.0.0.1", 8080, false);
        let tls = Node::new("10.0.0.1", 8080, true);
        assert_eq!(a, b);
        assert_ne!(a, tls);
        assert_eq!(a.to_string(), "ws://10.0.0.1:8080");
        assert_eq!(tls.to_string(), "wss://10.0.0.1:8080");
    }

    #[test]
    fn test_shard_space_rejects_inverted_range() {
        assert!(ShardSpace::new(5, 1).is_err());
        assert!(ShardSpace::new(1, 1).is_ok());
    }

    #[test]
    fn test_decoding_rejects_inverted_range() {
        let space: ShardSpace = serde_json::from_str(r#"{"lower": -3, "upper": 7}"#).unwrap();
        assert_eq!(space, ShardSpace::new(-3, 7).unwrap());

        let inverted = serde_json::from_str::<ShardSpace>(r#"{"lower": 7, "upper": -3}"#);
        assert!(inverted.is_err());
    }

    #[test]
    fn test_full_shard_space_contains_extremes() {
        assert!(ShardSpace::FULL.contains(Shard(i64::MIN)));
        assert!(ShardSpace::FULL.contains(Shard(i64::MAX)));
    }
}

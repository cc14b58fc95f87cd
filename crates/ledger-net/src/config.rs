//! Configuration for the network layer.

use std::time::Duration;

use ledger_net_core::{Node, UniverseId};
use ledger_net_rpc::ChannelConfig;

use crate::bootstrap::HttpBootstrap;

/// Configuration shared by the controller, connection manager and epics.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// The universe every node must belong to.
    pub universe: UniverseId,
    /// How long an unreferenced connection stays open.
    pub idle_close_grace: Duration,
    /// Timeout for one RPC call or subscription ack.
    pub call_timeout: Duration,
    /// Timeout for opening a socket (TCP connector).
    pub connect_timeout: Duration,
    /// Port assumed for peers that do not report one.
    pub default_port: u16,
}

impl NetworkConfig {
    pub fn new(universe: UniverseId) -> Self {
        Self {
            universe,
            idle_close_grace: Duration::from_secs(5),
            call_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            default_port: 8080,
        }
    }

    pub fn channel(&self) -> ChannelConfig {
        ChannelConfig {
            call_timeout: self.call_timeout,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self::new(UniverseId([0; 32]))
    }
}

/// Where discovery gets its first nodes.
#[derive(Debug, Clone)]
pub enum SeedSource {
    /// A fixed list of nodes.
    Fixed(Vec<Node>),
    /// Live peers reported by an HTTP bootstrap endpoint.
    Bootstrap(HttpBootstrap),
}

impl Default for SeedSource {
    fn default() -> Self {
        SeedSource::Fixed(Vec::new())
    }
}

/// Configuration for [`crate::LedgerClient`].
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub network: NetworkConfig,
    pub seeds: SeedSource,
}

impl ClientConfig {
    pub fn new(universe: UniverseId, seeds: SeedSource) -> Self {
        Self {
            network: NetworkConfig::new(universe),
            seeds,
        }
    }
}

//! HTTP bootstrap: seed nodes from a node's public REST endpoint.

use std::time::Duration;

use reqwest::Client;

use ledger_net_core::{Node, UniverseId};
use ledger_net_rpc::{PeerRecord, UniverseConfig};

use crate::error::{NetworkError, Result};

/// Fetches live peers from `{base}/api/network/peers/live` after checking
/// `{base}/api/universe` matches the expected universe.
#[derive(Debug, Clone)]
pub struct HttpBootstrap {
    base: String,
    client: Client,
    default_port: u16,
}

impl HttpBootstrap {
    pub fn new(base: impl Into<String>, timeout: Duration, default_port: u16) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base: base.into().trim_end_matches('/').to_string(),
            client,
            default_port,
        })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// Seed nodes, or an error if the endpoint is unreachable or serves
    /// another universe.
    pub async fn seeds(&self, universe: &UniverseId) -> Result<Vec<Node>> {
        let config: UniverseConfig = self.get("/api/universe").await?;
        check_universe(universe, &config)?;

        let peers: Vec<PeerRecord> = self.get("/api/network/peers/live").await?;
        let nodes = peers_to_nodes(&peers, self.default_port, self.base.starts_with("https"));
        tracing::info!("bootstrap {} returned {} peers", self.base, nodes.len());
        Ok(nodes)
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base, path);
        let resp = self.client.get(&url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(NetworkError::Bootstrap(format!(
                "GET {} failed {} {}",
                url, status, text
            )));
        }
        Ok(resp.json::<T>().await?)
    }
}

fn check_universe(expected: &UniverseId, config: &UniverseConfig) -> Result<()> {
    if &config.id != expected {
        return Err(NetworkError::UniverseMismatch {
            expected: *expected,
            actual: config.id,
        });
    }
    Ok(())
}

/// Distinct nodes named by `peers`, in first-seen order.
fn peers_to_nodes(peers: &[PeerRecord], default_port: u16, default_tls: bool) -> Vec<Node> {
    let mut nodes: Vec<Node> = Vec::with_capacity(peers.len());
    for peer in peers {
        let node = peer.to_node(default_port, default_tls);
        if !nodes.contains(&node) {
            nodes.push(node);
        }
    }
    nodes
}

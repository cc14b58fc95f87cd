//! Finds nodes and learns what they serve.

use std::collections::HashSet;

use futures::StreamExt;
use tokio::sync::mpsc;

use ledger_net_core::{ConnectionStatus, Node, NodeAction};
use ledger_net_rpc::methods;

use super::{output, Emitter, Epic, EpicContext};
use crate::config::SeedSource;
use crate::connection::ConnectionManager;
use crate::controller::ActionStream;

/// Seeds the node table and queries every new node for its info and peers.
///
/// A node is announced with `AddNode` at most once and queried once on its
/// first sighting. `DiscoverMore` refreshes the seeds and retries nodes
/// that failed before reporting their info.
pub struct DiscoveryEpic {
    seeds: SeedSource,
}

impl DiscoveryEpic {
    pub fn new(seeds: SeedSource) -> Self {
        Self { seeds }
    }
}

impl Epic for DiscoveryEpic {
    fn name(&self) -> &'static str {
        "discovery"
    }

    fn epic(self: Box<Self>, ctx: EpicContext) -> ActionStream {
        let (emitter, stream) = output();
        tokio::spawn(run(self.seeds, ctx, emitter));
        stream
    }
}

async fn run(seeds: SeedSource, mut ctx: EpicContext, out: Emitter) {
    let (found_tx, mut found_rx) = mpsc::unbounded_channel::<Vec<Node>>();
    let mut announced: HashSet<Node> = HashSet::new();
    let mut queried: HashSet<Node> = HashSet::new();

    refresh_seeds(&seeds, &ctx, &found_tx);

    loop {
        tokio::select! {
            action = ctx.actions.next() => {
                let Some(action) = action else { break };
                match action {
                    NodeAction::AddNode { node } => {
                        if !queried.insert(node.clone()) {
                            continue;
                        }
                        let has_info = ctx
                            .state
                            .borrow()
                            .get(&node)
                            .map_or(false, |state| state.info.is_some());
                        if !has_info {
                            spawn_query(&ctx, &out, &found_tx, node);
                        }
                    }
                    NodeAction::DiscoverMore => {
                        tracing::debug!("discovering more nodes");
                        refresh_seeds(&seeds, &ctx, &found_tx);
                        let retry: Vec<Node> = ctx
                            .state
                            .borrow()
                            .iter()
                            .filter(|(_, state)| {
                                state.info.is_none()
                                    && matches!(
                                        state.status,
                                        ConnectionStatus::Failed | ConnectionStatus::Disconnected
                                    )
                            })
                            .map(|(node, _)| node.clone())
                            .collect();
                        for node in retry {
                            queried.insert(node.clone());
                            spawn_query(&ctx, &out, &found_tx, node);
                        }
                    }
                    _ => {}
                }
            }
            Some(nodes) = found_rx.recv() => {
                for node in nodes {
                    if ctx.state.borrow().contains(&node) || !announced.insert(node.clone()) {
                        continue;
                    }
                    tracing::info!("discovered {}", node);
                    out.emit(NodeAction::AddNode { node });
                }
            }
        }
    }
}

fn refresh_seeds(seeds: &SeedSource, ctx: &EpicContext, found: &mpsc::UnboundedSender<Vec<Node>>) {
    match seeds {
        SeedSource::Fixed(nodes) => {
            let _ = found.send(nodes.clone());
        }
        SeedSource::Bootstrap(bootstrap) => {
            let bootstrap = bootstrap.clone();
            let universe = ctx.config.universe;
            let found = found.clone();
            tokio::spawn(async move {
                match bootstrap.seeds(&universe).await {
                    Ok(nodes) => {
                        let _ = found.send(nodes);
                    }
                    Err(e) => tracing::warn!("bootstrap {} failed: {}", bootstrap.base(), e),
                }
            });
        }
    }
}

fn spawn_query(
    ctx: &EpicContext,
    out: &Emitter,
    found: &mpsc::UnboundedSender<Vec<Node>>,
    node: Node,
) {
    tokio::spawn(query(
        ctx.connections.clone(),
        out.clone(),
        found.clone(),
        ctx.config.universe,
        ctx.config.default_port,
        node,
    ));
}

/// Ask `node` for its info, then for its live peers.
async fn query(
    connections: ConnectionManager,
    out: Emitter,
    found: mpsc::UnboundedSender<Vec<Node>>,
    universe: ledger_net_core::UniverseId,
    default_port: u16,
    node: Node,
) {
    let conn = match connections.acquire(&node).await {
        Ok(conn) => conn,
        Err(e) => {
            tracing::warn!("cannot query {}: {}", node, e);
            return;
        }
    };

    let info = match methods::get_node_info(conn.channel()).await {
        Ok(info) => info,
        Err(e) => {
            tracing::warn!("{} did not report its info: {}", node, e);
            return;
        }
    };
    let same_universe = info.universe == universe;
    out.emit(NodeAction::GetNodeInfoResult {
        node: node.clone(),
        info,
    });
    if !same_universe {
        tracing::info!("{} belongs to another universe", node);
        return;
    }

    match methods::get_live_peers(conn.channel()).await {
        Ok(peers) => {
            let nodes = peers
                .iter()
                .map(|peer| peer.to_node(default_port, node.tls))
                .collect();
            let _ = found.send(nodes);
        }
        Err(e) => tracing::debug!("{} did not list peers: {}", node, e),
    }
    conn.release();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkConfig;
    use crate::epic::harness::Harness;
    use ledger_net_testkit::{node, MockNetwork, MockNodeConfig, UNIVERSE};
    use std::sync::Arc;

    fn network() -> MockNetwork {
        let network = MockNetwork::new();
        network.add_node(node(1), MockNodeConfig::default().with_peers([node(1), node(2)]));
        network.add_node(node(2), MockNodeConfig::default());
        network
    }

    fn harness(network: &MockNetwork, seeds: Vec<Node>) -> Harness {
        Harness::start(
            Box::new(DiscoveryEpic::new(SeedSource::Fixed(seeds))),
            Arc::new(network.clone()),
            NetworkConfig::new(UNIVERSE),
        )
    }

    #[tokio::test]
    async fn test_seeds_are_announced_once() {
        let network = network();
        let mut h = harness(&network, vec![node(1), node(1)]);

        assert_eq!(h.next().await, Some(NodeAction::AddNode { node: node(1) }));
        assert!(h.is_quiet().await);
    }

    #[tokio::test]
    async fn test_new_node_is_queried_and_peers_announced() {
        let network = network();
        let mut h = harness(&network, vec![node(1)]);

        let add = h.next().await.unwrap();
        h.send(add);

        match h.next().await {
            Some(NodeAction::GetNodeInfoResult { node: queried, info }) => {
                assert_eq!(queried, node(1));
                assert_eq!(info.universe, UNIVERSE);
            }
            other => panic!("unexpected {:?}", other),
        }
        // node(1) lists itself too; only node(2) is new.
        assert_eq!(h.next().await, Some(NodeAction::AddNode { node: node(2) }));
        assert!(h.is_quiet().await);
    }

    #[tokio::test]
    async fn test_repeated_add_node_produces_nothing() {
        let network = network();
        let mut h = harness(&network, vec![]);

        h.send(NodeAction::AddNode { node: node(2) });
        assert!(matches!(
            h.next().await,
            Some(NodeAction::GetNodeInfoResult { .. })
        ));
        assert!(h.is_quiet().await);

        h.send(NodeAction::AddNode { node: node(2) });
        h.send(NodeAction::AddNode { node: node(2) });
        assert!(h.is_quiet().await);
        assert_eq!(network.requests_for("network.getSelf").len(), 1);
    }

    #[tokio::test]
    async fn test_discover_more_retries_failed_nodes_without_info() {
        let network = network();
        network.fail_node(&node(2));
        let mut h = harness(&network, vec![]);

        h.send(NodeAction::AddNode { node: node(2) });
        assert!(h.is_quiet().await);
        h.send(NodeAction::NodeStatus {
            node: node(2),
            status: ConnectionStatus::Failed,
        });

        network.restore_node(&node(2));
        h.send(NodeAction::DiscoverMore);
        assert!(matches!(
            h.next().await,
            Some(NodeAction::GetNodeInfoResult { node: queried, .. }) if queried == node(2)
        ));
    }
}

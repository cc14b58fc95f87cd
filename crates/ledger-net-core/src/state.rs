//! The network state table and its reducer.

use std::collections::BTreeMap;

use crate::action::NodeAction;
use crate::node::{ConnectionStatus, Node, NodeState};
use crate::suitability::is_suitable;
use crate::types::{Shard, UniverseId};

/// Every node the client has heard of, with its connection status and info.
///
/// Ordered by node identity so that "the first suitable node" is
/// deterministic. Entries are never removed: stale nodes stay as
/// `Disconnected` / `Failed` and are skipped by selection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NetworkState {
    nodes: BTreeMap<Node, NodeState>,
}

impl NetworkState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, node: &Node) -> Option<&NodeState> {
        self.nodes.get(node)
    }

    pub fn contains(&self, node: &Node) -> bool {
        self.nodes.contains_key(node)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Node, &NodeState)> {
        self.nodes.iter()
    }

    /// Fold one action into the table. Returns `true` if anything changed.
    ///
    /// Only structural actions (`AddNode`, `GetNodeInfoResult`, `NodeStatus`)
    /// touch the table; everything else is ignored.
    pub fn apply(&mut self, action: &NodeAction) -> bool {
        match action {
            NodeAction::AddNode { node } => {
                if self.nodes.contains_key(node) {
                    return false;
                }
                self.nodes.insert(node.clone(), NodeState::default());
                true
            }
            NodeAction::GetNodeInfoResult { node, info } => {
                let entry = self.nodes.entry(node.clone()).or_default();
                if entry.info.as_ref() == Some(info) {
                    return false;
                }
                entry.info = Some(info.clone());
                true
            }
            NodeAction::NodeStatus { node, status } => {
                let entry = self.nodes.entry(node.clone()).or_default();
                if entry.status == *status {
                    return false;
                }
                entry.status = *status;
                true
            }
            _ => false,
        }
    }

    /// Nodes suitable for any of `shards`, in node order, regardless of status.
    pub fn suitable_nodes<'a>(
        &'a self,
        universe: &'a UniverseId,
        shards: &'a [Shard],
    ) -> impl Iterator<Item = (&'a Node, &'a NodeState)> + 'a {
        self.nodes
            .iter()
            .filter(move |(_, state)| is_suitable(state, universe, shards))
    }

    /// Pick a node for new work: the first suitable connected node, else the
    /// first suitable node that may still be connected to.
    pub fn select_node(&self, universe: &UniverseId, shards: &[Shard]) -> Option<Node> {
        let mut fallback = None;
        for (node, state) in self.suitable_nodes(universe, shards) {
            match state.status {
                ConnectionStatus::Connected => return Some(node.clone()),
                status if status.is_usable() && fallback.is_none() => {
                    fallback = Some(node.clone());
                }
                _ => {}
            }
        }
        fallback
    }

    /// Nodes in the given status.
    pub fn nodes_with_status(&self, status: ConnectionStatus) -> impl Iterator<Item = &Node> {
        self.nodes
            .iter()
            .filter(move |(_, state)| state.status == status)
            .map(|(node, _)| node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{NodeInfo, ShardSpace};

    const UNIVERSE: UniverseId = UniverseId([1; 32]);

    fn node(n: u8) -> Node {
        Node::new(format!("10.0.0.{}", n), 8080, false)
    }

    fn info(lower: i64, upper: i64) -> NodeInfo {
        NodeInfo {
            universe: UNIVERSE,
            shard_space: ShardSpace::new(lower, upper).unwrap(),
        }
    }

    #[test]
    fn test_add_node_is_idempotent() {
        let mut state = NetworkState::new();
        assert!(state.apply(&NodeAction::AddNode { node: node(1) }));
        assert!(!state.apply(&NodeAction::AddNode { node: node(1) }));
        assert_eq!(state.len(), 1);
        assert_eq!(
            state.get(&node(1)).unwrap().status,
            ConnectionStatus::Disconnected
        );
    }

    #[test]
    fn test_add_node_keeps_existing_state() {
        let mut state = NetworkState::new();
        state.apply(&NodeAction::NodeStatus {
            node: node(1),
            status: ConnectionStatus::Connected,
        });
        assert!(!state.apply(&NodeAction::AddNode { node: node(1) }));
        assert_eq!(
            state.get(&node(1)).unwrap().status,
            ConnectionStatus::Connected
        );
    }

    #[test]
    fn test_info_and_status_updates() {
        let mut state = NetworkState::new();
        assert!(state.apply(&NodeAction::GetNodeInfoResult {
            node: node(1),
            info: info(0, 10),
        }));
        assert!(!state.apply(&NodeAction::GetNodeInfoResult {
            node: node(1),
            info: info(0, 10),
        }));
        assert!(state.apply(&NodeAction::NodeStatus {
            node: node(1),
            status: ConnectionStatus::Failed,
        }));
        let entry = state.get(&node(1)).unwrap();
        assert_eq!(entry.status, ConnectionStatus::Failed);
        assert_eq!(entry.info, Some(info(0, 10)));
    }

    #[test]
    fn test_non_structural_actions_are_ignored() {
        let mut state = NetworkState::new();
        assert!(!state.apply(&NodeAction::DiscoverMore));
        assert!(state.is_empty());
    }

    #[test]
    fn test_select_prefers_connected_then_usable() {
        let mut state = NetworkState::new();
        for (n, status) in [
            (1, ConnectionStatus::Failed),
            (2, ConnectionStatus::Disconnected),
            (3, ConnectionStatus::Connected),
        ] {
            state.apply(&NodeAction::GetNodeInfoResult {
                node: node(n),
                info: info(0, 10),
            });
            state.apply(&NodeAction::NodeStatus {
                node: node(n),
                status,
            });
        }

        assert_eq!(state.select_node(&UNIVERSE, &[Shard(5)]), Some(node(3)));

        state.apply(&NodeAction::NodeStatus {
            node: node(3),
            status: ConnectionStatus::Failed,
        });
        assert_eq!(state.select_node(&UNIVERSE, &[Shard(5)]), Some(node(2)));
        assert_eq!(state.select_node(&UNIVERSE, &[Shard(50)]), None);
    }
}

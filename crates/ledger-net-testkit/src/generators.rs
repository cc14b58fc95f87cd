//! Proptest generators for property-based testing.

use proptest::prelude::*;

use ledger_net_core::{
    Address, ConnectionStatus, Node, NodeInfo, NodeState, Shard, ShardSpace, UniverseId,
};

/// Any routing key.
pub fn shard() -> impl Strategy<Value = Shard> {
    any::<i64>().prop_map(Shard)
}

/// A well-formed range (`lower <= upper`).
pub fn shard_space() -> impl Strategy<Value = ShardSpace> {
    (any::<i64>(), any::<i64>()).prop_map(|(a, b)| ShardSpace {
        lower: a.min(b),
        upper: a.max(b),
    })
}

/// A small set of routing keys, possibly empty.
pub fn shards(max_len: usize) -> impl Strategy<Value = Vec<Shard>> {
    prop::collection::vec(shard(), 0..=max_len)
}

pub fn universe_id() -> impl Strategy<Value = UniverseId> {
    any::<[u8; 32]>().prop_map(UniverseId)
}

pub fn address() -> impl Strategy<Value = Address> {
    prop::collection::vec(any::<u8>(), 1..=64).prop_map(Address::from_bytes)
}

pub fn node() -> impl Strategy<Value = Node> {
    ("[a-z]{1,12}(\\.[a-z]{1,8}){0,2}", any::<u16>(), any::<bool>())
        .prop_map(|(host, port, tls)| Node::new(host, port, tls))
}

pub fn connection_status() -> impl Strategy<Value = ConnectionStatus> {
    prop_oneof![
        Just(ConnectionStatus::Disconnected),
        Just(ConnectionStatus::Connecting),
        Just(ConnectionStatus::Connected),
        Just(ConnectionStatus::Closing),
        Just(ConnectionStatus::Failed),
    ]
}

/// A node state with or without info.
pub fn node_state() -> impl Strategy<Value = NodeState> {
    (
        connection_status(),
        prop::option::of((universe_id(), shard_space())),
    )
        .prop_map(|(status, info)| NodeState {
            status,
            info: info.map(|(universe, shard_space)| NodeInfo {
                universe,
                shard_space,
            }),
        })
}

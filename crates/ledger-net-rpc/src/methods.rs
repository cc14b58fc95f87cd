//! Typed wrappers for the ledger's JSON-RPC methods.

use serde_json::{json, Value};

use ledger_net_core::{Address, NodeInfo, ShardSpace, SignedAtom, SubscriberId};

use crate::channel::{RpcChannel, Subscription};
use crate::error::{Result, RpcError};
use crate::messages::{methods, PeerRecord, UniverseConfig};

pub async fn get_universe_config(channel: &RpcChannel) -> Result<UniverseConfig> {
    let result = channel.call(methods::GET_UNIVERSE_CONFIG, json!({})).await?;
    decode(methods::GET_UNIVERSE_CONFIG, result)
}

pub async fn get_self(channel: &RpcChannel) -> Result<PeerRecord> {
    let result = channel.call(methods::GET_SELF, json!({})).await?;
    decode(methods::GET_SELF, result)
}

pub async fn get_live_peers(channel: &RpcChannel) -> Result<Vec<PeerRecord>> {
    let result = channel.call(methods::GET_LIVE_PEERS, json!({})).await?;
    decode(methods::GET_LIVE_PEERS, result)
}

/// Ask a node who it is: its universe plus the shard range it serves.
///
/// A node that does not report a range is taken to serve the whole space.
pub async fn get_node_info(channel: &RpcChannel) -> Result<NodeInfo> {
    let universe = get_universe_config(channel).await?;
    let peer = get_self(channel).await?;
    Ok(NodeInfo {
        universe: universe.id,
        shard_space: peer.shards.unwrap_or(ShardSpace::FULL),
    })
}

/// Subscribe to atom events for `address`. Notifications arrive as
/// `atoms.subscribeUpdate`.
pub async fn subscribe_atoms(
    channel: &RpcChannel,
    address: &Address,
    subscriber_id: SubscriberId,
) -> Result<Subscription> {
    channel
        .subscribe(
            methods::ATOMS_SUBSCRIBE,
            json!({ "address": address }),
            subscriber_id,
            methods::ATOMS_CANCEL,
        )
        .await
}

/// Submit an atom and subscribe to its status. Notifications arrive as
/// `atoms.nextStatusEvent`.
pub async fn submit_atom(
    channel: &RpcChannel,
    atom: &SignedAtom,
    subscriber_id: SubscriberId,
) -> Result<Subscription> {
    channel
        .subscribe(
            methods::ATOMS_SUBMIT_AND_SUBSCRIBE,
            json!({ "atom": atom }),
            subscriber_id,
            methods::ATOMS_CANCEL,
        )
        .await
}

fn decode<T: serde::de::DeserializeOwned>(method: &str, result: Value) -> Result<T> {
    serde_json::from_value(result).map_err(|e| RpcError::Malformed(format!("{}: {}", method, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelConfig;
    use crate::transport::memory::{self, MemorySocket};
    use crate::transport::Socket;
    use ledger_net_core::UniverseId;

    async fn answer(server: &mut MemorySocket, result: Value) -> Value {
        let frame = server.recv().await.unwrap().unwrap();
        let request: Value = serde_json::from_str(&frame).unwrap();
        server
            .send(json!({ "id": request["id"], "result": result }).to_string())
            .await
            .unwrap();
        request
    }

    #[tokio::test]
    async fn test_get_node_info_combines_universe_and_self() {
        let (client, mut server) = memory::pair();
        let channel = RpcChannel::open(Box::new(client), ChannelConfig::default());
        let universe = UniverseId([7; 32]);

        let info = tokio::spawn({
            let channel = channel.clone();
            async move { get_node_info(&channel).await }
        });

        let first = answer(&mut server, json!({ "id": universe, "name": "test" })).await;
        assert_eq!(first["method"], methods::GET_UNIVERSE_CONFIG);
        let second = answer(
            &mut server,
            json!({ "host": "a", "shards": { "lower": 0, "upper": 10 } }),
        )
        .await;
        assert_eq!(second["method"], methods::GET_SELF);

        let info = info.await.unwrap().unwrap();
        assert_eq!(info.universe, universe);
        assert_eq!(info.shard_space, ShardSpace::new(0, 10).unwrap());
    }

    #[tokio::test]
    async fn test_undecodable_result_is_malformed() {
        let (client, mut server) = memory::pair();
        let channel = RpcChannel::open(Box::new(client), ChannelConfig::default());

        let peers = tokio::spawn({
            let channel = channel.clone();
            async move { get_live_peers(&channel).await }
        });
        answer(&mut server, json!("not a list")).await;

        assert!(matches!(peers.await.unwrap(), Err(RpcError::Malformed(_))));
    }

    #[tokio::test]
    async fn test_inverted_shard_space_is_malformed() {
        let (client, mut server) = memory::pair();
        let channel = RpcChannel::open(Box::new(client), ChannelConfig::default());

        let info = tokio::spawn({
            let channel = channel.clone();
            async move { get_node_info(&channel).await }
        });
        answer(&mut server, json!({ "id": UniverseId([7; 32]), "name": "test" })).await;
        answer(
            &mut server,
            json!({ "host": "a", "shards": { "lower": 10, "upper": 0 } }),
        )
        .await;

        assert!(matches!(info.await.unwrap(), Err(RpcError::Malformed(_))));
    }
}

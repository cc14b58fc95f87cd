//! Mock ledger nodes and common fixtures.
//!
//! [`MockNetwork`] is a [`Connector`] whose sockets lead to scripted nodes
//! running in-process. Each accepted connection gets its own serve task
//! that answers the ledger methods the client speaks.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use ledger_net_core::{Address, Node, ShardSpace, Shard, SignedAtom, SubscriberId, UniverseId};
use ledger_net_rpc::messages::methods;
use ledger_net_rpc::transport::memory;
use ledger_net_rpc::{Connector, PeerRecord, RpcError, Socket};

/// Universe shared by the default mock nodes.
pub const UNIVERSE: UniverseId = UniverseId([0x11; 32]);

/// A plain-TCP node on `10.0.0.<n>:8080`.
pub fn node(n: u8) -> Node {
    Node::new(format!("10.0.0.{}", n), 8080, false)
}

/// An atom routed to `address`'s shard.
pub fn atom_for(address: &Address, payload: &[u8]) -> SignedAtom {
    match SignedAtom::new(payload.to_vec(), [address.shard()]) {
        Ok(atom) => atom,
        Err(e) => unreachable!("one shard is never empty: {}", e),
    }
}

/// A shard space containing exactly `shard`.
pub fn space_of(shard: Shard) -> ShardSpace {
    ShardSpace {
        lower: shard.0,
        upper: shard.0,
    }
}

/// How one mock node behaves.
#[derive(Debug, Clone)]
pub struct MockNodeConfig {
    pub universe: UniverseId,
    /// Reported by `network.getSelf`. `None` omits the field.
    pub shard_space: Option<ShardSpace>,
    /// Reported by `network.getLivePeers`.
    pub peers: Vec<Node>,
    /// Backlog delivered on `atoms.subscribe`.
    pub atoms: HashMap<Address, Vec<SignedAtom>>,
    /// `(status, message)` pairs pushed after `atoms.submitAtomAndSubscribe`.
    pub submit_statuses: Vec<(String, Option<String>)>,
    /// Answer subscriptions with `{"success": false}`.
    pub reject_subscriptions: bool,
}

impl Default for MockNodeConfig {
    fn default() -> Self {
        Self {
            universe: UNIVERSE,
            shard_space: Some(ShardSpace::FULL),
            peers: Vec::new(),
            atoms: HashMap::new(),
            submit_statuses: vec![("SUBMITTED".into(), None), ("STORED".into(), None)],
            reject_subscriptions: false,
        }
    }
}

impl MockNodeConfig {
    pub fn with_space(mut self, space: ShardSpace) -> Self {
        self.shard_space = Some(space);
        self
    }

    pub fn with_universe(mut self, universe: UniverseId) -> Self {
        self.universe = universe;
        self
    }

    pub fn with_peers(mut self, peers: impl IntoIterator<Item = Node>) -> Self {
        self.peers = peers.into_iter().collect();
        self
    }

    pub fn with_atoms(mut self, address: Address, atoms: Vec<SignedAtom>) -> Self {
        self.atoms.insert(address, atoms);
        self
    }

    pub fn with_statuses(mut self, statuses: &[(&str, Option<&str>)]) -> Self {
        self.submit_statuses = statuses
            .iter()
            .map(|(s, m)| (s.to_string(), m.map(str::to_string)))
            .collect();
        self
    }
}

/// A request as received by a mock node.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub node: Node,
    pub method: String,
    pub params: Value,
}

enum Outbound {
    Frame(String),
    Close,
}

struct LiveSubscription {
    node: Node,
    address: Address,
    subscriber_id: SubscriberId,
    outbound: mpsc::UnboundedSender<Outbound>,
}

#[derive(Default)]
struct Inner {
    nodes: HashMap<Node, MockNodeConfig>,
    failed: HashSet<Node>,
    connects: HashMap<Node, usize>,
    open: HashMap<Node, usize>,
    connections: HashMap<Node, Vec<mpsc::UnboundedSender<Outbound>>>,
    subscriptions: Vec<LiveSubscription>,
    requests: Vec<RecordedRequest>,
}

/// In-process ledger network for tests. Clones share the same nodes.
#[derive(Clone, Default)]
pub struct MockNetwork {
    inner: Arc<Mutex<Inner>>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a node.
    pub fn add_node(&self, node: Node, config: MockNodeConfig) {
        self.inner.lock().unwrap().nodes.insert(node, config);
    }

    /// Drop every open connection to `node` and refuse new ones.
    pub fn fail_node(&self, node: &Node) {
        let mut inner = self.inner.lock().unwrap();
        inner.failed.insert(node.clone());
        for conn in inner.connections.remove(node).unwrap_or_default() {
            let _ = conn.send(Outbound::Close);
        }
        inner.subscriptions.retain(|sub| &sub.node != node);
    }

    /// Accept connections to `node` again.
    pub fn restore_node(&self, node: &Node) {
        self.inner.lock().unwrap().failed.remove(node);
    }

    /// Push one stored atom to every live subscription on `address`.
    pub fn push_atom(&self, address: &Address, atom: &SignedAtom) -> usize {
        let inner = self.inner.lock().unwrap();
        let mut delivered = 0;
        for sub in inner.subscriptions.iter().filter(|s| &s.address == address) {
            let frame = update_frame(sub.subscriber_id, std::slice::from_ref(atom), false);
            if sub.outbound.send(Outbound::Frame(frame)).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Sockets ever opened to `node`.
    pub fn connects(&self, node: &Node) -> usize {
        self.inner.lock().unwrap().connects.get(node).copied().unwrap_or(0)
    }

    /// Sockets to `node` that are still open.
    pub fn open_connections(&self, node: &Node) -> usize {
        self.inner.lock().unwrap().open.get(node).copied().unwrap_or(0)
    }

    /// Live atom subscriptions held on `node`.
    pub fn subscriptions(&self, node: &Node) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.subscriptions.iter().filter(|s| &s.node == node).count()
    }

    /// Every request received so far, in arrival order.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.inner.lock().unwrap().requests.clone()
    }

    /// Received requests for one method.
    pub fn requests_for(&self, method: &str) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == method)
            .collect()
    }

    fn config(&self, node: &Node) -> Option<MockNodeConfig> {
        self.inner.lock().unwrap().nodes.get(node).cloned()
    }

    fn record(&self, node: &Node, method: &str, params: &Value) {
        self.inner.lock().unwrap().requests.push(RecordedRequest {
            node: node.clone(),
            method: method.to_string(),
            params: params.clone(),
        });
    }

    async fn serve(
        self,
        node: Node,
        mut socket: memory::MemorySocket,
        outbound_tx: mpsc::UnboundedSender<Outbound>,
        mut outbound: mpsc::UnboundedReceiver<Outbound>,
    ) {
        loop {
            tokio::select! {
                frame = socket.recv() => match frame {
                    Ok(Some(frame)) => {
                        for reply in self.handle(&node, &frame, &outbound_tx) {
                            if socket.send(reply).await.is_err() {
                                break;
                            }
                        }
                    }
                    _ => break,
                },
                message = outbound.recv() => match message {
                    Some(Outbound::Frame(frame)) => {
                        if socket.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Some(Outbound::Close) | None => break,
                },
            }
        }
        socket.close().await;

        let mut inner = self.inner.lock().unwrap();
        if let Some(open) = inner.open.get_mut(&node) {
            *open = open.saturating_sub(1);
        }
        inner
            .subscriptions
            .retain(|sub| !sub.outbound.same_channel(&outbound_tx));
        if let Some(conns) = inner.connections.get_mut(&node) {
            conns.retain(|conn| !conn.same_channel(&outbound_tx));
        }
    }

    /// Answer one request frame; returns frames to send in order.
    fn handle(
        &self,
        node: &Node,
        frame: &str,
        outbound: &mpsc::UnboundedSender<Outbound>,
    ) -> Vec<String> {
        let request: Value = match serde_json::from_str(frame) {
            Ok(request) => request,
            Err(e) => {
                tracing::debug!("mock {}: undecodable request: {}", node, e);
                return Vec::new();
            }
        };
        let id = request["id"].clone();
        let method = request["method"].as_str().unwrap_or_default().to_string();
        let params = request["params"].clone();
        self.record(node, &method, &params);

        let Some(config) = self.config(node) else {
            return vec![error_frame(&id, -32000, "unknown node")];
        };
        let subscriber_id = params
            .get("subscriberId")
            .and_then(|v| serde_json::from_value::<SubscriberId>(v.clone()).ok());

        match method.as_str() {
            methods::GET_UNIVERSE_CONFIG => {
                vec![result_frame(&id, json!({ "id": config.universe, "name": "mock" }))]
            }
            methods::GET_SELF => {
                let record = PeerRecord {
                    host: node.host.clone(),
                    port: Some(node.port),
                    tls: Some(node.tls),
                    shards: config.shard_space,
                };
                vec![result_frame(&id, json!(record))]
            }
            methods::GET_LIVE_PEERS => {
                let peers: Vec<PeerRecord> = config
                    .peers
                    .iter()
                    .map(|peer| PeerRecord {
                        host: peer.host.clone(),
                        port: Some(peer.port),
                        tls: Some(peer.tls),
                        shards: None,
                    })
                    .collect();
                vec![result_frame(&id, json!(peers))]
            }
            methods::ATOMS_SUBSCRIBE => {
                let (Some(subscriber_id), Some(address)) = (
                    subscriber_id,
                    params
                        .get("address")
                        .and_then(|v| serde_json::from_value::<Address>(v.clone()).ok()),
                ) else {
                    return vec![error_frame(&id, -32602, "invalid params")];
                };
                if config.reject_subscriptions {
                    return vec![result_frame(
                        &id,
                        json!({ "success": false, "message": "subscriptions disabled" }),
                    )];
                }
                self.inner.lock().unwrap().subscriptions.push(LiveSubscription {
                    node: node.clone(),
                    address: address.clone(),
                    subscriber_id,
                    outbound: outbound.clone(),
                });
                let backlog = config.atoms.get(&address).cloned().unwrap_or_default();
                vec![
                    result_frame(&id, json!({ "success": true })),
                    update_frame(subscriber_id, &backlog, true),
                ]
            }
            methods::ATOMS_CANCEL => {
                if let Some(subscriber_id) = subscriber_id {
                    self.inner.lock().unwrap().subscriptions.retain(|sub| {
                        !(sub.subscriber_id == subscriber_id && sub.outbound.same_channel(outbound))
                    });
                }
                vec![result_frame(&id, json!({ "success": true }))]
            }
            methods::ATOMS_SUBMIT_AND_SUBSCRIBE => {
                let Some(subscriber_id) = subscriber_id else {
                    return vec![error_frame(&id, -32602, "invalid params")];
                };
                if config.reject_subscriptions {
                    return vec![result_frame(
                        &id,
                        json!({ "success": false, "message": "submissions disabled" }),
                    )];
                }
                let mut frames = vec![result_frame(&id, json!({ "success": true }))];
                for (status, message) in &config.submit_statuses {
                    let mut params = json!({ "subscriberId": subscriber_id, "status": status });
                    if let Some(message) = message {
                        params["message"] = json!(message);
                    }
                    frames.push(
                        json!({ "method": methods::ATOMS_NEXT_STATUS_EVENT, "params": params })
                            .to_string(),
                    );
                }
                frames
            }
            other => vec![error_frame(&id, -32601, &format!("method not found: {}", other))],
        }
    }
}

#[async_trait]
impl Connector for MockNetwork {
    async fn connect(&self, node: &Node) -> ledger_net_rpc::Result<Box<dyn Socket>> {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        {
            let mut inner = self.inner.lock().unwrap();
            if !inner.nodes.contains_key(node) || inner.failed.contains(node) {
                return Err(RpcError::Transport(format!("connection refused: {}", node)));
            }
            *inner.connects.entry(node.clone()).or_default() += 1;
            *inner.open.entry(node.clone()).or_default() += 1;
            inner
                .connections
                .entry(node.clone())
                .or_default()
                .push(outbound_tx.clone());
        }

        let (client, server) = memory::pair();
        tokio::spawn(
            self.clone()
                .serve(node.clone(), server, outbound_tx, outbound_rx),
        );
        Ok(Box::new(client))
    }
}

fn result_frame(id: &Value, result: Value) -> String {
    json!({ "jsonrpc": "2.0", "id": id, "result": result }).to_string()
}

fn error_frame(id: &Value, code: i64, message: &str) -> String {
    json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } })
        .to_string()
}

fn update_frame(subscriber_id: SubscriberId, atoms: &[SignedAtom], is_head: bool) -> String {
    let events: Vec<Value> = atoms
        .iter()
        .map(|atom| json!({ "type": "store", "atom": atom }))
        .collect();
    json!({
        "method": methods::ATOMS_SUBSCRIBE_UPDATE,
        "params": {
            "subscriberId": subscriber_id,
            "atomEvents": events,
            "isHead": is_head,
        }
    })
    .to_string()
}

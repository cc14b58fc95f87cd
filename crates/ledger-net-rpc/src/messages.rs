//! JSON-RPC 2.0 envelopes and the ledger's wire records.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use ledger_net_core::{
    AtomEvent, AtomEventKind, Node, ShardSpace, SignedAtom, SubmissionStatus, SubscriberId,
    UniverseId,
};

use crate::error::{Result, RpcError};

/// Protocol version carried in every request.
pub const JSONRPC_VERSION: &str = "2.0";

/// Method names spoken to ledger nodes.
pub mod methods {
    pub const GET_UNIVERSE_CONFIG: &str = "universe.getUniverseConfig";
    pub const GET_SELF: &str = "network.getSelf";
    pub const GET_LIVE_PEERS: &str = "network.getLivePeers";
    pub const ATOMS_SUBSCRIBE: &str = "atoms.subscribe";
    pub const ATOMS_CANCEL: &str = "atoms.cancel";
    pub const ATOMS_SUBMIT_AND_SUBSCRIBE: &str = "atoms.submitAtomAndSubscribe";
    /// Notification carrying atom events for an `atoms.subscribe` stream.
    pub const ATOMS_SUBSCRIBE_UPDATE: &str = "atoms.subscribeUpdate";
    /// Notification carrying submission progress.
    pub const ATOMS_NEXT_STATUS_EVENT: &str = "atoms.nextStatusEvent";
}

/// Outbound request envelope.
#[derive(Debug, Clone, Serialize)]
pub struct Request {
    pub id: String,
    pub method: String,
    pub params: Value,
    pub jsonrpc: &'static str,
}

impl Request {
    pub fn new(id: impl Into<String>, method: impl Into<String>, params: Value) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            params,
            jsonrpc: JSONRPC_VERSION,
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// The `error` member of a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl From<ErrorObject> for RpcError {
    fn from(e: ErrorObject) -> Self {
        RpcError::Server {
            code: e.code,
            message: e.message,
            data: e.data,
        }
    }
}

/// A server-pushed message for one subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub subscriber_id: SubscriberId,
    pub params: Value,
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Response {
        id: String,
        outcome: std::result::Result<Value, ErrorObject>,
    },
    Notification(Notification),
}

impl Inbound {
    /// Decode a frame. Responses are recognised by a non-null `id`,
    /// notifications by `params.subscriberId`.
    pub fn decode(frame: &str) -> Result<Self> {
        let mut value: Value = serde_json::from_str(frame)?;
        let obj = value
            .as_object_mut()
            .ok_or_else(|| RpcError::Malformed("frame is not an object".into()))?;

        match obj.remove("id") {
            Some(Value::String(id)) => return Ok(Self::response(id, obj)),
            Some(Value::Number(n)) => return Ok(Self::response(n.to_string(), obj)),
            Some(Value::Null) | None => {}
            Some(other) => {
                return Err(RpcError::Malformed(format!("unsupported id: {}", other)));
            }
        }

        let method = obj
            .get("method")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::Malformed("frame has neither id nor method".into()))?
            .to_string();
        let params = obj.remove("params").unwrap_or(Value::Null);
        let subscriber_id = params
            .get("subscriberId")
            .cloned()
            .ok_or_else(|| RpcError::Malformed(format!("{} without subscriberId", method)))?;
        let subscriber_id: SubscriberId = serde_json::from_value(subscriber_id)?;

        Ok(Inbound::Notification(Notification {
            method,
            subscriber_id,
            params,
        }))
    }

    fn response(id: String, obj: &mut serde_json::Map<String, Value>) -> Self {
        let outcome = match obj.remove("error") {
            Some(error) if !error.is_null() => match serde_json::from_value(error) {
                Ok(error) => Err(error),
                Err(e) => Err(ErrorObject {
                    code: -32700,
                    message: format!("undecodable error object: {}", e),
                    data: None,
                }),
            },
            _ => Ok(obj.remove("result").unwrap_or(Value::Null)),
        };
        Inbound::Response { id, outcome }
    }
}

/// Acknowledgement of a subscription-start request.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscribeAck {
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Result of `universe.getUniverseConfig` and of `GET /api/universe`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniverseConfig {
    pub id: UniverseId,
    #[serde(default)]
    pub name: String,
}

/// One peer as reported by `network.getSelf` / `network.getLivePeers`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shards: Option<ShardSpace>,
}

impl PeerRecord {
    /// The node this record names, filling in the client's defaults.
    pub fn to_node(&self, default_port: u16, default_tls: bool) -> Node {
        Node::new(
            self.host.clone(),
            self.port.unwrap_or(default_port),
            self.tls.unwrap_or(default_tls),
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
struct AtomEventRecord {
    #[serde(rename = "type")]
    kind: String,
    atom: SignedAtom,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AtomUpdateRecord {
    #[serde(default)]
    atom_events: Vec<AtomEventRecord>,
    #[serde(default)]
    is_head: bool,
}

/// Decoded `atoms.subscribeUpdate` notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtomUpdate {
    pub events: Vec<AtomEvent>,
    pub is_head: bool,
}

impl AtomUpdate {
    /// Decode notification params. `isHead` is attached to the last event of
    /// the batch; an empty head batch yields no events and `is_head == true`.
    pub fn from_params(params: &Value) -> Result<Self> {
        let record: AtomUpdateRecord = serde_json::from_value(params.clone())?;
        let count = record.atom_events.len();
        let mut events = Vec::with_capacity(count);
        for (i, event) in record.atom_events.into_iter().enumerate() {
            let kind = match event.kind.as_str() {
                "store" => AtomEventKind::Store,
                "delete" => AtomEventKind::Delete,
                other => {
                    return Err(RpcError::Malformed(format!("unknown atom event type {:?}", other)))
                }
            };
            events.push(AtomEvent {
                atom: event.atom,
                kind,
                is_head: record.is_head && i + 1 == count,
            });
        }
        Ok(Self {
            events,
            is_head: record.is_head,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
struct StatusEventRecord {
    status: String,
    #[serde(default)]
    message: Option<String>,
}

/// Decode an `atoms.nextStatusEvent` notification into a submission status.
///
/// `SUBMITTED` and `STORED` map to progress; every other server status is a
/// refusal carrying the status name and message as the reason.
pub fn submission_status_from_params(params: &Value) -> Result<SubmissionStatus> {
    let record: StatusEventRecord = serde_json::from_value(params.clone())?;
    Ok(match record.status.as_str() {
        "SUBMITTED" => SubmissionStatus::Submitted,
        "STORED" => SubmissionStatus::Stored,
        other => SubmissionStatus::NotStored {
            reason: match record.message {
                Some(message) => format!("{}: {}", other, message),
                None => other.to_string(),
            },
        },
    })
}

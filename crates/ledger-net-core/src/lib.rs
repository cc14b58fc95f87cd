//! # ledger-net core
//!
//! Pure primitives for the ledger-net client: nodes, routing keys, actions and
//! the network state reducer.
//!
//! This crate contains no I/O, no sockets, no timers. Everything here is a
//! value or a pure function over values.
//!
//! ## Key Types
//!
//! - [`Node`] - A peer endpoint, identified by `(host, port, tls)`
//! - [`NodeInfo`] - What a peer reports: its universe and [`ShardSpace`]
//! - [`NetworkState`] - Every known node with its [`ConnectionStatus`]
//! - [`NodeAction`] - The closed set of intents and events in the network layer
//! - [`SignedAtom`] - An opaque signed ledger change with its routing keys
//!
//! ## Suitability
//!
//! [`is_suitable`] decides whether a node can serve a set of [`Shard`]s in a
//! given universe. See the [`suitability`] module.

pub mod action;
pub mod atom;
pub mod error;
pub mod node;
pub mod state;
pub mod suitability;
pub mod types;

pub use action::{AtomEvent, AtomEventKind, NodeAction, SubmissionStatus, SubscriberIds};
pub use atom::SignedAtom;
pub use error::{CoreError, Result};
pub use node::{ConnectionStatus, Node, NodeInfo, NodeState, ShardSpace};
pub use state::NetworkState;
pub use suitability::is_suitable;
pub use types::{Address, AtomId, RequestId, Shard, SubscriberId, UniverseId};

//! # ledger-net
//!
//! Network synchronization for a shard-partitioned ledger: finds nodes,
//! keeps connections to them, and routes atom fetches and submissions to
//! nodes that serve the right shards.
//!
//! ## Overview
//!
//! Everything flows through a single [`NetworkController`]:
//!
//! - **Actions**: every intent and observation is a [`NodeAction`]
//! - **State**: structural actions are folded into a [`NetworkState`]
//! - **Epics**: discovery, fetch, submit and connection react to actions
//!   and emit new ones
//! - **Connections**: one pooled [`RpcChannel`](ledger_net_rpc::RpcChannel)
//!   per node, closed after a grace period once nobody uses it
//!
//! ## Usage
//!
//! ```rust,no_run
//! use futures::StreamExt;
//! use ledger_net::{
//!     Address, ClientConfig, FetchUpdate, LedgerClient, Node, SeedSource, UniverseId,
//! };
//!
//! async fn example() {
//!     let seeds = SeedSource::Fixed(vec![Node::new("127.0.0.1", 8080, false)]);
//!     let client = LedgerClient::connect_tcp(ClientConfig::new(UniverseId([1; 32]), seeds));
//!
//!     let address = Address::from_bytes(b"alice".to_vec());
//!     let mut events = client.subscribe(&address);
//!     while let Some(update) = events.next().await {
//!         match update {
//!             FetchUpdate::Event(event) => println!("{} {:?}", event.atom.aid, event.kind),
//!             FetchUpdate::Head => println!("caught up"),
//!         }
//!     }
//! }
//! ```
//!
//! ## Re-exports
//!
//! - `ledger_net::core` - Nodes, actions and the state reducer
//! - `ledger_net::rpc` - JSON-RPC channel, transports and ledger methods

pub mod bootstrap;
pub mod client;
pub mod config;
pub mod connection;
pub mod controller;
pub mod epic;
pub mod error;
pub mod puller;
pub mod submitter;

pub use ledger_net_core as core;
pub use ledger_net_rpc as rpc;

pub use bootstrap::HttpBootstrap;
pub use client::LedgerClient;
pub use config::{ClientConfig, NetworkConfig, SeedSource};
pub use connection::{ConnectionHandle, ConnectionManager};
pub use controller::{ActionSink, ActionStream, NetworkController};
pub use epic::{Epic, EpicContext, Epics};
pub use error::{NetworkError, Result};
pub use puller::{AtomEventStream, AtomPuller, FetchUpdate, PullHandle};
pub use submitter::{AtomSubmitter, SubmissionStream};

pub use ledger_net_core::{
    Address, AtomEvent, AtomEventKind, AtomId, ConnectionStatus, NetworkState, Node, NodeAction,
    NodeInfo, Shard, ShardSpace, SignedAtom, SubmissionStatus, SubscriberId, UniverseId,
};

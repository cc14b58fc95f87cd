//! # ledger-net RPC
//!
//! JSON-RPC 2.0 over a frame-oriented socket, multiplexed for many callers.
//!
//! ## Overview
//!
//! One [`RpcChannel`] owns one socket. Any number of tasks may issue
//! [`RpcChannel::call`]s and hold [`Subscription`]s on it concurrently; the
//! channel's actor correlates responses by request id and routes
//! server-pushed notifications by subscriber id.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use ledger_net_core::{Node, SubscriberId};
//! use ledger_net_rpc::{methods, ChannelConfig, Connector, RpcChannel, TcpConnector};
//!
//! async fn example() -> ledger_net_rpc::Result<()> {
//!     let node = Node::new("127.0.0.1", 8080, false);
//!     let socket = TcpConnector::default().connect(&node).await?;
//!     let channel = RpcChannel::open(socket, ChannelConfig::default());
//!
//!     let info = methods::get_node_info(&channel).await?;
//!     println!("{} serves {:?}", node, info.shard_space);
//!     Ok(())
//! }
//! ```
//!
//! ## Message Flow
//!
//! ```text
//! Client                                 Node
//!   |-- {id:"1", atoms.subscribe} -------->|
//!   |<------------- {id:"1", result} ------|   ack
//!   |<-- atoms.subscribeUpdate {subId} ----|   notifications
//!   |<-- atoms.subscribeUpdate {subId} ----|
//!   |-- {id:"2", atoms.cancel {subId}} --->|   explicit unsubscribe
//! ```

pub mod channel;
pub mod error;
pub mod messages;
pub mod methods;
pub mod transport;

pub use channel::{ChannelConfig, ChannelId, CloseReason, RpcChannel, Subscription};
pub use error::{Result, RpcError};
pub use messages::{
    submission_status_from_params, AtomUpdate, ErrorObject, Inbound, Notification, PeerRecord,
    Request, SubscribeAck, UniverseConfig, JSONRPC_VERSION,
};
pub use transport::{memory::MemorySocket, tcp::TcpConnector, Connector, Socket};

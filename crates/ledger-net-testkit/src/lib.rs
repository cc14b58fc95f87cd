//! # ledger-net testkit
//!
//! Testing utilities for ledger-net.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Mock network**: [`MockNetwork`], a [`Connector`](ledger_net_rpc::Connector)
//!   backed by scripted in-process ledger nodes
//! - **Fixtures**: canned nodes, universes and atoms
//! - **Generators**: Proptest strategies for property-based testing
//!
//! ## Mock Network
//!
//! ```rust,no_run
//! use ledger_net_testkit::{node, MockNetwork, MockNodeConfig};
//!
//! let network = MockNetwork::new();
//! network.add_node(node(1), MockNodeConfig::default().with_peers([node(2)]));
//! network.add_node(node(2), MockNodeConfig::default());
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use ledger_net_testkit::generators::{node_state, shard};
//!
//! proptest! {
//!     #[test]
//!     fn suitability_is_deterministic(state in node_state(), key in shard()) {
//!         // ...
//!     }
//! }
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::{
    atom_for, node, space_of, MockNetwork, MockNodeConfig, RecordedRequest, UNIVERSE,
};

/// Install a `tracing` subscriber for tests. Honors `RUST_LOG`; safe to call
/// more than once.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

//! Peer suitability policy.
//!
//! Decides whether a node can serve a set of routing keys under the active
//! universe. Pure: no I/O, no clocks, no connection state.

use crate::node::NodeState;
use crate::types::{Shard, UniverseId};

/// Whether `state` describes a node able to serve any of `shards` in `universe`.
///
/// A node without [`crate::NodeInfo`] is not (yet) suitable. A universe
/// mismatch is never suitable, whatever its shard range.
pub fn is_suitable<'a>(
    state: &NodeState,
    universe: &UniverseId,
    shards: impl IntoIterator<Item = &'a Shard>,
) -> bool {
    match &state.info {
        Some(info) if info.universe == *universe => info.shard_space.intersects(shards),
        _ => false,
    }
}

//! Node actions: the values flowing through the network controller.
//!
//! Actions describe an intent or an observed event. They carry no side
//! effects; epics react to them and the reducer folds the structural ones
//! into [`crate::NetworkState`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::atom::SignedAtom;
use crate::node::{ConnectionStatus, Node, NodeInfo};
use crate::types::{Address, RequestId, SubscriberId};

/// Whether an atom was stored or deleted on the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomEventKind {
    Store,
    Delete,
}

/// One observed change to an address's atoms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtomEvent {
    pub atom: SignedAtom,
    pub kind: AtomEventKind,
    /// Set on the last event of the initial backlog: everything after it is live.
    pub is_head: bool,
}

/// Progress of one atom submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionStatus {
    SearchingForNode,
    Submitting,
    Submitted,
    Stored,
    /// The ledger refused the atom. A normal outcome, not a transport error.
    NotStored { reason: String },
    /// The submission could not be carried out (connection lost, protocol error).
    Failed { reason: String },
}

impl SubmissionStatus {
    /// Terminal statuses end the status stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubmissionStatus::Stored
                | SubmissionStatus::NotStored { .. }
                | SubmissionStatus::Failed { .. }
        )
    }
}

/// The closed set of actions understood by the network layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeAction {
    AddNode {
        node: Node,
    },
    GetNodeInfoResult {
        node: Node,
        info: NodeInfo,
    },
    NodeStatus {
        node: Node,
        status: ConnectionStatus,
    },
    /// No suitable node is known for some pending work.
    DiscoverMore,
    FetchAtomsRequest {
        address: Address,
        request_id: RequestId,
    },
    FetchAtomsCancel {
        address: Address,
        request_id: RequestId,
    },
    /// A fetch has been routed to `node` under `subscriber_id`.
    FetchAtomsSubscribe {
        address: Address,
        request_id: RequestId,
        node: Node,
        subscriber_id: SubscriberId,
    },
    /// Tear down the subscription behind a routed fetch.
    FetchAtomsUnsubscribe {
        request_id: RequestId,
    },
    AtomEvent {
        address: Address,
        request_id: RequestId,
        event: AtomEvent,
    },
    /// Caught up with no atoms in the batch.
    FetchAtomsHead {
        address: Address,
        request_id: RequestId,
    },
    FetchAtomsError {
        address: Address,
        request_id: RequestId,
        reason: String,
    },
    SubmitAtomRequest {
        atom: SignedAtom,
        subscriber_id: SubscriberId,
    },
    /// A submission has been routed to `node`.
    SubmitAtomSend {
        atom: SignedAtom,
        subscriber_id: SubscriberId,
        node: Node,
    },
    SubmitAtomStatus {
        subscriber_id: SubscriberId,
        status: SubmissionStatus,
    },
}

impl NodeAction {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            NodeAction::AddNode { .. } => "AddNode",
            NodeAction::GetNodeInfoResult { .. } => "GetNodeInfoResult",
            NodeAction::NodeStatus { .. } => "NodeStatus",
            NodeAction::DiscoverMore => "DiscoverMore",
            NodeAction::FetchAtomsRequest { .. } => "FetchAtomsRequest",
            NodeAction::FetchAtomsCancel { .. } => "FetchAtomsCancel",
            NodeAction::FetchAtomsSubscribe { .. } => "FetchAtomsSubscribe",
            NodeAction::FetchAtomsUnsubscribe { .. } => "FetchAtomsUnsubscribe",
            NodeAction::AtomEvent { .. } => "AtomEvent",
            NodeAction::FetchAtomsHead { .. } => "FetchAtomsHead",
            NodeAction::FetchAtomsError { .. } => "FetchAtomsError",
            NodeAction::SubmitAtomRequest { .. } => "SubmitAtomRequest",
            NodeAction::SubmitAtomSend { .. } => "SubmitAtomSend",
            NodeAction::SubmitAtomStatus { .. } => "SubmitAtomStatus",
        }
    }
}

/// Process-wide source of subscriber ids. Clones share the counter.
#[derive(Debug, Clone, Default)]
pub struct SubscriberIds(Arc<AtomicU64>);

impl SubscriberIds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next id; never repeats for the lifetime of the allocator.
    pub fn next(&self) -> SubscriberId {
        SubscriberId(self.0.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscriber_ids_are_monotonic_and_shared() {
        let ids = SubscriberIds::new();
        let clone = ids.clone();
        let a = ids.next();
        let b = clone.next();
        let c = ids.next();
        assert!(a < b && b < c);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!SubmissionStatus::SearchingForNode.is_terminal());
        assert!(!SubmissionStatus::Submitting.is_terminal());
        assert!(!SubmissionStatus::Submitted.is_terminal());
        assert!(SubmissionStatus::Stored.is_terminal());
        assert!(SubmissionStatus::NotStored {
            reason: "collision".into()
        }
        .is_terminal());
        assert!(SubmissionStatus::Failed {
            reason: "closed".into()
        }
        .is_terminal());
    }
}

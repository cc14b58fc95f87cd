//! Routes fetch requests to suitable nodes.

use std::collections::{BTreeMap, HashSet};

use futures::StreamExt;

use ledger_net_core::{Address, NodeAction, RequestId};

use super::{output, Emitter, Epic, EpicContext};
use crate::controller::ActionStream;

/// Turns `FetchAtomsRequest` into `FetchAtomsSubscribe` once a suitable node
/// is known, and `FetchAtomsCancel` into `FetchAtomsUnsubscribe`.
///
/// Requests with no suitable node are parked and retried whenever the node
/// table changes.
pub struct FetchEpic;

impl Epic for FetchEpic {
    fn name(&self) -> &'static str {
        "fetch"
    }

    fn epic(self: Box<Self>, ctx: EpicContext) -> ActionStream {
        let (emitter, stream) = output();
        tokio::spawn(run(ctx, emitter));
        stream
    }
}

#[derive(Default)]
struct Routing {
    parked: BTreeMap<RequestId, Address>,
    routed: HashSet<RequestId>,
}

async fn run(mut ctx: EpicContext, out: Emitter) {
    let mut routing = Routing::default();

    while let Some(action) = ctx.actions.next().await {
        match action {
            NodeAction::FetchAtomsRequest {
                address,
                request_id,
            } => {
                if routing.parked.contains_key(&request_id)
                    || routing.routed.contains(&request_id)
                {
                    continue;
                }
                if !route(&ctx, &out, &address, request_id) {
                    tracing::debug!("no node for {} yet, parking {}", address, request_id);
                    routing.parked.insert(request_id, address);
                    out.emit(NodeAction::DiscoverMore);
                    continue;
                }
                routing.routed.insert(request_id);
            }
            NodeAction::FetchAtomsCancel { request_id, .. } => {
                if routing.parked.remove(&request_id).is_some() {
                    continue;
                }
                if routing.routed.remove(&request_id) {
                    out.emit(NodeAction::FetchAtomsUnsubscribe { request_id });
                }
            }
            NodeAction::FetchAtomsError { request_id, .. } => {
                routing.routed.remove(&request_id);
            }
            NodeAction::AddNode { .. }
            | NodeAction::GetNodeInfoResult { .. }
            | NodeAction::NodeStatus { .. } => {
                if routing.parked.is_empty() {
                    continue;
                }
                let parked = std::mem::take(&mut routing.parked);
                for (request_id, address) in parked {
                    if route(&ctx, &out, &address, request_id) {
                        routing.routed.insert(request_id);
                    } else {
                        routing.parked.insert(request_id, address);
                    }
                }
            }
            _ => {}
        }
    }
}

/// Emit `FetchAtomsSubscribe` if a node can serve `address`.
fn route(ctx: &EpicContext, out: &Emitter, address: &Address, request_id: RequestId) -> bool {
    let node = ctx
        .state
        .borrow()
        .select_node(&ctx.config.universe, &[address.shard()]);
    let Some(node) = node else {
        return false;
    };
    tracing::debug!("routing {} for {} to {}", request_id, address, node);
    out.emit(NodeAction::FetchAtomsSubscribe {
        address: address.clone(),
        request_id,
        node,
        subscriber_id: ctx.subscriber_ids.next(),
    });
    true
}

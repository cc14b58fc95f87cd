//! Routes atom submissions to suitable nodes.

use std::collections::BTreeMap;

use futures::StreamExt;

use ledger_net_core::{NodeAction, Shard, SignedAtom, SubmissionStatus, SubscriberId};

use super::{output, Emitter, Epic, EpicContext};
use crate::controller::ActionStream;

/// Turns `SubmitAtomRequest` into `SubmitAtomSend` for the first node
/// serving any of the atom's shards. Parks like [`super::FetchEpic`].
pub struct SubmitEpic;

impl Epic for SubmitEpic {
    fn name(&self) -> &'static str {
        "submit"
    }

    fn epic(self: Box<Self>, ctx: EpicContext) -> ActionStream {
        let (emitter, stream) = output();
        tokio::spawn(run(ctx, emitter));
        stream
    }
}

async fn run(mut ctx: EpicContext, out: Emitter) {
    let mut parked: BTreeMap<SubscriberId, SignedAtom> = BTreeMap::new();

    while let Some(action) = ctx.actions.next().await {
        match action {
            NodeAction::SubmitAtomRequest {
                atom,
                subscriber_id,
            } => {
                out.emit(NodeAction::SubmitAtomStatus {
                    subscriber_id,
                    status: SubmissionStatus::SearchingForNode,
                });
                if let Some(atom) = route(&ctx, &out, atom, subscriber_id) {
                    tracing::debug!("no node for submission {} yet, parking", subscriber_id);
                    parked.insert(subscriber_id, atom);
                    out.emit(NodeAction::DiscoverMore);
                }
            }
            NodeAction::AddNode { .. }
            | NodeAction::GetNodeInfoResult { .. }
            | NodeAction::NodeStatus { .. } => {
                for (subscriber_id, atom) in std::mem::take(&mut parked) {
                    if let Some(atom) = route(&ctx, &out, atom, subscriber_id) {
                        parked.insert(subscriber_id, atom);
                    }
                }
            }
            _ => {}
        }
    }
}

/// Emit `SubmitAtomSend` if a node can take `atom`; otherwise hand it back.
fn route(
    ctx: &EpicContext,
    out: &Emitter,
    atom: SignedAtom,
    subscriber_id: SubscriberId,
) -> Option<SignedAtom> {
    let shards: Vec<Shard> = atom.shards.iter().copied().collect();
    let node = ctx
        .state
        .borrow()
        .select_node(&ctx.config.universe, &shards);
    match node {
        Some(node) => {
            tracing::debug!("routing submission {} ({}) to {}", subscriber_id, atom.aid, node);
            out.emit(NodeAction::SubmitAtomSend {
                atom,
                subscriber_id,
                node,
            });
            None
        }
        None => Some(atom),
    }
}

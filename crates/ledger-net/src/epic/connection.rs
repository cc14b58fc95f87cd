//! Performs the socket work for routed fetches and submissions.

use std::collections::HashMap;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use ledger_net_core::{
    Address, Node, NodeAction, RequestId, SignedAtom, SubmissionStatus, SubscriberId,
};
use ledger_net_rpc::messages::methods as wire;
use ledger_net_rpc::{methods, submission_status_from_params, AtomUpdate};

use super::{output, Emitter, Epic, EpicContext};
use crate::connection::ConnectionManager;
use crate::controller::ActionStream;

/// Reacts to `FetchAtomsSubscribe`, `FetchAtomsUnsubscribe` and
/// `SubmitAtomSend` by acquiring connections and running subscriptions.
///
/// Each routed request runs on its own task; the epic loop only tracks
/// the cancellation token of every live fetch.
pub struct ConnectionEpic;

impl Epic for ConnectionEpic {
    fn name(&self) -> &'static str {
        "connection"
    }

    fn epic(self: Box<Self>, ctx: EpicContext) -> ActionStream {
        let (emitter, stream) = output();
        tokio::spawn(run(ctx, emitter));
        stream
    }
}

async fn run(mut ctx: EpicContext, out: Emitter) {
    let mut fetches: HashMap<RequestId, (u64, CancellationToken)> = HashMap::new();
    let mut next_generation = 0u64;
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<(RequestId, u64)>();

    loop {
        tokio::select! {
            action = ctx.actions.next() => {
                let Some(action) = action else { break };
                match action {
                    NodeAction::FetchAtomsSubscribe {
                        address,
                        request_id,
                        node,
                        subscriber_id,
                    } => {
                        next_generation += 1;
                        let generation = next_generation;
                        let token = CancellationToken::new();
                        let replaced = fetches.insert(request_id, (generation, token.clone()));
                        if let Some((_, old)) = replaced {
                            old.cancel();
                        }
                        let fetch = Fetch {
                            connections: ctx.connections.clone(),
                            out: out.clone(),
                            address,
                            request_id,
                            node,
                            subscriber_id,
                        };
                        let done = done_tx.clone();
                        tokio::spawn(async move {
                            fetch.run(token).await;
                            let _ = done.send((request_id, generation));
                        });
                    }
                    NodeAction::FetchAtomsUnsubscribe { request_id } => {
                        if let Some((_, token)) = fetches.remove(&request_id) {
                            token.cancel();
                        }
                    }
                    NodeAction::SubmitAtomSend {
                        atom,
                        subscriber_id,
                        node,
                    } => {
                        tokio::spawn(submit(
                            ctx.connections.clone(),
                            out.clone(),
                            atom,
                            subscriber_id,
                            node,
                        ));
                    }
                    _ => {}
                }
            }
            Some((request_id, generation)) = done_rx.recv() => {
                if matches!(fetches.get(&request_id), Some((g, _)) if *g == generation) {
                    fetches.remove(&request_id);
                }
            }
        }
    }

    for (_, (_, token)) in fetches {
        token.cancel();
    }
}

struct Fetch {
    connections: ConnectionManager,
    out: Emitter,
    address: Address,
    request_id: RequestId,
    node: Node,
    subscriber_id: SubscriberId,
}

impl Fetch {
    async fn run(self, token: CancellationToken) {
        let conn = tokio::select! {
            _ = token.cancelled() => return,
            conn = self.connections.acquire(&self.node) => conn,
        };
        let conn = match conn {
            Ok(conn) => conn,
            Err(e) => return self.fail(e.to_string()),
        };

        let subscribe = methods::subscribe_atoms(conn.channel(), &self.address, self.subscriber_id);
        let subscription = tokio::select! {
            _ = token.cancelled() => return,
            sub = subscribe => sub,
        };
        let mut subscription = match subscription {
            Ok(subscription) => subscription,
            Err(e) => return self.fail(e.to_string()),
        };
        tracing::debug!(
            "fetching {} from {} as {}",
            self.address,
            self.node,
            self.subscriber_id
        );

        loop {
            let notification = tokio::select! {
                _ = token.cancelled() => {
                    subscription.cancel();
                    break;
                }
                notification = subscription.next() => notification,
            };
            match notification {
                Some(Ok(notification)) if notification.method == wire::ATOMS_SUBSCRIBE_UPDATE => {
                    match AtomUpdate::from_params(&notification.params) {
                        Ok(update) => self.deliver(update),
                        Err(e) => tracing::warn!(
                            "dropping bad update for {} from {}: {}",
                            self.address,
                            self.node,
                            e
                        ),
                    }
                }
                Some(Ok(notification)) => {
                    tracing::debug!(
                        "ignoring {} on fetch {}",
                        notification.method,
                        self.request_id
                    );
                }
                Some(Err(e)) => {
                    self.fail(e.to_string());
                    break;
                }
                None => {
                    self.fail("subscription ended".into());
                    break;
                }
            }
        }
        conn.release();
    }

    fn deliver(&self, update: AtomUpdate) {
        if update.events.is_empty() {
            if update.is_head {
                self.out.emit(NodeAction::FetchAtomsHead {
                    address: self.address.clone(),
                    request_id: self.request_id,
                });
            }
            return;
        }
        for event in update.events {
            self.out.emit(NodeAction::AtomEvent {
                address: self.address.clone(),
                request_id: self.request_id,
                event,
            });
        }
    }

    fn fail(&self, reason: String) {
        tracing::warn!("fetch {} for {} failed: {}", self.request_id, self.address, reason);
        self.out.emit(NodeAction::FetchAtomsError {
            address: self.address.clone(),
            request_id: self.request_id,
            reason,
        });
    }
}

async fn submit(
    connections: ConnectionManager,
    out: Emitter,
    atom: SignedAtom,
    subscriber_id: SubscriberId,
    node: Node,
) {
    let status = |status: SubmissionStatus| NodeAction::SubmitAtomStatus {
        subscriber_id,
        status,
    };
    let failed = |reason: String| {
        tracing::warn!("submission {} to {} failed: {}", subscriber_id, node, reason);
        NodeAction::SubmitAtomStatus {
            subscriber_id,
            status: SubmissionStatus::Failed { reason },
        }
    };

    let conn = match connections.acquire(&node).await {
        Ok(conn) => conn,
        Err(e) => return out.emit(failed(e.to_string())),
    };
    out.emit(status(SubmissionStatus::Submitting));

    let mut subscription = match methods::submit_atom(conn.channel(), &atom, subscriber_id).await {
        Ok(subscription) => subscription,
        Err(e) => return out.emit(failed(e.to_string())),
    };

    while let Some(notification) = subscription.next().await {
        let notification = match notification {
            Ok(notification) => notification,
            Err(e) => return out.emit(failed(e.to_string())),
        };
        if notification.method != wire::ATOMS_NEXT_STATUS_EVENT {
            continue;
        }
        match submission_status_from_params(&notification.params) {
            Ok(next) => {
                let terminal = next.is_terminal();
                out.emit(status(next));
                if terminal {
                    subscription.cancel();
                    conn.release();
                    return;
                }
            }
            Err(e) => return out.emit(failed(e.to_string())),
        }
    }
    out.emit(failed("status stream ended".into()));
}

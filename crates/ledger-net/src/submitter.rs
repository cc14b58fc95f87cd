//! Atom submission front end.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::stream::BoxStream;
use futures::{Stream, StreamExt};

use ledger_net_core::{NodeAction, SignedAtom, SubmissionStatus, SubscriberId};

use crate::controller::NetworkController;
use crate::error::Result;

/// Submits atoms through the controller.
#[derive(Clone)]
pub struct AtomSubmitter {
    controller: NetworkController,
}

impl AtomSubmitter {
    pub fn new(controller: NetworkController) -> Self {
        Self { controller }
    }

    /// Dispatch `atom` and follow its progress.
    ///
    /// The stream yields every status for this submission and ends after
    /// the first terminal one.
    pub fn submit(&self, atom: SignedAtom) -> Result<SubmissionStream> {
        // Observe before dispatching so no status can be missed.
        let observed = self.controller.observe();
        let subscriber_id = self.controller.subscriber_ids().next();
        tracing::debug!("submitting {} as {}", atom.aid, subscriber_id);
        self.controller.dispatch(NodeAction::SubmitAtomRequest {
            atom,
            subscriber_id,
        })?;

        let statuses = observed
            .filter_map(move |action| {
                let status = match action {
                    NodeAction::SubmitAtomStatus {
                        subscriber_id: id,
                        status,
                    } if id == subscriber_id => Some(status),
                    _ => None,
                };
                futures::future::ready(status)
            })
            .boxed();

        Ok(SubmissionStream {
            subscriber_id,
            statuses,
            finished: false,
        })
    }
}

/// Statuses of one submission, ending at the first terminal status.
pub struct SubmissionStream {
    subscriber_id: SubscriberId,
    statuses: BoxStream<'static, SubmissionStatus>,
    finished: bool,
}

impl SubmissionStream {
    pub fn subscriber_id(&self) -> SubscriberId {
        self.subscriber_id
    }

    /// Wait for the terminal status, skipping the intermediate ones.
    pub async fn outcome(mut self) -> Option<SubmissionStatus> {
        let mut last = None;
        while let Some(status) = self.next().await {
            last = Some(status);
        }
        last.filter(SubmissionStatus::is_terminal)
    }
}

impl Stream for SubmissionStream {
    type Item = SubmissionStatus;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match self.statuses.poll_next_unpin(cx) {
            Poll::Ready(Some(status)) => {
                if status.is_terminal() {
                    self.finished = true;
                }
                Poll::Ready(Some(status))
            }
            Poll::Ready(None) => {
                self.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

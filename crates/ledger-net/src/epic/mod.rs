//! Epics: long-lived reactions from actions to actions.
//!
//! An epic receives every action the controller processes and returns a
//! stream of new actions, which re-enter the controller inbox. Epics never
//! touch each other; they share only the state snapshot and the connection
//! pool handed to them in [`EpicContext`].

mod connection;
mod discovery;
mod fetch;
mod submit;

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;

use ledger_net_core::{NetworkState, NodeAction, SubscriberIds};

use crate::config::{NetworkConfig, SeedSource};
use crate::connection::ConnectionManager;
use crate::controller::ActionStream;

pub use connection::ConnectionEpic;
pub use discovery::DiscoveryEpic;
pub use fetch::FetchEpic;
pub use submit::SubmitEpic;

/// Everything an epic may use.
pub struct EpicContext {
    /// Every action, after it has been folded into `state`.
    pub actions: ActionStream,
    pub state: watch::Receiver<NetworkState>,
    pub connections: ConnectionManager,
    pub subscriber_ids: SubscriberIds,
    pub config: Arc<NetworkConfig>,
}

pub trait Epic: Send {
    fn name(&self) -> &'static str;

    /// Start the epic. Called once, inside a tokio runtime.
    fn epic(self: Box<Self>, ctx: EpicContext) -> ActionStream;
}

/// A group of epics acting as one: every member sees every action and the
/// outputs are merged.
pub struct Epics(Vec<Box<dyn Epic>>);

impl Epics {
    pub fn new(epics: Vec<Box<dyn Epic>>) -> Self {
        Self(epics)
    }

    /// Discovery, fetch, submit and connection epics.
    pub fn standard(seeds: SeedSource) -> Self {
        Self::new(vec![
            Box::new(DiscoveryEpic::new(seeds)),
            Box::new(FetchEpic),
            Box::new(SubmitEpic),
            Box::new(ConnectionEpic),
        ])
    }
}

impl Epic for Epics {
    fn name(&self) -> &'static str {
        "epics"
    }

    fn epic(self: Box<Self>, ctx: EpicContext) -> ActionStream {
        let EpicContext {
            mut actions,
            state,
            connections,
            subscriber_ids,
            config,
        } = ctx;

        let mut inputs = Vec::with_capacity(self.0.len());
        let mut outputs = Vec::with_capacity(self.0.len());
        for epic in self.0 {
            let (tx, rx) = mpsc::unbounded_channel();
            tracing::debug!("starting epic {}", epic.name());
            outputs.push(epic.epic(EpicContext {
                actions: UnboundedReceiverStream::new(rx).boxed(),
                state: state.clone(),
                connections: connections.clone(),
                subscriber_ids: subscriber_ids.clone(),
                config: Arc::clone(&config),
            }));
            inputs.push(tx);
        }

        tokio::spawn(async move {
            while let Some(action) = actions.next().await {
                inputs.retain(|input| input.send(action.clone()).is_ok());
            }
        });

        futures::stream::select_all(outputs).boxed()
    }
}

/// Output half of an epic: actions sent here are the epic's stream.
pub(crate) fn output() -> (Emitter, ActionStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Emitter { tx }, UnboundedReceiverStream::new(rx).boxed())
}

#[derive(Debug, Clone)]
pub(crate) struct Emitter {
    tx: mpsc::UnboundedSender<NodeAction>,
}

impl Emitter {
    pub(crate) fn emit(&self, action: NodeAction) {
        tracing::trace!("emit {}", action.name());
        let _ = self.tx.send(action);
    }
}

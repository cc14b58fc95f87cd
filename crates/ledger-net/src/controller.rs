//! The network controller: the single loop every action passes through.
//!
//! ```text
//!  dispatch ─┐                      ┌──► NetworkState (watch, replay-one)
//!            ├──► inbox ──► reduce ─┼──► root epic ──┐
//!  epics ────┘      ▲               └──► observers   │
//!                   └────────────────────────────────┘
//! ```
//!
//! Actions are folded into [`NetworkState`] before they are fanned out, so
//! an epic reacting to an action always sees a state that includes it.

use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_stream::wrappers::{UnboundedReceiverStream, WatchStream};

use ledger_net_core::{NetworkState, NodeAction, SubscriberIds};
use ledger_net_rpc::Connector;

use crate::config::NetworkConfig;
use crate::connection::ConnectionManager;
use crate::epic::{Epic, EpicContext};
use crate::error::{NetworkError, Result};

/// A stream of actions.
pub type ActionStream = BoxStream<'static, NodeAction>;

/// Cloneable entry point into the controller inbox.
#[derive(Debug, Clone)]
pub struct ActionSink {
    tx: mpsc::UnboundedSender<NodeAction>,
}

impl ActionSink {
    /// A sink and the receiving end of its inbox.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<NodeAction>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn dispatch(&self, action: NodeAction) -> Result<()> {
        self.tx
            .send(action)
            .map_err(|_| NetworkError::ControllerStopped)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

enum Control {
    Observe(mpsc::UnboundedSender<NodeAction>),
    Shutdown(oneshot::Sender<()>),
}

struct Shared {
    actions: ActionSink,
    control: mpsc::UnboundedSender<Control>,
    state: watch::Receiver<NetworkState>,
    connections: ConnectionManager,
    subscriber_ids: SubscriberIds,
    config: Arc<NetworkConfig>,
}

/// Handle to a running controller. Clones share it; the loop stops when
/// [`shutdown`](Self::shutdown) is called or the last clone is dropped.
#[derive(Clone)]
pub struct NetworkController {
    shared: Arc<Shared>,
}

impl NetworkController {
    /// Start the loop with `epic` as the root epic.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        config: NetworkConfig,
        connector: Arc<dyn Connector>,
        epic: Box<dyn Epic>,
    ) -> Self {
        let config = Arc::new(config);
        let (actions, inbox) = ActionSink::channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(NetworkState::new());
        let connections = ConnectionManager::spawn(connector, &config, actions.clone());
        let subscriber_ids = SubscriberIds::new();

        let (epic_tx, epic_rx) = mpsc::unbounded_channel();
        tracing::debug!("starting root epic {}", epic.name());
        let output = epic.epic(EpicContext {
            actions: UnboundedReceiverStream::new(epic_rx).boxed(),
            state: state_rx.clone(),
            connections: connections.clone(),
            subscriber_ids: subscriber_ids.clone(),
            config: Arc::clone(&config),
        });

        let event_loop = ControllerLoop {
            inbox: futures::stream::select(UnboundedReceiverStream::new(inbox), output).boxed(),
            control: control_rx,
            state: state_tx,
            epic: Some(epic_tx),
            observers: Vec::new(),
            connections: connections.clone(),
        };
        tokio::spawn(event_loop.run());

        Self {
            shared: Arc::new(Shared {
                actions,
                control: control_tx,
                state: state_rx,
                connections,
                subscriber_ids,
                config,
            }),
        }
    }

    pub fn dispatch(&self, action: NodeAction) -> Result<()> {
        self.shared.actions.dispatch(action)
    }

    pub fn sink(&self) -> ActionSink {
        self.shared.actions.clone()
    }

    /// The current state, then every change.
    pub fn network_state(&self) -> WatchStream<NetworkState> {
        WatchStream::new(self.shared.state.clone())
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> NetworkState {
        self.shared.state.borrow().clone()
    }

    /// Every action processed from now on, in controller order.
    pub fn observe(&self) -> ActionStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = self.shared.control.send(Control::Observe(tx));
        UnboundedReceiverStream::new(rx).boxed()
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.shared.connections
    }

    pub fn subscriber_ids(&self) -> &SubscriberIds {
        &self.shared.subscriber_ids
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.shared.config
    }

    /// Stop the loop and close every connection.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.shared.control.send(Control::Shutdown(reply)).is_ok() {
            let _ = rx.await;
        }
    }
}

struct ControllerLoop {
    inbox: ActionStream,
    control: mpsc::UnboundedReceiver<Control>,
    state: watch::Sender<NetworkState>,
    epic: Option<mpsc::UnboundedSender<NodeAction>>,
    observers: Vec<mpsc::UnboundedSender<NodeAction>>,
    connections: ConnectionManager,
}

impl ControllerLoop {
    async fn run(mut self) {
        let mut reply = None;
        loop {
            tokio::select! {
                biased;
                control = self.control.recv() => match control {
                    Some(Control::Observe(observer)) => self.observers.push(observer),
                    Some(Control::Shutdown(tx)) => {
                        reply = Some(tx);
                        break;
                    }
                    None => break,
                },
                action = self.inbox.next() => match action {
                    Some(action) => self.process(action),
                    None => break,
                },
            }
        }

        tracing::info!("network controller stopping");
        self.epic = None;
        self.observers.clear();
        self.connections.shutdown().await;
        if let Some(reply) = reply {
            let _ = reply.send(());
        }
    }

    fn process(&mut self, action: NodeAction) {
        tracing::trace!("action {}: {:?}", action.name(), action);
        self.state.send_if_modified(|state| state.apply(&action));

        if let Some(epic) = &self.epic {
            if epic.send(action.clone()).is_err() {
                tracing::debug!("root epic stopped accepting actions");
                self.epic = None;
            }
        }
        self.observers
            .retain(|observer| observer.send(action.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epic::Epics;
    use ledger_net_core::{ConnectionStatus, Node};
    use ledger_net_testkit::{node, MockNetwork};
    use std::time::Duration;

    fn idle_controller() -> NetworkController {
        NetworkController::start(
            NetworkConfig::default(),
            Arc::new(MockNetwork::new()),
            Box::new(Epics::new(Vec::new())),
        )
    }

    fn add(node: Node) -> NodeAction {
        NodeAction::AddNode { node }
    }

    #[tokio::test]
    async fn test_state_stream_replays_current_snapshot() {
        let controller = idle_controller();
        let mut observed = controller.observe();

        controller.dispatch(add(node(1))).unwrap();
        assert_eq!(observed.next().await, Some(add(node(1))));

        let mut states = controller.network_state();
        let first = states.next().await.unwrap();
        assert!(first.contains(&node(1)));

        controller
            .dispatch(NodeAction::NodeStatus {
                node: node(1),
                status: ConnectionStatus::Connected,
            })
            .unwrap();
        let next = states.next().await.unwrap();
        assert_eq!(next.get(&node(1)).unwrap().status, ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn test_observers_see_actions_in_dispatch_order() {
        let controller = idle_controller();
        let mut a = controller.observe();
        let mut b = controller.observe();

        let actions = vec![add(node(1)), NodeAction::DiscoverMore, add(node(2))];
        for action in &actions {
            controller.dispatch(action.clone()).unwrap();
        }
        for expected in &actions {
            assert_eq!(a.next().await.as_ref(), Some(expected));
            assert_eq!(b.next().await.as_ref(), Some(expected));
        }
    }

    #[tokio::test]
    async fn test_unchanged_state_is_not_republished() {
        let controller = idle_controller();
        let mut observed = controller.observe();
        let mut states = controller.network_state();
        let _ = states.next().await;

        controller.dispatch(add(node(1))).unwrap();
        controller.dispatch(add(node(1))).unwrap();
        observed.next().await;
        observed.next().await;

        assert!(states.next().await.unwrap().contains(&node(1)));
        let again = tokio::time::timeout(Duration::from_millis(50), states.next()).await;
        assert!(again.is_err(), "duplicate AddNode must not publish a new state");
    }

    #[tokio::test]
    async fn test_shutdown_ends_observers() {
        let controller = idle_controller();
        let mut observed = controller.observe();
        controller.shutdown().await;

        assert_eq!(observed.next().await, None);
        assert!(matches!(
            controller.dispatch(NodeAction::DiscoverMore),
            Err(NetworkError::ControllerStopped)
        ));
    }
}

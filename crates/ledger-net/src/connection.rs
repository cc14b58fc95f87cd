//! Connection manager: one pooled, reference-counted channel per node.
//!
//! ```text
//! acquire ──► Connecting ──► Open { refs > 0 } ──release──► Open { refs == 0, idle timer }
//!                 │                 ▲                              │            │
//!                 ▼                 └────────── acquire ───────────┘            ▼
//!               Failed                                                Closing ► Disconnected
//! ```
//!
//! The manager is an actor: every pool mutation happens on its task, so a
//! close timer and a live reference can never coexist for one entry.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use ledger_net_core::{ConnectionStatus, Node, NodeAction};
use ledger_net_rpc::{ChannelConfig, ChannelId, CloseReason, Connector, RpcChannel, RpcError};

use crate::config::NetworkConfig;
use crate::controller::ActionSink;
use crate::error::{NetworkError, Result};

enum Command {
    Acquire {
        node: Node,
        reply: oneshot::Sender<Result<ConnectionHandle>>,
    },
    Release {
        node: Node,
        id: ChannelId,
    },
    Connected {
        node: Node,
        result: std::result::Result<RpcChannel, RpcError>,
    },
    IdleExpired {
        node: Node,
        generation: u64,
    },
    ChannelClosed {
        node: Node,
        id: ChannelId,
        reason: CloseReason,
    },
    Inspect {
        reply: oneshot::Sender<BTreeMap<Node, usize>>,
    },
    Shutdown {
        reply: Option<oneshot::Sender<()>>,
    },
}

struct Shared {
    commands: mpsc::UnboundedSender<Command>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown { reply: None });
    }
}

/// Handle to the connection pool. Clones share the pool; the pool shuts
/// down when the last clone is dropped.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    /// Start the pool actor. Status changes are published through `actions`.
    pub fn spawn(
        connector: Arc<dyn Connector>,
        config: &NetworkConfig,
        actions: ActionSink,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = PoolActor {
            connector,
            idle_close_grace: config.idle_close_grace,
            connect_timeout: config.connect_timeout,
            channel_config: config.channel(),
            actions,
            commands_tx: tx.clone(),
            commands: rx,
            pool: HashMap::new(),
            next_generation: 0,
        };
        tokio::spawn(actor.run());
        Self {
            shared: Arc::new(Shared { commands: tx }),
        }
    }

    /// Get a counted reference to `node`'s channel, connecting if needed.
    pub async fn acquire(&self, node: &Node) -> Result<ConnectionHandle> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Acquire {
            node: node.clone(),
            reply,
        })?;
        rx.await.map_err(|_| NetworkError::ControllerStopped)?
    }

    /// Open nodes and their reference counts.
    pub async fn pool(&self) -> Result<BTreeMap<Node, usize>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Inspect { reply })?;
        rx.await.map_err(|_| NetworkError::ControllerStopped)
    }

    /// Close every connection and stop the pool.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self
            .send(Command::Shutdown { reply: Some(reply) })
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    fn send(&self, command: Command) -> Result<()> {
        self.shared
            .commands
            .send(command)
            .map_err(|_| NetworkError::ControllerStopped)
    }
}

/// A counted reference to one pooled channel.
///
/// Dropping the handle (or calling [`release`](Self::release)) gives the
/// reference back.
pub struct ConnectionHandle {
    node: Node,
    channel: RpcChannel,
    commands: mpsc::UnboundedSender<Command>,
    released: bool,
}

impl ConnectionHandle {
    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn channel(&self) -> &RpcChannel {
        &self.channel
    }

    pub fn id(&self) -> ChannelId {
        self.channel.id()
    }

    pub fn release(mut self) {
        self.give_back();
    }

    fn give_back(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let _ = self.commands.send(Command::Release {
            node: self.node.clone(),
            id: self.channel.id(),
        });
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.give_back();
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("node", &self.node)
            .field("id", &self.channel.id())
            .finish()
    }
}

enum Entry {
    Connecting {
        waiters: Vec<oneshot::Sender<Result<ConnectionHandle>>>,
    },
    Open {
        channel: RpcChannel,
        refs: usize,
        idle: Option<(u64, JoinHandle<()>)>,
    },
}

struct PoolActor {
    connector: Arc<dyn Connector>,
    idle_close_grace: Duration,
    connect_timeout: Duration,
    channel_config: ChannelConfig,
    actions: ActionSink,
    commands_tx: mpsc::UnboundedSender<Command>,
    commands: mpsc::UnboundedReceiver<Command>,
    pool: HashMap<Node, Entry>,
    next_generation: u64,
}

impl PoolActor {
    async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            match command {
                Command::Acquire { node, reply } => self.acquire(node, reply),
                Command::Release { node, id } => self.release(node, id),
                Command::Connected { node, result } => self.connected(node, result),
                Command::IdleExpired { node, generation } => self.idle_expired(node, generation),
                Command::ChannelClosed { node, id, reason } => {
                    self.channel_closed(node, id, reason)
                }
                Command::Inspect { reply } => {
                    let pool = self
                        .pool
                        .iter()
                        .filter_map(|(node, entry)| match entry {
                            Entry::Open { refs, .. } => Some((node.clone(), *refs)),
                            Entry::Connecting { .. } => None,
                        })
                        .collect();
                    let _ = reply.send(pool);
                }
                Command::Shutdown { reply } => {
                    self.close_all();
                    if let Some(reply) = reply {
                        let _ = reply.send(());
                    }
                    break;
                }
            }
        }
        tracing::debug!("connection manager stopped");
    }

    fn acquire(&mut self, node: Node, reply: oneshot::Sender<Result<ConnectionHandle>>) {
        match self.pool.get_mut(&node) {
            Some(Entry::Open {
                channel,
                refs,
                idle,
            }) => {
                if let Some((_, timer)) = idle.take() {
                    timer.abort();
                }
                *refs += 1;
                let handle = new_handle(&self.commands_tx, &node, channel.clone());
                // A dropped waiter hands its handle straight back via Drop.
                let _ = reply.send(Ok(handle));
            }
            Some(Entry::Connecting { waiters }) => waiters.push(reply),
            None => {
                self.pool.insert(
                    node.clone(),
                    Entry::Connecting {
                        waiters: vec![reply],
                    },
                );
                self.status(&node, ConnectionStatus::Connecting);
                self.spawn_connect(node);
            }
        }
    }

    fn spawn_connect(&self, node: Node) {
        let connector = Arc::clone(&self.connector);
        let timeout = self.connect_timeout;
        let channel_config = self.channel_config.clone();
        let tx = self.commands_tx.clone();
        tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, connector.connect(&node)).await {
                Ok(Ok(socket)) => Ok(RpcChannel::open(socket, channel_config)),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(RpcError::Timeout(format!("connecting to {}", node))),
            };
            let _ = tx.send(Command::Connected { node, result });
        });
    }

    fn connected(&mut self, node: Node, result: std::result::Result<RpcChannel, RpcError>) {
        let waiters = match self.pool.remove(&node) {
            Some(Entry::Connecting { waiters }) => waiters,
            Some(open) => {
                // Cannot happen: only one connect is in flight per node.
                self.pool.insert(node, open);
                return;
            }
            None => Vec::new(),
        };

        match result {
            Ok(channel) => {
                tracing::info!("connected to {} ({})", node, channel.id());
                self.watch_close(node.clone(), channel.clone());
                self.pool.insert(
                    node.clone(),
                    Entry::Open {
                        channel: channel.clone(),
                        refs: waiters.len(),
                        idle: None,
                    },
                );
                self.status(&node, ConnectionStatus::Connected);
                for waiter in waiters {
                    let _ = waiter.send(Ok(new_handle(&self.commands_tx, &node, channel.clone())));
                }
                if let Some(Entry::Open { refs: 0, .. }) = self.pool.get(&node) {
                    self.start_idle_timer(&node);
                }
            }
            Err(e) => {
                tracing::warn!("connecting to {} failed: {}", node, e);
                self.status(&node, ConnectionStatus::Failed);
                for waiter in waiters {
                    let _ = waiter.send(Err(NetworkError::ConnectionFailed {
                        node: node.clone(),
                        reason: e.to_string(),
                    }));
                }
            }
        }
    }

    fn release(&mut self, node: Node, id: ChannelId) {
        let start_timer = match self.pool.get_mut(&node) {
            Some(Entry::Open { channel, refs, .. }) if channel.id() == id => {
                *refs = refs.saturating_sub(1);
                *refs == 0
            }
            // Released against a connection that is already gone.
            _ => false,
        };
        if start_timer {
            self.start_idle_timer(&node);
        }
    }

    fn start_idle_timer(&mut self, node: &Node) {
        self.next_generation += 1;
        let generation = self.next_generation;
        let grace = self.idle_close_grace;
        let tx = self.commands_tx.clone();
        let timer_node = node.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = tx.send(Command::IdleExpired {
                node: timer_node,
                generation,
            });
        });

        if let Some(Entry::Open { idle, .. }) = self.pool.get_mut(node) {
            if let Some((_, old)) = idle.replace((generation, timer)) {
                old.abort();
            }
        } else {
            timer.abort();
        }
    }

    fn idle_expired(&mut self, node: Node, generation: u64) {
        let expired = matches!(
            self.pool.get(&node),
            Some(Entry::Open { refs: 0, idle: Some((g, _)), .. }) if *g == generation
        );
        if !expired {
            return;
        }
        if let Some(Entry::Open { channel, .. }) = self.pool.remove(&node) {
            tracing::info!("closing idle connection to {}", node);
            self.status(&node, ConnectionStatus::Closing);
            channel.close();
            self.status(&node, ConnectionStatus::Disconnected);
        }
    }

    fn channel_closed(&mut self, node: Node, id: ChannelId, reason: CloseReason) {
        let current = matches!(
            self.pool.get(&node),
            Some(Entry::Open { channel, .. }) if channel.id() == id
        );
        if !current {
            return;
        }
        if let Some(Entry::Open { idle, .. }) = self.pool.remove(&node) {
            if let Some((_, timer)) = idle {
                timer.abort();
            }
        }
        match reason {
            CloseReason::Local => self.status(&node, ConnectionStatus::Disconnected),
            other => {
                tracing::warn!("connection to {} lost: {:?}", node, other);
                self.status(&node, ConnectionStatus::Failed);
            }
        }
    }

    fn watch_close(&self, node: Node, channel: RpcChannel) {
        let tx = self.commands_tx.clone();
        tokio::spawn(async move {
            let reason = channel.closed().await;
            let _ = tx.send(Command::ChannelClosed {
                node,
                id: channel.id(),
                reason,
            });
        });
    }

    fn close_all(&mut self) {
        for (node, entry) in self.pool.drain() {
            match entry {
                Entry::Open { channel, idle, .. } => {
                    if let Some((_, timer)) = idle {
                        timer.abort();
                    }
                    channel.close();
                    let _ = self.actions.dispatch(NodeAction::NodeStatus {
                        node,
                        status: ConnectionStatus::Disconnected,
                    });
                }
                Entry::Connecting { waiters } => {
                    for waiter in waiters {
                        let _ = waiter.send(Err(NetworkError::ControllerStopped));
                    }
                }
            }
        }
    }

    fn status(&self, node: &Node, status: ConnectionStatus) {
        tracing::debug!("{} is {}", node, status);
        let _ = self.actions.dispatch(NodeAction::NodeStatus {
            node: node.clone(),
            status,
        });
    }
}

fn new_handle(
    commands: &mpsc::UnboundedSender<Command>,
    node: &Node,
    channel: RpcChannel,
) -> ConnectionHandle {
    ConnectionHandle {
        node: node.clone(),
        channel,
        commands: commands.clone(),
        released: false,
    }
}

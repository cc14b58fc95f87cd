//! RPC channel: one request/response + notification multiplexer per socket.
//!
//! ```text
//! RpcChannel (cloneable handle)
//! └── ChannelActor (owns the socket)
//!     ├── pending: request id    -> waiting call / subscription ack
//!     └── routes:  subscriber id -> notification sink
//! ```
//!
//! Every inbound frame is decoded once and routed by request id if it has
//! one, else by `params.subscriberId`. Frames matching neither are dropped.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use ledger_net_core::SubscriberId;

use crate::error::{Result, RpcError};
use crate::messages::{Inbound, Notification, Request, SubscribeAck};
use crate::transport::Socket;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Configuration for channel behavior.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// How long a call or subscription ack may take.
    pub call_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
        }
    }
}

/// Process-unique identity of one channel (and so of one socket).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(pub u64);

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ch{}", self.0)
    }
}

/// Why a channel stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed on request, or every handle was dropped.
    Local,
    /// The node closed the socket.
    PeerClosed,
    /// The socket failed.
    Failed(String),
}

enum Command {
    Call {
        id: String,
        method: String,
        params: Value,
        reply: oneshot::Sender<Result<Value>>,
    },
    Forget {
        id: String,
    },
    Subscribe {
        id: String,
        method: String,
        params: Value,
        subscriber_id: SubscriberId,
        sink: mpsc::UnboundedSender<Result<Notification>>,
        reply: oneshot::Sender<Result<()>>,
    },
    Unsubscribe {
        subscriber_id: SubscriberId,
        cancel_method: String,
    },
    Close,
    #[cfg(test)]
    CountPending {
        reply: oneshot::Sender<usize>,
    },
}

enum Pending {
    Call(oneshot::Sender<Result<Value>>),
    Subscribe {
        subscriber_id: SubscriberId,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Fire-and-forget requests (unsubscribes); the response is discarded.
    /// Swept once `expires` has passed.
    Ignored { expires: Instant },
}

struct Shared {
    id: ChannelId,
    commands: mpsc::UnboundedSender<Command>,
    next_request: Arc<AtomicU64>,
    closed: watch::Receiver<Option<CloseReason>>,
    config: ChannelConfig,
}

/// Handle to a channel. Clones share the same socket.
#[derive(Clone)]
pub struct RpcChannel {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for RpcChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcChannel")
            .field("id", &self.shared.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl RpcChannel {
    /// Take ownership of `socket` and start its actor task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(socket: Box<dyn Socket>, config: ChannelConfig) -> Self {
        let id = ChannelId(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed));
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(None);
        let next_request = Arc::new(AtomicU64::new(1));

        let actor = ChannelActor {
            id,
            socket,
            commands: commands_rx,
            next_request: Arc::clone(&next_request),
            pending: HashMap::new(),
            routes: HashMap::new(),
            closed: closed_tx,
            call_timeout: config.call_timeout,
        };
        tokio::spawn(actor.run());
        tracing::debug!("channel {} opened", id);

        Self {
            shared: Arc::new(Shared {
                id,
                commands: commands_tx,
                next_request,
                closed: closed_rx,
                config,
            }),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.shared.id
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.borrow().is_some()
    }

    /// Resolves once the channel has stopped.
    pub async fn closed(&self) -> CloseReason {
        let mut rx = self.shared.closed.clone();
        loop {
            if let Some(reason) = rx.borrow_and_update().clone() {
                return reason;
            }
            if rx.changed().await.is_err() {
                return CloseReason::Failed("channel task stopped".into());
            }
        }
    }

    /// Ask the actor to close the socket. Pending work fails with
    /// [`RpcError::ConnectionClosed`].
    pub fn close(&self) {
        let _ = self.shared.commands.send(Command::Close);
    }

    /// Send a request and wait for the matching response.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_request_id();
        let (reply, rx) = oneshot::channel();
        self.send(Command::Call {
            id: id.clone(),
            method: method.to_string(),
            params,
            reply,
        })?;

        let timeout = self.shared.config.call_timeout;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RpcError::ConnectionClosed),
            Err(_) => {
                let _ = self.shared.commands.send(Command::Forget { id });
                Err(RpcError::Timeout(format!("{} after {:?}", method, timeout)))
            }
        }
    }

    /// Start a subscription and wait for the node's acknowledgement.
    ///
    /// `params` must be a JSON object; `subscriberId` is added to it.
    /// Dropping or cancelling the returned [`Subscription`] sends
    /// `cancel_method` to the node.
    pub async fn subscribe(
        &self,
        method: &str,
        params: Value,
        subscriber_id: SubscriberId,
        cancel_method: &str,
    ) -> Result<Subscription> {
        let mut params = match params {
            Value::Object(map) => map,
            Value::Null => serde_json::Map::new(),
            other => {
                return Err(RpcError::Malformed(format!(
                    "subscription params must be an object, got {}",
                    other
                )))
            }
        };
        params.insert(
            "subscriberId".to_string(),
            Value::String(subscriber_id.to_string()),
        );

        let (sink, notifications) = mpsc::unbounded_channel();
        let (reply, rx) = oneshot::channel();
        let id = self.next_request_id();
        self.send(Command::Subscribe {
            id: id.clone(),
            method: method.to_string(),
            params: Value::Object(params),
            subscriber_id,
            sink,
            reply,
        })?;

        let subscription = Subscription {
            subscriber_id,
            notifications,
            commands: self.shared.commands.clone(),
            cancel_method: cancel_method.to_string(),
            active: true,
        };

        let timeout = self.shared.config.call_timeout;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(()))) => Ok(subscription),
            Ok(Ok(Err(e))) => {
                subscription.forget();
                Err(e)
            }
            Ok(Err(_)) => {
                subscription.forget();
                Err(RpcError::ConnectionClosed)
            }
            // Dropping the subscription sends the unsubscribe.
            Err(_) => {
                let _ = self.shared.commands.send(Command::Forget { id });
                Err(RpcError::Timeout(format!("{} ack after {:?}", method, timeout)))
            }
        }
    }

    #[cfg(test)]
    async fn pending_requests(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        let _ = self.send(Command::CountPending { reply });
        rx.await.unwrap_or(0)
    }

    fn next_request_id(&self) -> String {
        self.shared
            .next_request
            .fetch_add(1, Ordering::Relaxed)
            .to_string()
    }

    fn send(&self, command: Command) -> Result<()> {
        self.shared
            .commands
            .send(command)
            .map_err(|_| RpcError::ConnectionClosed)
    }
}

/// A live notification stream for one subscriber id.
///
/// Yields notifications in the order the node sent them. A failed
/// connection yields one [`RpcError::ConnectionClosed`] and then ends.
pub struct Subscription {
    subscriber_id: SubscriberId,
    notifications: mpsc::UnboundedReceiver<Result<Notification>>,
    commands: mpsc::UnboundedSender<Command>,
    cancel_method: String,
    active: bool,
}

impl Subscription {
    pub fn subscriber_id(&self) -> SubscriberId {
        self.subscriber_id
    }

    /// Stop routing notifications and send the unsubscribe request.
    pub fn cancel(mut self) {
        self.unsubscribe();
    }

    /// Drop without telling the node (the route is already gone).
    fn forget(mut self) {
        self.active = false;
    }

    fn unsubscribe(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        let _ = self.commands.send(Command::Unsubscribe {
            subscriber_id: self.subscriber_id,
            cancel_method: self.cancel_method.clone(),
        });
    }
}

impl Stream for Subscription {
    type Item = Result<Notification>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.notifications.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

struct ChannelActor {
    id: ChannelId,
    socket: Box<dyn Socket>,
    commands: mpsc::UnboundedReceiver<Command>,
    next_request: Arc<AtomicU64>,
    pending: HashMap<String, Pending>,
    routes: HashMap<SubscriberId, mpsc::UnboundedSender<Result<Notification>>>,
    closed: watch::Sender<Option<CloseReason>>,
    call_timeout: Duration,
}

impl ChannelActor {
    async fn run(mut self) {
        let reason = loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    None | Some(Command::Close) => break CloseReason::Local,
                    Some(command) => {
                        if let Err(e) = self.handle_command(command).await {
                            break CloseReason::Failed(e.to_string());
                        }
                    }
                },
                frame = self.socket.recv() => match frame {
                    Ok(Some(frame)) => self.route(&frame),
                    Ok(None) => break CloseReason::PeerClosed,
                    Err(e) => break CloseReason::Failed(e.to_string()),
                },
            }
        };
        self.shutdown(reason).await;
    }

    async fn handle_command(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Call {
                id,
                method,
                params,
                reply,
            } => {
                self.pending.insert(id.clone(), Pending::Call(reply));
                self.write(Request::new(id, method, params)).await
            }
            Command::Forget { id } => {
                self.pending.remove(&id);
                Ok(())
            }
            Command::Subscribe {
                id,
                method,
                params,
                subscriber_id,
                sink,
                reply,
            } => {
                if self.routes.contains_key(&subscriber_id) {
                    let _ = reply.send(Err(RpcError::DuplicateSubscriber(subscriber_id)));
                    return Ok(());
                }
                self.routes.insert(subscriber_id, sink);
                self.pending
                    .insert(id.clone(), Pending::Subscribe { subscriber_id, reply });
                self.write(Request::new(id, method, params)).await
            }
            Command::Unsubscribe {
                subscriber_id,
                cancel_method,
            } => {
                if self.routes.remove(&subscriber_id).is_none() {
                    return Ok(());
                }
                let now = Instant::now();
                self.pending.retain(|_, pending| {
                    !matches!(pending, Pending::Ignored { expires } if *expires <= now)
                });
                let id = self.next_request.fetch_add(1, Ordering::Relaxed).to_string();
                self.pending.insert(
                    id.clone(),
                    Pending::Ignored {
                        expires: now + self.call_timeout,
                    },
                );
                let params = serde_json::json!({ "subscriberId": subscriber_id });
                self.write(Request::new(id, cancel_method, params)).await
            }
            Command::Close => Ok(()),
            #[cfg(test)]
            Command::CountPending { reply } => {
                let _ = reply.send(self.pending.len());
                Ok(())
            }
        }
    }

    async fn write(&mut self, request: Request) -> Result<()> {
        let frame = request.encode()?;
        self.socket.send(frame).await
    }

    fn route(&mut self, frame: &str) {
        let inbound = match Inbound::decode(frame) {
            Ok(inbound) => inbound,
            Err(e) => {
                tracing::debug!("channel {}: dropping frame: {}", self.id, e);
                return;
            }
        };

        match inbound {
            Inbound::Response { id, outcome } => match self.pending.remove(&id) {
                Some(Pending::Call(reply)) => {
                    let _ = reply.send(outcome.map_err(RpcError::from));
                }
                Some(Pending::Subscribe {
                    subscriber_id,
                    reply,
                }) => {
                    let ack = subscription_ack(subscriber_id, outcome);
                    if ack.is_err() {
                        self.routes.remove(&subscriber_id);
                    }
                    let _ = reply.send(ack);
                }
                Some(Pending::Ignored { .. }) => {}
                None => {
                    tracing::debug!("channel {}: no pending request {}", self.id, id);
                }
            },
            Inbound::Notification(notification) => {
                match self.routes.get(&notification.subscriber_id) {
                    Some(sink) => {
                        let _ = sink.send(Ok(notification));
                    }
                    None => tracing::debug!(
                        "channel {}: no route for subscriber {} ({})",
                        self.id,
                        notification.subscriber_id,
                        notification.method
                    ),
                }
            }
        }
    }

    async fn shutdown(mut self, reason: CloseReason) {
        match &reason {
            CloseReason::Local => tracing::debug!("channel {} closed", self.id),
            other => tracing::info!("channel {} stopped: {:?}", self.id, other),
        }

        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Call { reply, .. } => {
                    let _ = reply.send(Err(RpcError::ConnectionClosed));
                }
                Command::Subscribe { reply, .. } => {
                    let _ = reply.send(Err(RpcError::ConnectionClosed));
                }
                _ => {}
            }
        }

        for (_, pending) in self.pending.drain() {
            match pending {
                Pending::Call(reply) => {
                    let _ = reply.send(Err(RpcError::ConnectionClosed));
                }
                Pending::Subscribe { reply, .. } => {
                    let _ = reply.send(Err(RpcError::ConnectionClosed));
                }
                Pending::Ignored { .. } => {}
            }
        }
        for (_, sink) in self.routes.drain() {
            let _ = sink.send(Err(RpcError::ConnectionClosed));
        }

        self.socket.close().await;
        let _ = self.closed.send(Some(reason));
    }
}

fn subscription_ack(
    subscriber_id: SubscriberId,
    outcome: std::result::Result<Value, crate::messages::ErrorObject>,
) -> Result<()> {
    match outcome {
        Ok(Value::Null) => Ok(()),
        Ok(result) => match serde_json::from_value::<SubscribeAck>(result) {
            Ok(ack) if ack.success => Ok(()),
            Ok(ack) => Err(RpcError::SubscriptionRejected {
                subscriber_id,
                reason: ack.message.unwrap_or_else(|| "rejected by node".into()),
            }),
            Err(e) => Err(RpcError::Malformed(format!("subscription ack: {}", e))),
        },
        Err(error) => Err(RpcError::SubscriptionRejected {
            subscriber_id,
            reason: error.message,
        }),
    }
}

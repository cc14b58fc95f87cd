//! Transport abstraction for RPC channels.
//!
//! A [`Socket`] moves whole text frames; a [`Connector`] opens sockets to
//! nodes. Implementations may use WebSockets, TCP, or anything else that
//! preserves frame boundaries.

use async_trait::async_trait;

use ledger_net_core::Node;

use crate::error::Result;

/// A bidirectional, frame-oriented connection to one node.
///
/// Owned by exactly one channel actor, hence `&mut self`.
#[async_trait]
pub trait Socket: Send {
    /// Send one frame.
    async fn send(&mut self, frame: String) -> Result<()>;

    /// Receive the next frame. `Ok(None)` means the peer closed the socket.
    ///
    /// Must be cancel-safe: the channel polls it inside `select!`.
    async fn recv(&mut self) -> Result<Option<String>>;

    /// Close the socket. Idempotent.
    async fn close(&mut self);
}

/// Opens sockets to nodes.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, node: &Node) -> Result<Box<dyn Socket>>;
}

/// In-memory sockets for testing.
///
/// Uses channels to simulate a connection between a client and a node.
pub mod memory {
    use super::*;
    use crate::error::RpcError;
    use tokio::sync::mpsc;

    /// One end of an in-memory connection.
    pub struct MemorySocket {
        tx: Option<mpsc::UnboundedSender<String>>,
        rx: mpsc::UnboundedReceiver<String>,
    }

    /// Create two connected sockets.
    pub fn pair() -> (MemorySocket, MemorySocket) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            MemorySocket {
                tx: Some(a_tx),
                rx: a_rx,
            },
            MemorySocket {
                tx: Some(b_tx),
                rx: b_rx,
            },
        )
    }

    #[async_trait]
    impl Socket for MemorySocket {
        async fn send(&mut self, frame: String) -> Result<()> {
            let tx = self.tx.as_ref().ok_or(RpcError::ConnectionClosed)?;
            tx.send(frame)
                .map_err(|_| RpcError::Transport("peer disconnected".into()))
        }

        async fn recv(&mut self) -> Result<Option<String>> {
            Ok(self.rx.recv().await)
        }

        async fn close(&mut self) {
            self.tx = None;
            self.rx.close();
        }
    }
}

/// Newline-delimited JSON over plain TCP.
pub mod tcp {
    use super::*;
    use crate::error::RpcError;
    use futures::{SinkExt, StreamExt};
    use std::time::Duration;
    use tokio::net::TcpStream;
    use tokio_util::codec::{Framed, LinesCodec};

    /// Frames larger than this are treated as a transport error.
    pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

    pub struct TcpSocket {
        framed: Framed<TcpStream, LinesCodec>,
        closed: bool,
    }

    impl TcpSocket {
        pub fn new(stream: TcpStream) -> Self {
            Self {
                framed: Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_LENGTH)),
                closed: false,
            }
        }
    }

    #[async_trait]
    impl Socket for TcpSocket {
        async fn send(&mut self, frame: String) -> Result<()> {
            if self.closed {
                return Err(RpcError::ConnectionClosed);
            }
            self.framed
                .send(frame)
                .await
                .map_err(|e| RpcError::Transport(e.to_string()))
        }

        async fn recv(&mut self) -> Result<Option<String>> {
            match self.framed.next().await {
                Some(Ok(line)) => Ok(Some(line)),
                Some(Err(e)) => Err(RpcError::Transport(e.to_string())),
                None => Ok(None),
            }
        }

        async fn close(&mut self) {
            if self.closed {
                return;
            }
            self.closed = true;
            if let Err(e) = SinkExt::<String>::close(&mut self.framed).await {
                tracing::debug!("error closing tcp socket: {}", e);
            }
        }
    }

    /// Connects to `host:port` over TCP. TLS nodes are rejected.
    #[derive(Debug, Clone)]
    pub struct TcpConnector {
        connect_timeout: Duration,
    }

    impl TcpConnector {
        pub fn new(connect_timeout: Duration) -> Self {
            Self { connect_timeout }
        }
    }

    impl Default for TcpConnector {
        fn default() -> Self {
            Self::new(Duration::from_secs(10))
        }
    }

    #[async_trait]
    impl Connector for TcpConnector {
        async fn connect(&self, node: &Node) -> Result<Box<dyn Socket>> {
            if node.tls {
                return Err(RpcError::Unsupported(format!(
                    "{} requires TLS; supply a TLS-capable connector",
                    node
                )));
            }
            let addr = node.socket_addr();
            let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr))
                .await
                .map_err(|_| RpcError::Timeout(format!("connecting to {}", addr)))??;
            stream.set_nodelay(true)?;
            Ok(Box::new(TcpSocket::new(stream)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory;
    use super::*;

    #[tokio::test]
    async fn test_memory_socket_send_recv() {
        let (mut client, mut server) = memory::pair();

        client.send("ping".into()).await.unwrap();
        assert_eq!(server.recv().await.unwrap(), Some("ping".to_string()));

        server.send("pong".into()).await.unwrap();
        assert_eq!(client.recv().await.unwrap(), Some("pong".to_string()));
    }

    #[tokio::test]
    async fn test_memory_socket_close_is_seen_by_peer() {
        let (mut client, mut server) = memory::pair();

        server.close().await;
        assert_eq!(client.recv().await.unwrap(), None);
        assert!(client.send("late".into()).await.is_err());
    }

    #[tokio::test]
    async fn test_tcp_connector_rejects_tls_nodes() {
        let connector = tcp::TcpConnector::default();
        let node = Node::new("127.0.0.1", 1, true);
        assert!(matches!(
            connector.connect(&node).await,
            Err(crate::RpcError::Unsupported(_))
        ));
    }
}

//! The ledger client: one handle over the controller and its front ends.

use std::sync::Arc;

use tokio_stream::wrappers::WatchStream;

use ledger_net_core::{Address, NetworkState, SignedAtom};
use ledger_net_rpc::{Connector, TcpConnector};

use crate::config::ClientConfig;
use crate::controller::NetworkController;
use crate::epic::Epics;
use crate::error::Result;
use crate::puller::{AtomEventStream, AtomPuller, PullHandle};
use crate::submitter::{AtomSubmitter, SubmissionStream};

/// A running network client.
///
/// Owns a [`NetworkController`] driving the standard epics (discovery,
/// fetch, submit, connection) and exposes:
/// - deduplicated atom fetches through [`pull`](Self::pull) and
///   [`subscribe`](Self::subscribe)
/// - atom submission through [`submit`](Self::submit)
/// - the live node table through [`network_state`](Self::network_state)
///
/// Cloning is cheap; every clone drives the same controller.
#[derive(Clone)]
pub struct LedgerClient {
    controller: NetworkController,
    puller: AtomPuller,
    submitter: AtomSubmitter,
}

impl LedgerClient {
    /// Start a client over `connector`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: ClientConfig, connector: Arc<dyn Connector>) -> Self {
        tracing::info!("starting ledger client for universe {}", config.network.universe);
        let controller = NetworkController::start(
            config.network,
            connector,
            Box::new(Epics::standard(config.seeds)),
        );
        Self {
            puller: AtomPuller::new(controller.clone()),
            submitter: AtomSubmitter::new(controller.clone()),
            controller,
        }
    }

    /// Start a client speaking newline-delimited JSON over plain TCP.
    pub fn connect_tcp(config: ClientConfig) -> Self {
        let connector = TcpConnector::new(config.network.connect_timeout);
        Self::start(config, Arc::new(connector))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Fetch
    // ─────────────────────────────────────────────────────────────────────────

    /// Keep atoms for `address` flowing until the handle is dropped.
    pub fn pull(&self, address: &Address) -> PullHandle {
        self.puller.pull(address)
    }

    /// Fetch updates for `address`, starting with everything already
    /// delivered to earlier subscribers.
    pub fn subscribe(&self, address: &Address) -> AtomEventStream {
        self.puller.subscribe(address)
    }

    /// Cancel every fetch started through this client.
    pub fn unsubscribe_all(&self) {
        self.puller.unsubscribe_all();
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Submit
    // ─────────────────────────────────────────────────────────────────────────

    pub fn submit(&self, atom: SignedAtom) -> Result<SubmissionStream> {
        self.submitter.submit(atom)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Network
    // ─────────────────────────────────────────────────────────────────────────

    /// The current node table, then every change to it.
    pub fn network_state(&self) -> WatchStream<NetworkState> {
        self.controller.network_state()
    }

    pub fn state(&self) -> NetworkState {
        self.controller.state()
    }

    pub fn controller(&self) -> &NetworkController {
        &self.controller
    }

    /// Cancel all fetches, stop the controller and close every connection.
    pub async fn shutdown(&self) {
        self.puller.unsubscribe_all();
        self.controller.shutdown().await;
    }
}

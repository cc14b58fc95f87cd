//! Atom puller: deduplicated, reference-counted fetches per address.
//!
//! Many callers may pull the same address; only the first dispatches a
//! `FetchAtomsRequest` and only the last one to let go dispatches the
//! matching `FetchAtomsCancel`. Everything a fetch has delivered is kept
//! with its cache entry and replayed to subscribers that join late.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};

use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use ledger_net_core::{Address, AtomEvent, NodeAction, RequestId};

use crate::controller::NetworkController;

/// One item of a subscription stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchUpdate {
    Event(AtomEvent),
    /// The node caught up without sending an atom in that batch.
    Head,
}

impl FetchUpdate {
    /// True once everything after this update is live.
    pub fn is_head(&self) -> bool {
        match self {
            FetchUpdate::Event(event) => event.is_head,
            FetchUpdate::Head => true,
        }
    }

    pub fn event(&self) -> Option<&AtomEvent> {
        match self {
            FetchUpdate::Event(event) => Some(event),
            FetchUpdate::Head => None,
        }
    }
}

struct CacheEntry {
    request_id: RequestId,
    refs: usize,
    delivered: Vec<FetchUpdate>,
    subscribers: Vec<mpsc::UnboundedSender<FetchUpdate>>,
}

impl CacheEntry {
    fn push(&mut self, update: FetchUpdate) {
        self.subscribers.retain(|tx| tx.send(update.clone()).is_ok());
        self.delivered.push(update);
    }
}

type Cache = HashMap<Address, CacheEntry>;

struct Inner {
    controller: NetworkController,
    cache: Mutex<Cache>,
    next_request: AtomicU64,
}

impl Inner {
    fn cache(&self) -> MutexGuard<'_, Cache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take a reference on `address`, dispatching a request if it is new.
    fn join(&self, cache: &mut Cache, address: &Address) -> RequestId {
        if let Some(entry) = cache.get_mut(address) {
            entry.refs += 1;
            return entry.request_id;
        }
        let request_id = RequestId(self.next_request.fetch_add(1, Ordering::Relaxed));
        cache.insert(
            address.clone(),
            CacheEntry {
                request_id,
                refs: 1,
                delivered: Vec::new(),
                subscribers: Vec::new(),
            },
        );
        // Dispatched under the lock so a racing cancel cannot overtake it.
        let _ = self.controller.dispatch(NodeAction::FetchAtomsRequest {
            address: address.clone(),
            request_id,
        });
        request_id
    }

    fn release(&self, address: &Address, request_id: RequestId) {
        let mut cache = self.cache();
        let last = match cache.get_mut(address) {
            Some(entry) if entry.request_id == request_id => {
                entry.refs -= 1;
                entry.refs == 0
            }
            // The entry was dropped by an error or replaced by a newer pull.
            _ => false,
        };
        if last {
            cache.remove(address);
            self.cancel(address, request_id);
        }
    }

    fn cancel(&self, address: &Address, request_id: RequestId) {
        let _ = self.controller.dispatch(NodeAction::FetchAtomsCancel {
            address: address.clone(),
            request_id,
        });
    }

    /// Route one observed action to the entry it belongs to.
    fn record(&self, action: NodeAction) {
        let (address, request_id, update) = match action {
            NodeAction::AtomEvent {
                address,
                request_id,
                event,
            } => (address, request_id, Some(FetchUpdate::Event(event))),
            NodeAction::FetchAtomsHead {
                address,
                request_id,
            } => (address, request_id, Some(FetchUpdate::Head)),
            NodeAction::FetchAtomsError {
                address,
                request_id,
                ..
            } => (address, request_id, None),
            _ => return,
        };

        let mut cache = self.cache();
        let Some(entry) = cache.get_mut(&address) else {
            return;
        };
        if entry.request_id != request_id {
            return;
        }
        match update {
            Some(update) => entry.push(update),
            // A failed fetch leaves the cache without a cancel: there is
            // nothing left to tear down. Dropping the entry ends its streams.
            None => {
                tracing::debug!(
                    "fetch {} for {} failed, dropping cache entry",
                    request_id,
                    address
                );
                cache.remove(&address);
            }
        }
    }
}

/// Deduplicating front end for atom fetches.
#[derive(Clone)]
pub struct AtomPuller {
    inner: Arc<Inner>,
}

impl AtomPuller {
    /// Must be called from within a tokio runtime.
    pub fn new(controller: NetworkController) -> Self {
        let observed = controller.observe();
        let inner = Arc::new(Inner {
            controller,
            cache: Mutex::new(HashMap::new()),
            next_request: AtomicU64::new(1),
        });
        tokio::spawn(follow(observed, Arc::downgrade(&inner)));
        Self { inner }
    }

    /// Start (or join) the fetch for `address`.
    pub fn pull(&self, address: &Address) -> PullHandle {
        let request_id = self.inner.join(&mut self.inner.cache(), address);
        self.handle(address, request_id)
    }

    /// Updates for `address`: everything the fetch has delivered so far,
    /// then live updates. The stream holds a pull for as long as it exists
    /// and ends when the fetch fails or is cancelled by
    /// [`unsubscribe_all`](Self::unsubscribe_all).
    pub fn subscribe(&self, address: &Address) -> AtomEventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let request_id = {
            let mut cache = self.inner.cache();
            let request_id = self.inner.join(&mut cache, address);
            if let Some(entry) = cache.get_mut(address) {
                for update in &entry.delivered {
                    let _ = tx.send(update.clone());
                }
                entry.subscribers.push(tx);
            }
            request_id
        };
        AtomEventStream {
            updates: UnboundedReceiverStream::new(rx),
            _pull: self.handle(address, request_id),
        }
    }

    /// Cancel every fetch, regardless of outstanding handles. Open
    /// subscription streams end.
    pub fn unsubscribe_all(&self) {
        let mut cache = self.inner.cache();
        for (address, entry) in cache.drain() {
            self.inner.cancel(&address, entry.request_id);
        }
    }

    /// Number of addresses with a live fetch.
    pub fn active(&self) -> usize {
        self.inner.cache().len()
    }

    fn handle(&self, address: &Address, request_id: RequestId) -> PullHandle {
        PullHandle {
            address: address.clone(),
            request_id,
            inner: Arc::clone(&self.inner),
            active: true,
        }
    }
}

async fn follow(mut actions: BoxStream<'static, NodeAction>, inner: Weak<Inner>) {
    while let Some(action) = actions.next().await {
        match inner.upgrade() {
            Some(inner) => inner.record(action),
            None => break,
        }
    }
}

/// One reference to a pulled address. Dropping it releases the reference.
pub struct PullHandle {
    address: Address,
    request_id: RequestId,
    inner: Arc<Inner>,
    active: bool,
}

impl PullHandle {
    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn cancel(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if std::mem::replace(&mut self.active, false) {
            self.inner.release(&self.address, self.request_id);
        }
    }
}

impl Drop for PullHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for PullHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PullHandle")
            .field("address", &self.address)
            .field("request_id", &self.request_id)
            .finish()
    }
}

/// Fetch updates for one address, in delivery order.
pub struct AtomEventStream {
    updates: UnboundedReceiverStream<FetchUpdate>,
    _pull: PullHandle,
}

impl Stream for AtomEventStream {
    type Item = FetchUpdate;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.updates.poll_next_unpin(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkConfig;
    use crate::epic::Epics;
    use ledger_net_testkit::MockNetwork;
    use std::time::Duration;

    fn controller() -> NetworkController {
        NetworkController::start(
            NetworkConfig::default(),
            Arc::new(MockNetwork::new()),
            Box::new(Epics::new(Vec::new())),
        )
    }

    async fn drain(actions: &mut BoxStream<'static, NodeAction>) -> Vec<NodeAction> {
        let mut out = Vec::new();
        while let Ok(Some(action)) =
            tokio::time::timeout(Duration::from_millis(100), actions.next()).await
        {
            out.push(action);
        }
        out
    }

    #[tokio::test]
    async fn test_pull_then_cancel_dispatches_request_and_cancel_only() {
        let controller = controller();
        let mut observed = controller.observe();
        let puller = AtomPuller::new(controller);
        let address = Address::from_bytes(b"alice".to_vec());

        let handle = puller.pull(&address);
        let request_id = handle.request_id();
        handle.cancel();

        assert_eq!(
            drain(&mut observed).await,
            vec![
                NodeAction::FetchAtomsRequest {
                    address: address.clone(),
                    request_id
                },
                NodeAction::FetchAtomsCancel {
                    address,
                    request_id
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_concurrent_pulls_share_one_request() {
        let controller = controller();
        let mut observed = controller.observe();
        let puller = AtomPuller::new(controller);
        let address = Address::from_bytes(b"bob".to_vec());

        let first = puller.pull(&address);
        let second = puller.pull(&address);
        assert_eq!(first.request_id(), second.request_id());

        drop(first);
        assert_eq!(drain(&mut observed).await.len(), 1);
        assert_eq!(puller.active(), 1);

        drop(second);
        assert!(matches!(
            drain(&mut observed).await.as_slice(),
            [NodeAction::FetchAtomsCancel { .. }]
        ));
        assert_eq!(puller.active(), 0);
    }

    #[tokio::test]
    async fn test_fetch_error_forgets_entry_without_cancel() {
        let controller = controller();
        let mut observed = controller.observe();
        let puller = AtomPuller::new(controller.clone());
        let address = Address::from_bytes(b"carol".to_vec());

        let handle = puller.pull(&address);
        controller
            .dispatch(NodeAction::FetchAtomsError {
                address: address.clone(),
                request_id: handle.request_id(),
                reason: "gone".into(),
            })
            .unwrap();
        drain(&mut observed).await;
        assert_eq!(puller.active(), 0);

        // A new pull starts a fresh request; the stale handle is inert.
        let fresh = puller.pull(&address);
        assert_ne!(fresh.request_id(), handle.request_id());
        drop(handle);
        let after = drain(&mut observed).await;
        assert!(matches!(after.as_slice(), [NodeAction::FetchAtomsRequest { .. }]));
    }

    #[tokio::test]
    async fn test_unsubscribe_all_cancels_every_address() {
        let controller = controller();
        let mut observed = controller.observe();
        let puller = AtomPuller::new(controller);
        let a = Address::from_bytes(b"a".to_vec());
        let b = Address::from_bytes(b"b".to_vec());

        let _ha = puller.pull(&a);
        let _hb = puller.pull(&b);
        puller.unsubscribe_all();

        let actions = drain(&mut observed).await;
        let cancels = actions
            .iter()
            .filter(|a| matches!(a, NodeAction::FetchAtomsCancel { .. }))
            .count();
        assert_eq!(cancels, 2);
        assert_eq!(puller.active(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_filters_events_for_its_address() {
        let controller = controller();
        let puller = AtomPuller::new(controller.clone());
        let address = Address::from_bytes(b"dora".to_vec());
        let other = Address::from_bytes(b"eve".to_vec());

        let mut events = puller.subscribe(&address);
        let request_id = RequestId(1);
        let atom = ledger_net_testkit::atom_for(&address, b"x");
        let event = AtomEvent {
            atom: atom.clone(),
            kind: ledger_net_core::AtomEventKind::Store,
            is_head: true,
        };

        controller
            .dispatch(NodeAction::AtomEvent {
                address: other,
                request_id: RequestId(99),
                event: event.clone(),
            })
            .unwrap();
        controller
            .dispatch(NodeAction::AtomEvent {
                address: address.clone(),
                request_id,
                event: event.clone(),
            })
            .unwrap();
        controller
            .dispatch(NodeAction::FetchAtomsError {
                address,
                request_id,
                reason: "lost".into(),
            })
            .unwrap();

        assert_eq!(events.next().await, Some(FetchUpdate::Event(event)));
        assert_eq!(events.next().await, None);
    }

    fn stored(address: &Address, payload: &[u8], is_head: bool) -> AtomEvent {
        AtomEvent {
            atom: ledger_net_testkit::atom_for(address, payload),
            kind: ledger_net_core::AtomEventKind::Store,
            is_head,
        }
    }

    #[tokio::test]
    async fn test_late_subscriber_replays_delivered_updates() {
        let controller = controller();
        let puller = AtomPuller::new(controller.clone());
        let address = Address::from_bytes(b"fay".to_vec());
        let request_id = RequestId(1);
        let old = stored(&address, b"old", false);

        let mut first = puller.subscribe(&address);
        for action in [
            NodeAction::AtomEvent {
                address: address.clone(),
                request_id,
                event: old.clone(),
            },
            NodeAction::FetchAtomsHead {
                address: address.clone(),
                request_id,
            },
        ] {
            controller.dispatch(action).unwrap();
        }
        assert_eq!(first.next().await, Some(FetchUpdate::Event(old.clone())));
        assert_eq!(first.next().await, Some(FetchUpdate::Head));

        let mut second = puller.subscribe(&address);
        assert_eq!(second.next().await, Some(FetchUpdate::Event(old)));
        let head = second.next().await.unwrap();
        assert!(head.is_head() && head.event().is_none());

        let live = stored(&address, b"live", false);
        controller
            .dispatch(NodeAction::AtomEvent {
                address: address.clone(),
                request_id,
                event: live.clone(),
            })
            .unwrap();
        assert_eq!(first.next().await, Some(FetchUpdate::Event(live.clone())));
        assert_eq!(second.next().await, Some(FetchUpdate::Event(live)));
        assert_eq!(puller.active(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_all_ends_open_streams() {
        let controller = controller();
        let puller = AtomPuller::new(controller);
        let mut a = puller.subscribe(&Address::from_bytes(b"gus".to_vec()));
        let mut b = puller.subscribe(&Address::from_bytes(b"hal".to_vec()));

        puller.unsubscribe_all();
        let ended = tokio::time::timeout(Duration::from_secs(1), async {
            (a.next().await, b.next().await)
        })
        .await;
        assert_eq!(ended.ok(), Some((None, None)));
    }

    mod prop {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(32))]

            /// Every run of overlapping pulls costs one request and one cancel.
            #[test]
            fn request_and_cancel_bracket_each_run(
                ops in proptest::collection::vec(any::<bool>(), 1..24),
            ) {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .start_paused(true)
                    .build()
                    .unwrap();
                let (requests, cancels, runs) = runtime.block_on(async {
                    let controller = controller();
                    let mut observed = controller.observe();
                    let puller = AtomPuller::new(controller);
                    let address = Address::from_bytes(b"prop".to_vec());

                    let mut handles = Vec::new();
                    let mut runs = 0;
                    for pull in ops {
                        if pull {
                            if handles.is_empty() {
                                runs += 1;
                            }
                            handles.push(puller.pull(&address));
                        } else {
                            handles.pop();
                        }
                    }
                    handles.clear();

                    let actions = drain(&mut observed).await;
                    let count = |name: &str| actions.iter().filter(|a| a.name() == name).count();
                    (count("FetchAtomsRequest"), count("FetchAtomsCancel"), runs)
                });
                prop_assert_eq!(requests, runs);
                prop_assert_eq!(cancels, runs);
            }
        }
    }
}

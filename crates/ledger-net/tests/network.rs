//! End-to-end tests: a full client against an in-process mock network.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;

use ledger_net::{
    Address, AtomEvent, AtomEventKind, ClientConfig, ConnectionStatus, FetchUpdate, LedgerClient,
    NodeAction, SeedSource, SignedAtom, SubmissionStatus,
};
use ledger_net_testkit::{atom_for, init_tracing, node, MockNetwork, MockNodeConfig, UNIVERSE};

const WAIT: Duration = Duration::from_secs(5);

fn client(network: &MockNetwork) -> LedgerClient {
    init_tracing();
    let config = ClientConfig::new(UNIVERSE, SeedSource::Fixed(vec![node(1)]));
    LedgerClient::start(config, Arc::new(network.clone()))
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    let polled = tokio::time::timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {}", what);
}

async fn next<S: futures::Stream + Unpin>(stream: &mut S) -> Option<S::Item> {
    match tokio::time::timeout(WAIT, stream.next()).await {
        Ok(item) => item,
        Err(_) => panic!("stream stalled"),
    }
}

async fn next_event<S: futures::Stream<Item = FetchUpdate> + Unpin>(stream: &mut S) -> AtomEvent {
    match next(stream).await {
        Some(FetchUpdate::Event(event)) => event,
        other => panic!("expected an atom event, got {:?}", other),
    }
}

#[tokio::test]
async fn test_fetch_delivers_backlog_then_live_atoms() {
    let alice = Address::from_bytes(b"alice".to_vec());
    let backlog = vec![atom_for(&alice, b"one"), atom_for(&alice, b"two")];
    let network = MockNetwork::new();
    network.add_node(
        node(1),
        MockNodeConfig::default().with_atoms(alice.clone(), backlog.clone()),
    );
    let client = client(&network);

    let mut events = client.subscribe(&alice);
    let first = next_event(&mut events).await;
    let second = next_event(&mut events).await;
    assert_eq!((first.atom, first.is_head), (backlog[0].clone(), false));
    assert_eq!((second.atom, second.is_head), (backlog[1].clone(), true));
    assert_eq!(second.kind, AtomEventKind::Store);

    let live = atom_for(&alice, b"three");
    assert_eq!(network.push_atom(&alice, &live), 1);
    let third = next_event(&mut events).await;
    assert_eq!(third.atom, live);
    assert!(!third.is_head);

    drop(events);
    eventually("subscription cancelled", || network.subscriptions(&node(1)) == 0).await;
    assert_eq!(network.requests_for("atoms.cancel").len(), 1);
}

#[tokio::test]
async fn test_fetch_routes_only_to_nodes_serving_the_shard() {
    let bob = Address::from_bytes(b"bob".to_vec());
    let shard = bob.shard();
    let network = MockNetwork::new();
    let elsewhere = ledger_net::ShardSpace::new(shard.0.wrapping_add(1), shard.0.wrapping_add(1))
        .unwrap();
    network.add_node(
        node(1),
        MockNodeConfig::default()
            .with_space(elsewhere)
            .with_peers([node(2)]),
    );
    network.add_node(
        node(2),
        MockNodeConfig::default()
            .with_space(ledger_net_testkit::space_of(shard))
            .with_atoms(bob.clone(), vec![atom_for(&bob, b"hello")]),
    );
    let client = client(&network);

    // node(2) is only known through node(1)'s peer list.
    let mut events = client.subscribe(&bob);
    let event = next_event(&mut events).await;
    assert_eq!(event.atom, atom_for(&bob, b"hello"));

    let subscribed: Vec<_> = network
        .requests_for("atoms.subscribe")
        .into_iter()
        .map(|r| r.node)
        .collect();
    assert_eq!(subscribed, vec![node(2)]);
}

#[tokio::test]
async fn test_submission_reports_every_status() {
    let network = MockNetwork::new();
    network.add_node(node(1), MockNodeConfig::default());
    let client = client(&network);
    let atom = SignedAtom::new(b"pay".to_vec(), [ledger_net::Shard(7)]).unwrap();

    let statuses: Vec<_> = client.submit(atom).unwrap().collect().await;
    assert_eq!(
        statuses,
        vec![
            SubmissionStatus::SearchingForNode,
            SubmissionStatus::Submitting,
            SubmissionStatus::Submitted,
            SubmissionStatus::Stored,
        ]
    );
}

#[tokio::test]
async fn test_refused_submission_ends_not_stored() {
    let network = MockNetwork::new();
    network.add_node(
        node(1),
        MockNodeConfig::default()
            .with_statuses(&[("SUBMITTED", None), ("COLLISION", Some("double spend"))]),
    );
    let client = client(&network);
    let atom = SignedAtom::new(b"pay".to_vec(), [ledger_net::Shard(7)]).unwrap();

    let outcome = client.submit(atom).unwrap().outcome().await;
    assert_eq!(
        outcome,
        Some(SubmissionStatus::NotStored {
            reason: "COLLISION: double spend".into()
        })
    );
}

#[tokio::test]
async fn test_rejected_submission_fails() {
    let network = MockNetwork::new();
    let mut config = MockNodeConfig::default();
    config.reject_subscriptions = true;
    network.add_node(node(1), config);
    let client = client(&network);
    let atom = SignedAtom::new(b"pay".to_vec(), [ledger_net::Shard(7)]).unwrap();

    let outcome = client.submit(atom).unwrap().outcome().await;
    assert!(matches!(outcome, Some(SubmissionStatus::Failed { .. })));
}

#[tokio::test]
async fn test_fetches_share_one_connection_per_node() {
    let network = MockNetwork::new();
    network.add_node(node(1), MockNodeConfig::default());
    let client = client(&network);

    let a = client.pull(&Address::from_bytes(b"a".to_vec()));
    let b = client.pull(&Address::from_bytes(b"b".to_vec()));
    let again = client.pull(a.address());
    eventually("two subscriptions", || network.subscriptions(&node(1)) == 2).await;

    assert_eq!(network.connects(&node(1)), 1);
    assert_eq!(network.requests_for("atoms.subscribe").len(), 2);
    drop((a, b, again));
}

#[tokio::test]
async fn test_node_failure_ends_the_event_stream() {
    let carol = Address::from_bytes(b"carol".to_vec());
    let network = MockNetwork::new();
    network.add_node(node(1), MockNodeConfig::default());
    let client = client(&network);
    let mut states = client.network_state();

    let mut events = client.subscribe(&carol);
    eventually("subscription", || network.subscriptions(&node(1)) == 1).await;

    assert_eq!(next(&mut events).await, Some(FetchUpdate::Head));

    network.fail_node(&node(1));
    assert_eq!(next(&mut events).await, None);

    while let Some(state) = next(&mut states).await {
        if state.get(&node(1)).map(|s| s.status) == Some(ConnectionStatus::Failed) {
            break;
        }
    }
}

#[tokio::test]
async fn test_unsubscribe_all_cancels_server_subscriptions() {
    let network = MockNetwork::new();
    network.add_node(node(1), MockNodeConfig::default());
    let client = client(&network);

    let _a = client.pull(&Address::from_bytes(b"a".to_vec()));
    let mut b = client.subscribe(&Address::from_bytes(b"b".to_vec()));
    eventually("two subscriptions", || network.subscriptions(&node(1)) == 2).await;

    client.unsubscribe_all();
    eventually("cancelled", || network.subscriptions(&node(1)) == 0).await;
    assert_eq!(network.requests_for("atoms.cancel").len(), 2);

    // Whatever was buffered drains, then the stream ends.
    while let Some(update) = next(&mut b).await {
        assert_eq!(update, FetchUpdate::Head);
    }
}

#[tokio::test]
async fn test_second_subscriber_replays_backlog_and_head() {
    let gina = Address::from_bytes(b"gina".to_vec());
    let backlog = vec![atom_for(&gina, b"one"), atom_for(&gina, b"two")];
    let network = MockNetwork::new();
    network.add_node(
        node(1),
        MockNodeConfig::default().with_atoms(gina.clone(), backlog.clone()),
    );
    let client = client(&network);

    let mut first = client.subscribe(&gina);
    next_event(&mut first).await;
    assert!(next_event(&mut first).await.is_head);

    let mut second = client.subscribe(&gina);
    let replayed = (next_event(&mut second).await, next_event(&mut second).await);
    assert_eq!((replayed.0.atom, replayed.0.is_head), (backlog[0].clone(), false));
    assert_eq!((replayed.1.atom, replayed.1.is_head), (backlog[1].clone(), true));
    assert_eq!(network.requests_for("atoms.subscribe").len(), 1);

    let live = atom_for(&gina, b"three");
    network.push_atom(&gina, &live);
    assert_eq!(next_event(&mut first).await.atom, live);
    assert_eq!(next_event(&mut second).await.atom, live);
}

#[tokio::test]
async fn test_empty_address_reports_head() {
    let hank = Address::from_bytes(b"hank".to_vec());
    let network = MockNetwork::new();
    network.add_node(node(1), MockNodeConfig::default());
    let client = client(&network);

    let mut events = client.subscribe(&hank);
    let update = next(&mut events).await.unwrap();
    assert!(update.is_head());
    assert_eq!(update.event(), None);

    let mut late = client.subscribe(&hank);
    assert_eq!(next(&mut late).await, Some(FetchUpdate::Head));
}

#[tokio::test(start_paused = true)]
async fn test_network_goes_quiet_and_idle_connection_closes() {
    let dave = Address::from_bytes(b"dave".to_vec());
    let network = MockNetwork::new();
    network.add_node(
        node(1),
        MockNodeConfig::default().with_atoms(dave.clone(), vec![atom_for(&dave, b"x")]),
    );
    let client = client(&network);

    let mut events = client.subscribe(&dave);
    assert!(next(&mut events).await.unwrap().is_head());

    let mut observed = client.controller().observe();
    let stray = tokio::time::timeout(Duration::from_secs(60), observed.next()).await;
    assert!(stray.is_err(), "steady state emitted {:?}", stray);

    drop(events);
    let mut names = Vec::new();
    let minute = Duration::from_secs(60);
    while let Ok(Some(action)) = tokio::time::timeout(minute, observed.next()).await {
        if let NodeAction::NodeStatus { status, .. } = &action {
            names.push(format!("NodeStatus({})", status));
        } else {
            names.push(action.name().to_string());
        }
    }
    assert_eq!(
        names,
        vec![
            "FetchAtomsCancel".to_string(),
            "FetchAtomsUnsubscribe".to_string(),
            format!("NodeStatus({})", ConnectionStatus::Closing),
            format!("NodeStatus({})", ConnectionStatus::Disconnected),
        ]
    );
    assert_eq!(network.open_connections(&node(1)), 0);
}

#[tokio::test]
async fn test_shutdown_closes_everything() {
    let network = MockNetwork::new();
    network.add_node(node(1), MockNodeConfig::default());
    let client = client(&network);

    let _pull = client.pull(&Address::from_bytes(b"erin".to_vec()));
    eventually("subscription", || network.subscriptions(&node(1)) == 1).await;

    client.shutdown().await;
    eventually("closed", || network.open_connections(&node(1)) == 0).await;
    assert!(client
        .submit(SignedAtom::new(b"late".to_vec(), [ledger_net::Shard(1)]).unwrap())
        .is_err());
}

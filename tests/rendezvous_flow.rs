//! Discovery, groups, sessions and messages between nodes on one in-process
//! relay

mod common;

use common::{client, wait_for_snapshot, MockNetwork};
use peerlink::config::NodeConfig;
use peerlink::relay::{LocalRelayHub, SignalingRelay};
use peerlink::rendezvous::{
    ClientStatus, Envelope, EnvelopeKind, Group, GroupStatus, NodeHandle, Presence,
    RendezvousNode,
};
use peerlink::webrtc::SessionDescription;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

// Lower id stays the offerer when both sides connect at once
const ALICE: &str = "aliceAAAAA";
const BOB: &str = "bobBBBBBBB";
const CAROL: &str = "carolCCCCC";

fn fast_config() -> NodeConfig {
    NodeConfig {
        name: None,
        heartbeat_interval_ms: 50,
        freshness_window_ms: 2000,
        gather_timeout_ms: 5000,
    }
}

fn start(
    hub: &LocalRelayHub,
    network: &MockNetwork,
    id: &str,
    name: &str,
    config: NodeConfig,
) -> (NodeHandle, JoinHandle<()>) {
    let (relay, inbound) = hub.join(id);
    let node = RendezvousNode::new(
        client(id, name),
        config,
        Arc::new(relay),
        Arc::new(network.clone()),
    );
    node.spawn(inbound)
}

async fn discover(node: &NodeHandle, peers: usize) {
    wait_for_snapshot(node, "peer discovery", |s| s.peers == peers).await;
}

/// Put alice and bob in a public group and connect them
async fn connected_pair(
    hub: &LocalRelayHub,
    network: &MockNetwork,
) -> (NodeHandle, NodeHandle) {
    let (alice, _) = start(hub, network, ALICE, "alice", fast_config());
    let (bob, _) = start(hub, network, BOB, "bob", fast_config());

    let token = alice.create_group("lobby", true).await.unwrap();
    wait_for_snapshot(&bob, "lobby to be visible", |s| {
        s.groups.iter().any(|g| g.name == "lobby")
    })
    .await;
    bob.join_group(&token).await.unwrap().expect("lobby not found");

    wait_for_snapshot(&alice, "bob to advertise lobby", |s| {
        s.groups.iter().any(|g| g.name == "lobby")
    })
    .await;
    assert_eq!(alice.connect().await.unwrap(), 1);

    wait_for_snapshot(&alice, "alice connected", |s| {
        s.client.status == ClientStatus::Connected
    })
    .await;
    wait_for_snapshot(&bob, "bob connected", |s| {
        s.client.status == ClientStatus::Connected
    })
    .await;
    (alice, bob)
}

#[tokio::test]
async fn test_presence_discovery() {
    let hub = LocalRelayHub::new();
    let network = MockNetwork::new();
    let (alice, _) = start(&hub, &network, ALICE, "alice", fast_config());
    let (bob, _) = start(&hub, &network, BOB, "bob", fast_config());
    let (carol, _) = start(&hub, &network, CAROL, "carol", fast_config());

    discover(&alice, 2).await;
    discover(&bob, 2).await;
    discover(&carol, 2).await;

    let snapshot = alice.snapshot().await.unwrap();
    assert!(snapshot.groups.is_empty());
    assert!(snapshot.members.is_empty());
}

#[tokio::test]
async fn test_join_public_group() {
    let hub = LocalRelayHub::new();
    let network = MockNetwork::new();
    let (alice, _) = start(&hub, &network, ALICE, "alice", fast_config());
    let (bob, _) = start(&hub, &network, BOB, "bob", fast_config());

    let token = alice.create_group("lobby", true).await.unwrap();
    let snapshot = wait_for_snapshot(&bob, "lobby to be visible", |s| !s.groups.is_empty()).await;
    assert_eq!(snapshot.groups[0].id, token);
    assert!(snapshot.groups[0].is_public);

    let group = bob.join_group(&token).await.unwrap().unwrap();
    assert_eq!(group.name, "lobby");

    let snapshot = bob.snapshot().await.unwrap();
    assert_eq!(snapshot.group.as_ref().map(|g| g.id.as_str()), Some(token.as_str()));
    assert_eq!(snapshot.client.status, ClientStatus::Waiting);
}

#[tokio::test]
async fn test_private_group_needs_token() {
    let hub = LocalRelayHub::new();
    let network = MockNetwork::new();
    let (alice, _) = start(&hub, &network, ALICE, "alice", fast_config());
    let (bob, _) = start(&hub, &network, BOB, "bob", fast_config());

    let token = alice.create_group("secret", false).await.unwrap();
    let snapshot = wait_for_snapshot(&bob, "secret to be visible", |s| !s.groups.is_empty()).await;
    let advertised = snapshot.groups[0].clone();
    assert!(!advertised.is_public);
    assert_ne!(advertised.id, token);

    assert!(bob.join_group("wrongtkn").await.unwrap().is_none());
    assert!(bob.join_group(&advertised.id).await.unwrap().is_none());
    assert!(bob.snapshot().await.unwrap().group.is_none());

    let group = bob.join_group(&token).await.unwrap().unwrap();
    assert_eq!(group.id, advertised.id);
}

#[tokio::test]
async fn test_connect_outside_group_does_nothing() {
    let hub = LocalRelayHub::new();
    let network = MockNetwork::new();
    let (alice, _) = start(&hub, &network, ALICE, "alice", fast_config());
    let (_bob, _) = start(&hub, &network, BOB, "bob", fast_config());

    discover(&alice, 1).await;
    assert_eq!(alice.connect().await.unwrap(), 0);
    assert_eq!(network.session_count(), 0);
}

#[tokio::test]
async fn test_connect_and_exchange_messages() {
    let hub = LocalRelayHub::new();
    let network = MockNetwork::new();
    let (alice, bob) = connected_pair(&hub, &network).await;

    let snapshot = alice.snapshot().await.unwrap();
    assert_eq!(snapshot.members.len(), 1);
    assert_eq!(snapshot.members[0].id, BOB);
    assert_eq!(snapshot.group.unwrap().status, GroupStatus::Active);
    assert_eq!(bob.snapshot().await.unwrap().members[0].id, ALICE);

    assert_eq!(alice.send("hello bob").await.unwrap(), 1);
    let snapshot = wait_for_snapshot(&bob, "message from alice", |s| !s.messages.is_empty()).await;
    assert_eq!(snapshot.messages[0].text, "hello bob");
    assert_eq!(snapshot.messages[0].from, ALICE);
    assert_eq!(snapshot.messages[0].name, "alice");

    // The sender keeps its own copy
    let sent = alice.snapshot().await.unwrap().messages;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].from, ALICE);

    assert_eq!(bob.send("hi alice").await.unwrap(), 1);
    wait_for_snapshot(&alice, "reply from bob", |s| s.messages.len() == 2).await;
}

#[tokio::test]
async fn test_connect_keeps_live_sessions() {
    let hub = LocalRelayHub::new();
    let network = MockNetwork::new();
    let (alice, _bob) = connected_pair(&hub, &network).await;

    assert_eq!(alice.connect().await.unwrap(), 0);
    assert_eq!(network.session_count(), 2);
}

#[tokio::test]
async fn test_simultaneous_connect_settles_on_one_session() {
    let hub = LocalRelayHub::new();
    let network = MockNetwork::new();
    let (alice, _) = start(&hub, &network, ALICE, "alice", fast_config());
    let (bob, _) = start(&hub, &network, BOB, "bob", fast_config());

    let token = alice.create_group("lobby", true).await.unwrap();
    wait_for_snapshot(&bob, "lobby to be visible", |s| !s.groups.is_empty()).await;
    bob.join_group(&token).await.unwrap().unwrap();
    wait_for_snapshot(&alice, "bob to advertise lobby", |s| !s.groups.is_empty()).await;

    assert_eq!(alice.connect().await.unwrap(), 1);
    // Zero if alice's offer got there first
    assert!(bob.connect().await.unwrap() <= 1);

    wait_for_snapshot(&alice, "alice connected", |s| {
        s.client.status == ClientStatus::Connected
    })
    .await;
    wait_for_snapshot(&bob, "bob connected", |s| {
        s.client.status == ClientStatus::Connected
    })
    .await;

    assert_eq!(alice.snapshot().await.unwrap().members.len(), 1);
    assert_eq!(bob.snapshot().await.unwrap().members.len(), 1);
    assert_eq!(alice.send("one session").await.unwrap(), 1);
    wait_for_snapshot(&bob, "message over the kept session", |s| !s.messages.is_empty()).await;
}

#[tokio::test]
async fn test_disconnect_is_idempotent() {
    let hub = LocalRelayHub::new();
    let network = MockNetwork::new();
    let (alice, _bob) = connected_pair(&hub, &network).await;
    alice.send("before").await.unwrap();

    alice.disconnect().await.unwrap();
    alice.disconnect().await.unwrap();

    let snapshot = alice.snapshot().await.unwrap();
    assert!(snapshot.members.is_empty());
    assert!(snapshot.messages.is_empty());
    assert_eq!(snapshot.client.status, ClientStatus::Waiting);
    assert_eq!(snapshot.group.unwrap().status, GroupStatus::Inactive);
    assert!(network.closed_count() >= 1);
}

#[tokio::test]
async fn test_send_after_leaving_reaches_nobody() {
    let hub = LocalRelayHub::new();
    let network = MockNetwork::new();
    let (alice, _bob) = connected_pair(&hub, &network).await;

    alice.leave_group().await.unwrap();
    alice.disconnect().await.unwrap();
    assert_eq!(alice.send("anyone?").await.unwrap(), 0);

    let snapshot = alice.snapshot().await.unwrap();
    assert!(snapshot.group.is_none());
    assert!(snapshot.messages.is_empty());
    assert_eq!(snapshot.client.status, ClientStatus::Idling);
}

#[tokio::test]
async fn test_departed_peer_is_purged_with_its_connection() {
    let hub = LocalRelayHub::new();
    let network = MockNetwork::new();
    let config = NodeConfig {
        freshness_window_ms: 300,
        ..fast_config()
    };
    let (alice, _) = start(&hub, &network, ALICE, "alice", config.clone());
    let (bob, bob_task) = start(&hub, &network, BOB, "bob", config);

    let token = alice.create_group("lobby", true).await.unwrap();
    wait_for_snapshot(&bob, "lobby to be visible", |s| !s.groups.is_empty()).await;
    bob.join_group(&token).await.unwrap().unwrap();
    wait_for_snapshot(&alice, "bob to advertise lobby", |s| !s.groups.is_empty()).await;
    alice.connect().await.unwrap();
    wait_for_snapshot(&alice, "session with bob", |s| {
        s.client.status == ClientStatus::Connected
    })
    .await;

    bob.shutdown().await;
    bob_task.await.unwrap();
    hub.leave(BOB);

    let snapshot = wait_for_snapshot(&alice, "bob to be purged", |s| s.peers == 0).await;
    assert!(snapshot.members.is_empty());
    assert!(snapshot.groups.is_empty());
    // Losing the last session puts alice back to waiting in her group
    assert_eq!(snapshot.client.status, ClientStatus::Waiting);
    assert!(snapshot.group.is_some());
}

/// Next OFFER_REQUEST seen by a raw hub participant
async fn next_offer(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> Envelope {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Some(envelope) if envelope.kind == EnvelopeKind::OfferRequest => return envelope,
                Some(_) => continue,
                None => panic!("hub dropped the participant"),
            }
        }
    })
    .await
    .expect("no offer arrived")
}

#[tokio::test]
async fn test_connect_retries_unanswered_offer() {
    let hub = LocalRelayHub::new();
    let network = MockNetwork::new();
    let (alice, _) = start(&hub, &network, ALICE, "alice", fast_config());
    let token = alice.create_group("lobby", true).await.unwrap();

    // A member that advertises the group but never answers
    let (silent, mut silent_rx) = hub.join(BOB);
    let presence = Presence {
        client: client(BOB, "bob"),
        group: Some(Group {
            name: "lobby".to_string(),
            id: token.clone(),
            is_public: true,
            status: GroupStatus::Inactive,
        }),
    };
    silent.send(Envelope::presence(&presence).unwrap()).await.unwrap();
    discover(&alice, 1).await;

    assert_eq!(alice.connect().await.unwrap(), 1);
    let first = next_offer(&mut silent_rx).await;
    assert_eq!(first.from, ALICE);

    assert_eq!(alice.connect().await.unwrap(), 1);
    let second = next_offer(&mut silent_rx).await;
    assert_ne!(first.payload, second.payload);

    assert_eq!(network.session_count(), 2);
    assert_eq!(network.closed_count(), 1);
    assert_eq!(alice.snapshot().await.unwrap().members.len(), 1);
}

#[tokio::test]
async fn test_repeated_answer_keeps_session() {
    let hub = LocalRelayHub::new();
    let network = MockNetwork::new();
    let (alice, _bob) = connected_pair(&hub, &network).await;

    // The in-process hub does not rewrite `from`, so this reads as bob's
    let (replayer, _replayer_rx) = hub.join("zedZZZZZZZ");
    let answer = Envelope::answer(&SessionDescription::answer("mock:2"), BOB, ALICE).unwrap();
    replayer.send(answer).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let snapshot = alice.snapshot().await.unwrap();
    assert_eq!(snapshot.members.len(), 1);
    assert_eq!(snapshot.client.status, ClientStatus::Connected);
    assert_eq!(alice.send("still here").await.unwrap(), 1);
}

#[tokio::test]
async fn test_rename_keeps_identity() {
    let hub = LocalRelayHub::new();
    let network = MockNetwork::new();
    let (alice, _) = start(&hub, &network, ALICE, "alice", fast_config());

    let renamed = alice.set_name("alicia").await.unwrap();
    assert_eq!(renamed.name, "alicia");
    assert_eq!(renamed.id, ALICE);
    assert_eq!(alice.snapshot().await.unwrap().client.name, "alicia");
}

#[tokio::test]
async fn test_handle_fails_after_shutdown() {
    let hub = LocalRelayHub::new();
    let network = MockNetwork::new();
    let (alice, task) = start(&hub, &network, ALICE, "alice", fast_config());

    alice.shutdown().await;
    task.await.unwrap();

    assert!(matches!(
        alice.snapshot().await,
        Err(peerlink::Error::NodeStopped)
    ));
}

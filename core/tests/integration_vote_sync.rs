//! End-to-end vote synchronization over the in-memory transport.

use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use versus_core::protocol::{Envelope, Payload};
use versus_core::reconcile::{Outcome, Vote};
use versus_core::transport::memory::MemoryHub;
use versus_core::transport::TransportFactory;
use versus_core::{room, ConnectionManager, ConnectionStatus, SyncConfig, SyncDelegate};

// A wide suffix range keeps random peer-id collisions out of the way.
fn config() -> SyncConfig {
    SyncConfig::fast(25)
}

// Opt-in test logging: RUST_LOG=versus_core=debug cargo test
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn manager(hub: &MemoryHub, user: &str, dir: &Path) -> ConnectionManager {
    init_tracing();
    ConnectionManager::new(Arc::new(hub.clone()), config(), user, dir).unwrap()
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(300)).await;
}

/// First in-room peer id that is not already taken by `taken`.
fn spare_peer_id(room_id: &str, taken: &str) -> String {
    (1..=25)
        .map(|suffix| room::peer_id_for(room_id, suffix))
        .find(|id| id != taken)
        .unwrap()
}

#[derive(Default)]
struct Recorder {
    votes: Mutex<Vec<Vote>>,
    connected: Mutex<Vec<String>>,
    disconnected: Mutex<Vec<String>>,
    synced: Mutex<Vec<usize>>,
}

impl SyncDelegate for Recorder {
    fn on_vote_received(&self, vote: &Vote) {
        self.votes.lock().push(vote.clone());
    }
    fn on_peer_connected(&self, peer_id: &str) {
        self.connected.lock().push(peer_id.to_string());
    }
    fn on_peer_disconnected(&self, peer_id: &str) {
        self.disconnected.lock().push(peer_id.to_string());
    }
    fn on_sync_received(&self, merged: usize) {
        self.synced.lock().push(merged);
    }
}

#[tokio::test]
async fn test_two_peers_exchange_votes_and_agree_on_tally() {
    let hub = MemoryHub::new();
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let alice = manager(&hub, "alice", dir_a.path());
    let bob = manager(&hub, "bob", dir_b.path());

    alice.initialize("cats", "dogs").await.unwrap();
    bob.initialize("cats", "dogs").await.unwrap();
    settle().await;

    assert_eq!(alice.status(), ConnectionStatus::Connected);
    assert_eq!(bob.status(), ConnectionStatus::Connected);
    assert_eq!(alice.peers().len(), 1);
    assert_eq!(bob.peers().len(), 1);

    alice.cast_vote("cats").await.unwrap();
    bob.cast_vote("dogs").await.unwrap();
    settle().await;

    for mgr in [&alice, &bob] {
        let tally = mgr.tally().unwrap();
        assert_eq!(tally.total, 2);
        assert_eq!(tally.counts["cats"], 1);
        assert_eq!(tally.counts["dogs"], 1);
        assert_eq!(mgr.outcome().unwrap(), Outcome::Tie);
    }

    alice.disconnect().await;
    bob.disconnect().await;
}

#[tokio::test]
async fn test_late_joiner_bootstraps_existing_votes() {
    let hub = MemoryHub::new();
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let alice = manager(&hub, "alice", dir_a.path());

    alice.initialize("tea", "coffee").await.unwrap();
    alice.cast_vote("tea").await.unwrap();

    let bob = manager(&hub, "bob", dir_b.path());
    let recorder = Arc::new(Recorder::default());
    bob.add_delegate(recorder.clone());
    bob.initialize("tea", "coffee").await.unwrap();
    settle().await;

    // Bob never saw the vote live; he pulled it through the sync handshake.
    let tally = bob.tally().unwrap();
    assert_eq!(tally.total, 1);
    assert_eq!(tally.counts["tea"], 1);
    assert_eq!(recorder.synced.lock().as_slice(), &[1]);
    assert_eq!(bob.outcome().unwrap(), Outcome::Winner("tea".to_string()));

    alice.disconnect().await;
    bob.disconnect().await;
}

#[tokio::test]
async fn test_duplicate_delivery_counts_once() {
    let hub = MemoryHub::new();
    let dir = tempfile::tempdir().unwrap();
    let alice = manager(&hub, "alice", dir.path());
    let recorder = Arc::new(Recorder::default());
    alice.add_delegate(recorder.clone());
    alice.initialize("cats", "dogs").await.unwrap();
    let alice_id = alice.local_peer_id().unwrap();

    // A raw endpoint in the same room, driven by hand so we control exactly
    // what goes over the wire.
    let raw_id = spare_peer_id("cats-vs-dogs", &alice_id);
    let (raw, mut events) = hub.open(&raw_id).await.unwrap();
    raw.dial(&alice_id).await.unwrap();
    settle().await;

    let vote = Vote {
        id: "v-raw".to_string(),
        user_id: "mallory".to_string(),
        item: "cats".to_string(),
        battle_id: "cats-vs-dogs".to_string(),
        timestamp: 1,
    };
    let envelope = Envelope::new(&raw_id, "cats-vs-dogs", Payload::Vote(vote));
    let bytes = envelope.to_bytes().unwrap();
    raw.send(&alice_id, bytes.clone()).await.unwrap();
    raw.send(&alice_id, bytes).await.unwrap();
    settle().await;

    assert_eq!(alice.tally().unwrap().total, 1);
    assert_eq!(recorder.votes.lock().len(), 1);

    // Drain so the channel does not back up while shutting down.
    while events.try_recv().is_ok() {}
    raw.shutdown().await;
    alice.disconnect().await;
}

#[tokio::test]
async fn test_sync_response_never_overwrites_live_state() {
    let hub = MemoryHub::new();
    let dir = tempfile::tempdir().unwrap();
    let alice = manager(&hub, "alice", dir.path());
    alice.initialize("cats", "dogs").await.unwrap();
    alice.cast_vote("cats").await.unwrap();
    let alice_id = alice.local_peer_id().unwrap();

    let raw_id = spare_peer_id("cats-vs-dogs", &alice_id);
    let (raw, _events) = hub.open(&raw_id).await.unwrap();
    raw.dial(&alice_id).await.unwrap();
    settle().await;

    let batch = vec![
        Vote {
            id: "x1".to_string(),
            user_id: "eve".to_string(),
            item: "dogs".to_string(),
            battle_id: "cats-vs-dogs".to_string(),
            timestamp: 1,
        },
        Vote {
            id: "x2".to_string(),
            user_id: "frank".to_string(),
            item: "dogs".to_string(),
            battle_id: "cats-vs-dogs".to_string(),
            timestamp: 2,
        },
    ];
    let envelope = Envelope::new(&raw_id, "cats-vs-dogs", Payload::SyncResponse { votes: batch });
    raw.send(&alice_id, envelope.to_bytes().unwrap())
        .await
        .unwrap();
    settle().await;

    // Alice already has live state; the unsolicited response is dropped.
    assert_eq!(alice.tally().unwrap().total, 1);

    raw.shutdown().await;
    alice.disconnect().await;
}

#[tokio::test]
async fn test_peer_departure_is_announced() {
    let hub = MemoryHub::new();
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let alice = manager(&hub, "alice", dir_a.path());
    let recorder = Arc::new(Recorder::default());
    alice.add_delegate(recorder.clone());
    let bob = manager(&hub, "bob", dir_b.path());

    alice.initialize("cats", "dogs").await.unwrap();
    bob.initialize("cats", "dogs").await.unwrap();
    settle().await;
    assert_eq!(alice.peers().len(), 1);
    let bob_id = bob.local_peer_id().unwrap();

    bob.disconnect().await;
    settle().await;

    assert!(alice.peers().is_empty());
    assert!(recorder.disconnected.lock().contains(&bob_id));

    alice.disconnect().await;
}

#[tokio::test]
async fn test_three_peers_converge() {
    let hub = MemoryHub::new();
    let dirs: Vec<_> = (0..3).map(|_| tempfile::tempdir().unwrap()).collect();
    let managers: Vec<_> = ["alice", "bob", "carol"]
        .iter()
        .zip(&dirs)
        .map(|(user, dir)| manager(&hub, user, dir.path()))
        .collect();

    for mgr in &managers {
        mgr.initialize("cats", "dogs").await.unwrap();
        settle().await;
    }
    assert!(managers.iter().all(|m| m.peers().len() == 2));

    managers[0].cast_vote("cats").await.unwrap();
    managers[1].cast_vote("cats").await.unwrap();
    managers[2].cast_vote("dogs").await.unwrap();
    settle().await;

    for mgr in &managers {
        let tally = mgr.tally().unwrap();
        assert_eq!(tally.total, 3);
        assert_eq!(tally.counts["cats"], 2);
        assert_eq!(tally.counts["dogs"], 1);
        assert_eq!(mgr.outcome().unwrap(), Outcome::Winner("cats".to_string()));
    }

    for mgr in &managers {
        mgr.disconnect().await;
    }
}

#[tokio::test]
async fn test_reinitialize_drops_all_prior_room_peers() {
    let hub = MemoryHub::new();
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let alice = manager(&hub, "alice", dir_a.path());
    let bob = manager(&hub, "bob", dir_b.path());

    alice.initialize("cats", "dogs").await.unwrap();
    bob.initialize("cats", "dogs").await.unwrap();
    settle().await;
    assert_eq!(alice.peers().len(), 1);

    alice.initialize("tea", "coffee").await.unwrap();
    settle().await;

    // No connection from the old room survives the switch.
    assert!(alice
        .peers()
        .iter()
        .all(|p| room::same_room("coffee-vs-tea", &p.peer_id)));
    assert!(bob.peers().is_empty());

    alice.disconnect().await;
    bob.disconnect().await;
}

#[tokio::test]
async fn test_foreign_room_peer_is_rejected() {
    let hub = MemoryHub::new();
    let dir = tempfile::tempdir().unwrap();
    let alice = manager(&hub, "alice", dir.path());
    alice.initialize("cats", "dogs").await.unwrap();
    let alice_id = alice.local_peer_id().unwrap();

    let (raw, _events) = hub.open("tea-vs-coffee-1").await.unwrap();
    let result = raw.dial(&alice_id).await;
    assert!(result.is_err());
    settle().await;
    assert!(alice.peers().is_empty());

    raw.shutdown().await;
    alice.disconnect().await;
}

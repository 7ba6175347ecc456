//! Connection lifecycle — the stateful heart of the sync core
//!
//! One [`ConnectionManager`] owns one battle at a time: it opens a named
//! endpoint, races discovery across the room's id space, keeps links alive
//! with heartbeats, reconnects with bounded retries when the endpoint drops,
//! and feeds every inbound envelope through the router. Observers hook in
//! through [`SyncDelegate`]; every callback fires outside the manager's
//! locks.

use crate::config::SyncConfig;
use crate::discovery;
use crate::ledger::{LedgerError, VoteLedger};
use crate::protocol::{now_ms, Envelope, Payload, ProtocolError};
use crate::reconcile::{BattleSession, Outcome, Tally, Vote, VoteReconciler};
use crate::room;
use crate::router::{Dispatched, Router};
use crate::transport::{EventReceiver, Transport, TransportError, TransportEvent, TransportFactory};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no active battle session")]
    NotInitialized,
    #[error("already voted in battle {0}")]
    AlreadyVoted(String),
    #[error("could not open a local endpoint after {0} attempts")]
    EndpointUnavailable(u32),
    #[error("lost the broker and exhausted reconnection attempts")]
    BrokerLost,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

// ============================================================================
// STATUS AND PEER STATE
// ============================================================================

/// Connection lifecycle states. `Connecting` only appears during
/// reconnection; `LocalOnly` means votes are recorded but nothing syncs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Offline,
    Discovering,
    Connecting,
    Connected,
    LocalOnly,
    Disconnected,
    Error,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionStatus::Offline => "offline",
            ConnectionStatus::Discovering => "discovering",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::LocalOnly => "local-only",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Book-keeping for one live peer link.
#[derive(Debug, Clone)]
pub struct PeerConnection {
    pub peer_id: String,
    pub connected_at: u64,
    pub last_seen: u64,
    /// Every shipped transport is a reliable ordered channel; the flag is
    /// carried for transports that distinguish.
    pub reliable: bool,
}

impl PeerConnection {
    fn new(peer_id: &str) -> Self {
        let now = now_ms();
        Self {
            peer_id: peer_id.to_string(),
            connected_at: now,
            last_seen: now,
            reliable: true,
        }
    }
}

// ============================================================================
// DELEGATE
// ============================================================================

/// Observer interface for sync events. All methods default to no-ops so
/// implementors only override what they care about. Callbacks run on the
/// manager's async tasks and must not block.
pub trait SyncDelegate: Send + Sync {
    fn on_vote_received(&self, _vote: &Vote) {}
    fn on_peer_connected(&self, _peer_id: &str) {}
    fn on_peer_disconnected(&self, _peer_id: &str) {}
    fn on_status_changed(&self, _status: ConnectionStatus) {}
    fn on_sync_received(&self, _merged: usize) {}
    fn on_error(&self, _error: &SyncError) {}
}

// ============================================================================
// SHARED STATE
// ============================================================================

struct Shared {
    config: SyncConfig,
    user_id: String,
    status: RwLock<ConnectionStatus>,
    session: RwLock<Option<BattleSession>>,
    peers: RwLock<HashMap<String, PeerConnection>>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    local_peer_id: RwLock<Option<String>>,
    router: RwLock<Option<Arc<Router>>>,
    reconciler: RwLock<Option<Arc<RwLock<VoteReconciler>>>>,
    ledger: Mutex<VoteLedger>,
    delegates: RwLock<Vec<Arc<dyn SyncDelegate>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    // Bumped on every teardown so tasks from a previous session turn into
    // no-ops instead of mutating the new one.
    epoch: AtomicU64,
}

impl Shared {
    fn live(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }

    fn set_status(&self, status: ConnectionStatus) {
        {
            let mut current = self.status.write();
            if *current == status {
                return;
            }
            *current = status;
        }
        tracing::info!(%status, "connection status changed");
        // Callbacks run with the delegates lock released; they are allowed
        // to register further delegates.
        let delegates: Vec<_> = self.delegates.read().iter().cloned().collect();
        for delegate in delegates {
            delegate.on_status_changed(status);
        }
    }

    fn notify<F: Fn(&dyn SyncDelegate)>(&self, f: F) {
        let delegates: Vec<_> = self.delegates.read().iter().cloned().collect();
        for delegate in delegates {
            f(delegate.as_ref());
        }
    }

    fn snapshot(&self) -> Option<(Arc<dyn Transport>, String, String)> {
        let transport = self.transport.read().clone()?;
        let local = self.local_peer_id.read().clone()?;
        let battle = self.session.read().as_ref()?.battle_id.clone();
        Some((transport, local, battle))
    }

    /// Serialize one payload and fire it at every live peer concurrently.
    /// Failures are logged, never propagated: a flaky peer must not stall
    /// the rest of the room.
    async fn broadcast(&self, payload: Payload) {
        let Some((transport, local, battle)) = self.snapshot() else {
            return;
        };
        let envelope = Envelope::new(&local, &battle, payload);
        let bytes = match envelope.to_bytes() {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode broadcast");
                return;
            }
        };
        let targets: Vec<String> = self.peers.read().keys().cloned().collect();
        let sends = targets.into_iter().map(|peer| {
            let transport = Arc::clone(&transport);
            let bytes = bytes.clone();
            async move {
                if let Err(e) = transport.send(&peer, bytes).await {
                    tracing::debug!(peer = %peer, error = %e, "broadcast send failed");
                }
            }
        });
        futures::future::join_all(sends).await;
    }

    fn register_peer(&self, peer_id: &str) -> bool {
        let mut peers = self.peers.write();
        if peers.contains_key(peer_id) {
            return false;
        }
        if peers.len() >= self.config.max_connections {
            return false;
        }
        peers.insert(peer_id.to_string(), PeerConnection::new(peer_id));
        true
    }

    fn drop_peer(&self, peer_id: &str) -> bool {
        self.peers.write().remove(peer_id).is_some()
    }
}

// ============================================================================
// CONNECTION MANAGER
// ============================================================================

pub struct ConnectionManager {
    factory: Arc<dyn TransportFactory>,
    shared: Arc<Shared>,
}

impl ConnectionManager {
    /// Create a manager bound to one user and one on-disk ledger. No
    /// network activity happens until [`initialize`](Self::initialize).
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        config: SyncConfig,
        user_id: &str,
        data_dir: &Path,
    ) -> Result<Self, SyncError> {
        let ledger = VoteLedger::load(data_dir)?;
        Ok(Self {
            factory,
            shared: Arc::new(Shared {
                config,
                user_id: user_id.to_string(),
                status: RwLock::new(ConnectionStatus::Offline),
                session: RwLock::new(None),
                peers: RwLock::new(HashMap::new()),
                transport: RwLock::new(None),
                local_peer_id: RwLock::new(None),
                router: RwLock::new(None),
                reconciler: RwLock::new(None),
                ledger: Mutex::new(ledger),
                delegates: RwLock::new(Vec::new()),
                tasks: Mutex::new(Vec::new()),
                epoch: AtomicU64::new(0),
            }),
        })
    }

    pub fn add_delegate(&self, delegate: Arc<dyn SyncDelegate>) {
        self.shared.delegates.write().push(delegate);
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.shared.status.read()
    }

    pub fn local_peer_id(&self) -> Option<String> {
        self.shared.local_peer_id.read().clone()
    }

    pub fn peers(&self) -> Vec<PeerConnection> {
        self.shared.peers.read().values().cloned().collect()
    }

    pub fn session(&self) -> Option<BattleSession> {
        self.shared.session.read().clone()
    }

    /// Start (or restart) a battle session for two items. Tears down any
    /// previous session first. Failing to open an endpoint is not fatal:
    /// the manager degrades to local-only mode and voting still works.
    pub async fn initialize(&self, item_a: &str, item_b: &str) -> Result<(), SyncError> {
        self.teardown().await;
        tokio::time::sleep(self.shared.config.cleanup_delay).await;

        let battle_id = room::room_id(item_a, item_b);
        let session = BattleSession::new(&battle_id, item_a, item_b);
        let reconciler = Arc::new(RwLock::new(VoteReconciler::new(
            session.clone(),
            &self.shared.user_id,
        )));
        let router = Arc::new(Router::new(&battle_id, Arc::clone(&reconciler)));
        *self.shared.session.write() = Some(session);
        *self.shared.reconciler.write() = Some(Arc::clone(&reconciler));
        *self.shared.router.write() = Some(Arc::clone(&router));

        self.shared.set_status(ConnectionStatus::Discovering);

        // The suffix is regenerated on every attempt so a collision with a
        // peer that grabbed the same id does not wedge us.
        let mut opened = None;
        for attempt in 1..=self.shared.config.endpoint_retries {
            let peer_id = room::peer_id(&battle_id, self.shared.config.peer_suffix_max);
            match self.factory.open(&peer_id).await {
                Ok((transport, rx)) => {
                    opened = Some((peer_id, transport, rx));
                    break;
                }
                Err(e) => {
                    tracing::warn!(attempt, peer_id = %peer_id, error = %e, "endpoint open failed");
                }
            }
        }
        let Some((peer_id, transport, rx)) = opened else {
            let err = SyncError::EndpointUnavailable(self.shared.config.endpoint_retries);
            self.shared.notify(|d| d.on_error(&err));
            self.shared.set_status(ConnectionStatus::LocalOnly);
            return Ok(());
        };
        tracing::info!(peer_id = %peer_id, battle = %battle_id, "endpoint open");

        *self.shared.transport.write() = Some(Arc::clone(&transport));
        *self.shared.local_peer_id.write() = Some(peer_id.clone());

        let epoch = self.shared.epoch.load(Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        let factory = Arc::clone(&self.factory);
        self.shared
            .tasks
            .lock()
            .push(tokio::spawn(event_loop(shared, factory, rx, epoch)));

        let found = discovery::discover(
            Arc::clone(&transport),
            &battle_id,
            &peer_id,
            &self.shared.config,
        )
        .await;
        if !self.shared.live(epoch) {
            return Ok(());
        }
        for peer in &found {
            if self.shared.register_peer(peer) {
                self.shared.notify(|d| d.on_peer_connected(peer));
            }
        }

        self.shared
            .broadcast(Payload::PeerJoin {
                peer_id: peer_id.clone(),
            })
            .await;

        // Joining an in-progress battle: pull the existing vote set from
        // whoever answered first.
        let bootstrap_target = {
            let needs = reconciler.read().is_empty();
            if needs {
                found.first().cloned()
            } else {
                None
            }
        };
        if let Some(target) = bootstrap_target {
            let envelope = Envelope::new(&peer_id, &battle_id, Payload::SyncRequest);
            match envelope.to_bytes() {
                Ok(bytes) => {
                    if let Err(e) = transport.send(&target, bytes).await {
                        tracing::debug!(peer = %target, error = %e, "sync request failed");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "failed to encode sync request"),
            }
        }

        self.shared.set_status(ConnectionStatus::Connected);

        let shared = Arc::clone(&self.shared);
        self.shared
            .tasks
            .lock()
            .push(tokio::spawn(heartbeat_loop(shared, epoch)));

        Ok(())
    }

    /// Record and broadcast a vote for `item`. One vote per user per
    /// battle, enforced both in-session and across restarts by the ledger.
    /// Works in local-only mode; the broadcast is then simply a no-op.
    pub async fn cast_vote(&self, item: &str) -> Result<Vote, SyncError> {
        let battle_id = self
            .shared
            .session
            .read()
            .as_ref()
            .map(|s| s.battle_id.clone())
            .ok_or(SyncError::NotInitialized)?;
        let reconciler = self
            .shared
            .reconciler
            .read()
            .clone()
            .ok_or(SyncError::NotInitialized)?;

        if self.shared.ledger.lock().has_voted(&battle_id) {
            return Err(SyncError::AlreadyVoted(battle_id));
        }
        // Ledger first: a storage failure must leave the shared vote set
        // untouched, with nothing broadcast.
        self.shared.ledger.lock().record_vote(&battle_id, item)?;
        let vote = reconciler
            .write()
            .cast_local_vote(item)
            .ok_or_else(|| SyncError::AlreadyVoted(battle_id.clone()))?;

        self.shared.broadcast(Payload::Vote(vote.clone())).await;
        Ok(vote)
    }

    /// Whether this device already voted in the given battle.
    pub fn has_voted(&self, battle_id: &str) -> bool {
        self.shared.ledger.lock().has_voted(battle_id)
    }

    pub fn tally(&self) -> Result<Tally, SyncError> {
        let reconciler = self
            .shared
            .reconciler
            .read()
            .clone()
            .ok_or(SyncError::NotInitialized)?;
        let tally = reconciler.read().tally();
        Ok(tally)
    }

    pub fn outcome(&self) -> Result<Outcome, SyncError> {
        let reconciler = self
            .shared
            .reconciler
            .read()
            .clone()
            .ok_or(SyncError::NotInitialized)?;
        let outcome = reconciler.read().outcome();
        Ok(outcome)
    }

    /// Leave the room: announce departure, drop every link, release the
    /// endpoint. Idempotent.
    pub async fn disconnect(&self) {
        self.teardown().await;
        self.shared.set_status(ConnectionStatus::Offline);
    }

    async fn teardown(&self) {
        // Invalidate in-flight tasks first so nothing races the cleanup.
        self.shared.epoch.fetch_add(1, Ordering::SeqCst);
        for task in self.shared.tasks.lock().drain(..) {
            task.abort();
        }

        let transport = self.shared.transport.write().take();
        if let Some(transport) = transport {
            let peers: Vec<String> = self.shared.peers.read().keys().cloned().collect();
            let local = self.shared.local_peer_id.read().clone();
            let battle = self
                .shared
                .session
                .read()
                .as_ref()
                .map(|s| s.battle_id.clone());
            if !peers.is_empty() {
                if let (Some(local), Some(battle)) = (local, battle) {
                    let envelope = Envelope::new(
                        &local,
                        &battle,
                        Payload::PeerLeave {
                            peer_id: local.clone(),
                        },
                    );
                    if let Ok(bytes) = envelope.to_bytes() {
                        for peer in &peers {
                            let _ = transport.send(peer, bytes.clone()).await;
                        }
                    }
                }
                for peer in &peers {
                    let _ = transport.close(peer).await;
                }
            }
            transport.shutdown().await;
        }

        self.shared.peers.write().clear();
        *self.shared.local_peer_id.write() = None;
        *self.shared.session.write() = None;
        *self.shared.router.write() = None;
        *self.shared.reconciler.write() = None;
    }
}

// ============================================================================
// BACKGROUND TASKS
// ============================================================================

/// Drain transport events for one session epoch. Owns the event receiver;
/// on endpoint loss it runs the bounded reconnection loop in place and, if
/// that succeeds, keeps going with the fresh receiver.
async fn event_loop(
    shared: Arc<Shared>,
    factory: Arc<dyn TransportFactory>,
    mut rx: EventReceiver,
    epoch: u64,
) {
    loop {
        let Some(event) = rx.recv().await else {
            return;
        };
        if !shared.live(epoch) {
            return;
        }
        match event {
            TransportEvent::ConnectionRequested { remote } => {
                handle_connection_request(&shared, &remote).await;
            }
            TransportEvent::Data { remote, payload } => {
                handle_data(&shared, &remote, payload).await;
            }
            TransportEvent::PeerClosed { remote } => {
                if shared.drop_peer(&remote) {
                    tracing::info!(peer = %remote, "peer link closed");
                    shared.notify(|d| d.on_peer_disconnected(&remote));
                }
            }
            TransportEvent::EndpointLost { reason } => {
                tracing::warn!(%reason, "endpoint lost");
                match reconnect(&shared, &factory, epoch).await {
                    Some(new_rx) => rx = new_rx,
                    None => return,
                }
            }
        }
    }
}

async fn handle_connection_request(shared: &Arc<Shared>, remote: &str) {
    let Some((transport, _local, battle)) = shared.snapshot() else {
        return;
    };
    let room_ok = room::same_room(&battle, remote);
    if room_ok && shared.register_peer(remote) {
        if let Err(e) = transport.accept(remote).await {
            tracing::debug!(peer = %remote, error = %e, "accept failed");
            shared.drop_peer(remote);
            return;
        }
        tracing::info!(peer = %remote, "accepted inbound peer");
        shared.notify(|d| d.on_peer_connected(remote));
    } else {
        tracing::debug!(peer = %remote, room_ok, "rejecting inbound request");
        let _ = transport.close(remote).await;
    }
}

async fn handle_data(shared: &Arc<Shared>, remote: &str, payload: Vec<u8>) {
    if let Some(peer) = shared.peers.write().get_mut(remote) {
        peer.last_seen = now_ms();
    }
    let envelope = match Envelope::from_bytes(&payload) {
        Ok(e) => e,
        Err(e) => {
            tracing::warn!(peer = %remote, error = %e, "dropping undecodable message");
            return;
        }
    };
    tracing::debug!(peer = %remote, tag = envelope.payload.tag(), "message received");

    let Some(router) = shared.router.read().clone() else {
        return;
    };
    match router.dispatch(envelope) {
        Dispatched::Ignored => {}
        Dispatched::VoteAccepted(vote) => {
            shared.notify(|d| d.on_vote_received(&vote));
        }
        Dispatched::Reply(payload) => {
            let Some((transport, local, battle)) = shared.snapshot() else {
                return;
            };
            let reply = Envelope::new(&local, &battle, payload);
            match reply.to_bytes() {
                Ok(bytes) => {
                    if let Err(e) = transport.send(remote, bytes).await {
                        tracing::debug!(peer = %remote, error = %e, "reply send failed");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "failed to encode reply"),
            }
        }
        Dispatched::SyncApplied(merged) => {
            tracing::info!(merged, peer = %remote, "applied bootstrap sync");
            shared.notify(|d| d.on_sync_received(merged));
        }
        Dispatched::PeerJoined(peer_id) => {
            // Announcement over an already-established link; make sure the
            // entry exists in case the accept path missed it.
            if shared.register_peer(&peer_id) {
                shared.notify(|d| d.on_peer_connected(&peer_id));
            }
        }
        Dispatched::PeerLeft(peer_id) => {
            if let Some((transport, _, _)) = shared.snapshot() {
                let _ = transport.close(&peer_id).await;
            }
            if shared.drop_peer(&peer_id) {
                shared.notify(|d| d.on_peer_disconnected(&peer_id));
            }
        }
    }
}

/// Bounded reconnection after losing the endpoint. Reuses the same peer id
/// so returning to the room does not consume a second slot in the id
/// space. Returns the new event receiver on success.
async fn reconnect(
    shared: &Arc<Shared>,
    factory: &Arc<dyn TransportFactory>,
    epoch: u64,
) -> Option<EventReceiver> {
    shared.set_status(ConnectionStatus::Disconnected);
    shared.peers.write().clear();
    *shared.transport.write() = None;

    let peer_id = shared.local_peer_id.read().clone()?;
    let battle_id = shared.session.read().as_ref()?.battle_id.clone();

    for attempt in 1..=shared.config.reconnect_attempts {
        tokio::time::sleep(shared.config.reconnect_delay).await;
        if !shared.live(epoch) {
            return None;
        }
        shared.set_status(ConnectionStatus::Connecting);
        tracing::info!(attempt, peer_id = %peer_id, "reconnecting");
        match factory.open(&peer_id).await {
            Ok((transport, rx)) => {
                if !shared.live(epoch) {
                    transport.shutdown().await;
                    return None;
                }
                *shared.transport.write() = Some(Arc::clone(&transport));
                let found =
                    discovery::discover(transport, &battle_id, &peer_id, &shared.config).await;
                if !shared.live(epoch) {
                    return None;
                }
                for peer in &found {
                    if shared.register_peer(peer) {
                        shared.notify(|d| d.on_peer_connected(peer));
                    }
                }
                shared
                    .broadcast(Payload::PeerJoin {
                        peer_id: peer_id.clone(),
                    })
                    .await;
                shared.set_status(ConnectionStatus::Connected);
                return Some(rx);
            }
            Err(e) => {
                tracing::warn!(attempt, error = %e, "reconnect attempt failed");
            }
        }
    }

    let err = SyncError::BrokerLost;
    shared.notify(|d| d.on_error(&err));
    shared.set_status(ConnectionStatus::Error);
    None
}

/// Broadcast HEARTBEAT on a fixed interval while the session lives. Send
/// failures are logged only; the transport's close events are the ground
/// truth for link health.
async fn heartbeat_loop(shared: Arc<Shared>, epoch: u64) {
    let mut interval = tokio::time::interval(shared.config.heartbeat_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick fires immediately; skip it, peers just saw PEER_JOIN.
    interval.tick().await;
    loop {
        interval.tick().await;
        if !shared.live(epoch) {
            return;
        }
        if *shared.status.read() != ConnectionStatus::Connected {
            continue;
        }
        shared.broadcast(Payload::Heartbeat).await;
    }
}

// ============================================================================
// TESTS
// ============================================================================

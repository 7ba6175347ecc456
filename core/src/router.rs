//! Inbound message dispatch
//!
//! The router owns no state of its own: votes are only reached through the
//! reconciler handle, and everything it decides is returned as a
//! [`Dispatched`] action for the connection manager to act on. Last-seen
//! bookkeeping happens in the manager before dispatch, so a heartbeat costs
//! nothing here.

use crate::protocol::{Envelope, Payload};
use crate::reconcile::{Vote, VoteReconciler};
use parking_lot::RwLock;
use std::sync::Arc;

/// What the manager should do with a dispatched message.
#[derive(Debug)]
pub enum Dispatched {
    /// Nothing further: heartbeat, duplicate vote, stale sync response,
    /// or a battle-id mismatch.
    Ignored,
    /// A new remote vote was merged; notify observers.
    VoteAccepted(Vote),
    /// Answer the sender with this payload (sync responses).
    Reply(Payload),
    /// A bootstrap sync merged this many votes; notify observers.
    SyncApplied(usize),
    /// A peer announced itself.
    PeerJoined(String),
    /// A peer said goodbye; tear its link down.
    PeerLeft(String),
}

pub struct Router {
    battle_id: String,
    reconciler: Arc<RwLock<VoteReconciler>>,
}

impl Router {
    pub fn new(battle_id: &str, reconciler: Arc<RwLock<VoteReconciler>>) -> Self {
        Self {
            battle_id: battle_id.to_string(),
            reconciler,
        }
    }

    /// Dispatch one inbound envelope by type tag.
    pub fn dispatch(&self, envelope: Envelope) -> Dispatched {
        if envelope.battle_id != self.battle_id {
            tracing::debug!(
                from = %envelope.peer_id,
                got = %envelope.battle_id,
                want = %self.battle_id,
                "dropping envelope for foreign battle"
            );
            return Dispatched::Ignored;
        }
        match envelope.payload {
            Payload::Vote(vote) => {
                let accepted = self.reconciler.write().apply_remote_vote(vote.clone());
                if accepted {
                    Dispatched::VoteAccepted(vote)
                } else {
                    Dispatched::Ignored
                }
            }
            Payload::SyncRequest => {
                let votes = self.reconciler.read().votes();
                tracing::debug!(from = %envelope.peer_id, votes = votes.len(), "answering sync request");
                Dispatched::Reply(Payload::SyncResponse { votes })
            }
            Payload::SyncResponse { votes } => {
                // Bootstrap only: a sync response must never overwrite a
                // participating peer's live state.
                let mut reconciler = self.reconciler.write();
                if !reconciler.is_empty() {
                    tracing::debug!(from = %envelope.peer_id, "ignoring sync response, local set not empty");
                    return Dispatched::Ignored;
                }
                let merged = reconciler.merge_batch(votes);
                Dispatched::SyncApplied(merged)
            }
            Payload::Heartbeat => Dispatched::Ignored,
            Payload::PeerJoin { peer_id } => Dispatched::PeerJoined(peer_id),
            Payload::PeerLeave { peer_id } => Dispatched::PeerLeft(peer_id),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::BattleSession;

    fn setup() -> (Router, Arc<RwLock<VoteReconciler>>) {
        let reconciler = Arc::new(RwLock::new(VoteReconciler::new(
            BattleSession::new("cats-vs-dogs", "cats", "dogs"),
            "local-user",
        )));
        (
            Router::new("cats-vs-dogs", Arc::clone(&reconciler)),
            reconciler,
        )
    }

    fn envelope(payload: Payload) -> Envelope {
        Envelope::new("cats-vs-dogs-9", "cats-vs-dogs", payload)
    }

    fn remote_vote(id: &str, user: &str, item: &str) -> Vote {
        Vote {
            id: id.to_string(),
            user_id: user.to_string(),
            item: item.to_string(),
            battle_id: "cats-vs-dogs".to_string(),
            timestamp: 1,
        }
    }

    #[test]
    fn test_vote_dispatch_applies_once() {
        let (router, reconciler) = setup();
        let vote = remote_vote("v1", "alice", "cats");

        match router.dispatch(envelope(Payload::Vote(vote.clone()))) {
            Dispatched::VoteAccepted(v) => assert_eq!(v.id, "v1"),
            other => panic!("expected VoteAccepted, got {other:?}"),
        }
        // Duplicate delivery is ignored.
        assert!(matches!(
            router.dispatch(envelope(Payload::Vote(vote))),
            Dispatched::Ignored
        ));
        assert_eq!(reconciler.read().tally().total, 1);
    }

    #[test]
    fn test_sync_request_replies_with_full_set() {
        let (router, reconciler) = setup();
        reconciler
            .write()
            .apply_remote_vote(remote_vote("v1", "alice", "cats"));

        match router.dispatch(envelope(Payload::SyncRequest)) {
            Dispatched::Reply(Payload::SyncResponse { votes }) => {
                assert_eq!(votes.len(), 1);
                assert_eq!(votes[0].id, "v1");
            }
            other => panic!("expected SyncResponse reply, got {other:?}"),
        }
    }

    #[test]
    fn test_sync_response_bootstraps_empty_set_only() {
        let (router, reconciler) = setup();
        let batch = vec![
            remote_vote("v1", "alice", "cats"),
            remote_vote("v2", "bob", "dogs"),
        ];

        match router.dispatch(envelope(Payload::SyncResponse {
            votes: batch.clone(),
        })) {
            Dispatched::SyncApplied(n) => assert_eq!(n, 2),
            other => panic!("expected SyncApplied, got {other:?}"),
        }
        assert_eq!(reconciler.read().tally().total, 2);

        // A second response must not touch the now-live state.
        assert!(matches!(
            router.dispatch(envelope(Payload::SyncResponse {
                votes: vec![remote_vote("v3", "carol", "cats")]
            })),
            Dispatched::Ignored
        ));
        assert_eq!(reconciler.read().tally().total, 2);
    }

    #[test]
    fn test_foreign_battle_dropped() {
        let (router, reconciler) = setup();
        let mut env = envelope(Payload::Vote(remote_vote("v1", "alice", "cats")));
        env.battle_id = "tea-vs-coffee".to_string();
        assert!(matches!(router.dispatch(env), Dispatched::Ignored));
        assert_eq!(reconciler.read().tally().total, 0);
    }

    #[test]
    fn test_heartbeat_is_noop() {
        let (router, _) = setup();
        assert!(matches!(
            router.dispatch(envelope(Payload::Heartbeat)),
            Dispatched::Ignored
        ));
    }

    #[test]
    fn test_peer_join_and_leave() {
        let (router, _) = setup();
        match router.dispatch(envelope(Payload::PeerJoin {
            peer_id: "cats-vs-dogs-9".to_string(),
        })) {
            Dispatched::PeerJoined(p) => assert_eq!(p, "cats-vs-dogs-9"),
            other => panic!("expected PeerJoined, got {other:?}"),
        }
        match router.dispatch(envelope(Payload::PeerLeave {
            peer_id: "cats-vs-dogs-9".to_string(),
        })) {
            Dispatched::PeerLeft(p) => assert_eq!(p, "cats-vs-dogs-9"),
            other => panic!("expected PeerLeft, got {other:?}"),
        }
    }
}

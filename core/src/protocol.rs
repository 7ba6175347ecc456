//! Wire protocol — message envelope and payload variants
//!
//! Every message on the wire is an [`Envelope`]: a type-tagged payload plus
//! sender peer id, message id, millisecond timestamp, and the battle it
//! belongs to. Envelopes are immutable, short-lived, and never persisted.
//! The message id exists for traceability only; vote deduplication is done
//! by vote id in the reconciler.

use crate::reconcile::Vote;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Type-tagged message payload. Payload shape is fixed per variant and
/// checked at the deserialization boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Payload {
    /// A single vote cast by the sender's user.
    Vote(Vote),
    /// Ask a peer for its full current vote set.
    SyncRequest,
    /// Full vote set, sent in answer to a `SyncRequest`. Only ever merged
    /// into an empty local set (late-joiner bootstrap).
    SyncResponse { votes: Vec<Vote> },
    /// Liveness beacon; receipt refreshes the sender's last-seen time.
    Heartbeat,
    /// Announcement that a peer joined the room.
    PeerJoin { peer_id: String },
    /// Graceful goodbye; the link is torn down on receipt.
    PeerLeave { peer_id: String },
}

impl Payload {
    /// Human-readable tag for logging.
    pub fn tag(&self) -> &'static str {
        match self {
            Payload::Vote(_) => "VOTE",
            Payload::SyncRequest => "SYNC_REQUEST",
            Payload::SyncResponse { .. } => "SYNC_RESPONSE",
            Payload::Heartbeat => "HEARTBEAT",
            Payload::PeerJoin { .. } => "PEER_JOIN",
            Payload::PeerLeave { .. } => "PEER_LEAVE",
        }
    }
}

/// The unit of exchange between peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique id, traceability only.
    pub message_id: String,
    /// Sender's peer id (room-scoped endpoint name).
    pub peer_id: String,
    /// Battle this message belongs to; mismatches are dropped on receipt.
    pub battle_id: String,
    /// Sender clock, milliseconds since epoch.
    pub timestamp: u64,
    pub payload: Payload,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("decode failed: {0}")]
    Decode(String),
}

impl Envelope {
    /// Build a new envelope with a fresh message id and current timestamp.
    pub fn new(peer_id: &str, battle_id: &str, payload: Payload) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            peer_id: peer_id.to_string(),
            battle_id: battle_id.to_string(),
            timestamp: now_ms(),
            payload,
        }
    }

    /// Serialize for the wire using bincode.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serialize(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Deserialize from wire bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        bincode::deserialize(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn vote() -> Vote {
        Vote {
            id: "v1".to_string(),
            user_id: "u1".to_string(),
            item: "cats".to_string(),
            battle_id: "cats-vs-dogs".to_string(),
            timestamp: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_envelope_stamps_id_and_timestamp() {
        let env = Envelope::new("cats-vs-dogs-3", "cats-vs-dogs", Payload::Heartbeat);
        assert!(!env.message_id.is_empty());
        assert!(env.timestamp > 0);
        assert_eq!(env.peer_id, "cats-vs-dogs-3");
        assert_eq!(env.battle_id, "cats-vs-dogs");
    }

    #[test]
    fn test_vote_envelope_roundtrip() {
        let env = Envelope::new("cats-vs-dogs-3", "cats-vs-dogs", Payload::Vote(vote()));
        let bytes = env.to_bytes().expect("encode");
        let restored = Envelope::from_bytes(&bytes).expect("decode");
        assert_eq!(restored.message_id, env.message_id);
        match restored.payload {
            Payload::Vote(v) => {
                assert_eq!(v.id, "v1");
                assert_eq!(v.item, "cats");
            }
            other => panic!("wrong payload: {}", other.tag()),
        }
    }

    #[test]
    fn test_sync_response_roundtrip() {
        let env = Envelope::new(
            "cats-vs-dogs-3",
            "cats-vs-dogs",
            Payload::SyncResponse {
                votes: vec![vote()],
            },
        );
        let bytes = env.to_bytes().expect("encode");
        match Envelope::from_bytes(&bytes).expect("decode").payload {
            Payload::SyncResponse { votes } => assert_eq!(votes.len(), 1),
            other => panic!("wrong payload: {}", other.tag()),
        }
    }

    #[test]
    fn test_invalid_bytes_rejected() {
        assert!(Envelope::from_bytes(&[255, 254, 253]).is_err());
    }

    #[test]
    fn test_payload_tags() {
        assert_eq!(Payload::Heartbeat.tag(), "HEARTBEAT");
        assert_eq!(Payload::SyncRequest.tag(), "SYNC_REQUEST");
        assert_eq!(
            Payload::PeerLeave {
                peer_id: "p".to_string()
            }
            .tag(),
            "PEER_LEAVE"
        );
    }

    #[test]
    fn test_message_ids_are_unique() {
        let a = Envelope::new("p", "b", Payload::Heartbeat);
        let b = Envelope::new("p", "b", Payload::Heartbeat);
        assert_ne!(a.message_id, b.message_id);
    }
}

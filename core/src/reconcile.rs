//! Vote reconciliation — the authoritative local vote set for a battle
//!
//! All reconciliation operations are idempotent under duplication and
//! reordering: applying the same vote twice, or an echo of our own vote,
//! leaves the set unchanged. That is what lets the protocol tolerate
//! at-least-once delivery instead of demanding exactly-once.

use crate::protocol::now_ms;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// One battle between two items.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BattleSession {
    /// Same string on every peer: the room id derived from the item pair.
    pub battle_id: String,
    pub item_a: String,
    pub item_b: String,
    pub started_at: u64,
    pub active: bool,
}

impl BattleSession {
    pub fn new(battle_id: &str, item_a: &str, item_b: &str) -> Self {
        Self {
            battle_id: battle_id.to_string(),
            item_a: item_a.to_string(),
            item_b: item_b.to_string(),
            started_at: now_ms(),
            active: true,
        }
    }
}

/// A single cast vote. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vote {
    pub id: String,
    /// Session-scoped caster id, one per running instance.
    pub user_id: String,
    /// Item name voted for.
    pub item: String,
    pub battle_id: String,
    pub timestamp: u64,
}

/// Derived counts for the current vote set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tally {
    pub counts: HashMap<String, usize>,
    pub percentages: HashMap<String, f64>,
    pub total: usize,
}

/// Result of a battle as it stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Strictly greatest count.
    Winner(String),
    /// Two or more items share the greatest nonzero count.
    Tie,
    /// No votes cast at all — distinct from a genuine tie.
    Undecided,
}

/// Owns the vote set for the active battle. Nothing mutates votes except
/// through these methods.
#[derive(Debug)]
pub struct VoteReconciler {
    session: BattleSession,
    user_id: String,
    votes: HashMap<String, Vote>,
    voted_users: HashSet<String>,
}

impl VoteReconciler {
    pub fn new(session: BattleSession, user_id: &str) -> Self {
        Self {
            session,
            user_id: user_id.to_string(),
            votes: HashMap::new(),
            voted_users: HashSet::new(),
        }
    }

    pub fn session(&self) -> &BattleSession {
        &self.session
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn is_empty(&self) -> bool {
        self.votes.is_empty()
    }

    /// Snapshot of the current vote set, for SYNC_RESPONSE payloads.
    pub fn votes(&self) -> Vec<Vote> {
        self.votes.values().cloned().collect()
    }

    /// Cast the local user's vote. A no-op returning `None` if this user
    /// already has a vote in the battle; otherwise the new vote is recorded
    /// and returned for broadcasting.
    pub fn cast_local_vote(&mut self, item: &str) -> Option<Vote> {
        if self.voted_users.contains(&self.user_id) {
            tracing::debug!(user = %self.user_id, "local vote rejected: already voted");
            return None;
        }
        let vote = Vote {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: self.user_id.clone(),
            item: item.to_string(),
            battle_id: self.session.battle_id.clone(),
            timestamp: now_ms(),
        };
        self.voted_users.insert(vote.user_id.clone());
        self.votes.insert(vote.id.clone(), vote.clone());
        Some(vote)
    }

    /// Merge a remotely-originated vote. Returns `true` if it was accepted.
    ///
    /// Rejected when it is an echo of our own vote, a duplicate vote id, a
    /// second vote from a user who already voted, or scoped to a different
    /// battle. Safe to call any number of times in any order.
    pub fn apply_remote_vote(&mut self, vote: Vote) -> bool {
        if vote.battle_id != self.session.battle_id {
            tracing::debug!(vote = %vote.id, "vote dropped: wrong battle");
            return false;
        }
        if vote.user_id == self.user_id {
            tracing::trace!(vote = %vote.id, "vote dropped: own echo");
            return false;
        }
        if self.votes.contains_key(&vote.id) {
            tracing::trace!(vote = %vote.id, "vote dropped: duplicate id");
            return false;
        }
        if self.voted_users.contains(&vote.user_id) {
            tracing::debug!(user = %vote.user_id, "vote dropped: user already voted");
            return false;
        }
        self.voted_users.insert(vote.user_id.clone());
        self.votes.insert(vote.id.clone(), vote);
        true
    }

    /// Batch merge for late-joiner bootstrap. Applies the per-vote rules of
    /// [`apply_remote_vote`] and returns how many were actually merged.
    pub fn merge_batch(&mut self, votes: Vec<Vote>) -> usize {
        votes
            .into_iter()
            .filter(|v| self.apply_remote_vote(v.clone()))
            .count()
    }

    /// Counts and percentages per item. The session's two items are always
    /// present, zero-seeded, so an empty battle still tallies cleanly.
    pub fn tally(&self) -> Tally {
        let mut counts: HashMap<String, usize> = HashMap::new();
        counts.insert(self.session.item_a.clone(), 0);
        counts.insert(self.session.item_b.clone(), 0);
        for vote in self.votes.values() {
            *counts.entry(vote.item.clone()).or_insert(0) += 1;
        }
        let total = self.votes.len();
        let percentages = counts
            .iter()
            .map(|(item, &count)| {
                let pct = if total == 0 {
                    0.0
                } else {
                    count as f64 / total as f64 * 100.0
                };
                (item.clone(), pct)
            })
            .collect();
        Tally {
            counts,
            percentages,
            total,
        }
    }

    /// Winner rule: strictly greatest count wins; a shared greatest count is
    /// a `Tie`; a battle with no votes at all is `Undecided`.
    pub fn outcome(&self) -> Outcome {
        let tally = self.tally();
        if tally.total == 0 {
            return Outcome::Undecided;
        }
        let best = tally.counts.values().copied().max().unwrap_or(0);
        let mut leaders = tally
            .counts
            .iter()
            .filter(|(_, &count)| count == best)
            .map(|(item, _)| item.clone());
        let first = match leaders.next() {
            Some(item) => item,
            None => return Outcome::Undecided,
        };
        if leaders.next().is_some() {
            Outcome::Tie
        } else {
            Outcome::Winner(first)
        }
    }

    /// Clear everything and install a new battle. Used whenever a session
    /// starts or restarts.
    pub fn reset(&mut self, session: BattleSession, user_id: &str) {
        self.session = session;
        self.user_id = user_id.to_string();
        self.votes.clear();
        self.voted_users.clear();
    }
}

// ============================================================================
// TESTS
// ============================================================================

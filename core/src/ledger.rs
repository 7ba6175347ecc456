//! Vote ledger — persistent "this device already voted" guard
//!
//! Independent of any live session: the in-memory reconciler starts empty on
//! every initialize, so it cannot stop the same device from voting twice in
//! two separately-started sessions of the same battle. The ledger can. It is
//! a small JSON list on disk, filtered to entries younger than 24 hours on
//! every read.

use crate::protocol::now_ms;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Fixed storage key: file name of the ledger inside the data dir.
pub const LEDGER_FILE: &str = "vote_ledger.json";

/// Records expire 24 hours after creation.
pub const LEDGER_TTL_MS: u64 = 24 * 60 * 60 * 1000;

const FINGERPRINT_MAX_LEN: usize = 100;

/// One persisted "already voted" record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteLedgerRecord {
    pub battle_id: String,
    pub item: String,
    /// Creation time, milliseconds since epoch.
    pub timestamp: u64,
    /// Coarse device marker, capped at 100 chars.
    pub device_fingerprint: String,
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("ledger parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Coarse, stable-enough marker for this device: a blake3 hash over user,
/// OS, and home-dir environment markers. Never used for security, only to
/// label ledger records.
pub fn device_fingerprint() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());
    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_default();
    let seed = format!("{user}|{}|{}|{home}", std::env::consts::OS, std::env::consts::ARCH);
    let mut fp = hex::encode(blake3::hash(seed.as_bytes()).as_bytes());
    fp.truncate(FINGERPRINT_MAX_LEN);
    fp
}

/// The device-scoped re-vote guard. Owns its file; callers only reach
/// records through these methods.
#[derive(Debug)]
pub struct VoteLedger {
    path: PathBuf,
    records: Vec<VoteLedgerRecord>,
}

impl VoteLedger {
    /// Load the ledger from `data_dir`, dropping expired records. A missing
    /// file is an empty ledger, not an error.
    pub fn load(data_dir: &Path) -> Result<Self, LedgerError> {
        std::fs::create_dir_all(data_dir)?;
        let path = data_dir.join(LEDGER_FILE);
        let records = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            serde_json::from_str(&contents)?
        } else {
            Vec::new()
        };
        let mut ledger = Self { path, records };
        ledger.purge_expired_at(now_ms());
        tracing::debug!(
            records = ledger.records.len(),
            "vote ledger loaded from {}",
            ledger.path.display()
        );
        Ok(ledger)
    }

    /// Has this device voted in the battle within the TTL window?
    pub fn has_voted(&mut self, battle_id: &str) -> bool {
        self.has_voted_at(battle_id, now_ms())
    }

    /// Fetch the live record for a battle, if any.
    pub fn get(&mut self, battle_id: &str) -> Option<&VoteLedgerRecord> {
        self.get_at(battle_id, now_ms())
    }

    /// Record a vote for a battle. A second record for the same battle id
    /// overwrites the first rather than duplicating it.
    pub fn record_vote(&mut self, battle_id: &str, item: &str) -> Result<(), LedgerError> {
        self.record_vote_at(battle_id, item, now_ms())
    }

    /// Snapshot of every live record, newest first.
    pub fn entries(&mut self) -> Vec<VoteLedgerRecord> {
        self.purge_expired_at(now_ms());
        let mut out = self.records.clone();
        out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        out
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    // Clock-injected variants keep the TTL behavior testable.

    pub(crate) fn has_voted_at(&mut self, battle_id: &str, now: u64) -> bool {
        self.get_at(battle_id, now).is_some()
    }

    pub(crate) fn get_at(&mut self, battle_id: &str, now: u64) -> Option<&VoteLedgerRecord> {
        self.purge_expired_at(now);
        self.records.iter().find(|r| r.battle_id == battle_id)
    }

    pub(crate) fn record_vote_at(
        &mut self,
        battle_id: &str,
        item: &str,
        now: u64,
    ) -> Result<(), LedgerError> {
        self.purge_expired_at(now);
        let record = VoteLedgerRecord {
            battle_id: battle_id.to_string(),
            item: item.to_string(),
            timestamp: now,
            device_fingerprint: device_fingerprint(),
        };
        if let Some(existing) = self.records.iter_mut().find(|r| r.battle_id == battle_id) {
            *existing = record;
        } else {
            self.records.push(record);
        }
        self.save()
    }

    fn purge_expired_at(&mut self, now: u64) {
        let before = self.records.len();
        self.records
            .retain(|r| now.saturating_sub(r.timestamp) < LEDGER_TTL_MS);
        if self.records.len() != before {
            tracing::debug!(
                purged = before - self.records.len(),
                "expired vote ledger records dropped"
            );
        }
    }

    fn save(&self) -> Result<(), LedgerError> {
        let contents = serde_json::to_string_pretty(&self.records)?;
        std::fs::write(&self.path, contents)?;
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

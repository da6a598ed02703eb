//! Ledger commit sink.
//!
//! The consensus core hands committed batches to the ledger in round order
//! and treats it as an opaque append-only target. Delivery is
//! at-least-once: after a crash the adapter may replay rounds the ledger
//! already applied, so implementations must treat a replay of the same
//! batch as a no-op.

use {
    crate::types::{Batch, Round},
    solana_hash::Hash,
    std::collections::BTreeMap,
    thiserror::Error,
};

pub type LedgerHeight = u64;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    #[error("ledger rejected round {round}: {reason}")]
    Rejected { round: Round, reason: String },

    #[error("round {round} applied out of order (last applied {applied})")]
    OutOfOrder { round: Round, applied: Round },

    #[error("ledger storage error: {0}")]
    Storage(String),
}

/// Destination for committed batches.
pub trait LedgerCommitSink: Send {
    /// Apply the batch committed at `round`. Re-applying an already applied
    /// round with the same batch returns its recorded height.
    fn apply(&mut self, round: Round, batch: &Batch) -> Result<LedgerHeight, ApplyError>;

    /// Highest round applied so far.
    fn last_applied_round(&self) -> Option<Round>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AppliedEntry {
    digest: Hash,
    height: LedgerHeight,
    transactions: usize,
}

/// Reference sink that keeps applied rounds in memory. Each committed round
/// advances the ledger height by one.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    applied: BTreeMap<Round, AppliedEntry>,
    total_transactions: usize,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn height(&self) -> LedgerHeight {
        self.applied.len() as LedgerHeight
    }

    pub fn total_transactions(&self) -> usize {
        self.total_transactions
    }

    /// Digest applied at `round`, if any.
    pub fn digest_at(&self, round: Round) -> Option<Hash> {
        self.applied.get(&round).map(|e| e.digest)
    }

    /// Applied (round, batch digest) pairs in order.
    pub fn history(&self) -> Vec<(Round, Hash)> {
        self.applied.iter().map(|(r, e)| (*r, e.digest)).collect()
    }
}

impl LedgerCommitSink for InMemoryLedger {
    fn apply(&mut self, round: Round, batch: &Batch) -> Result<LedgerHeight, ApplyError> {
        if let Some(entry) = self.applied.get(&round) {
            if entry.digest == batch.digest {
                return Ok(entry.height);
            }
            return Err(ApplyError::Rejected {
                round,
                reason: format!(
                    "conflicting batch {} (applied {})",
                    batch.digest, entry.digest
                ),
            });
        }
        if let Some(applied) = self.last_applied_round() {
            if round < applied {
                return Err(ApplyError::OutOfOrder { round, applied });
            }
        }
        let height = self.height().saturating_add(1);
        self.applied.insert(
            round,
            AppliedEntry {
                digest: batch.digest,
                height,
                transactions: batch.len(),
            },
        );
        self.total_transactions = self.total_transactions.saturating_add(batch.len());
        log::debug!(
            "ledger applied round {round} at height {height} ({} txs)",
            batch.len()
        );
        Ok(height)
    }

    fn last_applied_round(&self) -> Option<Round> {
        self.applied.keys().next_back().copied()
    }
}

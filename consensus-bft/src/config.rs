//! BFT consensus configuration.
//!
//! Defines round timing, batch limits, epoch length and committee sizing
//! for the certificate-based consensus protocol.

use serde::{Deserialize, Serialize};

/// Configuration for the BFT consensus engine.
///
/// All timeouts are in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BftConfig {
    /// Base time a round may take before it is skipped.
    /// Default: 2000.
    pub round_timeout_base_ms: u64,

    /// Extra time added per consecutive timed-out round.
    /// Default: 1000.
    pub round_timeout_delta_ms: u64,

    /// Upper bound for the backed-off round timeout.
    /// Default: 30000.
    pub max_round_timeout_ms: u64,

    /// Maximum number of transactions a leader puts in one batch.
    /// Default: 500.
    pub max_batch_transactions: usize,

    /// Maximum total payload bytes in one batch.
    /// Default: 512 KiB.
    pub max_batch_bytes: usize,

    /// Number of rounds per epoch. Committees change only at epoch
    /// boundaries.
    /// Default: 10000.
    pub epoch_length_rounds: u64,

    /// Smallest committee the node will participate in.
    /// Default: 4 (tolerates one Byzantine validator).
    pub min_committee_size: usize,

    /// Epochs an unbonding validator waits before removal.
    /// Default: 2.
    pub unbonding_cooldown_epochs: u64,

    /// Rounds of certificates kept in memory below the commit frontier.
    /// Default: 50.
    pub gc_depth: u64,

    /// How many rounds ahead of the current one votes are buffered.
    /// Default: 4.
    pub vote_buffer_rounds: u64,
}

impl Default for BftConfig {
    fn default() -> Self {
        Self {
            round_timeout_base_ms: 2_000,
            round_timeout_delta_ms: 1_000,
            max_round_timeout_ms: 30_000,
            max_batch_transactions: 500,
            max_batch_bytes: 512 * 1024,
            epoch_length_rounds: 10_000,
            min_committee_size: 4,
            unbonding_cooldown_epochs: 2,
            gc_depth: 50,
            vote_buffer_rounds: 4,
        }
    }
}

impl BftConfig {
    /// Round timeout after `consecutive_timeouts` skipped rounds in a row.
    pub fn round_timeout_ms(&self, consecutive_timeouts: u32) -> u64 {
        self.round_timeout_delta_ms
            .saturating_mul(u64::from(consecutive_timeouts))
            .saturating_add(self.round_timeout_base_ms)
            .min(self.max_round_timeout_ms)
    }

    /// Epoch that `round` belongs to.
    pub fn epoch_of(&self, round: u64) -> u64 {
        round.checked_div(self.epoch_length_rounds).unwrap_or(0)
    }

    /// Validate configuration parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.round_timeout_base_ms == 0 {
            return Err(ConfigError::InvalidRoundTimeout);
        }
        if self.max_round_timeout_ms < self.round_timeout_base_ms {
            return Err(ConfigError::InvalidMaxRoundTimeout {
                max: self.max_round_timeout_ms,
                base: self.round_timeout_base_ms,
            });
        }
        if self.max_batch_transactions == 0 || self.max_batch_bytes == 0 {
            return Err(ConfigError::InvalidBatchLimits);
        }
        if self.epoch_length_rounds == 0 {
            return Err(ConfigError::InvalidEpochLength);
        }
        if self.min_committee_size == 0 {
            return Err(ConfigError::InvalidMinCommitteeSize);
        }
        Ok(())
    }
}

/// Errors in BFT configuration.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("round_timeout_base_ms must be > 0")]
    InvalidRoundTimeout,
    #[error("max_round_timeout_ms ({max}) must be >= round_timeout_base_ms ({base})")]
    InvalidMaxRoundTimeout { max: u64, base: u64 },
    #[error("batch limits must be > 0")]
    InvalidBatchLimits,
    #[error("epoch_length_rounds must be > 0")]
    InvalidEpochLength,
    #[error("min_committee_size must be > 0")]
    InvalidMinCommitteeSize,
}

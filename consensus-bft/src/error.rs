//! Error taxonomy of the consensus core.

use {
    crate::{
        ledger::ApplyError,
        types::{CertificateKey, Round},
    },
    solana_hash::Hash,
    solana_pubkey::Pubkey,
    thiserror::Error,
};

/// Outcomes of consensus operations that did not take the happy path.
#[derive(Error, Debug)]
pub enum ConsensusError {
    /// A message or certificate carried a signature that does not verify.
    #[error("invalid signature on {what} from {signer}")]
    InvalidSignature { what: &'static str, signer: Pubkey },

    /// The round is below what this node still accepts.
    #[error("stale round {round} (current frontier {frontier})")]
    StaleRound { round: Round, frontier: Round },

    /// A proposal or vote for a round this node has already moved past.
    #[error("round {round} is behind current round {current}")]
    BehindRound { round: Round, current: Round },

    /// A certificate or proposal refers to a certificate we do not know.
    #[error("round {round} references unknown certificate {missing}")]
    DanglingReference { round: Round, missing: Hash },

    /// A validator signed two conflicting messages in one round.
    #[error("equivocation by {validator} in round {round}")]
    Equivocation { validator: Pubkey, round: Round },

    /// A certificate for this (round, proposer) is already stored.
    #[error("duplicate certificate {0}")]
    DuplicateCertificate(CertificateKey),

    /// No certificate formed for the round within the timeout.
    #[error("no quorum for round {round} before timeout")]
    QuorumTimeout { round: Round },

    /// The ledger refused a committed batch; commitment halts.
    #[error("ledger failed to apply round {round}: {source}")]
    LedgerApplyFailure {
        round: Round,
        #[source]
        source: ApplyError,
    },

    /// The committee cannot form a quorum or is unknown for the epoch.
    #[error("committee misconfiguration: {0}")]
    CommitteeMisconfiguration(String),

    /// A second certificate conflicts with the committed prefix.
    #[error("safety violation at round {round}: {reason}")]
    SafetyViolation { round: Round, reason: String },

    #[error("invalid proposal for round {round}: {reason}")]
    InvalidProposal { round: Round, reason: String },

    #[error("invalid certificate {key}: {reason}")]
    InvalidCertificate { key: CertificateKey, reason: String },

    #[error("{0} is not a committee member")]
    UnknownValidator(Pubkey),

    #[error("storage failure: {0}")]
    Storage(String),
}

impl ConsensusError {
    /// Fatal errors stop round advancement on this node.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::LedgerApplyFailure { .. }
                | Self::CommitteeMisconfiguration(_)
                | Self::SafetyViolation { .. }
                | Self::Storage(_)
        )
    }

    /// Errors caused by a misbehaving or broken peer rather than timing.
    pub fn is_peer_fault(&self) -> bool {
        matches!(
            self,
            Self::InvalidSignature { .. }
                | Self::InvalidProposal { .. }
                | Self::InvalidCertificate { .. }
                | Self::UnknownValidator(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ConsensusError>;

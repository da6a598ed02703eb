//! Equivocation detection and evidence collection.
//!
//! A validator must not sign two different votes, or two different
//! proposals, in the same round. This module remembers the first message of
//! each kind per (round, signer) and produces evidence when a conflicting
//! second one arrives.

use {
    crate::types::{Proposal, Round, Vote},
    serde::{Deserialize, Serialize},
    solana_hash::Hash,
    solana_pubkey::Pubkey,
    solana_signature::Signature,
    std::collections::{HashMap, HashSet},
};

/// Proof that `validator` signed two conflicting messages in `round`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EquivocationEvidence {
    pub validator: Pubkey,
    pub round: Round,
    pub kind: EvidenceKind,
    /// First message seen (digest, signature).
    pub first: (Hash, Signature),
    /// Conflicting message (digest, signature).
    pub second: (Hash, Signature),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EvidenceKind {
    ConflictingVote,
    ConflictingProposal,
}

impl std::fmt::Display for EvidenceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvidenceKind::ConflictingVote => write!(f, "ConflictingVote"),
            EvidenceKind::ConflictingProposal => write!(f, "ConflictingProposal"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SignerKey {
    round: Round,
    signer: Pubkey,
    kind: EvidenceKind,
}

/// Collects equivocation evidence over a sliding window of rounds.
#[derive(Debug, Default)]
pub struct EvidenceCollector {
    /// First (digest, signature) seen per signer, round and message kind.
    first_seen: HashMap<SignerKey, (Hash, Signature)>,
    /// (round, validator) pairs with a conflicting vote on record.
    equivocators: HashSet<(Round, Pubkey)>,
    evidence: Vec<EquivocationEvidence>,
    /// Messages below this round are ignored.
    min_round: Round,
}

impl EvidenceCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a vote. Returns evidence if it conflicts with an earlier vote
    /// by the same voter in the same round.
    pub fn check_vote(&mut self, vote: &Vote) -> Option<EquivocationEvidence> {
        let evidence = self.check(
            SignerKey {
                round: vote.round,
                signer: vote.voter,
                kind: EvidenceKind::ConflictingVote,
            },
            (vote.proposal_digest, vote.signature),
        )?;
        self.equivocators.insert((vote.round, vote.voter));
        Some(evidence)
    }

    /// Record a proposal. Returns evidence if the proposer already signed a
    /// different proposal for the same round.
    pub fn check_proposal(&mut self, proposal: &Proposal) -> Option<EquivocationEvidence> {
        self.check(
            SignerKey {
                round: proposal.round,
                signer: proposal.proposer,
                kind: EvidenceKind::ConflictingProposal,
            },
            (proposal.digest(), proposal.signature),
        )
    }

    fn check(
        &mut self,
        key: SignerKey,
        current: (Hash, Signature),
    ) -> Option<EquivocationEvidence> {
        if key.round < self.min_round {
            return None;
        }
        match self.first_seen.get(&key) {
            Some(first) if first.0 != current.0 => {
                let ev = EquivocationEvidence {
                    validator: key.signer,
                    round: key.round,
                    kind: key.kind,
                    first: *first,
                    second: current,
                };
                self.evidence.push(ev.clone());
                Some(ev)
            }
            // Same message again: a duplicate, not evidence.
            Some(_) => None,
            None => {
                self.first_seen.insert(key, current);
                None
            }
        }
    }

    /// Whether `validator` cast conflicting votes in `round`. Such votes do
    /// not count toward that round's quorum.
    pub fn is_equivocator(&self, validator: &Pubkey, round: Round) -> bool {
        self.equivocators.contains(&(round, *validator))
    }

    /// The first digest `signer` voted for in `round`, if any.
    pub fn first_vote(&self, signer: &Pubkey, round: Round) -> Option<Hash> {
        self.first_seen
            .get(&SignerKey {
                round,
                signer: *signer,
                kind: EvidenceKind::ConflictingVote,
            })
            .map(|(digest, _)| *digest)
    }

    /// Forget messages below `min_round`. Collected evidence is kept until
    /// drained.
    pub fn prune(&mut self, min_round: Round) {
        self.min_round = min_round;
        self.first_seen.retain(|k, _| k.round >= min_round);
        self.equivocators.retain(|(round, _)| *round >= min_round);
    }

    pub fn evidence(&self) -> &[EquivocationEvidence] {
        &self.evidence
    }

    pub fn drain_evidence(&mut self) -> Vec<EquivocationEvidence> {
        std::mem::take(&mut self.evidence)
    }

    pub fn tracked_messages(&self) -> usize {
        self.first_seen.len()
    }

    pub fn has_evidence_against(&self, validator: &Pubkey) -> bool {
        self.evidence.iter().any(|e| e.validator == *validator)
    }
}

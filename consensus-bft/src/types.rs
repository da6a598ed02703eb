//! Core data types for the certificate-based BFT protocol.
//!
//! Everything that crosses the wire or lands in storage is defined here:
//! transactions and batches, signed proposals and votes, and the
//! certificates that aggregate a quorum of votes.

use {
    crate::committee::Committee,
    serde::{Deserialize, Serialize},
    solana_hash::Hash,
    solana_keypair::Keypair,
    solana_pubkey::Pubkey,
    solana_sha256_hasher::hashv,
    solana_signature::Signature,
    solana_signer::Signer,
    std::collections::HashSet,
};

/// Consensus round number. Round 0 is the implicit genesis round.
pub type Round = u64;

/// Epoch number. Committee membership is fixed within an epoch.
pub type Epoch = u64;

/// Stake weight.
pub type Stake = u64;

/// Transaction identifier (content hash).
pub type TransactionId = Hash;

/// Genesis round: never proposed, always complete.
pub const GENESIS_ROUND: Round = 0;

// ---------------------------------------------------------------------------
// Transactions and batches
// ---------------------------------------------------------------------------

/// An opaque client transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub payload: Vec<u8>,
}

impl Transaction {
    pub fn new(payload: Vec<u8>) -> Self {
        let id = Self::compute_id(&payload);
        Self { id, payload }
    }

    pub fn compute_id(payload: &[u8]) -> TransactionId {
        hashv(&[b"transaction", payload])
    }

    /// Size counted against batch and mempool byte bounds.
    pub fn size(&self) -> usize {
        self.payload.len()
    }

    /// Whether the identifier matches the payload.
    pub fn has_valid_id(&self) -> bool {
        self.id == Self::compute_id(&self.payload)
    }
}

/// A bounded, deduplicated, ordered set of transactions produced by a
/// validator's mempool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub transactions: Vec<Transaction>,
    pub digest: Hash,
}

impl Batch {
    pub fn new(transactions: Vec<Transaction>) -> Self {
        let digest = Self::compute_digest(&transactions);
        Self {
            transactions,
            digest,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn compute_digest(transactions: &[Transaction]) -> Hash {
        let mut parts: Vec<&[u8]> = Vec::with_capacity(transactions.len().saturating_add(1));
        parts.push(b"batch");
        parts.extend(transactions.iter().map(|tx| tx.id.as_ref()));
        hashv(&parts)
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn size_bytes(&self) -> usize {
        self.transactions.iter().map(Transaction::size).sum()
    }

    /// Transaction identifiers in batch order.
    pub fn transaction_ids(&self) -> impl Iterator<Item = &TransactionId> {
        self.transactions.iter().map(|tx| &tx.id)
    }

    /// Checks digest, per-transaction ids and duplicate-freedom.
    pub fn is_well_formed(&self) -> bool {
        if self.digest != Self::compute_digest(&self.transactions) {
            return false;
        }
        let mut seen = HashSet::with_capacity(self.transactions.len());
        self.transactions
            .iter()
            .all(|tx| tx.has_valid_id() && seen.insert(tx.id))
    }
}

// ---------------------------------------------------------------------------
// Proposals and votes
// ---------------------------------------------------------------------------

/// A block candidate broadcast by the round leader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub round: Round,
    pub proposer: Pubkey,
    pub batch_digest: Hash,
    /// Digests of prior-round certificates this proposal builds on.
    pub parents: Vec<Hash>,
    pub signature: Signature,
}

impl Proposal {
    /// Build and sign a proposal.
    pub fn new_signed(
        keypair: &Keypair,
        round: Round,
        batch_digest: Hash,
        parents: Vec<Hash>,
    ) -> Self {
        let proposer = keypair.pubkey();
        let digest = Self::compute_digest(round, &proposer, &batch_digest, &parents);
        let signature = keypair.sign_message(digest.as_ref());
        Self {
            round,
            proposer,
            batch_digest,
            parents,
            signature,
        }
    }

    pub fn compute_digest(
        round: Round,
        proposer: &Pubkey,
        batch_digest: &Hash,
        parents: &[Hash],
    ) -> Hash {
        let round_bytes = round.to_le_bytes();
        let mut parts: Vec<&[u8]> = Vec::with_capacity(parents.len().saturating_add(4));
        parts.push(b"proposal");
        parts.push(&round_bytes);
        parts.push(proposer.as_ref());
        parts.push(batch_digest.as_ref());
        parts.extend(parents.iter().map(|p| p.as_ref()));
        hashv(&parts)
    }

    /// Digest identifying this proposal (and the certificate formed over it).
    pub fn digest(&self) -> Hash {
        Self::compute_digest(self.round, &self.proposer, &self.batch_digest, &self.parents)
    }

    pub fn verify_signature(&self) -> bool {
        self.signature
            .verify(self.proposer.as_ref(), self.digest().as_ref())
    }
}

/// A validator's vote for a proposal digest in a round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub round: Round,
    pub proposal_digest: Hash,
    pub voter: Pubkey,
    pub signature: Signature,
}

impl Vote {
    pub fn new_signed(keypair: &Keypair, round: Round, proposal_digest: Hash) -> Self {
        let signature =
            keypair.sign_message(Self::signing_digest(round, &proposal_digest).as_ref());
        Self {
            round,
            proposal_digest,
            voter: keypair.pubkey(),
            signature,
        }
    }

    pub fn signing_digest(round: Round, proposal_digest: &Hash) -> Hash {
        hashv(&[b"vote", &round.to_le_bytes(), proposal_digest.as_ref()])
    }

    pub fn verify_signature(&self) -> bool {
        self.signature.verify(
            self.voter.as_ref(),
            Self::signing_digest(self.round, &self.proposal_digest).as_ref(),
        )
    }
}

// ---------------------------------------------------------------------------
// Certificates
// ---------------------------------------------------------------------------

/// Arena key of a certificate: at most one certificate per (round, proposer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CertificateKey {
    pub round: Round,
    pub proposer: Pubkey,
}

impl std::fmt::Display for CertificateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.round, self.proposer)
    }
}

/// Proof that a proposal gathered a quorum of votes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    pub proposal: Proposal,
    /// Votes sorted by voter identity.
    pub votes: Vec<Vote>,
}

impl Certificate {
    /// Assemble a certificate; votes are sorted so every node produces the
    /// same encoding for the same voter set.
    pub fn new(proposal: Proposal, mut votes: Vec<Vote>) -> Self {
        votes.sort_by(|a, b| a.voter.cmp(&b.voter));
        votes.dedup_by(|a, b| a.voter == b.voter);
        Self { proposal, votes }
    }

    pub fn round(&self) -> Round {
        self.proposal.round
    }

    pub fn proposer(&self) -> Pubkey {
        self.proposal.proposer
    }

    pub fn key(&self) -> CertificateKey {
        CertificateKey {
            round: self.proposal.round,
            proposer: self.proposal.proposer,
        }
    }

    pub fn digest(&self) -> Hash {
        self.proposal.digest()
    }

    pub fn parents(&self) -> &[Hash] {
        &self.proposal.parents
    }

    pub fn voters(&self) -> impl Iterator<Item = &Pubkey> {
        self.votes.iter().map(|v| &v.voter)
    }

    /// Stake of distinct committee members among the voters.
    pub fn voting_stake(&self, committee: &Committee) -> Stake {
        committee.stake_of_set(self.voters())
    }

    /// Checks every signature: the proposer's and each vote's.
    pub fn verify_signatures(&self) -> bool {
        self.proposal.verify_signature() && self.votes.iter().all(Vote::verify_signature)
    }
}

/// A certificate together with the batch it references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertifiedBatch {
    pub certificate: Certificate,
    pub batch: Batch,
}

impl CertifiedBatch {
    pub fn round(&self) -> Round {
        self.certificate.round()
    }

    /// Whether the attached batch is the one the certificate commits to.
    pub fn batch_matches(&self) -> bool {
        self.batch.digest == self.certificate.proposal.batch_digest && self.batch.is_well_formed()
    }
}

/// Consensus traffic produced by the engine for broadcast to all peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsensusMessage {
    /// A leader's proposal together with the batch it references.
    Proposal { proposal: Proposal, batch: Batch },
    Vote(Vote),
    Certificate(CertifiedBatch),
}

impl ConsensusMessage {
    pub fn round(&self) -> Round {
        match self {
            Self::Proposal { proposal, .. } => proposal.round,
            Self::Vote(vote) => vote.round,
            Self::Certificate(certified) => certified.round(),
        }
    }
}

/// One entry of the append-only commit sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    /// Position in the commit sequence, starting at 0.
    pub sequence: u64,
    pub round: Round,
    pub digest: Hash,
    pub ledger_height: u64,
}

/// Persisted voting state that must survive restarts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyState {
    pub last_voted_round: Round,
    pub locked_round: Round,
}

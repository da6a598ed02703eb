//! Wire types and serialization for consensus network communication.
//!
//! Every frame on the consensus channel carries one [`SignedEnvelope`]: the
//! sender's identity, a [`ConsensusNetMessage`], and the sender's signature
//! over the bincode encoding of that message.
//!
//! Wire format: `[len: u32-le][bincode(SignedEnvelope): len bytes]`

use {
    crate::error::{ConsensusNetError, Result},
    bastion_consensus_bft::{
        Batch, CertifiedBatch, ConsensusMessage, Proposal, Round, Stake, Vote,
    },
    serde::{Deserialize, Serialize},
    solana_keypair::Keypair,
    solana_pubkey::Pubkey,
    solana_signature::Signature,
    solana_signer::Signer,
    std::net::SocketAddr,
};

/// A statically configured peer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerInfo {
    pub identity: Pubkey,
    /// Consensus listener address.
    pub addr: SocketAddr,
    pub stake: Stake,
}

/// Top-level consensus network message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConsensusNetMessage {
    /// A leader's proposal with the batch it references.
    Proposal { proposal: Proposal, batch: Batch },

    Vote(Vote),

    /// A certificate with its batch.
    Certificate(CertifiedBatch),

    /// Ask a peer for certified batches starting at `from_round`.
    SyncRequest { from_round: Round, limit: u32 },

    /// Certified batches in ascending round order.
    SyncResponse { certificates: Vec<CertifiedBatch> },

    /// Keep-alive carrying the sender's commit frontier.
    Heartbeat {
        identity: Pubkey,
        committed_round: Round,
    },
}

impl ConsensusNetMessage {
    pub fn serialize(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(ConsensusNetError::Serialization)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(ConsensusNetError::Serialization)
    }

    /// Short tag for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Proposal { .. } => "proposal",
            Self::Vote(_) => "vote",
            Self::Certificate(_) => "certificate",
            Self::SyncRequest { .. } => "sync_request",
            Self::SyncResponse { .. } => "sync_response",
            Self::Heartbeat { .. } => "heartbeat",
        }
    }

    /// Round the message refers to, for messages that belong to one.
    pub fn round(&self) -> Option<Round> {
        match self {
            Self::Proposal { proposal, .. } => Some(proposal.round),
            Self::Vote(vote) => Some(vote.round),
            Self::Certificate(certified) => Some(certified.round()),
            Self::SyncRequest { .. } | Self::SyncResponse { .. } | Self::Heartbeat { .. } => None,
        }
    }

    /// The engine message carried by this wire message, if any.
    pub fn into_consensus(self) -> Option<ConsensusMessage> {
        match self {
            Self::Proposal { proposal, batch } => Some(ConsensusMessage::Proposal { proposal, batch }),
            Self::Vote(vote) => Some(ConsensusMessage::Vote(vote)),
            Self::Certificate(certified) => Some(ConsensusMessage::Certificate(certified)),
            _ => None,
        }
    }
}

impl From<ConsensusMessage> for ConsensusNetMessage {
    fn from(message: ConsensusMessage) -> Self {
        match message {
            ConsensusMessage::Proposal { proposal, batch } => Self::Proposal { proposal, batch },
            ConsensusMessage::Vote(vote) => Self::Vote(vote),
            ConsensusMessage::Certificate(certified) => Self::Certificate(certified),
        }
    }
}

/// A message authenticated by its sender.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignedEnvelope {
    pub sender: Pubkey,
    pub message: ConsensusNetMessage,
    pub signature: Signature,
}

impl SignedEnvelope {
    pub fn sign(keypair: &Keypair, message: ConsensusNetMessage) -> Result<Self> {
        let bytes = message.serialize()?;
        Ok(Self {
            sender: keypair.pubkey(),
            signature: keypair.sign_message(&bytes),
            message,
        })
    }

    /// Check the envelope signature against `sender`.
    pub fn verify(&self) -> bool {
        match self.message.serialize() {
            Ok(bytes) => self.signature.verify(self.sender.as_ref(), &bytes),
            Err(_) => false,
        }
    }

    /// Serialize with a 4-byte little-endian length prefix.
    pub fn serialize_framed(&self, max_size: usize) -> Result<Vec<u8>> {
        let payload = bincode::serialize(self)?;
        if payload.len() > max_size {
            return Err(ConsensusNetError::MessageTooLarge {
                size: payload.len(),
                max: max_size,
            });
        }
        let len = u32::try_from(payload.len()).map_err(|_| ConsensusNetError::MessageTooLarge {
            size: payload.len(),
            max: u32::MAX as usize,
        })?;
        let mut buf = Vec::with_capacity(4usize.saturating_add(payload.len()));
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(ConsensusNetError::Serialization)
    }

    /// Read the length prefix from a 4-byte header.
    pub fn read_frame_len(header: &[u8; 4]) -> usize {
        u32::from_le_bytes(*header) as usize
    }
}

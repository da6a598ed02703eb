//! Error types for the consensus networking layer.

use {solana_pubkey::Pubkey, std::net::SocketAddr, thiserror::Error};

/// Errors that can occur in the consensus networking layer.
#[derive(Error, Debug)]
pub enum ConsensusNetError {
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("message too large: {size} bytes (max {max} bytes)")]
    MessageTooLarge { size: usize, max: usize },

    #[error("unknown peer: {0}")]
    UnknownPeer(Pubkey),

    #[error("peer {0} is banned")]
    Banned(Pubkey),

    #[error("maximum peers reached: {0}")]
    MaxPeersReached(usize),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("message timeout after {0}ms")]
    Timeout(u64),

    /// The channel to the consensus thread is closed.
    #[error("consensus channel closed")]
    ChannelClosed,

    #[error("invalid signature from {0}")]
    InvalidSignature(Pubkey),

    #[error("invalid message from {sender}: {reason}")]
    InvalidMessage { sender: Pubkey, reason: String },

    #[error("rate limit exceeded by {addr} ({hits} events)")]
    RateLimited { addr: SocketAddr, hits: usize },

    #[error("no connected peers")]
    NoPeers,

    #[error("invalid network config: {0}")]
    InvalidConfig(String),
}

impl ConsensusNetError {
    /// Whether the error is the remote peer's fault and should cost it score.
    pub fn is_peer_fault(&self) -> bool {
        matches!(
            self,
            Self::InvalidSignature(_) | Self::InvalidMessage { .. } | Self::RateLimited { .. }
        )
    }
}

/// Convenience result type for consensus networking operations.
pub type Result<T> = std::result::Result<T, ConsensusNetError>;

//! Validator configuration file.
//!
//! ```yaml
//! peers:
//!   - identity: 8qbHbw2BbbTHBW1sbeqakYXVKRQM8Ne7pLK7m6CVfeR
//!     addr: 10.0.0.1:8900
//!     stake: 100
//! bft:
//!   round_timeout_base_ms: 1000
//! net:
//!   bind_addr: 0.0.0.0:8900
//! ```
//!
//! `peers` lists every genesis committee member, this validator included.
//! Sections left out fall back to their defaults.

use {
    bastion_consensus_bft::{BftConfig, ConfigError, MempoolConfig, Stake},
    bastion_consensus_net::{ConsensusNetConfig, ConsensusNetError, PeerInfo},
    serde::{Deserialize, Serialize},
    solana_pubkey::Pubkey,
    std::{collections::HashSet, fs, net::SocketAddr, path::Path, str::FromStr},
    thiserror::Error,
};

#[derive(Error, Debug)]
pub enum ValidatorConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid peer identity {0:?}")]
    InvalidIdentity(String),

    #[error("peer {0} listed more than once")]
    DuplicatePeer(Pubkey),

    #[error("no peers configured")]
    NoPeers,

    #[error("{0} is not a member of the genesis committee")]
    NotInCommittee(Pubkey),

    #[error("bft: {0}")]
    Bft(#[from] ConfigError),

    #[error("net: {0}")]
    Net(#[from] ConsensusNetError),

    #[error("mempool: {0}")]
    Mempool(String),
}

/// One genesis committee member as written in the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEntry {
    /// Base58 identity.
    pub identity: String,
    pub addr: SocketAddr,
    pub stake: Stake,
}

impl PeerEntry {
    fn to_peer_info(&self) -> Result<PeerInfo, ValidatorConfigError> {
        let identity = Pubkey::from_str(&self.identity)
            .map_err(|_| ValidatorConfigError::InvalidIdentity(self.identity.clone()))?;
        Ok(PeerInfo {
            identity,
            addr: self.addr,
            stake: self.stake,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    pub peers: Vec<PeerEntry>,
    pub bft: BftConfig,
    pub mempool: MempoolConfig,
    pub net: ConsensusNetConfig,
}

impl ValidatorConfig {
    pub fn load(path: &Path) -> Result<Self, ValidatorConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ValidatorConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, ValidatorConfigError> {
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Check every section, and that `identity` is in the genesis committee.
    pub fn validate(&self, identity: &Pubkey) -> Result<(), ValidatorConfigError> {
        self.bft.validate()?;
        self.net.validate()?;
        if self.mempool.max_transactions == 0 || self.mempool.max_bytes == 0 {
            return Err(ValidatorConfigError::Mempool(
                "max_transactions and max_bytes must be > 0".to_string(),
            ));
        }
        let peers = self.peer_infos()?;
        if peers.is_empty() {
            return Err(ValidatorConfigError::NoPeers);
        }
        if !peers.iter().any(|peer| peer.identity == *identity) {
            return Err(ValidatorConfigError::NotInCommittee(*identity));
        }
        Ok(())
    }

    pub fn peer_infos(&self) -> Result<Vec<PeerInfo>, ValidatorConfigError> {
        let mut seen = HashSet::with_capacity(self.peers.len());
        self.peers
            .iter()
            .map(|entry| {
                let info = entry.to_peer_info()?;
                if !seen.insert(info.identity) {
                    return Err(ValidatorConfigError::DuplicatePeer(info.identity));
                }
                Ok(info)
            })
            .collect()
    }

    /// Genesis committee as (identity, stake).
    pub fn genesis(&self) -> Result<Vec<(Pubkey, Stake)>, ValidatorConfigError> {
        Ok(self
            .peer_infos()?
            .into_iter()
            .map(|peer| (peer.identity, peer.stake))
            .collect())
    }
}

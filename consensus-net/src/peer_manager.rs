//! Peer tracking, scoring and bans.
//!
//! The [`PeerManager`] is the single source of truth for "who are we
//! talking to?". Peers are configured statically; each carries a score
//! that misbehaviour lowers. A peer whose score reaches the configured ban
//! threshold is banned and its envelopes are dropped unread.

use {
    crate::{
        config::ConsensusNetConfig,
        error::{ConsensusNetError, Result},
        message::PeerInfo,
    },
    bastion_consensus_bft::Round,
    log::{debug, info, warn},
    solana_pubkey::Pubkey,
    std::{
        collections::{HashMap, HashSet},
        net::SocketAddr,
        time::Instant,
    },
};

pub const INITIAL_SCORE: i64 = 100;

/// Misbehaviour kinds and what they cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Penalty {
    InvalidSignature,
    InvalidMessage,
    RateLimited,
    /// Signed two conflicting messages for one round.
    Equivocation,
}

impl Penalty {
    pub fn cost(self) -> i64 {
        match self {
            Penalty::InvalidSignature => 25,
            Penalty::InvalidMessage => 10,
            Penalty::RateLimited => 5,
            Penalty::Equivocation => INITIAL_SCORE,
        }
    }
}

/// Per-peer bookkeeping.
#[derive(Debug, Clone)]
pub struct PeerConnection {
    pub info: PeerInfo,
    pub last_seen: Instant,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub is_connected: bool,
    /// Starts at [`INITIAL_SCORE`]; lowered by penalties.
    pub score: i64,
    /// Commit frontier the peer last announced.
    pub committed_round: Round,
}

impl PeerConnection {
    pub fn new(info: PeerInfo) -> Self {
        Self {
            info,
            last_seen: Instant::now(),
            messages_sent: 0,
            messages_received: 0,
            is_connected: false,
            score: INITIAL_SCORE,
            committed_round: 0,
        }
    }

    pub fn record_received(&mut self) {
        self.messages_received = self.messages_received.saturating_add(1);
        self.last_seen = Instant::now();
        self.is_connected = true;
    }

    pub fn record_sent(&mut self) {
        self.messages_sent = self.messages_sent.saturating_add(1);
    }

    /// Seconds since we last heard from this peer.
    pub fn silence_secs(&self) -> u64 {
        self.last_seen.elapsed().as_secs()
    }
}

/// Shared as `Arc<parking_lot::Mutex<PeerManager>>` between the router, the
/// sync client and the outbound pump.
#[derive(Debug)]
pub struct PeerManager {
    peers: HashMap<Pubkey, PeerConnection>,
    banned: HashSet<Pubkey>,
    /// Identities in the current committee.
    committee: HashSet<Pubkey>,
    config: ConsensusNetConfig,
}

impl PeerManager {
    pub fn new(config: ConsensusNetConfig) -> Self {
        Self {
            peers: HashMap::new(),
            banned: HashSet::new(),
            committee: HashSet::new(),
            config,
        }
    }

    /// Build from a static peer list, skipping `own_identity`.
    pub fn with_peers(
        config: ConsensusNetConfig,
        own_identity: &Pubkey,
        peers: impl IntoIterator<Item = PeerInfo>,
    ) -> Result<Self> {
        let mut manager = Self::new(config);
        for peer in peers {
            if peer.identity != *own_identity {
                manager.add_peer(peer)?;
            }
        }
        Ok(manager)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn connected_count(&self) -> usize {
        self.peers.values().filter(|p| p.is_connected).count()
    }

    /// Register a peer, or update its address and stake if already known.
    pub fn add_peer(&mut self, info: PeerInfo) -> Result<()> {
        if let Some(existing) = self.peers.get_mut(&info.identity) {
            debug!("updating existing peer {}", info.identity);
            existing.info = info;
            return Ok(());
        }
        if self.peers.len() >= self.config.max_peers {
            return Err(ConsensusNetError::MaxPeersReached(self.config.max_peers));
        }
        info!("adding peer {} at {}", info.identity, info.addr);
        self.peers.insert(info.identity, PeerConnection::new(info));
        Ok(())
    }

    pub fn remove_peer(&mut self, identity: &Pubkey) {
        if self.peers.remove(identity).is_some() {
            info!("removed peer {}", identity);
        }
    }

    pub fn get_peer(&self, identity: &Pubkey) -> Option<&PeerConnection> {
        self.peers.get(identity)
    }

    pub fn addr_of(&self, identity: &Pubkey) -> Option<SocketAddr> {
        self.peers.get(identity).map(|p| p.info.addr)
    }

    pub fn is_banned(&self, identity: &Pubkey) -> bool {
        self.banned.contains(identity)
    }

    /// Check that `identity` may send to us and record the receipt.
    pub fn record_received(&mut self, identity: &Pubkey) -> Result<()> {
        if self.banned.contains(identity) {
            return Err(ConsensusNetError::Banned(*identity));
        }
        let peer = self
            .peers
            .get_mut(identity)
            .ok_or(ConsensusNetError::UnknownPeer(*identity))?;
        peer.record_received();
        Ok(())
    }

    pub fn record_sent(&mut self, identity: &Pubkey) {
        if let Some(peer) = self.peers.get_mut(identity) {
            peer.record_sent();
        }
    }

    pub fn record_heartbeat(&mut self, identity: &Pubkey, committed_round: Round) {
        if let Some(peer) = self.peers.get_mut(identity) {
            peer.committed_round = peer.committed_round.max(committed_round);
        }
    }

    /// Lower a peer's score. Returns `true` if this penalty banned it.
    pub fn penalize(&mut self, identity: &Pubkey, penalty: Penalty) -> bool {
        let Some(peer) = self.peers.get_mut(identity) else {
            return false;
        };
        peer.score = peer.score.saturating_sub(penalty.cost());
        warn!(
            "penalized {} for {:?}, score now {}",
            identity, penalty, peer.score
        );
        if peer.score <= self.config.ban_score_threshold && self.banned.insert(*identity) {
            peer.is_connected = false;
            warn!("banned peer {}", identity);
            return true;
        }
        false
    }

    /// Lift a ban and reset the score.
    pub fn unban(&mut self, identity: &Pubkey) {
        if self.banned.remove(identity) {
            if let Some(peer) = self.peers.get_mut(identity) {
                peer.score = INITIAL_SCORE;
            }
            info!("unbanned peer {}", identity);
        }
    }

    /// Replace the committee identities (called at epoch boundaries).
    pub fn update_committee(&mut self, committee: HashSet<Pubkey>) {
        info!(
            "committee update: {} -> {} members",
            self.committee.len(),
            committee.len()
        );
        self.committee = committee;
    }

    pub fn is_committee_member(&self, identity: &Pubkey) -> bool {
        self.committee.contains(identity)
    }

    /// Addresses of every peer that is not banned.
    pub fn broadcast_targets(&self) -> Vec<(Pubkey, SocketAddr)> {
        self.peers
            .iter()
            .filter(|(identity, _)| !self.banned.contains(identity))
            .map(|(identity, peer)| (*identity, peer.info.addr))
            .collect()
    }

    /// Peers that can serve sync: not banned, connected, preferring those
    /// that announced a frontier of at least `min_round`.
    pub fn sync_candidates(&self, min_round: Round) -> Vec<(Pubkey, SocketAddr)> {
        let usable = |peer: &&PeerConnection| {
            !self.banned.contains(&peer.info.identity) && peer.is_connected
        };
        let ahead: Vec<_> = self
            .peers
            .values()
            .filter(usable)
            .filter(|peer| peer.committed_round >= min_round)
            .map(|peer| (peer.info.identity, peer.info.addr))
            .collect();
        if !ahead.is_empty() {
            return ahead;
        }
        self.peers
            .values()
            .filter(usable)
            .map(|peer| (peer.info.identity, peer.info.addr))
            .collect()
    }

    /// Mark peers silent for longer than `peer_timeout_secs` disconnected.
    pub fn evict_stale_peers(&mut self) -> Vec<Pubkey> {
        let timeout = self.config.peer_timeout_secs;
        let stale: Vec<Pubkey> = self
            .peers
            .iter()
            .filter(|(_, p)| p.is_connected && p.silence_secs() > timeout)
            .map(|(k, _)| *k)
            .collect();
        for identity in &stale {
            warn!("peer {} silent for more than {}s", identity, timeout);
            if let Some(peer) = self.peers.get_mut(identity) {
                peer.is_connected = false;
            }
        }
        stale
    }
}

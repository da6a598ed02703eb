//! Certificate catch-up.
//!
//! A validator that restarts, sees a proposal whose parents it lacks, or
//! hears votes far ahead of its round asks a peer for the certified batches
//! from its commit frontier on:
//!
//! 1. **Request**: a `SyncRequest { from_round, limit }` goes to a peer that
//!    announced a frontier at least that high, with bounded concurrency.
//! 2. **Response**: a `SyncResponse` from a peer we asked completes the
//!    request; its certificates go to the consensus thread like any other.
//! 3. **Retry**: requests that see no answer within `message_timeout_ms`
//!    are retried against another peer until `max_sync_retries`.

use {
    crate::{
        cache::Cache,
        config::ConsensusNetConfig,
        error::{ConsensusNetError, Result},
        message::{ConsensusNetMessage, SignedEnvelope},
        peer_manager::PeerManager,
        transport,
    },
    bastion_consensus_bft::{CertifiedBatch, Round},
    log::{debug, info, warn},
    parking_lot::Mutex,
    rand::seq::IndexedRandom,
    solana_keypair::Keypair,
    solana_pubkey::Pubkey,
    std::{collections::BTreeMap, net::SocketAddr, sync::Arc, time::Instant},
};

#[derive(Debug, Clone)]
pub struct PendingSyncRequest {
    pub from_round: Round,
    pub peer: Pubkey,
    pub addr: SocketAddr,
    pub sent_at: Instant,
    pub attempts: u32,
}

pub struct SyncClient {
    keypair: Arc<Keypair>,
    peer_manager: Arc<Mutex<PeerManager>>,
    cache: Arc<Cache>,
    config: ConsensusNetConfig,
    /// Outstanding requests by starting round.
    pending: BTreeMap<Round, PendingSyncRequest>,
}

impl SyncClient {
    pub fn new(
        keypair: Arc<Keypair>,
        peer_manager: Arc<Mutex<PeerManager>>,
        cache: Arc<Cache>,
        config: ConsensusNetConfig,
    ) -> Self {
        Self {
            keypair,
            peer_manager,
            cache,
            config,
            pending: BTreeMap::new(),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, from_round: Round) -> bool {
        self.pending.contains_key(&from_round)
    }

    /// Request certified batches from `from_round` on. A request already in
    /// flight from the same or an earlier round covers it.
    pub async fn request_from(&mut self, from_round: Round) -> Result<bool> {
        if self
            .pending
            .range(..=from_round)
            .next()
            .is_some()
        {
            debug!("sync from {from_round} already covered");
            return Ok(false);
        }
        if self.pending.len() >= self.config.max_sync_requests {
            debug!(
                "sync concurrency limit reached ({}), deferring round {}",
                self.config.max_sync_requests, from_round
            );
            return Ok(false);
        }
        let (peer, addr) = self.pick_peer(from_round, None)?;
        self.dispatch(from_round, peer, addr, 1).await?;
        info!("requested certificates from round {from_round} from {peer}");
        Ok(true)
    }

    async fn dispatch(
        &mut self,
        from_round: Round,
        peer: Pubkey,
        addr: SocketAddr,
        attempts: u32,
    ) -> Result<()> {
        self.cache
            .insert_outbound_sync_request(addr, self.config.rate_limit_interval_secs);
        let envelope = SignedEnvelope::sign(
            &self.keypair,
            ConsensusNetMessage::SyncRequest {
                from_round,
                limit: self.config.sync_batch_limit,
            },
        )?;
        transport::send_envelope(addr, &envelope, self.config.max_message_size).await?;
        self.peer_manager.lock().record_sent(&peer);
        self.pending.insert(
            from_round,
            PendingSyncRequest {
                from_round,
                peer,
                addr,
                sent_at: Instant::now(),
                attempts,
            },
        );
        Ok(())
    }

    /// Match a response to the request sent to `sender`. Returns the
    /// certificates if we asked for them, `None` for unsolicited responses.
    pub fn handle_response(
        &mut self,
        sender: &Pubkey,
        certificates: Vec<CertifiedBatch>,
    ) -> Option<Vec<CertifiedBatch>> {
        let from_round = self
            .pending
            .iter()
            .find(|(_, request)| request.peer == *sender)
            .map(|(round, _)| *round)?;
        self.pending.remove(&from_round);
        debug!(
            "sync from round {from_round}: {} certificates from {sender}",
            certificates.len()
        );
        Some(certificates)
    }

    /// Retry timed-out requests against another peer. Returns the starting
    /// rounds of requests that were given up.
    pub async fn retry_timed_out(&mut self) -> Vec<Round> {
        let timeout_ms = self.config.message_timeout_ms;
        let timed_out: Vec<PendingSyncRequest> = self
            .pending
            .values()
            .filter(|r| r.sent_at.elapsed().as_millis() > u128::from(timeout_ms))
            .cloned()
            .collect();

        let mut failed = Vec::new();
        for request in timed_out {
            self.pending.remove(&request.from_round);
            if request.attempts >= self.config.max_sync_retries {
                warn!(
                    "giving up sync from round {} after {} attempts",
                    request.from_round, request.attempts
                );
                failed.push(request.from_round);
                continue;
            }
            let attempt = request.attempts.saturating_add(1);
            let retried = match self.pick_peer(request.from_round, Some(&request.peer)) {
                Ok((peer, addr)) => self
                    .dispatch(request.from_round, peer, addr, attempt)
                    .await
                    .map(|()| peer),
                Err(e) => Err(e),
            };
            match retried {
                Ok(peer) => debug!(
                    "retried sync from round {} with {} (attempt {})",
                    request.from_round, peer, attempt
                ),
                Err(e) => {
                    warn!("sync retry from round {} failed: {e}", request.from_round);
                    failed.push(request.from_round);
                }
            }
        }
        failed
    }

    pub fn reset(&mut self) {
        self.pending.clear();
    }

    /// Random peer among those able to serve `from_round`, avoiding
    /// `exclude` when there is a choice.
    fn pick_peer(&self, from_round: Round, exclude: Option<&Pubkey>) -> Result<(Pubkey, SocketAddr)> {
        let candidates = self.peer_manager.lock().sync_candidates(from_round);
        let preferred: Vec<_> = candidates
            .iter()
            .filter(|(peer, _)| Some(peer) != exclude)
            .copied()
            .collect();
        let pool = if preferred.is_empty() { &candidates } else { &preferred };
        pool.choose(&mut rand::rng())
            .copied()
            .ok_or(ConsensusNetError::NoPeers)
    }
}

//! Inbound message router.
//!
//! Sits between the transport and the consensus thread. Every envelope is
//! rate limited per source address, authenticated, and checked for
//! signatures and originator consistency before anything reaches the
//! engine. Rejected envelopes are dropped and, where the sender can be
//! attributed, cost it score in the [`PeerManager`].

use {
    crate::{
        cache::Cache,
        config::ConsensusNetConfig,
        error::{ConsensusNetError, Result},
        message::{ConsensusNetMessage, SignedEnvelope},
        peer_manager::{Penalty, PeerManager},
        sync::SyncClient,
        transport::InboundEnvelope,
    },
    bastion_consensus_bft::{Certificate, CertifiedBatch},
    crossbeam_channel::Sender,
    log::{debug, info, trace, warn},
    parking_lot::Mutex,
    solana_pubkey::Pubkey,
    std::{net::SocketAddr, sync::Arc},
    tokio::sync::{mpsc, Mutex as AsyncMutex},
};

/// Window in which copies of the same certificate are dropped.
const CERTIFICATE_DEDUP_SECS: u64 = 30;

/// An authenticated message for the consensus thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedMessage {
    pub sender: Pubkey,
    pub message: ConsensusNetMessage,
}

/// Forwards into any queue whose events wrap a [`RoutedMessage`].
pub struct Router<T = RoutedMessage> {
    peer_manager: Arc<Mutex<PeerManager>>,
    cache: Arc<Cache>,
    sync: Option<Arc<AsyncMutex<SyncClient>>>,
    config: ConsensusNetConfig,
    consensus_tx: Sender<T>,
}

impl<T: From<RoutedMessage>> Router<T> {
    pub fn new(
        config: ConsensusNetConfig,
        peer_manager: Arc<Mutex<PeerManager>>,
        cache: Arc<Cache>,
        consensus_tx: Sender<T>,
    ) -> Self {
        Self {
            peer_manager,
            cache,
            sync: None,
            config,
            consensus_tx,
        }
    }

    /// Pass sync responses through `sync` so unsolicited ones are dropped.
    pub fn with_sync_client(mut self, sync: Arc<AsyncMutex<SyncClient>>) -> Self {
        self.sync = Some(sync);
        self
    }

    /// Route until the transport or the consensus channel closes.
    pub async fn run(self, mut inbound_rx: mpsc::Receiver<InboundEnvelope>) {
        while let Some(inbound) = inbound_rx.recv().await {
            match self.route(inbound).await {
                Ok(()) => {}
                Err(ConsensusNetError::ChannelClosed) => {
                    info!("consensus channel closed, router stopping");
                    return;
                }
                Err(e) => debug!("dropped inbound envelope: {e}"),
            }
        }
        info!("transport closed, router stopping");
    }

    /// Check one envelope and forward what survives.
    pub async fn route(&self, inbound: InboundEnvelope) -> Result<()> {
        let InboundEnvelope { envelope, from } = inbound;
        let sender = envelope.sender;

        let hits = self
            .cache
            .insert_inbound_event(from, self.config.rate_limit_interval_secs);
        if hits > self.config.max_events_per_interval {
            if hits == self.config.max_events_per_interval.saturating_add(1) {
                self.penalize_if_attributable(&sender, from, Penalty::RateLimited);
            }
            return Err(ConsensusNetError::RateLimited { addr: from, hits });
        }

        if self.peer_manager.lock().is_banned(&sender) {
            return Err(ConsensusNetError::Banned(sender));
        }
        if !envelope.verify() {
            warn!("bad envelope signature claiming {sender} from {from}");
            self.penalize_if_attributable(&sender, from, Penalty::InvalidSignature);
            return Err(ConsensusNetError::InvalidSignature(sender));
        }
        self.peer_manager.lock().record_received(&sender)?;

        if let Err(e) = self.check_message(&envelope) {
            warn!("rejected {} from {sender}: {e}", envelope.message.kind());
            let penalty = match e {
                ConsensusNetError::InvalidSignature(_) => Penalty::InvalidSignature,
                _ => Penalty::InvalidMessage,
            };
            self.peer_manager.lock().penalize(&sender, penalty);
            return Err(e);
        }

        match envelope.message {
            ConsensusNetMessage::Heartbeat {
                committed_round, ..
            } => {
                trace!("heartbeat from {sender} at round {committed_round}");
                self.peer_manager
                    .lock()
                    .record_heartbeat(&sender, committed_round);
                Ok(())
            }
            ConsensusNetMessage::Certificate(certified) => {
                let digest = certified.certificate.digest();
                if self
                    .cache
                    .insert_inbound_certificate(digest, CERTIFICATE_DEDUP_SECS)
                    > 1
                {
                    trace!("dropping repeated certificate {digest}");
                    return Ok(());
                }
                self.forward(sender, ConsensusNetMessage::Certificate(certified))
            }
            ConsensusNetMessage::SyncResponse { certificates } => {
                let certificates = match &self.sync {
                    Some(sync) => match sync.lock().await.handle_response(&sender, certificates) {
                        Some(certificates) => certificates,
                        None => {
                            debug!("unsolicited sync response from {sender}");
                            return Ok(());
                        }
                    },
                    None => certificates,
                };
                for certified in certificates {
                    self.forward(sender, ConsensusNetMessage::Certificate(certified))?;
                }
                Ok(())
            }
            message => self.forward(sender, message),
        }
    }

    fn forward(&self, sender: Pubkey, message: ConsensusNetMessage) -> Result<()> {
        trace!("forwarding {} from {sender}", message.kind());
        self.consensus_tx
            .send(T::from(RoutedMessage { sender, message }))
            .map_err(|_| ConsensusNetError::ChannelClosed)
    }

    /// Signatures and originators of the carried message.
    fn check_message(&self, envelope: &SignedEnvelope) -> Result<()> {
        let sender = envelope.sender;
        let invalid = |reason: String| ConsensusNetError::InvalidMessage { sender, reason };
        match &envelope.message {
            ConsensusNetMessage::Proposal { proposal, .. } => {
                if proposal.proposer != sender {
                    return Err(invalid(format!("proposal by {}", proposal.proposer)));
                }
                if !proposal.verify_signature() {
                    return Err(ConsensusNetError::InvalidSignature(sender));
                }
            }
            ConsensusNetMessage::Vote(vote) => {
                if vote.voter != sender {
                    return Err(invalid(format!("vote by {}", vote.voter)));
                }
                if !vote.verify_signature() {
                    return Err(ConsensusNetError::InvalidSignature(sender));
                }
            }
            ConsensusNetMessage::Certificate(certified) => {
                check_certificate(&certified.certificate, sender)?;
            }
            ConsensusNetMessage::SyncResponse { certificates } => {
                if certificates.len() > self.config.sync_batch_limit as usize {
                    return Err(invalid(format!("{} certificates in sync response", certificates.len())));
                }
                certificates
                    .iter()
                    .map(|c: &CertifiedBatch| &c.certificate)
                    .try_for_each(|c| check_certificate(c, sender))?;
            }
            ConsensusNetMessage::SyncRequest { limit, .. } => {
                if *limit == 0 {
                    return Err(invalid("empty sync request".to_string()));
                }
            }
            ConsensusNetMessage::Heartbeat { identity, .. } => {
                if *identity != sender {
                    return Err(invalid(format!("heartbeat for {identity}")));
                }
            }
        }
        Ok(())
    }

    /// Penalize only when the source IP is the claimed sender's, so a
    /// forged `sender` cannot frame another validator.
    fn penalize_if_attributable(&self, sender: &Pubkey, from: SocketAddr, penalty: Penalty) {
        let mut peers = self.peer_manager.lock();
        if peers.addr_of(sender).map(|addr| addr.ip()) == Some(from.ip()) {
            peers.penalize(sender, penalty);
        }
    }
}

fn check_certificate(certificate: &Certificate, sender: Pubkey) -> Result<()> {
    if certificate.votes.is_empty() {
        return Err(ConsensusNetError::InvalidMessage {
            sender,
            reason: format!("certificate {} without votes", certificate.key()),
        });
    }
    if !certificate.verify_signatures() {
        return Err(ConsensusNetError::InvalidSignature(sender));
    }
    Ok(())
}

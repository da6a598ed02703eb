//! Outbound pump between the consensus thread and the transport.
//!
//! Runs on its own thread so that slow or unreachable peers never block
//! consensus. Every message is wrapped in a [`SignedEnvelope`] and sent with
//! the transport helpers on the tokio runtime. Between messages the pump
//! sends heartbeats carrying our commit frontier, retries timed-out sync
//! requests and marks silent peers disconnected.

use {
    crate::consensus_service::Outbound,
    bastion_consensus_bft::{ConsensusMessage, Round},
    bastion_consensus_net::{
        transport, Cache, ConsensusNetConfig, ConsensusNetError, ConsensusNetMessage,
        PeerManager, SignedEnvelope, SyncClient,
    },
    crossbeam_channel::{Receiver, RecvTimeoutError},
    log::*,
    parking_lot::Mutex,
    solana_keypair::Keypair,
    solana_signer::Signer,
    std::{
        io,
        net::SocketAddr,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        thread::{self, Builder, JoinHandle},
        time::{Duration, Instant},
    },
    tokio::{runtime::Handle, sync::Mutex as AsyncMutex},
};

/// Upper bound on one wait, so exit is noticed promptly.
const POLL_INTERVAL_MS: u64 = 50;

pub struct NetworkBridge {
    thread: JoinHandle<()>,
}

struct Pump {
    keypair: Arc<Keypair>,
    peer_manager: Arc<Mutex<PeerManager>>,
    sync: Arc<AsyncMutex<SyncClient>>,
    cache: Arc<Cache>,
    config: ConsensusNetConfig,
    runtime: Handle,
    committed_round: Round,
    /// Sync that could not be sent yet, retried on the next heartbeat.
    deferred_sync: Option<Round>,
}

impl NetworkBridge {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        keypair: Arc<Keypair>,
        peer_manager: Arc<Mutex<PeerManager>>,
        sync: Arc<AsyncMutex<SyncClient>>,
        cache: Arc<Cache>,
        config: ConsensusNetConfig,
        runtime: Handle,
        outbound_receiver: Receiver<Outbound>,
        exit: Arc<AtomicBool>,
    ) -> io::Result<Self> {
        let mut pump = Pump {
            keypair,
            peer_manager,
            sync,
            cache,
            config,
            runtime,
            committed_round: 0,
            deferred_sync: None,
        };
        let thread = Builder::new()
            .name("bstNetBridge".to_string())
            .spawn(move || pump.run(&outbound_receiver, &exit))?;
        Ok(Self { thread })
    }

    pub fn join(self) -> thread::Result<()> {
        self.thread.join()
    }
}

impl Pump {
    fn run(&mut self, outbound_receiver: &Receiver<Outbound>, exit: &AtomicBool) {
        let heartbeat_interval = Duration::from_millis(self.config.heartbeat_interval_ms);
        let mut last_heartbeat = Instant::now();
        loop {
            if exit.load(Ordering::Relaxed) {
                break;
            }
            let wait = heartbeat_interval
                .saturating_sub(last_heartbeat.elapsed())
                .min(Duration::from_millis(POLL_INTERVAL_MS));
            match outbound_receiver.recv_timeout(wait) {
                Ok(outbound) => self.handle(outbound),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    info!("NetworkBridge: outbound channel disconnected, shutting down");
                    break;
                }
            }
            if last_heartbeat.elapsed() >= heartbeat_interval {
                self.maintain();
                last_heartbeat = Instant::now();
            }
        }
    }

    fn handle(&mut self, outbound: Outbound) {
        match outbound {
            Outbound::Broadcast(message) => self.broadcast(message),
            Outbound::SyncRequest(round) => self.request_sync(round),
            Outbound::SyncResponse { to, certificates } => {
                let Some(addr) = self.peer_manager.lock().addr_of(&to) else {
                    debug!("NetworkBridge: sync response for unknown peer {to}");
                    return;
                };
                let message = ConsensusNetMessage::SyncResponse { certificates };
                if let Err(e) = self.send(addr, message) {
                    debug!("NetworkBridge: sync response to {to} failed: {e}");
                }
            }
            Outbound::Penalize { peer, penalty } => {
                if self.peer_manager.lock().penalize(&peer, penalty) {
                    warn!("NetworkBridge: {peer} banned after {penalty:?}");
                }
            }
            Outbound::CommitteeChanged(committee) => {
                self.peer_manager
                    .lock()
                    .update_committee(committee.identities().into_iter().collect());
            }
            Outbound::Frontier(round) => self.committed_round = self.committed_round.max(round),
        }
    }

    fn broadcast(&mut self, message: ConsensusMessage) {
        let round = message.round();
        let message = ConsensusNetMessage::from(message);
        let kind = message.kind();
        let envelope = match SignedEnvelope::sign(&self.keypair, message) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!("NetworkBridge: cannot sign {kind} for round {round}: {e}");
                return;
            }
        };
        let targets = self.peer_manager.lock().broadcast_targets();
        let addrs: Vec<SocketAddr> = targets.iter().map(|(_, addr)| *addr).collect();
        for addr in &addrs {
            self.cache
                .insert_outbound_event(*addr, self.config.rate_limit_interval_secs);
        }
        let failures = self.runtime.block_on(transport::broadcast_envelope(
            &addrs,
            &envelope,
            self.config.max_message_size,
        ));
        trace!(
            "NetworkBridge: {kind} for round {round} sent to {}/{} peers",
            addrs.len().saturating_sub(failures.len()),
            addrs.len()
        );
        let mut peers = self.peer_manager.lock();
        for (identity, addr) in &targets {
            match failures.iter().find(|(failed, _)| failed == addr) {
                Some((_, e)) => debug!("NetworkBridge: send to {identity} failed: {e}"),
                None => peers.record_sent(identity),
            }
        }
    }

    fn send(&self, addr: SocketAddr, message: ConsensusNetMessage) -> Result<(), ConsensusNetError> {
        let envelope = SignedEnvelope::sign(&self.keypair, message)?;
        self.cache
            .insert_outbound_event(addr, self.config.rate_limit_interval_secs);
        self.runtime.block_on(transport::send_envelope(
            addr,
            &envelope,
            self.config.max_message_size,
        ))
    }

    fn request_sync(&mut self, round: Round) {
        let sync = self.sync.clone();
        match self
            .runtime
            .block_on(async move { sync.lock().await.request_from(round).await })
        {
            Ok(true) => self.deferred_sync = None,
            Ok(false) => {}
            Err(e) => {
                debug!("NetworkBridge: sync from round {round} deferred: {e}");
                self.deferred_sync = Some(self.deferred_sync.map_or(round, |r| r.min(round)));
            }
        }
    }

    /// Heartbeat, sync retries and liveness checks.
    fn maintain(&mut self) {
        let heartbeat = ConsensusNetMessage::Heartbeat {
            identity: self.keypair.pubkey(),
            committed_round: self.committed_round,
        };
        match SignedEnvelope::sign(&self.keypair, heartbeat) {
            Ok(envelope) => {
                let addrs: Vec<SocketAddr> = self
                    .peer_manager
                    .lock()
                    .broadcast_targets()
                    .into_iter()
                    .map(|(_, addr)| addr)
                    .collect();
                let failures = self.runtime.block_on(transport::broadcast_envelope(
                    &addrs,
                    &envelope,
                    self.config.max_message_size,
                ));
                if !failures.is_empty() {
                    trace!("NetworkBridge: heartbeat missed {} peers", failures.len());
                }
            }
            Err(e) => error!("NetworkBridge: cannot sign heartbeat: {e}"),
        }

        let sync = self.sync.clone();
        let abandoned = self
            .runtime
            .block_on(async move { sync.lock().await.retry_timed_out().await });
        if let Some(round) = abandoned.into_iter().min() {
            self.deferred_sync = Some(self.deferred_sync.map_or(round, |r| r.min(round)));
        }
        if let Some(round) = self.deferred_sync.take() {
            self.request_sync(round);
        }
        self.peer_manager.lock().evict_stale_peers();
    }
}

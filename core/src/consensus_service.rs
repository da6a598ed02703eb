//! Bastion BFT consensus service.
//!
//! A dedicated thread that owns the [`BftAdapter`] and drives it:
//!
//! 1. Takes [`ConsensusEvent`]s off a crossbeam queue: authenticated
//!    messages from the router and explicit round timeouts.
//! 2. Fires the round timer itself when the queue stays quiet past the
//!    deadline, through the same path as a queued timeout.
//! 3. Answers sync requests from its certificate storage.
//! 4. Turns adapter output into [`Outbound`] work for the network bridge.
//!
//! ```text
//!   Router ──ConsensusEvent──▶ ┌───────────────────┐ ──Outbound──▶ NetworkBridge
//!                              │ ConsensusService  │
//!   (timer: recv_timeout) ───▶ │   BftAdapter      │
//!                              └───────────────────┘
//! ```

use {
    crate::bft_adapter::{AdapterError, AdapterOutput, BftAdapter},
    bastion_consensus_bft::{
        CertifiedBatch, Committee, ConsensusMessage, LedgerCommitSink, Round,
    },
    bastion_consensus_net::{ConsensusNetMessage, Penalty, RoutedMessage},
    crossbeam_channel::{Receiver, RecvTimeoutError, Sender},
    log::*,
    solana_pubkey::Pubkey,
    std::{
        io,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        thread::{self, Builder, JoinHandle},
        time::Duration,
    },
};

/// How often to poll for timeouts and exit when no events are arriving.
const TIMEOUT_POLL_INTERVAL_MS: u64 = 50;

/// Input to the consensus thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsensusEvent {
    Inbound(RoutedMessage),
    /// The timer of `round` expired. Ignored if the round is over.
    Timeout(Round),
}

impl From<RoutedMessage> for ConsensusEvent {
    fn from(routed: RoutedMessage) -> Self {
        Self::Inbound(routed)
    }
}

/// Work for the network side.
#[derive(Debug, Clone)]
pub enum Outbound {
    Broadcast(ConsensusMessage),
    /// Ask a peer for certified batches from this round on.
    SyncRequest(Round),
    SyncResponse {
        to: Pubkey,
        certificates: Vec<CertifiedBatch>,
    },
    Penalize {
        peer: Pubkey,
        penalty: Penalty,
    },
    CommitteeChanged(Arc<Committee>),
    /// New commit frontier, announced in heartbeats.
    Frontier(Round),
}

pub struct ConsensusService<L: LedgerCommitSink> {
    thread: JoinHandle<BftAdapter<L>>,
}

impl<L: LedgerCommitSink + 'static> ConsensusService<L> {
    /// Spawn the consensus thread. `sync_batch_limit` caps the certificates
    /// returned per sync request.
    pub fn new(
        mut adapter: BftAdapter<L>,
        sync_batch_limit: usize,
        event_receiver: Receiver<ConsensusEvent>,
        outbound_sender: Sender<Outbound>,
        exit: Arc<AtomicBool>,
    ) -> io::Result<Self> {
        let thread = Builder::new()
            .name("bstConsensus".to_string())
            .spawn(move || {
                Self::run(
                    &mut adapter,
                    sync_batch_limit,
                    &event_receiver,
                    &outbound_sender,
                    &exit,
                );
                adapter
            })?;
        Ok(Self { thread })
    }

    /// Wait for the thread to exit and take back the adapter.
    pub fn join(self) -> thread::Result<BftAdapter<L>> {
        self.thread.join()
    }

    fn run(
        adapter: &mut BftAdapter<L>,
        sync_batch_limit: usize,
        event_receiver: &Receiver<ConsensusEvent>,
        outbound_sender: &Sender<Outbound>,
        exit: &AtomicBool,
    ) {
        info!(
            "ConsensusService: starting at round {} (identity: {})",
            adapter.round(),
            adapter.identity()
        );
        let poll = Duration::from_millis(TIMEOUT_POLL_INTERVAL_MS);
        let started = adapter.start();
        Self::dispatch(started, outbound_sender);

        loop {
            if exit.load(Ordering::Relaxed) {
                info!("ConsensusService: exit signal received, shutting down");
                break;
            }

            let wait = adapter
                .time_to_next_timeout()
                .map_or(poll, |remaining| remaining.min(poll));

            let result = match event_receiver.recv_timeout(wait) {
                Ok(ConsensusEvent::Inbound(routed)) => Self::handle_inbound(
                    adapter,
                    routed,
                    sync_batch_limit,
                    outbound_sender,
                ),
                Ok(ConsensusEvent::Timeout(round)) => adapter.handle_timeout(round),
                Err(RecvTimeoutError::Timeout) => adapter.check_timeouts(),
                Err(RecvTimeoutError::Disconnected) => {
                    info!("ConsensusService: event channel disconnected, shutting down");
                    break;
                }
            };
            Self::dispatch(result, outbound_sender);
        }

        info!(
            "ConsensusService: loop exited at round {} (frontier {})",
            adapter.round(),
            adapter.frontier()
        );
    }

    fn handle_inbound(
        adapter: &mut BftAdapter<L>,
        routed: RoutedMessage,
        sync_batch_limit: usize,
        outbound_sender: &Sender<Outbound>,
    ) -> Result<AdapterOutput, AdapterError> {
        let RoutedMessage { sender, message } = routed;
        trace!("ConsensusService: {} from {sender}", message.kind());
        if let ConsensusNetMessage::SyncRequest { from_round, limit } = message {
            let limit = (limit as usize).min(sync_batch_limit);
            let certificates = adapter.handle_sync_request(from_round, limit)?;
            debug!(
                "ConsensusService: serving {} certificates from round {from_round} to {sender}",
                certificates.len()
            );
            Self::send(
                outbound_sender,
                Outbound::SyncResponse {
                    to: sender,
                    certificates,
                },
            );
            return Ok(AdapterOutput::default());
        }
        match message.into_consensus() {
            Some(message) => adapter.handle_message(&sender, message),
            None => Ok(AdapterOutput::default()),
        }
    }

    fn dispatch(result: Result<AdapterOutput, AdapterError>, outbound_sender: &Sender<Outbound>) {
        let output = match result {
            Ok(output) => output,
            Err(AdapterError::Halted(reason)) => {
                trace!("ConsensusService: input ignored, halted ({reason})");
                return;
            }
            Err(err) => {
                error!("ConsensusService: {err}");
                return;
            }
        };

        let AdapterOutput {
            messages,
            committed,
            sync_from,
            evidence,
            faulty,
            committee_changed,
        } = output;
        for message in messages {
            Self::send(outbound_sender, Outbound::Broadcast(message));
        }
        if let Some(round) = sync_from {
            Self::send(outbound_sender, Outbound::SyncRequest(round));
        }
        for peer in faulty {
            Self::send(
                outbound_sender,
                Outbound::Penalize {
                    peer,
                    penalty: Penalty::InvalidMessage,
                },
            );
        }
        for ev in evidence {
            Self::send(
                outbound_sender,
                Outbound::Penalize {
                    peer: ev.validator,
                    penalty: Penalty::Equivocation,
                },
            );
        }
        if let Some(committee) = committee_changed {
            Self::send(outbound_sender, Outbound::CommitteeChanged(committee));
        }
        if let Some(record) = committed.last() {
            Self::send(outbound_sender, Outbound::Frontier(record.round));
        }
    }

    fn send(outbound_sender: &Sender<Outbound>, outbound: Outbound) {
        if let Err(e) = outbound_sender.send(outbound) {
            warn!("ConsensusService: failed to queue outbound work: {e}");
        }
    }
}

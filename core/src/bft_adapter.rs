//! BFT consensus adapter for the Bastion validator.
//!
//! Bridges the pure `bastion-consensus-bft` engine with everything that has
//! side effects: the mempool, the ledger, sled storage and the committee
//! registry.
//!
//! # Data flow
//!
//! ```text
//!  ConsensusMessage / timeout
//!            |
//!            v
//!  +------------------+   EngineOutput   +---------------------------------+
//!  | ConsensusEngine  |----------------->| BftAdapter                      |
//!  +------------------+                  |  1. persist safety state        |
//!            ^                           |  2. persist certificates        |
//!            | propose(next batch)       |  3. restore orphaned batches    |
//!            |                           |  4. apply commits, then record  |
//!  +------------------+                  |  5. re-arm timer, next epoch    |
//!  | Mempool          |<-----------------+---------------------------------+
//!  +------------------+                                  |
//!                                                        v
//!                                     AdapterOutput (messages to broadcast)
//! ```
//!
//! Outbound messages are only released after the state they depend on is
//! durable: a vote never leaves before the [`SafetyState`] that allows it is
//! flushed. Commits are applied to the ledger before their record is
//! written, so a crash in between replays the round, which the ledger
//! treats as a no-op.

use {
    crate::storage::{SledStorage, StorageError},
    bastion_consensus_bft::{
        BftConfig, CertificateStore, CertifiedBatch, CommitRecord, Committee, CommitteeManager,
        ConsensusEngine, ConsensusError, ConsensusMessage, EngineOutput, EquivocationEvidence,
        LedgerCommitSink, Mempool, Round, SafetyState, TimeoutScheduler, GENESIS_ROUND,
    },
    log::*,
    parking_lot::RwLock,
    solana_keypair::Keypair,
    solana_pubkey::Pubkey,
    solana_signer::Signer,
    std::{sync::Arc, time::Duration},
    thiserror::Error,
};

#[derive(Error, Debug)]
pub enum AdapterError {
    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    /// A fatal error stopped local commitment earlier.
    #[error("consensus halted: {0}")]
    Halted(String),
}

pub type Result<T> = std::result::Result<T, AdapterError>;

/// What the service has to act on after an input.
#[derive(Debug, Default)]
pub struct AdapterOutput {
    /// Messages to broadcast to every peer.
    pub messages: Vec<ConsensusMessage>,
    /// Commit records appended by this input, in sequence order.
    pub committed: Vec<CommitRecord>,
    /// Certified batches from this round on are missing locally.
    pub sync_from: Option<Round>,
    pub evidence: Vec<EquivocationEvidence>,
    /// Senders whose input was malformed.
    pub faulty: Vec<Pubkey>,
    /// Committee installed for a new epoch.
    pub committee_changed: Option<Arc<Committee>>,
}

impl AdapterOutput {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
            && self.committed.is_empty()
            && self.sync_from.is_none()
            && self.evidence.is_empty()
            && self.faulty.is_empty()
            && self.committee_changed.is_none()
    }

    fn request_sync(&mut self, from_round: Round) {
        self.sync_from = Some(
            self.sync_from
                .map_or(from_round, |pending| pending.min(from_round)),
        );
    }
}

/// Owns the consensus engine and applies its decisions.
pub struct BftAdapter<L: LedgerCommitSink> {
    engine: ConsensusEngine,
    timeouts: TimeoutScheduler,
    config: BftConfig,
    keypair: Arc<Keypair>,
    committees: Arc<RwLock<CommitteeManager>>,
    mempool: Arc<Mempool>,
    storage: SledStorage,
    ledger: L,
    next_sequence: u64,
    /// Resumed from non-empty storage; the first output asks peers for
    /// whatever was missed while down.
    recovered: bool,
    halted: Option<String>,
}

impl<L: LedgerCommitSink> BftAdapter<L> {
    /// Build the adapter, resuming from `storage` if it holds state.
    ///
    /// Committed rounds the ledger has not applied yet are replayed into it
    /// before the engine starts.
    pub fn new(
        config: BftConfig,
        keypair: Arc<Keypair>,
        committees: Arc<RwLock<CommitteeManager>>,
        mempool: Arc<Mempool>,
        storage: SledStorage,
        mut ledger: L,
    ) -> Result<Self> {
        let state = storage.recover()?;
        let recovered = !state.is_empty();
        let resume_round = state.frontier().saturating_add(1);

        let engine = {
            let mut manager = committees.write();
            let target_epoch = config.epoch_of(resume_round.saturating_add(config.vote_buffer_rounds));
            while manager.current_epoch() < target_epoch {
                manager.advance_epoch()?;
            }
            let committee = manager.current_committee(manager.current_epoch())?;
            let mut engine = if recovered {
                let store = CertificateStore::restore(
                    state.commits.iter().map(|record| (record.digest, record.round)),
                    state.certificates,
                );
                ConsensusEngine::restore(
                    config.clone(),
                    keypair.clone(),
                    committee,
                    store,
                    state.batches.clone(),
                    state.safety,
                )
            } else {
                ConsensusEngine::new(config.clone(), keypair.clone(), committee)
            };
            for epoch in 0..manager.current_epoch() {
                if let Ok(committee) = manager.current_committee(epoch) {
                    engine.install_committee(committee);
                }
            }
            engine
        };

        let applied = ledger.last_applied_round().unwrap_or(GENESIS_ROUND);
        for record in state.commits.iter().filter(|record| record.round > applied) {
            let batch = state.batches.get(&record.digest).ok_or_else(|| {
                StorageError::Corrupt(format!("batch of committed round {} missing", record.round))
            })?;
            ledger
                .apply(record.round, batch)
                .map_err(|source| ConsensusError::LedgerApplyFailure {
                    round: record.round,
                    source,
                })?;
        }
        if recovered {
            info!(
                "recovered {} commits, frontier {}, resuming at round {}",
                state.commits.len(),
                engine.frontier(),
                engine.round()
            );
        }

        Ok(Self {
            timeouts: TimeoutScheduler::new(config.clone()),
            next_sequence: state.commits.len() as u64,
            engine,
            config,
            keypair,
            committees,
            mempool,
            storage,
            ledger,
            recovered,
            halted: None,
        })
    }

    // -- Public API --

    /// Arm the first round timer and propose if this node leads the round.
    pub fn start(&mut self) -> Result<AdapterOutput> {
        info!(
            "starting consensus at round {} as {:?} (identity {})",
            self.engine.round(),
            self.engine.role(),
            self.identity()
        );
        self.timeouts.start(self.engine.round());
        let mut output = self.tick()?;
        if self.recovered {
            output.request_sync(self.engine.frontier().saturating_add(1));
        }
        Ok(output)
    }

    /// Feed an authenticated message from `sender` to the engine.
    pub fn handle_message(
        &mut self,
        sender: &Pubkey,
        message: ConsensusMessage,
    ) -> Result<AdapterOutput> {
        self.ensure_running()?;
        let result = match message {
            ConsensusMessage::Proposal { proposal, batch } => {
                self.engine.on_proposal(proposal, batch)
            }
            ConsensusMessage::Vote(vote) => self.engine.on_vote(vote),
            ConsensusMessage::Certificate(certified) => self.engine.on_certificate(certified),
        };
        self.drive(result, Some(*sender))
    }

    /// Fire the round timer if it expired; otherwise just check whether we
    /// should propose.
    pub fn check_timeouts(&mut self) -> Result<AdapterOutput> {
        match self.timeouts.check_expired() {
            Some(round) => self.handle_timeout(round),
            None => self.tick(),
        }
    }

    /// Handle the expiry of `round`. A round that is no longer current is a
    /// no-op for the engine.
    pub fn handle_timeout(&mut self, round: Round) -> Result<AdapterOutput> {
        self.ensure_running()?;
        let result = self.engine.on_timeout(round);
        let output = self.drive(result, None)?;
        if self.timeouts.check_expired().is_some() {
            // stale deadline of a round the engine already left
            self.timeouts.start(self.engine.round());
        }
        Ok(output)
    }

    /// Propose if this node may do so now.
    pub fn tick(&mut self) -> Result<AdapterOutput> {
        self.ensure_running()?;
        self.drive(Ok(EngineOutput::default()), None)
    }

    /// Certified batches from `from_round` on, for a peer catching up.
    pub fn handle_sync_request(&self, from_round: Round, limit: usize) -> Result<Vec<CertifiedBatch>> {
        let from_round = from_round.max(GENESIS_ROUND.saturating_add(1));
        Ok(self.storage.certified_batches_from(from_round, limit)?)
    }

    pub fn time_to_next_timeout(&self) -> Option<Duration> {
        self.timeouts.remaining()
    }

    // -- Accessors --

    pub fn round(&self) -> Round {
        self.engine.round()
    }

    pub fn frontier(&self) -> Round {
        self.engine.frontier()
    }

    pub fn identity(&self) -> Pubkey {
        self.keypair.pubkey()
    }

    pub fn safety_state(&self) -> SafetyState {
        self.engine.safety_state()
    }

    pub fn engine(&self) -> &ConsensusEngine {
        &self.engine
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    pub fn storage(&self) -> &SledStorage {
        &self.storage
    }

    pub fn mempool(&self) -> &Arc<Mempool> {
        &self.mempool
    }

    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    // -- Internal --

    fn ensure_running(&self) -> Result<()> {
        match &self.halted {
            Some(reason) => Err(AdapterError::Halted(reason.clone())),
            None => Ok(()),
        }
    }

    /// Apply an engine result, then propose at most once if we lead the
    /// round we ended up in.
    fn drive(
        &mut self,
        result: bastion_consensus_bft::Result<EngineOutput>,
        sender: Option<Pubkey>,
    ) -> Result<AdapterOutput> {
        let mut output = AdapterOutput::default();
        let step = self.step(result, sender, &mut output);
        let step = step.and_then(|()| {
            if !self.engine.can_propose() {
                return Ok(());
            }
            let batch = self
                .mempool
                .next_batch(self.config.max_batch_transactions, self.config.max_batch_bytes);
            let proposed = self.engine.propose(batch);
            self.step(proposed, None, &mut output)
        });
        if let Err(err) = step {
            error!("consensus halted at round {}: {err}", self.engine.round());
            self.timeouts.cancel();
            self.halted = Some(err.to_string());
            return Err(err);
        }
        Ok(output)
    }

    fn step(
        &mut self,
        result: bastion_consensus_bft::Result<EngineOutput>,
        sender: Option<Pubkey>,
        output: &mut AdapterOutput,
    ) -> Result<()> {
        match result {
            Ok(engine_output) => self.apply(engine_output, output)?,
            Err(err) => self.absorb(err, sender, output)?,
        }
        self.advance_epochs(output)
    }

    fn absorb(
        &mut self,
        err: ConsensusError,
        sender: Option<Pubkey>,
        output: &mut AdapterOutput,
    ) -> Result<()> {
        output.evidence.extend(self.engine.drain_evidence());
        if err.is_fatal() {
            return Err(err.into());
        }
        match &err {
            ConsensusError::DanglingReference { .. } => {
                debug!("{err}; requesting sync");
                output.request_sync(self.engine.frontier().saturating_add(1));
            }
            ConsensusError::Equivocation { .. } => warn!("{err}"),
            ConsensusError::StaleRound { .. }
            | ConsensusError::BehindRound { .. }
            | ConsensusError::DuplicateCertificate(_) => {
                trace!("{err}")
            }
            _ if err.is_peer_fault() => {
                warn!("rejected input from {sender:?}: {err}");
                output.faulty.extend(sender);
            }
            _ => debug!("{err}"),
        }
        Ok(())
    }

    fn apply(&mut self, engine_output: EngineOutput, output: &mut AdapterOutput) -> Result<()> {
        let EngineOutput {
            messages,
            certified,
            committed,
            orphaned,
            evidence,
            timed_out,
            sync_from,
            round_changed,
            safety,
        } = engine_output;

        if let Some(safety) = safety {
            self.storage.put_safety_state(&safety)?;
        }
        for certified in &certified {
            self.storage.put_certified(certified)?;
            self.mempool.remove_certified(&certified.batch);
        }
        for orphan in &orphaned {
            self.storage.remove_certified(&orphan.certificate)?;
            let restored = self.mempool.restore(&orphan.batch);
            debug!(
                "restored {restored} transactions of orphaned round {}",
                orphan.round()
            );
        }
        for certified in committed {
            self.commit(certified, output)?;
        }

        if !certified.is_empty() {
            self.timeouts.record_progress();
        }
        if timed_out.is_some() {
            self.timeouts.record_timeout();
        }
        if round_changed.is_some() {
            self.timeouts.start(self.engine.round());
        }
        if let Some(round) = sync_from {
            output.request_sync(round);
        }
        for ev in &evidence {
            warn!(
                "{} equivocation by {} in round {}",
                ev.kind, ev.validator, ev.round
            );
        }
        output.evidence.extend(evidence);
        output.messages.extend(messages);
        Ok(())
    }

    fn commit(&mut self, certified: CertifiedBatch, output: &mut AdapterOutput) -> Result<()> {
        let round = certified.round();
        let digest = certified.certificate.digest();
        let ledger_height = self
            .ledger
            .apply(round, &certified.batch)
            .map_err(|source| ConsensusError::LedgerApplyFailure { round, source })?;
        let record = CommitRecord {
            sequence: self.next_sequence,
            round,
            digest,
            ledger_height,
        };
        self.storage.append_commit(&record)?;
        self.next_sequence = self.next_sequence.saturating_add(1);
        // orphans restored above may share transactions with this batch
        self.mempool.remove_certified(&certified.batch);
        info!(
            "commit #{}: round {round} at ledger height {ledger_height} ({} transactions)",
            record.sequence,
            certified.batch.len()
        );
        output.committed.push(record);
        Ok(())
    }

    /// Install committees up to the epoch of the furthest round we accept
    /// votes for.
    fn advance_epochs(&mut self, output: &mut AdapterOutput) -> Result<()> {
        let horizon = self
            .engine
            .round()
            .saturating_add(self.config.vote_buffer_rounds);
        let target = self.config.epoch_of(horizon);
        let mut manager = self.committees.write();
        while manager.current_epoch() < target {
            let transition = manager.advance_epoch()?;
            for validator in &transition.released {
                info!("stake of {} released", validator.identity);
            }
            self.engine.install_committee(transition.committee.clone());
            output.committee_changed = Some(transition.committee);
        }
        let floor = self
            .engine
            .frontier()
            .saturating_sub(self.config.gc_depth);
        manager.prune(self.config.epoch_of(floor));
        Ok(())
    }
}

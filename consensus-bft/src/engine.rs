//! The finality engine.
//!
//! A round-based state machine: the round leader proposes a batch on top of
//! the highest certificate it knows, every committee member votes once per
//! round, and a quorum of votes forms a certificate that moves everyone to
//! the next round. A certificate commits, together with its uncommitted
//! ancestors, once a quorum certifies a direct child of it in the very next
//! round.
//!
//! The engine is deterministic and performs no I/O. Callers feed it
//! signature-checked messages and timer events and act on the returned
//! [`EngineOutput`]: broadcast `messages`, persist `certified` and `safety`
//! before sending, and hand `committed` batches to the ledger in order.
//!
//! # Voting rule
//!
//! A validator votes for a round's proposal only if it has not voted in that
//! round or any later one and the proposal's primary parent is at least as
//! recent as its lock. Voting raises the lock to that parent's round. Any
//! two quorums share an honest validator, so a committed certificate is an
//! ancestor of every later certificate.

use {
    crate::{
        committee::Committee,
        config::BftConfig,
        dag::CertificateStore,
        error::{ConsensusError, Result},
        evidence::{EquivocationEvidence, EvidenceCollector},
        leader::{self, Role},
        types::{
            Batch, Certificate, CertifiedBatch, ConsensusMessage, Epoch, Proposal, Round,
            SafetyState, Vote, GENESIS_ROUND,
        },
    },
    log::*,
    solana_hash::Hash,
    solana_keypair::Keypair,
    solana_pubkey::Pubkey,
    solana_signer::Signer,
    std::{
        collections::{BTreeMap, HashMap},
        sync::Arc,
    },
};

/// Where a round stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for the leader's proposal.
    Idle(Round),
    /// Proposal known, no vote cast for it.
    Proposed(Round, Proposal),
    /// This node voted for the proposal.
    Voting(Round, Proposal),
    Certified(Round, Certificate),
    Committed(Round),
    TimedOut(Round),
}

impl Phase {
    pub fn round(&self) -> Round {
        match self {
            Phase::Idle(r)
            | Phase::Proposed(r, _)
            | Phase::Voting(r, _)
            | Phase::Certified(r, _)
            | Phase::Committed(r)
            | Phase::TimedOut(r) => *r,
        }
    }

    /// Certified, committed or timed out: no more votes are collected.
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            Phase::Certified(..) | Phase::Committed(_) | Phase::TimedOut(_)
        )
    }
}

/// Result of processing one input.
#[derive(Debug, Default)]
pub struct EngineOutput {
    /// Messages to broadcast to every peer.
    pub messages: Vec<ConsensusMessage>,
    /// Certificates newly added to the store, to persist.
    pub certified: Vec<CertifiedBatch>,
    /// Newly committed batches in commit order.
    pub committed: Vec<CertifiedBatch>,
    /// Certificates that can no longer commit; their transactions go back to
    /// the mempool.
    pub orphaned: Vec<CertifiedBatch>,
    pub evidence: Vec<EquivocationEvidence>,
    /// Round that ended without a certificate.
    pub timed_out: Option<Round>,
    /// Peers should be asked for certificates from this round on.
    pub sync_from: Option<Round>,
    /// The round the engine moved to.
    pub round_changed: Option<Round>,
    /// Voting state to persist before any message is sent.
    pub safety: Option<SafetyState>,
}

impl EngineOutput {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
            && self.certified.is_empty()
            && self.committed.is_empty()
            && self.orphaned.is_empty()
            && self.evidence.is_empty()
            && self.timed_out.is_none()
            && self.sync_from.is_none()
            && self.round_changed.is_none()
            && self.safety.is_none()
    }

    pub fn merge(&mut self, other: EngineOutput) {
        self.messages.extend(other.messages);
        self.certified.extend(other.certified);
        self.committed.extend(other.committed);
        self.orphaned.extend(other.orphaned);
        self.evidence.extend(other.evidence);
        self.timed_out = other.timed_out.or(self.timed_out);
        self.sync_from = match (self.sync_from, other.sync_from) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.round_changed = other.round_changed.or(self.round_changed);
        self.safety = other.safety.or(self.safety);
    }
}

#[derive(Debug)]
struct RoundState {
    phase: Phase,
    proposal: Option<Proposal>,
    /// Votes by proposal digest, then voter.
    votes: HashMap<Hash, HashMap<Pubkey, Vote>>,
}

impl RoundState {
    fn new(round: Round) -> Self {
        Self {
            phase: Phase::Idle(round),
            proposal: None,
            votes: HashMap::new(),
        }
    }
}

pub struct ConsensusEngine {
    config: BftConfig,
    keypair: Arc<Keypair>,
    identity: Pubkey,
    /// Installed committees by epoch.
    committees: BTreeMap<Epoch, Arc<Committee>>,
    store: CertificateStore,
    /// Batches of known proposals and certificates, by proposal digest.
    batches: HashMap<Hash, Batch>,
    rounds: BTreeMap<Round, RoundState>,
    round: Round,
    safety: SafetyState,
    evidence: EvidenceCollector,
    /// Proposals waiting for parent certificates.
    parked: BTreeMap<Round, (Proposal, Batch)>,
}

impl ConsensusEngine {
    /// Start at round 1 on top of genesis.
    pub fn new(config: BftConfig, keypair: Arc<Keypair>, committee: Arc<Committee>) -> Self {
        let identity = keypair.pubkey();
        let round = GENESIS_ROUND.saturating_add(1);
        let mut rounds = BTreeMap::new();
        rounds.insert(round, RoundState::new(round));
        let mut committees = BTreeMap::new();
        committees.insert(committee.epoch(), committee);
        Self {
            config,
            keypair,
            identity,
            committees,
            store: CertificateStore::new(),
            batches: HashMap::new(),
            rounds,
            round,
            safety: SafetyState::default(),
            evidence: EvidenceCollector::new(),
            parked: BTreeMap::new(),
        }
    }

    /// Resume from persisted state at the round after the commit frontier.
    /// `batches` maps certificate digests to their batches.
    pub fn restore(
        config: BftConfig,
        keypair: Arc<Keypair>,
        committee: Arc<Committee>,
        store: CertificateStore,
        batches: HashMap<Hash, Batch>,
        safety: SafetyState,
    ) -> Self {
        let mut engine = Self::new(config, keypair, committee);
        let round = store.frontier().saturating_add(1);
        for certificate in store.certificates_from(round, usize::MAX) {
            let cert_round = certificate.round();
            engine.rounds.insert(
                cert_round,
                RoundState {
                    phase: Phase::Certified(cert_round, certificate.clone()),
                    proposal: Some(certificate.proposal.clone()),
                    votes: HashMap::new(),
                },
            );
        }
        engine.rounds.entry(round).or_insert_with(|| RoundState::new(round));
        engine.rounds = engine.rounds.split_off(&round);
        engine.store = store;
        engine.batches = batches;
        engine.safety = safety;
        engine.round = round;
        info!(
            "engine restored at round {round} (frontier {}, locked {}, last voted {})",
            engine.store.frontier(),
            safety.locked_round,
            safety.last_voted_round
        );
        engine
    }

    // -- Committees --

    /// Make `committee` available for the rounds of its epoch.
    pub fn install_committee(&mut self, committee: Arc<Committee>) {
        info!(
            "installing committee for epoch {} ({} members)",
            committee.epoch(),
            committee.len()
        );
        self.committees.insert(committee.epoch(), committee);
    }

    pub fn has_committee(&self, epoch: Epoch) -> bool {
        self.committees.contains_key(&epoch)
    }

    /// Committee responsible for `round`.
    pub fn committee(&self, round: Round) -> Result<Arc<Committee>> {
        self.committees
            .get(&self.config.epoch_of(round))
            .cloned()
            .ok_or_else(|| {
                ConsensusError::CommitteeMisconfiguration(format!(
                    "no committee for epoch {}",
                    self.config.epoch_of(round)
                ))
            })
    }

    /// Committee for `round`, or `None` if its epoch lies beyond every
    /// installed committee and has simply not been reached yet.
    fn committee_or_defer(&self, round: Round) -> Result<Option<Arc<Committee>>> {
        let epoch = self.config.epoch_of(round);
        if let Some(committee) = self.committees.get(&epoch) {
            return Ok(Some(committee.clone()));
        }
        match self.committees.keys().next_back() {
            Some(latest) if epoch > *latest => Ok(None),
            _ => Err(ConsensusError::CommitteeMisconfiguration(format!(
                "no committee for epoch {epoch}"
            ))),
        }
    }

    // -- Accessors --

    pub fn round(&self) -> Round {
        self.round
    }

    pub fn identity(&self) -> &Pubkey {
        &self.identity
    }

    pub fn config(&self) -> &BftConfig {
        &self.config
    }

    pub fn safety_state(&self) -> SafetyState {
        self.safety
    }

    pub fn store(&self) -> &CertificateStore {
        &self.store
    }

    pub fn frontier(&self) -> Round {
        self.store.frontier()
    }

    pub fn phase(&self) -> Phase {
        self.phase_of(self.round)
    }

    /// Phase of a round still held in memory; rounds never entered are idle.
    pub fn phase_of(&self, round: Round) -> Phase {
        self.rounds
            .get(&round)
            .map(|state| state.phase.clone())
            .unwrap_or(Phase::Idle(round))
    }

    pub fn evidence(&self) -> &EvidenceCollector {
        &self.evidence
    }

    /// Proposals waiting for their round to open or their parents to arrive.
    pub fn parked_len(&self) -> usize {
        self.parked.len()
    }

    /// Evidence recorded while handling inputs that returned an error.
    pub fn drain_evidence(&mut self) -> Vec<EquivocationEvidence> {
        self.evidence.drain_evidence()
    }

    /// Role of this node in the current round.
    pub fn role(&self) -> Role {
        match self.committee_or_defer(self.round) {
            Ok(Some(committee)) => leader::role(self.round, &committee, &self.identity),
            _ => Role::Observer,
        }
    }

    /// Certified batches from `round` on, for answering sync requests.
    pub fn certified_batches_from(&self, round: Round, limit: usize) -> Vec<CertifiedBatch> {
        self.store
            .certificates_from(round, limit)
            .into_iter()
            .filter_map(|certificate| {
                self.batches
                    .get(&certificate.digest())
                    .map(|batch| CertifiedBatch {
                        certificate: certificate.clone(),
                        batch: batch.clone(),
                    })
            })
            .collect()
    }

    // -- Inputs --

    /// Whether this node should propose now: it leads the current round,
    /// has not proposed or voted in it, and the previous round is certified,
    /// timed out, or genesis.
    pub fn can_propose(&self) -> bool {
        let round = self.round;
        if round <= self.safety.last_voted_round {
            return false;
        }
        if self.role() != Role::Leader {
            return false;
        }
        if self
            .rounds
            .get(&round)
            .is_some_and(|state| state.proposal.is_some())
        {
            return false;
        }
        let previous = round.saturating_sub(1);
        if previous == GENESIS_ROUND
            || matches!(self.phase_of(previous), Phase::TimedOut(_))
        {
            return true;
        }
        match self.committee_or_defer(previous) {
            Ok(Some(committee)) => self.store.round_complete(previous, &committee),
            _ => false,
        }
    }

    /// Propose `batch` for the current round if this node may do so; the
    /// output carries the proposal and this node's own vote.
    pub fn propose(&mut self, batch: Batch) -> Result<EngineOutput> {
        if !self.can_propose() {
            trace!("round {}: not proposing", self.round);
            return Ok(EngineOutput::default());
        }
        let round = self.round;
        let parents = self
            .store
            .high_certificate()
            .map(|cert| vec![cert.digest()])
            .unwrap_or_default();
        let proposal = Proposal::new_signed(&self.keypair, round, batch.digest, parents);
        info!(
            "round {round}: proposing {} with {} transactions",
            proposal.digest(),
            batch.len()
        );

        let mut output = EngineOutput::default();
        output.messages.push(ConsensusMessage::Proposal {
            proposal: proposal.clone(),
            batch: batch.clone(),
        });
        output.merge(self.handle_proposal(proposal, batch)?);
        Ok(self.finish(output))
    }

    /// Handle the round leader's proposal.
    pub fn on_proposal(&mut self, proposal: Proposal, batch: Batch) -> Result<EngineOutput> {
        let output = self.handle_proposal(proposal, batch)?;
        Ok(self.finish(output))
    }

    /// Handle a vote from a committee member.
    pub fn on_vote(&mut self, vote: Vote) -> Result<EngineOutput> {
        let output = self.handle_vote(vote)?;
        Ok(self.finish(output))
    }

    /// Handle a certificate received from a peer or through sync.
    pub fn on_certificate(&mut self, certified: CertifiedBatch) -> Result<EngineOutput> {
        let output = self.handle_certificate(certified)?;
        Ok(self.finish(output))
    }

    /// Handle the expiry of `round`'s timer. Timers of rounds that are no
    /// longer current, or that already produced a certificate, are ignored.
    pub fn on_timeout(&mut self, round: Round) -> Result<EngineOutput> {
        let mut output = EngineOutput::default();
        if round != self.round {
            trace!("ignoring stale timeout for round {round} (current {})", self.round);
            return Ok(output);
        }
        let state = self
            .rounds
            .entry(round)
            .or_insert_with(|| RoundState::new(round));
        if state.phase.is_closed() {
            return Ok(output);
        }
        warn!("{}", ConsensusError::QuorumTimeout { round });
        state.votes.clear();
        state.phase = Phase::TimedOut(round);
        output.timed_out = Some(round);
        self.advance_to(round.saturating_add(1), &mut output);
        self.retry_parked(&mut output);
        Ok(self.finish(output))
    }

    // -- Handlers --

    fn handle_proposal(&mut self, proposal: Proposal, batch: Batch) -> Result<EngineOutput> {
        let mut output = EngineOutput::default();
        let round = proposal.round;
        if round < self.round {
            return Err(ConsensusError::BehindRound {
                round,
                current: self.round,
            });
        }
        if !self.within_buffer(round) {
            debug!(
                "dropping proposal for round {round} far ahead of {}; requesting sync",
                self.round
            );
            output.sync_from = Some(self.store.frontier().saturating_add(1));
            return Ok(output);
        }
        let Some(committee) = self.committee_or_defer(round)? else {
            debug!("deferring proposal for round {round}: epoch not reached");
            output.sync_from = Some(self.store.frontier().saturating_add(1));
            return Ok(output);
        };
        if leader::leader(round, &committee) != Some(proposal.proposer) {
            return Err(ConsensusError::InvalidProposal {
                round,
                reason: format!("{} is not the leader", proposal.proposer),
            });
        }
        if self
            .rounds
            .get(&round)
            .and_then(|state| state.proposal.as_ref())
            == Some(&proposal)
        {
            return Ok(output);
        }
        self.check_batch(&proposal, &batch)?;

        if let Some(ev) = self.evidence.check_proposal(&proposal) {
            warn!(
                "round {round}: conflicting proposals from {} ({} vs {})",
                ev.validator, ev.first.0, ev.second.0
            );
            return Err(ConsensusError::Equivocation {
                validator: ev.validator,
                round,
            });
        }

        for parent in &proposal.parents {
            match self.store.round_of(parent) {
                None => {
                    debug!("round {round}: parking proposal, parent {parent} unknown");
                    self.park(proposal, batch, &mut output);
                    return Ok(output);
                }
                Some(parent_round) if parent_round >= round => {
                    return Err(ConsensusError::InvalidProposal {
                        round,
                        reason: format!("parent {parent} from round {parent_round}"),
                    });
                }
                Some(_) => {}
            }
        }
        // only a certificate or this node's own timeout moves it to a new
        // round; a leader's word is not enough
        if round > self.round {
            debug!(
                "round {round}: parking proposal until round {} closes",
                self.round
            );
            self.park(proposal, batch, &mut output);
            return Ok(output);
        }

        let digest = proposal.digest();
        self.batches.insert(digest, batch);
        let state = self
            .rounds
            .entry(round)
            .or_insert_with(|| RoundState::new(round));
        state.proposal = Some(proposal.clone());
        if !state.phase.is_closed() {
            state.phase = Phase::Proposed(round, proposal.clone());
        }
        debug!("round {round}: proposal {digest} from {}", proposal.proposer);

        self.try_vote(&proposal, &committee, &mut output)?;
        self.try_certify(round, &mut output)?;
        Ok(output)
    }

    fn handle_vote(&mut self, vote: Vote) -> Result<EngineOutput> {
        let mut output = EngineOutput::default();
        let round = vote.round;
        if round < self.round {
            return Err(ConsensusError::BehindRound {
                round,
                current: self.round,
            });
        }
        if !self.within_buffer(round) {
            debug!("vote for round {round} far ahead of {}; requesting sync", self.round);
            output.sync_from = Some(self.store.frontier().saturating_add(1));
            return Ok(output);
        }
        let Some(committee) = self.committee_or_defer(round)? else {
            output.sync_from = Some(self.store.frontier().saturating_add(1));
            return Ok(output);
        };
        if !committee.contains(&vote.voter) {
            return Err(ConsensusError::UnknownValidator(vote.voter));
        }
        self.record_vote(vote);
        if round == self.round {
            self.try_certify(round, &mut output)?;
        }
        Ok(output)
    }

    fn handle_certificate(&mut self, certified: CertifiedBatch) -> Result<EngineOutput> {
        let mut output = EngineOutput::default();
        let round = certified.round();
        let digest = certified.certificate.digest();
        if self.store.is_known(&digest) {
            trace!("certificate {digest} for round {round} already known");
            // a restarted node resumes below certificates it already holds
            if round >= self.round {
                self.advance_to(round.saturating_add(1), &mut output);
                self.retry_parked(&mut output);
            }
            return Ok(output);
        }
        if round <= self.store.frontier() {
            return Err(ConsensusError::StaleRound {
                round,
                frontier: self.store.frontier(),
            });
        }
        let Some(committee) = self.committee_or_defer(round)? else {
            output.sync_from = Some(self.store.frontier().saturating_add(1));
            return Ok(output);
        };
        self.check_certificate(&certified, &committee)?;
        self.accept_certificate(certified, false, &mut output)?;
        Ok(output)
    }

    // -- Internals --

    fn finish(&mut self, mut output: EngineOutput) -> EngineOutput {
        output.evidence.extend(self.evidence.drain_evidence());
        output
    }

    fn check_batch(&self, proposal: &Proposal, batch: &Batch) -> Result<()> {
        let round = proposal.round;
        if batch.digest != proposal.batch_digest || !batch.is_well_formed() {
            return Err(ConsensusError::InvalidProposal {
                round,
                reason: "batch does not match digest".to_string(),
            });
        }
        if batch.len() > self.config.max_batch_transactions
            || batch.size_bytes() > self.config.max_batch_bytes
        {
            return Err(ConsensusError::InvalidProposal {
                round,
                reason: format!(
                    "batch of {} transactions / {} bytes exceeds limits",
                    batch.len(),
                    batch.size_bytes()
                ),
            });
        }
        Ok(())
    }

    fn check_certificate(&self, certified: &CertifiedBatch, committee: &Committee) -> Result<()> {
        let certificate = &certified.certificate;
        let round = certificate.round();
        let key = certificate.key();
        let digest = certificate.digest();
        let invalid = |reason: String| ConsensusError::InvalidCertificate { key, reason };

        if leader::leader(round, committee) != Some(certificate.proposer()) {
            return Err(invalid(format!("{} is not the leader", certificate.proposer())));
        }
        if certificate
            .votes
            .iter()
            .any(|vote| vote.round != round || vote.proposal_digest != digest)
        {
            return Err(invalid("vote for a different proposal".to_string()));
        }
        if certificate
            .votes
            .windows(2)
            .any(|pair| pair[0].voter >= pair[1].voter)
        {
            return Err(invalid("voters not distinct".to_string()));
        }
        if let Some(outsider) = certificate.voters().find(|v| !committee.contains(v)) {
            return Err(invalid(format!("voter {outsider} is not a member")));
        }
        let stake = certificate.voting_stake(committee);
        if !committee.has_quorum(stake) {
            return Err(invalid(format!(
                "voting stake {stake} below quorum {}",
                committee.quorum_threshold()
            )));
        }
        if !certified.batch_matches() {
            return Err(invalid("batch does not match digest".to_string()));
        }
        Ok(())
    }

    fn try_vote(
        &mut self,
        proposal: &Proposal,
        committee: &Committee,
        output: &mut EngineOutput,
    ) -> Result<()> {
        let round = proposal.round;
        if !committee.contains(&self.identity) {
            return Ok(());
        }
        if round <= self.safety.last_voted_round {
            debug!(
                "round {round}: already voted in round {}",
                self.safety.last_voted_round
            );
            return Ok(());
        }
        let parent_round = self
            .store
            .primary_parent_of(&proposal.parents)
            .map(|(_, r)| r)
            .unwrap_or(GENESIS_ROUND);
        if parent_round < self.safety.locked_round {
            warn!(
                "round {round}: withholding vote, parent round {parent_round} below lock {}",
                self.safety.locked_round
            );
            return Ok(());
        }

        let vote = Vote::new_signed(&self.keypair, round, proposal.digest());
        self.safety = SafetyState {
            last_voted_round: round,
            locked_round: self.safety.locked_round.max(parent_round),
        };
        output.safety = Some(self.safety);
        if let Some(state) = self.rounds.get_mut(&round) {
            state.phase = Phase::Voting(round, proposal.clone());
        }
        output.messages.push(ConsensusMessage::Vote(vote.clone()));
        self.record_vote(vote);
        Ok(())
    }

    /// Remember a vote; conflicting votes are kept as evidence and no longer
    /// count toward the round's quorum.
    fn record_vote(&mut self, vote: Vote) {
        let round = vote.round;
        if let Some(ev) = self.evidence.check_vote(&vote) {
            warn!(
                "{} ({} vs {})",
                ConsensusError::Equivocation {
                    validator: ev.validator,
                    round
                },
                ev.first.0,
                ev.second.0
            );
            return;
        }
        let state = self
            .rounds
            .entry(round)
            .or_insert_with(|| RoundState::new(round));
        if state.phase.is_closed() {
            return;
        }
        state
            .votes
            .entry(vote.proposal_digest)
            .or_default()
            .insert(vote.voter, vote);
    }

    /// Form a certificate for `round` if its proposal has gathered quorum.
    fn try_certify(&mut self, round: Round, output: &mut EngineOutput) -> Result<()> {
        let Some(state) = self.rounds.get(&round) else {
            return Ok(());
        };
        if state.phase.is_closed() {
            return Ok(());
        }
        let Some(proposal) = state.proposal.clone() else {
            return Ok(());
        };
        let digest = proposal.digest();
        let Some(votes) = state.votes.get(&digest) else {
            return Ok(());
        };
        let Some(committee) = self.committee_or_defer(round)? else {
            return Ok(());
        };
        let counted: Vec<Vote> = votes
            .values()
            .filter(|vote| !self.evidence.is_equivocator(&vote.voter, round))
            .cloned()
            .collect();
        let stake = committee.stake_of_set(counted.iter().map(|vote| &vote.voter));
        if !committee.has_quorum(stake) {
            return Ok(());
        }

        let batch = self.batches.get(&digest).cloned().ok_or_else(|| {
            ConsensusError::Storage(format!("batch of proposal {digest} missing"))
        })?;
        info!(
            "round {round}: certified {digest} with stake {stake}/{}",
            committee.total_stake()
        );
        let certificate = Certificate::new(proposal, counted);
        self.accept_certificate(CertifiedBatch { certificate, batch }, true, output)
    }

    fn accept_certificate(
        &mut self,
        certified: CertifiedBatch,
        local: bool,
        output: &mut EngineOutput,
    ) -> Result<()> {
        let round = certified.round();
        let digest = certified.certificate.digest();
        self.store.add_certificate(certified.certificate.clone())?;
        self.batches.insert(digest, certified.batch.clone());
        let state = self
            .rounds
            .entry(round)
            .or_insert_with(|| RoundState::new(round));
        state.phase = Phase::Certified(round, certified.certificate.clone());
        state.votes.clear();
        if state.proposal.is_none() {
            state.proposal = Some(certified.certificate.proposal.clone());
        }
        if local {
            output
                .messages
                .push(ConsensusMessage::Certificate(certified.clone()));
        }
        output.certified.push(certified);

        if round >= self.round {
            self.advance_to(round.saturating_add(1), output);
        }
        self.try_commit(output)?;
        self.retry_parked(output);
        Ok(())
    }

    /// Commit the newest certificate whose next-round children carry quorum
    /// endorsement.
    fn try_commit(&mut self, output: &mut EngineOutput) -> Result<()> {
        let mut anchor = None;
        let ready: Vec<Round> = self.store.ready_rounds(self.store.frontier()).collect();
        for round in ready {
            let Some(committee) = self.committee_or_defer(round.saturating_add(1))? else {
                break;
            };
            for certificate in self.store.certificates_at(round) {
                let digest = certificate.digest();
                if committee.has_quorum(self.store.endorsement_stake(&digest, &committee)) {
                    anchor = Some(digest);
                }
            }
        }
        let Some(anchor) = anchor else {
            return Ok(());
        };

        let outcome = self.store.commit(&anchor)?;
        for certificate in outcome.committed {
            let round = certificate.round();
            let digest = certificate.digest();
            let batch = self.batches.get(&digest).cloned().ok_or_else(|| {
                ConsensusError::Storage(format!("batch of committed {digest} missing"))
            })?;
            info!(
                "committed round {round} ({digest}, {} transactions)",
                batch.len()
            );
            if let Some(state) = self.rounds.get_mut(&round) {
                state.phase = Phase::Committed(round);
            }
            output.committed.push(CertifiedBatch { certificate, batch });
        }
        for certificate in outcome.orphaned {
            let digest = certificate.digest();
            warn!("round {}: certificate {digest} orphaned", certificate.round());
            if let Some(batch) = self.batches.remove(&digest) {
                output.orphaned.push(CertifiedBatch { certificate, batch });
            }
        }
        self.collect_garbage();
        Ok(())
    }

    fn collect_garbage(&mut self) {
        let floor = self.store.frontier().saturating_sub(self.config.gc_depth);
        for certificate in self.store.gc(self.config.gc_depth) {
            self.batches.remove(&certificate.digest());
        }
        self.rounds = self.rounds.split_off(&floor);
        let store = &self.store;
        let rounds = &self.rounds;
        self.batches.retain(|digest, _| {
            store.get(digest).is_some()
                || rounds.values().any(|state| {
                    state
                        .proposal
                        .as_ref()
                        .is_some_and(|p| p.digest() == *digest)
                })
        });
        self.evidence.prune(floor);
        let oldest_epoch = self.config.epoch_of(floor);
        if let Some(latest) = self.committees.keys().next_back().copied() {
            self.committees = self.committees.split_off(&oldest_epoch.min(latest));
        }
    }

    /// Rounds this node buffers proposals and votes for.
    fn within_buffer(&self, round: Round) -> bool {
        round <= self.round.saturating_add(self.config.vote_buffer_rounds)
    }

    /// Hold a proposal until its round is current and its parents are known.
    /// At most one proposal per buffered round is kept.
    fn park(&mut self, proposal: Proposal, batch: Batch, output: &mut EngineOutput) {
        self.parked.insert(proposal.round, (proposal, batch));
        output.sync_from = Some(self.store.frontier().saturating_add(1));
    }

    fn advance_to(&mut self, round: Round, output: &mut EngineOutput) {
        if round <= self.round {
            return;
        }
        debug!("advancing from round {} to {round}", self.round);
        self.round = round;
        self.rounds
            .entry(round)
            .or_insert_with(|| RoundState::new(round));
        self.parked = self.parked.split_off(&round);
        output.round_changed = Some(round);
    }

    /// Re-run parked proposals of the current round once their parents have
    /// all arrived.
    fn retry_parked(&mut self, output: &mut EngineOutput) {
        let current = self.round;
        let ready: Vec<Round> = self
            .parked
            .range(..=current)
            .filter(|(_, (proposal, _))| {
                proposal.parents.iter().all(|p| self.store.is_known(p))
            })
            .map(|(round, _)| *round)
            .collect();
        for round in ready {
            let Some((proposal, batch)) = self.parked.remove(&round) else {
                continue;
            };
            match self.handle_proposal(proposal, batch) {
                Ok(retried) => output.merge(retried),
                Err(err) => debug!("parked proposal for round {round} dropped: {err}"),
            }
        }
    }
}

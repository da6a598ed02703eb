//! In-memory network of consensus engines with an adversarial scheduler.
//!
//! Every message is queued once per recipient. The caller picks which queued
//! delivery happens next, may deliver it again later, and fires round
//! timeouts when the queue drains. Faulty nodes run an ordinary engine and
//! misbehave on top of it:
//! - byzantine nodes split their proposals and votes: the lower half of the
//!   committee sees the real message, the upper half a conflicting one signed
//!   by the same key
//! - rushing nodes also sign proposals for rounds nobody has reached: out of
//!   turn, for their next leader slots, and far ahead
//! - withholding nodes never pass on the certificates they form

use {
    bastion_consensus_bft::{
        leader, Batch, BftConfig, Committee, ConsensusEngine, ConsensusError, ConsensusMessage,
        EngineOutput, EquivocationEvidence, InMemoryLedger, LedgerCommitSink, Proposal, Round,
        Stake, Transaction, Vote,
    },
    solana_hash::Hash,
    solana_keypair::Keypair,
    solana_sha256_hasher::hashv,
    solana_signer::Signer,
    std::{
        collections::{BTreeMap, HashSet, VecDeque},
        sync::Arc,
    },
};

/// Upper bound on deliveries per run.
pub const MAX_STEPS: usize = 20_000;

/// How far ahead of its own round a rushing node proposes.
pub const RUSH_DISTANCE: Round = 5_000;

#[derive(Debug, Clone)]
struct Delivery {
    to: usize,
    message: ConsensusMessage,
}

pub struct SimNetwork {
    pub keys: Vec<Arc<Keypair>>,
    pub committee: Arc<Committee>,
    pub engines: Vec<ConsensusEngine>,
    pub ledgers: Vec<InMemoryLedger>,
    /// Committed (round, batch digest) per node, in commit order.
    pub committed: Vec<Vec<(Round, Hash)>>,
    pub byzantine: HashSet<usize>,
    pub rushing: HashSet<usize>,
    pub withholding: HashSet<usize>,
    pub offline: HashSet<usize>,
    pub evidence: Vec<EquivocationEvidence>,
    /// Timeout cycles fired so far.
    pub timeouts: usize,
    pending: VecDeque<Delivery>,
    /// (node, round) pairs a rushing node already proposed for.
    rushed: HashSet<(usize, Round)>,
}

impl SimNetwork {
    pub fn new(stakes: &[Stake]) -> Result<Self, ConsensusError> {
        Self::with_config(stakes, BftConfig::default())
    }

    pub fn with_config(stakes: &[Stake], config: BftConfig) -> Result<Self, ConsensusError> {
        let keys: Vec<Arc<Keypair>> = stakes.iter().map(|_| Arc::new(Keypair::new())).collect();
        let committee = Arc::new(
            Committee::new(
                0,
                keys.iter()
                    .zip(stakes)
                    .map(|(key, stake)| (key.pubkey(), *stake))
                    .collect(),
            )?,
        );
        let engines = keys
            .iter()
            .map(|key| ConsensusEngine::new(config.clone(), key.clone(), committee.clone()))
            .collect();
        Ok(Self {
            ledgers: stakes.iter().map(|_| InMemoryLedger::new()).collect(),
            committed: vec![Vec::new(); stakes.len()],
            keys,
            committee,
            engines,
            byzantine: HashSet::new(),
            rushing: HashSet::new(),
            withholding: HashSet::new(),
            offline: HashSet::new(),
            evidence: Vec::new(),
            timeouts: 0,
            pending: VecDeque::new(),
            rushed: HashSet::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    pub fn index_of(&self, identity: &solana_pubkey::Pubkey) -> Option<usize> {
        self.keys.iter().position(|key| key.pubkey() == *identity)
    }

    /// Nodes that are online and follow the protocol.
    pub fn honest(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len()).filter(|node| !self.is_faulty(*node) && !self.offline.contains(node))
    }

    pub fn is_faulty(&self, node: usize) -> bool {
        self.byzantine.contains(&node)
            || self.rushing.contains(&node)
            || self.withholding.contains(&node)
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Let every online leader below `target` propose.
    pub fn propose_all(&mut self, target: Round) -> Result<(), ConsensusError> {
        for node in 0..self.len() {
            if self.offline.contains(&node) {
                continue;
            }
            if self.rushing.contains(&node) {
                self.rush(node);
            }
            let engine = &self.engines[node];
            if engine.round() >= target || !engine.can_propose() {
                continue;
            }
            let round = engine.round();
            let mut payload = round.to_le_bytes().to_vec();
            payload.extend_from_slice(self.keys[node].pubkey().as_ref());
            let output = self.engines[node].propose(Batch::new(vec![Transaction::new(payload)]))?;
            self.emit(node, output)?;
        }
        Ok(())
    }

    /// Deliver the queued message at `choice` (modulo the queue length).
    /// With `duplicate` the message stays queued and is delivered again
    /// later. Returns false when the queue is empty.
    pub fn step(&mut self, choice: usize, duplicate: bool) -> Result<bool, ConsensusError> {
        if self.pending.is_empty() {
            return Ok(false);
        }
        let index = choice % self.pending.len();
        let delivery = if duplicate {
            self.pending[index].clone()
        } else {
            match self.pending.remove(index) {
                Some(delivery) => delivery,
                None => return Ok(false),
            }
        };
        self.deliver(delivery)?;
        Ok(true)
    }

    /// Expire the current round on every online node.
    pub fn fire_timeouts(&mut self) -> Result<(), ConsensusError> {
        self.timeouts = self.timeouts.saturating_add(1);
        for node in 0..self.len() {
            if self.offline.contains(&node) {
                continue;
            }
            let round = self.engines[node].round();
            let output = self.engines[node].on_timeout(round)?;
            self.emit(node, output)?;
        }
        Ok(())
    }

    /// Run until every honest node reaches `target`, the step budget is
    /// spent, or `max_stalls` timeout cycles did not help. `schedule` is
    /// cycled to pick deliveries; an empty schedule delivers in FIFO order.
    pub fn run(
        &mut self,
        schedule: &[(usize, bool)],
        target: Round,
        max_stalls: usize,
    ) -> Result<(), ConsensusError> {
        let mut stalls = 0;
        for step in 0..MAX_STEPS {
            self.propose_all(target)?;
            if self.reached(target) {
                return Ok(());
            }
            let (choice, duplicate) = if schedule.is_empty() {
                (0, false)
            } else {
                schedule[step % schedule.len()]
            };
            if !self.step(choice, duplicate)? {
                if stalls >= max_stalls {
                    return Ok(());
                }
                stalls = stalls.saturating_add(1);
                self.fire_timeouts()?;
            }
        }
        Ok(())
    }

    /// Checks that no honest node entered a round it cannot justify: every
    /// round change comes from a certificate it holds or from one of the
    /// timeout cycles fired so far.
    pub fn check_round_progress(&self) -> Result<(), String> {
        for node in self.honest() {
            let engine = &self.engines[node];
            let bound = engine
                .store()
                .highest_round()
                .saturating_add(1)
                .saturating_add(self.timeouts as Round);
            if engine.round() > bound {
                return Err(format!(
                    "node {node} at round {} with certificates up to {} and {} timeouts",
                    engine.round(),
                    engine.store().highest_round(),
                    self.timeouts
                ));
            }
            if engine.safety_state().last_voted_round > engine.round() {
                return Err(format!(
                    "node {node} voted in round {} ahead of round {}",
                    engine.safety_state().last_voted_round,
                    engine.round()
                ));
            }
        }
        Ok(())
    }

    pub fn reached(&self, target: Round) -> bool {
        self.honest().all(|node| self.engines[node].round() >= target)
    }

    /// Checks that honest nodes never disagree: each round commits at most
    /// one digest, and commit sequences are prefixes of one another.
    pub fn check_agreement(&self) -> Result<(), String> {
        let mut by_round: BTreeMap<Round, (Hash, usize)> = BTreeMap::new();
        for node in self.honest() {
            for (round, digest) in &self.committed[node] {
                match by_round.get(round) {
                    Some((seen, other)) if seen != digest => {
                        return Err(format!(
                            "round {round}: node {node} committed {digest}, node {other} committed {seen}"
                        ));
                    }
                    Some(_) => {}
                    None => {
                        by_round.insert(*round, (*digest, node));
                    }
                }
            }
        }
        let honest: Vec<usize> = self.honest().collect();
        for (i, a) in honest.iter().enumerate() {
            for b in honest.iter().skip(i.saturating_add(1)) {
                let (short, long) = if self.committed[*a].len() <= self.committed[*b].len() {
                    (&self.committed[*a], &self.committed[*b])
                } else {
                    (&self.committed[*b], &self.committed[*a])
                };
                if long[..short.len()] != short[..] {
                    return Err(format!("nodes {a} and {b} diverged"));
                }
            }
        }
        Ok(())
    }

    fn deliver(&mut self, delivery: Delivery) -> Result<(), ConsensusError> {
        let Delivery { to, message } = delivery;
        if self.offline.contains(&to) {
            return Ok(());
        }
        let engine = &mut self.engines[to];
        let result = match message {
            ConsensusMessage::Proposal { proposal, batch } => engine.on_proposal(proposal, batch),
            ConsensusMessage::Vote(vote) => engine.on_vote(vote),
            ConsensusMessage::Certificate(certified) => engine.on_certificate(certified),
        };
        match result {
            Ok(output) => self.emit(to, output),
            Err(err) if err.is_fatal() => Err(err),
            Err(_) => Ok(()),
        }
    }

    fn emit(&mut self, node: usize, output: EngineOutput) -> Result<(), ConsensusError> {
        for certified in &output.committed {
            let round = certified.round();
            self.ledgers[node]
                .apply(round, &certified.batch)
                .map_err(|source| ConsensusError::LedgerApplyFailure { round, source })?;
            self.committed[node].push((round, certified.certificate.digest()));
        }
        self.evidence.extend(output.evidence);
        let byzantine = self.byzantine.contains(&node);
        let withholding = self.withholding.contains(&node);
        let half = self.len() / 2;
        for message in output.messages {
            if withholding && matches!(message, ConsensusMessage::Certificate(_)) {
                continue;
            }
            let conflicting = if byzantine {
                self.conflicting(node, &message)
            } else {
                None
            };
            for to in (0..self.len()).filter(|to| *to != node) {
                let message = match &conflicting {
                    Some(conflicting) if to >= half => conflicting.clone(),
                    _ => message.clone(),
                };
                self.pending.push_back(Delivery { to, message });
            }
        }
        Ok(())
    }

    /// Sign and broadcast proposals for rounds ahead of the rushing `node`'s
    /// current round, each at most once: the next round when it does not
    /// lead it, its next leader slots, and its first slot `RUSH_DISTANCE`
    /// rounds ahead.
    fn rush(&mut self, node: usize) {
        let identity = self.keys[node].pubkey();
        let current = self.engines[node].round();
        let len = self.len() as Round;
        let leads = |round: Round| leader(round, &self.committee) == Some(identity);
        let next = current.saturating_add(1);
        let mut rounds: Vec<Round> = (next..=current.saturating_add(len.saturating_mul(2)))
            .filter(|round| *round == next || leads(*round))
            .collect();
        let far = current.saturating_add(RUSH_DISTANCE);
        rounds.extend((far..far.saturating_add(len)).find(|round| leads(*round)));

        let parents: Vec<Hash> = self.engines[node]
            .store()
            .high_certificate()
            .map(|certificate| vec![certificate.digest()])
            .unwrap_or_default();
        for round in rounds {
            if !self.rushed.insert((node, round)) {
                continue;
            }
            let mut payload = b"rushed".to_vec();
            payload.extend_from_slice(&round.to_le_bytes());
            let batch = Batch::new(vec![Transaction::new(payload)]);
            let proposal =
                Proposal::new_signed(&self.keys[node], round, batch.digest, parents.clone());
            for to in (0..self.len()).filter(|to| *to != node) {
                self.pending.push_back(Delivery {
                    to,
                    message: ConsensusMessage::Proposal {
                        proposal: proposal.clone(),
                        batch: batch.clone(),
                    },
                });
            }
        }
    }

    /// The message a byzantine `node` sends instead of `message` to the
    /// upper half of the committee.
    fn conflicting(&self, node: usize, message: &ConsensusMessage) -> Option<ConsensusMessage> {
        let key = &self.keys[node];
        match message {
            ConsensusMessage::Proposal { proposal, .. } => {
                let mut payload = b"conflicting".to_vec();
                payload.extend_from_slice(&proposal.round.to_le_bytes());
                let batch = Batch::new(vec![Transaction::new(payload)]);
                let proposal =
                    Proposal::new_signed(key, proposal.round, batch.digest, proposal.parents.clone());
                Some(ConsensusMessage::Proposal { proposal, batch })
            }
            ConsensusMessage::Vote(vote) => {
                let digest = hashv(&[b"conflicting", &vote.round.to_le_bytes()]);
                Some(ConsensusMessage::Vote(Vote::new_signed(key, vote.round, digest)))
            }
            ConsensusMessage::Certificate(_) => None,
        }
    }
}

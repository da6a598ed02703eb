//! Shared test utilities for Bastion end-to-end tests.
//!
//! Provides a simulated network of full validator stacks:
//! - One `BftAdapter` per validator, with its own mempool and sled storage
//! - Broadcast delivery through an in-memory queue, in FIFO order
//! - Sync requests answered from the most advanced online peer
//! - Round timeouts fired explicitly when the network goes quiet
//! - Stopping a validator and restarting it from its storage directory

use {
    bastion_consensus_bft::{
        leader, BftConfig, CertifiedBatch, CommitteeManager, ConsensusMessage, InMemoryLedger,
        Mempool, MempoolConfig, Round, Stake,
    },
    bastion_core::{AdapterOutput, BftAdapter, SledStorage},
    parking_lot::RwLock,
    solana_keypair::Keypair,
    solana_pubkey::Pubkey,
    solana_signer::Signer,
    std::{
        collections::VecDeque,
        path::{Path, PathBuf},
        sync::Arc,
    },
};

/// Upper bound on queue items processed by one call.
pub const MAX_STEPS: usize = 200_000;

/// Certified batches served per sync request.
pub const SYNC_LIMIT: usize = 64;

/// Initialize env_logger once for test output.
pub fn init_logging() {
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(log::LevelFilter::Info)
        .try_init();
}

/// Committee of `n` validators with one unit of stake each.
pub fn equal_stakes(n: usize) -> Vec<Stake> {
    vec![1; n]
}

#[derive(Debug)]
enum Event {
    Broadcast { from: usize, message: ConsensusMessage },
    Sync { to: usize, from_round: Round },
}

/// A validator in the simulated network.
pub struct SimValidator {
    pub keypair: Arc<Keypair>,
    /// `None` while the validator is stopped.
    pub adapter: Option<BftAdapter<InMemoryLedger>>,
    /// Sled directory, or `None` for a temporary database.
    pub storage_dir: Option<PathBuf>,
}

impl SimValidator {
    pub fn pubkey(&self) -> Pubkey {
        self.keypair.pubkey()
    }

    pub fn is_online(&self) -> bool {
        self.adapter.is_some()
    }

    pub fn adapter(&self) -> &BftAdapter<InMemoryLedger> {
        self.adapter.as_ref().expect("validator is stopped")
    }

    pub fn frontier(&self) -> Round {
        self.adapter().frontier()
    }

    pub fn round(&self) -> Round {
        self.adapter().round()
    }

    /// Committed (round, batch digest) pairs applied to the ledger.
    pub fn history(&self) -> Vec<(Round, solana_hash::Hash)> {
        self.adapter().ledger().history()
    }
}

pub struct SimNetwork {
    pub config: BftConfig,
    pub genesis: Vec<(Pubkey, Stake)>,
    pub validators: Vec<SimValidator>,
    /// Timeout cycles fired so far.
    pub timeouts: usize,
    /// Sync requests served so far.
    pub syncs: usize,
    queue: VecDeque<Event>,
}

impl SimNetwork {
    /// Validators with temporary storage.
    pub fn new(stakes: &[Stake], config: BftConfig) -> Self {
        Self::build(stakes, config, None)
    }

    /// Validators whose storage lives under `root/validator-<i>`, so they
    /// can be restarted.
    pub fn with_storage(stakes: &[Stake], config: BftConfig, root: &Path) -> Self {
        Self::build(stakes, config, Some(root))
    }

    fn build(stakes: &[Stake], config: BftConfig, root: Option<&Path>) -> Self {
        let keys: Vec<Arc<Keypair>> = stakes.iter().map(|_| Arc::new(Keypair::new())).collect();
        let genesis: Vec<(Pubkey, Stake)> = keys
            .iter()
            .zip(stakes)
            .map(|(key, stake)| (key.pubkey(), *stake))
            .collect();
        let mut net = Self {
            config,
            genesis,
            validators: Vec::with_capacity(keys.len()),
            timeouts: 0,
            syncs: 0,
            queue: VecDeque::new(),
        };
        for (i, keypair) in keys.into_iter().enumerate() {
            let storage_dir = root.map(|root| root.join(format!("validator-{i}")));
            net.validators.push(SimValidator {
                keypair,
                adapter: None,
                storage_dir,
            });
            net.validators[i].adapter = Some(net.open_adapter(i));
        }
        net
    }

    fn open_adapter(&self, i: usize) -> BftAdapter<InMemoryLedger> {
        let validator = &self.validators[i];
        let storage = match &validator.storage_dir {
            Some(dir) => SledStorage::open(dir).unwrap(),
            None => SledStorage::open_temporary().unwrap(),
        };
        let committees = Arc::new(RwLock::new(
            CommitteeManager::new(self.genesis.clone(), &self.config).unwrap(),
        ));
        BftAdapter::new(
            self.config.clone(),
            validator.keypair.clone(),
            committees,
            Arc::new(Mempool::new(MempoolConfig::default())),
            storage,
            InMemoryLedger::new(),
        )
        .unwrap()
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    pub fn online(&self) -> impl Iterator<Item = &SimValidator> {
        self.validators.iter().filter(|v| v.is_online())
    }

    pub fn index_of(&self, identity: &Pubkey) -> usize {
        self.validators
            .iter()
            .position(|v| v.pubkey() == *identity)
            .expect("unknown validator")
    }

    /// Index of the validator leading `round` under the genesis committee.
    pub fn leader_of(&self, round: Round) -> usize {
        let committee = self
            .online()
            .next()
            .expect("no validator online")
            .adapter()
            .engine()
            .committee(round)
            .unwrap();
        self.index_of(&leader(round, &committee).unwrap())
    }

    /// Start every online validator.
    pub fn start(&mut self) {
        for i in 0..self.len() {
            if let Some(adapter) = self.validators[i].adapter.as_mut() {
                let output = adapter.start().unwrap();
                self.enqueue(i, output);
            }
        }
    }

    /// Take a validator offline. Its storage is closed.
    pub fn stop(&mut self, i: usize) -> BftAdapter<InMemoryLedger> {
        self.validators[i].adapter.take().expect("already stopped")
    }

    /// Reopen a stopped validator from its storage and start it. Returns
    /// the round it asked peers to sync from.
    pub fn restart(&mut self, i: usize) -> Option<Round> {
        assert!(!self.validators[i].is_online(), "validator {i} is running");
        self.reopen(i);
        self.start_one(i)
    }

    /// Reopen a stopped validator without starting it.
    pub fn reopen(&mut self, i: usize) -> &BftAdapter<InMemoryLedger> {
        assert!(!self.validators[i].is_online(), "validator {i} is running");
        let adapter = self.open_adapter(i);
        self.validators[i].adapter.insert(adapter)
    }

    /// Start a validator brought back with [`Self::reopen`].
    pub fn start_one(&mut self, i: usize) -> Option<Round> {
        let output = self.validators[i]
            .adapter
            .as_mut()
            .expect("validator is stopped")
            .start()
            .unwrap();
        let sync_from = output.sync_from;
        self.enqueue(i, output);
        sync_from
    }

    /// Submit a transaction to every online validator's mempool.
    pub fn submit_all(&self, tx: &bastion_consensus_bft::Transaction) {
        for validator in self.online() {
            validator.adapter().mempool().submit(tx.clone()).unwrap();
        }
    }

    /// Process queued events until the queue drains or `stop` holds.
    /// Returns true if `stop` held.
    pub fn deliver_until(&mut self, mut stop: impl FnMut(&Self) -> bool) -> bool {
        for _ in 0..MAX_STEPS {
            if stop(self) {
                return true;
            }
            let Some(event) = self.queue.pop_front() else {
                return false;
            };
            match event {
                Event::Broadcast { from, message } => self.broadcast(from, message),
                Event::Sync { to, from_round } => self.serve_sync(to, from_round),
            }
        }
        panic!("no quiescence after {MAX_STEPS} steps");
    }

    /// Deliver everything queued.
    pub fn deliver_all(&mut self) {
        self.deliver_until(|_| false);
    }

    /// Expire the current round on every online validator.
    pub fn fire_timeouts(&mut self) {
        self.timeouts = self.timeouts.saturating_add(1);
        for i in 0..self.len() {
            if let Some(adapter) = self.validators[i].adapter.as_mut() {
                let round = adapter.round();
                let output = adapter.handle_timeout(round).unwrap();
                self.enqueue(i, output);
            }
        }
    }

    /// Run until every online validator has committed `target`, firing at
    /// most `max_timeouts` timeout cycles when the network goes quiet.
    pub fn run_until_frontier(&mut self, target: Round, max_timeouts: usize) {
        let budget = self.timeouts.saturating_add(max_timeouts);
        loop {
            let done = |net: &Self| net.online().all(|v| v.frontier() >= target);
            if self.deliver_until(done) {
                return;
            }
            assert!(
                self.timeouts < budget,
                "frontier {target} not reached within {max_timeouts} timeouts: {:?}",
                self.online().map(SimValidator::frontier).collect::<Vec<_>>()
            );
            self.fire_timeouts();
        }
    }

    /// Certified batches stored by validator `i` from `from_round` on.
    pub fn certified(&self, i: usize, from_round: Round) -> Vec<CertifiedBatch> {
        self.validators[i]
            .adapter()
            .handle_sync_request(from_round, usize::MAX)
            .unwrap()
    }

    /// Asserts that online validators applied the same batches in the same
    /// order, up to the shortest history.
    pub fn assert_agreement(&self) {
        let histories: Vec<_> = self.online().map(SimValidator::history).collect();
        let shortest = histories.iter().map(Vec::len).min().unwrap_or(0);
        for history in &histories {
            assert_eq!(history[..shortest], histories[0][..shortest]);
        }
    }

    fn enqueue(&mut self, from: usize, output: AdapterOutput) {
        for message in output.messages {
            self.queue.push_back(Event::Broadcast { from, message });
        }
        if let Some(from_round) = output.sync_from {
            self.queue.push_back(Event::Sync {
                to: from,
                from_round,
            });
        }
    }

    fn broadcast(&mut self, from: usize, message: ConsensusMessage) {
        let sender = self.validators[from].pubkey();
        for i in 0..self.len() {
            if i == from {
                continue;
            }
            let Some(adapter) = self.validators[i].adapter.as_mut() else {
                continue;
            };
            let output = adapter.handle_message(&sender, message.clone()).unwrap();
            self.enqueue(i, output);
        }
    }

    fn serve_sync(&mut self, to: usize, from_round: Round) {
        let Some(peer) = (0..self.len())
            .filter(|i| *i != to && self.validators[*i].is_online())
            .max_by_key(|i| self.validators[*i].frontier())
        else {
            return;
        };
        let certificates = self.validators[peer]
            .adapter()
            .handle_sync_request(from_round, SYNC_LIMIT)
            .unwrap();
        self.syncs = self.syncs.saturating_add(1);
        let sender = self.validators[peer].pubkey();
        for certified in certificates {
            let Some(adapter) = self.validators[to].adapter.as_mut() else {
                return;
            };
            let output = adapter
                .handle_message(&sender, ConsensusMessage::Certificate(certified))
                .unwrap();
            self.enqueue(to, output);
        }
    }
}

/// Four validators with equal stake and temporary storage.
pub fn standard_4_validator_network() -> SimNetwork {
    SimNetwork::new(&equal_stakes(4), BftConfig::default())
}

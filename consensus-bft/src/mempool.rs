//! Pending transaction pool.
//!
//! Transactions wait here until a leader includes them in a batch and a
//! certificate references that batch. The pool is shared as `Arc<Mempool>`
//! between the RPC/ingest side and the consensus thread, so all state sits
//! behind one `parking_lot::RwLock`.

use {
    crate::types::{Batch, Transaction, TransactionId},
    parking_lot::RwLock,
    serde::{Deserialize, Serialize},
    std::collections::{BTreeMap, HashMap, HashSet, VecDeque},
    thiserror::Error,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MempoolError {
    #[error("transaction {0} already pending")]
    Duplicate(TransactionId),

    #[error("transaction {0} already certified")]
    AlreadyCertified(TransactionId),

    #[error("malformed transaction: {0}")]
    Malformed(String),

    #[error("transaction of {size} bytes exceeds limit of {max}")]
    TooLarge { size: usize, max: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MempoolConfig {
    /// Maximum number of pending transactions.
    pub max_transactions: usize,
    /// Maximum total payload bytes of pending transactions.
    pub max_bytes: usize,
    /// Maximum payload bytes of a single transaction.
    pub max_transaction_bytes: usize,
    /// How many certified transaction ids are remembered to reject resubmits.
    pub certified_history: usize,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self {
            max_transactions: 50_000,
            max_bytes: 64 * 1024 * 1024,
            max_transaction_bytes: 64 * 1024,
            certified_history: 100_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MempoolStats {
    pub pending: usize,
    pub pending_bytes: usize,
    pub evicted: u64,
    pub certified: u64,
}

#[derive(Debug, Default)]
struct PoolState {
    /// Pending transactions with their admission sequence number.
    entries: HashMap<TransactionId, (u64, Transaction)>,
    /// Admission order: sequence -> id. The first entry is the oldest.
    order: BTreeMap<u64, TransactionId>,
    next_seq: u64,
    bytes: usize,
    /// Recently certified ids, bounded by `certified_history`.
    certified: HashSet<TransactionId>,
    certified_order: VecDeque<TransactionId>,
    stats: MempoolStats,
}

impl PoolState {
    fn insert(&mut self, tx: Transaction) {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.saturating_add(1);
        self.bytes = self.bytes.saturating_add(tx.size());
        self.order.insert(seq, tx.id);
        self.entries.insert(tx.id, (seq, tx));
    }

    fn remove(&mut self, id: &TransactionId) -> bool {
        match self.entries.remove(id) {
            Some((seq, tx)) => {
                self.order.remove(&seq);
                self.bytes = self.bytes.saturating_sub(tx.size());
                true
            }
            None => false,
        }
    }

    /// Drop the oldest entries until `incoming` bytes fit.
    fn make_room(&mut self, incoming: usize, config: &MempoolConfig) {
        while !self.entries.is_empty()
            && (self.entries.len() >= config.max_transactions
                || self.bytes.saturating_add(incoming) > config.max_bytes)
        {
            let Some((_, oldest)) = self.order.pop_first() else {
                break;
            };
            if let Some((_, tx)) = self.entries.remove(&oldest) {
                self.bytes = self.bytes.saturating_sub(tx.size());
                self.stats.evicted = self.stats.evicted.saturating_add(1);
                log::trace!("mempool evicted {oldest}");
            }
        }
    }

    fn mark_certified(&mut self, id: TransactionId, history: usize) {
        if self.certified.insert(id) {
            self.certified_order.push_back(id);
            self.stats.certified = self.stats.certified.saturating_add(1);
        }
        while self.certified_order.len() > history {
            if let Some(old) = self.certified_order.pop_front() {
                self.certified.remove(&old);
            }
        }
    }
}

pub struct Mempool {
    config: MempoolConfig,
    state: RwLock<PoolState>,
}

impl Mempool {
    pub fn new(config: MempoolConfig) -> Self {
        Self {
            config,
            state: RwLock::new(PoolState::default()),
        }
    }

    pub fn config(&self) -> &MempoolConfig {
        &self.config
    }

    /// Admit a transaction. When the pool is full the oldest pending entry is
    /// evicted to make room.
    pub fn submit(&self, tx: Transaction) -> Result<TransactionId, MempoolError> {
        if tx.payload.is_empty() {
            return Err(MempoolError::Malformed("empty payload".to_string()));
        }
        if !tx.has_valid_id() {
            return Err(MempoolError::Malformed(format!(
                "id {} does not match payload",
                tx.id
            )));
        }
        let max = self.config.max_transaction_bytes.min(self.config.max_bytes);
        if tx.size() > max {
            return Err(MempoolError::TooLarge {
                size: tx.size(),
                max,
            });
        }

        let mut state = self.state.write();
        if state.entries.contains_key(&tx.id) {
            return Err(MempoolError::Duplicate(tx.id));
        }
        if state.certified.contains(&tx.id) {
            return Err(MempoolError::AlreadyCertified(tx.id));
        }
        state.make_room(tx.size(), &self.config);
        let id = tx.id;
        state.insert(tx);
        Ok(id)
    }

    /// Oldest pending transactions up to the given bounds, in admission
    /// order. Nothing is removed; the batch stays pending until certified.
    pub fn next_batch(&self, max_transactions: usize, max_bytes: usize) -> Batch {
        let state = self.state.read();
        let mut transactions = Vec::new();
        let mut bytes = 0usize;
        for id in state.order.values() {
            if transactions.len() >= max_transactions {
                break;
            }
            let Some((_, tx)) = state.entries.get(id) else {
                continue;
            };
            let next_bytes = bytes.saturating_add(tx.size());
            if next_bytes > max_bytes {
                break;
            }
            bytes = next_bytes;
            transactions.push(tx.clone());
        }
        Batch::new(transactions)
    }

    /// Drop every transaction of a certified batch and remember their ids.
    pub fn remove_certified(&self, batch: &Batch) {
        let mut state = self.state.write();
        for tx in &batch.transactions {
            state.remove(&tx.id);
            state.mark_certified(tx.id, self.config.certified_history);
        }
    }

    /// Re-admit the transactions of an orphaned batch. Returns how many were
    /// restored.
    pub fn restore(&self, batch: &Batch) -> usize {
        let mut state = self.state.write();
        let mut restored = 0usize;
        for tx in &batch.transactions {
            if state.certified.remove(&tx.id) {
                state.certified_order.retain(|id| id != &tx.id);
            }
            if state.entries.contains_key(&tx.id) {
                continue;
            }
            state.make_room(tx.size(), &self.config);
            state.insert(tx.clone());
            restored = restored.saturating_add(1);
        }
        restored
    }

    pub fn contains(&self, id: &TransactionId) -> bool {
        self.state.read().entries.contains_key(id)
    }

    pub fn is_certified(&self, id: &TransactionId) -> bool {
        self.state.read().certified.contains(id)
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> MempoolStats {
        let state = self.state.read();
        MempoolStats {
            pending: state.entries.len(),
            pending_bytes: state.bytes,
            ..state.stats
        }
    }
}

impl Default for Mempool {
    fn default() -> Self {
        Self::new(MempoolConfig::default())
    }
}

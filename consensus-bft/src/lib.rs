//! Bastion BFT finality core
//!
//! Validators agree on an append-only sequence of transaction batches with
//! deterministic finality. Each round one stake-weighted leader proposes a
//! batch on top of the highest certificate it knows; a quorum of committee
//! votes turns the proposal into a certificate, and a certificate is final
//! once a quorum certifies its child in the next round.
//!
//! # Properties
//!
//! - **Safety**: no two conflicting certificates commit while less than one
//!   third of stake is Byzantine.
//! - **Liveness**: rounds advance by timeout when a leader is silent, and
//!   the chain keeps committing once an honest leader is followed by another.
//! - **Accountability**: conflicting votes and proposals become signed
//!   evidence.
//!
//! # Layout
//!
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │                ConsensusEngine                  │
//! │  ┌───────────┐  ┌────────────┐  ┌───────────┐  │
//! │  │ BftConfig │  │ Committee  │  │ Evidence  │  │
//! │  │           │  │ + leader   │  │ Collector │  │
//! │  └───────────┘  └────────────┘  └───────────┘  │
//! │  ┌──────────────────────────────────────────┐  │
//! │  │ CertificateStore (DAG, commit, gc)       │  │
//! │  └──────────────────────────────────────────┘  │
//! └────────────────────────────────────────────────┘
//!        ▲ batches                   │ committed
//!   ┌─────────┐  ┌──────────────────┐ ▼  ┌───────────────────┐
//!   │ Mempool │  │ CommitteeManager │    │ LedgerCommitSink  │
//!   └─────────┘  └──────────────────┘    └───────────────────┘
//! ```

pub mod committee;
pub mod committee_manager;
pub mod config;
pub mod dag;
pub mod engine;
pub mod error;
pub mod evidence;
pub mod leader;
pub mod ledger;
pub mod mempool;
pub mod timeout;
pub mod types;

pub use committee::{quorum_threshold, Committee, CommitteeMember};
pub use committee_manager::{
    BondStatus, BondingEvent, CommitteeManager, EpochTransition, Validator,
};
pub use config::{BftConfig, ConfigError};
pub use dag::{CertificateStore, CommitOutcome};
pub use engine::{ConsensusEngine, EngineOutput, Phase};
pub use error::{ConsensusError, Result};
pub use evidence::{EquivocationEvidence, EvidenceCollector, EvidenceKind};
pub use leader::{is_leader, leader, Role};
pub use ledger::{ApplyError, InMemoryLedger, LedgerCommitSink, LedgerHeight};
pub use mempool::{Mempool, MempoolConfig, MempoolError, MempoolStats};
pub use timeout::TimeoutScheduler;
pub use types::{
    Batch, Certificate, CertificateKey, CertifiedBatch, CommitRecord, ConsensusMessage, Epoch,
    Proposal, Round, SafetyState, Stake, Transaction, TransactionId, Vote, GENESIS_ROUND,
};

//! Validator-side consensus plumbing: persistence, the adapter around the
//! consensus engine, the consensus thread and its bridge to the network.

pub mod bft_adapter;
pub mod consensus_service;
pub mod network_bridge;
pub mod storage;

pub use {
    bft_adapter::{AdapterError, AdapterOutput, BftAdapter},
    consensus_service::{ConsensusEvent, ConsensusService, Outbound},
    network_bridge::NetworkBridge,
    storage::{RecoveredState, SledStorage, StorageError},
};

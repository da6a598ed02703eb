//! Bastion End-to-End Test Suite
//!
//! Drives several validators at once and checks what the network agrees on:
//! quorum commits, leader failure and timeout recovery, restart from sled
//! storage with sync catch-up, and the full stack over localhost TCP.
//!
//! Each test file can be run independently:
//!
//! ```bash
//! cargo test -p bastion-e2e-tests --test quorum_commit -- --nocapture
//! cargo test -p bastion-e2e-tests --test leader_failure -- --nocapture
//! cargo test -p bastion-e2e-tests --test recovery -- --nocapture
//! cargo test -p bastion-e2e-tests --test tcp_network -- --nocapture
//! ```

pub mod helpers;

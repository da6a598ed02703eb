//! Bastion property-based invariant tests.
//!
//! Uses proptest to check, across generated committees and message
//! schedules:
//! - quorum arithmetic and quorum intersection
//! - agreement under reordering, duplication and equivocating validators
//! - progress under synchrony with an offline leader
//! - idempotent ledger application

pub mod ledger_invariants;
pub mod quorum_invariants;
pub mod safety_invariants;
pub mod sim;

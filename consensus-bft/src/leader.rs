//! Leader selection.
//!
//! Implements deterministic, stake-weighted interleaved round-robin. Every
//! validator must agree on the leader of any round without communicating,
//! so the result depends only on the round number and the committee.

use {
    crate::{
        committee::{Committee, CommitteeMember},
        types::Round,
    },
    solana_pubkey::Pubkey,
};

/// Upper bound on the length of one leader rotation cycle.
pub const MAX_SCHEDULE_LEN: u64 = 4096;

/// What the local validator does in a given round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Proposes this round and votes.
    Leader,
    /// Votes on the leader's proposal.
    Voter,
    /// Not a committee member; follows certificates only.
    Observer,
}

/// Build the rotation cycle for a committee.
///
/// # Algorithm
///
/// 1. Reduce stakes by their gcd. If the reduced weights still sum to more
///    than [`MAX_SCHEDULE_LEN`], scale them down proportionally (each member
///    keeps a weight of at least 1).
/// 2. Run smooth weighted round-robin for `sum(weights)` steps: every step
///    adds each member's weight to its credit, the member with the highest
///    credit (first in canonical order on ties) is picked and the weight sum
///    is subtracted from its credit.
///
/// Each member appears exactly `weight` times per cycle and picks are spread
/// out rather than clustered. With equal stakes this is plain rotation in
/// canonical order.
pub fn build_schedule(members: &[CommitteeMember]) -> Vec<Pubkey> {
    if members.is_empty() {
        return Vec::new();
    }

    let weights = schedule_weights(members);
    let weight_sum: i128 = weights.iter().map(|w| i128::from(*w)).sum();
    let len = usize::try_from(weight_sum).unwrap_or(0);

    let mut credits = vec![0i128; members.len()];
    let mut schedule = Vec::with_capacity(len);
    for _ in 0..len {
        for (credit, weight) in credits.iter_mut().zip(&weights) {
            *credit = credit.saturating_add(i128::from(*weight));
        }
        let mut best = 0;
        for (i, credit) in credits.iter().enumerate().skip(1) {
            if *credit > credits[best] {
                best = i;
            }
        }
        credits[best] = credits[best].saturating_sub(weight_sum);
        schedule.push(members[best].identity);
    }
    schedule
}

fn schedule_weights(members: &[CommitteeMember]) -> Vec<u64> {
    let divisor = members.iter().map(|m| m.stake).fold(0, gcd).max(1);
    let reduced: Vec<u64> = members
        .iter()
        .map(|m| m.stake.checked_div(divisor).unwrap_or(m.stake))
        .collect();
    let total: u128 = reduced.iter().map(|w| u128::from(*w)).sum();
    if total <= u128::from(MAX_SCHEDULE_LEN) {
        return reduced;
    }
    reduced
        .iter()
        .map(|w| {
            let scaled = u128::from(*w)
                .saturating_mul(u128::from(MAX_SCHEDULE_LEN))
                .checked_div(total)
                .unwrap_or(0);
            u64::try_from(scaled).unwrap_or(MAX_SCHEDULE_LEN).max(1)
        })
        .collect()
}

fn gcd(a: u64, b: u64) -> u64 {
    if b == 0 {
        a
    } else {
        gcd(b, a.checked_rem(b).unwrap_or(0))
    }
}

/// The leader of `round` under `committee`.
pub fn leader(round: Round, committee: &Committee) -> Option<Pubkey> {
    let schedule = committee.leader_schedule();
    if schedule.is_empty() {
        return None;
    }
    let len = schedule.len() as u64;
    round
        .checked_rem(len)
        .and_then(|slot| usize::try_from(slot).ok())
        .and_then(|slot| schedule.get(slot))
        .copied()
}

/// Check if `identity` leads `round`.
pub fn is_leader(round: Round, committee: &Committee, identity: &Pubkey) -> bool {
    leader(round, committee).as_ref() == Some(identity)
}

/// Role tag of `identity` in `round`.
pub fn role(round: Round, committee: &Committee, identity: &Pubkey) -> Role {
    if !committee.contains(identity) {
        Role::Observer
    } else if is_leader(round, committee, identity) {
        Role::Leader
    } else {
        Role::Voter
    }
}

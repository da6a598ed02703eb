//! Stake-weighted committee for one epoch.
//!
//! Maintains an ordered set of validators with their stake weights.
//! Used for quorum calculations and leader selection.

use {
    crate::{
        error::{ConsensusError, Result},
        leader,
        types::{Epoch, Stake},
    },
    solana_pubkey::Pubkey,
    std::collections::{HashMap, HashSet},
};

/// A single committee member with its stake weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitteeMember {
    pub identity: Pubkey,
    pub stake: Stake,
}

/// An ordered, weighted, immutable set of validators valid for one epoch.
///
/// Members are sorted by (stake descending, identity ascending) so every
/// node derives the same order.
#[derive(Debug, Clone)]
pub struct Committee {
    epoch: Epoch,
    /// Members sorted by stake (descending), then identity (ascending).
    members: Vec<CommitteeMember>,
    /// Fast lookup from identity to index in `members`.
    index: HashMap<Pubkey, usize>,
    total_stake: Stake,
    quorum_threshold: Stake,
    /// Cached leader rotation, see [`leader::build_schedule`].
    leader_schedule: Vec<Pubkey>,
}

impl Committee {
    /// Build a committee from (identity, stake) pairs. Zero-stake entries are
    /// dropped and duplicate identities are merged.
    ///
    /// Fails with `CommitteeMisconfiguration` if no stake remains.
    pub fn new(epoch: Epoch, validators: Vec<(Pubkey, Stake)>) -> Result<Self> {
        let mut merged: HashMap<Pubkey, Stake> = HashMap::new();
        for (identity, stake) in validators {
            let entry = merged.entry(identity).or_default();
            *entry = entry.saturating_add(stake);
        }

        let mut members: Vec<CommitteeMember> = merged
            .into_iter()
            .filter(|(_, stake)| *stake > 0)
            .map(|(identity, stake)| CommitteeMember { identity, stake })
            .collect();
        members.sort_by(|a, b| {
            b.stake
                .cmp(&a.stake)
                .then_with(|| a.identity.cmp(&b.identity))
        });

        let total_stake = members
            .iter()
            .fold(0u64, |acc, m| acc.saturating_add(m.stake));
        if members.is_empty() || total_stake == 0 {
            return Err(ConsensusError::CommitteeMisconfiguration(format!(
                "epoch {epoch} committee has no staked members"
            )));
        }

        let index = members
            .iter()
            .enumerate()
            .map(|(i, m)| (m.identity, i))
            .collect();
        let leader_schedule = leader::build_schedule(&members);

        Ok(Self {
            epoch,
            members,
            index,
            total_stake,
            quorum_threshold: quorum_for_total(total_stake),
            leader_schedule,
        })
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn total_stake(&self) -> Stake {
        self.total_stake
    }

    /// Minimum stake strictly exceeding two-thirds of the total.
    pub fn quorum_threshold(&self) -> Stake {
        self.quorum_threshold
    }

    /// Minimum stake guaranteed to include one honest member (`f + 1`).
    pub fn validity_threshold(&self) -> Stake {
        self.total_stake
            .saturating_sub(self.quorum_threshold)
            .saturating_add(1)
    }

    pub fn get(&self, index: usize) -> Option<&CommitteeMember> {
        self.members.get(index)
    }

    pub fn member(&self, identity: &Pubkey) -> Option<&CommitteeMember> {
        self.index.get(identity).and_then(|&i| self.members.get(i))
    }

    /// Stake of a member, or 0 if not in the committee.
    pub fn stake_of(&self, identity: &Pubkey) -> Stake {
        self.member(identity).map(|m| m.stake).unwrap_or(0)
    }

    pub fn contains(&self, identity: &Pubkey) -> bool {
        self.index.contains_key(identity)
    }

    /// Total stake of the distinct members among `identities`. Unknown
    /// identities and repeats contribute nothing.
    pub fn stake_of_set<'a>(&self, identities: impl IntoIterator<Item = &'a Pubkey>) -> Stake {
        let mut seen = HashSet::new();
        identities
            .into_iter()
            .filter(|id| seen.insert(**id))
            .fold(0u64, |acc, id| acc.saturating_add(self.stake_of(id)))
    }

    pub fn has_quorum(&self, stake: Stake) -> bool {
        stake >= self.quorum_threshold
    }

    pub fn iter(&self) -> impl Iterator<Item = &CommitteeMember> {
        self.members.iter()
    }

    /// Member identities in canonical order.
    pub fn identities(&self) -> Vec<Pubkey> {
        self.members.iter().map(|m| m.identity).collect()
    }

    pub fn leader_schedule(&self) -> &[Pubkey] {
        &self.leader_schedule
    }
}

/// Quorum threshold of a committee.
pub fn quorum_threshold(committee: &Committee) -> Stake {
    committee.quorum_threshold()
}

/// `floor(2 * total / 3) + 1`, computed without overflow.
fn quorum_for_total(total: Stake) -> Stake {
    let total = u128::from(total);
    let quorum = (total.saturating_mul(2) / 3).saturating_add(1);
    Stake::try_from(quorum).unwrap_or(Stake::MAX)
}

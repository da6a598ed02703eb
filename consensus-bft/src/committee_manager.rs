//! Validator registry and per-epoch committee derivation.
//!
//! Bonding events are queued as they are observed and only take effect when
//! the next epoch begins. Every committee a node has ever derived is kept as
//! an immutable `Arc<Committee>` so the engine can look up the membership of
//! any round it still handles.

use {
    crate::{
        committee::Committee,
        config::BftConfig,
        error::{ConsensusError, Result},
        types::{Epoch, Round, Stake},
    },
    serde::{Deserialize, Serialize},
    solana_pubkey::Pubkey,
    std::{collections::BTreeMap, sync::Arc},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BondStatus {
    Bonded,
    Unbonding { requested_epoch: Epoch },
    Unbonded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    pub identity: Pubkey,
    pub stake: Stake,
    pub status: BondStatus,
}

impl Validator {
    pub fn is_bonded(&self) -> bool {
        self.status == BondStatus::Bonded
    }
}

/// A change in the staking registry, applied at the next epoch boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BondingEvent {
    /// Join (or re-join) the validator set with the given stake.
    Bond { identity: Pubkey, stake: Stake },
    /// Replace a registered validator's stake.
    StakeChange { identity: Pubkey, stake: Stake },
    /// Start leaving the validator set.
    Unbond { identity: Pubkey },
}

/// Result of moving to a new epoch.
#[derive(Debug, Clone)]
pub struct EpochTransition {
    pub committee: Arc<Committee>,
    /// Validators whose unbonding completed; they are no longer tracked.
    pub released: Vec<Validator>,
}

#[derive(Debug)]
pub struct CommitteeManager {
    epoch_length_rounds: u64,
    min_committee_size: usize,
    unbonding_cooldown_epochs: u64,
    validators: BTreeMap<Pubkey, Validator>,
    pending: Vec<BondingEvent>,
    committees: BTreeMap<Epoch, Arc<Committee>>,
    current_epoch: Epoch,
}

impl CommitteeManager {
    /// Create the registry with the epoch 0 committee. All genesis validators
    /// start bonded.
    pub fn new(genesis: Vec<(Pubkey, Stake)>, config: &BftConfig) -> Result<Self> {
        let mut validators = BTreeMap::new();
        for (identity, stake) in genesis {
            let entry = validators.entry(identity).or_insert(Validator {
                identity,
                stake: 0,
                status: BondStatus::Bonded,
            });
            entry.stake = entry.stake.saturating_add(stake);
        }

        let mut manager = Self {
            epoch_length_rounds: config.epoch_length_rounds,
            min_committee_size: config.min_committee_size,
            unbonding_cooldown_epochs: config.unbonding_cooldown_epochs,
            validators,
            pending: Vec::new(),
            committees: BTreeMap::new(),
            current_epoch: 0,
        };
        let genesis_committee = manager.build_committee(0, &manager.validators)?;
        manager.committees.insert(0, genesis_committee);
        Ok(manager)
    }

    pub fn current_epoch(&self) -> Epoch {
        self.current_epoch
    }

    pub fn epoch_of(&self, round: Round) -> Epoch {
        round.checked_div(self.epoch_length_rounds).unwrap_or(0)
    }

    /// Committee for `epoch`; unknown epochs are a misconfiguration.
    pub fn current_committee(&self, epoch: Epoch) -> Result<Arc<Committee>> {
        self.committees.get(&epoch).cloned().ok_or_else(|| {
            ConsensusError::CommitteeMisconfiguration(format!(
                "no committee for epoch {epoch} (current {})",
                self.current_epoch
            ))
        })
    }

    pub fn committee_for_round(&self, round: Round) -> Result<Arc<Committee>> {
        self.current_committee(self.epoch_of(round))
    }

    pub fn validator(&self, identity: &Pubkey) -> Option<&Validator> {
        self.validators.get(identity)
    }

    pub fn validators(&self) -> impl Iterator<Item = &Validator> {
        self.validators.values()
    }

    pub fn pending_events(&self) -> &[BondingEvent] {
        &self.pending
    }

    /// Queue an event for the next epoch boundary.
    pub fn submit_event(&mut self, event: BondingEvent) {
        log::debug!("queued bonding event {event:?} for epoch {}", self.current_epoch.saturating_add(1));
        self.pending.push(event);
    }

    /// Apply queued events, complete cooled-down unbondings and derive the
    /// next epoch's committee.
    ///
    /// The registry is only updated if the resulting committee is usable; on
    /// `CommitteeMisconfiguration` the manager stays in the current epoch with
    /// its event queue intact.
    pub fn advance_epoch(&mut self) -> Result<EpochTransition> {
        let next_epoch = self.current_epoch.saturating_add(1);
        let mut validators = self.validators.clone();

        for event in &self.pending {
            apply_event(&mut validators, *event, self.current_epoch);
        }

        let mut released = Vec::new();
        validators.retain(|_, v| match v.status {
            BondStatus::Unbonding { requested_epoch }
                if next_epoch >= requested_epoch.saturating_add(self.unbonding_cooldown_epochs) =>
            {
                released.push(Validator {
                    status: BondStatus::Unbonded,
                    ..*v
                });
                false
            }
            _ => true,
        });

        let committee = self.build_committee(next_epoch, &validators)?;

        self.validators = validators;
        self.pending.clear();
        self.current_epoch = next_epoch;
        self.committees.insert(next_epoch, committee.clone());
        log::info!(
            "epoch {next_epoch}: committee of {} validators, total stake {}, {} released",
            committee.len(),
            committee.total_stake(),
            released.len()
        );
        Ok(EpochTransition {
            committee,
            released,
        })
    }

    /// Drop committees of epochs before `epoch`.
    pub fn prune(&mut self, epoch: Epoch) {
        self.committees = self.committees.split_off(&epoch.min(self.current_epoch));
    }

    fn build_committee(
        &self,
        epoch: Epoch,
        validators: &BTreeMap<Pubkey, Validator>,
    ) -> Result<Arc<Committee>> {
        let bonded: Vec<(Pubkey, Stake)> = validators
            .values()
            .filter(|v| v.is_bonded() && v.stake > 0)
            .map(|v| (v.identity, v.stake))
            .collect();
        if bonded.len() < self.min_committee_size {
            return Err(ConsensusError::CommitteeMisconfiguration(format!(
                "epoch {epoch} has {} bonded validators, need at least {}",
                bonded.len(),
                self.min_committee_size
            )));
        }
        Committee::new(epoch, bonded).map(Arc::new)
    }
}

fn apply_event(validators: &mut BTreeMap<Pubkey, Validator>, event: BondingEvent, epoch: Epoch) {
    match event {
        BondingEvent::Bond { identity, stake } => {
            validators.insert(
                identity,
                Validator {
                    identity,
                    stake,
                    status: BondStatus::Bonded,
                },
            );
        }
        BondingEvent::StakeChange { identity, stake } => match validators.get_mut(&identity) {
            Some(v) => v.stake = stake,
            None => log::warn!("stake change for unknown validator {identity} ignored"),
        },
        BondingEvent::Unbond { identity } => match validators.get_mut(&identity) {
            Some(v) if v.is_bonded() => {
                v.status = BondStatus::Unbonding {
                    requested_epoch: epoch,
                }
            }
            Some(_) => {}
            None => log::warn!("unbond for unknown validator {identity} ignored"),
        },
    }
}

//! Certificate store.
//!
//! Certificates live in an arena keyed by `(round, proposer)`; references
//! between them are parent digests resolved through a digest index. The
//! store also owns the commit frontier: the highest committed round and the
//! digest of the certificate committed there.
//!
//! # Commit structure
//!
//! Every certificate has a *primary parent*, its highest-round parent (none
//! for certificates built on genesis). Committing an anchor commits its
//! primary-parent chain down to the previous frontier certificate, oldest
//! first. Certificates at or below the new frontier that are not on that
//! chain can never be committed and are removed as orphans.

use {
    crate::{
        committee::Committee,
        error::{ConsensusError, Result},
        types::{Certificate, CertificateKey, Round, Stake, GENESIS_ROUND},
    },
    solana_hash::Hash,
    solana_pubkey::Pubkey,
    std::collections::{BTreeMap, HashMap, HashSet},
};

/// Certificates moved by a commit.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CommitOutcome {
    /// Newly committed certificates, ascending by round.
    pub committed: Vec<Certificate>,
    /// Certificates that lost their chance to be committed.
    pub orphaned: Vec<Certificate>,
}

#[derive(Debug, Default)]
pub struct CertificateStore {
    certificates: BTreeMap<CertificateKey, Certificate>,
    by_digest: HashMap<Hash, CertificateKey>,
    /// Committed digests and their rounds. Entries outlive garbage collection
    /// of the certificate itself so later references still resolve.
    committed: HashMap<Hash, Round>,
    frontier: Round,
    frontier_digest: Option<Hash>,
}

impl CertificateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest committed round (`GENESIS_ROUND` before the first commit).
    pub fn frontier(&self) -> Round {
        self.frontier
    }

    pub fn frontier_digest(&self) -> Option<Hash> {
        self.frontier_digest
    }

    pub fn len(&self) -> usize {
        self.certificates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certificates.is_empty()
    }

    pub fn get(&self, digest: &Hash) -> Option<&Certificate> {
        self.by_digest
            .get(digest)
            .and_then(|key| self.certificates.get(key))
    }

    pub fn get_by_key(&self, key: &CertificateKey) -> Option<&Certificate> {
        self.certificates.get(key)
    }

    /// Whether `digest` resolves: stored, or committed and since collected.
    pub fn is_known(&self, digest: &Hash) -> bool {
        self.by_digest.contains_key(digest) || self.committed.contains_key(digest)
    }

    pub fn is_committed(&self, digest: &Hash) -> bool {
        self.committed.contains_key(digest)
    }

    /// Round of a known certificate.
    pub fn round_of(&self, digest: &Hash) -> Option<Round> {
        self.by_digest
            .get(digest)
            .map(|key| key.round)
            .or_else(|| self.committed.get(digest).copied())
    }

    /// Highest-round parent of `certificate` and its round; `None` when it
    /// builds directly on genesis. Unknown parents are skipped.
    pub fn primary_parent(&self, certificate: &Certificate) -> Option<(Hash, Round)> {
        self.primary_parent_of(certificate.parents())
    }

    /// Same as [`Self::primary_parent`] for a bare parent list.
    pub fn primary_parent_of(&self, parents: &[Hash]) -> Option<(Hash, Round)> {
        parents
            .iter()
            .filter_map(|p| self.round_of(p).map(|round| (*p, round)))
            .max_by_key(|(_, round)| *round)
    }

    /// Insert a certificate after checking it against the frontier and the
    /// references it makes.
    pub fn add_certificate(&mut self, certificate: Certificate) -> Result<()> {
        let round = certificate.round();
        let key = certificate.key();
        let digest = certificate.digest();

        if round < self.frontier {
            return Err(ConsensusError::StaleRound {
                round,
                frontier: self.frontier,
            });
        }
        if round == self.frontier && round != GENESIS_ROUND {
            if Some(digest) == self.frontier_digest {
                return Err(ConsensusError::DuplicateCertificate(key));
            }
            return Err(ConsensusError::SafetyViolation {
                round,
                reason: format!(
                    "certificate {digest} conflicts with committed {}",
                    self.frontier_digest.unwrap_or_default()
                ),
            });
        }
        if self.certificates.contains_key(&key) {
            return Err(ConsensusError::DuplicateCertificate(key));
        }
        for parent in certificate.parents() {
            let Some(parent_round) = self.round_of(parent) else {
                return Err(ConsensusError::DanglingReference {
                    round,
                    missing: *parent,
                });
            };
            if parent_round >= round {
                return Err(ConsensusError::InvalidCertificate {
                    key,
                    reason: format!("parent {parent} from round {parent_round} is not earlier"),
                });
            }
        }

        self.insert_unchecked(certificate);
        Ok(())
    }

    fn insert_unchecked(&mut self, certificate: Certificate) {
        let key = certificate.key();
        self.by_digest.insert(certificate.digest(), key);
        self.certificates.insert(key, certificate);
    }

    fn remove(&mut self, key: &CertificateKey) -> Option<Certificate> {
        let certificate = self.certificates.remove(key)?;
        self.by_digest.remove(&certificate.digest());
        Some(certificate)
    }

    /// Certificates stored for `round`, by proposer.
    pub fn certificates_at(&self, round: Round) -> impl Iterator<Item = &Certificate> {
        let start = CertificateKey {
            round,
            proposer: Pubkey::default(),
        };
        self.certificates
            .range(start..)
            .take_while(move |(key, _)| key.round == round)
            .map(|(_, cert)| cert)
    }

    /// Certificates from `round` upward, at most `limit`.
    pub fn certificates_from(&self, round: Round, limit: usize) -> Vec<&Certificate> {
        let start = CertificateKey {
            round,
            proposer: Pubkey::default(),
        };
        self.certificates
            .range(start..)
            .take(limit)
            .map(|(_, cert)| cert)
            .collect()
    }

    /// Whether the voters of `round`'s certificates carry quorum stake. The
    /// genesis round is always complete.
    pub fn round_complete(&self, round: Round, committee: &Committee) -> bool {
        if round == GENESIS_ROUND {
            return true;
        }
        let voters: HashSet<&Pubkey> = self
            .certificates_at(round)
            .flat_map(Certificate::voters)
            .collect();
        committee.has_quorum(committee.stake_of_set(voters))
    }

    /// Distinct-voter stake of next-round certificates whose primary parent is
    /// `digest`.
    pub fn endorsement_stake(&self, digest: &Hash, committee: &Committee) -> Stake {
        let Some(round) = self.round_of(digest) else {
            return 0;
        };
        let voters: HashSet<&Pubkey> = self
            .certificates_at(round.saturating_add(1))
            .filter(|cert| self.primary_parent(cert).map(|(p, _)| p) == Some(*digest))
            .flat_map(Certificate::voters)
            .collect();
        committee.stake_of_set(voters)
    }

    /// Highest-round certificate held; the parent of the next proposal.
    pub fn high_certificate(&self) -> Option<&Certificate> {
        self.certificates.values().next_back()
    }

    pub fn highest_round(&self) -> Round {
        self.certificates
            .keys()
            .next_back()
            .map(|key| key.round)
            .unwrap_or(self.frontier)
    }

    /// Rounds above `after` holding at least one certificate, ascending.
    pub fn ready_rounds(&self, after: Round) -> ReadyRounds<'_> {
        ReadyRounds {
            store: self,
            next: after.saturating_add(1),
        }
    }

    /// Commit `anchor` together with its uncommitted ancestors.
    ///
    /// Committing an already committed anchor is a no-op.
    pub fn commit(&mut self, anchor: &Hash) -> Result<CommitOutcome> {
        if self.committed.contains_key(anchor) {
            return Ok(CommitOutcome::default());
        }
        let Some(anchor_cert) = self.get(anchor) else {
            return Err(ConsensusError::DanglingReference {
                round: self.frontier,
                missing: *anchor,
            });
        };
        let anchor_round = anchor_cert.round();
        if anchor_round <= self.frontier {
            return Err(ConsensusError::SafetyViolation {
                round: anchor_round,
                reason: format!("anchor {anchor} at or below frontier {}", self.frontier),
            });
        }

        let mut chain = vec![anchor_cert.key()];
        let mut cursor = anchor_cert;
        loop {
            match self.primary_parent(cursor) {
                None if self.frontier_digest.is_none() => break,
                Some((parent, _)) if Some(parent) == self.frontier_digest => break,
                Some((parent, round)) if round > self.frontier => {
                    let Some(next) = self.get(&parent) else {
                        return Err(ConsensusError::SafetyViolation {
                            round: anchor_round,
                            reason: format!("chain of {anchor} broken at {parent}"),
                        });
                    };
                    chain.push(next.key());
                    cursor = next;
                }
                _ => {
                    return Err(ConsensusError::SafetyViolation {
                        round: anchor_round,
                        reason: format!(
                            "chain of {anchor} does not extend committed round {}",
                            self.frontier
                        ),
                    });
                }
            }
        }
        chain.reverse();

        let on_chain: HashSet<CertificateKey> = chain.iter().copied().collect();
        let committed: Vec<Certificate> = chain
            .iter()
            .filter_map(|key| self.certificates.get(key).cloned())
            .collect();
        for cert in &committed {
            self.committed.insert(cert.digest(), cert.round());
        }
        self.frontier = anchor_round;
        self.frontier_digest = Some(*anchor);

        let orphan_keys: Vec<CertificateKey> = self
            .certificates
            .range(..=CertificateKey {
                round: anchor_round,
                proposer: Pubkey::new_from_array([u8::MAX; 32]),
            })
            .filter(|(key, cert)| {
                !on_chain.contains(key) && !self.committed.contains_key(&cert.digest())
            })
            .map(|(key, _)| *key)
            .collect();
        let orphaned = orphan_keys
            .iter()
            .filter_map(|key| self.remove(key))
            .collect();

        Ok(CommitOutcome {
            committed,
            orphaned,
        })
    }

    /// Drop certificates more than `depth` rounds below the frontier and
    /// return them.
    pub fn gc(&mut self, depth: u64) -> Vec<Certificate> {
        let cutoff = self.frontier.saturating_sub(depth);
        if cutoff == GENESIS_ROUND {
            return Vec::new();
        }
        let keep = self.certificates.split_off(&CertificateKey {
            round: cutoff,
            proposer: Pubkey::default(),
        });
        let removed: Vec<Certificate> = std::mem::replace(&mut self.certificates, keep)
            .into_values()
            .collect();
        for cert in &removed {
            self.by_digest.remove(&cert.digest());
        }
        let retain_from = cutoff.saturating_sub(depth);
        let frontier_digest = self.frontier_digest;
        self.committed
            .retain(|digest, round| *round >= retain_from || Some(*digest) == frontier_digest);
        removed
    }

    /// Rebuild from persisted state: the committed `(digest, round)` sequence
    /// in commit order and every stored certificate. Certificates at or below
    /// the frontier that were never committed are skipped.
    pub fn restore(
        committed: impl IntoIterator<Item = (Hash, Round)>,
        certificates: impl IntoIterator<Item = Certificate>,
    ) -> Self {
        let mut store = Self::new();
        for (digest, round) in committed {
            store.committed.insert(digest, round);
            if round >= store.frontier {
                store.frontier = round;
                store.frontier_digest = Some(digest);
            }
        }
        for certificate in certificates {
            let digest = certificate.digest();
            if certificate.round() <= store.frontier && !store.committed.contains_key(&digest) {
                continue;
            }
            store.insert_unchecked(certificate);
        }
        store
    }
}

/// Iterator over rounds holding certificates; see
/// [`CertificateStore::ready_rounds`]. Holds only a cursor, so a fresh one
/// can resume from any round.
pub struct ReadyRounds<'a> {
    store: &'a CertificateStore,
    next: Round,
}

impl ReadyRounds<'_> {
    /// Last round yielded (or the starting point); pass it back to
    /// [`CertificateStore::ready_rounds`] to resume.
    pub fn position(&self) -> Round {
        self.next.saturating_sub(1)
    }
}

impl Iterator for ReadyRounds<'_> {
    type Item = Round;

    fn next(&mut self) -> Option<Round> {
        let start = CertificateKey {
            round: self.next,
            proposer: Pubkey::default(),
        };
        let (key, _) = self.store.certificates.range(start..).next()?;
        let round = key.round;
        self.next = round.saturating_add(1);
        Some(round)
    }
}

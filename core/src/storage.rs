//! Persistent consensus state.
//!
//! Four sled trees:
//!
//! | Tree           | Key                              | Value            |
//! |----------------|----------------------------------|------------------|
//! | `certificates` | round (u64-be) ‖ proposer bytes  | `Certificate`    |
//! | `batches`      | certificate digest               | `Batch`          |
//! | `commits`      | sequence (u64-be)                | `CommitRecord`   |
//! | `meta`         | `b"safety"`                      | `SafetyState`    |
//!
//! Big-endian round and sequence prefixes keep sled's lexicographic order
//! equal to numeric order, so range scans return rounds ascending.

use {
    bastion_consensus_bft::{
        Batch, Certificate, CertifiedBatch, CommitRecord, Round, SafetyState,
    },
    log::{debug, trace},
    serde::{de::DeserializeOwned, Serialize},
    solana_hash::Hash,
    std::{collections::HashMap, path::Path},
    thiserror::Error,
};

const CERTIFICATES_TREE: &str = "certificates";
const BATCHES_TREE: &str = "batches";
const COMMITS_TREE: &str = "commits";
const META_TREE: &str = "meta";
const SAFETY_KEY: &[u8] = b"safety";

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    /// A stored entry is inconsistent with the rest of the database.
    #[error("corrupt storage: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Everything the adapter needs to resume after a restart.
#[derive(Debug, Default)]
pub struct RecoveredState {
    pub certificates: Vec<Certificate>,
    /// Batches by certificate digest.
    pub batches: HashMap<Hash, Batch>,
    /// Commit sequence in order.
    pub commits: Vec<CommitRecord>,
    pub safety: SafetyState,
}

impl RecoveredState {
    pub fn is_empty(&self) -> bool {
        self.certificates.is_empty() && self.commits.is_empty()
    }

    pub fn frontier(&self) -> Round {
        self.commits.last().map(|record| record.round).unwrap_or_default()
    }
}

pub struct SledStorage {
    db: sled::Db,
    certificates: sled::Tree,
    batches: sled::Tree,
    commits: sled::Tree,
    meta: sled::Tree,
}

impl SledStorage {
    /// Open or create the database under `path`.
    pub fn open(path: &Path) -> Result<Self> {
        debug!("opening consensus storage at {}", path.display());
        Self::from_db(sled::open(path)?)
    }

    /// A throwaway in-memory database.
    pub fn open_temporary() -> Result<Self> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: sled::Db) -> Result<Self> {
        Ok(Self {
            certificates: db.open_tree(CERTIFICATES_TREE)?,
            batches: db.open_tree(BATCHES_TREE)?,
            commits: db.open_tree(COMMITS_TREE)?,
            meta: db.open_tree(META_TREE)?,
            db,
        })
    }

    /// Store a certificate with its batch. Rewriting one is a no-op.
    pub fn put_certified(&self, certified: &CertifiedBatch) -> Result<()> {
        let certificate = &certified.certificate;
        trace!("persisting certificate {}", certificate.key());
        self.batches
            .insert(certificate.digest().as_ref(), encode(&certified.batch)?)?;
        self.certificates
            .insert(certificate_key(certificate), encode(certificate)?)?;
        Ok(())
    }

    /// Forget an orphaned certificate and its batch.
    pub fn remove_certified(&self, certificate: &Certificate) -> Result<()> {
        self.certificates.remove(certificate_key(certificate))?;
        self.batches.remove(certificate.digest().as_ref())?;
        Ok(())
    }

    pub fn batch(&self, digest: &Hash) -> Result<Option<Batch>> {
        self.batches
            .get(digest.as_ref())?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    /// Up to `limit` certified batches from `round` on, ascending.
    pub fn certified_batches_from(&self, round: Round, limit: usize) -> Result<Vec<CertifiedBatch>> {
        let mut out = Vec::new();
        for entry in self.certificates.range(round.to_be_bytes()..) {
            if out.len() >= limit {
                break;
            }
            let (_, bytes) = entry?;
            let certificate: Certificate = decode(&bytes)?;
            let digest = certificate.digest();
            let batch = self.batch(&digest)?.ok_or_else(|| {
                StorageError::Corrupt(format!("batch of certificate {digest} missing"))
            })?;
            out.push(CertifiedBatch { certificate, batch });
        }
        Ok(out)
    }

    pub fn certificate_count(&self) -> usize {
        self.certificates.len()
    }

    /// Append to the commit sequence. Records must arrive in sequence order.
    pub fn append_commit(&self, record: &CommitRecord) -> Result<()> {
        let expected = self.next_sequence()?;
        if record.sequence != expected {
            return Err(StorageError::Corrupt(format!(
                "commit sequence {} appended, expected {expected}",
                record.sequence
            )));
        }
        self.commits
            .insert(record.sequence.to_be_bytes(), encode(record)?)?;
        Ok(())
    }

    pub fn last_commit(&self) -> Result<Option<CommitRecord>> {
        self.commits
            .last()?
            .map(|(_, bytes)| decode(&bytes))
            .transpose()
    }

    pub fn next_sequence(&self) -> Result<u64> {
        Ok(self
            .last_commit()?
            .map(|record| record.sequence.saturating_add(1))
            .unwrap_or_default())
    }

    pub fn commits(&self) -> Result<Vec<CommitRecord>> {
        self.commits
            .iter()
            .map(|entry| {
                let (_, bytes) = entry?;
                decode(&bytes)
            })
            .collect()
    }

    /// Persist the voting state. Flushed before returning so a vote is never
    /// sent ahead of the state that produced it.
    pub fn put_safety_state(&self, safety: &SafetyState) -> Result<()> {
        self.meta.insert(SAFETY_KEY, encode(safety)?)?;
        self.meta.flush()?;
        Ok(())
    }

    pub fn safety_state(&self) -> Result<Option<SafetyState>> {
        self.meta
            .get(SAFETY_KEY)?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    /// Load everything needed to rebuild the engine.
    pub fn recover(&self) -> Result<RecoveredState> {
        let mut certificates = Vec::with_capacity(self.certificates.len());
        for entry in self.certificates.iter() {
            let (_, bytes) = entry?;
            certificates.push(decode::<Certificate>(&bytes)?);
        }
        let mut batches = HashMap::with_capacity(self.batches.len());
        for entry in self.batches.iter() {
            let (key, bytes) = entry?;
            let digest = <[u8; 32]>::try_from(key.as_ref())
                .map(Hash::from)
                .map_err(|_| StorageError::Corrupt(format!("batch key of {} bytes", key.len())))?;
            batches.insert(digest, decode::<Batch>(&bytes)?);
        }
        let commits = self.commits()?;
        if let Some((position, record)) = commits
            .iter()
            .enumerate()
            .find(|(position, record)| record.sequence != *position as u64)
        {
            return Err(StorageError::Corrupt(format!(
                "commit sequence {} at position {position}",
                record.sequence
            )));
        }
        Ok(RecoveredState {
            certificates,
            batches,
            commits,
            safety: self.safety_state()?.unwrap_or_default(),
        })
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

fn certificate_key(certificate: &Certificate) -> Vec<u8> {
    let mut key = Vec::with_capacity(40);
    key.extend_from_slice(&certificate.round().to_be_bytes());
    key.extend_from_slice(certificate.proposer().as_ref());
    key
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

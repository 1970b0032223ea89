//! Network database collaborator
//!
//! The store pulls records from an external database through [`NetDb`].
//! [`MemoryNetDb`] is a simple in-process implementation used by the
//! simulator and tests.

use async_trait::async_trait;
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use veil_protocol::IdentHash;

use crate::error::{NetDbError, Result};
use crate::record::{PeerCaps, PeerRecord};

/// Filter applied when sampling records
#[derive(Debug, Clone, Default)]
pub struct SampleConstraints {
    /// Identities to leave out
    pub exclude: HashSet<IdentHash>,
    /// Capabilities every returned record must declare
    pub required_caps: PeerCaps,
}

impl SampleConstraints {
    pub fn matches(&self, record: &PeerRecord) -> bool {
        !self.exclude.contains(&record.ident_hash()) && record.caps.contains(self.required_caps)
    }
}

/// External source of peer records
#[async_trait]
pub trait NetDb: Send + Sync {
    /// Fetch the record for one identity
    async fn lookup_peer(&self, ident: &IdentHash) -> Result<PeerRecord>;

    /// Up to `count` random records matching `constraints`
    async fn sample(&self, count: usize, constraints: &SampleConstraints) -> Result<Vec<PeerRecord>>;
}

/// In-memory network database
#[derive(Debug, Default)]
pub struct MemoryNetDb {
    records: RwLock<HashMap<IdentHash, PeerRecord>>,
}

impl MemoryNetDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish or replace a record
    pub async fn publish(&self, record: PeerRecord) {
        self.records.write().await.insert(record.ident_hash(), record);
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl NetDb for MemoryNetDb {
    async fn lookup_peer(&self, ident: &IdentHash) -> Result<PeerRecord> {
        self.records
            .read()
            .await
            .get(ident)
            .cloned()
            .ok_or(NetDbError::NotFound(*ident))
    }

    async fn sample(&self, count: usize, constraints: &SampleConstraints) -> Result<Vec<PeerRecord>> {
        let records = self.records.read().await;
        let candidates: Vec<&PeerRecord> = records.values().filter(|r| constraints.matches(r)).collect();
        let mut rng = rand::thread_rng();
        Ok(candidates
            .choose_multiple(&mut rng, count)
            .map(|r| (*r).clone())
            .collect())
    }
}

//! PeerRecord store
//!
//! Readers take a cheap snapshot (`Arc` clone) and never block writers for
//! longer than the swap. Writers build a new snapshot and swap it in.
//! Selection counters change on every path selection and are kept in a
//! concurrent map next to the snapshot instead.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};
use veil_protocol::types::now_secs;
use veil_protocol::IdentHash;

use crate::error::{NetDbError, Result};
use crate::netdb::{NetDb, SampleConstraints};
use crate::profile::{BuildOutcome, PeerProfile, SelectionCounts};
use crate::record::{PeerRecord, SharedRecord};

/// One known peer with its profile
#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub record: SharedRecord,
    pub profile: PeerProfile,
}

/// Immutable view of the store
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    peers: HashMap<IdentHash, PeerEntry>,
}

impl StoreSnapshot {
    pub fn get(&self, ident: &IdentHash) -> Option<&PeerEntry> {
        self.peers.get(ident)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&IdentHash, &PeerEntry)> {
        self.peers.iter()
    }
}

/// Store of verified peer records and their profiles
#[derive(Debug, Default)]
pub struct PeerStore {
    snapshot: RwLock<Arc<StoreSnapshot>>,
    selections: DashMap<IdentHash, SelectionCounts>,
}

impl PeerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current snapshot
    pub fn snapshot(&self) -> Arc<StoreSnapshot> {
        match self.snapshot.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Apply `f` to a copy of the current snapshot and swap it in
    fn update<R>(&self, f: impl FnOnce(&mut StoreSnapshot) -> R) -> R {
        let mut guard = match self.snapshot.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut next = StoreSnapshot::clone(&guard);
        let result = f(&mut next);
        *guard = Arc::new(next);
        result
    }

    /// Insert a record after verifying its signature and freshness
    ///
    /// A newer record replaces an older one for the same identity; the
    /// profile is kept.
    pub fn insert(&self, record: PeerRecord) -> Result<()> {
        let ident = record.ident_hash();
        record.verify()?;
        if record.is_expired(now_secs()) {
            return Err(NetDbError::Expired(ident));
        }

        let record = Arc::new(record);
        self.update(|snap| match snap.peers.get_mut(&ident) {
            Some(entry) if entry.record.published >= record.published => {}
            Some(entry) => entry.record = record,
            None => {
                snap.peers.insert(
                    ident,
                    PeerEntry {
                        record,
                        profile: PeerProfile::new(),
                    },
                );
            }
        });
        Ok(())
    }

    pub fn get(&self, ident: &IdentHash) -> Option<SharedRecord> {
        self.snapshot().get(ident).map(|e| Arc::clone(&e.record))
    }

    pub fn profile(&self, ident: &IdentHash) -> Option<PeerProfile> {
        self.snapshot().get(ident).map(|e| e.profile.clone())
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    pub fn remove(&self, ident: &IdentHash) -> bool {
        self.selections.remove(ident);
        self.update(|snap| snap.peers.remove(ident).is_some())
    }

    /// Drop expired records, returning how many were removed
    pub fn expire(&self, now: u64) -> usize {
        let removed = self.update(|snap| {
            let before = snap.peers.len();
            snap.peers.retain(|_, e| !e.record.is_expired(now));
            before - snap.peers.len()
        });
        if removed > 0 {
            let snapshot = self.snapshot();
            self.selections.retain(|ident, _| snapshot.get(ident).is_some());
        }
        removed
    }

    pub fn selection_counts(&self, ident: &IdentHash) -> SelectionCounts {
        self.selections.get(ident).map(|c| *c).unwrap_or_default()
    }

    /// Record build outcomes for every hop of one attempt in a single swap
    pub fn record_build_outcomes(&self, outcomes: &[(IdentHash, BuildOutcome)]) {
        if outcomes.is_empty() {
            return;
        }
        self.update(|snap| {
            for (ident, outcome) in outcomes {
                if let Some(entry) = snap.peers.get_mut(ident) {
                    entry.profile.record_build(*outcome);
                }
            }
        });
    }

    pub fn record_transport_failure(&self, ident: &IdentHash) {
        self.update(|snap| {
            if let Some(entry) = snap.peers.get_mut(ident) {
                entry.profile.record_transport_failure();
            }
        });
    }

    pub fn record_transport_success(&self, ident: &IdentHash) {
        // Avoid a swap for the common case
        let needs_update = self
            .snapshot()
            .get(ident)
            .map(|e| e.profile.consecutive_transport_failures > 0)
            .unwrap_or(false);
        if needs_update {
            self.update(|snap| {
                if let Some(entry) = snap.peers.get_mut(ident) {
                    entry.profile.record_transport_success();
                }
            });
        }
    }

    /// Record which peers the selector took and which it skipped as bad
    ///
    /// A peer skipped far more often than it was taken gets a clean profile;
    /// only then is a new snapshot swapped in.
    pub fn record_selection(&self, taken: &[IdentHash], rejected: &[IdentHash]) {
        for ident in taken {
            self.selections.entry(*ident).or_default().record_taken();
        }
        let reset: Vec<IdentHash> = rejected
            .iter()
            .filter(|ident| self.selections.entry(**ident).or_default().record_rejected())
            .copied()
            .collect();
        if reset.is_empty() {
            return;
        }
        debug!("Clearing profiles of {} long-rejected peers", reset.len());
        self.update(|snap| {
            for ident in &reset {
                if let Some(entry) = snap.peers.get_mut(ident) {
                    entry.profile = PeerProfile::default();
                }
            }
        });
    }

    /// Look up a peer, asking the network database on a miss
    pub async fn lookup_or_fetch(&self, netdb: &dyn NetDb, ident: &IdentHash) -> Result<SharedRecord> {
        if let Some(record) = self.get(ident) {
            return Ok(record);
        }
        let record = netdb.lookup_peer(ident).await?;
        self.insert(record)?;
        self.get(ident).ok_or(NetDbError::NotFound(*ident))
    }

    /// Pull up to `count` fresh records from the network database
    ///
    /// Records that fail verification are discarded. Returns how many new
    /// peers were added.
    pub async fn refresh(&self, netdb: &dyn NetDb, count: usize) -> Result<usize> {
        let constraints = SampleConstraints {
            exclude: self.snapshot().peers.keys().copied().collect(),
            ..SampleConstraints::default()
        };
        let records = netdb.sample(count, &constraints).await?;

        let before = self.len();
        for record in records {
            let ident = record.ident_hash();
            if let Err(e) = self.insert(record) {
                warn!("Discarding peer record {}: {}", ident, e);
            }
        }
        let added = self.len().saturating_sub(before);
        debug!("Peer store refreshed: {} added, {} total", added, self.len());
        Ok(added)
    }
}

//! Path selection
//!
//! Picks the hops of a new tunnel from a store snapshot:
//! - never the local router or an excluded peer
//! - no two hops in the same network prefix
//! - peers with bad profiles and hidden peers are skipped
//! - the gateway of an inbound tunnel must be reachable
//!
//! Each hop is drawn at random, weighted by profile score.

use rand::seq::SliceRandom;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;
use veil_protocol::types::now_secs;
use veil_protocol::{Direction, IdentHash};

use crate::error::{NetDbError, Result};
use crate::record::{NetworkPrefix, SharedRecord};
use crate::store::PeerStore;

/// Maximum hops in one tunnel
pub const MAX_TUNNEL_HOPS: usize = 7;

/// Floor on selection weight so unlucky peers still get picked sometimes
const MIN_SELECTION_WEIGHT: f64 = 0.01;

#[derive(Debug, Clone)]
struct Candidate {
    record: SharedRecord,
    prefix: Option<NetworkPrefix>,
    score: f64,
}

/// Chooses tunnel paths from the peer store
#[derive(Debug, Clone)]
pub struct PathSelector {
    store: Arc<PeerStore>,
    local: IdentHash,
}

impl PathSelector {
    pub fn new(store: Arc<PeerStore>, local: IdentHash) -> Self {
        PathSelector { store, local }
    }

    pub fn store(&self) -> &Arc<PeerStore> {
        &self.store
    }

    /// Select `hops` peers for a tunnel in `direction`, in path order
    ///
    /// Path order starts at the hop adjacent to us for outbound tunnels and
    /// at the gateway for inbound tunnels.
    pub fn select(
        &self,
        hops: usize,
        direction: Direction,
        exclusion: &HashSet<IdentHash>,
    ) -> Result<Vec<SharedRecord>> {
        if hops == 0 {
            return Ok(Vec::new());
        }
        if hops > MAX_TUNNEL_HOPS {
            return Err(NetDbError::InsufficientPeers {
                needed: hops,
                available: MAX_TUNNEL_HOPS,
            });
        }

        let snapshot = self.store.snapshot();
        let now = now_secs();
        let mut rejected = Vec::new();

        let candidates: Vec<Candidate> = snapshot
            .iter()
            .filter(|(ident, entry)| {
                **ident != self.local
                    && !exclusion.contains(ident)
                    && !entry.record.is_hidden()
                    && !entry.record.addresses.is_empty()
                    && !entry.record.is_expired(now)
            })
            .filter(|(ident, entry)| {
                if entry.profile.is_bad() {
                    rejected.push(**ident);
                    false
                } else {
                    true
                }
            })
            .map(|(_, entry)| Candidate {
                record: Arc::clone(&entry.record),
                prefix: entry.record.network_prefix(),
                score: entry.profile.score(now).max(MIN_SELECTION_WEIGHT),
            })
            .collect();

        let available = candidates.len();
        let mut rng = rand::thread_rng();
        let mut used_prefixes: HashSet<NetworkPrefix> = HashSet::new();
        let mut used_idents: HashSet<IdentHash> = HashSet::new();
        let mut path: Vec<SharedRecord> = Vec::with_capacity(hops);

        for position in 0..hops {
            let needs_reachable = direction == Direction::Inbound && position == 0;
            let eligible: Vec<&Candidate> = candidates
                .iter()
                .filter(|c| !used_idents.contains(&c.record.ident_hash()))
                .filter(|c| c.prefix.map_or(true, |p| !used_prefixes.contains(&p)))
                .filter(|c| !needs_reachable || c.record.is_reachable())
                .collect();

            let chosen = match eligible.choose_weighted(&mut rng, |c| c.score) {
                Ok(chosen) => *chosen,
                Err(_) => {
                    debug!(
                        "Path selection stuck at hop {} of {} ({} candidates)",
                        position + 1,
                        hops,
                        available
                    );
                    self.store.record_selection(&[], &rejected);
                    return Err(NetDbError::InsufficientPeers {
                        needed: hops,
                        available,
                    });
                }
            };

            used_idents.insert(chosen.record.ident_hash());
            if let Some(prefix) = chosen.prefix {
                used_prefixes.insert(prefix);
            }
            path.push(Arc::clone(&chosen.record));
        }

        let taken: Vec<IdentHash> = path.iter().map(|r| r.ident_hash()).collect();
        self.store.record_selection(&taken, &rejected);
        Ok(path)
    }

    /// Use a configured peer list, in order
    ///
    /// Fails if fewer than `hops` distinct listed peers are known. A peer
    /// listed twice is used once.
    pub fn select_explicit(&self, hops: usize, peers: &[IdentHash]) -> Result<Vec<SharedRecord>> {
        let snapshot = self.store.snapshot();
        let mut seen: HashSet<IdentHash> = HashSet::new();
        let known: Vec<SharedRecord> = peers
            .iter()
            .filter(|ident| **ident != self.local)
            .filter(|ident| seen.insert(**ident))
            .filter_map(|ident| snapshot.get(ident).map(|e| Arc::clone(&e.record)))
            .collect();

        if known.len() < hops {
            return Err(NetDbError::InsufficientPeers {
                needed: hops,
                available: known.len(),
            });
        }

        Ok(known.into_iter().take(hops).collect())
    }
}

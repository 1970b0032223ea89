//! Lease sets: how remote senders reach a local destination

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use veil_crypto::{sha256, X25519PublicKey, X25519StaticSecret};
use veil_protocol::{IdentHash, TunnelId};

/// Entry point into one of a destination's inbound tunnels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub gateway: IdentHash,
    pub tunnel_id: TunnelId,
    /// Milliseconds since epoch
    pub expires: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseSet {
    pub destination: IdentHash,
    pub encryption_key: [u8; 32],
    pub leases: Vec<Lease>,
}

impl LeaseSet {
    /// A random lease that is still valid at `now`
    pub fn pick(&self, now: u64) -> Option<Lease> {
        let live: Vec<&Lease> = self.leases.iter().filter(|l| l.expires > now).collect();
        live.choose(&mut rand::thread_rng()).map(|l| **l)
    }
}

/// Keys of a destination hosted on this router
pub struct LocalDestination {
    pub ident: IdentHash,
    pub secret: X25519StaticSecret,
    pub public: [u8; 32],
}

impl LocalDestination {
    pub fn new(secret: X25519StaticSecret) -> Self {
        let public = X25519PublicKey::from(&secret).to_bytes();
        LocalDestination {
            ident: destination_hash(&public),
            secret,
            public,
        }
    }
}

impl std::fmt::Debug for LocalDestination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalDestination")
            .field("ident", &self.ident)
            .finish_non_exhaustive()
    }
}

/// Destination hash from its encryption key
pub fn destination_hash(public: &[u8; 32]) -> IdentHash {
    IdentHash::from_bytes(sha256(public))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pick_skips_expired() {
        let lease = |tunnel_id, expires| Lease {
            gateway: IdentHash::from_bytes([3u8; 32]),
            tunnel_id,
            expires,
        };
        let set = LeaseSet {
            destination: IdentHash::from_bytes([1u8; 32]),
            encryption_key: [2u8; 32],
            leases: vec![lease(1, 100), lease(2, 500)],
        };
        for _ in 0..10 {
            assert_eq!(set.pick(200).unwrap().tunnel_id, 2);
        }
        assert!(set.pick(500).is_none());
    }

    #[test]
    fn test_destination_hash_matches_key() {
        let secret = X25519StaticSecret::random_from_rng(rand::rngs::OsRng);
        let dest = LocalDestination::new(secret);
        assert_eq!(dest.ident, destination_hash(&dest.public));
    }
}

//! Signed peer records
//!
//! A record binds a router identity to its transport addresses and
//! capabilities. The signature covers every other field:
//! - Signing key (32 bytes)
//! - Encryption key (32 bytes)
//! - Capabilities (1 byte)
//! - Published (8 bytes, seconds since epoch)
//! - Address count (1 byte), then each address as text with a 1-byte length

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use veil_crypto::{PublicIdentity, RouterIdentity};
use veil_protocol::types::now_secs;
use veil_protocol::IdentHash;

use crate::error::{NetDbError, Result};

/// Records older than this are dropped from the store (seconds)
pub const PEER_RECORD_EXPIRATION_SECS: u64 = 27 * 3600;

bitflags! {
    /// Declared peer capabilities
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct PeerCaps: u8 {
        /// Accepts inbound connections
        const REACHABLE = 0x01;
        /// Shares generous bandwidth
        const HIGH_BANDWIDTH = 0x02;
        /// Serves the network database
        const FLOODFILL = 0x04;
        /// Does not publish addresses; never a tunnel hop
        const HIDDEN = 0x08;
    }
}

/// Network prefix used for path diversity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkPrefix {
    /// First two octets (/16)
    V4([u8; 2]),
    /// First four octets (/32)
    V6([u8; 4]),
}

impl NetworkPrefix {
    pub fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => {
                let o = v4.octets();
                NetworkPrefix::V4([o[0], o[1]])
            }
            IpAddr::V6(v6) => {
                let o = v6.octets();
                NetworkPrefix::V6([o[0], o[1], o[2], o[3]])
            }
        }
    }
}

/// Signed description of a remote router
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub identity: PublicIdentity,
    pub addresses: Vec<SocketAddr>,
    pub caps: PeerCaps,
    /// Seconds since epoch
    pub published: u64,
    pub signature: Vec<u8>,
}

impl PeerRecord {
    /// Create and sign a record for a local identity
    pub fn new_signed(identity: &RouterIdentity, addresses: Vec<SocketAddr>, caps: PeerCaps) -> Self {
        let mut record = PeerRecord {
            identity: *identity.public(),
            addresses,
            caps,
            published: now_secs(),
            signature: Vec::new(),
        };
        record.signature = identity.sign(&record.signed_bytes()).to_vec();
        record
    }

    pub fn ident_hash(&self) -> IdentHash {
        IdentHash::from_bytes(self.identity.hash())
    }

    /// X25519 key used to encrypt build records and one-shot garlic
    pub fn encryption_key(&self) -> &[u8; 32] {
        &self.identity.encryption_key
    }

    fn signed_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128);
        out.extend_from_slice(&self.identity.signing_key);
        out.extend_from_slice(&self.identity.encryption_key);
        out.push(self.caps.bits());
        out.extend_from_slice(&self.published.to_be_bytes());
        out.push(self.addresses.len().min(u8::MAX as usize) as u8);
        for addr in self.addresses.iter().take(u8::MAX as usize) {
            let text = addr.to_string();
            out.push(text.len() as u8);
            out.extend_from_slice(text.as_bytes());
        }
        out
    }

    /// Check the signature against the embedded identity
    pub fn verify(&self) -> Result<()> {
        self.identity
            .verify(&self.signed_bytes(), &self.signature)
            .map_err(|_| NetDbError::InvalidSignature(self.ident_hash()))
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now.saturating_sub(self.published) > PEER_RECORD_EXPIRATION_SECS
    }

    /// Prefix of the first declared address
    pub fn network_prefix(&self) -> Option<NetworkPrefix> {
        self.addresses.first().map(|a| NetworkPrefix::of(&a.ip()))
    }

    pub fn is_reachable(&self) -> bool {
        self.caps.contains(PeerCaps::REACHABLE) && !self.addresses.is_empty()
    }

    pub fn is_hidden(&self) -> bool {
        self.caps.contains(PeerCaps::HIDDEN)
    }
}

/// Shared handle to an immutable record
pub type SharedRecord = Arc<PeerRecord>;

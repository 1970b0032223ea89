//! Core protocol types

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of an ident hash in bytes
pub const IDENT_HASH_SIZE: usize = 32;

/// Truncated ident hash used to address build records
pub const TRUNCATED_HASH_SIZE: usize = 16;

/// Tunnel identifier as carried on the wire
pub type TunnelId = u32;

/// SHA-256 identifier of a router or destination
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct IdentHash([u8; IDENT_HASH_SIZE]);

impl IdentHash {
    pub fn from_bytes(bytes: [u8; IDENT_HASH_SIZE]) -> Self {
        IdentHash(bytes)
    }

    /// Parse from a slice, which must be exactly 32 bytes
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; IDENT_HASH_SIZE] = bytes.try_into().ok()?;
        Some(IdentHash(arr))
    }

    pub fn as_bytes(&self) -> &[u8; IDENT_HASH_SIZE] {
        &self.0
    }

    /// First 16 bytes, used as the `to_peer` field of build records
    pub fn truncated(&self) -> [u8; TRUNCATED_HASH_SIZE] {
        let mut out = [0u8; TRUNCATED_HASH_SIZE];
        out.copy_from_slice(&self.0[..TRUNCATED_HASH_SIZE]);
        out
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, String> {
        let bytes = hex::decode(s).map_err(|e| e.to_string())?;
        IdentHash::from_slice(&bytes).ok_or_else(|| {
            format!(
                "Invalid IdentHash length: expected {}, got {}",
                IDENT_HASH_SIZE,
                bytes.len()
            )
        })
    }
}

impl fmt::Debug for IdentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentHash({})", self.to_hex())
    }
}

impl fmt::Display for IdentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..12])
    }
}

/// Direction of traffic through a tunnel, relative to its creator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Traffic flows from remote gateway towards us
    Inbound,
    /// Traffic flows from us towards a remote endpoint
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Inbound => write!(f, "inbound"),
            Direction::Outbound => write!(f, "outbound"),
        }
    }
}

/// Random non-zero tunnel id
pub fn random_tunnel_id() -> TunnelId {
    rand::thread_rng().gen_range(1..=u32::MAX)
}

/// Random non-zero message id
pub fn random_msg_id() -> u32 {
    rand::thread_rng().gen_range(1..=u32::MAX)
}

/// Milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Seconds since the Unix epoch
pub fn now_secs() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// Minutes since the Unix epoch, as carried in build requests
pub fn now_minutes() -> u32 {
    (now_secs() / 60) as u32
}

//! Tunnel error types

use thiserror::Error;
use veil_protocol::{IdentHash, TunnelId};

/// Tunnel-specific errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TunnelError {
    #[error("Tunnel build timed out")]
    BuildTimeout,

    #[error("First hop {0} unreachable")]
    TransportUnreachable(IdentHash),

    #[error("Tunnel build rejected by hop {hop} with code {code}")]
    BuildRejected { hop: usize, code: u8 },

    #[error("Insufficient peers: need {needed}, have {available}")]
    InsufficientPeers { needed: usize, available: usize },

    #[error("Unknown tunnel: {0}")]
    UnknownTunnel(TunnelId),

    #[error("Tunnel data checksum mismatch")]
    Checksum,

    #[error("No usable tunnel")]
    NoTunnel,

    #[error("No build record addressed to us")]
    NotForUs,

    #[error("Stale build request")]
    StaleRequest,

    #[error("Invalid tunnel configuration: {0}")]
    InvalidConfig(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] veil_protocol::ProtocolError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] veil_crypto::CryptoError),

    #[error("NetDb error: {0}")]
    NetDb(veil_netdb::NetDbError),

    #[error("Garlic error: {0}")]
    Garlic(#[from] veil_garlic::GarlicError),
}

impl From<veil_netdb::NetDbError> for TunnelError {
    fn from(err: veil_netdb::NetDbError) -> Self {
        match err {
            veil_netdb::NetDbError::InsufficientPeers { needed, available } => {
                TunnelError::InsufficientPeers { needed, available }
            }
            other => TunnelError::NetDb(other),
        }
    }
}

/// Result type for tunnel operations
pub type Result<T> = std::result::Result<T, TunnelError>;

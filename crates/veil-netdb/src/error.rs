//! Network database error types

use thiserror::Error;
use veil_protocol::IdentHash;

/// NetDb-specific errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NetDbError {
    #[error("Peer not found: {0}")]
    NotFound(IdentHash),

    #[error("Insufficient peers for path: need {needed}, have {available}")]
    InsufficientPeers { needed: usize, available: usize },

    #[error("Invalid signature on record for {0}")]
    InvalidSignature(IdentHash),

    #[error("Record expired: {0}")]
    Expired(IdentHash),

    #[error("Record has no addresses: {0}")]
    NoAddress(IdentHash),

    #[error("Crypto error: {0}")]
    Crypto(#[from] veil_crypto::CryptoError),
}

/// Result type for NetDb operations
pub type Result<T> = std::result::Result<T, NetDbError>;

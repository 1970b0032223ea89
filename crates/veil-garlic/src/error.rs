//! Garlic error types

use thiserror::Error;

/// Garlic-specific errors
///
/// Inbound failures never leave the processor; they are logged at debug and
/// the message is dropped.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GarlicError {
    #[error("Decryption failure")]
    DecryptionFailure,

    #[error("Malformed instruction: {0}")]
    MalformedInstruction(String),

    #[error("No session with recipient")]
    NoSession,

    #[error("Protocol error: {0}")]
    Protocol(#[from] veil_protocol::ProtocolError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] veil_crypto::CryptoError),
}

/// Result type for garlic operations
pub type Result<T> = std::result::Result<T, GarlicError>;

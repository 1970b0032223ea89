//! Error types for wire format handling

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProtocolError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Message truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("Invalid message type: {0}")]
    InvalidMessageType(u8),

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Checksum mismatch")]
    ChecksumMismatch,

    #[error("Invalid record count: {0}")]
    InvalidRecordCount(usize),

    #[error("Invalid delivery type: {0}")]
    InvalidDeliveryType(u8),

    #[error("Invalid fragment: {0}")]
    InvalidFragment(String),

    #[error("Message expired")]
    Expired,
}

/// Check that `buf` holds at least `needed` bytes
pub(crate) fn ensure_len(buf: &[u8], needed: usize) -> Result<()> {
    if buf.len() < needed {
        return Err(ProtocolError::Truncated {
            needed,
            available: buf.len(),
        });
    }
    Ok(())
}

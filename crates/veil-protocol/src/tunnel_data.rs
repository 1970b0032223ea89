//! Tunnel data messages
//!
//! A tunnel data message is exactly 1028 bytes:
//! - Tunnel ID (4 bytes)
//! - IV (16 bytes)
//! - Checksum (4 bytes): first 4 bytes of SHA-256(fragments || IV)
//! - Non-zero padding, then a single 0x00 byte
//! - Fragments
//!
//! Everything after the tunnel id is the 1024-byte block transformed by each hop.

use rand::Rng;
use veil_crypto::noise::sha256_parts;

use crate::error::{ensure_len, ProtocolError, Result};
use crate::types::TunnelId;

/// Total tunnel data message size
pub const TUNNEL_DATA_MSG_SIZE: usize = 1028;

/// Encrypted block size (IV + data)
pub const TUNNEL_DATA_ENCRYPTED_SIZE: usize = 1024;

/// IV size
pub const TUNNEL_IV_SIZE: usize = 16;

/// Maximum bytes of fragments per message
pub const TUNNEL_DATA_MAX_PAYLOAD_SIZE: usize = 1003;

const CHECKSUM_OFFSET: usize = TUNNEL_IV_SIZE;
const PADDING_OFFSET: usize = CHECKSUM_OFFSET + 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelDataMessage {
    pub tunnel_id: TunnelId,
    /// IV followed by the (possibly encrypted) data
    pub block: Vec<u8>,
}

impl TunnelDataMessage {
    pub fn new(tunnel_id: TunnelId, block: Vec<u8>) -> Result<Self> {
        if block.len() != TUNNEL_DATA_ENCRYPTED_SIZE {
            return Err(ProtocolError::Truncated {
                needed: TUNNEL_DATA_ENCRYPTED_SIZE,
                available: block.len(),
            });
        }
        Ok(TunnelDataMessage { tunnel_id, block })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(TUNNEL_DATA_MSG_SIZE);
        out.extend_from_slice(&self.tunnel_id.to_be_bytes());
        out.extend_from_slice(&self.block);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ensure_len(bytes, TUNNEL_DATA_MSG_SIZE)?;
        let tunnel_id = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        Ok(TunnelDataMessage {
            tunnel_id,
            block: bytes[4..TUNNEL_DATA_MSG_SIZE].to_vec(),
        })
    }
}

/// Build a cleartext block around `fragments` with a fresh random IV
pub fn build_block(fragments: &[u8]) -> Result<Vec<u8>> {
    if fragments.is_empty() || fragments.len() > TUNNEL_DATA_MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: fragments.len(),
            max: TUNNEL_DATA_MAX_PAYLOAD_SIZE,
        });
    }

    let mut rng = rand::thread_rng();
    let mut block = vec![0u8; TUNNEL_DATA_ENCRYPTED_SIZE];
    rng.fill(&mut block[..TUNNEL_IV_SIZE]);

    let payload_offset = TUNNEL_DATA_ENCRYPTED_SIZE - fragments.len();
    block[payload_offset..].copy_from_slice(fragments);

    let checksum = sha256_parts(&[fragments, &block[..TUNNEL_IV_SIZE]]);
    block[CHECKSUM_OFFSET..PADDING_OFFSET].copy_from_slice(&checksum[..4]);

    let zero_offset = payload_offset - 1;
    for byte in &mut block[PADDING_OFFSET..zero_offset] {
        *byte = rng.gen_range(1..=u8::MAX);
    }
    block[zero_offset] = 0;

    Ok(block)
}

/// Verify a decrypted block and return its fragment bytes
pub fn parse_block(block: &[u8]) -> Result<&[u8]> {
    ensure_len(block, TUNNEL_DATA_ENCRYPTED_SIZE)?;
    let block = &block[..TUNNEL_DATA_ENCRYPTED_SIZE];

    let zero = block[PADDING_OFFSET..]
        .iter()
        .position(|b| *b == 0)
        .map(|p| p + PADDING_OFFSET)
        .ok_or_else(|| ProtocolError::InvalidFragment("no zero delimiter".to_string()))?;

    let fragments = &block[zero + 1..];
    let checksum = sha256_parts(&[fragments, &block[..TUNNEL_IV_SIZE]]);
    if checksum[..4] != block[CHECKSUM_OFFSET..PADDING_OFFSET] {
        return Err(ProtocolError::ChecksumMismatch);
    }

    Ok(fragments)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_roundtrip() {
        let fragments = vec![0x42u8; 500];
        let block = build_block(&fragments).unwrap();
        assert_eq!(block.len(), TUNNEL_DATA_ENCRYPTED_SIZE);
        assert_eq!(parse_block(&block).unwrap(), &fragments[..]);
    }

    #[test]
    fn test_full_payload_has_no_padding() {
        let fragments = vec![0x01u8; TUNNEL_DATA_MAX_PAYLOAD_SIZE];
        let block = build_block(&fragments).unwrap();
        assert_eq!(block[PADDING_OFFSET], 0);
        assert_eq!(parse_block(&block).unwrap().len(), TUNNEL_DATA_MAX_PAYLOAD_SIZE);
    }

    #[test]
    fn test_oversized_payload_rejected() {
        assert!(build_block(&vec![1u8; TUNNEL_DATA_MAX_PAYLOAD_SIZE + 1]).is_err());
        assert!(build_block(&[]).is_err());
    }

    #[test]
    fn test_corrupted_block_fails_checksum() {
        let mut block = build_block(&[7u8; 100]).unwrap();
        let last = block.len() - 1;
        block[last] ^= 0xff;
        assert_eq!(parse_block(&block).unwrap_err(), ProtocolError::ChecksumMismatch);
    }

    #[test]
    fn test_message_framing() {
        let block = build_block(&[1u8; 10]).unwrap();
        let msg = TunnelDataMessage::new(99, block).unwrap();
        let bytes = msg.to_bytes();
        assert_eq!(bytes.len(), TUNNEL_DATA_MSG_SIZE);
        assert_eq!(TunnelDataMessage::from_bytes(&bytes).unwrap(), msg);
    }
}

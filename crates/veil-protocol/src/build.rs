//! Short tunnel build records
//!
//! A ShortTunnelBuild message is a one-byte record count followed by
//! 218-byte records. Each request record is:
//! - To peer (16 bytes): truncated ident hash of the hop
//! - Ephemeral key (32 bytes)
//! - Encrypted cleartext (154 bytes) + Poly1305 tag (16 bytes)
//!
//! Cleartext layout (154 bytes):
//! - Receive tunnel ID (4), next tunnel ID (4), next ident (32)
//! - Flags (1), more flags (2), layer encryption type (1)
//! - Request time in minutes since epoch (4), expiration in seconds (4)
//! - Send message ID (4), zero padding
//!
//! A response record is 202 bytes of cleartext (options then return code
//! at offset 201) encrypted in place with a 16-byte tag.

use bitflags::bitflags;

use crate::error::{ensure_len, ProtocolError, Result};
use crate::types::{IdentHash, TunnelId, IDENT_HASH_SIZE, TRUNCATED_HASH_SIZE};

/// Size of one short build record
pub const SHORT_TUNNEL_BUILD_RECORD_SIZE: usize = 218;

/// Offset of the encrypted part within a request record
pub const SHORT_REQUEST_RECORD_ENCRYPTED_OFFSET: usize = TRUNCATED_HASH_SIZE;

/// Request cleartext size
pub const SHORT_REQUEST_RECORD_CLEAR_TEXT_SIZE: usize = 154;

/// Response cleartext size (record minus tag)
pub const SHORT_RESPONSE_RECORD_CLEAR_TEXT_SIZE: usize = SHORT_TUNNEL_BUILD_RECORD_SIZE - 16;

/// Offset of the return code within a response cleartext
pub const SHORT_RESPONSE_RECORD_RET_OFFSET: usize = 201;

/// Requested tunnel lifetime carried in every request (seconds)
pub const REQUEST_EXPIRATION_SECS: u32 = 600;

/// Records per build message when the path is short
pub const STANDARD_NUM_RECORDS: usize = 4;

/// Maximum records per build message
pub const MAX_NUM_RECORDS: usize = 8;

const RECEIVE_TUNNEL_OFFSET: usize = 0;
const NEXT_TUNNEL_OFFSET: usize = RECEIVE_TUNNEL_OFFSET + 4;
const NEXT_IDENT_OFFSET: usize = NEXT_TUNNEL_OFFSET + 4;
const FLAG_OFFSET: usize = NEXT_IDENT_OFFSET + IDENT_HASH_SIZE;
const MORE_FLAGS_OFFSET: usize = FLAG_OFFSET + 1;
const LAYER_ENCRYPTION_TYPE_OFFSET: usize = MORE_FLAGS_OFFSET + 2;
const REQUEST_TIME_OFFSET: usize = LAYER_ENCRYPTION_TYPE_OFFSET + 1;
const REQUEST_EXPIRATION_OFFSET: usize = REQUEST_TIME_OFFSET + 4;
const SEND_MSG_ID_OFFSET: usize = REQUEST_EXPIRATION_OFFSET + 4;
const PADDING_OFFSET: usize = SEND_MSG_ID_OFFSET + 4;

bitflags! {
    /// Hop role flags in a build request
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HopFlags: u8 {
        /// Hop is the inbound gateway
        const GATEWAY = 0x80;
        /// Hop is the outbound endpoint
        const ENDPOINT = 0x40;
    }
}

/// Return codes carried in response records
pub mod return_code {
    pub const ACCEPT: u8 = 0;
    pub const REJECT_PROBABALISTIC: u8 = 10;
    pub const REJECT_TRANSIENT_OVERLOAD: u8 = 20;
    pub const REJECT_BANDWIDTH: u8 = 30;
    pub const REJECT_CRIT: u8 = 50;
}

/// Decoded request cleartext
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequestRecord {
    pub receive_tunnel: TunnelId,
    pub next_tunnel: TunnelId,
    pub next_ident: IdentHash,
    pub flags: HopFlags,
    /// 0 = AES
    pub layer_encryption_type: u8,
    pub request_time_minutes: u32,
    pub request_expiration: u32,
    pub send_msg_id: u32,
}

impl BuildRequestRecord {
    pub fn to_bytes(&self) -> [u8; SHORT_REQUEST_RECORD_CLEAR_TEXT_SIZE] {
        let mut out = [0u8; SHORT_REQUEST_RECORD_CLEAR_TEXT_SIZE];
        out[RECEIVE_TUNNEL_OFFSET..NEXT_TUNNEL_OFFSET]
            .copy_from_slice(&self.receive_tunnel.to_be_bytes());
        out[NEXT_TUNNEL_OFFSET..NEXT_IDENT_OFFSET].copy_from_slice(&self.next_tunnel.to_be_bytes());
        out[NEXT_IDENT_OFFSET..FLAG_OFFSET].copy_from_slice(self.next_ident.as_bytes());
        out[FLAG_OFFSET] = self.flags.bits();
        // more flags stay zero
        out[LAYER_ENCRYPTION_TYPE_OFFSET] = self.layer_encryption_type;
        out[REQUEST_TIME_OFFSET..REQUEST_EXPIRATION_OFFSET]
            .copy_from_slice(&self.request_time_minutes.to_be_bytes());
        out[REQUEST_EXPIRATION_OFFSET..SEND_MSG_ID_OFFSET]
            .copy_from_slice(&self.request_expiration.to_be_bytes());
        out[SEND_MSG_ID_OFFSET..PADDING_OFFSET].copy_from_slice(&self.send_msg_id.to_be_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ensure_len(bytes, SHORT_REQUEST_RECORD_CLEAR_TEXT_SIZE)?;
        let be32 = |offset: usize| {
            u32::from_be_bytes([
                bytes[offset],
                bytes[offset + 1],
                bytes[offset + 2],
                bytes[offset + 3],
            ])
        };

        let next_ident = IdentHash::from_slice(&bytes[NEXT_IDENT_OFFSET..FLAG_OFFSET])
            .ok_or(ProtocolError::Truncated {
                needed: IDENT_HASH_SIZE,
                available: 0,
            })?;

        Ok(BuildRequestRecord {
            receive_tunnel: be32(RECEIVE_TUNNEL_OFFSET),
            next_tunnel: be32(NEXT_TUNNEL_OFFSET),
            next_ident,
            flags: HopFlags::from_bits_truncate(bytes[FLAG_OFFSET]),
            layer_encryption_type: bytes[LAYER_ENCRYPTION_TYPE_OFFSET],
            request_time_minutes: be32(REQUEST_TIME_OFFSET),
            request_expiration: be32(REQUEST_EXPIRATION_OFFSET),
            send_msg_id: be32(SEND_MSG_ID_OFFSET),
        })
    }

    pub fn is_gateway(&self) -> bool {
        self.flags.contains(HopFlags::GATEWAY)
    }

    pub fn is_endpoint(&self) -> bool {
        self.flags.contains(HopFlags::ENDPOINT)
    }
}

/// Response cleartext with the given return code
pub fn response_cleartext(code: u8) -> [u8; SHORT_RESPONSE_RECORD_CLEAR_TEXT_SIZE] {
    let mut out = [0u8; SHORT_RESPONSE_RECORD_CLEAR_TEXT_SIZE];
    out[SHORT_RESPONSE_RECORD_RET_OFFSET] = code;
    out
}

/// One 218-byte build record slot
pub type BuildRecord = [u8; SHORT_TUNNEL_BUILD_RECORD_SIZE];

/// Payload of ShortTunnelBuild and ShortTunnelBuildReply messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShortTunnelBuild {
    pub records: Vec<BuildRecord>,
}

impl ShortTunnelBuild {
    pub fn new(records: Vec<BuildRecord>) -> Result<Self> {
        if records.is_empty() || records.len() > MAX_NUM_RECORDS {
            return Err(ProtocolError::InvalidRecordCount(records.len()));
        }
        Ok(ShortTunnelBuild { records })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.records.len() * SHORT_TUNNEL_BUILD_RECORD_SIZE);
        out.push(self.records.len() as u8);
        for record in &self.records {
            out.extend_from_slice(record);
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ensure_len(bytes, 1)?;
        let count = bytes[0] as usize;
        if count == 0 || count > MAX_NUM_RECORDS {
            return Err(ProtocolError::InvalidRecordCount(count));
        }
        ensure_len(bytes, 1 + count * SHORT_TUNNEL_BUILD_RECORD_SIZE)?;

        let records = bytes[1..1 + count * SHORT_TUNNEL_BUILD_RECORD_SIZE]
            .chunks_exact(SHORT_TUNNEL_BUILD_RECORD_SIZE)
            .map(|chunk| {
                let mut record = [0u8; SHORT_TUNNEL_BUILD_RECORD_SIZE];
                record.copy_from_slice(chunk);
                record
            })
            .collect();
        Ok(ShortTunnelBuild { records })
    }

    /// Index of the record addressed to `ident`, if any
    pub fn find_record(&self, ident: &IdentHash) -> Option<usize> {
        let truncated = ident.truncated();
        self.records
            .iter()
            .position(|r| r[..TRUNCATED_HASH_SIZE] == truncated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> BuildRequestRecord {
        BuildRequestRecord {
            receive_tunnel: 11,
            next_tunnel: 22,
            next_ident: IdentHash::from_bytes([4u8; IDENT_HASH_SIZE]),
            flags: HopFlags::ENDPOINT,
            layer_encryption_type: 0,
            request_time_minutes: 29_000_000,
            request_expiration: REQUEST_EXPIRATION_SECS,
            send_msg_id: 0xdeadbeef,
        }
    }

    #[test]
    fn test_request_offsets() {
        let bytes = sample_record().to_bytes();
        assert_eq!(&bytes[0..4], &11u32.to_be_bytes());
        assert_eq!(&bytes[4..8], &22u32.to_be_bytes());
        assert_eq!(bytes[40], 0x40);
        assert_eq!(&bytes[41..43], &[0, 0]);
        assert_eq!(bytes[43], 0);
        assert_eq!(&bytes[48..52], &600u32.to_be_bytes());
        assert_eq!(&bytes[52..56], &0xdeadbeefu32.to_be_bytes());
        assert!(bytes[56..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_request_decode() {
        let record = sample_record();
        let decoded = BuildRequestRecord::from_bytes(&record.to_bytes()).unwrap();
        assert_eq!(decoded, record);
        assert!(decoded.is_endpoint());
        assert!(!decoded.is_gateway());
    }

    #[test]
    fn test_response_return_code_offset() {
        let response = response_cleartext(return_code::REJECT_BANDWIDTH);
        assert_eq!(response.len(), 202);
        assert_eq!(response[201], 30);
    }

    #[test]
    fn test_build_message_layout() {
        let mut records = vec![[0u8; SHORT_TUNNEL_BUILD_RECORD_SIZE]; STANDARD_NUM_RECORDS];
        let target = IdentHash::from_bytes([9u8; IDENT_HASH_SIZE]);
        records[2][..TRUNCATED_HASH_SIZE].copy_from_slice(&target.truncated());

        let msg = ShortTunnelBuild::new(records).unwrap();
        let bytes = msg.to_bytes();
        assert_eq!(bytes[0], 4);
        assert_eq!(bytes.len(), 1 + 4 * 218);

        let parsed = ShortTunnelBuild::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.find_record(&target), Some(2));
    }

    #[test]
    fn test_record_count_bounds() {
        assert!(ShortTunnelBuild::new(vec![]).is_err());
        assert!(ShortTunnelBuild::new(vec![[0u8; SHORT_TUNNEL_BUILD_RECORD_SIZE]; 9]).is_err());
        assert!(ShortTunnelBuild::from_bytes(&[2, 0, 0]).is_err());
    }
}

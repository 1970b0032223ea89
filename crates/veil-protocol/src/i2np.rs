//! I2NP message framing
//!
//! Header layout (16 bytes):
//! - Type (1 byte)
//! - Message ID (4 bytes, big-endian)
//! - Expiration (8 bytes, milliseconds since epoch, big-endian)
//! - Payload size (2 bytes, big-endian)
//! - Checksum (1 byte): first byte of SHA-256 over the payload

use serde::{Deserialize, Serialize};
use veil_crypto::sha256;

use crate::error::{ensure_len, ProtocolError, Result};
use crate::types::{now_millis, random_msg_id, TunnelId};

/// Full header size
pub const I2NP_HEADER_SIZE: usize = 16;

/// Maximum payload carried by one message
pub const I2NP_MAX_MESSAGE_SIZE: usize = 62708;

/// Default lifetime of a freshly created message (ms)
pub const I2NP_MESSAGE_EXPIRATION_TIMEOUT: u64 = 8000;

/// TunnelGateway header: tunnel id (4) + length (2)
pub const TUNNEL_GATEWAY_HEADER_SIZE: usize = 6;

/// DeliveryStatus payload: message id (4) + timestamp (8)
pub const DELIVERY_STATUS_SIZE: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum I2npMessageType {
    DeliveryStatus,
    Garlic,
    TunnelData,
    TunnelGateway,
    Data,
    ShortTunnelBuild,
    ShortTunnelBuildReply,
}

impl I2npMessageType {
    pub fn to_u8(self) -> u8 {
        match self {
            I2npMessageType::DeliveryStatus => 10,
            I2npMessageType::Garlic => 11,
            I2npMessageType::TunnelData => 18,
            I2npMessageType::TunnelGateway => 19,
            I2npMessageType::Data => 20,
            I2npMessageType::ShortTunnelBuild => 25,
            I2npMessageType::ShortTunnelBuildReply => 26,
        }
    }

    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            10 => Ok(I2npMessageType::DeliveryStatus),
            11 => Ok(I2npMessageType::Garlic),
            18 => Ok(I2npMessageType::TunnelData),
            19 => Ok(I2npMessageType::TunnelGateway),
            20 => Ok(I2npMessageType::Data),
            25 => Ok(I2npMessageType::ShortTunnelBuild),
            26 => Ok(I2npMessageType::ShortTunnelBuildReply),
            other => Err(ProtocolError::InvalidMessageType(other)),
        }
    }
}

/// An I2NP message with its header fields decoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct I2npMessage {
    pub msg_type: I2npMessageType,
    pub msg_id: u32,
    /// Milliseconds since epoch
    pub expiration: u64,
    pub payload: Vec<u8>,
}

impl I2npMessage {
    /// New message with a random id and the default expiration
    pub fn new(msg_type: I2npMessageType, payload: Vec<u8>) -> Self {
        Self::with_id(msg_type, random_msg_id(), payload)
    }

    pub fn with_id(msg_type: I2npMessageType, msg_id: u32, payload: Vec<u8>) -> Self {
        I2npMessage {
            msg_type,
            msg_id,
            expiration: now_millis() + I2NP_MESSAGE_EXPIRATION_TIMEOUT,
            payload,
        }
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms > self.expiration
    }

    /// Serialized length including header
    pub fn len(&self) -> usize {
        I2NP_HEADER_SIZE + self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        if self.payload.len() > I2NP_MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: self.payload.len(),
                max: I2NP_MAX_MESSAGE_SIZE,
            });
        }

        let mut bytes = Vec::with_capacity(self.len());
        bytes.push(self.msg_type.to_u8());
        bytes.extend_from_slice(&self.msg_id.to_be_bytes());
        bytes.extend_from_slice(&self.expiration.to_be_bytes());
        bytes.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        bytes.push(sha256(&self.payload)[0]);
        bytes.extend_from_slice(&self.payload);
        Ok(bytes)
    }

    /// Parse one message from the start of `bytes`, returning it and the bytes consumed
    pub fn from_bytes(bytes: &[u8]) -> Result<(Self, usize)> {
        ensure_len(bytes, I2NP_HEADER_SIZE)?;

        let msg_type = I2npMessageType::from_u8(bytes[0])?;
        let msg_id = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        let mut expiration = [0u8; 8];
        expiration.copy_from_slice(&bytes[5..13]);
        let expiration = u64::from_be_bytes(expiration);
        let size = u16::from_be_bytes([bytes[13], bytes[14]]) as usize;
        let checksum = bytes[15];

        ensure_len(bytes, I2NP_HEADER_SIZE + size)?;
        let payload = &bytes[I2NP_HEADER_SIZE..I2NP_HEADER_SIZE + size];
        if sha256(payload)[0] != checksum {
            return Err(ProtocolError::ChecksumMismatch);
        }

        Ok((
            I2npMessage {
                msg_type,
                msg_id,
                expiration,
                payload: payload.to_vec(),
            },
            I2NP_HEADER_SIZE + size,
        ))
    }

    /// DeliveryStatus carrying the acknowledged message id and a timestamp
    pub fn delivery_status(acked_msg_id: u32) -> Self {
        let mut payload = Vec::with_capacity(DELIVERY_STATUS_SIZE);
        payload.extend_from_slice(&acked_msg_id.to_be_bytes());
        payload.extend_from_slice(&now_millis().to_be_bytes());
        Self::new(I2npMessageType::DeliveryStatus, payload)
    }

    /// Acknowledged message id of a DeliveryStatus message
    pub fn parse_delivery_status(&self) -> Result<u32> {
        ensure_len(&self.payload, DELIVERY_STATUS_SIZE)?;
        let p = &self.payload;
        Ok(u32::from_be_bytes([p[0], p[1], p[2], p[3]]))
    }

    /// Wrap `inner` for injection at the gateway of tunnel `tunnel_id`
    pub fn tunnel_gateway(tunnel_id: TunnelId, inner: &I2npMessage) -> Result<Self> {
        let inner_bytes = inner.to_bytes()?;
        let mut payload = Vec::with_capacity(TUNNEL_GATEWAY_HEADER_SIZE + inner_bytes.len());
        payload.extend_from_slice(&tunnel_id.to_be_bytes());
        payload.extend_from_slice(&(inner_bytes.len() as u16).to_be_bytes());
        payload.extend_from_slice(&inner_bytes);
        Ok(Self::new(I2npMessageType::TunnelGateway, payload))
    }

    /// Split a TunnelGateway message into tunnel id and the inner message
    pub fn parse_tunnel_gateway(&self) -> Result<(TunnelId, I2npMessage)> {
        ensure_len(&self.payload, TUNNEL_GATEWAY_HEADER_SIZE)?;
        let p = &self.payload;
        let tunnel_id = u32::from_be_bytes([p[0], p[1], p[2], p[3]]);
        let len = u16::from_be_bytes([p[4], p[5]]) as usize;
        ensure_len(p, TUNNEL_GATEWAY_HEADER_SIZE + len)?;
        let (inner, _) =
            I2npMessage::from_bytes(&p[TUNNEL_GATEWAY_HEADER_SIZE..TUNNEL_GATEWAY_HEADER_SIZE + len])?;
        Ok((tunnel_id, inner))
    }
}

//! Garlic cloves
//!
//! Clove layout inside a GarlicClove block:
//! - Flag (1 byte): delivery type in bits 5-6
//! - Hash (32 bytes, destination/router/tunnel delivery)
//! - Tunnel ID (4 bytes, tunnel delivery only)
//! - I2NP type (1 byte)
//! - Message ID (4 bytes)
//! - Expiration (4 bytes, seconds since epoch)
//! - Payload (rest of the block)

use veil_protocol::{I2npMessage, I2npMessageType, IdentHash, TunnelId};

use crate::error::{GarlicError, Result};

const HASH_SIZE: usize = 32;
const SHORT_I2NP_HEADER_SIZE: usize = 9;

/// Where a clove should go once unwrapped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloveDelivery {
    /// Handle on the router that unwrapped it
    Local,
    /// Deliver to a local destination
    Destination(IdentHash),
    /// Send directly to a router
    Router(IdentHash),
    /// Inject into a tunnel at its gateway
    Tunnel {
        gateway: IdentHash,
        tunnel_id: TunnelId,
    },
}

impl CloveDelivery {
    fn type_bits(&self) -> u8 {
        match self {
            CloveDelivery::Local => 0,
            CloveDelivery::Destination(_) => 1,
            CloveDelivery::Router(_) => 2,
            CloveDelivery::Tunnel { .. } => 3,
        }
    }
}

/// One message plus its delivery instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Clove {
    pub delivery: CloveDelivery,
    pub message: I2npMessage,
}

impl Clove {
    pub fn new(delivery: CloveDelivery, message: I2npMessage) -> Self {
        Clove { delivery, message }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.delivery.type_bits() << 5);
        match &self.delivery {
            CloveDelivery::Local => {}
            CloveDelivery::Destination(hash) | CloveDelivery::Router(hash) => {
                out.extend_from_slice(hash.as_bytes());
            }
            CloveDelivery::Tunnel { gateway, tunnel_id } => {
                out.extend_from_slice(gateway.as_bytes());
                out.extend_from_slice(&tunnel_id.to_be_bytes());
            }
        }
        out.push(self.message.msg_type.to_u8());
        out.extend_from_slice(&self.message.msg_id.to_be_bytes());
        out.extend_from_slice(&((self.message.expiration / 1000) as u32).to_be_bytes());
        out.extend_from_slice(&self.message.payload);
    }

    pub fn encoded_len(&self) -> usize {
        let delivery = match self.delivery {
            CloveDelivery::Local => 0,
            CloveDelivery::Destination(_) | CloveDelivery::Router(_) => HASH_SIZE,
            CloveDelivery::Tunnel { .. } => HASH_SIZE + 4,
        };
        1 + delivery + SHORT_I2NP_HEADER_SIZE + self.message.payload.len()
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let flag = *buf
            .first()
            .ok_or_else(|| GarlicError::MalformedInstruction("empty clove".to_string()))?;
        let mut offset = 1;

        let delivery = match (flag >> 5) & 0x03 {
            0 => CloveDelivery::Local,
            1 => {
                let hash = read_hash(buf, offset)?;
                offset += HASH_SIZE;
                CloveDelivery::Destination(hash)
            }
            2 => {
                let hash = read_hash(buf, offset)?;
                offset += HASH_SIZE;
                CloveDelivery::Router(hash)
            }
            _ => {
                let gateway = read_hash(buf, offset)?;
                offset += HASH_SIZE;
                let tunnel_id = read_u32(buf, offset)?;
                offset += 4;
                CloveDelivery::Tunnel { gateway, tunnel_id }
            }
        };

        if buf.len() < offset + SHORT_I2NP_HEADER_SIZE {
            return Err(GarlicError::MalformedInstruction(
                "clove too short for message header".to_string(),
            ));
        }
        let msg_type = I2npMessageType::from_u8(buf[offset])
            .map_err(|e| GarlicError::MalformedInstruction(e.to_string()))?;
        let msg_id = read_u32(buf, offset + 1)?;
        let expiration = read_u32(buf, offset + 5)? as u64 * 1000;
        offset += SHORT_I2NP_HEADER_SIZE;

        Ok(Clove {
            delivery,
            message: I2npMessage {
                msg_type,
                msg_id,
                expiration,
                payload: buf[offset..].to_vec(),
            },
        })
    }
}

fn read_hash(buf: &[u8], offset: usize) -> Result<IdentHash> {
    buf.get(offset..offset + HASH_SIZE)
        .and_then(IdentHash::from_slice)
        .ok_or_else(|| GarlicError::MalformedInstruction("truncated hash".to_string()))
}

fn read_u32(buf: &[u8], offset: usize) -> Result<u32> {
    let bytes: [u8; 4] = buf
        .get(offset..offset + 4)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| GarlicError::MalformedInstruction("truncated field".to_string()))?;
    Ok(u32::from_be_bytes(bytes))
}

//! Tunnel message delivery instructions and fragment headers
//!
//! First fragment:
//! - Flag (1 byte): delivery type in bits 5-6, `0x08` if fragmented
//! - Tunnel ID (4 bytes, tunnel delivery only)
//! - Hash (32 bytes, tunnel and router delivery)
//! - Message ID (4 bytes, fragmented only)
//! - Size (2 bytes)
//!
//! Follow-on fragment:
//! - Flag (1 byte): `0x80 | fragment_number << 1 | last`
//! - Message ID (4 bytes)
//! - Size (2 bytes)

use crate::error::{ensure_len, ProtocolError, Result};
use crate::types::{IdentHash, TunnelId, IDENT_HASH_SIZE};

const FOLLOW_ON_FLAG: u8 = 0x80;
const FRAGMENTED_FLAG: u8 = 0x08;
const LAST_FRAGMENT_FLAG: u8 = 0x01;

/// Follow-on fragment header size
pub const FOLLOW_ON_HEADER_SIZE: usize = 7;

/// Highest fragment number a follow-on fragment may carry
pub const MAX_FRAGMENT_NUMBER: u8 = 63;

/// Where the tunnel endpoint should deliver a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TunnelDelivery {
    /// Deliver to the endpoint router itself
    Local,
    /// Inject into `tunnel_id` at gateway `gateway`
    Tunnel {
        gateway: IdentHash,
        tunnel_id: TunnelId,
    },
    /// Send directly to a router
    Router(IdentHash),
}

impl TunnelDelivery {
    fn type_bits(&self) -> u8 {
        match self {
            TunnelDelivery::Local => 0,
            TunnelDelivery::Tunnel { .. } => 1,
            TunnelDelivery::Router(_) => 2,
        }
    }

    /// Header length of a first fragment with these instructions
    pub fn header_len(&self, fragmented: bool) -> usize {
        let mut len = 1 + 2;
        match self {
            TunnelDelivery::Local => {}
            TunnelDelivery::Tunnel { .. } => len += 4 + IDENT_HASH_SIZE,
            TunnelDelivery::Router(_) => len += IDENT_HASH_SIZE,
        }
        if fragmented {
            len += 4;
        }
        len
    }
}

/// Parsed fragment header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentHeader {
    First {
        delivery: TunnelDelivery,
        /// Present when the message continues in follow-on fragments
        msg_id: Option<u32>,
        size: u16,
    },
    FollowOn {
        msg_id: u32,
        fragment_number: u8,
        is_last: bool,
        size: u16,
    },
}

impl FragmentHeader {
    pub fn size(&self) -> usize {
        match self {
            FragmentHeader::First { size, .. } | FragmentHeader::FollowOn { size, .. } => {
                *size as usize
            }
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        match self {
            FragmentHeader::First {
                delivery,
                msg_id,
                size,
            } => {
                let mut flag = delivery.type_bits() << 5;
                if msg_id.is_some() {
                    flag |= FRAGMENTED_FLAG;
                }
                out.push(flag);
                match delivery {
                    TunnelDelivery::Local => {}
                    TunnelDelivery::Tunnel { gateway, tunnel_id } => {
                        out.extend_from_slice(&tunnel_id.to_be_bytes());
                        out.extend_from_slice(gateway.as_bytes());
                    }
                    TunnelDelivery::Router(hash) => out.extend_from_slice(hash.as_bytes()),
                }
                if let Some(id) = msg_id {
                    out.extend_from_slice(&id.to_be_bytes());
                }
                out.extend_from_slice(&size.to_be_bytes());
            }
            FragmentHeader::FollowOn {
                msg_id,
                fragment_number,
                is_last,
                size,
            } => {
                if *fragment_number == 0 || *fragment_number > MAX_FRAGMENT_NUMBER {
                    return Err(ProtocolError::InvalidFragment(format!(
                        "fragment number {} out of range",
                        fragment_number
                    )));
                }
                let mut flag = FOLLOW_ON_FLAG | (fragment_number << 1);
                if *is_last {
                    flag |= LAST_FRAGMENT_FLAG;
                }
                out.push(flag);
                out.extend_from_slice(&msg_id.to_be_bytes());
                out.extend_from_slice(&size.to_be_bytes());
            }
        }
        Ok(())
    }

    /// Parse a header from the start of `buf`, returning it and its length
    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        ensure_len(buf, 1)?;
        let flag = buf[0];
        let mut offset = 1;

        if flag & FOLLOW_ON_FLAG != 0 {
            ensure_len(buf, FOLLOW_ON_HEADER_SIZE)?;
            let msg_id = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
            let size = u16::from_be_bytes([buf[5], buf[6]]);
            let fragment_number = (flag >> 1) & 0x3f;
            if fragment_number == 0 {
                return Err(ProtocolError::InvalidFragment(
                    "follow-on fragment number 0".to_string(),
                ));
            }
            return Ok((
                FragmentHeader::FollowOn {
                    msg_id,
                    fragment_number,
                    is_last: flag & LAST_FRAGMENT_FLAG != 0,
                    size,
                },
                FOLLOW_ON_HEADER_SIZE,
            ));
        }

        let delivery = match (flag >> 5) & 0x03 {
            0 => TunnelDelivery::Local,
            1 => {
                ensure_len(buf, offset + 4 + IDENT_HASH_SIZE)?;
                let tunnel_id = u32::from_be_bytes([
                    buf[offset],
                    buf[offset + 1],
                    buf[offset + 2],
                    buf[offset + 3],
                ]);
                offset += 4;
                let gateway = read_hash(buf, offset)?;
                offset += IDENT_HASH_SIZE;
                TunnelDelivery::Tunnel { gateway, tunnel_id }
            }
            2 => {
                let hash = read_hash(buf, offset)?;
                offset += IDENT_HASH_SIZE;
                TunnelDelivery::Router(hash)
            }
            other => return Err(ProtocolError::InvalidDeliveryType(other)),
        };

        let msg_id = if flag & FRAGMENTED_FLAG != 0 {
            ensure_len(buf, offset + 4)?;
            let id = u32::from_be_bytes([
                buf[offset],
                buf[offset + 1],
                buf[offset + 2],
                buf[offset + 3],
            ]);
            offset += 4;
            Some(id)
        } else {
            None
        };

        ensure_len(buf, offset + 2)?;
        let size = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
        offset += 2;

        Ok((
            FragmentHeader::First {
                delivery,
                msg_id,
                size,
            },
            offset,
        ))
    }
}

fn read_hash(buf: &[u8], offset: usize) -> Result<IdentHash> {
    ensure_len(buf, offset + IDENT_HASH_SIZE)?;
    IdentHash::from_slice(&buf[offset..offset + IDENT_HASH_SIZE]).ok_or(ProtocolError::Truncated {
        needed: offset + IDENT_HASH_SIZE,
        available: buf.len(),
    })
}

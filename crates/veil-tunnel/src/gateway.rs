//! Tunnel gateway fragmentation
//!
//! Packs I2NP messages with their delivery instructions into cleartext
//! tunnel blocks. A message that does not fit in the space left is moved to
//! a fresh block when it would fit there whole, and fragmented otherwise.

use veil_protocol::delivery::{FOLLOW_ON_HEADER_SIZE, MAX_FRAGMENT_NUMBER};
use veil_protocol::tunnel_data::{build_block, TUNNEL_DATA_MAX_PAYLOAD_SIZE};
use veil_protocol::{FragmentHeader, I2npMessage, ProtocolError, TunnelDelivery};

use crate::error::Result;

/// Smallest fragment worth starting in the space left in a block
const MIN_FRAGMENT_SIZE: usize = 16;

struct BlockWriter {
    blocks: Vec<Vec<u8>>,
    current: Vec<u8>,
}

impl BlockWriter {
    fn new() -> Self {
        BlockWriter {
            blocks: Vec::new(),
            current: Vec::with_capacity(TUNNEL_DATA_MAX_PAYLOAD_SIZE),
        }
    }

    fn room(&self) -> usize {
        TUNNEL_DATA_MAX_PAYLOAD_SIZE - self.current.len()
    }

    fn flush(&mut self) -> Result<()> {
        if !self.current.is_empty() {
            self.blocks.push(build_block(&self.current)?);
            self.current.clear();
        }
        Ok(())
    }

    fn push(&mut self, header: FragmentHeader, data: &[u8]) -> Result<()> {
        header.encode(&mut self.current)?;
        self.current.extend_from_slice(data);
        Ok(())
    }
}

/// Split messages into cleartext 1024-byte tunnel blocks, in order
pub fn fragment_messages(messages: &[(TunnelDelivery, I2npMessage)]) -> Result<Vec<Vec<u8>>> {
    let mut writer = BlockWriter::new();

    for (delivery, message) in messages {
        let bytes = message.to_bytes()?;
        let whole = delivery.header_len(false) + bytes.len();

        if whole > writer.room() && whole <= TUNNEL_DATA_MAX_PAYLOAD_SIZE {
            writer.flush()?;
        }
        if whole <= writer.room() {
            let header = FragmentHeader::First {
                delivery: *delivery,
                msg_id: None,
                size: bytes.len() as u16,
            };
            writer.push(header, &bytes)?;
            continue;
        }

        let first_header = delivery.header_len(true);
        if writer.room() < first_header + MIN_FRAGMENT_SIZE {
            writer.flush()?;
        }
        let chunk = (writer.room() - first_header).min(bytes.len());
        let header = FragmentHeader::First {
            delivery: *delivery,
            msg_id: Some(message.msg_id),
            size: chunk as u16,
        };
        writer.push(header, &bytes[..chunk])?;

        let mut offset = chunk;
        let mut fragment_number = 1u8;
        while offset < bytes.len() {
            if fragment_number > MAX_FRAGMENT_NUMBER {
                return Err(ProtocolError::MessageTooLarge {
                    size: bytes.len(),
                    max: offset,
                }
                .into());
            }
            if writer.room() < FOLLOW_ON_HEADER_SIZE + MIN_FRAGMENT_SIZE {
                writer.flush()?;
            }
            let chunk = (writer.room() - FOLLOW_ON_HEADER_SIZE).min(bytes.len() - offset);
            let header = FragmentHeader::FollowOn {
                msg_id: message.msg_id,
                fragment_number,
                is_last: offset + chunk == bytes.len(),
                size: chunk as u16,
            };
            writer.push(header, &bytes[offset..offset + chunk])?;
            offset += chunk;
            fragment_number += 1;
        }
    }

    writer.flush()?;
    Ok(writer.blocks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use veil_protocol::tunnel_data::{parse_block, TUNNEL_DATA_ENCRYPTED_SIZE};
    use veil_protocol::I2npMessageType;

    #[test]
    fn test_small_messages_share_a_block() {
        let messages: Vec<_> = (0..3)
            .map(|i| {
                (
                    TunnelDelivery::Local,
                    I2npMessage::new(I2npMessageType::Data, vec![i; 100]),
                )
            })
            .collect();
        let blocks = fragment_messages(&messages).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].len(), TUNNEL_DATA_ENCRYPTED_SIZE);
        // 3 * (3-byte header + 16-byte I2NP header + 100)
        assert_eq!(parse_block(&blocks[0]).unwrap().len(), 3 * 119);
    }

    #[test]
    fn test_large_message_is_fragmented() {
        let message = I2npMessage::new(I2npMessageType::Data, vec![7u8; 5000]);
        let blocks = fragment_messages(&[(TunnelDelivery::Local, message)]).unwrap();
        assert_eq!(blocks.len(), 6);

        let first = parse_block(&blocks[0]).unwrap();
        let (header, _) = FragmentHeader::decode(first).unwrap();
        assert!(matches!(header, FragmentHeader::First { msg_id: Some(_), .. }));

        let last = parse_block(&blocks[5]).unwrap();
        let (header, _) = FragmentHeader::decode(last).unwrap();
        assert!(matches!(
            header,
            FragmentHeader::FollowOn {
                fragment_number: 5,
                is_last: true,
                ..
            }
        ));
    }

    #[test]
    fn test_whole_message_moves_to_fresh_block() {
        let small = I2npMessage::new(I2npMessageType::Data, vec![1u8; 600]);
        let medium = I2npMessage::new(I2npMessageType::Data, vec![2u8; 600]);
        let blocks = fragment_messages(&[
            (TunnelDelivery::Local, small),
            (TunnelDelivery::Local, medium),
        ])
        .unwrap();

        assert_eq!(blocks.len(), 2);
        for block in &blocks {
            let (header, _) = FragmentHeader::decode(parse_block(block).unwrap()).unwrap();
            assert!(matches!(header, FragmentHeader::First { msg_id: None, .. }));
        }
    }
}

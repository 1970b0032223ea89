//! Tunnel endpoint reassembly

use std::collections::{BTreeMap, HashMap};
use tracing::debug;
use veil_protocol::tunnel_data::parse_block;
use veil_protocol::{FragmentHeader, I2npMessage, ProtocolError, TunnelDelivery};

use crate::error::{Result, TunnelError};

/// Incomplete messages are dropped after this long (ms)
pub const FRAGMENT_TIMEOUT_MS: u64 = 8000;

#[derive(Debug)]
struct PartialMessage {
    delivery: Option<TunnelDelivery>,
    fragments: BTreeMap<u8, Vec<u8>>,
    last_fragment: Option<u8>,
    created: u64,
}

impl PartialMessage {
    fn new(now: u64) -> Self {
        PartialMessage {
            delivery: None,
            fragments: BTreeMap::new(),
            last_fragment: None,
            created: now,
        }
    }

    fn is_complete(&self) -> bool {
        match (self.delivery, self.last_fragment) {
            (Some(_), Some(last)) => (0..=last).all(|n| self.fragments.contains_key(&n)),
            _ => false,
        }
    }
}

/// Reassembles messages from decrypted tunnel blocks
#[derive(Debug, Default)]
pub struct TunnelEndpoint {
    partial: HashMap<u32, PartialMessage>,
}

impl TunnelEndpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Verify one cleartext block and return the messages it completes
    pub fn handle_block(&mut self, block: &[u8], now: u64) -> Result<Vec<(TunnelDelivery, I2npMessage)>> {
        let fragments = parse_block(block).map_err(|e| match e {
            ProtocolError::ChecksumMismatch => TunnelError::Checksum,
            other => other.into(),
        })?;

        let mut complete = Vec::new();
        let mut offset = 0;
        while offset < fragments.len() {
            let (header, used) = FragmentHeader::decode(&fragments[offset..])?;
            offset += used;
            let size = header.size();
            let data = fragments
                .get(offset..offset + size)
                .ok_or(ProtocolError::Truncated {
                    needed: offset + size,
                    available: fragments.len(),
                })?;
            offset += size;

            let msg_id = match header {
                FragmentHeader::First {
                    delivery,
                    msg_id: None,
                    ..
                } => {
                    match I2npMessage::from_bytes(data) {
                        Ok((message, _)) => complete.push((delivery, message)),
                        Err(e) => debug!("Dropping unfragmented message: {}", e),
                    }
                    continue;
                }
                FragmentHeader::First {
                    delivery,
                    msg_id: Some(msg_id),
                    ..
                } => {
                    let partial = self
                        .partial
                        .entry(msg_id)
                        .or_insert_with(|| PartialMessage::new(now));
                    partial.delivery = Some(delivery);
                    partial.fragments.insert(0, data.to_vec());
                    msg_id
                }
                FragmentHeader::FollowOn {
                    msg_id,
                    fragment_number,
                    is_last,
                    ..
                } => {
                    let partial = self
                        .partial
                        .entry(msg_id)
                        .or_insert_with(|| PartialMessage::new(now));
                    partial.fragments.insert(fragment_number, data.to_vec());
                    if is_last {
                        partial.last_fragment = Some(fragment_number);
                    }
                    msg_id
                }
            };

            if let Some(done) = self.take_complete(msg_id) {
                complete.push(done);
            }
        }

        Ok(complete)
    }

    fn take_complete(&mut self, msg_id: u32) -> Option<(TunnelDelivery, I2npMessage)> {
        if !self.partial.get(&msg_id)?.is_complete() {
            return None;
        }
        let partial = self.partial.remove(&msg_id)?;
        let delivery = partial.delivery?;
        let bytes: Vec<u8> = partial.fragments.into_values().flatten().collect();
        match I2npMessage::from_bytes(&bytes) {
            Ok((message, _)) => Some((delivery, message)),
            Err(e) => {
                debug!("Dropping reassembled message {}: {}", msg_id, e);
                None
            }
        }
    }

    /// Drop incomplete messages older than the fragment timeout
    pub fn cleanup(&mut self, now: u64) -> usize {
        let before = self.partial.len();
        self.partial
            .retain(|_, p| now.saturating_sub(p.created) < FRAGMENT_TIMEOUT_MS);
        before - self.partial.len()
    }

    pub fn pending(&self) -> usize {
        self.partial.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::fragment_messages;
    use veil_protocol::I2npMessageType;

    #[test]
    fn test_reassembles_fragmented_message() {
        let message = I2npMessage::new(I2npMessageType::Data, vec![3u8; 4000]);
        let blocks = fragment_messages(&[(TunnelDelivery::Local, message.clone())]).unwrap();

        let mut endpoint = TunnelEndpoint::new();
        let mut delivered = Vec::new();
        for block in &blocks {
            delivered.extend(endpoint.handle_block(block, 0).unwrap());
        }
        assert_eq!(delivered, vec![(TunnelDelivery::Local, message)]);
        assert_eq!(endpoint.pending(), 0);
    }

    #[test]
    fn test_out_of_order_fragments() {
        let message = I2npMessage::new(I2npMessageType::Data, vec![4u8; 2500]);
        let delivery = TunnelDelivery::Router(veil_protocol::IdentHash::from_bytes([5u8; 32]));
        let blocks = fragment_messages(&[(delivery, message.clone())]).unwrap();

        let mut endpoint = TunnelEndpoint::new();
        let mut delivered = Vec::new();
        for block in blocks.iter().rev() {
            delivered.extend(endpoint.handle_block(block, 0).unwrap());
        }
        assert_eq!(delivered, vec![(delivery, message)]);
    }

    #[test]
    fn test_incomplete_messages_expire() {
        let message = I2npMessage::new(I2npMessageType::Data, vec![4u8; 2500]);
        let blocks = fragment_messages(&[(TunnelDelivery::Local, message)]).unwrap();

        let mut endpoint = TunnelEndpoint::new();
        assert!(endpoint.handle_block(&blocks[0], 1000).unwrap().is_empty());
        assert_eq!(endpoint.cleanup(1000 + FRAGMENT_TIMEOUT_MS - 1), 0);
        assert_eq!(endpoint.cleanup(1000 + FRAGMENT_TIMEOUT_MS), 1);
    }

    #[test]
    fn test_bad_checksum() {
        let message = I2npMessage::new(I2npMessageType::Data, vec![1u8; 10]);
        let mut blocks = fragment_messages(&[(TunnelDelivery::Local, message)]).unwrap();
        blocks[0][1023] ^= 0xff;

        let mut endpoint = TunnelEndpoint::new();
        assert_eq!(
            endpoint.handle_block(&blocks[0], 0).unwrap_err(),
            TunnelError::Checksum
        );
    }
}

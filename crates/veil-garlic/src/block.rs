//! Garlic payload blocks
//!
//! A decrypted garlic payload is a sequence of `type(1) || len(2) || data`
//! blocks. Unknown block types are skipped.

use tracing::debug;

use crate::clove::Clove;
use crate::error::{GarlicError, Result};

pub const BLOCK_DATETIME: u8 = 0;
pub const BLOCK_TERMINATION: u8 = 4;
pub const BLOCK_GARLIC_CLOVE: u8 = 11;
pub const BLOCK_PADDING: u8 = 254;

const BLOCK_HEADER_SIZE: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Block {
    /// Seconds since epoch
    DateTime(u32),
    /// Sender is closing the session; carries a reason code
    Termination(u8),
    Clove(Clove),
    Padding(usize),
}

impl Block {
    fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        let start = out.len();
        let block_type = match self {
            Block::DateTime(_) => BLOCK_DATETIME,
            Block::Termination(_) => BLOCK_TERMINATION,
            Block::Clove(_) => BLOCK_GARLIC_CLOVE,
            Block::Padding(_) => BLOCK_PADDING,
        };
        out.push(block_type);
        out.extend_from_slice(&[0, 0]);

        match self {
            Block::DateTime(ts) => out.extend_from_slice(&ts.to_be_bytes()),
            Block::Termination(reason) => {
                // 8-byte last received index, unused
                out.extend_from_slice(&[0u8; 8]);
                out.push(*reason);
            }
            Block::Clove(clove) => clove.encode(out),
            Block::Padding(len) => out.resize(out.len() + len, 0),
        }

        let len = out.len() - start - BLOCK_HEADER_SIZE;
        if len > u16::MAX as usize {
            return Err(GarlicError::MalformedInstruction(format!(
                "block of {} bytes too large",
                len
            )));
        }
        out[start + 1..start + 3].copy_from_slice(&(len as u16).to_be_bytes());
        Ok(())
    }
}

pub fn encode_blocks(blocks: &[Block]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for block in blocks {
        block.encode(&mut out)?;
    }
    Ok(out)
}

/// Parse a payload into blocks
///
/// Framing errors fail the whole payload. A clove that does not parse is
/// dropped on its own.
pub fn decode_blocks(buf: &[u8]) -> Result<Vec<Block>> {
    let mut blocks = Vec::new();
    let mut offset = 0;

    while offset < buf.len() {
        if buf.len() - offset < BLOCK_HEADER_SIZE {
            return Err(GarlicError::MalformedInstruction(
                "truncated block header".to_string(),
            ));
        }
        let block_type = buf[offset];
        let len = u16::from_be_bytes([buf[offset + 1], buf[offset + 2]]) as usize;
        offset += BLOCK_HEADER_SIZE;
        if buf.len() - offset < len {
            return Err(GarlicError::MalformedInstruction(format!(
                "block length {} exceeds payload",
                len
            )));
        }
        let data = &buf[offset..offset + len];
        offset += len;

        match block_type {
            BLOCK_DATETIME => {
                let ts: [u8; 4] = data.try_into().map_err(|_| {
                    GarlicError::MalformedInstruction("bad datetime block".to_string())
                })?;
                blocks.push(Block::DateTime(u32::from_be_bytes(ts)));
            }
            BLOCK_TERMINATION => {
                let reason = data.get(8).copied().unwrap_or(0);
                blocks.push(Block::Termination(reason));
            }
            BLOCK_GARLIC_CLOVE => match Clove::decode(data) {
                Ok(clove) => blocks.push(Block::Clove(clove)),
                Err(e) => debug!("Dropping clove: {}", e),
            },
            BLOCK_PADDING => blocks.push(Block::Padding(len)),
            other => debug!("Skipping unknown garlic block type {}", other),
        }
    }

    Ok(blocks)
}

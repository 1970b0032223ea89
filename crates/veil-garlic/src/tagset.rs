//! Ratchet tag sets
//!
//! Both ends of a session derive the same sequence of `(tag, key)` pairs
//! from the chaining key of the one-shot message that opened it. The sender
//! walks the sequence; the receiver keeps a window of upcoming tags.

use veil_crypto::{hkdf, Result};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Session tag size
pub const SESSION_TAG_SIZE: usize = 8;

pub type SessionTag = [u8; SESSION_TAG_SIZE];

/// One derived tag with its message key
pub struct TagEntry {
    pub index: u64,
    pub tag: SessionTag,
    pub key: Zeroizing<[u8; 32]>,
}

impl std::fmt::Debug for TagEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TagEntry")
            .field("index", &self.index)
            .field("tag", &hex::encode(self.tag))
            .finish_non_exhaustive()
    }
}

fn split(keydata: &[u8; 64]) -> ([u8; 32], [u8; 32]) {
    let mut a = [0u8; 32];
    let mut b = [0u8; 32];
    a.copy_from_slice(&keydata[..32]);
    b.copy_from_slice(&keydata[32..]);
    (a, b)
}

#[derive(Zeroize, ZeroizeOnDrop)]
pub struct TagSet {
    tag_chain_key: [u8; 32],
    tag_constant: [u8; 32],
    symmetric_chain_key: [u8; 32],
    next_index: u64,
}

impl TagSet {
    /// Derive a tag set from a session chaining key
    pub fn from_chain_key(chain_key: &[u8; 32]) -> Result<Self> {
        let keydata = Zeroizing::new(hkdf(chain_key, &[], "")?);
        let (_, session_key) = split(&keydata);
        let keydata = Zeroizing::new(hkdf(chain_key, &session_key, "KDFDHRatchetStep")?);
        let (_next_root, ratchet_key) = split(&keydata);

        let keydata = Zeroizing::new(hkdf(&ratchet_key, &[], "TagAndKeyGenKeys")?);
        let (tag_ck, symmetric_chain_key) = split(&keydata);

        let keydata = Zeroizing::new(hkdf(&tag_ck, &[], "STInitialization")?);
        let (tag_chain_key, tag_constant) = split(&keydata);

        Ok(TagSet {
            tag_chain_key,
            tag_constant,
            symmetric_chain_key,
            next_index: 0,
        })
    }

    /// Next tag and key in sequence
    pub fn next_entry(&mut self) -> Result<TagEntry> {
        let keydata = Zeroizing::new(hkdf(&self.tag_chain_key, &self.tag_constant, "SessionTagKeyGen")?);
        self.tag_chain_key.copy_from_slice(&keydata[..32]);
        let mut tag = [0u8; SESSION_TAG_SIZE];
        tag.copy_from_slice(&keydata[32..32 + SESSION_TAG_SIZE]);

        let keydata = Zeroizing::new(hkdf(&self.symmetric_chain_key, &[], "SymmetricRatchet")?);
        self.symmetric_chain_key.copy_from_slice(&keydata[..32]);
        let mut key = Zeroizing::new([0u8; 32]);
        key.copy_from_slice(&keydata[32..]);

        let index = self.next_index;
        self.next_index += 1;
        Ok(TagEntry { index, tag, key })
    }

    pub fn next_index(&self) -> u64 {
        self.next_index
    }
}

impl std::fmt::Debug for TagSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TagSet")
            .field("next_index", &self.next_index)
            .finish_non_exhaustive()
    }
}

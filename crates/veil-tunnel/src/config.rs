//! Hop configuration and build record cryptography
//!
//! The creator encrypts one record per hop with Noise `N` against the hop's
//! static key, then ratchets the chaining key to derive the hop's keys:
//! - `SMTunnelReplyKey`: reply key for the response and record masking
//! - `SMTunnelLayerKey`: layer key
//! - `TunnelLayerIVKey`: IV key (endpoint only; other hops use the chain key)
//! - `RGarlicKeyAndTag`: one-time garlic key and tag for the endpoint reply
//!
//! Every hop ChaCha20-masks all records other than its own with its reply
//! key, so the creator pre-masks later hops' records before sending and
//! unmasks replies from the last hop backwards.

use rand::seq::SliceRandom;
use rand::Rng;
use veil_crypto::aead::{self, chacha20_xor, nonce_from_counter};
use veil_crypto::{seal_n, LayerKeys, NoiseSymmetricState};
use veil_garlic::{SessionTag, SESSION_TAG_SIZE};
use veil_netdb::SharedRecord;
use veil_protocol::build::{
    BuildRecord, BuildRequestRecord, HopFlags, REQUEST_EXPIRATION_SECS,
    SHORT_REQUEST_RECORD_ENCRYPTED_OFFSET, SHORT_RESPONSE_RECORD_RET_OFFSET,
    SHORT_TUNNEL_BUILD_RECORD_SIZE, STANDARD_NUM_RECORDS,
};
use veil_protocol::types::{now_minutes, random_msg_id, random_tunnel_id};
use veil_protocol::{Direction, IdentHash, ProtocolError, ShortTunnelBuild, TunnelId};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Result, TunnelError};

/// Keys a hop derives from its build record
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DerivedKeys {
    pub reply_key: [u8; 32],
    pub layer_key: [u8; 32],
    pub iv_key: [u8; 32],
    pub garlic_key: [u8; 32],
    pub garlic_tag: SessionTag,
}

/// Ratchet a record's Noise state into the hop's keys
pub fn derive_hop_keys(state: &mut NoiseSymmetricState, is_endpoint: bool) -> Result<DerivedKeys> {
    state.ratchet("SMTunnelReplyKey")?;
    let reply_key = state.cipher_key();
    state.ratchet("SMTunnelLayerKey")?;
    let layer_key = state.cipher_key();

    let mut keys = DerivedKeys {
        reply_key,
        layer_key,
        iv_key: [0u8; 32],
        garlic_key: [0u8; 32],
        garlic_tag: [0u8; SESSION_TAG_SIZE],
    };

    if is_endpoint {
        state.ratchet("TunnelLayerIVKey")?;
        keys.iv_key = state.cipher_key();
        state.ratchet("RGarlicKeyAndTag")?;
        keys.garlic_key = state.cipher_key();
        keys.garlic_tag
            .copy_from_slice(&state.chain_key()[..SESSION_TAG_SIZE]);
    } else {
        keys.iv_key = state.chain_key();
    }
    Ok(keys)
}

/// Mask or unmask the record at `index` with a hop's reply key
pub fn mask_record(reply_key: &[u8; 32], index: usize, record: &mut BuildRecord) {
    chacha20_xor(reply_key, &nonce_from_counter(index as u64), record);
}

/// Per-hop state the creator keeps until the reply arrives
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct HopSecrets {
    #[zeroize(skip)]
    pub ident: IdentHash,
    pub receive_tunnel: TunnelId,
    pub record_index: usize,
    pub reply_key: [u8; 32],
    pub noise_hash: [u8; 32],
    pub layer_key: [u8; 32],
    pub iv_key: [u8; 32],
}

impl HopSecrets {
    pub fn layer_keys(&self) -> LayerKeys {
        LayerKeys::new(self.layer_key, self.iv_key)
    }
}

impl std::fmt::Debug for HopSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HopSecrets")
            .field("ident", &self.ident)
            .field("receive_tunnel", &self.receive_tunnel)
            .field("record_index", &self.record_index)
            .finish_non_exhaustive()
    }
}

/// Everything needed to finish a build, in path order
pub struct BuildSecrets {
    pub direction: Direction,
    pub hops: Vec<HopSecrets>,
    /// Message id the reply will carry
    pub reply_msg_id: u32,
    /// Our receive tunnel id for inbound tunnels
    pub local_receive_tunnel: Option<TunnelId>,
    /// One-time garlic key and tag the outbound endpoint replies with
    pub reply_garlic: Option<(SessionTag, [u8; 32])>,
}

impl BuildSecrets {
    pub fn hop_idents(&self) -> Vec<IdentHash> {
        self.hops.iter().map(|h| h.ident).collect()
    }
}

impl std::fmt::Debug for BuildSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildSecrets")
            .field("direction", &self.direction)
            .field("hops", &self.hops)
            .field("reply_msg_id", &self.reply_msg_id)
            .finish_non_exhaustive()
    }
}

impl Drop for BuildSecrets {
    fn drop(&mut self) {
        if let Some((tag, key)) = self.reply_garlic.as_mut() {
            tag.zeroize();
            key.zeroize();
        }
    }
}

/// Encrypt build records for `path`
///
/// Records are placed in shuffled slots among random filler records. For
/// outbound tunnels the last hop is the endpoint and replies to `local`;
/// for inbound tunnels the last hop forwards to `local`, the endpoint.
pub fn create_build_request(
    direction: Direction,
    path: &[SharedRecord],
    local: IdentHash,
) -> Result<(ShortTunnelBuild, BuildSecrets)> {
    if path.is_empty() {
        return Err(TunnelError::InvalidConfig("build with no hops".to_string()));
    }

    let mut rng = rand::thread_rng();
    let record_count = path.len().max(STANDARD_NUM_RECORDS);
    let mut slots: Vec<usize> = (0..record_count).collect();
    slots.shuffle(&mut rng);

    let mut records: Vec<BuildRecord> = (0..record_count)
        .map(|_| {
            let mut record = [0u8; SHORT_TUNNEL_BUILD_RECORD_SIZE];
            rng.fill(&mut record[..]);
            record
        })
        .collect();

    let receive_ids: Vec<TunnelId> = path.iter().map(|_| random_tunnel_id()).collect();
    let reply_msg_id = random_msg_id();
    let local_receive_tunnel = match direction {
        Direction::Inbound => Some(random_tunnel_id()),
        Direction::Outbound => None,
    };

    let last = path.len() - 1;
    let mut hops = Vec::with_capacity(path.len());
    let mut reply_garlic = None;

    for (i, peer) in path.iter().enumerate() {
        let mut flags = HopFlags::empty();
        if direction == Direction::Inbound && i == 0 {
            flags |= HopFlags::GATEWAY;
        }
        let is_endpoint = direction == Direction::Outbound && i == last;
        if is_endpoint {
            flags |= HopFlags::ENDPOINT;
        }

        let (next_ident, next_tunnel, send_msg_id) = if i < last {
            (path[i + 1].ident_hash(), receive_ids[i + 1], random_msg_id())
        } else {
            // The outbound endpoint replies directly, so its next tunnel is unused
            (local, local_receive_tunnel.unwrap_or(0), reply_msg_id)
        };

        let request = BuildRequestRecord {
            receive_tunnel: receive_ids[i],
            next_tunnel,
            next_ident,
            flags,
            layer_encryption_type: 0,
            request_time_minutes: now_minutes(),
            request_expiration: REQUEST_EXPIRATION_SECS,
            send_msg_id,
        };

        let (sealed, mut state) = seal_n(peer.encryption_key(), &request.to_bytes())?;
        let slot = slots[i];
        records[slot][..SHORT_REQUEST_RECORD_ENCRYPTED_OFFSET]
            .copy_from_slice(&peer.ident_hash().truncated());
        records[slot][SHORT_REQUEST_RECORD_ENCRYPTED_OFFSET..].copy_from_slice(&sealed);

        let noise_hash = *state.hash();
        let keys = derive_hop_keys(&mut state, is_endpoint)?;
        if is_endpoint {
            reply_garlic = Some((keys.garlic_tag, keys.garlic_key));
        }

        hops.push(HopSecrets {
            ident: peer.ident_hash(),
            receive_tunnel: receive_ids[i],
            record_index: slot,
            reply_key: keys.reply_key,
            noise_hash,
            layer_key: keys.layer_key,
            iv_key: keys.iv_key,
        });
    }

    // Each hop masks every later record; undo that in advance
    for (i, hop) in hops.iter().enumerate() {
        for later in &hops[i + 1..] {
            mask_record(&hop.reply_key, later.record_index, &mut records[later.record_index]);
        }
    }

    let build = ShortTunnelBuild::new(records)?;
    let secrets = BuildSecrets {
        direction,
        hops,
        reply_msg_id,
        local_receive_tunnel,
        reply_garlic,
    };
    Ok((build, secrets))
}

/// Decrypt every hop's response, returning return codes in path order
pub fn decrypt_build_reply(secrets: &BuildSecrets, records: &mut [BuildRecord]) -> Result<Vec<u8>> {
    let mut codes = vec![0u8; secrets.hops.len()];

    for (i, hop) in secrets.hops.iter().enumerate().rev() {
        let record = records
            .get(hop.record_index)
            .ok_or(ProtocolError::InvalidRecordCount(records.len()))?;
        let plaintext = aead::decrypt(
            &hop.reply_key,
            &nonce_from_counter(hop.record_index as u64),
            &hop.noise_hash,
            record,
        )?;
        codes[i] = plaintext[SHORT_RESPONSE_RECORD_RET_OFFSET];

        for earlier in &secrets.hops[..i] {
            mask_record(&hop.reply_key, earlier.record_index, &mut records[earlier.record_index]);
        }
    }

    Ok(codes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::peer as hop;
    use crate::transit::{handle_build_request, TransitTable};
    use veil_protocol::types::now_millis;
    use veil_protocol::{I2npMessage, I2npMessageType};

    #[test]
    fn test_record_slots_are_addressed() {
        veil_crypto::init().unwrap();
        let hops: Vec<_> = (0..3).map(hop).collect();
        let path: Vec<SharedRecord> = hops.iter().map(|(_, r)| r.clone()).collect();
        let local = IdentHash::from_bytes([1u8; 32]);

        let (build, secrets) = create_build_request(Direction::Outbound, &path, local).unwrap();
        assert_eq!(build.records.len(), STANDARD_NUM_RECORDS);
        assert_eq!(secrets.hops.len(), 3);
        assert!(secrets.reply_garlic.is_some());

        // Only the first hop's record is readable before anyone has masked
        let first = &secrets.hops[0];
        assert_eq!(build.find_record(&first.ident), Some(first.record_index));
    }

    #[test]
    fn test_full_build_round_trip_through_hops() {
        veil_crypto::init().unwrap();
        let hops: Vec<_> = (0..3).map(hop).collect();
        let path: Vec<SharedRecord> = hops.iter().map(|(_, r)| r.clone()).collect();
        let local = IdentHash::from_bytes([1u8; 32]);

        let (mut build, secrets) = create_build_request(Direction::Inbound, &path, local).unwrap();
        let mut msg_id = 0;
        for (identity, _) in &hops {
            let mut table = TransitTable::new(10);
            let response = handle_build_request(identity, &mut table, build, now_millis()).unwrap();
            let message: I2npMessage = response.message;
            assert_eq!(message.msg_type, I2npMessageType::ShortTunnelBuild);
            msg_id = message.msg_id;
            build = ShortTunnelBuild::from_bytes(&message.payload).unwrap();
            assert_eq!(table.len(), 1);
        }

        assert_eq!(msg_id, secrets.reply_msg_id);
        let codes = decrypt_build_reply(&secrets, &mut build.records).unwrap();
        assert_eq!(codes, vec![0, 0, 0]);
    }

    #[test]
    fn test_tampered_reply_fails() {
        veil_crypto::init().unwrap();
        let hops: Vec<_> = (0..2).map(hop).collect();
        let path: Vec<SharedRecord> = hops.iter().map(|(_, r)| r.clone()).collect();
        let (mut build, secrets) =
            create_build_request(Direction::Inbound, &path, IdentHash::from_bytes([1u8; 32])).unwrap();
        for (identity, _) in &hops {
            let mut table = TransitTable::new(10);
            let response = handle_build_request(identity, &mut table, build, now_millis()).unwrap();
            build = ShortTunnelBuild::from_bytes(&response.message.payload).unwrap();
        }
        build.records[secrets.hops[0].record_index][5] ^= 1;

        assert!(matches!(
            decrypt_build_reply(&secrets, &mut build.records),
            Err(TunnelError::Crypto(_))
        ));
    }

    #[test]
    fn test_endpoint_and_participant_derive_differently() {
        let mut a = NoiseSymmetricState::init_n(&[9u8; 32]);
        let mut b = a.clone();
        let endpoint = derive_hop_keys(&mut a, true).unwrap();
        let participant = derive_hop_keys(&mut b, false).unwrap();
        assert_eq!(endpoint.reply_key, participant.reply_key);
        assert_eq!(endpoint.layer_key, participant.layer_key);
        assert_ne!(endpoint.iv_key, participant.iv_key);
        assert_ne!(endpoint.garlic_tag, [0u8; SESSION_TAG_SIZE]);
    }
}

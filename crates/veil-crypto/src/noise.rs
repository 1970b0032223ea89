//! Noise symmetric state and the one-shot `N` pattern
//!
//! Used for short tunnel build records and for one-shot garlic messages.
//! The chaining key is kept as 64 bytes: `ck[0..32]` is the chain key and
//! `ck[32..64]` the current cipher key, matching the router's key schedule.

use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::aead::{self, TAG_SIZE};
use crate::error::{CryptoError, Result};

/// Protocol name for the `N` handshake, zero-padded to 32 bytes as the initial chain key
pub const NOISE_N_PROTOCOL_NAME: &[u8] = b"Noise_N_25519_ChaChaPoly_SHA256";

/// X25519 public key size
pub const PUBLIC_KEY_SIZE: usize = 32;

/// HKDF-SHA256 with a 32-byte salt, producing 64 bytes
///
/// An empty `ikm` gives the zero-length variant used for key ratchets.
pub fn hkdf(salt: &[u8], ikm: &[u8], info: &str) -> Result<[u8; 64]> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut out = [0u8; 64];
    hk.expand(info.as_bytes(), &mut out)
        .map_err(|_| CryptoError::KeyDerivation)?;
    Ok(out)
}

/// SHA-256 over one buffer
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// SHA-256 over several buffers
pub fn sha256_parts(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct NoiseSymmetricState {
    ck: [u8; 64],
    h: [u8; 32],
}

impl NoiseSymmetricState {
    /// Initialize for the `N` pattern against the responder's static key
    pub fn init_n(responder_static: &[u8; PUBLIC_KEY_SIZE]) -> Self {
        let mut ck = [0u8; 64];
        ck[..NOISE_N_PROTOCOL_NAME.len()].copy_from_slice(NOISE_N_PROTOCOL_NAME);
        let hh = sha256(&ck[..32]);
        let h = sha256_parts(&[&hh, responder_static]);
        NoiseSymmetricState { ck, h }
    }

    /// h = SHA256(h || data)
    pub fn mix_hash(&mut self, data: &[u8]) {
        self.h = sha256_parts(&[&self.h, data]);
    }

    /// ck, k = HKDF(ck, shared_secret, "")
    pub fn mix_key(&mut self, shared_secret: &[u8]) -> Result<()> {
        self.ck = hkdf(&self.ck[..32], shared_secret, "")?;
        Ok(())
    }

    /// ck, k = HKDF(ck, ZEROLEN, label)
    pub fn ratchet(&mut self, label: &str) -> Result<()> {
        self.ck = hkdf(&self.ck[..32], &[], label)?;
        Ok(())
    }

    /// Current handshake hash
    pub fn hash(&self) -> &[u8; 32] {
        &self.h
    }

    /// Current chain key (first half)
    pub fn chain_key(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        out.copy_from_slice(&self.ck[..32]);
        out
    }

    /// Current cipher key (second half)
    pub fn cipher_key(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        out.copy_from_slice(&self.ck[32..]);
        out
    }

    /// Full 64-byte chaining state
    pub fn chaining_state(&self) -> &[u8; 64] {
        &self.ck
    }
}

impl std::fmt::Debug for NoiseSymmetricState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoiseSymmetricState")
            .field("h", &hex::encode(self.h))
            .finish_non_exhaustive()
    }
}

/// Encrypt `plaintext` for `responder_static` with a fresh ephemeral key
///
/// Output is `ephemeral_public(32) || ciphertext || tag(16)`. The returned
/// state has the ciphertext mixed into `h` and can be ratcheted further.
pub fn seal_n(
    responder_static: &[u8; PUBLIC_KEY_SIZE],
    plaintext: &[u8],
) -> Result<(Vec<u8>, NoiseSymmetricState)> {
    let mut state = NoiseSymmetricState::init_n(responder_static);

    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral);
    state.mix_hash(ephemeral_public.as_bytes());

    let shared = ephemeral.diffie_hellman(&PublicKey::from(*responder_static));
    state.mix_key(shared.as_bytes())?;

    let ciphertext = aead::encrypt(&state.cipher_key(), &[0u8; 12], &state.h, plaintext)?;
    state.mix_hash(&ciphertext);

    let mut out = Vec::with_capacity(PUBLIC_KEY_SIZE + ciphertext.len());
    out.extend_from_slice(ephemeral_public.as_bytes());
    out.extend_from_slice(&ciphertext);
    Ok((out, state))
}

/// Decrypt a message produced by [`seal_n`] with our static secret
pub fn open_n(
    local_static: &StaticSecret,
    sealed: &[u8],
) -> Result<(Vec<u8>, NoiseSymmetricState)> {
    if sealed.len() < PUBLIC_KEY_SIZE + TAG_SIZE {
        return Err(CryptoError::InvalidLength {
            expected: PUBLIC_KEY_SIZE + TAG_SIZE,
            actual: sealed.len(),
        });
    }

    let local_public = PublicKey::from(local_static);
    let mut state = NoiseSymmetricState::init_n(local_public.as_bytes());

    let mut ephemeral_bytes = [0u8; PUBLIC_KEY_SIZE];
    ephemeral_bytes.copy_from_slice(&sealed[..PUBLIC_KEY_SIZE]);
    state.mix_hash(&ephemeral_bytes);

    let shared = local_static.diffie_hellman(&PublicKey::from(ephemeral_bytes));
    state.mix_key(shared.as_bytes())?;

    let ciphertext = &sealed[PUBLIC_KEY_SIZE..];
    let plaintext = aead::decrypt(&state.cipher_key(), &[0u8; 12], &state.h, ciphertext)?;
    state.mix_hash(ciphertext);

    Ok((plaintext, state))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_hash_matches_router_constant() {
        // SHA256("Noise_N_25519_ChaChaPoly_SHA256" || 0x00)
        let mut ck = [0u8; 32];
        ck[..NOISE_N_PROTOCOL_NAME.len()].copy_from_slice(NOISE_N_PROTOCOL_NAME);
        assert_eq!(
            hex::encode(sha256(&ck)),
            "694d52445a27d9adfad29c7632395dc1e4354c69b4f92eac8a1ee46a9ed21554"
        );
    }

    #[test]
    fn test_seal_open_roundtrip_and_state_agreement() {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);

        let (sealed, mut sender) = seal_n(public.as_bytes(), b"build request").unwrap();
        let (plaintext, mut receiver) = open_n(&secret, &sealed).unwrap();

        assert_eq!(plaintext, b"build request");
        assert_eq!(sender.hash(), receiver.hash());

        sender.ratchet("SMTunnelReplyKey").unwrap();
        receiver.ratchet("SMTunnelReplyKey").unwrap();
        assert_eq!(sender.cipher_key(), receiver.cipher_key());
    }

    #[test]
    fn test_open_with_wrong_key_fails() {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        let other = StaticSecret::random_from_rng(OsRng);

        let (sealed, _) = seal_n(public.as_bytes(), b"secret").unwrap();
        assert_eq!(open_n(&other, &sealed).unwrap_err(), CryptoError::Aead);
    }

    #[test]
    fn test_hkdf_zero_length_matches_empty_ikm() {
        let salt = [3u8; 32];
        let a = hkdf(&salt, &[], "SMTunnelLayerKey").unwrap();
        let b = hkdf(&salt, b"", "SMTunnelLayerKey").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, hkdf(&salt, &[], "SMTunnelReplyKey").unwrap());
    }
}

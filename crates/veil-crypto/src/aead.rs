//! ChaCha20-Poly1305 and raw ChaCha20 helpers
//!
//! Nonces follow the router convention: four zero bytes followed by a
//! little-endian 64-bit counter.

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};

use crate::error::{CryptoError, Result};

/// Symmetric key size
pub const KEY_SIZE: usize = 32;

/// IETF nonce size
pub const NONCE_SIZE: usize = 12;

/// Poly1305 tag size
pub const TAG_SIZE: usize = 16;

/// Build a nonce from a counter value
pub fn nonce_from_counter(counter: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[4..].copy_from_slice(&counter.to_le_bytes());
    nonce
}

/// Encrypt and authenticate `plaintext`, returning ciphertext with the tag appended
pub fn encrypt(
    key: &[u8; KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    ad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad: ad,
            },
        )
        .map_err(|_| CryptoError::Aead)
}

/// Verify and decrypt `ciphertext` (tag appended)
pub fn decrypt(
    key: &[u8; KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    ad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>> {
    if ciphertext.len() < TAG_SIZE {
        return Err(CryptoError::InvalidLength {
            expected: TAG_SIZE,
            actual: ciphertext.len(),
        });
    }

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: ad,
            },
        )
        .map_err(|_| CryptoError::Aead)
}

/// Apply the ChaCha20 keystream in place (counter starts at zero)
pub fn chacha20_xor(key: &[u8; KEY_SIZE], nonce: &[u8; NONCE_SIZE], buf: &mut [u8]) {
    let mut cipher = ChaCha20::new(key.into(), nonce.into());
    cipher.apply_keystream(buf);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let key = [7u8; KEY_SIZE];
        let nonce = nonce_from_counter(3);
        let ct = encrypt(&key, &nonce, b"ad", b"hello tunnel").unwrap();
        assert_eq!(ct.len(), 12 + TAG_SIZE);

        let pt = decrypt(&key, &nonce, b"ad", &ct).unwrap();
        assert_eq!(pt, b"hello tunnel");
    }

    #[test]
    fn test_wrong_ad_fails() {
        let key = [7u8; KEY_SIZE];
        let nonce = nonce_from_counter(0);
        let ct = encrypt(&key, &nonce, b"ad", b"payload").unwrap();
        assert_eq!(decrypt(&key, &nonce, b"other", &ct), Err(CryptoError::Aead));
    }

    #[test]
    fn test_short_ciphertext_rejected() {
        let key = [1u8; KEY_SIZE];
        let nonce = nonce_from_counter(0);
        assert!(matches!(
            decrypt(&key, &nonce, &[], &[0u8; 4]),
            Err(CryptoError::InvalidLength { .. })
        ));
    }

    #[test]
    fn test_nonce_layout() {
        let nonce = nonce_from_counter(5);
        assert_eq!(&nonce[..4], &[0, 0, 0, 0]);
        assert_eq!(nonce[4], 5);
        assert!(nonce[5..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_chacha20_is_symmetric() {
        let key = [9u8; KEY_SIZE];
        let nonce = nonce_from_counter(2);
        let mut buf = b"record bytes".to_vec();
        chacha20_xor(&key, &nonce, &mut buf);
        assert_ne!(&buf[..], b"record bytes");
        chacha20_xor(&key, &nonce, &mut buf);
        assert_eq!(&buf[..], b"record bytes");
    }
}

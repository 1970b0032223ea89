//! Per-hop tunnel layer transform
//!
//! A tunnel message body is a 16-byte IV followed by 1008 bytes of data.
//! Encryption at each hop:
//! - IV' = AES-256-ECB(iv_key, IV)
//! - data = AES-256-CBC(layer_key, IV', data)
//! - IV'' = AES-256-ECB(iv_key, IV')
//!
//! Decryption is the exact inverse.

use aes::cipher::block_padding::NoPadding;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockDecryptMut, BlockEncrypt, BlockEncryptMut, KeyInit, KeyIvInit};
use aes::Aes256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CryptoError, Result};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// AES block / IV size
pub const IV_SIZE: usize = 16;

/// Encrypted portion of a tunnel data message (IV + data)
pub const LAYER_BLOCK_SIZE: usize = 1024;

/// Keys for one hop's layer transform
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct LayerKeys {
    pub layer_key: [u8; 32],
    pub iv_key: [u8; 32],
}

impl LayerKeys {
    pub fn new(layer_key: [u8; 32], iv_key: [u8; 32]) -> Self {
        LayerKeys { layer_key, iv_key }
    }
}

impl std::fmt::Debug for LayerKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LayerKeys(..)")
    }
}

/// Applies the double-IV AES transform for one hop
#[derive(Clone)]
pub struct LayerCipher {
    keys: LayerKeys,
    iv_cipher: Aes256,
}

impl LayerCipher {
    pub fn new(keys: LayerKeys) -> Self {
        let iv_cipher = Aes256::new(GenericArray::from_slice(&keys.iv_key));
        LayerCipher { keys, iv_cipher }
    }

    pub fn keys(&self) -> &LayerKeys {
        &self.keys
    }

    /// Encrypt one layer in place
    pub fn encrypt(&self, block: &mut [u8]) -> Result<()> {
        check_len(block)?;
        let (iv, data) = block.split_at_mut(IV_SIZE);

        self.iv_cipher
            .encrypt_block(GenericArray::from_mut_slice(iv));

        let len = data.len();
        Aes256CbcEnc::new(
            GenericArray::from_slice(&self.keys.layer_key),
            GenericArray::from_slice(iv),
        )
        .encrypt_padded_mut::<NoPadding>(data, len)
        .map_err(|_| CryptoError::InvalidLength {
            expected: LAYER_BLOCK_SIZE - IV_SIZE,
            actual: len,
        })?;

        // double IV encryption
        self.iv_cipher
            .encrypt_block(GenericArray::from_mut_slice(iv));
        Ok(())
    }

    /// Decrypt one layer in place
    pub fn decrypt(&self, block: &mut [u8]) -> Result<()> {
        check_len(block)?;
        let (iv, data) = block.split_at_mut(IV_SIZE);

        self.iv_cipher
            .decrypt_block(GenericArray::from_mut_slice(iv));

        let data_len = data.len();
        Aes256CbcDec::new(
            GenericArray::from_slice(&self.keys.layer_key),
            GenericArray::from_slice(iv),
        )
        .decrypt_padded_mut::<NoPadding>(data)
        .map_err(|_| CryptoError::InvalidLength {
            expected: LAYER_BLOCK_SIZE - IV_SIZE,
            actual: data_len,
        })?;

        self.iv_cipher
            .decrypt_block(GenericArray::from_mut_slice(iv));
        Ok(())
    }
}

fn check_len(block: &[u8]) -> Result<()> {
    if block.len() != LAYER_BLOCK_SIZE {
        return Err(CryptoError::InvalidLength {
            expected: LAYER_BLOCK_SIZE,
            actual: block.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    fn random_keys() -> LayerKeys {
        let mut rng = rand::thread_rng();
        let mut layer_key = [0u8; 32];
        let mut iv_key = [0u8; 32];
        rng.fill_bytes(&mut layer_key);
        rng.fill_bytes(&mut iv_key);
        LayerKeys::new(layer_key, iv_key)
    }

    fn random_block() -> Vec<u8> {
        let mut block = vec![0u8; LAYER_BLOCK_SIZE];
        rand::thread_rng().fill_bytes(&mut block);
        block
    }

    #[test]
    fn test_decrypt_inverts_encrypt() {
        let cipher = LayerCipher::new(random_keys());
        let original = random_block();
        let mut block = original.clone();

        cipher.encrypt(&mut block).unwrap();
        assert_ne!(block, original);
        cipher.decrypt(&mut block).unwrap();
        assert_eq!(block, original);
    }

    #[test]
    fn test_iv_is_double_encrypted() {
        let keys = random_keys();
        let cipher = LayerCipher::new(keys.clone());
        let original = random_block();
        let mut block = original.clone();
        cipher.encrypt(&mut block).unwrap();

        let aes = Aes256::new(GenericArray::from_slice(&keys.iv_key));
        let mut expected = GenericArray::clone_from_slice(&original[..IV_SIZE]);
        aes.encrypt_block(&mut expected);
        aes.encrypt_block(&mut expected);
        assert_eq!(&block[..IV_SIZE], expected.as_slice());
    }

    #[test]
    fn test_multi_hop_layers_peel_in_reverse() {
        let hops: Vec<LayerCipher> = (0..3).map(|_| LayerCipher::new(random_keys())).collect();
        let original = random_block();
        let mut block = original.clone();

        // creator pre-decrypts for every hop, last hop first
        for hop in hops.iter().rev() {
            hop.decrypt(&mut block).unwrap();
        }
        // each hop then encrypts in path order
        for hop in &hops {
            hop.encrypt(&mut block).unwrap();
        }
        assert_eq!(block, original);
    }

    #[test]
    fn test_wrong_length_rejected() {
        let cipher = LayerCipher::new(random_keys());
        let mut short = vec![0u8; 100];
        assert!(cipher.encrypt(&mut short).is_err());
        assert!(cipher.decrypt(&mut short).is_err());
    }
}

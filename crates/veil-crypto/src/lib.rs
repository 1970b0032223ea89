//! Veil cryptographic primitives
//!
//! This crate provides the building blocks used by tunnels and garlic:
//! - AES-256 double-IV layer transform applied once per hop
//! - ChaCha20-Poly1305 AEAD and raw ChaCha20 for build records
//! - Noise `N` symmetric state, HKDF-SHA256 key ratchets
//! - Router identities (Ed25519 signing, X25519 encryption)

pub mod aead;
pub mod error;
pub mod identity;
pub mod layer;
pub mod noise;

pub use error::{CryptoError, Result};
pub use identity::{PublicIdentity, RouterIdentity, IDENT_HASH_SIZE};
pub use layer::{LayerCipher, LayerKeys, LAYER_BLOCK_SIZE};
pub use noise::{hkdf, open_n, seal_n, sha256, NoiseSymmetricState};

pub use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519StaticSecret};

/// Initialize the crypto library
///
/// Must be called before generating identities.
pub fn init() -> Result<()> {
    sodiumoxide::init().map_err(|_| CryptoError::InitializationFailed)
}

//! Router identity keys
//!
//! A router identity carries an Ed25519 signing key (record signatures) and
//! an X25519 encryption key (build records, one-shot garlic). The ident hash
//! is SHA-256 over both public keys.

use rand::rngs::OsRng;
use sodiumoxide::crypto::sign::ed25519;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{CryptoError, Result};
use crate::noise::sha256_parts;

/// Ed25519 public key size
pub const SIGNING_KEY_SIZE: usize = 32;

/// Ed25519 signature size
pub const SIGNATURE_SIZE: usize = 64;

/// Ident hash size
pub const IDENT_HASH_SIZE: usize = 32;

/// Public half of a router identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicIdentity {
    pub signing_key: [u8; SIGNING_KEY_SIZE],
    pub encryption_key: [u8; 32],
}

impl PublicIdentity {
    /// SHA-256 over signing key and encryption key
    pub fn hash(&self) -> [u8; IDENT_HASH_SIZE] {
        sha256_parts(&[&self.signing_key, &self.encryption_key])
    }

    /// Verify an Ed25519 signature made by this identity
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<()> {
        if signature.len() != SIGNATURE_SIZE {
            return Err(CryptoError::InvalidSignature);
        }

        let public_key =
            ed25519::PublicKey::from_slice(&self.signing_key).ok_or(CryptoError::InvalidPublicKey)?;
        let signature =
            ed25519::Signature::from_bytes(signature).map_err(|_| CryptoError::InvalidSignature)?;

        if ed25519::verify_detached(&signature, message, &public_key) {
            Ok(())
        } else {
            Err(CryptoError::InvalidSignature)
        }
    }
}

/// Full router identity with secret keys
pub struct RouterIdentity {
    signing_public: ed25519::PublicKey,
    signing_secret: ed25519::SecretKey,
    encryption_secret: StaticSecret,
    public: PublicIdentity,
}

impl RouterIdentity {
    /// Generate a fresh identity
    ///
    /// Requires [`crate::init`] to have been called.
    pub fn generate() -> Self {
        let (signing_public, signing_secret) = ed25519::gen_keypair();
        let encryption_secret = StaticSecret::random_from_rng(OsRng);
        let encryption_public = PublicKey::from(&encryption_secret);

        let public = PublicIdentity {
            signing_key: signing_public.0,
            encryption_key: *encryption_public.as_bytes(),
        };

        RouterIdentity {
            signing_public,
            signing_secret,
            encryption_secret,
            public,
        }
    }

    pub fn public(&self) -> &PublicIdentity {
        &self.public
    }

    pub fn ident_hash(&self) -> [u8; IDENT_HASH_SIZE] {
        self.public.hash()
    }

    /// Static X25519 secret used to open build records and one-shot garlic
    pub fn encryption_secret(&self) -> &StaticSecret {
        &self.encryption_secret
    }

    /// Sign a message with the Ed25519 key
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_SIZE] {
        ed25519::sign_detached(message, &self.signing_secret).to_bytes()
    }

    pub fn signing_public(&self) -> &ed25519::PublicKey {
        &self.signing_public
    }
}

impl std::fmt::Debug for RouterIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RouterIdentity({})", hex::encode(&self.ident_hash()[..8]))
    }
}

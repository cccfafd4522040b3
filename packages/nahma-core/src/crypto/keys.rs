//! # Key Management
//!
//! Symmetric key generation and the Ed25519 signing keypair wrapper.

use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::RngCore;
use zeroize::ZeroizeOnDrop;

use crate::error::{Error, Result};

/// Generate a fresh 32-byte symmetric key from the OS CSPRNG.
pub fn generate_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

/// Ed25519 signing keypair
///
/// ## Security
///
/// - The secret half is zeroized when dropped
/// - The public half (32 bytes) identifies the user on the wire,
///   hex-encoded at API boundaries
#[derive(ZeroizeOnDrop)]
pub struct SigningKeyPair {
    #[zeroize(skip)] // ed25519_dalek::SigningKey handles its own zeroization
    secret: SigningKey,
}

impl SigningKeyPair {
    /// Generate a new random signing keypair.
    ///
    /// For user-facing identity creation prefer `from_seed()` with a
    /// BIP39-derived seed so the keys are recoverable.
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut seed);
        Self {
            secret: SigningKey::from_bytes(&seed),
        }
    }

    /// Create deterministically from a 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            secret: SigningKey::from_bytes(seed),
        }
    }

    /// Reconstruct from the 64-byte secret (keypair) encoding.
    pub fn from_secret_bytes(bytes: &[u8; 64]) -> Result<Self> {
        let secret = SigningKey::from_keypair_bytes(bytes)
            .map_err(|e| Error::InvalidKey(format!("Invalid keypair bytes: {}", e)))?;
        Ok(Self { secret })
    }

    /// The 32-byte public key.
    pub fn public_bytes(&self) -> [u8; 32] {
        self.secret.verifying_key().to_bytes()
    }

    /// The public key as a lowercase hex string (the wire identity).
    pub fn public_hex(&self) -> String {
        hex::encode(self.public_bytes())
    }

    /// The 64-byte secret encoding (seed ‖ public), for backup/storage.
    ///
    /// ## Security Warning
    ///
    /// Only use this for secure storage. Never log or transmit these bytes.
    pub fn secret_bytes(&self) -> [u8; 64] {
        self.secret.to_keypair_bytes()
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.secret
    }

    /// The verifying half as a dalek key.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.secret.verifying_key()
    }
}

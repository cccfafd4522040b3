//! # Digital Signatures
//!
//! Ed25519 detached signatures for identity verification.
//!
//! ## Properties
//!
//! - **Compact**: 64-byte signatures, 32-byte public keys
//! - **Deterministic**: Same input always produces the same signature
//! - **Fast**: Batch-friendly verification

use ed25519_dalek::{Signature as Ed25519Signature, Signer, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::crypto::SigningKeyPair;
use crate::error::{Error, Result};

/// Size of an Ed25519 signature in bytes
pub const SIGNATURE_SIZE: usize = 64;

/// An Ed25519 detached signature
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "signature_bytes")] pub [u8; SIGNATURE_SIZE]);

impl Signature {
    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; SIGNATURE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create from a slice (must be exactly 64 bytes)
    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        if slice.len() != SIGNATURE_SIZE {
            return Err(Error::InvalidKey(format!(
                "Signature must be {} bytes, got {}",
                SIGNATURE_SIZE,
                slice.len()
            )));
        }
        let mut bytes = [0u8; SIGNATURE_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; SIGNATURE_SIZE] {
        &self.0
    }

    /// Encode as hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Decode from hex string
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let bytes = hex::decode(hex_str)
            .map_err(|e| Error::InvalidKey(format!("Invalid signature hex: {}", e)))?;
        Self::from_slice(&bytes)
    }
}

impl AsRef<[u8]> for Signature {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Sign a message using Ed25519.
pub fn sign(keypair: &SigningKeyPair, message: &[u8]) -> Signature {
    let sig = keypair.signing_key().sign(message);
    Signature(sig.to_bytes())
}

/// Verify an Ed25519 signature against a 32-byte public key.
///
/// Returns `Ok(())` if valid, `Err(VerificationFailed)` otherwise.
pub fn verify(public_key: &[u8; 32], message: &[u8], signature: &Signature) -> Result<()> {
    let verifying_key = VerifyingKey::from_bytes(public_key)
        .map_err(|e| Error::InvalidKey(format!("Invalid public key: {}", e)))?;

    let sig = Ed25519Signature::from_bytes(&signature.0);

    verifying_key
        .verify(message, &sig)
        .map_err(|_| Error::VerificationFailed)
}

/// Serde helper for signature bytes (hex on the wire)
mod signature_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8; 64], serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<[u8; 64], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("Invalid signature length"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let keypair = SigningKeyPair::generate();
        let message = b"workspace change";

        let sig = sign(&keypair, message);
        assert!(verify(&keypair.public_bytes(), message, &sig).is_ok());
    }

    #[test]
    fn test_verify_wrong_message_fails() {
        let keypair = SigningKeyPair::generate();
        let sig = sign(&keypair, b"original");

        assert!(matches!(
            verify(&keypair.public_bytes(), b"tampered", &sig),
            Err(Error::VerificationFailed)
        ));
    }

    #[test]
    fn test_verify_wrong_key_fails() {
        let keypair = SigningKeyPair::generate();
        let other = SigningKeyPair::generate();
        let sig = sign(&keypair, b"message");

        assert!(verify(&other.public_bytes(), b"message", &sig).is_err());
    }

    #[test]
    fn test_signing_is_deterministic() {
        let keypair = SigningKeyPair::generate();
        let sig1 = sign(&keypair, b"message");
        let sig2 = sign(&keypair, b"message");
        assert_eq!(sig1, sig2);
    }

    #[test]
    fn test_signature_hex_round_trip() {
        let keypair = SigningKeyPair::generate();
        let sig = sign(&keypair, b"message");

        let restored = Signature::from_hex(&sig.to_hex()).unwrap();
        assert_eq!(sig, restored);
    }

    #[test]
    fn test_signature_serde_round_trip() {
        let keypair = SigningKeyPair::generate();
        let sig = sign(&keypair, b"message");

        let json = serde_json::to_string(&sig).unwrap();
        let parsed: Signature = serde_json::from_str(&json).unwrap();
        assert_eq!(sig, parsed);
    }
}

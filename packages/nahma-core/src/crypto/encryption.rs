//! # Update Encryption
//!
//! Padded XSalsa20-Poly1305 secretbox encryption for CRDT updates and other
//! at-rest blobs.
//!
//! ## Blob Layout
//!
//! ```text
//! ┌──────────────┬──────────────────────────────────────────────────┐
//! │ nonce (24 B) │ secretbox( len_be32 ‖ data ‖ zero pad )          │
//! └──────────────┴──────────────────────────────────────────────────┘
//!                 └── padded to the next 4096-byte block ──┘
//! ```
//!
//! The 4-byte big-endian length prefix plus zero padding means every
//! plaintext up to 4092 bytes produces a ciphertext of identical length:
//! an observer of the stored log learns nothing about update sizes below
//! the block granularity.
//!
//! ## Failure Behavior
//!
//! Decryption returns `Error::DecryptionFailed` on any tampered nonce,
//! ciphertext or length prefix, a truncated blob, or a wrong key. It never
//! panics and never returns partial plaintext.

use crypto_secretbox::{
    aead::{Aead, KeyInit},
    Nonce as SecretboxNonce, XSalsa20Poly1305,
};
use rand::RngCore;

use crate::error::{Error, Result};

/// Size of the secretbox nonce in bytes (192 bits)
pub const NONCE_SIZE: usize = 24;

/// Size of the encryption key in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// Size of the Poly1305 authentication tag in bytes
const TAG_SIZE: usize = 16;

/// Plaintexts are padded to a multiple of this block size before encryption
pub const PAD_BLOCK_SIZE: usize = 4096;

/// Length of the big-endian length prefix inside the padded plaintext
const LEN_PREFIX: usize = 4;

/// Fixed ciphertext overhead on top of the padded plaintext
pub const CIPHERTEXT_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

/// Pad `data` to the next `PAD_BLOCK_SIZE` boundary behind a length prefix.
fn pad(data: &[u8]) -> Result<Vec<u8>> {
    if data.len() > u32::MAX as usize {
        return Err(Error::EncryptionFailed("Payload too large".into()));
    }
    let raw = LEN_PREFIX + data.len();
    let padded = raw.div_ceil(PAD_BLOCK_SIZE) * PAD_BLOCK_SIZE;

    let mut out = vec![0u8; padded];
    out[..LEN_PREFIX].copy_from_slice(&(data.len() as u32).to_be_bytes());
    out[LEN_PREFIX..LEN_PREFIX + data.len()].copy_from_slice(data);
    Ok(out)
}

/// Strip the length prefix and padding. Fails closed on any bound violation.
fn unpad(padded: &[u8]) -> Result<Vec<u8>> {
    if padded.len() < LEN_PREFIX {
        return Err(Error::DecryptionFailed);
    }
    let mut len_bytes = [0u8; LEN_PREFIX];
    len_bytes.copy_from_slice(&padded[..LEN_PREFIX]);
    let len = u32::from_be_bytes(len_bytes) as usize;

    if len > padded.len() - LEN_PREFIX {
        return Err(Error::DecryptionFailed);
    }
    Ok(padded[LEN_PREFIX..LEN_PREFIX + len].to_vec())
}

/// Encrypt a CRDT update (or any blob) under a 32-byte key.
///
/// Pads the plaintext, prepends a fresh random 24-byte nonce, and applies
/// XSalsa20-Poly1305. Fails only on a bad key length.
pub fn encrypt_update(data: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    let cipher = XSalsa20Poly1305::new_from_slice(key)
        .map_err(|_| Error::InvalidKey(format!("Key must be {} bytes", KEY_SIZE)))?;

    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let padded = pad(data)?;
    let ciphertext = cipher
        .encrypt(SecretboxNonce::from_slice(&nonce), padded.as_slice())
        .map_err(|_| Error::EncryptionFailed("secretbox encryption failed".into()))?;

    let mut blob = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

/// Decrypt a blob produced by [`encrypt_update`].
///
/// Extracts the nonce, verifies the MAC, reads the length prefix and
/// returns the original bytes. Any integrity or length failure yields
/// `Error::DecryptionFailed` — no panic, no partial data.
pub fn decrypt_update(blob: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    let cipher =
        XSalsa20Poly1305::new_from_slice(key).map_err(|_| Error::DecryptionFailed)?;

    if blob.len() < NONCE_SIZE + TAG_SIZE {
        return Err(Error::DecryptionFailed);
    }
    let (nonce, ciphertext) = blob.split_at(NONCE_SIZE);

    let padded = cipher
        .decrypt(SecretboxNonce::from_slice(nonce), ciphertext)
        .map_err(|_| Error::DecryptionFailed)?;

    unpad(&padded)
}

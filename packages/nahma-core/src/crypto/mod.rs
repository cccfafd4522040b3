//! # Cryptography Module
//!
//! All cryptographic primitives used by Nahma Core.
//!
//! ## Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  Recovery Phrase (BIP39, 24 words, 256 bits of entropy)        │
//! │                          │                                      │
//! │                          ▼                                      │
//! │  Master Seed (32 bytes) ──► Ed25519 signing keypair            │
//! │                                                                 │
//! │  Passphrase ──► Argon2id key tree (see crate::kdf)             │
//! │     workspace key ──► folder key ──► document key              │
//! │                                                                 │
//! │  Update encryption: XSalsa20-Poly1305 secretbox                │
//! │     nonce(24) ‖ box( len_be32 ‖ data ‖ zero pad to 4096 )      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Algorithm Choices & Rationale
//!
//! | Algorithm | Purpose | Why Chosen |
//! |-----------|---------|------------|
//! | Ed25519 | Signing | Fast, small keys, widely audited |
//! | XSalsa20-Poly1305 | Encryption | Large random nonces, AEAD |
//! | Argon2id | Key Derivation | Memory-hard, resists GPU cracking |
//! | BIP39 | Recovery Phrase | User-friendly backup, standard |
//!
//! ## Security Considerations
//!
//! 1. **Key Zeroization**: Secret keys are zeroized when dropped
//! 2. **Secure Random**: `rand::rngs::OsRng` for all key/nonce material
//! 3. **No Nonce Reuse**: A fresh 24-byte random nonce per encryption
//! 4. **Length Hiding**: Plaintexts are padded to a 4096-byte block before
//!    encryption, so all small updates produce equal-length ciphertexts

mod encryption;
mod keys;
mod signing;

pub use encryption::{
    decrypt_update, encrypt_update, CIPHERTEXT_OVERHEAD, KEY_SIZE, NONCE_SIZE, PAD_BLOCK_SIZE,
};
pub use keys::{generate_key, SigningKeyPair};
pub use signing::{sign, verify, Signature, SIGNATURE_SIZE};

/// Size of public keys in bytes
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Size of secret (keypair) keys in bytes
pub const SECRET_KEY_SIZE: usize = 64;

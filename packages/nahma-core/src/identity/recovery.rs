//! # Recovery Phrase (BIP39)
//!
//! BIP39 mnemonic phrases for identity backup and recovery: 24 words encode
//! 256 bits of entropy plus an 8-bit checksum; PBKDF2-HMAC-SHA512 turns the
//! phrase into a seed, of which the first 32 bytes become the master seed
//! for the signing keypair.
//!
//! ## Security Considerations
//!
//! | Aspect | Measure |
//! |--------|---------|
//! | Entropy | 256 bits from the OS CSPRNG |
//! | Checksum | 8 bits prevents typos |
//! | Storage | The phrase is shown once and written down, never logged |

use bip39::{Language, Mnemonic};
use rand::RngCore;
use zeroize::ZeroizeOnDrop;

use crate::error::{Error, Result};

/// Number of words in a recovery phrase
pub const WORD_COUNT: usize = 24;

/// Entropy size in bytes for 24 words (256 bits)
const ENTROPY_BYTES: usize = 32;

/// A BIP39 recovery phrase for identity backup
///
/// ## Security Warning
///
/// This phrase can fully recover the user's identity. It is shown to the
/// user exactly once and must never be logged or stored in plaintext
/// outside the encrypted identity envelope.
#[derive(ZeroizeOnDrop)]
pub struct RecoveryPhrase {
    #[zeroize(skip)] // bip39::Mnemonic doesn't implement Zeroize
    mnemonic: Mnemonic,
}

impl RecoveryPhrase {
    /// Generate a new random recovery phrase (256 bits of entropy, 24 words).
    pub fn generate() -> Result<Self> {
        let mut entropy = [0u8; ENTROPY_BYTES];
        rand::rngs::OsRng.fill_bytes(&mut entropy);

        let mnemonic = Mnemonic::from_entropy(&entropy).map_err(|e| {
            Error::KeyDerivationFailed(format!("Failed to generate mnemonic: {}", e))
        })?;

        Ok(Self { mnemonic })
    }

    /// Parse a recovery phrase. Must be exactly 24 wordlist words with a
    /// valid checksum.
    pub fn from_phrase(phrase: &str) -> Result<Self> {
        let mnemonic = Mnemonic::parse_normalized(phrase)
            .map_err(|e| Error::InvalidRecoveryPhrase(format!("{}", e)))?;

        if mnemonic.word_count() != WORD_COUNT {
            return Err(Error::InvalidRecoveryPhrase(format!(
                "Expected {} words, got {}",
                WORD_COUNT,
                mnemonic.word_count()
            )));
        }

        Ok(Self { mnemonic })
    }

    /// Get the words as a vector.
    pub fn words(&self) -> Vec<&'static str> {
        self.mnemonic.words().collect()
    }

    /// The phrase as a single space-separated string. Display-to-user only.
    pub fn phrase(&self) -> String {
        self.mnemonic.to_string()
    }

    /// Derive the 32-byte master seed (standard BIP39, empty passphrase).
    pub fn to_seed(&self) -> [u8; 32] {
        let seed_bytes = self.mnemonic.to_seed("");
        let mut master_seed = [0u8; 32];
        master_seed.copy_from_slice(&seed_bytes[..32]);
        master_seed
    }

    /// Validate a phrase without constructing one. Useful for UI validation.
    pub fn validate(phrase: &str) -> Result<()> {
        Self::from_phrase(phrase)?;
        Ok(())
    }

    /// Check if a single word is in the BIP39 wordlist.
    pub fn is_valid_word(word: &str) -> bool {
        let word_lower = word.to_lowercase();
        Language::English
            .word_list()
            .iter()
            .any(|w| *w == word_lower)
    }

    /// Wordlist entries starting with `prefix`, capped at 10, for
    /// autocomplete during recovery entry.
    pub fn suggest_words(prefix: &str) -> Vec<&'static str> {
        if prefix.is_empty() {
            return vec![];
        }

        let prefix_lower = prefix.to_lowercase();
        let mut suggestions = Vec::new();

        for word in Language::English.word_list().iter() {
            if word.starts_with(&prefix_lower) {
                suggestions.push(*word);
                if suggestions.len() >= 10 {
                    break;
                }
            }
        }

        suggestions
    }
}

// Prevent accidental logging
impl std::fmt::Debug for RecoveryPhrase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RecoveryPhrase([REDACTED])")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_recovery_phrase() {
        let phrase = RecoveryPhrase::generate().unwrap();
        assert_eq!(phrase.words().len(), 24);
    }

    #[test]
    fn test_parse_valid_phrase() {
        // A valid BIP39 test vector (DO NOT USE FOR REAL!)
        let test_phrase = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon art";

        let phrase = RecoveryPhrase::from_phrase(test_phrase).unwrap();
        assert_eq!(phrase.words().len(), 24);
    }

    #[test]
    fn test_parse_invalid_word() {
        let invalid = "notaword abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon art";
        assert!(RecoveryPhrase::from_phrase(invalid).is_err());
    }

    #[test]
    fn test_parse_wrong_word_count() {
        assert!(RecoveryPhrase::from_phrase("abandon abandon abandon").is_err());
    }

    #[test]
    fn test_seed_derivation_deterministic() {
        let phrase = RecoveryPhrase::generate().unwrap();
        assert_eq!(phrase.to_seed(), phrase.to_seed());
    }

    #[test]
    fn test_different_phrases_different_seeds() {
        let a = RecoveryPhrase::generate().unwrap();
        let b = RecoveryPhrase::generate().unwrap();
        assert_ne!(a.to_seed(), b.to_seed());
    }

    #[test]
    fn test_is_valid_word() {
        assert!(RecoveryPhrase::is_valid_word("abandon"));
        assert!(RecoveryPhrase::is_valid_word("zoo"));
        assert!(!RecoveryPhrase::is_valid_word("notaword"));
    }

    #[test]
    fn test_suggest_words() {
        let suggestions = RecoveryPhrase::suggest_words("ab");
        assert!(suggestions.contains(&"abandon"));
        assert!(suggestions.contains(&"ability"));
        assert!(RecoveryPhrase::suggest_words("").is_empty());
    }

    #[test]
    fn test_debug_redacts() {
        let phrase = RecoveryPhrase::generate().unwrap();
        let debug = format!("{:?}", phrase);
        assert!(debug.contains("REDACTED"));
    }
}

//! Per-document storage keys.
//!
//! The update log is encrypted at rest under a key derived per document
//! from the sidecar's 32-byte storage master secret, using the document
//! step of the key derivation tree. Derivation is memory-hard, so results
//! are cached for the process lifetime.

use dashmap::DashMap;

use nahma_core::kdf;
use nahma_core::Result;

pub struct DocKeyring {
    master: [u8; 32],
    cache: DashMap<String, [u8; 32]>,
}

impl DocKeyring {
    pub fn new(master: [u8; 32]) -> Self {
        Self {
            master,
            cache: DashMap::new(),
        }
    }

    /// The storage key for a document, derived once and cached.
    pub fn document_key(&self, doc_id: &str) -> Result<[u8; 32]> {
        if let Some(key) = self.cache.get(doc_id) {
            return Ok(*key);
        }
        let key = kdf::storage_document_key(&self.master, doc_id)?;
        self.cache.insert(doc_id.to_string(), key);
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_stable_and_distinct() {
        let keyring = DocKeyring::new([3u8; 32]);

        let a1 = keyring.document_key("d-1").unwrap();
        let a2 = keyring.document_key("d-1").unwrap();
        let b = keyring.document_key("d-2").unwrap();

        assert_eq!(a1, a2);
        assert_ne!(a1, b);
    }

    #[test]
    fn test_different_masters_different_keys() {
        let a = DocKeyring::new([1u8; 32]).document_key("d-1").unwrap();
        let b = DocKeyring::new([2u8; 32]).document_key("d-1").unwrap();
        assert_ne!(a, b);
    }
}

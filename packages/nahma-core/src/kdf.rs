//! # Key Derivation Tree
//!
//! Deterministic, memory-hard derivation of the workspace key hierarchy
//! from a user passphrase.
//!
//! ## Derivation Tree
//!
//! ```text
//! passphrase
//!     │
//!     ├──► workspace_key = KDF("workspace" ‖ passphrase ‖ workspaceId)
//!     │          │
//!     │          └──► folder_key = KDF("folder" ‖ parent_key ‖ folderId)
//!     │                    │            (chained per nesting level)
//!     │                    └──► document_key = KDF("document" ‖ folder_key ‖ documentId)
//!     │
//!     └──► topic_hash = hex( KDF("topic" ‖ passphrase ‖ documentId) )
//! ```
//!
//! All intermediate outputs are 32 bytes. The KDF is Argon2id with
//! parameters fixed at build time; context strings give cryptographic
//! domain separation so keys derived for different purposes are
//! independent even from the same input material.
//!
//! The topic hash binds passphrase + document without revealing either:
//! it names a rendezvous channel in the relay plane.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use argon2::{Algorithm, Argon2, Params, Version};
use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::{Error, Result};

/// Domain separation contexts for the derivation tree.
pub mod domain {
    /// passphrase → workspace key
    pub const WORKSPACE: &str = "workspace";

    /// parent key → folder key
    pub const FOLDER: &str = "folder";

    /// folder key → document key
    pub const DOCUMENT: &str = "document";

    /// passphrase → relay topic hash
    pub const TOPIC: &str = "topic";

    /// passphrase → identity envelope key
    pub const IDENTITY: &str = "identity";

    /// password → identity export envelope key
    pub const IDENTITY_EXPORT: &str = "identity-export";
}

/// Argon2id memory cost in KiB. Fixed at build time.
const ARGON_M_COST: u32 = 19_456;

/// Argon2id iteration count. Fixed at build time.
const ARGON_T_COST: u32 = 2;

/// Argon2id parallelism. Fixed at build time.
const ARGON_P_COST: u32 = 1;

/// Core derivation: `KDF(context ‖ secret ‖ id) → 32 bytes`.
///
/// The salt is `SHA-256(context ‖ 0x00 ‖ id)` so the (context, id) pair is
/// bound into the derivation; the secret is the Argon2 password input.
/// Deterministic: identical inputs always produce identical output.
pub fn kdf(context: &str, secret: &[u8], id: &str) -> Result<[u8; 32]> {
    let params = Params::new(ARGON_M_COST, ARGON_T_COST, ARGON_P_COST, Some(32))
        .map_err(|e| Error::KeyDerivationFailed(format!("Bad Argon2 params: {}", e)))?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut hasher = Sha256::new();
    hasher.update(context.as_bytes());
    hasher.update([0u8]);
    hasher.update(id.as_bytes());
    let salt = hasher.finalize();

    let mut out = [0u8; 32];
    argon
        .hash_password_into(secret, &salt, &mut out)
        .map_err(|e| Error::KeyDerivationFailed(format!("Argon2 failed: {}", e)))?;
    Ok(out)
}

/// Derive the workspace key from the user passphrase.
pub fn workspace_key(passphrase: &str, workspace_id: &str) -> Result<[u8; 32]> {
    kdf(domain::WORKSPACE, passphrase.as_bytes(), workspace_id)
}

/// Derive a folder key from its parent key (workspace key or parent folder key).
pub fn folder_key(parent_key: &[u8; 32], folder_id: &str) -> Result<[u8; 32]> {
    kdf(domain::FOLDER, parent_key, folder_id)
}

/// Derive a document key from its containing folder's key.
pub fn document_key(folder_key: &[u8; 32], document_id: &str) -> Result<[u8; 32]> {
    kdf(domain::DOCUMENT, folder_key, document_id)
}

/// Derive the relay topic hash for a document: lowercase hex of 32 bytes.
pub fn topic_hash(passphrase: &str, document_id: &str) -> Result<String> {
    let bytes = kdf(domain::TOPIC, passphrase.as_bytes(), document_id)?;
    Ok(hex::encode(bytes))
}

/// Input path for [`derive_key_chain`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyChainRequest {
    pub workspace_id: String,
    /// Folder ids from the workspace root downwards.
    pub folder_path: Vec<String>,
    pub document_id: Option<String>,
}

/// All intermediate keys for a path through the tree.
#[derive(Clone)]
pub struct KeyChain {
    pub workspace_key: [u8; 32],
    /// One key per folder in the request path, outermost first.
    pub folder_keys: Vec<[u8; 32]>,
    pub document_key: Option<[u8; 32]>,
}

/// Derive every key along a workspace → folder… → document path in one call.
///
/// Fails with [`Error::DocumentWithoutFolder`] if a document id is given but
/// the folder path is empty: document keys chain off a folder key, never
/// directly off the workspace key.
pub fn derive_key_chain(password: &str, request: &KeyChainRequest) -> Result<KeyChain> {
    if request.document_id.is_some() && request.folder_path.is_empty() {
        return Err(Error::DocumentWithoutFolder);
    }

    let ws_key = workspace_key(password, &request.workspace_id)?;

    let mut folder_keys = Vec::with_capacity(request.folder_path.len());
    let mut parent = ws_key;
    for folder_id in &request.folder_path {
        let key = folder_key(&parent, folder_id)?;
        folder_keys.push(key);
        parent = key;
    }

    let document_key = match &request.document_id {
        Some(doc_id) => Some(document_key(&parent, doc_id)?),
        None => None,
    };

    Ok(KeyChain {
        workspace_key: ws_key,
        folder_keys,
        document_key,
    })
}

// ── Derivation cache ──────────────────────────────────────────────────────────

/// Default cache capacity.
const CACHE_CAPACITY: usize = 64;

/// Cached entries expire after this long.
const CACHE_TTL: Duration = Duration::from_secs(600);

/// Cache key: (SHA-256 of the password, serialized path). The password never
/// sits in the cache in the clear.
type CacheKey = ([u8; 32], String);

struct CacheEntry {
    chain: KeyChain,
    inserted_at: Instant,
}

/// Bounded, TTL-evicting cache over [`derive_key_chain`].
///
/// Argon2id is deliberately slow; interactive clients re-request the same
/// chains constantly, so recent derivations are kept hot.
pub struct KdfCache {
    inner: Mutex<LruCache<CacheKey, CacheEntry>>,
    ttl: Duration,
}

impl KdfCache {
    pub fn new() -> Self {
        Self::with_capacity(CACHE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is non-zero");
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            ttl: CACHE_TTL,
        }
    }

    #[cfg(test)]
    fn with_ttl(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is non-zero");
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    fn cache_key(password: &str, request: &KeyChainRequest) -> CacheKey {
        let password_hash: [u8; 32] = Sha256::digest(password.as_bytes()).into();

        let mut path = String::new();
        path.push_str(&request.workspace_id);
        for folder_id in &request.folder_path {
            path.push('/');
            path.push_str(folder_id);
        }
        if let Some(doc_id) = &request.document_id {
            path.push('#');
            path.push_str(doc_id);
        }

        (password_hash, path)
    }

    /// Derive a chain, serving from cache when a fresh entry exists.
    pub fn derive(&self, password: &str, request: &KeyChainRequest) -> Result<KeyChain> {
        let key = Self::cache_key(password, request);

        {
            let mut cache = self.inner.lock();
            if let Some(entry) = cache.get(&key) {
                if entry.inserted_at.elapsed() < self.ttl {
                    return Ok(entry.chain.clone());
                }
                cache.pop(&key);
            }
        }

        let chain = derive_key_chain(password, request)?;

        let mut cache = self.inner.lock();
        cache.put(
            key,
            CacheEntry {
                chain: chain.clone(),
                inserted_at: Instant::now(),
            },
        );
        Ok(chain)
    }

    /// Number of live entries (expired entries may still be counted until
    /// their next lookup).
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl Default for KdfCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Derive a per-document storage key from a raw 32-byte master secret.
///
/// The sidecar uses this for the at-rest encryption of the update log; it
/// reuses the document derivation step of the tree with the master secret
/// standing in for the folder key.
pub fn storage_document_key(master: &[u8; 32], document_id: &str) -> Result<[u8; 32]> {
    let secret = Zeroizing::new(*master);
    kdf(domain::DOCUMENT, secret.as_slice(), document_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(doc: Option<&str>, folders: &[&str]) -> KeyChainRequest {
        KeyChainRequest {
            workspace_id: "ws-1".to_string(),
            folder_path: folders.iter().map(|s| s.to_string()).collect(),
            document_id: doc.map(|s| s.to_string()),
        }
    }

    #[test]
    fn test_kdf_deterministic() {
        let a = kdf("workspace", b"hunter2", "ws-1").unwrap();
        let b = kdf("workspace", b"hunter2", "ws-1").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_kdf_domain_separation() {
        let a = kdf("workspace", b"hunter2", "id").unwrap();
        let b = kdf("folder", b"hunter2", "id").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_kdf_different_ids_different_keys() {
        let a = kdf("workspace", b"hunter2", "ws-1").unwrap();
        let b = kdf("workspace", b"hunter2", "ws-2").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_derive_key_chain_full_path() {
        let chain = derive_key_chain("hunter2", &request(Some("doc-1"), &["f1", "f2"])).unwrap();

        assert_eq!(chain.folder_keys.len(), 2);
        assert!(chain.document_key.is_some());

        // Each level chains off the previous one
        let ws = workspace_key("hunter2", "ws-1").unwrap();
        let f1 = folder_key(&ws, "f1").unwrap();
        let f2 = folder_key(&f1, "f2").unwrap();
        let doc = document_key(&f2, "doc-1").unwrap();

        assert_eq!(chain.workspace_key, ws);
        assert_eq!(chain.folder_keys, vec![f1, f2]);
        assert_eq!(chain.document_key, Some(doc));
    }

    #[test]
    fn test_derive_key_chain_deterministic() {
        let req = request(Some("doc-1"), &["f1"]);
        let a = derive_key_chain("hunter2", &req).unwrap();
        let b = derive_key_chain("hunter2", &req).unwrap();

        assert_eq!(a.workspace_key, b.workspace_key);
        assert_eq!(a.folder_keys, b.folder_keys);
        assert_eq!(a.document_key, b.document_key);
    }

    #[test]
    fn test_document_without_folder_rejected() {
        let result = derive_key_chain("hunter2", &request(Some("doc-1"), &[]));
        assert!(matches!(result, Err(Error::DocumentWithoutFolder)));
    }

    #[test]
    fn test_workspace_only_chain() {
        let chain = derive_key_chain("hunter2", &request(None, &[])).unwrap();
        assert!(chain.folder_keys.is_empty());
        assert!(chain.document_key.is_none());
    }

    #[test]
    fn test_topic_hash_is_hex_64() {
        let topic = topic_hash("hunter2", "doc-1").unwrap();
        assert_eq!(topic.len(), 64);
        assert!(topic.chars().all(|c| c.is_ascii_hexdigit()));

        // Bound to both inputs
        assert_ne!(topic, topic_hash("hunter2", "doc-2").unwrap());
        assert_ne!(topic, topic_hash("other", "doc-1").unwrap());
    }

    #[test]
    fn test_cache_hit_returns_same_chain() {
        let cache = KdfCache::new();
        let req = request(None, &["f1"]);

        let a = cache.derive("hunter2", &req).unwrap();
        let b = cache.derive("hunter2", &req).unwrap();
        assert_eq!(a.workspace_key, b.workspace_key);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_cache_distinguishes_passwords() {
        let cache = KdfCache::new();
        let req = request(None, &[]);

        let a = cache.derive("hunter2", &req).unwrap();
        let b = cache.derive("hunter3", &req).unwrap();
        assert_ne!(a.workspace_key, b.workspace_key);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_cache_bounded() {
        let cache = KdfCache::with_capacity(2);
        cache.derive("p", &request(None, &["a"])).unwrap();
        cache.derive("p", &request(None, &["b"])).unwrap();
        cache.derive("p", &request(None, &["c"])).unwrap();
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_cache_ttl_expiry() {
        let cache = KdfCache::with_ttl(8, Duration::from_millis(0));
        let req = request(None, &[]);

        // Zero TTL: the entry is already stale on the second lookup, so the
        // chain is re-derived; determinism keeps the result identical.
        let a = cache.derive("hunter2", &req).unwrap();
        let b = cache.derive("hunter2", &req).unwrap();
        assert_eq!(a.workspace_key, b.workspace_key);
    }

    #[test]
    fn test_storage_document_key_deterministic() {
        let master = [9u8; 32];
        let a = storage_document_key(&master, "doc-1").unwrap();
        let b = storage_document_key(&master, "doc-1").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, storage_document_key(&master, "doc-2").unwrap());
    }
}

//! # Identity Store
//!
//! Encrypted-at-rest persistence for the identity blob.
//!
//! ## On-disk format
//!
//! `${NAHMA_STORAGE_DIR}/identity.json` (default `${HOME}/.nahma/`):
//!
//! ```json
//! { "version": 1, "encrypted": "<base64(nonce ‖ secretbox)>" }
//! ```
//!
//! The envelope key is `KDF("identity" ‖ passphrase ‖ "identity-store")`.
//! Inside the box is a JSON document carrying the mnemonic and display
//! metadata; the keypair is never persisted directly, it is regenerated
//! from the mnemonic on every load. A wrong passphrase fails the MAC and
//! surfaces as [`Error::WrongPassword`] — never partial identity.
//!
//! [`export`](IdentityStore::export) produces the same envelope shape under
//! a caller-supplied password, suitable for moving an identity to another
//! device; [`import`](IdentityStore::import) regenerates the keypair and
//! attaches a fresh current-device entry.

use std::path::{Path, PathBuf};

use base64::Engine;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::crypto::{decrypt_update, encrypt_update};
use crate::error::{Error, Result};
use crate::identity::{DeviceRecord, Identity, RecoveryPhrase};
use crate::kdf;

/// Current identity envelope version.
const ENVELOPE_VERSION: u32 = 1;

/// File name under the storage dir.
const IDENTITY_FILE: &str = "identity.json";

/// The encrypted envelope as written to disk and produced by `export`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    pub version: u32,
    /// base64 of `nonce ‖ secretbox(payload)`
    pub encrypted: String,
}

/// The plaintext identity document inside the envelope.
#[derive(Serialize, Deserialize)]
struct IdentityDoc {
    mnemonic: String,
    handle: String,
    color: Option<String>,
    icon: Option<String>,
    created_at: i64,
    devices: Vec<DeviceRecord>,
}

/// The plaintext export payload: mnemonic + display metadata only. The
/// importing device builds its own device entry.
#[derive(Serialize, Deserialize)]
struct ExportDoc {
    mnemonic: String,
    handle: String,
    color: Option<String>,
    icon: Option<String>,
    created_at: i64,
}

/// Fields a caller may change on a stored identity.
///
/// Anything not listed here — the keypair, the mnemonic, `created_at` — is
/// structurally impossible to overwrite through `update`, so a caller
/// mistake can never clobber secret material.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityUpdate {
    pub handle: Option<String>,
    pub color: Option<String>,
    pub icon: Option<String>,
    pub devices: Option<Vec<DeviceRecord>>,
}

/// File-backed identity store.
pub struct IdentityStore {
    dir: PathBuf,
}

impl IdentityStore {
    /// Store rooted at the given directory (created lazily on first write).
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Store at the platform default, `${HOME}/.nahma`.
    pub fn default_location() -> Result<Self> {
        let home = std::env::var("HOME")
            .map_err(|_| Error::StorageIo("HOME is not set".to_string()))?;
        Ok(Self::new(PathBuf::from(home).join(".nahma")))
    }

    fn identity_path(&self) -> PathBuf {
        self.dir.join(IDENTITY_FILE)
    }

    /// Whether an identity blob exists on disk.
    pub fn has(&self) -> bool {
        self.identity_path().is_file()
    }

    /// Create a brand-new identity and persist it under `passphrase`.
    pub fn create(&self, passphrase: &str, handle: &str, platform: &str) -> Result<Identity> {
        if self.has() {
            return Err(Error::IdentityExists);
        }
        let identity = Identity::create(handle.to_string(), platform)?;
        self.store(&identity, passphrase)?;
        Ok(identity)
    }

    /// Persist an identity, replacing any existing blob.
    pub fn store(&self, identity: &Identity, passphrase: &str) -> Result<()> {
        let doc = IdentityDoc {
            mnemonic: identity.recovery_phrase().phrase(),
            handle: identity.handle.clone(),
            color: identity.color.clone(),
            icon: identity.icon.clone(),
            created_at: identity.created_at,
            devices: identity.devices.clone(),
        };

        let envelope = seal(
            &doc,
            kdf::domain::IDENTITY,
            passphrase,
            "identity-store",
        )?;

        std::fs::create_dir_all(&self.dir)?;
        let json = serde_json::to_string_pretty(&envelope)
            .map_err(|e| Error::StorageIo(format!("Failed to encode envelope: {}", e)))?;
        std::fs::write(self.identity_path(), json)?;
        Ok(())
    }

    /// Load and decrypt the identity.
    pub fn load(&self, passphrase: &str) -> Result<Identity> {
        let raw = match std::fs::read_to_string(self.identity_path()) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NoIdentity)
            }
            Err(e) => return Err(e.into()),
        };

        let envelope: EncryptedEnvelope = serde_json::from_str(&raw)
            .map_err(|e| Error::StorageIo(format!("Corrupt identity envelope: {}", e)))?;

        let doc: IdentityDoc = open(
            &envelope,
            kdf::domain::IDENTITY,
            passphrase,
            "identity-store",
        )?;

        let phrase = RecoveryPhrase::from_phrase(&doc.mnemonic)?;
        let mut identity = Identity::from_recovery_phrase(phrase, doc.handle)?;
        identity.color = doc.color;
        identity.icon = doc.icon;
        identity.created_at = doc.created_at;
        identity.devices = doc.devices;
        identity.touch_current_device();
        Ok(identity)
    }

    /// Apply an update to the stored identity. Only `{handle, color, icon,
    /// devices}` can change.
    pub fn update(&self, passphrase: &str, update: IdentityUpdate) -> Result<Identity> {
        let mut identity = self.load(passphrase)?;

        if let Some(handle) = update.handle {
            identity.handle = handle;
        }
        if let Some(color) = update.color {
            identity.color = Some(color);
        }
        if let Some(icon) = update.icon {
            identity.icon = Some(icon);
        }
        if let Some(devices) = update.devices {
            identity.devices = devices;
        }

        self.store(&identity, passphrase)?;
        Ok(identity)
    }

    /// Delete the identity blob. Returns whether anything was removed.
    pub fn delete(&self) -> Result<bool> {
        match std::fs::remove_file(self.identity_path()) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Export the identity under a (possibly different) password.
    pub fn export(&self, passphrase: &str, export_password: &str) -> Result<EncryptedEnvelope> {
        let identity = self.load(passphrase)?;

        let doc = ExportDoc {
            mnemonic: identity.recovery_phrase().phrase(),
            handle: identity.handle.clone(),
            color: identity.color.clone(),
            icon: identity.icon.clone(),
            created_at: identity.created_at,
        };

        seal(
            &doc,
            kdf::domain::IDENTITY_EXPORT,
            export_password,
            "identity-export",
        )
    }

    /// Import an exported envelope: regenerate the keypair from the
    /// mnemonic, attach a fresh current-device entry, and persist under
    /// `passphrase`.
    pub fn import(
        &self,
        envelope: &EncryptedEnvelope,
        export_password: &str,
        passphrase: &str,
        platform: &str,
    ) -> Result<Identity> {
        let doc: ExportDoc = open(
            envelope,
            kdf::domain::IDENTITY_EXPORT,
            export_password,
            "identity-export",
        )?;

        let phrase = RecoveryPhrase::from_phrase(&doc.mnemonic)?;
        let mut identity = Identity::from_recovery_phrase(phrase, doc.handle)?;
        identity.color = doc.color;
        identity.icon = doc.icon;
        identity.created_at = doc.created_at;
        identity.attach_new_device(platform);

        self.store(&identity, passphrase)?;
        Ok(identity)
    }
}

/// Encrypt a serializable payload into an envelope.
fn seal<T: Serialize>(
    payload: &T,
    context: &str,
    password: &str,
    key_id: &str,
) -> Result<EncryptedEnvelope> {
    let key = Zeroizing::new(kdf::kdf(context, password.as_bytes(), key_id)?);
    let plaintext = Zeroizing::new(
        serde_json::to_vec(payload)
            .map_err(|e| Error::EncryptionFailed(format!("Failed to encode payload: {}", e)))?,
    );
    let blob = encrypt_update(&plaintext, key.as_slice())?;

    Ok(EncryptedEnvelope {
        version: ENVELOPE_VERSION,
        encrypted: base64::engine::general_purpose::STANDARD.encode(blob),
    })
}

/// Decrypt an envelope. MAC failures map to `WrongPassword`.
fn open<T: for<'de> Deserialize<'de>>(
    envelope: &EncryptedEnvelope,
    context: &str,
    password: &str,
    key_id: &str,
) -> Result<T> {
    if envelope.version != ENVELOPE_VERSION {
        return Err(Error::UnsupportedVersion(envelope.version));
    }

    let blob = base64::engine::general_purpose::STANDARD
        .decode(&envelope.encrypted)
        .map_err(|_| Error::WrongPassword)?;

    let key = Zeroizing::new(kdf::kdf(context, password.as_bytes(), key_id)?);
    let plaintext = Zeroizing::new(
        decrypt_update(&blob, key.as_slice()).map_err(|_| Error::WrongPassword)?,
    );

    serde_json::from_slice(&plaintext).map_err(|_| Error::WrongPassword)
}

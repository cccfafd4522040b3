//! # Identity Module
//!
//! User identity: an Ed25519 signing keypair derived deterministically from
//! a BIP39 recovery phrase, plus user-visible metadata (handle, color, icon)
//! and the list of known devices.
//!
//! The 32-byte public key, hex-encoded, is the user's wire identity — it is
//! the session key presented to the metadata broker and the subject of every
//! permission grant.
//!
//! At rest the identity lives encrypted under a user passphrase; see
//! [`store::IdentityStore`].

mod recovery;
pub mod store;

pub use recovery::{RecoveryPhrase, WORD_COUNT};
pub use store::{IdentityStore, IdentityUpdate};

use serde::{Deserialize, Serialize};
use zeroize::ZeroizeOnDrop;

use crate::crypto::SigningKeyPair;
use crate::error::Result;

/// A device that has loaded this identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceRecord {
    pub id: String,
    /// e.g. "desktop", "web", "ios", "android"
    pub platform: String,
    /// Unix millis of the last load on this device
    pub last_seen: i64,
    pub is_current: bool,
}

impl DeviceRecord {
    /// A fresh current-device entry for this platform.
    pub fn current(platform: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            platform: platform.to_string(),
            last_seen: crate::time::now_millis(),
            is_current: true,
        }
    }
}

/// A user's complete identity: keypair, recovery phrase, display metadata
/// and device list.
///
/// ## Security
///
/// Contains private key material and the mnemonic; zeroized on drop and
/// only held in memory while needed.
#[derive(ZeroizeOnDrop)]
pub struct Identity {
    #[zeroize(skip)]
    keypair: SigningKeyPair,

    #[zeroize(skip)]
    phrase: RecoveryPhrase,

    #[zeroize(skip)]
    pub handle: String,

    #[zeroize(skip)]
    pub color: Option<String>,

    #[zeroize(skip)]
    pub icon: Option<String>,

    pub created_at: i64,

    #[zeroize(skip)]
    pub devices: Vec<DeviceRecord>,
}

impl Identity {
    /// Create a new identity with a random recovery phrase on this device.
    ///
    /// The phrase should be shown to the user exactly once; it cannot be
    /// recovered later.
    pub fn create(handle: String, platform: &str) -> Result<Self> {
        let phrase = RecoveryPhrase::generate()?;
        let mut identity = Self::from_recovery_phrase(phrase, handle)?;
        identity.attach_new_device(platform);
        Ok(identity)
    }

    /// Restore an identity deterministically from a recovery phrase.
    ///
    /// The device list starts empty: callers either restore the persisted
    /// list (load) or attach a fresh current entry (create, import).
    pub fn from_recovery_phrase(phrase: RecoveryPhrase, handle: String) -> Result<Self> {
        let seed = phrase.to_seed();
        let keypair = SigningKeyPair::from_seed(&seed);

        Ok(Self {
            keypair,
            phrase,
            handle,
            color: None,
            icon: None,
            created_at: crate::time::now_millis(),
            devices: Vec::new(),
        })
    }

    /// The 32-byte public key.
    pub fn public_key(&self) -> [u8; 32] {
        self.keypair.public_bytes()
    }

    /// The hex wire identity.
    pub fn public_hex(&self) -> String {
        self.keypair.public_hex()
    }

    /// The signing keypair, for signing operations.
    pub fn keypair(&self) -> &SigningKeyPair {
        &self.keypair
    }

    /// The recovery phrase. Display/export only.
    pub fn recovery_phrase(&self) -> &RecoveryPhrase {
        &self.phrase
    }

    /// Bump `last_seen` on the current device.
    pub fn touch_current_device(&mut self) {
        let now = crate::time::now_millis();
        for device in &mut self.devices {
            if device.is_current {
                device.last_seen = now;
            }
        }
    }

    /// Demote all devices and append a fresh current entry. Called on
    /// create and on import to a new device.
    pub fn attach_new_device(&mut self, platform: &str) {
        for device in &mut self.devices {
            device.is_current = false;
        }
        self.devices.push(DeviceRecord::current(platform));
    }
}

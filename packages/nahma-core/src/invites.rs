//! # Invite Lifecycle
//!
//! Share links as bounded-use capability tokens.
//!
//! An invite names an entity, a permission level, and optional bounds
//! (`expires_at`, `max_uses`). Redemption validates the bounds, counts the
//! use, records the redeemer and applies a monotonic grant — all inside one
//! store transaction, so two racing redeemers cannot both take the last
//! use.
//!
//! ## Garbage collection
//!
//! Two sweeps keep the invite table clean:
//!
//! - **Tier 1 (hourly)** deletes invites whose declared `expires_at` has
//!   passed; invites with no expiry are untouched.
//! - **Tier 2 (every 6 h)** deletes every invite older than
//!   [`MAX_INVITE_AGE_MS`] regardless of `expires_at` — no invite outlives
//!   the nuclear age, even mis-issued ones.
//!
//! Both are idempotent: re-running with no clock advance deletes nothing.

use std::sync::Arc;

use rand::RngCore;

use crate::error::Result;
use crate::permissions::{EntityRef, PermissionChange, PermissionLevel};
use crate::storage::{InviteRecord, Store};

/// No invite outlives this (24 h in milliseconds).
pub const MAX_INVITE_AGE_MS: i64 = 24 * 60 * 60 * 1000;

/// Entropy of a token in bytes (hex-encoded on the wire).
const TOKEN_BYTES: usize = 24;

/// Optional bounds on a new invite.
#[derive(Debug, Clone, Default)]
pub struct InviteOptions {
    pub expires_at: Option<i64>,
    pub max_uses: Option<i64>,
}

/// What a successful redemption produced.
#[derive(Debug, Clone)]
pub struct RedeemOutcome {
    pub entity: EntityRef,
    pub permission: PermissionLevel,
    /// The grant applied to the redeemer (monotonic).
    pub change: PermissionChange,
    /// Whether this redemption consumed the final use.
    pub spent: bool,
}

/// Invite lifecycle service over the persistence store.
#[derive(Clone)]
pub struct InviteService {
    store: Arc<Store>,
}

impl InviteService {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Mint a new invite token for an entity.
    pub fn create(
        &self,
        entity: &EntityRef,
        permission: PermissionLevel,
        options: InviteOptions,
        now: i64,
    ) -> Result<InviteRecord> {
        let invite = InviteRecord {
            token: generate_token(),
            entity_type: entity.kind,
            entity_id: entity.id.clone(),
            permission,
            created_at: now,
            expires_at: options.expires_at,
            max_uses: options.max_uses,
            uses: 0,
            redeemed_by: vec![],
        };
        self.store.insert_invite(&invite)?;

        tracing::info!(
            entity_id = invite.entity_id.as_str(),
            permission = permission.as_str(),
            "Created invite"
        );
        Ok(invite)
    }

    /// Redeem a token for `user`. Validation, use counting and the
    /// monotonic grant happen atomically in the store.
    pub fn redeem(&self, user: &str, token: &str, now: i64) -> Result<RedeemOutcome> {
        let (invite, old, new) = self.store.redeem_invite(token, user, now)?;

        let spent = invite
            .max_uses
            .map(|max| invite.uses >= max)
            .unwrap_or(false);
        if spent {
            tracing::debug!(entity_id = invite.entity_id.as_str(), "Invite spent");
        }

        Ok(RedeemOutcome {
            entity: EntityRef {
                kind: invite.entity_type,
                id: invite.entity_id.clone(),
            },
            permission: invite.permission,
            change: PermissionChange {
                user_id: user.to_string(),
                entity_id: invite.entity_id,
                old_permission: old,
                new_permission: new,
            },
            spent,
        })
    }

    /// Immediately expire a token. Returns the redeemer set so the broker
    /// can emit `link-invalidated` to each open session relying on it.
    pub fn invalidate(&self, token: &str, now: i64) -> Result<Vec<String>> {
        let redeemers = self.store.invalidate_invite(token, now)?;
        tracing::info!(redeemers = redeemers.len(), "Invalidated invite");
        Ok(redeemers)
    }

    /// Tier-1 sweep. Returns the number of invites deleted.
    pub fn expired_sweep(&self, now: i64) -> Result<usize> {
        self.store.delete_expired_invites(now)
    }

    /// Tier-2 (nuclear) sweep. Returns the number of invites deleted.
    pub fn nuclear_sweep(&self, now: i64) -> Result<usize> {
        self.store.delete_invites_created_before(now - MAX_INVITE_AGE_MS)
    }
}

/// Unguessable token: 24 random bytes, hex.
fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn setup() -> InviteService {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.create_workspace("ws-1", "W", "owner", 0).unwrap();
        InviteService::new(store)
    }

    #[test]
    fn test_token_unguessable_shape() {
        let a = generate_token();
        let b = generate_token();
        assert_eq!(a.len(), TOKEN_BYTES * 2);
        assert_ne!(a, b);
    }

    #[test]
    fn test_share_link_redemption_scenario() {
        // Owner creates an editor invite with maxUses = 2; A and B redeem,
        // C is turned away.
        let service = setup();
        let ws = EntityRef::workspace("ws-1");

        let invite = service
            .create(
                &ws,
                PermissionLevel::Editor,
                InviteOptions {
                    expires_at: None,
                    max_uses: Some(2),
                },
                1_000,
            )
            .unwrap();

        let a = service.redeem("user-a", &invite.token, 1_100).unwrap();
        assert_eq!(a.change.new_permission, PermissionLevel::Editor);
        assert!(!a.spent);

        let b = service.redeem("user-b", &invite.token, 1_200).unwrap();
        assert_eq!(b.change.new_permission, PermissionLevel::Editor);
        assert!(b.spent);

        assert!(matches!(
            service.redeem("user-c", &invite.token, 1_300),
            Err(Error::InviteExpired)
        ));
    }

    #[test]
    fn test_redeem_is_monotonic_grant() {
        let service = setup();
        let ws = EntityRef::workspace("ws-1");

        let editor = service
            .create(&ws, PermissionLevel::Editor, InviteOptions::default(), 1_000)
            .unwrap();
        let viewer = service
            .create(&ws, PermissionLevel::Viewer, InviteOptions::default(), 1_000)
            .unwrap();

        service.redeem("alice", &editor.token, 1_100).unwrap();
        // Redeeming a weaker link later never downgrades
        let outcome = service.redeem("alice", &viewer.token, 1_200).unwrap();
        assert_eq!(outcome.change.old_permission, PermissionLevel::Editor);
        assert_eq!(outcome.change.new_permission, PermissionLevel::Editor);
    }

    #[test]
    fn test_invalidate_blocks_future_redemption() {
        let service = setup();
        let ws = EntityRef::workspace("ws-1");

        let invite = service
            .create(&ws, PermissionLevel::Viewer, InviteOptions::default(), 1_000)
            .unwrap();
        service.redeem("alice", &invite.token, 1_100).unwrap();

        let redeemers = service.invalidate(&invite.token, 1_200).unwrap();
        assert_eq!(redeemers, vec!["alice"]);

        assert!(matches!(
            service.redeem("bob", &invite.token, 1_300),
            Err(Error::InviteExpired)
        ));
    }

    #[test]
    fn test_tier2_collects_stale_invites() {
        // An invite with expiresAt = NULL, created 25h ago: tier 1 leaves
        // it alone, tier 2 deletes it.
        let service = setup();
        let ws = EntityRef::workspace("ws-1");

        let created_at = 0;
        service
            .create(&ws, PermissionLevel::Viewer, InviteOptions::default(), created_at)
            .unwrap();

        let now = 25 * 60 * 60 * 1000;
        assert_eq!(service.expired_sweep(now).unwrap(), 0);
        assert_eq!(service.nuclear_sweep(now).unwrap(), 1);
    }

    #[test]
    fn test_sweeps_idempotent_without_clock_advance() {
        let service = setup();
        let ws = EntityRef::workspace("ws-1");
        service
            .create(
                &ws,
                PermissionLevel::Viewer,
                InviteOptions {
                    expires_at: Some(500),
                    max_uses: None,
                },
                0,
            )
            .unwrap();

        let now = 1_000;
        assert_eq!(service.expired_sweep(now).unwrap(), 1);
        assert_eq!(service.expired_sweep(now).unwrap(), 0);
        assert_eq!(service.nuclear_sweep(now).unwrap(), 0);
        assert_eq!(service.nuclear_sweep(now).unwrap(), 0);
    }

    #[test]
    fn test_uses_never_exceed_max() {
        let service = setup();
        let ws = EntityRef::workspace("ws-1");
        let invite = service
            .create(
                &ws,
                PermissionLevel::Viewer,
                InviteOptions {
                    expires_at: None,
                    max_uses: Some(3),
                },
                0,
            )
            .unwrap();

        let mut successes = 0;
        for i in 0..10 {
            if service
                .redeem(&format!("user-{}", i), &invite.token, 100 + i)
                .is_ok()
            {
                successes += 1;
            }
        }
        assert_eq!(successes, 3);
    }
}

//! Per-session-key sliding window rate limiter.
//!
//! Applies to metadata operations only — CRDT update and awareness traffic
//! is never metered, so a noisy editor is not throttled mid-keystroke.

use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Default window length.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(10);

/// Default frames allowed per window.
pub const DEFAULT_LIMIT: usize = 120;

/// Sliding window rate limiter keyed by session key.
#[derive(Clone)]
pub struct RateLimiter {
    windows: DashMap<String, Vec<Instant>>,
    limit: usize,
    window: Duration,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_LIMIT, DEFAULT_WINDOW)
    }

    pub fn with_limits(limit: usize, window: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            limit,
            window,
        }
    }

    /// Record one frame from `session_key` and check it against the window.
    ///
    /// Returns `Ok(())` if allowed, or `Err(retry_after_secs)` once the cap
    /// is exceeded. The socket stays open either way; the caller only
    /// replies with a rate-limited error.
    pub fn check(&self, session_key: &str) -> Result<(), u64> {
        let now = Instant::now();
        let cutoff = now - self.window;

        let mut entry = self.windows.entry(session_key.to_string()).or_default();
        let timestamps = entry.value_mut();

        timestamps.retain(|t| *t >= cutoff);

        if timestamps.len() >= self.limit {
            let oldest = timestamps.first().copied().unwrap_or(now);
            let retry_after = (oldest + self.window).saturating_duration_since(now);
            return Err(retry_after.as_secs().max(1));
        }

        timestamps.push(now);
        Ok(())
    }

    /// Drop idle windows so the map doesn't grow with every session key
    /// ever seen.
    pub fn cleanup(&self) {
        let cutoff = Instant::now() - self.window;
        self.windows.retain(|_, timestamps| {
            timestamps.retain(|t| *t >= cutoff);
            !timestamps.is_empty()
        });
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

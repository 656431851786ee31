//! Per-identity connection throttling.
//!
//! Sliding window, in memory only: IPC is local and the ledger only has to
//! outlive the process's accept loop.

use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
    time::{Duration, Instant},
};

/// How often the whole ledger is swept for identities with no live attempts.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug)]
struct Ledger {
    attempts:     HashMap<String, Vec<Instant>>,
    last_cleanup: Instant,
}

/// Sliding-window admission control keyed by identity key.
///
/// ```
/// use std::time::Duration;
/// use warden_common::RateLimiter;
///
/// let limiter = RateLimiter::new(2, Duration::from_secs(60));
/// assert!(limiter.allow("1000"));
/// assert!(limiter.allow("1000"));
/// assert!(!limiter.allow("1000"));
/// assert!(limiter.allow("S-1-5-21-1-2-3-1001"));
/// ```
#[derive(Debug)]
pub struct RateLimiter {
    max_attempts:     usize,
    window:           Duration,
    cleanup_interval: Duration,
    ledger:           Mutex<Ledger>,
}

impl RateLimiter {
    /// Creates a limiter admitting `max_attempts` per `window` per identity.
    pub fn new(max_attempts: usize, window: Duration) -> Self {
        Self {
            max_attempts,
            window,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            ledger: Mutex::new(Ledger {
                attempts:     HashMap::new(),
                last_cleanup: Instant::now(),
            }),
        }
    }

    /// Overrides how often fully expired identities are swept.
    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Configured attempts per window.
    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Configured window length.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Records an attempt for `key` and reports whether it is admitted.
    ///
    /// A rejected attempt is not recorded, but still prunes the identity's
    /// expired timestamps.
    pub fn allow(&self, key: &str) -> bool {
        self.allow_at(key, Instant::now())
    }

    fn allow_at(&self, key: &str, now: Instant) -> bool {
        let mut ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
        let cutoff = now.checked_sub(self.window);
        let live = |t: &Instant| cutoff.map_or(true, |cutoff| *t > cutoff);

        if now.saturating_duration_since(ledger.last_cleanup) > self.cleanup_interval {
            let before = ledger.attempts.len();
            ledger.attempts.retain(|_, times| times.iter().any(live));
            ledger.last_cleanup = now;
            tracing::debug!(
                removed = before - ledger.attempts.len(),
                "swept expired rate limit entries"
            );
        }

        let pruned: Vec<Instant> = ledger
            .attempts
            .get(key)
            .map(|times| times.iter().copied().filter(live).collect())
            .unwrap_or_default();

        if pruned.len() >= self.max_attempts {
            ledger.attempts.insert(key.to_string(), pruned);
            return false;
        }

        let mut updated = pruned;
        updated.push(now);
        ledger.attempts.insert(key.to_string(), updated);
        true
    }

    /// Clears all state.
    pub fn reset(&self) {
        self.ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .attempts
            .clear();
    }

    /// Number of identities currently tracked.
    pub fn tracked_identities(&self) -> usize {
        self.ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .attempts
            .len()
    }
}

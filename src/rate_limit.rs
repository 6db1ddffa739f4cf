use crate::clock::SharedClock;
use crate::sweep::{spawn_periodic, SweepHandle};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
struct RateLimitEntry {
    count: u32,
    reset_at_ms: i64,
    last_request_ms: i64,
}

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateDecision {
    pub allowed: bool,
    /// Whole seconds until the current window resets. Only set when denied.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl RateDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            retry_after_secs: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitStats {
    pub active_identities: usize,
    pub total_requests: u64,
    /// Most recent admitted request across all live windows.
    pub latest_request_ms: Option<i64>,
}

/// Fixed-window, per-identity request limiter.
pub struct RateLimiter {
    entries: Mutex<HashMap<String, RateLimitEntry>>,
    clock: SharedClock,
}

impl RateLimiter {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Record a request for `identity` and decide whether it may proceed.
    pub fn check(&self, identity: &str, max_requests: u32, window: Duration) -> RateDecision {
        let now = self.clock.now_ms();
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(entry) = entries
            .get_mut(identity)
            .filter(|entry| now <= entry.reset_at_ms)
        {
            if entry.count >= max_requests {
                let remaining_ms = (entry.reset_at_ms - now).max(0) as u64;
                return RateDecision {
                    allowed: false,
                    retry_after_secs: Some(remaining_ms.div_ceil(1000)),
                };
            }
            entry.count += 1;
            entry.last_request_ms = now;
            return RateDecision::allow();
        }

        // First request, or the previous window has expired
        entries.insert(
            identity.to_string(),
            RateLimitEntry {
                count: 1,
                reset_at_ms: now + window.as_millis() as i64,
                last_request_ms: now,
            },
        );
        RateDecision::allow()
    }

    /// Drop entries whose window has expired. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_ms();
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = entries.len();
        entries.retain(|_, entry| now <= entry.reset_at_ms);
        before - entries.len()
    }

    pub fn reset_identity(&self, identity: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(identity);
        }
    }

    pub fn stats(&self) -> RateLimitStats {
        let entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        RateLimitStats {
            active_identities: entries.len(),
            total_requests: entries.values().map(|e| e.count as u64).sum(),
            latest_request_ms: entries.values().map(|e| e.last_request_ms).max(),
        }
    }

    /// Spawn the periodic sweep. The task stops when the handle is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> SweepHandle {
        let limiter = Arc::clone(self);
        spawn_periodic(Arc::clone(&self.clock), interval, move || {
            let removed = limiter.sweep();
            if removed > 0 {
                tracing::debug!(removed, "swept expired rate limit windows");
            }
            std::future::ready(())
        })
    }
}

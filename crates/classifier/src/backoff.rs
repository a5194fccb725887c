//! Best-effort strategy for upstreams that send no timing headers
//!
//! Resource-exhaustion failures (429, or a `RESOURCE_EXHAUSTED` status in the
//! message) carry no hint of when to retry, so each credential gets its own
//! exponential backoff: `min(2^attempts, cap)` seconds. Every rate-limit
//! classification bumps that credential's attempt count; its next success
//! resets it to zero.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tracing::debug;

use crate::upstream::UpstreamError;
use crate::{Classification, ErrorClassifier, ErrorKind, base_kind};

/// Messages that mean "rate limited" even when no 429 status is available
/// (e.g. errors surfaced through a gRPC-style client).
const EXHAUSTION_PATTERNS: &[&str] = &["resource_exhausted", "resource has been exhausted"];

pub struct BackoffClassifier {
    cap: Duration,
    default_cooldown: Duration,
    attempts: Mutex<HashMap<String, u32>>,
}

impl BackoffClassifier {
    pub fn new(cap: Duration, default_cooldown: Duration) -> Self {
        Self {
            cap,
            default_cooldown,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Current backoff exponent for a credential.
    pub fn multiplier(&self, key_id: &str) -> u32 {
        self.lock_attempts().get(key_id).copied().unwrap_or(0)
    }

    /// Compute the backoff for `key_id` and advance its exponent.
    fn next_backoff(&self, key_id: &str) -> Duration {
        let mut attempts = self.lock_attempts();
        let exponent = attempts.entry(key_id.to_string()).or_insert(0);
        let secs = 2u64
            .checked_pow(*exponent)
            .unwrap_or(u64::MAX)
            .min(self.cap.as_secs().max(1));
        *exponent = exponent.saturating_add(1);
        Duration::from_secs(secs)
    }

    fn lock_attempts(&self) -> std::sync::MutexGuard<'_, HashMap<String, u32>> {
        // A panic while holding this lock cannot leave the map inconsistent.
        self.attempts.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn is_exhaustion_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    EXHAUSTION_PATTERNS.iter().any(|pattern| lower.contains(pattern))
}

impl ErrorClassifier for BackoffClassifier {
    fn family(&self) -> &'static str {
        "backoff"
    }

    fn analyze(&self, key_id: &str, error: &dyn UpstreamError) -> Classification {
        let kind = match base_kind(error) {
            ErrorKind::NonRetryable if is_exhaustion_message(&error.to_string()) => {
                ErrorKind::RateLimit
            }
            kind => kind,
        };
        if kind != ErrorKind::RateLimit {
            return Classification::new(kind);
        }
        let backoff = self.next_backoff(key_id);
        debug!(key_id, backoff_secs = backoff.as_secs(), "resource exhausted, backing off");
        Classification::rate_limited(Some(backoff))
    }

    fn default_cooldown(&self) -> Duration {
        self.default_cooldown
    }

    fn on_success(&self, key_id: &str) {
        let mut attempts = self.lock_attempts();
        if let Some(exponent) = attempts.get_mut(key_id)
            && *exponent > 0
        {
            debug!(key_id, "success, backoff reset");
            *exponent = 0;
        }
    }
}

//! Timestamp-driven strategy: absolute reset time
//!
//! Upstreams in this family answer 429 with `x-ratelimit-reset`, an absolute
//! unix timestamp (seconds, optionally fractional; millisecond values are
//! detected by magnitude) at which the window reopens. The wait time is the
//! distance from now to that instant. `x-ratelimit-remaining` reports what is
//! left in the current window; a 429 while it is still positive means a burst
//! limit fired (spike-triggered) rather than the window running dry.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use reqwest::header::HeaderMap;
use tracing::{debug, warn};

use crate::upstream::{UpstreamError, header_f64, header_map_to_strings, header_u64};
use crate::{Classification, ErrorClassifier, ErrorKind, base_kind, cooldown_from_secs_f64};

/// Timestamps above this are taken to be milliseconds since the epoch.
const MILLIS_THRESHOLD: f64 = 100_000_000_000.0;

/// Shortest cooldown derived from a reset timestamp. A reset instant already in
/// the past still gets this much breathing room.
const MIN_WAIT: Duration = Duration::from_secs(1);

pub struct ResetTimestampClassifier {
    default_cooldown: Duration,
}

impl ResetTimestampClassifier {
    pub fn new(default_cooldown: Duration) -> Self {
        Self { default_cooldown }
    }

    fn classify_at(&self, key_id: &str, error: &dyn UpstreamError, now: SystemTime) -> Classification {
        match base_kind(error) {
            ErrorKind::RateLimit => {
                let headers = error.headers();
                if let Some(remaining) = headers.and_then(spike_remaining) {
                    warn!(
                        key_id,
                        remaining,
                        "rate limit fired with quota remaining (spike-triggered), rotating anyway"
                    );
                }
                let retry_after = headers.and_then(|h| wait_until_reset(h, now));
                debug!(
                    key_id,
                    retry_after_secs = retry_after.map(|d| d.as_secs_f64()),
                    "rate limited"
                );
                Classification::rate_limited(retry_after)
            }
            kind => Classification::new(kind),
        }
    }
}

/// Remaining quota reported alongside a 429, if it is nonzero.
pub fn spike_remaining(headers: &HeaderMap) -> Option<u64> {
    header_u64(headers, "x-ratelimit-remaining").filter(|remaining| *remaining > 0)
}

/// Time from `now` until the absolute `x-ratelimit-reset` instant, clamped to
/// `MAX_COOLDOWN`.
pub fn wait_until_reset(headers: &HeaderMap, now: SystemTime) -> Option<Duration> {
    let raw = header_f64(headers, "x-ratelimit-reset")?;
    if raw < 0.0 {
        return None;
    }
    let reset_secs = if raw > MILLIS_THRESHOLD { raw / 1000.0 } else { raw };
    let now_secs = now
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64();
    Some(cooldown_from_secs_f64(reset_secs - now_secs).max(MIN_WAIT))
}

impl ErrorClassifier for ResetTimestampClassifier {
    fn family(&self) -> &'static str {
        "reset-timestamp"
    }

    fn analyze(&self, key_id: &str, error: &dyn UpstreamError) -> Classification {
        self.classify_at(key_id, error, SystemTime::now())
    }

    fn extract_headers(&self, error: &dyn UpstreamError) -> HashMap<String, String> {
        let mut headers = error.headers().map(header_map_to_strings).unwrap_or_default();
        headers.retain(|name, _| name.starts_with("x-ratelimit-"));
        headers
    }

    fn default_cooldown(&self) -> Duration {
        self.default_cooldown
    }

    fn should_rotate(&self, headers: &HeaderMap, threshold: u64) -> bool {
        header_u64(headers, "x-ratelimit-remaining").is_some_and(|remaining| remaining < threshold)
    }
}

//! Header-driven strategy: explicit relative wait time
//!
//! Upstreams in this family answer 429 with a `retry-after` (seconds) or
//! `retry-after-ms` (milliseconds, fractional) header and report remaining
//! capacity on every response through `x-ratelimit-remaining-requests` and
//! `x-ratelimit-remaining-tokens`.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::header::HeaderMap;
use tracing::debug;

use crate::upstream::{UpstreamError, header_f64, header_map_to_strings, header_u64};
use crate::{
    Classification, ErrorClassifier, ErrorKind, MAX_COOLDOWN, base_kind, cooldown_from_secs_f64,
};

/// Remaining-capacity headers inspected for proactive rotation.
const REMAINING_HEADERS: &[&str] = &[
    "x-ratelimit-remaining-requests",
    "x-ratelimit-remaining-tokens",
];

pub struct RetryAfterClassifier {
    default_cooldown: Duration,
}

impl RetryAfterClassifier {
    pub fn new(default_cooldown: Duration) -> Self {
        Self { default_cooldown }
    }
}

/// Parse `retry-after-ms`, then `retry-after`.
///
/// Negative or unparseable values are ignored; anything longer than
/// `MAX_COOLDOWN` is clamped to it. HTTP-date forms of `retry-after` are not
/// supported and fall through to the default cooldown.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    if let Some(ms) = header_f64(headers, "retry-after-ms")
        && ms >= 0.0
    {
        return Some(cooldown_from_secs_f64(ms / 1000.0));
    }
    header_u64(headers, "retry-after").map(|secs| Duration::from_secs(secs).min(MAX_COOLDOWN))
}

impl ErrorClassifier for RetryAfterClassifier {
    fn family(&self) -> &'static str {
        "retry-after"
    }

    fn analyze(&self, key_id: &str, error: &dyn UpstreamError) -> Classification {
        match base_kind(error) {
            ErrorKind::RateLimit => {
                let retry_after = error.headers().and_then(parse_retry_after);
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

    fn extract_headers(&self, error: &dyn UpstreamError) -> HashMap<String, String> {
        let mut headers = error.headers().map(header_map_to_strings).unwrap_or_default();
        headers.retain(|name, _| name.starts_with("retry-after") || name.starts_with("x-ratelimit-"));
        headers
    }

    fn default_cooldown(&self) -> Duration {
        self.default_cooldown
    }

    fn should_rotate(&self, headers: &HeaderMap, threshold: u64) -> bool {
        REMAINING_HEADERS
            .iter()
            .filter_map(|name| header_u64(headers, name))
            .any(|remaining| remaining < threshold)
    }
}

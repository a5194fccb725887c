//! Failure classification for rate-limited, key-authenticated upstreams
//!
//! Defines the `ErrorClassifier` trait that decouples the execution engine from
//! the failure semantics of a particular upstream-service family. Each strategy
//! maps a failed call to an `ErrorKind` (which drives rotation, cooldown or
//! retry) plus an optional cooldown hint:
//!
//! - `RetryAfterClassifier`: explicit relative wait time in `retry-after` headers
//! - `ResetTimestampClassifier`: absolute reset timestamp in `x-ratelimit-reset`
//! - `BackoffClassifier`: no timing headers, per-credential exponential backoff

pub mod backoff;
pub mod quota;
pub mod reset_timestamp;
pub mod retry_after;
pub mod upstream;

pub use backoff::BackoffClassifier;
pub use quota::{base_kind, is_quota_message};
pub use reset_timestamp::ResetTimestampClassifier;
pub use retry_after::RetryAfterClassifier;
pub use upstream::{UpstreamError, UpstreamFailure, header_map_to_strings};

use reqwest::header::HeaderMap;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Longest cooldown any classifier hands out. Upstream hints beyond it are
/// clamped to it.
pub const MAX_COOLDOWN: Duration = Duration::from_secs(24 * 60 * 60);

/// Cooldown from a fractional seconds value, clamped to `MAX_COOLDOWN`.
///
/// Negative values become zero; values too large to represent become
/// `MAX_COOLDOWN`.
pub fn cooldown_from_secs_f64(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).map_or(MAX_COOLDOWN, |d| d.min(MAX_COOLDOWN))
}

/// Classification bucket for a failed upstream call.
///
/// - RateLimit: temporary, the credential cools down and heals by itself
/// - AuthError: credential rejected, retired until replaced out-of-band
/// - QuotaExceeded: accounting period used up, retired for the pool's lifetime
/// - Retryable: transient fault unrelated to the credential, retry on the same one
/// - NonRetryable: propagated to the caller immediately, no credential penalty
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RateLimit,
    AuthError,
    QuotaExceeded,
    Retryable,
    NonRetryable,
}

impl ErrorKind {
    /// Label for logs and metric dimensions.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::AuthError => "auth_error",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::Retryable => "retryable",
            ErrorKind::NonRetryable => "non_retryable",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Result of analyzing one failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub kind: ErrorKind,
    /// Cooldown suggested by the upstream or the strategy. Only meaningful for
    /// `RateLimit`; `None` means "use the classifier's default cooldown".
    pub retry_after: Option<Duration>,
}

impl Classification {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            retry_after: None,
        }
    }

    pub fn rate_limited(retry_after: Option<Duration>) -> Self {
        Self {
            kind: ErrorKind::RateLimit,
            retry_after,
        }
    }
}

/// Failure-handling policy for one upstream-service family.
///
/// Implementations are shared across tasks as `Arc<dyn ErrorClassifier>`, so any
/// per-credential state they keep must be internally synchronized.
pub trait ErrorClassifier: Send + Sync {
    /// Family identifier for logging and metric labels (e.g. "retry-after").
    fn family(&self) -> &'static str;

    /// Classify a failure observed while `key_id` was bound.
    fn analyze(&self, key_id: &str, error: &dyn UpstreamError) -> Classification;

    /// Rate-limit metadata carried by the failure. Empty when the failure has
    /// no response attached.
    fn extract_headers(&self, error: &dyn UpstreamError) -> HashMap<String, String> {
        error.headers().map(header_map_to_strings).unwrap_or_default()
    }

    /// Cooldown applied to a rate-limited credential when `analyze` gave no hint.
    fn default_cooldown(&self) -> Duration;

    /// Called after a successful call on `key_id`.
    fn on_success(&self, _key_id: &str) {}

    /// Whether the remaining-capacity counters in a successful response have
    /// dropped below `threshold`, meaning the engine should move to another
    /// credential before the upstream starts rejecting this one.
    fn should_rotate(&self, _headers: &HeaderMap, _threshold: u64) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_labels_are_snake_case() {
        assert_eq!(ErrorKind::RateLimit.label(), "rate_limit");
        assert_eq!(ErrorKind::QuotaExceeded.to_string(), "quota_exceeded");
        assert_eq!(ErrorKind::NonRetryable.to_string(), "non_retryable");
    }

    #[test]
    fn cooldown_from_secs_is_bounded() {
        assert_eq!(cooldown_from_secs_f64(1.5), Duration::from_millis(1500));
        assert_eq!(cooldown_from_secs_f64(-3.0), Duration::ZERO);
        assert_eq!(cooldown_from_secs_f64(f64::NAN), Duration::ZERO);
        assert_eq!(cooldown_from_secs_f64(1e27), MAX_COOLDOWN);
        assert_eq!(cooldown_from_secs_f64(f64::INFINITY), MAX_COOLDOWN);
        assert_eq!(cooldown_from_secs_f64(7.0 * 24.0 * 3600.0), MAX_COOLDOWN);
    }

    #[test]
    fn rate_limited_constructor_carries_hint() {
        let c = Classification::rate_limited(Some(Duration::from_secs(5)));
        assert_eq!(c.kind, ErrorKind::RateLimit);
        assert_eq!(c.retry_after, Some(Duration::from_secs(5)));
        assert_eq!(Classification::new(ErrorKind::AuthError).retry_after, None);
    }
}

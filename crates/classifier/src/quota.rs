//! Base classification shared by every upstream family
//!
//! Distinguishes quota-period exhaustion (retire the credential) from ordinary
//! rate limiting (cool it down) by matching known phrases in the failure
//! message, then applies fixed status rules for auth and transient failures.
//! Family strategies only refine the `RateLimit` outcome with timing.

use crate::ErrorKind;
use crate::upstream::UpstreamError;

/// Phrases indicating the credential's accounting period is used up rather
/// than a short-window rate limit.
const QUOTA_PATTERNS: &[&str] = &[
    "insufficient_quota",
    "exceeded your current quota",
    "usage limit for your plan",
    "subscription usage limit",
    "billing",
    "per day",
    "daily limit",
];

/// Whether a failure message describes quota-period exhaustion.
///
/// Case-insensitive substring match against `QUOTA_PATTERNS`.
pub fn is_quota_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    QUOTA_PATTERNS.iter().any(|pattern| lower.contains(pattern))
}

/// Classify a failure using the rules common to all families.
///
/// - 401/403 → AuthError
/// - 402, or 429 / no status with a quota phrase → QuotaExceeded
/// - 429 → RateLimit (timing left to the family strategy)
/// - 408/5xx gateway statuses, timeouts, connect failures → Retryable
/// - everything else → NonRetryable
pub fn base_kind(error: &dyn UpstreamError) -> ErrorKind {
    let message = error.to_string();
    match error.status() {
        Some(401 | 403) => ErrorKind::AuthError,
        Some(402) => ErrorKind::QuotaExceeded,
        Some(429) | None if is_quota_message(&message) => ErrorKind::QuotaExceeded,
        Some(429) => ErrorKind::RateLimit,
        Some(408 | 500 | 502 | 503 | 504) => ErrorKind::Retryable,
        _ if error.is_timeout() || error.is_connect() => ErrorKind::Retryable,
        _ => ErrorKind::NonRetryable,
    }
}

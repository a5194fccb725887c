//! Execution metrics
//!
//! Two layers:
//!
//! - `ExecutionMetrics`: per-engine counters, mutated under the engine lock and
//!   read as a cloned snapshot.
//! - `metrics` facade counters, emitted alongside for whatever recorder the
//!   host process installed (no-ops otherwise):
//!   - `key_pool_requests_total` (counter): labels `family`, `outcome`
//!   - `key_pool_errors_total` (counter): labels `family`, `kind`
//!   - `key_pool_rotations_total` (counter): labels `family`, `reason`

use std::collections::BTreeMap;
use std::time::SystemTime;

use classifier::ErrorKind;
use serde::Serialize;

/// Counters for one engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecutionMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub rate_limit_hits: u64,
    pub auth_failures: u64,
    pub quota_exceeded_count: u64,
    pub retryable_errors: u64,
    pub non_retryable_errors: u64,
    pub key_rotations: u64,
    pub proactive_rotations: u64,
    pub last_rotation: Option<SystemTime>,
    pub errors_by_kind: BTreeMap<ErrorKind, u64>,
}

impl ExecutionMetrics {
    /// Percentage of attempts that succeeded; 0.0 before any attempt.
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.successful_requests as f64 / self.total_requests as f64 * 100.0
    }

    pub(crate) fn record_success(&mut self) {
        self.total_requests += 1;
        self.successful_requests += 1;
    }

    pub(crate) fn record_failure(&mut self, kind: ErrorKind) {
        self.total_requests += 1;
        self.failed_requests += 1;
        *self.errors_by_kind.entry(kind).or_insert(0) += 1;
        match kind {
            ErrorKind::RateLimit => self.rate_limit_hits += 1,
            ErrorKind::AuthError => self.auth_failures += 1,
            ErrorKind::QuotaExceeded => self.quota_exceeded_count += 1,
            ErrorKind::Retryable => self.retryable_errors += 1,
            ErrorKind::NonRetryable => self.non_retryable_errors += 1,
        }
    }

    pub(crate) fn record_rotation(&mut self) {
        self.key_rotations += 1;
        self.last_rotation = Some(SystemTime::now());
    }
}

/// Emit one attempt outcome ("success" or the error kind label).
pub fn emit_request(family: &'static str, outcome: &'static str) {
    metrics::counter!("key_pool_requests_total", "family" => family, "outcome" => outcome)
        .increment(1);
}

/// Emit a classified failure.
pub fn emit_error(family: &'static str, kind: ErrorKind) {
    metrics::counter!("key_pool_errors_total", "family" => family, "kind" => kind.label())
        .increment(1);
}

/// Emit a credential switch. `reason` is "failover" or "proactive".
pub fn emit_rotation(family: &'static str, reason: &'static str) {
    metrics::counter!("key_pool_rotations_total", "family" => family, "reason" => reason)
        .increment(1);
}

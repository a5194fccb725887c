//! Credential pool state machine and round-robin selection
//!
//! The pool holds one record per credential: its secret, its status and its
//! usage metadata. Selection is round-robin over insertion order, skipping
//! anything not Available.
//!
//! Cooldown expiry is lazy: a RateLimited credential whose cooldown has passed
//! is moved back to Available the next time it is looked at during selection
//! or an availability check. There is no background timer.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant, SystemTime};

use classifier::{ErrorKind, MAX_COOLDOWN};
use common::Secret;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Runtime status of a credential.
///
/// Transitions:
/// - Available → RateLimited (429-style failure)
/// - Available → Invalid (401/403-style failure)
/// - Available → QuotaExceeded (accounting period used up)
/// - RateLimited → Available (cooldown expired, checked lazily)
/// - any → Available (explicit `reset_key`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStatus {
    Available,
    RateLimited { until: Instant },
    Invalid,
    QuotaExceeded,
}

impl KeyStatus {
    /// Status label for health/logging.
    pub fn label(&self) -> &'static str {
        match self {
            KeyStatus::Available => "available",
            KeyStatus::RateLimited { .. } => "rate_limited",
            KeyStatus::Invalid => "invalid",
            KeyStatus::QuotaExceeded => "quota_exceeded",
        }
    }
}

/// Usage counters kept per credential.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KeyMetadata {
    pub request_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub errors_by_kind: BTreeMap<ErrorKind, u64>,
    pub last_success: Option<SystemTime>,
    pub last_failure: Option<SystemTime>,
}

/// A credential supplied at construction: a log-safe id plus the secret.
#[derive(Debug, Clone)]
pub struct Credential {
    pub id: String,
    pub secret: Secret<String>,
}

impl Credential {
    pub fn new(id: impl Into<String>, secret: impl Into<Secret<String>>) -> Self {
        Self {
            id: id.into(),
            secret: secret.into(),
        }
    }
}

/// A credential handed out by selection, ready to build a client with.
#[derive(Debug, Clone)]
pub struct SelectedKey {
    pub id: String,
    pub secret: Secret<String>,
}

/// Per-status counts for health reporting and exhaustion errors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub total: usize,
    pub available: usize,
    pub rate_limited: usize,
    pub invalid: usize,
    pub quota_exceeded: usize,
}

struct KeyRecord {
    secret: Secret<String>,
    status: KeyStatus,
    metadata: KeyMetadata,
}

impl KeyRecord {
    fn new(secret: Secret<String>) -> Self {
        Self {
            secret,
            status: KeyStatus::Available,
            metadata: KeyMetadata::default(),
        }
    }

    /// Apply lazy cooldown expiry; returns whether the record is Available.
    fn refresh_status(&mut self, id: &str, now: Instant) -> bool {
        match self.status {
            KeyStatus::Available => true,
            KeyStatus::RateLimited { until } if now >= until => {
                info!(key_id = id, "cooldown expired, credential available again");
                self.status = KeyStatus::Available;
                true
            }
            _ => false,
        }
    }
}

struct PoolState {
    ids: Vec<String>,
    records: HashMap<String, KeyRecord>,
}

impl PoolState {
    fn contains_secret(&self, secret: &Secret<String>) -> Option<&str> {
        self.ids
            .iter()
            .find(|id| self.records.get(*id).is_some_and(|r| &r.secret == secret))
            .map(String::as_str)
    }

    fn counts(&self, now: Instant) -> StatusCounts {
        let mut counts = StatusCounts {
            total: self.ids.len(),
            ..StatusCounts::default()
        };
        for id in &self.ids {
            match self.records.get(id).map(|r| r.status) {
                Some(KeyStatus::Available) => counts.available += 1,
                Some(KeyStatus::RateLimited { until }) if now >= until => counts.available += 1,
                Some(KeyStatus::RateLimited { .. }) => counts.rate_limited += 1,
                Some(KeyStatus::QuotaExceeded) => counts.quota_exceeded += 1,
                Some(KeyStatus::Invalid) | None => counts.invalid += 1,
            }
        }
        counts
    }
}

/// Pool of interchangeable credentials for one upstream-service family.
///
/// All state sits behind one `Mutex`; the round-robin cursor is an
/// `AtomicUsize` so concurrent selections spread across credentials.
/// Share it as `Arc<CredentialPool>` between the engines of one family.
pub struct CredentialPool {
    state: Mutex<PoolState>,
    next_index: AtomicUsize,
    default_cooldown: Duration,
}

impl CredentialPool {
    /// Create a pool from labelled credentials. All start Available.
    ///
    /// Credentials repeating an earlier id or secret are dropped with a warning.
    pub fn new(credentials: Vec<Credential>, default_cooldown: Duration) -> Self {
        let mut state = PoolState {
            ids: Vec::with_capacity(credentials.len()),
            records: HashMap::with_capacity(credentials.len()),
        };
        for credential in credentials {
            if state.records.contains_key(&credential.id) {
                warn!(key_id = %credential.id, "duplicate credential id ignored");
                continue;
            }
            if let Some(existing) = state.contains_secret(&credential.secret) {
                warn!(key_id = %credential.id, existing, "duplicate credential secret ignored");
                continue;
            }
            state.ids.push(credential.id.clone());
            state
                .records
                .insert(credential.id, KeyRecord::new(credential.secret));
        }
        info!(credentials = state.ids.len(), "credential pool initialized");
        Self {
            state: Mutex::new(state),
            next_index: AtomicUsize::new(0),
            default_cooldown,
        }
    }

    /// Create a pool from bare secrets, labelling them `key-0`, `key-1`, ...
    pub fn from_keys(keys: Vec<Secret<String>>, default_cooldown: Duration) -> Self {
        let credentials = keys
            .into_iter()
            .enumerate()
            .map(|(i, secret)| Credential {
                id: format!("key-{i}"),
                secret,
            })
            .collect();
        Self::new(credentials, default_cooldown)
    }

    /// Select the next Available credential via round-robin.
    ///
    /// Scans every credential once starting from the cursor. Expired cooldowns
    /// are transitioned to Available on the way. Returns `None` when nothing is
    /// usable.
    pub async fn get_next_available_key(&self) -> Option<SelectedKey> {
        let mut state = self.state.lock().await;
        let n = state.ids.len();
        if n == 0 {
            return None;
        }

        let start = self.next_index.fetch_add(1, Ordering::Relaxed) % n;
        let now = Instant::now();
        let PoolState { ids, records } = &mut *state;

        for offset in 0..n {
            let id = &ids[(start + offset) % n];
            let Some(record) = records.get_mut(id) else {
                continue;
            };
            if record.refresh_status(id, now) {
                debug!(key_id = %id, "credential selected");
                return Some(SelectedKey {
                    id: id.clone(),
                    secret: record.secret.clone(),
                });
            }
        }

        debug!(credentials = n, "no credential available");
        None
    }

    /// Whether `id` is Available, after applying cooldown expiry.
    pub async fn is_key_available(&self, id: &str) -> bool {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state
            .records
            .get_mut(id)
            .is_some_and(|record| record.refresh_status(id, now))
    }

    /// Put a credential into cooldown for `retry_after`, or the pool default.
    ///
    /// Cooldowns are capped at `classifier::MAX_COOLDOWN`.
    pub async fn mark_rate_limited(&self, id: &str, retry_after: Option<Duration>) {
        let cooldown = retry_after
            .unwrap_or(self.default_cooldown)
            .min(MAX_COOLDOWN);
        let now = Instant::now();
        let until = now.checked_add(cooldown).unwrap_or(now);
        self.set_status(id, KeyStatus::RateLimited { until }).await;
        info!(
            key_id = id,
            cooldown_secs = cooldown.as_secs_f64(),
            "credential rate limited, cooling down"
        );
    }

    /// Retire a credential the upstream rejected.
    pub async fn mark_invalid(&self, id: &str) {
        self.set_status(id, KeyStatus::Invalid).await;
        warn!(key_id = id, "credential invalid, removed from rotation");
    }

    /// Retire a credential whose accounting period is used up.
    pub async fn mark_quota_exceeded(&self, id: &str) {
        self.set_status(id, KeyStatus::QuotaExceeded).await;
        warn!(key_id = id, "credential quota exceeded, removed from rotation");
    }

    /// Number of credentials currently usable.
    pub async fn get_available_count(&self) -> usize {
        let state = self.state.lock().await;
        state.counts(Instant::now()).available
    }

    /// Record a successful call against a credential's metadata.
    pub async fn record_success(&self, id: &str) {
        let mut state = self.state.lock().await;
        if let Some(record) = state.records.get_mut(id) {
            record.metadata.request_count += 1;
            record.metadata.success_count += 1;
            record.metadata.last_success = Some(SystemTime::now());
        }
    }

    /// Record a failed call against a credential's metadata.
    pub async fn record_failure(&self, id: &str, kind: ErrorKind) {
        let mut state = self.state.lock().await;
        if let Some(record) = state.records.get_mut(id) {
            record.metadata.request_count += 1;
            record.metadata.failure_count += 1;
            *record.metadata.errors_by_kind.entry(kind).or_insert(0) += 1;
            record.metadata.last_failure = Some(SystemTime::now());
        }
    }

    /// Current status of a credential, after applying cooldown expiry.
    pub async fn status(&self, id: &str) -> Option<KeyStatus> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.records.get_mut(id).map(|record| {
            record.refresh_status(id, now);
            record.status
        })
    }

    /// Snapshot of a credential's usage counters.
    pub async fn metadata(&self, id: &str) -> Option<KeyMetadata> {
        let state = self.state.lock().await;
        state.records.get(id).map(|record| record.metadata.clone())
    }

    /// Credential ids in selection order.
    pub async fn key_ids(&self) -> Vec<String> {
        self.state.lock().await.ids.clone()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.ids.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Operator reset: return a credential to Available whatever its status.
    ///
    /// The engine never calls this; Invalid and QuotaExceeded credentials stay
    /// out of rotation until someone does.
    pub async fn reset_key(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let record = state
            .records
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        info!(key_id = id, previous = record.status.label(), "credential reset to available");
        record.status = KeyStatus::Available;
        Ok(())
    }

    /// Add a credential at the end of the rotation. Starts Available.
    pub async fn add_key(&self, credential: Credential) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.records.contains_key(&credential.id) {
            return Err(Error::Duplicate(credential.id));
        }
        if let Some(existing) = state.contains_secret(&credential.secret) {
            return Err(Error::Duplicate(existing.to_string()));
        }
        info!(key_id = %credential.id, "credential added to pool");
        state.ids.push(credential.id.clone());
        state
            .records
            .insert(credential.id, KeyRecord::new(credential.secret));
        Ok(())
    }

    /// Remove a credential from the pool entirely.
    pub async fn remove_key(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.records.remove(id).is_none() {
            return Err(Error::NotFound(id.to_string()));
        }
        state.ids.retain(|existing| existing != id);
        info!(key_id = id, "credential removed from pool");
        Ok(())
    }

    /// Count credentials by status.
    pub async fn counts(&self) -> StatusCounts {
        self.state.lock().await.counts(Instant::now())
    }

    /// Pool health summary.
    ///
    /// Status mapping: all available → healthy, some available → degraded,
    /// none available (or empty pool) → unhealthy.
    pub async fn health(&self) -> serde_json::Value {
        let state = self.state.lock().await;
        let now = Instant::now();
        let counts = state.counts(now);

        let keys: Vec<serde_json::Value> = state
            .ids
            .iter()
            .filter_map(|id| state.records.get(id).map(|record| (id, record)))
            .map(|(id, record)| {
                let mut entry = serde_json::json!({
                    "id": id,
                    "hint": record.secret.hint(),
                    "status": record.status.label(),
                    "request_count": record.metadata.request_count,
                    "success_count": record.metadata.success_count,
                    "failure_count": record.metadata.failure_count,
                });
                if let KeyStatus::RateLimited { until } = record.status {
                    if now >= until {
                        entry["status"] = "available".into();
                    } else {
                        entry["cooldown_remaining_secs"] = (until - now).as_secs().into();
                    }
                }
                entry
            })
            .collect();

        let status = if counts.total > 0 && counts.available == counts.total {
            "healthy"
        } else if counts.available > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        serde_json::json!({
            "status": status,
            "keys_total": counts.total,
            "keys_available": counts.available,
            "keys_rate_limited": counts.rate_limited,
            "keys_invalid": counts.invalid,
            "keys_quota_exceeded": counts.quota_exceeded,
            "keys": keys
        })
    }

    /// JSON body describing why no credential could be selected.
    pub async fn exhausted_message(&self) -> String {
        let counts = self.counts().await;
        serde_json::json!({
            "error": {
                "type": "pool_exhausted",
                "message": "All credentials exhausted",
                "pool": counts
            }
        })
        .to_string()
    }

    async fn set_status(&self, id: &str, status: KeyStatus) {
        let mut state = self.state.lock().await;
        match state.records.get_mut(id) {
            Some(record) => record.status = status,
            None => debug!(key_id = id, "status change for unknown credential ignored"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn pool_of(ids: &[&str]) -> CredentialPool {
        let credentials = ids
            .iter()
            .map(|id| Credential::new(*id, format!("secret-{id}-0123456789")))
            .collect();
        CredentialPool::new(credentials, Duration::from_secs(3600))
    }

    async fn next_id(pool: &CredentialPool) -> String {
        pool.get_next_available_key().await.unwrap().id
    }

    #[tokio::test]
    async fn round_robin_cycles_through_credentials() {
        let pool = pool_of(&["a", "b"]);
        assert_eq!(next_id(&pool).await, "a");
        assert_eq!(next_id(&pool).await, "b");
        assert_eq!(next_id(&pool).await, "a");
    }

    #[tokio::test]
    async fn no_credential_selected_twice_before_all_selected_once() {
        let ids = ["a", "b", "c", "d", "e"];
        let pool = pool_of(&ids);
        for _round in 0..4 {
            let mut seen = HashSet::new();
            for _ in 0..ids.len() {
                let id = next_id(&pool).await;
                assert!(seen.insert(id.clone()), "{id} selected twice within one round");
            }
            assert_eq!(seen.len(), ids.len());
        }
    }

    #[tokio::test]
    async fn concurrent_selection_is_evenly_spread() {
        let pool = Arc::new(pool_of(&["a", "b", "c"]));
        let mut handles = Vec::new();
        for _ in 0..30 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move { next_id(&pool).await }));
        }
        let mut per_key: HashMap<String, usize> = HashMap::new();
        for handle in handles {
            *per_key.entry(handle.await.unwrap()).or_default() += 1;
        }
        assert_eq!(per_key.len(), 3);
        assert!(per_key.values().all(|count| *count == 10), "{per_key:?}");
    }

    #[tokio::test]
    async fn selected_key_carries_secret() {
        let pool = CredentialPool::new(
            vec![Credential::new("primary", "sk-primary-secret")],
            Duration::from_secs(60),
        );
        let selected = pool.get_next_available_key().await.unwrap();
        assert_eq!(selected.id, "primary");
        assert_eq!(selected.secret.expose(), "sk-primary-secret");
    }

    #[tokio::test]
    async fn from_keys_labels_by_position() {
        let pool = CredentialPool::from_keys(
            vec![Secret::from("k-one"), Secret::from("k-two")],
            Duration::from_secs(60),
        );
        assert_eq!(pool.key_ids().await, vec!["key-0", "key-1"]);
    }

    #[tokio::test]
    async fn duplicate_secrets_and_ids_are_dropped() {
        let pool = CredentialPool::new(
            vec![
                Credential::new("a", "same-secret"),
                Credential::new("b", "same-secret"),
                Credential::new("a", "other-secret"),
                Credential::new("c", "third-secret"),
            ],
            Duration::from_secs(60),
        );
        assert_eq!(pool.key_ids().await, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn rate_limited_credential_is_skipped() {
        let pool = pool_of(&["a", "b", "c"]);
        pool.mark_rate_limited("a", Some(Duration::from_secs(60))).await;

        for _ in 0..6 {
            assert_ne!(next_id(&pool).await, "a");
        }
        assert!(!pool.is_key_available("a").await);
        assert_eq!(pool.get_available_count().await, 2);
    }

    #[tokio::test]
    async fn mark_rate_limited_uses_default_cooldown() {
        let pool = pool_of(&["a"]);
        let before = Instant::now();
        pool.mark_rate_limited("a", None).await;
        match pool.status("a").await {
            Some(KeyStatus::RateLimited { until }) => {
                assert!(until >= before + Duration::from_secs(3600));
            }
            other => panic!("expected rate limited, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversized_cooldown_is_capped() {
        let pool = pool_of(&["a", "b"]);
        let before = Instant::now();
        pool.mark_rate_limited("a", Some(Duration::MAX)).await;
        pool.mark_rate_limited("b", Some(Duration::from_secs(u64::MAX))).await;

        for id in ["a", "b"] {
            match pool.status(id).await {
                Some(KeyStatus::RateLimited { until }) => {
                    assert!(until >= before + MAX_COOLDOWN);
                    assert!(until <= Instant::now() + MAX_COOLDOWN);
                }
                other => panic!("expected rate limited, got {other:?}"),
            }
        }
        assert_eq!(pool.get_available_count().await, 0);
    }

    #[tokio::test]
    async fn expired_cooldown_transitions_to_available() {
        let pool = pool_of(&["a"]);
        pool.mark_rate_limited("a", Some(Duration::ZERO)).await;
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert!(pool.is_key_available("a").await);
        assert_eq!(pool.status("a").await, Some(KeyStatus::Available));
        assert_eq!(next_id(&pool).await, "a");
    }

    #[tokio::test]
    async fn invalid_is_permanent() {
        let pool = pool_of(&["a", "b"]);
        pool.mark_invalid("a").await;

        for _ in 0..10 {
            assert_eq!(next_id(&pool).await, "b");
        }
        assert_eq!(pool.status("a").await, Some(KeyStatus::Invalid));
        assert!(!pool.is_key_available("a").await);
    }

    #[tokio::test]
    async fn quota_exceeded_is_permanent_and_reported_separately() {
        let pool = pool_of(&["a", "b"]);
        pool.mark_quota_exceeded("a").await;
        pool.mark_invalid("b").await;

        assert!(pool.get_next_available_key().await.is_none());
        let counts = pool.counts().await;
        assert_eq!(counts.quota_exceeded, 1);
        assert_eq!(counts.invalid, 1);
        assert_eq!(counts.available, 0);
    }

    #[tokio::test]
    async fn empty_pool_selects_nothing() {
        let pool = pool_of(&[]);
        assert!(pool.get_next_available_key().await.is_none());
        assert_eq!(pool.get_available_count().await, 0);
        assert!(pool.is_empty().await);
    }

    #[tokio::test]
    async fn reset_restores_retired_credential() {
        let pool = pool_of(&["a"]);
        pool.mark_invalid("a").await;
        assert!(pool.get_next_available_key().await.is_none());

        pool.reset_key("a").await.unwrap();
        assert_eq!(next_id(&pool).await, "a");
    }

    #[tokio::test]
    async fn reset_unknown_credential_is_not_found() {
        let pool = pool_of(&["a"]);
        let err = pool.reset_key("ghost").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(id) if id == "ghost"));
    }

    #[tokio::test]
    async fn marking_unknown_credential_is_ignored() {
        let pool = pool_of(&["a"]);
        pool.mark_invalid("ghost").await;
        assert_eq!(pool.len().await, 1);
        assert_eq!(pool.get_available_count().await, 1);
    }

    #[tokio::test]
    async fn add_and_remove_credentials() {
        let pool = pool_of(&["a"]);
        pool.add_key(Credential::new("b", "secret-b")).await.unwrap();
        assert_eq!(pool.key_ids().await, vec!["a", "b"]);

        pool.remove_key("a").await.unwrap();
        assert_eq!(pool.key_ids().await, vec!["b"]);
        assert!(pool.status("a").await.is_none());
        assert!(matches!(pool.remove_key("a").await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn add_rejects_duplicates() {
        let pool = pool_of(&["a"]);
        let err = pool
            .add_key(Credential::new("a", "fresh-secret"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Duplicate(_)));

        let err = pool
            .add_key(Credential::new("z", "secret-a-0123456789"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Duplicate(id) if id == "a"));
    }

    #[tokio::test]
    async fn metadata_tracks_outcomes_by_kind() {
        let pool = pool_of(&["a"]);
        pool.record_success("a").await;
        pool.record_failure("a", ErrorKind::RateLimit).await;
        pool.record_failure("a", ErrorKind::RateLimit).await;
        pool.record_failure("a", ErrorKind::Retryable).await;

        let meta = pool.metadata("a").await.unwrap();
        assert_eq!(meta.request_count, 4);
        assert_eq!(meta.success_count, 1);
        assert_eq!(meta.failure_count, 3);
        assert_eq!(meta.errors_by_kind[&ErrorKind::RateLimit], 2);
        assert_eq!(meta.errors_by_kind[&ErrorKind::Retryable], 1);
        assert!(meta.last_success.is_some());
        assert!(meta.last_failure.is_some());
    }

    #[tokio::test]
    async fn health_reflects_status_mix() {
        let pool = pool_of(&["a", "b"]);
        assert_eq!(pool.health().await["status"], "healthy");

        pool.mark_rate_limited("a", Some(Duration::from_secs(600))).await;
        let health = pool.health().await;
        assert_eq!(health["status"], "degraded");
        assert_eq!(health["keys_rate_limited"], 1);
        let remaining = health["keys"][0]["cooldown_remaining_secs"].as_u64().unwrap();
        assert!(remaining > 0, "remaining should be > 0, got {remaining}");

        pool.mark_invalid("b").await;
        assert_eq!(pool.health().await["status"], "unhealthy");
    }

    #[tokio::test]
    async fn health_never_exposes_secrets() {
        let pool = CredentialPool::new(
            vec![Credential::new("a", "sk-live-very-secret-value")],
            Duration::from_secs(60),
        );
        let rendered = pool.health().await.to_string();
        assert!(!rendered.contains("very-secret"), "{rendered}");
        assert!(rendered.contains("...alue"));
    }

    #[tokio::test]
    async fn exhausted_message_has_counts() {
        let pool = pool_of(&["a", "b"]);
        pool.mark_rate_limited("a", None).await;
        pool.mark_quota_exceeded("b").await;

        let json: serde_json::Value =
            serde_json::from_str(&pool.exhausted_message().await).unwrap();
        assert_eq!(json["error"]["type"], "pool_exhausted");
        assert_eq!(json["error"]["pool"]["total"], 2);
        assert_eq!(json["error"]["pool"]["rate_limited"], 1);
        assert_eq!(json["error"]["pool"]["quota_exceeded"], 1);
        assert_eq!(json["error"]["pool"]["available"], 0);
    }
}

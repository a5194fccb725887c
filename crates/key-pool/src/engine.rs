//! Execution engine: run a caller operation through the credential pool
//!
//! One `execute` call is a sequential loop of attempts. Each attempt binds a
//! credential (reusing the engine's current one while it stays Available),
//! builds a client for it through the `ClientFactory`, and runs the caller's
//! operation. Failures are classified by the family's `ErrorClassifier`:
//!
//! - RateLimit → credential cools down, next attempt rotates
//! - AuthError → credential retired as Invalid, next attempt rotates
//! - QuotaExceeded → credential retired as QuotaExceeded, next attempt rotates
//! - Retryable → same credential, next attempt
//! - NonRetryable → returned to the caller at once
//!
//! Bookkeeping (binding, metrics, pool transitions) runs under the engine's
//! mutex, always taken before the pool's. The operation itself runs with no
//! lock held, so concurrent callers only serialize on bookkeeping.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use classifier::{Classification, ErrorClassifier, ErrorKind, UpstreamError};
use reqwest::header::HeaderMap;
use tokio::sync::Mutex;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::error::ExecuteError;
use crate::metrics::{ExecutionMetrics, emit_error, emit_request, emit_rotation};
use crate::pool::{CredentialPool, SelectedKey};

/// Attempts per `execute` call when the caller has no preference.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Builds an upstream client bound to one credential.
///
/// Implemented for any `Fn(&SelectedKey) -> C`, so a closure is enough.
pub trait ClientFactory: Send + Sync {
    type Client;

    fn build(&self, key: &SelectedKey) -> Self::Client;
}

impl<C, F> ClientFactory for F
where
    F: Fn(&SelectedKey) -> C + Send + Sync,
{
    type Client = C;

    fn build(&self, key: &SelectedKey) -> C {
        self(key)
    }
}

/// Success values that expose response headers for proactive rotation.
pub trait ResponseHeaders {
    fn response_headers(&self) -> Option<&HeaderMap>;
}

impl ResponseHeaders for reqwest::Response {
    fn response_headers(&self) -> Option<&HeaderMap> {
        Some(self.headers())
    }
}

impl ResponseHeaders for HeaderMap {
    fn response_headers(&self) -> Option<&HeaderMap> {
        Some(self)
    }
}

/// Tunables beyond the classifier and pool.
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    /// Pause before retrying a Retryable failure on the same credential.
    pub retry_delay: Duration,
    /// Rotate ahead of failures once a success reports fewer than this many
    /// remaining requests. `None` disables proactive rotation.
    pub proactive_threshold: Option<u64>,
}

struct EngineState {
    bound: Option<SelectedKey>,
    last_key: Option<String>,
    rotation_reason: &'static str,
    metrics: ExecutionMetrics,
}

/// Executes operations against a rate-limited upstream through a credential pool.
///
/// Share one engine between tasks as `Arc<ExecutionEngine<F>>`.
pub struct ExecutionEngine<F> {
    pool: Arc<CredentialPool>,
    classifier: Arc<dyn ErrorClassifier>,
    factory: F,
    options: EngineOptions,
    state: Mutex<EngineState>,
}

fn no_headers<T>(_: &T) -> Option<&HeaderMap> {
    None
}

impl<F: ClientFactory> ExecutionEngine<F> {
    pub fn new(pool: Arc<CredentialPool>, classifier: Arc<dyn ErrorClassifier>, factory: F) -> Self {
        Self {
            pool,
            classifier,
            factory,
            options: EngineOptions::default(),
            state: Mutex::new(EngineState {
                bound: None,
                last_key: None,
                rotation_reason: "failover",
                metrics: ExecutionMetrics::default(),
            }),
        }
    }

    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    /// Run `operation` with up to `max_retries` attempts (at least one).
    ///
    /// The operation receives a client built for the bound credential. The
    /// error returned is the operation's own last error, except
    /// `ExecuteError::NoCredentials` when no credential could ever be bound.
    pub async fn execute<T, E, Op, Fut>(
        &self,
        operation: Op,
        max_retries: u32,
    ) -> Result<T, ExecuteError<E>>
    where
        Op: FnMut(F::Client) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: UpstreamError,
    {
        self.run(operation, max_retries, no_headers::<T>).await
    }

    /// Like `execute`, but inspects the success value's headers for proactive
    /// rotation when a threshold is configured.
    pub async fn execute_observed<T, E, Op, Fut>(
        &self,
        operation: Op,
        max_retries: u32,
    ) -> Result<T, ExecuteError<E>>
    where
        T: ResponseHeaders,
        Op: FnMut(F::Client) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: UpstreamError,
    {
        self.run(operation, max_retries, <T as ResponseHeaders>::response_headers)
            .await
    }

    /// Point-in-time copy of the engine's counters.
    pub async fn metrics(&self) -> ExecutionMetrics {
        self.state.lock().await.metrics.clone()
    }

    /// `successful / total × 100`, or 0.0 before any attempt.
    pub async fn success_rate(&self) -> f64 {
        self.state.lock().await.metrics.success_rate()
    }

    /// Id of the credential the next call will start with, if any.
    pub async fn bound_key_id(&self) -> Option<String> {
        self.state.lock().await.bound.as_ref().map(|key| key.id.clone())
    }

    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }

    pub fn classifier(&self) -> &Arc<dyn ErrorClassifier> {
        &self.classifier
    }

    async fn run<T, E, Op, Fut>(
        &self,
        mut operation: Op,
        max_retries: u32,
        inspect: fn(&T) -> Option<&HeaderMap>,
    ) -> Result<T, ExecuteError<E>>
    where
        Op: FnMut(F::Client) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: UpstreamError,
    {
        let attempts = max_retries.max(1);
        let span = info_span!(
            "execute",
            call_id = %Uuid::new_v4(),
            family = self.classifier.family(),
            attempts
        );

        async move {
            let mut tried: HashSet<String> = HashSet::new();
            let mut last_error: Option<E> = None;

            for attempt in 1..=attempts {
                let Some(key) = self.bind(&mut tried).await else {
                    return Err(self.give_up(last_error).await);
                };

                let client = self.factory.build(&key);
                match operation(client).await {
                    Ok(value) => {
                        let low_capacity = self.options.proactive_threshold.is_some_and(|threshold| {
                            inspect(&value)
                                .is_some_and(|headers| self.classifier.should_rotate(headers, threshold))
                        });
                        self.on_success(&key, low_capacity).await;
                        return Ok(value);
                    }
                    Err(error) => {
                        let classification = self.classifier.analyze(&key.id, &error);
                        warn!(
                            key_id = %key.id,
                            attempt,
                            kind = %classification.kind,
                            error = %error,
                            "upstream call failed"
                        );
                        if classification.kind == ErrorKind::RateLimit {
                            debug!(
                                key_id = %key.id,
                                headers = ?self.classifier.extract_headers(&error),
                                "rate-limit metadata"
                            );
                        }
                        self.on_failure(&key, classification).await;

                        match classification.kind {
                            ErrorKind::NonRetryable => return Err(ExecuteError::Upstream(error)),
                            ErrorKind::Retryable
                                if attempt < attempts && !self.options.retry_delay.is_zero() =>
                            {
                                tokio::time::sleep(self.options.retry_delay).await;
                            }
                            _ => {}
                        }
                        last_error = Some(error);
                    }
                }
            }

            debug!("attempts exhausted");
            Err(self.give_up(last_error).await)
        }
        .instrument(span)
        .await
    }

    /// Bind a credential for the next attempt.
    ///
    /// Returns `None` when the pool has nothing Available, or when selection
    /// comes back to a credential already tried in this call after every
    /// credential has been tried.
    async fn bind(&self, tried: &mut HashSet<String>) -> Option<SelectedKey> {
        let mut state = self.state.lock().await;

        if let Some(bound) = state.bound.clone() {
            if self.pool.is_key_available(&bound.id).await {
                tried.insert(bound.id.clone());
                return Some(bound);
            }
            debug!(key_id = %bound.id, "bound credential no longer available");
            state.bound = None;
        }

        let next = self.pool.get_next_available_key().await?;
        let first_try = tried.insert(next.id.clone());
        if !first_try && tried.len() >= self.pool.len().await {
            debug!(key_id = %next.id, tried = tried.len(), "every credential tried in this call");
            return None;
        }

        let reason = std::mem::replace(&mut state.rotation_reason, "failover");
        if let Some(previous) = state.last_key.replace(next.id.clone())
            && previous != next.id
        {
            state.metrics.record_rotation();
            emit_rotation(self.classifier.family(), reason);
            info!(from = %previous, to = %next.id, reason, "rotated credential");
        }
        state.bound = Some(next.clone());
        Some(next)
    }

    async fn on_success(&self, key: &SelectedKey, low_capacity: bool) {
        let family = self.classifier.family();
        let mut state = self.state.lock().await;
        state.metrics.record_success();
        self.pool.record_success(&key.id).await;
        self.classifier.on_success(&key.id);
        emit_request(family, "success");

        if low_capacity && state.bound.as_ref().is_some_and(|bound| bound.id == key.id) {
            info!(key_id = %key.id, "remaining capacity low, rotating proactively");
            state.bound = None;
            state.rotation_reason = "proactive";
            state.metrics.proactive_rotations += 1;
        }
    }

    async fn on_failure(&self, key: &SelectedKey, classification: Classification) {
        let family = self.classifier.family();
        let kind = classification.kind;
        let mut state = self.state.lock().await;
        state.metrics.record_failure(kind);
        self.pool.record_failure(&key.id, kind).await;
        emit_request(family, kind.label());
        emit_error(family, kind);

        match kind {
            ErrorKind::RateLimit => {
                let cooldown = classification
                    .retry_after
                    .unwrap_or_else(|| self.classifier.default_cooldown());
                self.pool.mark_rate_limited(&key.id, Some(cooldown)).await;
            }
            ErrorKind::AuthError => self.pool.mark_invalid(&key.id).await,
            ErrorKind::QuotaExceeded => self.pool.mark_quota_exceeded(&key.id).await,
            ErrorKind::Retryable => {
                debug!(key_id = %key.id, "transient failure, keeping credential");
                return;
            }
            ErrorKind::NonRetryable => return,
        }

        // Another caller may already have moved the engine to a different credential.
        if state.bound.as_ref().is_some_and(|bound| bound.id == key.id) {
            state.bound = None;
        }
    }

    async fn give_up<E>(&self, last_error: Option<E>) -> ExecuteError<E> {
        match last_error {
            Some(error) => ExecuteError::Upstream(error),
            None => {
                let message = self.pool.exhausted_message().await;
                warn!(%message, "no credential available");
                ExecuteError::NoCredentials(message)
            }
        }
    }
}

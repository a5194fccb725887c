//! Probe requests through the execution engine
//!
//! Each probe is one `execute_observed` call: a bearer-authenticated GET whose
//! non-2xx responses become `UpstreamFailure`s, so status, headers and body
//! all reach the classifier.

use std::sync::Arc;

use classifier::UpstreamFailure;
use common::Secret;
use key_pool::{ClientFactory, ExecuteError, ExecutionEngine, SelectedKey};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

/// HTTP client bound to one credential.
pub struct ProbeClient {
    http: reqwest::Client,
    token: Secret<String>,
}

impl ProbeClient {
    pub async fn get(self, url: &str) -> Result<reqwest::Response, UpstreamFailure> {
        let response = self
            .http
            .get(url)
            .bearer_auth(self.token.expose())
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let headers = response.headers().clone();
        let body = response.text().await.unwrap_or_default();
        Err(UpstreamFailure::with_headers(status.as_u16(), headers, body))
    }
}

/// Builds a `ProbeClient` per bound credential, sharing one connection pool.
pub struct BearerFactory {
    http: reqwest::Client,
}

impl BearerFactory {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

impl ClientFactory for BearerFactory {
    type Client = ProbeClient;

    fn build(&self, key: &SelectedKey) -> ProbeClient {
        ProbeClient {
            http: self.http.clone(),
            token: key.secret.clone(),
        }
    }
}

/// Outcome counts for a probe run.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub no_credentials: usize,
}

/// Issue `requests` probes against `url`, at most `concurrency` at a time.
pub async fn run<F>(
    engine: Arc<ExecutionEngine<F>>,
    url: &str,
    requests: usize,
    concurrency: usize,
    max_retries: u32,
) -> ProbeSummary
where
    F: ClientFactory<Client = ProbeClient> + 'static,
{
    let url: Arc<str> = Arc::from(url);
    let permits = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut tasks = JoinSet::new();

    for request in 0..requests {
        let engine = Arc::clone(&engine);
        let url = Arc::clone(&url);
        let permits = Arc::clone(&permits);
        tasks.spawn(async move {
            let _permit = permits.acquire_owned().await;
            let outcome = engine
                .execute_observed(
                    |client: ProbeClient| {
                        let url = Arc::clone(&url);
                        async move { client.get(&url).await }
                    },
                    max_retries,
                )
                .await;
            (request, outcome.map(|response| response.status().as_u16()))
        });
    }

    let mut summary = ProbeSummary::default();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((request, Ok(status))) => {
                debug!(request, status, "probe succeeded");
                summary.succeeded += 1;
            }
            Ok((request, Err(ExecuteError::NoCredentials(message)))) => {
                warn!(request, %message, "probe found no usable credential");
                summary.no_credentials += 1;
            }
            Ok((request, Err(ExecuteError::Upstream(err)))) => {
                warn!(request, error = %err, "probe failed");
                summary.failed += 1;
            }
            Err(e) => {
                error!(error = %e, "probe task aborted");
                summary.failed += 1;
            }
        }
    }
    summary
}

//! Key Probe
//!
//! Exercises an upstream endpoint through the credential-rotation engine:
//! 1. Loads engine, credential and probe settings from TOML
//! 2. Builds the pool, classifier and engine
//! 3. Sends the configured number of bearer-authenticated GET probes
//! 4. Prints the engine snapshot, pool health and Prometheus counters

mod config;
mod metrics;
mod probe;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use key_pool::ExecutionEngine;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::probe::BearerFactory;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    info!("starting key-probe");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle =
        metrics::install_recorder().context("failed to install Prometheus recorder")?;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        url = %config.probe.url,
        family = ?config.rotation.engine.family,
        keys = config.rotation.credentials.keys.len(),
        requests = config.probe.requests,
        concurrency = config.probe.concurrency,
        "configuration loaded"
    );

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.probe.timeout_secs))
        .build()
        .context("failed to build HTTP client")?;

    let engine = Arc::new(
        ExecutionEngine::new(
            Arc::new(config.rotation.build_pool()),
            config.rotation.engine.build_classifier(),
            BearerFactory::new(http),
        )
        .with_options(config.rotation.engine.engine_options()),
    );

    let summary = probe::run(
        Arc::clone(&engine),
        &config.probe.url,
        config.probe.requests,
        config.probe.concurrency,
        config.rotation.engine.max_retries,
    )
    .await;

    info!(
        succeeded = summary.succeeded,
        failed = summary.failed,
        no_credentials = summary.no_credentials,
        "probe run complete"
    );

    let report = serde_json::json!({
        "family": engine.classifier().family(),
        "summary": summary,
        "success_rate": engine.success_rate().await,
        "engine": engine.metrics().await,
        "pool": engine.pool().health().await,
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("failed to serialize report")?
    );
    print!("{}", prometheus_handle.render());

    if summary.succeeded == 0 {
        anyhow::bail!("no probe request succeeded");
    }
    Ok(())
}

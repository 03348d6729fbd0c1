//! Pushes the outcome of a run to a Prometheus Push Gateway.

use anyhow::{Context, Result};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::{error, info};
use url::Url;

use crate::backup::RunResult;
use crate::config::MetricsConfig;

const JOB_NAME: &str = "backup";

/// Reports `run` if metrics are enabled. Failures are logged and never
/// change the outcome of the run.
pub async fn report(config: &MetricsConfig, run: &RunResult) {
    if !config.enabled {
        info!("metrics disabled");
        return;
    }

    match push(config, run).await {
        Ok(()) => info!("pushed metrics"),
        Err(e) => error!("Failed to push metrics to Push Gateway: {:#}", e),
    }
}

async fn push(config: &MetricsConfig, run: &RunResult) -> Result<()> {
    let url = push_url(config)?;
    let client = Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()
        .context("Failed to build HTTP client")?;

    let response = client
        .post(url.clone())
        .header(reqwest::header::CONTENT_TYPE, "text/plain")
        .body(payload(run))
        .send()
        .await
        .with_context(|| format!("Failed to send metrics to {}", url))?;

    let status = response.status();
    if status != StatusCode::ACCEPTED {
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!(
            "Push Gateway returned {} instead of {}: {}",
            status,
            StatusCode::ACCEPTED,
            body.trim()
        );
    }
    Ok(())
}

fn push_url(config: &MetricsConfig) -> Result<Url> {
    let mut url = Url::parse(&config.push_gateway_host).with_context(|| {
        format!("Invalid Push Gateway host: {}", config.push_gateway_host)
    })?;
    url.path_segments_mut()
        .map_err(|_| {
            anyhow::anyhow!(
                "Push Gateway host cannot be a base URL: {}",
                config.push_gateway_host
            )
        })?
        .pop_if_empty()
        .extend(["metrics", "job", JOB_NAME, "host", config.label_host.as_str()]);
    Ok(url)
}

/// Plaintext exposition body: one `name value` pair per line.
fn payload(run: &RunResult) -> String {
    format!(
        "backup_success {}\nbackup_number_files {}\n",
        u8::from(run.success),
        run.total_entries
    )
}

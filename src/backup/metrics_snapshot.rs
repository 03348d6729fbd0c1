// backuptool/src/backup/metrics_snapshot.rs
use chrono::{DateTime, Utc};
use reqwest::Client;
use std::io::Write;
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

use super::archive::ArchiveSink;
use super::Backuper;
use crate::config::MetricsSourceConfig;
use crate::errors::{BackupError, Result};

/// Fetches a snapshot from a metrics server and stores the response body as one entry.
pub struct MetricsSnapshotBackuper {
    cfg: MetricsSourceConfig,
    client: Client,
}

impl MetricsSnapshotBackuper {
    pub fn new(cfg: MetricsSourceConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .map_err(|e| BackupError::SourceFetch {
                source_id: cfg.id.clone(),
                reason: format!("failed to build HTTP client: {}", e),
            })?;
        Ok(Self { cfg, client })
    }

    fn fetch_error(&self, reason: impl Into<String>) -> BackupError {
        BackupError::SourceFetch {
            source_id: self.cfg.id.clone(),
            reason: reason.into(),
        }
    }

    fn request_url(&self) -> Result<Url> {
        let parsed = if self.cfg.query.is_empty() {
            Url::parse(&self.cfg.endpoint)
        } else {
            Url::parse_with_params(&self.cfg.endpoint, &self.cfg.query)
        };
        parsed.map_err(|e| self.fetch_error(format!("invalid endpoint {}: {}", self.cfg.endpoint, e)))
    }
}

/// Entry name for a snapshot of `source_id` taken at `at`.
pub(crate) fn snapshot_entry_name(source_id: &str, at: DateTime<Utc>) -> String {
    format!("{}-{}.snapshot", source_id, at.format("%Y%m%dT%H%M%SZ"))
}

impl Backuper for MetricsSnapshotBackuper {
    async fn backup<W: Write>(&self, sink: &mut ArchiveSink<W>) -> Result<usize> {
        let url = self.request_url()?;
        info!("Fetching metrics snapshot from {}", url);

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| self.fetch_error(format!("request to {} failed: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("Metrics endpoint returned {}: {}", status, body.trim());
            return Err(self.fetch_error(format!("endpoint returned {}", status)));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| self.fetch_error(format!("failed to read response body: {}", e)))?;

        let taken_at = Utc::now();
        let name = snapshot_entry_name(&self.cfg.id, taken_at);
        let mtime = u64::try_from(taken_at.timestamp()).unwrap_or(0);
        sink.append_bytes(&name, mtime, &body)
            .map_err(|cause| BackupError::Archive {
                source_id: self.cfg.id.clone(),
                cause,
            })?;

        info!("Stored {} byte snapshot as {}", body.len(), name);
        Ok(1)
    }
}

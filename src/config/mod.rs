// backuptool/src/config/mod.rs
use anyhow::{Context, Result};
use chrono::format::{Item, StrftimeItems};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Locations searched, in order, when no config path is given on the command line.
pub const DEFAULT_CONFIG_PATHS: &[&str] = &["config.json", "/etc/backuptool/config.json"];

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub sources: Vec<SourceConfig>,
    pub upload: UploadConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// One configured origin of backup data. Declaration order is run order.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceConfig {
    Files(FilesSourceConfig),
    Metrics(MetricsSourceConfig),
}

#[derive(Debug, Clone, Deserialize)]
pub struct FilesSourceConfig {
    pub id: String,
    pub root: PathBuf,
    /// Name patterns a file's relative path must contain. Empty means every file.
    #[serde(default)]
    pub include: Vec<String>,
    /// Any path component containing one of these is skipped.
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
    #[serde(default = "default_true")]
    pub skip_special: bool,
    /// Folder inside the archive the tree is placed under.
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsSourceConfig {
    pub id: String,
    pub endpoint: String,
    #[serde(default)]
    pub query: Vec<(String, String)>,
    #[serde(default = "default_fetch_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    pub endpoint: String,
    #[serde(default = "default_region")]
    pub region: String,
    pub bucket: String,
    pub key_id: String,
    pub secret_access_key: String,
    /// strftime pattern applied to the run start time to name the archive.
    pub format: String,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,
    #[serde(default)]
    pub prefix: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub push_gateway_host: String,
    #[serde(default)]
    pub label_host: String,
    #[serde(default = "default_push_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_true() -> bool {
    true
}

fn default_fetch_timeout_secs() -> u64 {
    30
}

fn default_push_timeout_secs() -> u64 {
    10
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_content_type() -> String {
    "application/x-tar".to_string()
}

fn default_staging_dir() -> PathBuf {
    PathBuf::from("/var/tmp")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            push_gateway_host: String::new(),
            label_host: String::new(),
            timeout_secs: default_push_timeout_secs(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl SourceConfig {
    pub fn id(&self) -> &str {
        match self {
            SourceConfig::Files(cfg) => &cfg.id,
            SourceConfig::Metrics(cfg) => &cfg.id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SourceConfig::Files(_) => "files",
            SourceConfig::Metrics(_) => "metrics",
        }
    }

    /// Upper bound on how long the whole source may take, if any.
    pub fn timeout(&self) -> Option<Duration> {
        match self {
            SourceConfig::Files(cfg) => cfg.timeout_secs.map(Duration::from_secs),
            SourceConfig::Metrics(cfg) => Some(Duration::from_secs(cfg.timeout_secs)),
        }
    }
}

impl AppConfig {
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        Self::from_json_str(&config_content).with_context(|| {
            format!(
                "Invalid configuration in {}",
                config_path.display()
            )
        })
    }

    /// Loads the first config file that exists out of `DEFAULT_CONFIG_PATHS`.
    pub fn load_default() -> Result<Self> {
        let path = DEFAULT_CONFIG_PATHS
            .iter()
            .map(Path::new)
            .find(|p| p.is_file())
            .with_context(|| {
                format!(
                    "No configuration file found, looked in: {}",
                    DEFAULT_CONFIG_PATHS.join(", ")
                )
            })?;
        Self::load_from_json(path)
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let config: AppConfig =
            serde_json::from_str(content).context("Failed to parse configuration JSON")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for source in &self.sources {
            let id = source.id();
            if id.trim().is_empty() {
                anyhow::bail!("Source ids cannot be empty");
            }
            if !seen.insert(id) {
                anyhow::bail!("Duplicate source id: {}", id);
            }
            if let SourceConfig::Metrics(cfg) = source {
                Url::parse(&cfg.endpoint).with_context(|| {
                    format!("Invalid endpoint for metrics source {}: {}", id, cfg.endpoint)
                })?;
            }
        }

        if self.upload.bucket.trim().is_empty() {
            anyhow::bail!("upload.bucket cannot be empty");
        }
        Url::parse(&self.upload.endpoint)
            .with_context(|| format!("Invalid upload endpoint: {}", self.upload.endpoint))?;
        validate_strftime(&self.upload.format)
            .with_context(|| format!("Invalid upload.format: {}", self.upload.format))?;

        if self.metrics.enabled {
            Url::parse(&self.metrics.push_gateway_host).with_context(|| {
                format!(
                    "Invalid metrics.push_gateway_host: {}",
                    self.metrics.push_gateway_host
                )
            })?;
            if self.metrics.label_host.trim().is_empty() {
                anyhow::bail!("metrics.label_host must be set when metrics are enabled");
            }
        }
        Ok(())
    }
}

fn validate_strftime(format: &str) -> Result<()> {
    if format.trim().is_empty() {
        anyhow::bail!("format cannot be empty");
    }
    if StrftimeItems::new(format).any(|item| matches!(item, Item::Error)) {
        anyhow::bail!("format contains an unknown specifier");
    }
    Ok(())
}

mod logic;
pub(crate) mod archive;          // Gzip tar sink shared by every source
pub(crate) mod files;            // File-tree source
pub(crate) mod metrics_snapshot; // Metrics endpoint snapshot source
pub(crate) mod s3_upload;        // Object storage upload stage

use std::future::Future;
use std::io::Write;

use crate::config::{AppConfig, SourceConfig};
use crate::errors::Result;
use archive::ArchiveSink;
use files::FileTreeBackuper;
use metrics_snapshot::MetricsSnapshotBackuper;
use s3_upload::ObjectStore;

pub use logic::RunResult;

/// A configured origin of backup data.
///
/// Implementations write zero or more entries into the shared sink and
/// return how many they wrote. They never close the sink. On failure,
/// entries already written stay in the sink.
#[allow(async_fn_in_trait)]
pub trait Backuper {
    async fn backup<W: Write>(&self, sink: &mut ArchiveSink<W>) -> Result<usize>;
}

/// Closed set of source kinds the orchestrator dispatches over.
pub enum Source {
    Files(FileTreeBackuper),
    Metrics(MetricsSnapshotBackuper),
}

impl Source {
    pub fn from_config(config: &SourceConfig) -> Result<Self> {
        Ok(match config {
            SourceConfig::Files(cfg) => Source::Files(FileTreeBackuper::new(cfg.clone())),
            SourceConfig::Metrics(cfg) => {
                Source::Metrics(MetricsSnapshotBackuper::new(cfg.clone())?)
            }
        })
    }
}

impl Backuper for Source {
    async fn backup<W: Write>(&self, sink: &mut ArchiveSink<W>) -> Result<usize> {
        match self {
            Source::Files(b) => b.backup(sink).await,
            Source::Metrics(b) => b.backup(sink).await,
        }
    }
}

/// Public entry point for the backup process.
///
/// Stages an archive, runs every configured source into it in declaration
/// order, then uploads it as `object_name`. `run` is updated as the run
/// progresses so a caller still sees partial counts if this fails or
/// `shutdown` fires.
pub async fn run_backup_flow<S, F>(
    app_config: &AppConfig,
    store: &S,
    object_name: &str,
    run: &mut RunResult,
    shutdown: F,
) -> Result<()>
where
    S: ObjectStore,
    F: Future<Output = &'static str>,
{
    logic::perform_backup_orchestration(app_config, store, object_name, run, shutdown).await
}

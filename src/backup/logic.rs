// backuptool/src/backup/logic.rs
use std::fs::File;
use std::future::Future;
use std::io::{BufWriter, Write};
use std::pin::Pin;
use tempfile::{Builder as TempFileBuilder, NamedTempFile};
use tracing::{error, info, info_span, warn, Instrument};

use super::archive::ArchiveSink;
use super::s3_upload::{ObjectStore, ARCHIVE_SUFFIX};
use super::{Backuper, Source};
use crate::config::{AppConfig, SourceConfig};
use crate::errors::{ArchiveError, BackupError, Result};

/// Where a run currently is. `Aborted` is reachable from every state but `Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunState {
    #[default]
    Init,
    ArchiveOpened,
    RunningSource,
    ArchiveClosed,
    Uploading,
    Done,
    Aborted,
}

/// Aggregate outcome of one run, read by the metrics reporter at exit.
#[derive(Debug, Default)]
pub struct RunResult {
    pub total_entries: usize,
    pub per_source: Vec<(String, usize)>,
    pub success: bool,
    pub state: RunState,
}

impl RunResult {
    fn record(&mut self, source_id: &str, entries: usize) {
        self.total_entries += entries;
        self.per_source.push((source_id.to_string(), entries));
    }

    pub fn abort(&mut self) {
        self.success = false;
        self.state = RunState::Aborted;
    }
}

/// Runs the whole pipeline and settles `run` into `Done` or `Aborted`.
///
/// `shutdown` resolves with a signal name when the run must stop. It is raced
/// against every source and the upload; the stage in flight stops at its next
/// await point and the run aborts with `Interrupted`.
pub async fn perform_backup_orchestration<S, F>(
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
    tokio::pin!(shutdown);
    let outcome = run_pipeline(app_config, store, object_name, run, shutdown).await;
    match &outcome {
        Ok(()) => {
            run.state = RunState::Done;
            run.success = true;
            info!(
                "✅ Backup {} completed with {} entries",
                object_name, run.total_entries
            );
        }
        Err(e) => {
            run.abort();
            error!("❌ Backup {} aborted: {}", object_name, e);
        }
    }
    outcome
}

async fn run_pipeline<S, F>(
    app_config: &AppConfig,
    store: &S,
    object_name: &str,
    run: &mut RunResult,
    mut shutdown: Pin<&mut F>,
) -> Result<()>
where
    S: ObjectStore,
    F: Future<Output = &'static str>,
{
    let upload = &app_config.upload;

    // INIT -> ARCHIVE_OPENED. The staged file is removed when `staged` drops,
    // including when this future is dropped on shutdown.
    let staged = create_staged_file(app_config, object_name)?;
    let destination = staged
        .as_file()
        .try_clone()
        .map_err(|cause| BackupError::StageCreate {
            path: staged.path().to_path_buf(),
            cause,
        })?;
    let mut sink = ArchiveSink::new(BufWriter::new(destination));
    run.state = RunState::ArchiveOpened;
    info!("📦 Staging archive at {}", staged.path().display());

    let sources_outcome =
        run_sources(&app_config.sources, &mut sink, run, shutdown.as_mut()).await;

    // The archive is closed on every path; a source failure still wins over a close failure.
    let close_outcome = finish_archive(&mut sink);
    if let Err(e) = sources_outcome {
        if let Err(close_err) = close_outcome {
            warn!("Closing partial archive also failed: {}", close_err);
        }
        discard_staged(staged);
        return Err(e);
    }
    if let Err(cause) = close_outcome {
        let path = staged.path().to_path_buf();
        discard_staged(staged);
        return Err(BackupError::StageClose { path, cause });
    }
    run.state = RunState::ArchiveClosed;
    info!(
        "Archive closed with {} entries from {} sources",
        run.total_entries,
        run.per_source.len()
    );

    run.state = RunState::Uploading;
    let upload_outcome = until_shutdown(
        store.put_object(&upload.bucket, object_name, staged.path(), &upload.content_type),
        shutdown,
    )
    .await;
    discard_staged(staged);
    upload_outcome
}

fn create_staged_file(app_config: &AppConfig, object_name: &str) -> Result<NamedTempFile> {
    let staging_dir = &app_config.upload.staging_dir;
    let stem = object_name
        .rsplit('/')
        .next()
        .unwrap_or(object_name)
        .trim_end_matches(ARCHIVE_SUFFIX);

    TempFileBuilder::new()
        .prefix(&format!("{}-", stem))
        .suffix(ARCHIVE_SUFFIX)
        .tempfile_in(staging_dir)
        .map_err(|cause| BackupError::StageCreate {
            path: staging_dir.clone(),
            cause,
        })
}

/// Resolves with `work`, or with `Interrupted` if `shutdown` fires first.
async fn until_shutdown<T, F>(
    work: impl Future<Output = Result<T>>,
    shutdown: Pin<&mut F>,
) -> Result<T>
where
    F: Future<Output = &'static str>,
{
    tokio::select! {
        outcome = work => outcome,
        signal = shutdown => Err(BackupError::Interrupted(signal)),
    }
}

/// Invokes every source in declaration order, stopping at the first failure.
async fn run_sources<W, F>(
    sources: &[SourceConfig],
    sink: &mut ArchiveSink<W>,
    run: &mut RunResult,
    mut shutdown: Pin<&mut F>,
) -> Result<()>
where
    W: Write,
    F: Future<Output = &'static str>,
{
    for source in sources {
        run.state = RunState::RunningSource;
        let id = source.id();
        let span = info_span!("source", id = id, kind = source.kind());
        info!(parent: &span, "Backing up {}.{}", source.kind(), id);

        let before = sink.entries_written();
        let outcome = match Source::from_config(source) {
            Ok(backuper) => {
                let backup = backuper.backup(sink).instrument(span.clone());
                let bounded = async {
                    match source.timeout() {
                        Some(limit) => match tokio::time::timeout(limit, backup).await {
                            Ok(outcome) => outcome,
                            Err(_) => Err(BackupError::SourceTimeout {
                                source_id: id.to_string(),
                                after: limit,
                            }),
                        },
                        None => backup.await,
                    }
                };
                until_shutdown(bounded, shutdown.as_mut()).await
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(count) => {
                info!(parent: &span, "Backed up {} entries", count);
                run.record(id, count);
            }
            Err(e) => {
                let partial = sink.entries_written() - before;
                error!(parent: &span, "Backup failed after {} entries: {}", partial, e);
                run.record(id, partial);
                return Err(e);
            }
        }
    }
    Ok(())
}

/// Flushes the tar trailer, gzip footer and file buffers to disk.
fn finish_archive(sink: &mut ArchiveSink<BufWriter<File>>) -> std::result::Result<(), ArchiveError> {
    let writer = sink.close()?;
    let file = writer.into_inner().map_err(|e| ArchiveError::Io(e.into_error()))?;
    file.sync_all()?;
    Ok(())
}

fn discard_staged(staged: NamedTempFile) {
    let path = staged.path().to_path_buf();
    match staged.close() {
        Ok(()) => info!("🧹 Removed staged archive {}", path.display()),
        Err(e) => error!("Failed to remove staged archive {}: {}", path.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::archive::tests::read_entries;
    use serde_json::json;
    use std::fs;
    use std::io;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Keeps a copy of every archive it receives.
    #[derive(Default)]
    struct RecordingStore {
        uploads: Mutex<Vec<(String, String, Vec<u8>)>>,
        staged_paths: Mutex<Vec<PathBuf>>,
    }

    impl ObjectStore for RecordingStore {
        async fn put_object(
            &self,
            bucket: &str,
            object_name: &str,
            source_path: &Path,
            _content_type: &str,
        ) -> Result<()> {
            let bytes = fs::read(source_path).unwrap();
            self.staged_paths.lock().unwrap().push(source_path.to_path_buf());
            self.uploads
                .lock()
                .unwrap()
                .push((bucket.to_string(), object_name.to_string(), bytes));
            Ok(())
        }
    }

    struct FailingStore;

    impl ObjectStore for FailingStore {
        async fn put_object(
            &self,
            _bucket: &str,
            object_name: &str,
            source_path: &Path,
            _content_type: &str,
        ) -> Result<()> {
            assert!(source_path.exists());
            Err(BackupError::UploadTransfer {
                object: object_name.to_string(),
                reason: "connection reset".to_string(),
            })
        }
    }

    fn app_config(staging_dir: &Path, sources: serde_json::Value) -> AppConfig {
        let value = json!({
            "sources": sources,
            "upload": {
                "endpoint": "https://s3.example.com",
                "bucket": "backups",
                "key_id": "key",
                "secret_access_key": "secret",
                "format": "%Y%m%d",
                "staging_dir": staging_dir,
            }
        });
        AppConfig::from_json_str(&value.to_string()).unwrap()
    }

    fn sample_tree() -> TempDir {
        let tree = TempDir::new().unwrap();
        fs::create_dir(tree.path().join("sub")).unwrap();
        fs::write(tree.path().join("a.txt"), b"0123456789").unwrap();
        fs::write(tree.path().join("sub/b.txt"), b"hello").unwrap();
        tree
    }

    /// Destination that stalls on every write, so archiving a large file takes seconds.
    struct SlowWriter;

    impl Write for SlowWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            std::thread::sleep(Duration::from_millis(20));
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Incompressible content, so gzip output reaches the destination steadily.
    fn write_noise(path: &Path, len: usize) {
        let mut state: u32 = 0x2545_f491;
        let bytes: Vec<u8> = (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                state as u8
            })
            .collect();
        fs::write(path, bytes).unwrap();
    }

    fn no_shutdown() -> std::future::Pending<&'static str> {
        std::future::pending()
    }

    fn staging_is_empty(staging: &TempDir) -> bool {
        fs::read_dir(staging.path()).unwrap().next().is_none()
    }

    #[tokio::test]
    async fn test_successful_run_uploads_archive() {
        let staging = TempDir::new().unwrap();
        let tree = sample_tree();
        let config = app_config(
            staging.path(),
            json!([{ "type": "files", "id": "tree", "root": tree.path() }]),
        );
        let store = RecordingStore::default();
        let mut run = RunResult::default();

        perform_backup_orchestration(&config, &store, "20240102.tar.gz", &mut run, no_shutdown())
            .await
            .unwrap();

        assert!(run.success);
        assert_eq!(run.state, RunState::Done);
        assert_eq!(run.total_entries, 2);
        assert_eq!(run.per_source, vec![("tree".to_string(), 2)]);

        let uploads = store.uploads.lock().unwrap();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].0, "backups");
        assert_eq!(uploads[0].1, "20240102.tar.gz");
        let entries = read_entries(&uploads[0].2);
        let summary: Vec<(&str, u64)> = entries.iter().map(|e| (e.0.as_str(), e.1)).collect();
        assert_eq!(summary, vec![("a.txt", 10), ("sub/b.txt", 5)]);

        let staged = &store.staged_paths.lock().unwrap()[0];
        assert!(staged.starts_with(staging.path()));
        assert!(!staged.exists());
        assert!(staging_is_empty(&staging));
    }

    #[tokio::test]
    async fn test_same_tree_twice_gives_same_entries() {
        let staging = TempDir::new().unwrap();
        let tree = sample_tree();
        let config = app_config(
            staging.path(),
            json!([{ "type": "files", "id": "tree", "root": tree.path() }]),
        );
        let store = RecordingStore::default();

        for object in ["first.tar.gz", "second.tar.gz"] {
            let mut run = RunResult::default();
            perform_backup_orchestration(&config, &store, object, &mut run, no_shutdown())
                .await
                .unwrap();
        }

        let uploads = store.uploads.lock().unwrap();
        let listing = |bytes: &[u8]| -> Vec<(String, u64, Vec<u8>)> {
            read_entries(bytes).into_iter().map(|e| (e.0, e.1, e.3)).collect()
        };
        assert_eq!(listing(&uploads[0].2), listing(&uploads[1].2));
    }

    #[tokio::test]
    async fn test_failed_metrics_source_skips_upload() {
        let staging = TempDir::new().unwrap();
        let tree = sample_tree();
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&mock_server)
            .await;

        let config = app_config(
            staging.path(),
            json!([
                { "type": "files", "id": "tree", "root": tree.path() },
                { "type": "metrics", "id": "prom", "endpoint": mock_server.uri() }
            ]),
        );
        let store = RecordingStore::default();
        let mut run = RunResult::default();

        let err = perform_backup_orchestration(&config, &store, "x.tar.gz", &mut run, no_shutdown())
            .await
            .unwrap_err();

        assert!(matches!(err, BackupError::SourceFetch { ref source_id, .. } if source_id == "prom"));
        assert!(!run.success);
        assert_eq!(run.state, RunState::Aborted);
        assert_eq!(run.total_entries, 2);
        assert!(store.uploads.lock().unwrap().is_empty());
        assert!(staging_is_empty(&staging));
    }

    #[tokio::test]
    async fn test_first_failure_skips_remaining_sources() {
        let staging = TempDir::new().unwrap();
        let tree = sample_tree();
        let config = app_config(
            staging.path(),
            json!([
                { "type": "files", "id": "missing", "root": tree.path().join("nope") },
                { "type": "files", "id": "tree", "root": tree.path() }
            ]),
        );
        let store = RecordingStore::default();
        let mut run = RunResult::default();

        let err = perform_backup_orchestration(&config, &store, "x.tar.gz", &mut run, no_shutdown())
            .await
            .unwrap_err();

        assert!(matches!(err, BackupError::SourceRead { .. }));
        assert_eq!(run.per_source, vec![("missing".to_string(), 0)]);
        assert!(store.uploads.lock().unwrap().is_empty());
        assert!(staging_is_empty(&staging));
    }

    #[tokio::test]
    async fn test_colliding_sources_abort() {
        let staging = TempDir::new().unwrap();
        let tree = sample_tree();
        let config = app_config(
            staging.path(),
            json!([
                { "type": "files", "id": "one", "root": tree.path() },
                { "type": "files", "id": "two", "root": tree.path() }
            ]),
        );
        let store = RecordingStore::default();
        let mut run = RunResult::default();

        let err = perform_backup_orchestration(&config, &store, "x.tar.gz", &mut run, no_shutdown())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            BackupError::Archive { cause: ArchiveError::State(_), .. }
        ));
        assert_eq!(run.total_entries, 2);
        assert!(staging_is_empty(&staging));
    }

    #[tokio::test]
    async fn test_prefixes_keep_sources_apart() {
        let staging = TempDir::new().unwrap();
        let tree = sample_tree();
        let config = app_config(
            staging.path(),
            json!([
                { "type": "files", "id": "one", "root": tree.path(), "prefix": "one" },
                { "type": "files", "id": "two", "root": tree.path(), "prefix": "two" }
            ]),
        );
        let store = RecordingStore::default();
        let mut run = RunResult::default();

        perform_backup_orchestration(&config, &store, "x.tar.gz", &mut run, no_shutdown())
            .await
            .unwrap();

        assert_eq!(run.total_entries, 4);
        let uploads = store.uploads.lock().unwrap();
        let names: Vec<String> = read_entries(&uploads[0].2).into_iter().map(|e| e.0).collect();
        assert_eq!(names, vec!["one/a.txt", "one/sub/b.txt", "two/a.txt", "two/sub/b.txt"]);
    }

    #[tokio::test]
    async fn test_upload_failure_still_removes_staged_file() {
        let staging = TempDir::new().unwrap();
        let tree = sample_tree();
        let config = app_config(
            staging.path(),
            json!([{ "type": "files", "id": "tree", "root": tree.path() }]),
        );
        let mut run = RunResult::default();

        let err = perform_backup_orchestration(&config, &FailingStore, "x.tar.gz", &mut run, no_shutdown())
            .await
            .unwrap_err();

        assert!(matches!(err, BackupError::UploadTransfer { .. }));
        assert!(!run.success);
        assert_eq!(run.state, RunState::Aborted);
        assert_eq!(run.total_entries, 2);
        assert!(staging_is_empty(&staging));
    }

    #[tokio::test]
    async fn test_missing_staging_dir_is_stage_create_error() {
        let staging = TempDir::new().unwrap();
        let config = app_config(&staging.path().join("absent"), json!([]));
        let store = RecordingStore::default();
        let mut run = RunResult::default();

        let err = perform_backup_orchestration(&config, &store, "x.tar.gz", &mut run, no_shutdown())
            .await
            .unwrap_err();

        assert!(matches!(err, BackupError::StageCreate { .. }));
        assert_eq!(run.state, RunState::Aborted);
        assert!(store.uploads.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_slow_source_times_out() {
        let staging = TempDir::new().unwrap();
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&mock_server)
            .await;

        let config = app_config(
            staging.path(),
            json!([{ "type": "metrics", "id": "prom", "endpoint": mock_server.uri(), "timeout_secs": 1 }]),
        );
        let store = RecordingStore::default();
        let mut run = RunResult::default();

        let err = perform_backup_orchestration(&config, &store, "x.tar.gz", &mut run, no_shutdown())
            .await
            .unwrap_err();

        // The HTTP client and the source bound share the same limit; either may fire first.
        assert!(matches!(
            err,
            BackupError::SourceTimeout { .. } | BackupError::SourceFetch { .. }
        ));
        assert!(staging_is_empty(&staging));
    }

    #[tokio::test]
    async fn test_dropped_run_removes_staged_file() {
        let staging = TempDir::new().unwrap();
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(30)))
            .mount(&mock_server)
            .await;

        let config = app_config(
            staging.path(),
            json!([{ "type": "metrics", "id": "prom", "endpoint": mock_server.uri(), "timeout_secs": 60 }]),
        );
        let store = RecordingStore::default();
        let mut run = RunResult::default();

        let interrupted = tokio::time::timeout(
            Duration::from_millis(500),
            perform_backup_orchestration(&config, &store, "x.tar.gz", &mut run, no_shutdown()),
        )
        .await;

        assert!(interrupted.is_err());
        assert_eq!(run.state, RunState::RunningSource);
        assert!(staging_is_empty(&staging));
    }

    #[tokio::test]
    async fn test_large_file_source_times_out_midway() {
        let tree = TempDir::new().unwrap();
        write_noise(&tree.path().join("big.bin"), 8 * 1024 * 1024);
        let config = app_config(
            tree.path(),
            json!([{ "type": "files", "id": "tree", "root": tree.path(), "timeout_secs": 1 }]),
        );
        let mut sink = ArchiveSink::new(SlowWriter);
        let mut run = RunResult::default();

        let started = Instant::now();
        let err = run_sources(
            &config.sources,
            &mut sink,
            &mut run,
            std::pin::pin!(no_shutdown()),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, BackupError::SourceTimeout { ref source_id, .. } if source_id == "tree"));
        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(run.per_source, vec![("tree".to_string(), 0)]);
    }

    #[tokio::test]
    async fn test_shutdown_keeps_partial_count() {
        let tree = TempDir::new().unwrap();
        fs::write(tree.path().join("a.txt"), b"0123456789").unwrap();
        write_noise(&tree.path().join("big.bin"), 8 * 1024 * 1024);
        let config = app_config(
            tree.path(),
            json!([{ "type": "files", "id": "tree", "root": tree.path() }]),
        );
        let mut sink = ArchiveSink::new(SlowWriter);
        let mut run = RunResult::default();
        let shutdown = std::pin::pin!(async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            "SIGTERM"
        });

        let started = Instant::now();
        let err = run_sources(&config.sources, &mut sink, &mut run, shutdown)
            .await
            .unwrap_err();

        assert!(matches!(err, BackupError::Interrupted("SIGTERM")));
        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(run.total_entries, 1);
        assert_eq!(run.per_source, vec![("tree".to_string(), 1)]);
    }

    #[tokio::test]
    async fn test_shutdown_aborts_run_and_removes_staged_file() {
        let staging = TempDir::new().unwrap();
        let tree = sample_tree();
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(30)))
            .mount(&mock_server)
            .await;

        let config = app_config(
            staging.path(),
            json!([
                { "type": "files", "id": "tree", "root": tree.path() },
                { "type": "metrics", "id": "prom", "endpoint": mock_server.uri(), "timeout_secs": 60 }
            ]),
        );
        let store = RecordingStore::default();
        let mut run = RunResult::default();
        let shutdown = async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            "SIGINT"
        };

        let err = perform_backup_orchestration(&config, &store, "x.tar.gz", &mut run, shutdown)
            .await
            .unwrap_err();

        assert!(matches!(err, BackupError::Interrupted("SIGINT")));
        assert!(!run.success);
        assert_eq!(run.state, RunState::Aborted);
        assert_eq!(run.total_entries, 2);
        assert_eq!(
            run.per_source,
            vec![("tree".to_string(), 2), ("prom".to_string(), 0)]
        );
        assert!(store.uploads.lock().unwrap().is_empty());
        assert!(staging_is_empty(&staging));
    }
}

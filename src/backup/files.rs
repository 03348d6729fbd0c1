// backuptool/src/backup/files.rs
use std::io::{self, ErrorKind, Write};
use std::path::{Component, Path};
use std::time::UNIX_EPOCH;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::{debug, info};
use walkdir::{DirEntry, WalkDir};

use super::archive::ArchiveSink;
use super::Backuper;
use crate::config::FilesSourceConfig;
use crate::errors::{ArchiveError, BackupError, Result};

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Walks a directory tree and archives every regular file under its path
/// relative to the root.
pub struct FileTreeBackuper {
    cfg: FilesSourceConfig,
}

impl FileTreeBackuper {
    pub fn new(cfg: FilesSourceConfig) -> Self {
        Self { cfg }
    }

    fn read_error(&self, path: &Path, cause: io::Error) -> BackupError {
        BackupError::SourceRead {
            source_id: self.cfg.id.clone(),
            path: path.to_path_buf(),
            cause,
        }
    }

    fn archive_error(&self, cause: ArchiveError) -> BackupError {
        BackupError::Archive {
            source_id: self.cfg.id.clone(),
            cause,
        }
    }

    fn is_excluded(&self, entry: &DirEntry) -> bool {
        if entry.depth() == 0 {
            return false;
        }
        let file_name = entry.file_name().to_string_lossy();
        self.cfg
            .exclude
            .iter()
            .any(|pattern| file_name.contains(pattern.as_str()))
    }

    fn is_included(&self, name: &str) -> bool {
        self.cfg.include.is_empty()
            || self
                .cfg
                .include
                .iter()
                .any(|pattern| name.contains(pattern.as_str()))
    }

    /// Streams one file into the sink under `name`. Every chunk read is an
    /// await point, so timeouts and shutdown can stop a large file midway.
    async fn archive_file<W: Write>(
        &self,
        sink: &mut ArchiveSink<W>,
        entry: &DirEntry,
        name: &str,
    ) -> Result<()> {
        let path = entry.path();
        let metadata = entry
            .metadata()
            .map_err(|e| self.read_error(path, e.into()))?;
        let size = metadata.len();
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let file = File::open(path)
            .await
            .map_err(|e| self.read_error(path, e))?;
        // A file that grows while being read is cut at the size recorded in the header.
        let mut reader = file.take(size);

        sink.open_entry(name, size, mtime)
            .map_err(|e| self.archive_error(e))?;

        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(self.read_error(path, e)),
            };
            sink.write(&buf[..n]).map_err(|e| self.archive_error(e))?;
        }

        sink.close_entry().map_err(|e| self.archive_error(e))?;
        debug!("Archived {} as {} ({} bytes)", path.display(), name, size);
        Ok(())
    }
}

impl Backuper for FileTreeBackuper {
    async fn backup<W: Write>(&self, sink: &mut ArchiveSink<W>) -> Result<usize> {
        let root = &self.cfg.root;
        let root_metadata = std::fs::metadata(root).map_err(|e| self.read_error(root, e))?;
        if !root_metadata.is_dir() {
            return Err(self.read_error(
                root,
                io::Error::other("backup root is not a directory"),
            ));
        }
        std::fs::read_dir(root).map_err(|e| self.read_error(root, e))?;

        info!("Backing up file tree {}", root.display());

        let walker = WalkDir::new(root)
            .follow_links(self.cfg.follow_symlinks)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !self.is_excluded(e));

        let mut written = 0;
        for entry in walker {
            let entry = entry.map_err(|e| {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.clone());
                self.read_error(&path, e.into())
            })?;
            let file_type = entry.file_type();

            if file_type.is_dir() {
                continue;
            }
            if file_type.is_symlink() {
                // Only reached when links are not followed.
                debug!("Skipping symlink {}", entry.path().display());
                continue;
            }
            if !file_type.is_file() {
                if self.cfg.skip_special {
                    debug!("Skipping special file {}", entry.path().display());
                    continue;
                }
                return Err(self.read_error(
                    entry.path(),
                    io::Error::other("special files cannot be archived"),
                ));
            }

            let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
            let relative_name = entry_name(None, relative).ok_or_else(|| {
                self.read_error(
                    entry.path(),
                    io::Error::new(ErrorKind::InvalidData, "file name is not valid UTF-8"),
                )
            })?;
            if !self.is_included(&relative_name) {
                continue;
            }
            let name = match self.cfg.prefix.as_deref() {
                Some(prefix) => entry_name(Some(prefix), relative).unwrap_or(relative_name),
                None => relative_name,
            };

            self.archive_file(sink, &entry, &name).await?;
            written += 1;
        }

        info!("Backed up {} files from {}", written, root.display());
        Ok(written)
    }
}

/// Builds a forward-slash archive name from a path relative to the source root.
pub(crate) fn entry_name(prefix: Option<&str>, relative: &Path) -> Option<String> {
    let mut parts: Vec<&str> = Vec::new();
    if let Some(prefix) = prefix {
        parts.extend(prefix.split('/').filter(|p| !p.is_empty()));
    }
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

// backuptool/src/backup/archive.rs
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::HashSet;
use std::io::{self, Write};
use std::path::{Component, Path};
use tar::{Builder, EntryType, Header};
use tracing::{debug, warn};

use crate::errors::ArchiveError;

const BLOCK_SIZE: u64 = 512;
const NAME_FIELD_LEN: usize = 100;
const LONG_NAME_MARKER: &[u8] = b"././@LongLink";

struct OpenEntry {
    name: String,
    declared: u64,
    written: u64,
}

/// Gzip-compressed tar stream that sources write named entries into.
///
/// Entries are written strictly one at a time: `open_entry`, any number of
/// `write` calls, then `close_entry`. The declared size is written into the
/// tar header up front, so the bytes written must match it exactly.
///
/// `close` flushes the tar trailer and the gzip footer and hands back the
/// destination. Dropping an unclosed sink still finalizes the stream.
pub struct ArchiveSink<W: Write> {
    builder: Option<Builder<GzEncoder<W>>>,
    open: Option<OpenEntry>,
    names: HashSet<String>,
    entries_written: usize,
    poisoned: bool,
}

impl<W: Write> ArchiveSink<W> {
    pub fn new(destination: W) -> Self {
        let encoder = GzEncoder::new(destination, Compression::default());
        Self {
            builder: Some(Builder::new(encoder)),
            open: None,
            names: HashSet::new(),
            entries_written: 0,
            poisoned: false,
        }
    }

    /// Number of entries fully written so far.
    pub fn entries_written(&self) -> usize {
        self.entries_written
    }

    /// Begins a new regular-file entry of `size` bytes modified at `mtime` (unix seconds).
    pub fn open_entry(&mut self, name: &str, size: u64, mtime: u64) -> Result<(), ArchiveError> {
        if self.builder.is_none() {
            return Err(ArchiveError::Closed);
        }
        if let Some(open) = &self.open {
            return Err(ArchiveError::State(format!(
                "cannot open {}: entry {} is still open",
                name, open.name
            )));
        }
        if self.poisoned {
            return Err(ArchiveError::State(format!(
                "cannot open {}: a previous entry was left incomplete",
                name
            )));
        }
        validate_entry_name(name)?;
        if self.names.contains(name) {
            return Err(ArchiveError::State(format!("duplicate entry name: {}", name)));
        }

        let builder = self.builder.as_mut().ok_or(ArchiveError::Closed)?;
        if name.len() > NAME_FIELD_LEN {
            append_long_name(builder, name)?;
        }

        let mut header = Header::new_gnu();
        write_name_field(&mut header, name);
        header.set_entry_type(EntryType::Regular);
        header.set_mode(0o644);
        header.set_uid(0);
        header.set_gid(0);
        header.set_size(size);
        header.set_mtime(mtime);
        header.set_cksum();
        builder.get_mut().write_all(header.as_bytes())?;

        debug!("Opened archive entry {} ({} bytes)", name, size);
        self.names.insert(name.to_string());
        self.open = Some(OpenEntry {
            name: name.to_string(),
            declared: size,
            written: 0,
        });
        Ok(())
    }

    /// Appends bytes to the currently open entry.
    pub fn write(&mut self, buf: &[u8]) -> Result<(), ArchiveError> {
        let builder = self.builder.as_mut().ok_or(ArchiveError::Closed)?;
        let open = self
            .open
            .as_mut()
            .ok_or_else(|| ArchiveError::Io(io::Error::other("no archive entry is open")))?;

        let after = open.written + buf.len() as u64;
        if after > open.declared {
            self.poisoned = true;
            return Err(ArchiveError::SizeMismatch {
                name: open.name.clone(),
                declared: open.declared,
                written: after,
            });
        }

        if let Err(e) = builder.get_mut().write_all(buf) {
            self.poisoned = true;
            return Err(ArchiveError::Io(e));
        }
        open.written = after;
        Ok(())
    }

    /// Finalizes the open entry, padding it to the tar block size.
    pub fn close_entry(&mut self) -> Result<(), ArchiveError> {
        let builder = self.builder.as_mut().ok_or(ArchiveError::Closed)?;
        let open = self
            .open
            .take()
            .ok_or_else(|| ArchiveError::State("no archive entry is open".to_string()))?;

        if open.written != open.declared {
            self.poisoned = true;
            return Err(ArchiveError::SizeMismatch {
                name: open.name,
                declared: open.declared,
                written: open.written,
            });
        }

        let remainder = open.written % BLOCK_SIZE;
        if remainder != 0 {
            let padding = [0u8; BLOCK_SIZE as usize];
            builder
                .get_mut()
                .write_all(&padding[..(BLOCK_SIZE - remainder) as usize])?;
        }

        self.entries_written += 1;
        Ok(())
    }

    /// Writes a complete entry from an in-memory payload.
    pub fn append_bytes(&mut self, name: &str, mtime: u64, data: &[u8]) -> Result<(), ArchiveError> {
        self.open_entry(name, data.len() as u64, mtime)?;
        self.write(data)?;
        self.close_entry()
    }

    /// Writes the tar trailer and gzip footer and returns the destination.
    ///
    /// Fails with `ArchiveError::Closed` when called a second time.
    pub fn close(&mut self) -> Result<W, ArchiveError> {
        let builder = self.builder.take().ok_or(ArchiveError::Closed)?;
        if let Some(open) = self.open.take() {
            warn!(
                "Closing archive with entry {} incomplete ({} of {} bytes)",
                open.name, open.written, open.declared
            );
        }
        let encoder = builder.into_inner()?;
        let destination = encoder.finish()?;
        Ok(destination)
    }
}

/// Entry names are relative, forward-slash separated and never climb out of the archive root.
fn validate_entry_name(name: &str) -> Result<(), ArchiveError> {
    if name.is_empty() || name.starts_with('/') || name.ends_with('/') {
        return Err(ArchiveError::State(format!("invalid entry name: {:?}", name)));
    }
    let climbs = Path::new(name)
        .components()
        .any(|c| !matches!(c, Component::Normal(_)));
    if climbs {
        return Err(ArchiveError::State(format!("invalid entry name: {:?}", name)));
    }
    Ok(())
}

fn write_name_field(header: &mut Header, name: &str) {
    let field = &mut header.as_old_mut().name;
    let bytes = name.as_bytes();
    let len = bytes.len().min(field.len());
    field[..len].copy_from_slice(&bytes[..len]);
}

/// Emits a GNU long-name record so the following header may carry a truncated name.
fn append_long_name<W: Write>(builder: &mut Builder<W>, name: &str) -> io::Result<()> {
    let mut data = Vec::with_capacity(name.len() + 1);
    data.extend_from_slice(name.as_bytes());
    data.push(0);

    let mut header = Header::new_gnu();
    header.as_old_mut().name[..LONG_NAME_MARKER.len()].copy_from_slice(LONG_NAME_MARKER);
    header.set_entry_type(EntryType::GNULongName);
    header.set_mode(0o644);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(0);
    header.set_size(data.len() as u64);
    header.set_cksum();
    builder.append(&header, data.as_slice())
}

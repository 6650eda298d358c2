//! Local filesystem backend.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use tempfile::NamedTempFile;

use transit_core::{TransferError, TransferResult};

use crate::backend::{ByteSink, ReadStream, StorageBackend};
use crate::handle::{EntryInfo, EntryKind, Metadata, PathHandle, Scheme};

/// Backend for the local filesystem.
#[derive(Debug, Default)]
pub struct LocalBackend;

impl LocalBackend {
    /// The shared local backend instance.
    pub fn shared() -> Arc<dyn StorageBackend> {
        static SHARED: OnceLock<Arc<LocalBackend>> = OnceLock::new();
        let backend = SHARED.get_or_init(|| Arc::new(LocalBackend));
        Arc::clone(backend) as Arc<dyn StorageBackend>
    }

    /// A handle for a local path.
    pub fn handle(path: impl Into<PathBuf>) -> PathHandle {
        PathHandle::new(Self::shared(), path)
    }
}

fn path_str(path: &Path) -> String {
    path.display().to_string()
}

fn kind_of(file_type: fs::FileType) -> EntryKind {
    if file_type.is_symlink() {
        EntryKind::Symlink
    } else if file_type.is_dir() {
        EntryKind::Directory
    } else {
        EntryKind::File
    }
}

#[cfg(unix)]
fn permissions_of(meta: &fs::Metadata) -> Option<u32> {
    Some(meta.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn permissions_of(_meta: &fs::Metadata) -> Option<u32> {
    None
}

#[cfg(unix)]
fn set_mode(file: &fs::File, mode: u32) -> io::Result<()> {
    file.set_permissions(fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_file: &fs::File, _mode: u32) -> io::Result<()> {
    Ok(())
}

impl StorageBackend for LocalBackend {
    fn scheme(&self) -> Scheme {
        Scheme::Local
    }

    fn store_id(&self) -> String {
        "local".to_string()
    }

    fn uri(&self, location: &Path) -> String {
        format!("file://{}", location.display())
    }

    fn display(&self, location: &Path) -> String {
        path_str(location)
    }

    fn display_prefix(&self) -> &'static str {
        ""
    }

    fn stat(&self, location: &Path) -> TransferResult<Metadata> {
        let io_err = |e: io::Error| TransferError::io(path_str(location), e);
        let meta = fs::symlink_metadata(location).map_err(io_err)?;
        let base = match kind_of(meta.file_type()) {
            EntryKind::Symlink => Metadata::symlink(fs::read_link(location).map_err(io_err)?),
            EntryKind::Directory => Metadata::directory(),
            EntryKind::File => Metadata::file(meta.len()),
        };
        Ok(base
            .with_modified(meta.modified().ok())
            .with_permissions(permissions_of(&meta)))
    }

    fn list(&self, location: &Path) -> TransferResult<Vec<EntryInfo>> {
        let entries = fs::read_dir(location).map_err(|e| TransferError::io(path_str(location), e))?;

        let mut result = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| TransferError::io(path_str(location), e))?;
            let (kind, size) = match entry.metadata() {
                Ok(meta) => match kind_of(meta.file_type()) {
                    EntryKind::File => (EntryKind::File, meta.len()),
                    other => (other, 0),
                },
                // Listed but unreadable; let the caller fail on it later.
                Err(_) => (EntryKind::File, 0),
            };
            result.push(EntryInfo::new(
                entry.file_name().to_string_lossy().into_owned(),
                kind,
                size,
            ));
        }
        Ok(result)
    }

    fn open_for_read(&self, location: &Path) -> TransferResult<ReadStream> {
        let file = fs::File::open(location).map_err(|e| TransferError::io(path_str(location), e))?;
        Ok(Box::new(file))
    }

    fn open_for_write(&self, location: &Path, truncate: bool) -> TransferResult<Box<dyn ByteSink>> {
        if !truncate && fs::symlink_metadata(location).is_ok() {
            return Err(TransferError::conflict(path_str(location), "already exists"));
        }
        let parent = location
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let staging =
            NamedTempFile::new_in(parent).map_err(|e| TransferError::io(path_str(location), e))?;

        Ok(Box::new(LocalSink {
            staging,
            target: location.to_path_buf(),
            replace: truncate,
            written: 0,
            preserve: None,
        }))
    }

    #[cfg(unix)]
    fn create_symlink(&self, location: &Path, target: &Path) -> TransferResult<()> {
        match std::os::unix::fs::symlink(target, location) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(TransferError::conflict(path_str(location), "already exists"))
            }
            Err(e) => Err(TransferError::io(path_str(location), e)),
        }
    }

    fn create_dir(&self, location: &Path) -> TransferResult<()> {
        match fs::create_dir(location) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists && self.stat(location)?.is_dir() => Ok(()),
            Err(e) => Err(TransferError::io(path_str(location), e)),
        }
    }

    fn delete(&self, location: &Path) -> TransferResult<()> {
        let meta =
            fs::symlink_metadata(location).map_err(|e| TransferError::io(path_str(location), e))?;
        let result = if meta.is_dir() {
            fs::remove_dir(location)
        } else {
            fs::remove_file(location)
        };
        result.map_err(|e| TransferError::io(path_str(location), e))
    }

    fn rename(&self, from: &Path, to: &Path) -> TransferResult<()> {
        fs::rename(from, to).map_err(|e| TransferError::io(path_str(from), e))
    }

    fn extended_metadata(&self, location: &Path) -> TransferResult<Vec<(String, String)>> {
        let meta = self.stat(location)?;
        let file_type = match meta.kind {
            EntryKind::Symlink => "Symbolic Link",
            EntryKind::Directory => "Directory",
            EntryKind::File => "File",
        };

        let mut details = vec![
            ("Path".to_string(), path_str(location)),
            ("Type".to_string(), file_type.to_string()),
            ("Size".to_string(), format!("{} bytes", meta.size)),
        ];

        if let Some(target) = &meta.link_target {
            details.push(("Target".to_string(), path_str(target)));
        }

        if let Some(modified) = meta.modified {
            if let Ok(since_epoch) = modified.duration_since(std::time::UNIX_EPOCH) {
                details.push(("Modified".to_string(), format!("{}s since epoch", since_epoch.as_secs())));
            }
        }

        if let Some(mode) = meta.permissions {
            details.push(("Permissions".to_string(), format!("{mode:o}")));
        }

        Ok(details)
    }
}

/// Writes into a temporary file next to the target and moves it into place
/// on commit.
struct LocalSink {
    staging: NamedTempFile,
    target: PathBuf,
    replace: bool,
    written: u64,
    preserve: Option<Metadata>,
}

impl LocalSink {
    /// Stamp the staged file (created with mode 0600) with the source's
    /// attributes.
    fn apply_preserved(&self) -> io::Result<()> {
        let Some(source) = &self.preserve else {
            return Ok(());
        };
        let file = self.staging.as_file();
        if let Some(mode) = source.permissions {
            set_mode(file, mode)?;
        }

        if let Some(modified) = source.modified {
            file.set_modified(modified)?;
        }
        Ok(())
    }
}

impl Write for LocalSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.staging.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.staging.flush()
    }
}

impl ByteSink for LocalSink {
    fn preserve_metadata(&mut self, source: &Metadata) {
        self.preserve = Some(source.clone());
    }

    fn commit(mut self: Box<Self>) -> TransferResult<u64> {
        let target = path_str(&self.target);
        self.staging
            .flush()
            .map_err(|e| TransferError::io(target.clone(), e))?;
        if let Err(e) = self.apply_preserved() {
            tracing::warn!(target = %target, error = %e, "cannot preserve source attributes");
        }

        let LocalSink {
            staging,
            target: target_path,
            replace,
            written,
            ..
        } = *self;

        let persisted = if replace {
            staging.persist(&target_path)
        } else {
            staging.persist_noclobber(&target_path)
        };

        match persisted {
            Ok(_) => Ok(written),
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
                Err(TransferError::conflict(target, "already exists"))
            }
            Err(e) => Err(TransferError::io(target, e.error)),
        }
    }

    fn abort(self: Box<Self>) {
        // Dropping the staging file removes it.
        tracing::debug!(target = %self.target.display(), "discarding staged write");
    }
}

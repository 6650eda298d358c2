//! Uniform references to file-system entities.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use strum::Display;

use transit_core::{TransferError, TransferResult};

use crate::backend::{ByteSink, ReadStream, StorageBackend};
use crate::materialize::Materialized;

/// The storage kind behind a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
pub enum Scheme {
    #[strum(to_string = "local")]
    Local,
    #[strum(to_string = "archive")]
    Archive,
    #[strum(to_string = "object-store")]
    ObjectStore,
}

impl Scheme {
    /// Capability defaults for this storage kind.
    pub const fn default_capabilities(self) -> Capabilities {
        match self {
            Self::Local => Capabilities {
                requires_extraction: false,
                supports_streaming_read: true,
                supports_write: true,
                search_strategy: SearchStrategy::Streaming,
                cache_for_search: false,
            },
            Self::Archive => Capabilities {
                requires_extraction: true,
                supports_streaming_read: false,
                supports_write: false,
                search_strategy: SearchStrategy::Extracted,
                cache_for_search: true,
            },
            Self::ObjectStore => Capabilities {
                requires_extraction: true,
                supports_streaming_read: false,
                supports_write: true,
                search_strategy: SearchStrategy::Buffered,
                cache_for_search: true,
            },
        }
    }
}

/// How callers should consume an entry's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
pub enum SearchStrategy {
    /// Read incrementally.
    Streaming,
    /// Extract first, then read.
    Extracted,
    /// Download into a buffer, then read.
    Buffered,
}

/// Capability flags of a storage entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Content must be materialized before it can be read.
    pub requires_extraction: bool,
    /// Content can be read incrementally without full buffering.
    pub supports_streaming_read: bool,
    /// Entries can be created, written and deleted.
    pub supports_write: bool,
    /// Recommended way to consume content.
    pub search_strategy: SearchStrategy,
    /// Whether content should be cached when searched repeatedly.
    pub cache_for_search: bool,
}

/// The kind of an entry.
///
/// Symbolic links are entries of their own: traversal never descends
/// through one, whatever it points to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    #[default]
    File,
    Directory,
    Symlink,
}

/// Result of a `stat` call. Links are not followed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    /// File, directory or symbolic link.
    pub kind: EntryKind,
    /// Size in bytes (0 for directories and links).
    pub size: u64,
    /// Last modification time, when the backend knows it.
    pub modified: Option<SystemTime>,
    /// Unix permission bits, when the backend knows them.
    pub permissions: Option<u32>,
    /// Where a symbolic link points.
    pub link_target: Option<PathBuf>,
}

impl Metadata {
    /// Metadata for a file.
    pub fn file(size: u64) -> Self {
        Self {
            kind: EntryKind::File,
            size,
            modified: None,
            permissions: None,
            link_target: None,
        }
    }

    /// Metadata for a directory.
    pub fn directory() -> Self {
        Self {
            kind: EntryKind::Directory,
            ..Self::file(0)
        }
    }

    /// Metadata for a symbolic link.
    pub fn symlink(target: impl Into<PathBuf>) -> Self {
        Self {
            kind: EntryKind::Symlink,
            link_target: Some(target.into()),
            ..Self::file(0)
        }
    }

    /// Attach a modification time.
    pub fn with_modified(mut self, modified: Option<SystemTime>) -> Self {
        self.modified = modified;
        self
    }

    /// Attach permission bits.
    pub fn with_permissions(mut self, permissions: Option<u32>) -> Self {
        self.permissions = permissions;
        self
    }

    /// Check if this is a directory.
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    /// Check if this is a symbolic link.
    pub fn is_symlink(&self) -> bool {
        self.kind == EntryKind::Symlink
    }
}

/// Links followed by [`PathHandle::stat_resolved`] before giving up.
const MAX_LINK_HOPS: usize = 40;

/// A directory listing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    /// Entry name (last path component).
    pub name: String,
    /// Kind of the entry itself, not of a link's target.
    pub kind: EntryKind,
    /// Size in bytes (0 for directories).
    pub size: u64,
}

impl EntryInfo {
    /// Create a listing entry.
    pub fn new(name: impl Into<String>, kind: EntryKind, size: u64) -> Self {
        Self {
            name: name.into(),
            kind,
            size,
        }
    }
}

/// An immutable reference to one entity on some storage backend.
///
/// Handles are cheap to clone. Clones share the materialization cache, so an
/// entry is extracted at most once for the lifetime of a handle.
#[derive(Clone)]
pub struct PathHandle {
    backend: Arc<dyn StorageBackend>,
    location: PathBuf,
    kind_hint: Option<EntryKind>,
    materialized: Arc<Mutex<Option<Materialized>>>,
}

impl PathHandle {
    /// Create a handle for a location on a backend.
    pub fn new(backend: Arc<dyn StorageBackend>, location: impl Into<PathBuf>) -> Self {
        Self {
            backend,
            location: location.into(),
            kind_hint: None,
            materialized: Arc::new(Mutex::new(None)),
        }
    }

    /// Attach a known entry kind (e.g. from a directory listing).
    pub fn with_kind(mut self, kind: EntryKind) -> Self {
        self.kind_hint = Some(kind);
        self
    }

    /// The backend serving this handle.
    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// Backend-relative location.
    pub fn location(&self) -> &Path {
        &self.location
    }

    /// The storage kind.
    pub fn scheme(&self) -> Scheme {
        self.backend.scheme()
    }

    /// Capability flags.
    pub fn capabilities(&self) -> Capabilities {
        self.backend.capabilities()
    }

    /// Content must be materialized before reading.
    pub fn requires_extraction(&self) -> bool {
        self.capabilities().requires_extraction
    }

    /// Content can be read incrementally.
    pub fn supports_streaming_read(&self) -> bool {
        self.capabilities().supports_streaming_read
    }

    /// Recommended way to consume content.
    pub fn search_strategy(&self) -> SearchStrategy {
        self.capabilities().search_strategy
    }

    /// Entries can be written and deleted.
    pub fn supports_write(&self) -> bool {
        self.capabilities().supports_write
    }

    /// Entry name (last component). Empty for a backend root.
    pub fn name(&self) -> String {
        self.location
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Backend-qualified identity.
    pub fn uri(&self) -> String {
        self.backend.uri(&self.location)
    }

    /// Human-readable form, including the backend's display prefix.
    pub fn display_path(&self) -> String {
        self.backend.display(&self.location)
    }

    /// Prefix shown by UIs for this handle's storage.
    pub fn display_prefix(&self) -> &'static str {
        self.backend.display_prefix()
    }

    /// Storage-specific details for info dialogs.
    pub fn extended_metadata(&self) -> TransferResult<Vec<(String, String)>> {
        self.backend.extended_metadata(&self.location)
    }

    /// Directory flag known without I/O, if any.
    pub fn is_dir_hint(&self) -> Option<bool> {
        self.kind_hint.map(|k| k == EntryKind::Directory)
    }

    /// Check if both handles live on the same store.
    pub fn same_store(&self, other: &PathHandle) -> bool {
        self.scheme() == other.scheme() && self.backend.store_id() == other.backend.store_id()
    }

    /// Check if `self` is `other` or one of its descendants.
    pub fn is_within(&self, other: &PathHandle) -> bool {
        self.same_store(other) && self.location.starts_with(&other.location)
    }

    /// A handle for a child of this directory.
    pub fn join(&self, name: &str) -> PathHandle {
        PathHandle::new(Arc::clone(&self.backend), self.location.join(name))
    }

    /// A handle for the parent directory, if any.
    pub fn parent(&self) -> Option<PathHandle> {
        self.location
            .parent()
            .map(|p| PathHandle::new(Arc::clone(&self.backend), p).with_kind(EntryKind::Directory))
    }

    /// A sibling handle with a different name.
    pub fn with_name(&self, name: &str) -> PathHandle {
        PathHandle::new(Arc::clone(&self.backend), self.location.with_file_name(name))
    }

    /// Stat the entry.
    pub fn stat(&self) -> TransferResult<Metadata> {
        self.backend.stat(&self.location)
    }

    /// Stat the entry, following symbolic links to what they point at.
    pub fn stat_resolved(&self) -> TransferResult<Metadata> {
        let mut location = self.location.clone();
        for _ in 0..MAX_LINK_HOPS {
            let meta = self.backend.stat(&location)?;
            match &meta.link_target {
                Some(target) if meta.is_symlink() => {
                    location = location.parent().unwrap_or(Path::new("")).join(target);
                }
                _ => return Ok(meta),
            }
        }
        Err(TransferError::unsupported("following a symbolic link loop", self.display_path()))
    }

    /// Stat the entry, mapping not-found to `None`.
    pub fn try_stat(&self) -> TransferResult<Option<Metadata>> {
        match self.stat() {
            Ok(meta) => Ok(Some(meta)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Check if the entry exists.
    pub fn exists(&self) -> TransferResult<bool> {
        Ok(self.try_stat()?.is_some())
    }

    /// Check if the entry is a directory, using the hint when present.
    pub fn is_directory(&self) -> TransferResult<bool> {
        match self.is_dir_hint() {
            Some(is_dir) => Ok(is_dir),
            None => Ok(self.stat()?.is_dir()),
        }
    }

    /// List children, sorted by name.
    pub fn list(&self) -> TransferResult<Vec<PathHandle>> {
        let mut entries = self.backend.list(&self.location)?;
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries
            .into_iter()
            .map(|entry| self.join(&entry.name).with_kind(entry.kind))
            .collect())
    }

    /// Open the entry for reading.
    ///
    /// For backends without streaming support this goes through
    /// [`materialize`](Self::materialize).
    pub fn open_for_read(&self) -> TransferResult<ReadStream> {
        if self.supports_streaming_read() {
            return self.backend.open_for_read(&self.location);
        }
        let content = self.materialize()?;
        content
            .reader()
            .map_err(|e| TransferError::io(self.display_path(), e))
    }

    /// Fully buffer the entry's content. Cached for the handle's lifetime.
    pub fn materialize(&self) -> TransferResult<Materialized> {
        let mut cache = self
            .materialized
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(content) = cache.as_ref() {
            return Ok(content.clone());
        }
        tracing::debug!(entry = %self.display_path(), "materializing entry");
        let content = self.backend.materialize(&self.location)?;
        *cache = Some(content.clone());
        Ok(content)
    }

    /// Check if the content has already been materialized.
    pub fn is_materialized(&self) -> bool {
        self.materialized
            .lock()
            .map(|cache| cache.is_some())
            .unwrap_or(false)
    }

    /// Open the entry for writing.
    pub fn open_for_write(&self, truncate: bool) -> TransferResult<Box<dyn ByteSink>> {
        self.backend.open_for_write(&self.location, truncate)
    }

    /// Create this entry as a symbolic link to `target`.
    pub fn create_symlink(&self, target: &Path) -> TransferResult<()> {
        self.backend.create_symlink(&self.location, target)
    }

    /// Create this entry as a directory.
    pub fn create_dir(&self) -> TransferResult<()> {
        self.backend.create_dir(&self.location)
    }

    /// Delete this file or empty directory.
    pub fn delete(&self) -> TransferResult<()> {
        self.backend.delete(&self.location)
    }

    /// Rename within the same store.
    pub fn rename_to(&self, target: &PathHandle) -> TransferResult<()> {
        if !self.same_store(target) {
            return Err(TransferError::unsupported("cross-store rename", self.display_path()));
        }
        self.backend.rename(&self.location, &target.location)
    }
}

impl PartialEq for PathHandle {
    fn eq(&self, other: &Self) -> bool {
        self.same_store(other) && self.location == other.location
    }
}

impl Eq for PathHandle {}

impl fmt::Debug for PathHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PathHandle")
            .field("uri", &self.uri())
            .field("kind", &self.kind_hint)
            .finish()
    }
}

impl fmt::Display for PathHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_path())
    }
}

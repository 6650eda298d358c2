//! The storage backend contract.

use std::fmt;
use std::io::{Read, Write};
use std::path::Path;

use transit_core::{TransferError, TransferResult};

use crate::handle::{Capabilities, EntryInfo, Metadata, Scheme};
use crate::materialize::Materialized;

/// A readable byte stream.
pub type ReadStream = Box<dyn Read + Send>;

/// A transactional byte sink returned by [`StorageBackend::open_for_write`].
///
/// Nothing written becomes visible at the destination until [`commit`] returns
/// successfully. [`abort`] (or dropping the sink) discards everything written.
///
/// [`commit`]: ByteSink::commit
/// [`abort`]: ByteSink::abort
pub trait ByteSink: Write + Send {
    /// Carry permissions and modification time of `source` over to the
    /// written entry. Backends without such attributes ignore it.
    fn preserve_metadata(&mut self, _source: &Metadata) {}

    /// Make the written content visible at the destination.
    ///
    /// Returns the number of bytes committed.
    fn commit(self: Box<Self>) -> TransferResult<u64>;

    /// Discard the written content.
    fn abort(self: Box<Self>);
}

/// Implementation behind a [`PathHandle`](crate::PathHandle).
///
/// Locations are backend-relative paths: a filesystem path for local
/// storage, the entry path inside an archive, or an object key relative to a
/// bucket. All methods may block and must only be called from worker threads.
pub trait StorageBackend: Send + Sync + fmt::Debug {
    /// The storage kind.
    fn scheme(&self) -> Scheme;

    /// Identity of the underlying store; two backends with equal scheme and
    /// store id address the same entities.
    fn store_id(&self) -> String;

    /// Capability flags for entries of this backend.
    fn capabilities(&self) -> Capabilities {
        self.scheme().default_capabilities()
    }

    /// Backend-qualified identity of a location.
    fn uri(&self, location: &Path) -> String;

    /// Human-readable form of a location.
    fn display(&self, location: &Path) -> String {
        format!("{}{}", self.display_prefix(), self.uri(location))
    }

    /// Prefix shown by UIs in front of entries of this backend.
    fn display_prefix(&self) -> &'static str;

    /// Stat an entry.
    fn stat(&self, location: &Path) -> TransferResult<Metadata>;

    /// List the direct children of a directory.
    fn list(&self, location: &Path) -> TransferResult<Vec<EntryInfo>>;

    /// Open an entry for reading.
    fn open_for_read(&self, location: &Path) -> TransferResult<ReadStream>;

    /// Bytes of materialized content kept in memory before spilling to disk.
    fn memory_limit(&self) -> u64 {
        crate::DEFAULT_MEMORY_LIMIT
    }

    /// Fully buffer an entry's content.
    fn materialize(&self, location: &Path) -> TransferResult<Materialized> {
        let size = self.stat(location)?.size;
        let reader = self.open_for_read(location)?;
        Materialized::from_reader(reader, size, self.memory_limit())
            .map_err(|e| TransferError::io(self.display(location), e))
    }

    /// Open an entry for writing.
    ///
    /// With `truncate == false` an existing entry is never replaced.
    fn open_for_write(&self, location: &Path, truncate: bool) -> TransferResult<Box<dyn ByteSink>>;

    /// Create a directory. Succeeds if it already exists as a directory.
    fn create_dir(&self, location: &Path) -> TransferResult<()>;

    /// Create a symbolic link at `location` pointing to `target`.
    fn create_symlink(&self, location: &Path, _target: &Path) -> TransferResult<()> {
        Err(TransferError::unsupported("symbolic links", self.display(location)))
    }

    /// Delete a file, a symbolic link or an empty directory.
    fn delete(&self, location: &Path) -> TransferResult<()>;

    /// Rename an entry within this store.
    fn rename(&self, from: &Path, _to: &Path) -> TransferResult<()> {
        Err(TransferError::unsupported("rename", self.display(from)))
    }

    /// Storage-specific details for info dialogs.
    fn extended_metadata(&self, location: &Path) -> TransferResult<Vec<(String, String)>>;
}

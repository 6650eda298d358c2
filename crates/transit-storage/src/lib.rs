//! Storage backends for transit.
//!
//! Every storage kind (local disk, archive entries, object storage) is
//! reached through a [`PathHandle`], which delegates to a [`StorageBackend`].
//! Callers decide how to read content from the handle's [`Capabilities`],
//! never from the concrete backend type.

mod archive;
mod backend;
mod handle;
mod local;
mod materialize;
mod object_store;

pub use archive::{ArchiveBackend, ArchiveFormat};
pub use backend::{ByteSink, ReadStream, StorageBackend};
pub use handle::{Capabilities, EntryInfo, EntryKind, Metadata, PathHandle, Scheme, SearchStrategy};
pub use local::LocalBackend;
pub use materialize::Materialized;
pub use object_store::{MemoryObjectClient, ObjectClient, ObjectStoreBackend, ObjectSummary};

/// Default in-memory limit for materialized content before it spills to disk.
pub const DEFAULT_MEMORY_LIMIT: u64 = 64 * 1024 * 1024;

//! Fully buffered entry content.

use std::io::{self, Cursor, Read, Write};
use std::sync::Arc;

use tempfile::NamedTempFile;

use crate::backend::ReadStream;

/// Content of an entry that had to be extracted or downloaded before reading.
///
/// Small content stays in memory; content beyond the configured limit is
/// spilled to a temporary file that lives as long as the last clone.
#[derive(Debug, Clone)]
pub enum Materialized {
    /// Content held in memory.
    Memory(Arc<[u8]>),
    /// Content spilled to a temporary file.
    Spilled { file: Arc<NamedTempFile>, len: u64 },
}

impl Materialized {
    /// Wrap an in-memory buffer.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self::Memory(bytes.into())
    }

    /// Drain a reader, keeping up to `memory_limit` bytes in memory.
    pub fn from_reader(mut reader: impl Read, size_hint: u64, memory_limit: u64) -> io::Result<Self> {
        let capacity = size_hint.min(memory_limit) as usize;
        let mut buffer = Vec::with_capacity(capacity);
        let read = reader
            .by_ref()
            .take(memory_limit.saturating_add(1))
            .read_to_end(&mut buffer)?;

        if (read as u64) <= memory_limit {
            return Ok(Self::from_bytes(buffer));
        }

        let mut file = NamedTempFile::new()?;
        file.write_all(&buffer)?;
        let rest = io::copy(&mut reader, &mut file)?;
        file.flush()?;
        tracing::debug!(bytes = read as u64 + rest, "spilled materialized content to disk");

        Ok(Self::Spilled {
            file: Arc::new(file),
            len: read as u64 + rest,
        })
    }

    /// Length of the content in bytes.
    pub fn len(&self) -> u64 {
        match self {
            Self::Memory(bytes) => bytes.len() as u64,
            Self::Spilled { len, .. } => *len,
        }
    }

    /// Check if the content is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check if the content was spilled to disk.
    pub fn is_spilled(&self) -> bool {
        matches!(self, Self::Spilled { .. })
    }

    /// Open a fresh reader over the content.
    pub fn reader(&self) -> io::Result<ReadStream> {
        match self {
            Self::Memory(bytes) => Ok(Box::new(Cursor::new(Arc::clone(bytes)))),
            Self::Spilled { file, .. } => Ok(Box::new(file.reopen()?)),
        }
    }
}

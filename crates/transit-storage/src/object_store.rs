//! Object storage backend.
//!
//! Objects are addressed by `/`-separated keys inside a bucket. Directories
//! only exist as key prefixes, optionally marked by an empty `prefix/` object.
//! The wire protocol lives behind [`ObjectClient`]; [`MemoryObjectClient`] is
//! an in-process bucket.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tempfile::SpooledTempFile;
use transit_core::{TransferError, TransferResult};

use crate::backend::{ByteSink, ReadStream, StorageBackend};
use crate::handle::{EntryInfo, EntryKind, Metadata, PathHandle, Scheme};
use crate::materialize::Materialized;

/// Summary of one stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    /// Full object key.
    pub key: String,
    /// Object size in bytes.
    pub size: u64,
}

/// Minimal object storage client.
pub trait ObjectClient: Send + Sync + std::fmt::Debug {
    /// Size of an object, or `None` if it does not exist.
    fn head(&self, key: &str) -> TransferResult<Option<u64>>;

    /// Download a whole object.
    fn get(&self, key: &str) -> TransferResult<Vec<u8>>;

    /// Upload a whole object of `len` bytes read from `body`.
    fn put(&self, key: &str, body: &mut dyn Read, len: u64) -> TransferResult<()>;

    /// Delete an object.
    fn delete(&self, key: &str) -> TransferResult<()>;

    /// All objects whose key starts with `prefix`, in key order.
    fn list_prefix(&self, prefix: &str) -> TransferResult<Vec<ObjectSummary>>;
}

/// An in-memory bucket.
#[derive(Debug, Default)]
pub struct MemoryObjectClient {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    gets: AtomicUsize,
    puts: AtomicUsize,
}

impl MemoryObjectClient {
    /// Create an empty bucket.
    pub fn new() -> Self {
        Self::default()
    }

    fn objects(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.objects.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store an object directly, bypassing the transfer path.
    pub fn insert(&self, key: impl Into<String>, body: impl Into<Vec<u8>>) {
        self.objects().insert(key.into(), body.into());
    }

    /// Content of an object, if present.
    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects().get(key).cloned()
    }

    /// All keys in order.
    pub fn keys(&self) -> Vec<String> {
        self.objects().keys().cloned().collect()
    }

    /// Number of downloads served.
    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::Relaxed)
    }

    /// Number of uploads received.
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::Relaxed)
    }
}

impl ObjectClient for MemoryObjectClient {
    fn head(&self, key: &str) -> TransferResult<Option<u64>> {
        Ok(self.objects().get(key).map(|body| body.len() as u64))
    }

    fn get(&self, key: &str) -> TransferResult<Vec<u8>> {
        self.gets.fetch_add(1, Ordering::Relaxed);
        self.objects()
            .get(key)
            .cloned()
            .ok_or_else(|| TransferError::not_found(key))
    }

    fn put(&self, key: &str, body: &mut dyn Read, len: u64) -> TransferResult<()> {
        self.puts.fetch_add(1, Ordering::Relaxed);
        let mut content = Vec::with_capacity(len as usize);
        body.read_to_end(&mut content)
            .map_err(|e| TransferError::io(key, e))?;
        self.objects().insert(key.to_string(), content);
        Ok(())
    }

    fn delete(&self, key: &str) -> TransferResult<()> {
        self.objects()
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| TransferError::not_found(key))
    }

    fn list_prefix(&self, prefix: &str) -> TransferResult<Vec<ObjectSummary>> {
        Ok(self
            .objects()
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, body)| ObjectSummary {
                key: key.clone(),
                size: body.len() as u64,
            })
            .collect())
    }
}

/// Backend for one bucket of an object store.
#[derive(Debug)]
pub struct ObjectStoreBackend {
    bucket: String,
    client: Arc<dyn ObjectClient>,
    memory_limit: u64,
}

impl ObjectStoreBackend {
    /// Create a backend for a bucket.
    pub fn new(bucket: impl Into<String>, client: Arc<dyn ObjectClient>) -> Arc<Self> {
        Self::with_limit(bucket, client, crate::DEFAULT_MEMORY_LIMIT)
    }

    /// Create a backend with a custom in-memory limit for downloads and
    /// staged uploads.
    pub fn with_limit(bucket: impl Into<String>, client: Arc<dyn ObjectClient>, memory_limit: u64) -> Arc<Self> {
        Arc::new(Self {
            bucket: bucket.into(),
            client,
            memory_limit,
        })
    }

    /// Handle for the bucket root.
    pub fn root(self: &Arc<Self>) -> PathHandle {
        self.handle("")
    }

    /// Handle for a key.
    pub fn handle(self: &Arc<Self>, key: &str) -> PathHandle {
        let backend: Arc<dyn StorageBackend> = Arc::clone(self) as Arc<dyn StorageBackend>;
        PathHandle::new(backend, key.trim_matches('/'))
    }

    /// The bucket name.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

fn key_of(location: &Path) -> String {
    location
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn dir_prefix(key: &str) -> String {
    if key.is_empty() {
        String::new()
    } else {
        format!("{key}/")
    }
}

impl StorageBackend for ObjectStoreBackend {
    fn scheme(&self) -> Scheme {
        Scheme::ObjectStore
    }

    fn store_id(&self) -> String {
        self.bucket.clone()
    }

    fn uri(&self, location: &Path) -> String {
        format!("s3://{}/{}", self.bucket, key_of(location))
    }

    fn display_prefix(&self) -> &'static str {
        "S3: "
    }

    fn stat(&self, location: &Path) -> TransferResult<Metadata> {
        let key = key_of(location);
        if key.is_empty() {
            return Ok(Metadata::directory());
        }
        if let Some(size) = self.client.head(&key)? {
            return Ok(Metadata::file(size));
        }
        if !self.client.list_prefix(&dir_prefix(&key))?.is_empty() {
            return Ok(Metadata::directory());
        }
        Err(TransferError::not_found(self.display(location)))
    }

    fn list(&self, location: &Path) -> TransferResult<Vec<EntryInfo>> {
        let prefix = dir_prefix(&key_of(location));
        let mut files = BTreeMap::new();
        let mut dirs = BTreeSet::new();

        for object in self.client.list_prefix(&prefix)? {
            let rest = &object.key[prefix.len()..];
            match rest.split_once('/') {
                Some((dir, _)) if !dir.is_empty() => {
                    dirs.insert(dir.to_string());
                }
                Some(_) => {}
                None if rest.is_empty() => {}
                None => {
                    files.insert(rest.to_string(), object.size);
                }
            }
        }

        if files.is_empty() && dirs.is_empty() && !self.stat(location)?.is_dir() {
            return Err(TransferError::unsupported("listing a file", self.display(location)));
        }

        Ok(dirs
            .into_iter()
            .map(|name| EntryInfo::new(name, EntryKind::Directory, 0))
            .chain(
                files
                    .into_iter()
                    .map(|(name, size)| EntryInfo::new(name, EntryKind::File, size)),
            )
            .collect())
    }

    fn open_for_read(&self, location: &Path) -> TransferResult<ReadStream> {
        let content = self.materialize(location)?;
        content
            .reader()
            .map_err(|e| TransferError::io(self.display(location), e))
    }

    fn memory_limit(&self) -> u64 {
        self.memory_limit
    }

    fn materialize(&self, location: &Path) -> TransferResult<Materialized> {
        let body = self.client.get(&key_of(location)).map_err(|e| match e {
            TransferError::NotFound { .. } => TransferError::not_found(self.display(location)),
            other => other,
        })?;
        if body.len() as u64 <= self.memory_limit {
            return Ok(Materialized::from_bytes(body));
        }
        let size = body.len() as u64;
        Materialized::from_reader(io::Cursor::new(body), size, self.memory_limit)
            .map_err(|e| TransferError::io(self.display(location), e))
    }

    fn open_for_write(&self, location: &Path, truncate: bool) -> TransferResult<Box<dyn ByteSink>> {
        let key = key_of(location);
        if key.is_empty() {
            return Err(TransferError::unsupported("writing the bucket root", self.display(location)));
        }
        if !truncate && self.client.head(&key)?.is_some() {
            return Err(TransferError::conflict(self.display(location), "already exists"));
        }
        Ok(Box::new(SpooledObjectSink {
            client: Arc::clone(&self.client),
            key,
            body: SpooledTempFile::new(self.memory_limit as usize),
            len: 0,
        }))
    }

    fn create_dir(&self, location: &Path) -> TransferResult<()> {
        let key = key_of(location);
        if key.is_empty() {
            return Ok(());
        }
        if self.client.head(&key)?.is_some() {
            return Err(TransferError::conflict(self.display(location), "a file exists with this name"));
        }
        let marker = dir_prefix(&key);
        if self.client.head(&marker)?.is_none() {
            self.client.put(&marker, &mut io::empty(), 0)?;
        }
        Ok(())
    }

    fn delete(&self, location: &Path) -> TransferResult<()> {
        let key = key_of(location);
        if self.client.head(&key)?.is_some() {
            return self.client.delete(&key);
        }

        let marker = dir_prefix(&key);
        let contents = self.client.list_prefix(&marker)?;
        if contents.iter().any(|o| o.key != marker) {
            return Err(TransferError::io(
                self.display(location),
                io::Error::other("directory not empty"),
            ));
        }
        if contents.is_empty() {
            // A prefix without a marker vanishes with its last object.
            tracing::debug!(key = %key, "directory prefix already gone");
            return Ok(());
        }
        self.client.delete(&marker)
    }

    fn extended_metadata(&self, location: &Path) -> TransferResult<Vec<(String, String)>> {
        let meta = self.stat(location)?;
        Ok(vec![
            ("Bucket".to_string(), self.bucket.clone()),
            ("Key".to_string(), key_of(location)),
            (
                "Type".to_string(),
                if meta.is_dir() { "Directory" } else { "Object" }.to_string(),
            ),
            ("Size".to_string(), format!("{} bytes", meta.size)),
        ])
    }
}

/// Stages the body (in memory up to the backend's limit, then in a temp
/// file) and uploads it in one request on commit.
struct SpooledObjectSink {
    client: Arc<dyn ObjectClient>,
    key: String,
    body: SpooledTempFile,
    len: u64,
}

impl Write for SpooledObjectSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.body.write(buf)?;
        self.len += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.body.flush()
    }
}

impl ByteSink for SpooledObjectSink {
    fn commit(mut self: Box<Self>) -> TransferResult<u64> {
        self.body
            .seek(SeekFrom::Start(0))
            .map_err(|e| TransferError::io(self.key.clone(), e))?;
        let SpooledObjectSink {
            client,
            key,
            mut body,
            len,
        } = *self;
        client.put(&key, &mut body, len)?;
        Ok(len)
    }

    fn abort(self: Box<Self>) {
        tracing::debug!(key = %self.key, "discarding staged upload");
    }
}

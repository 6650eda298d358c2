//! Read-only backend for entries inside zip and tar archives.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use transit_core::{TransferError, TransferResult};

use crate::backend::{ByteSink, ReadStream, StorageBackend};
use crate::handle::{EntryInfo, EntryKind, Metadata, PathHandle, Scheme};
use crate::materialize::Materialized;

/// Supported archive container formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    Tar,
    TarGz,
    TarXz,
    TarBz2,
}

impl ArchiveFormat {
    /// Detect the format from a file name.
    pub fn detect(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_string_lossy().to_lowercase();
        if name.ends_with(".zip") {
            Some(Self::Zip)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(Self::TarGz)
        } else if name.ends_with(".tar.xz") || name.ends_with(".txz") {
            Some(Self::TarXz)
        } else if name.ends_with(".tar.bz2") || name.ends_with(".tbz2") || name.ends_with(".tbz") {
            Some(Self::TarBz2)
        } else if name.ends_with(".tar") {
            Some(Self::Tar)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Default)]
struct IndexEntry {
    kind: EntryKind,
    size: u64,
    /// Position in the zip central directory.
    zip_index: Option<usize>,
    permissions: Option<u32>,
    modified: Option<SystemTime>,
    /// Symlink target.
    link_target: Option<PathBuf>,
    /// Entry holding the content of a tar hard link.
    data_at: Option<PathBuf>,
}

impl IndexEntry {
    fn of_kind(kind: EntryKind) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }
}

/// File type bits of a unix mode.
const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

/// Backend exposing the entries of one archive file.
///
/// The entry index is built once when the archive is opened. Content is
/// extracted on demand, one entry at a time.
#[derive(Debug)]
pub struct ArchiveBackend {
    archive_path: PathBuf,
    format: ArchiveFormat,
    index: BTreeMap<PathBuf, IndexEntry>,
    memory_limit: u64,
}

impl ArchiveBackend {
    /// Open an archive and index its entries.
    pub fn open(archive_path: impl Into<PathBuf>) -> TransferResult<Arc<Self>> {
        Self::open_with_limit(archive_path, crate::DEFAULT_MEMORY_LIMIT)
    }

    /// Open an archive with a custom in-memory extraction limit.
    pub fn open_with_limit(archive_path: impl Into<PathBuf>, memory_limit: u64) -> TransferResult<Arc<Self>> {
        let archive_path = archive_path.into();
        let shown = archive_path.display().to_string();
        let format = ArchiveFormat::detect(&archive_path)
            .ok_or_else(|| TransferError::unsupported("archive format", shown.clone()))?;

        let mut backend = Self {
            archive_path,
            format,
            index: BTreeMap::new(),
            memory_limit,
        };
        backend.build_index()?;
        tracing::debug!(archive = %shown, entries = backend.index.len(), "indexed archive");
        Ok(Arc::new(backend))
    }

    /// Handle for the archive root directory.
    pub fn root(self: &Arc<Self>) -> PathHandle {
        self.entry("")
    }

    /// Handle for an entry inside the archive.
    pub fn entry(self: &Arc<Self>, inner: impl AsRef<Path>) -> PathHandle {
        let backend: Arc<dyn StorageBackend> = Arc::clone(self) as Arc<dyn StorageBackend>;
        PathHandle::new(backend, normalize(inner.as_ref()).unwrap_or_default())
    }

    /// The archive file on disk.
    pub fn archive_path(&self) -> &Path {
        &self.archive_path
    }

    /// The container format.
    pub fn format(&self) -> ArchiveFormat {
        self.format
    }

    fn shown(&self) -> String {
        self.archive_path.display().to_string()
    }

    fn open_archive_file(&self) -> TransferResult<File> {
        File::open(&self.archive_path).map_err(|e| TransferError::io(self.shown(), e))
    }

    fn tar_stream(&self) -> TransferResult<Box<dyn Read + Send>> {
        let file = BufReader::new(self.open_archive_file()?);
        Ok(match self.format {
            ArchiveFormat::Tar => Box::new(file),
            ArchiveFormat::TarGz => Box::new(flate2::read::GzDecoder::new(file)),
            ArchiveFormat::TarXz => Box::new(xz2::read::XzDecoder::new(file)),
            ArchiveFormat::TarBz2 => Box::new(bzip2::read::BzDecoder::new(file)),
            ArchiveFormat::Zip => {
                return Err(TransferError::unsupported("tar stream", self.shown()));
            }
        })
    }

    fn insert(&mut self, path: PathBuf, entry: IndexEntry) {
        let mut parent = path.parent();
        while let Some(dir) = parent {
            if dir.as_os_str().is_empty() {
                break;
            }
            self.index
                .entry(dir.to_path_buf())
                .or_insert_with(|| IndexEntry::of_kind(EntryKind::Directory));
            parent = dir.parent();
        }
        self.index.insert(path, entry);
    }

    fn build_index(&mut self) -> TransferResult<()> {
        match self.format {
            ArchiveFormat::Zip => self.index_zip(),
            _ => self.index_tar(),
        }
    }

    fn index_zip(&mut self) -> TransferResult<()> {
        let shown = self.shown();
        let read_err = |e: io::Error| TransferError::io(shown.clone(), e);

        let file = self.open_archive_file()?;
        let mut zip =
            zip::ZipArchive::new(BufReader::new(file)).map_err(|e| read_err(io::Error::other(e)))?;
        for i in 0..zip.len() {
            let mut entry = zip.by_index(i).map_err(|e| read_err(io::Error::other(e)))?;
            // Skip entries that would escape the archive root.
            let Some(path) = entry.enclosed_name().and_then(|p| normalize(&p)) else {
                continue;
            };
            let mode = entry.unix_mode();

            let mut indexed = IndexEntry {
                kind: EntryKind::File,
                size: entry.size(),
                zip_index: Some(i),
                permissions: mode.map(|m| m & 0o7777),
                ..IndexEntry::default()
            };
            if entry.is_dir() {
                indexed.kind = EntryKind::Directory;
                indexed.size = 0;
            } else if mode.is_some_and(|m| m & S_IFMT == S_IFLNK) {
                // A zip symlink stores its target as the entry body.
                let mut target = String::new();
                entry.read_to_string(&mut target).map_err(read_err)?;
                indexed.kind = EntryKind::Symlink;
                indexed.size = 0;
                indexed.link_target = Some(PathBuf::from(target));
            }
            drop(entry);
            self.insert(path, indexed);
        }
        Ok(())
    }

    fn index_tar(&mut self) -> TransferResult<()> {
        let shown = self.shown();
        let read_err = |e: io::Error| TransferError::io(shown.clone(), e);

        let mut archive = tar::Archive::new(self.tar_stream()?);
        let mut found = Vec::new();
        for entry in archive.entries().map_err(read_err)? {
            let entry = entry.map_err(read_err)?;
            let Some(path) = entry.path().ok().and_then(|p| normalize(&p)) else {
                continue;
            };
            let header = entry.header();
            let kind = header.entry_type();

            let mut indexed = IndexEntry {
                permissions: header.mode().ok().map(|m| m & 0o7777),
                modified: header
                    .mtime()
                    .ok()
                    .map(|secs| SystemTime::UNIX_EPOCH + Duration::from_secs(secs)),
                ..IndexEntry::default()
            };
            if kind.is_dir() {
                indexed.kind = EntryKind::Directory;
            } else if kind.is_symlink() {
                indexed.kind = EntryKind::Symlink;
                indexed.link_target = entry.link_name().ok().flatten().map(|p| p.into_owned());
            } else if kind.is_hard_link() {
                // Content lives in the linked entry; resolved below.
                let Some(target) = entry.link_name().ok().flatten().and_then(|p| normalize(&p)) else {
                    continue;
                };
                indexed.data_at = Some(target);
            } else if kind.is_file() || kind.is_contiguous() || kind.is_gnu_sparse() {
                indexed.size = entry.size();
            } else {
                tracing::debug!(archive = %shown, entry = %path.display(), "skipping special tar entry");
                continue;
            }
            found.push((path, indexed));
        }

        for (path, mut indexed) in found {
            if let Some(target) = indexed.data_at.take() {
                let Some(data) = self.index.get(&target).filter(|t| t.kind == EntryKind::File) else {
                    tracing::debug!(archive = %shown, entry = %path.display(), "skipping dangling hard link");
                    continue;
                };
                indexed.size = data.size;
                indexed.data_at = Some(data.data_at.clone().unwrap_or(target));
            }
            self.insert(path, indexed);
        }
        Ok(())
    }

    fn lookup(&self, location: &Path) -> TransferResult<&IndexEntry> {
        self.index
            .get(location)
            .ok_or_else(|| TransferError::not_found(self.display(location)))
    }

    fn extract(&self, location: &Path) -> TransferResult<Materialized> {
        let entry = self.lookup(location)?;
        match entry.kind {
            EntryKind::Directory => {
                return Err(TransferError::unsupported("extracting a directory", self.display(location)));
            }
            EntryKind::Symlink => {
                return Err(TransferError::unsupported("extracting a symbolic link", self.display(location)));
            }
            EntryKind::File => {}
        }
        let shown = self.display(location);
        let read_err = |e: io::Error| TransferError::io(shown.clone(), e);

        if let Some(i) = entry.zip_index {
            let file = self.open_archive_file()?;
            let mut zip = zip::ZipArchive::new(BufReader::new(file))
                .map_err(|e| read_err(io::Error::other(e)))?;
            let reader = zip.by_index(i).map_err(|e| read_err(io::Error::other(e)))?;
            return Materialized::from_reader(reader, entry.size, self.memory_limit).map_err(read_err);
        }

        let data_at = entry.data_at.as_deref().unwrap_or(location);
        let mut archive = tar::Archive::new(self.tar_stream()?);
        for candidate in archive.entries().map_err(read_err)? {
            let candidate = candidate.map_err(read_err)?;
            let matches = candidate
                .path()
                .ok()
                .and_then(|p| normalize(&p))
                .is_some_and(|p| p == data_at);
            if matches {
                return Materialized::from_reader(candidate, entry.size, self.memory_limit)
                    .map_err(read_err);
            }
        }
        Err(TransferError::not_found(shown))
    }
}

/// Strip leading `/` and `./`, rejecting `..` components.
fn normalize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            Component::ParentDir => return None,
        }
    }
    Some(out)
}

impl StorageBackend for ArchiveBackend {
    fn scheme(&self) -> Scheme {
        Scheme::Archive
    }

    fn store_id(&self) -> String {
        self.shown()
    }

    fn uri(&self, location: &Path) -> String {
        format!("archive://{}#{}", self.archive_path.display(), location.display())
    }

    fn display(&self, location: &Path) -> String {
        format!("{}{}#{}", self.display_prefix(), self.archive_path.display(), location.display())
    }

    fn display_prefix(&self) -> &'static str {
        "ARCHIVE: "
    }

    fn stat(&self, location: &Path) -> TransferResult<Metadata> {
        if location.as_os_str().is_empty() {
            return Ok(Metadata::directory());
        }
        let entry = self.lookup(location)?;
        let meta = match (&entry.kind, &entry.link_target) {
            (EntryKind::Directory, _) => Metadata::directory(),
            (EntryKind::Symlink, Some(target)) => Metadata::symlink(target.clone()),
            (EntryKind::Symlink, None) => Metadata {
                kind: EntryKind::Symlink,
                ..Metadata::file(0)
            },
            (EntryKind::File, _) => Metadata::file(entry.size),
        };
        Ok(meta
            .with_permissions(entry.permissions)
            .with_modified(entry.modified))
    }

    fn list(&self, location: &Path) -> TransferResult<Vec<EntryInfo>> {
        if !location.as_os_str().is_empty() && self.lookup(location)?.kind != EntryKind::Directory {
            return Err(TransferError::unsupported("listing a file", self.display(location)));
        }
        Ok(self
            .index
            .iter()
            .filter(|(path, _)| path.parent() == Some(location))
            .filter_map(|(path, entry)| {
                let name = path.file_name()?.to_string_lossy().into_owned();
                Some(EntryInfo::new(name, entry.kind, entry.size))
            })
            .collect())
    }

    fn open_for_read(&self, location: &Path) -> TransferResult<ReadStream> {
        let content = self.extract(location)?;
        content
            .reader()
            .map_err(|e| TransferError::io(self.display(location), e))
    }

    fn memory_limit(&self) -> u64 {
        self.memory_limit
    }

    fn materialize(&self, location: &Path) -> TransferResult<Materialized> {
        self.extract(location)
    }

    fn open_for_write(&self, location: &Path, _truncate: bool) -> TransferResult<Box<dyn ByteSink>> {
        Err(TransferError::read_only(self.display(location)))
    }

    fn create_dir(&self, location: &Path) -> TransferResult<()> {
        Err(TransferError::read_only(self.display(location)))
    }

    fn delete(&self, location: &Path) -> TransferResult<()> {
        Err(TransferError::read_only(self.display(location)))
    }

    fn extended_metadata(&self, location: &Path) -> TransferResult<Vec<(String, String)>> {
        let meta = self.stat(location)?;
        Ok(vec![
            ("Archive".to_string(), self.shown()),
            ("Format".to_string(), format!("{:?}", self.format)),
            ("Entry".to_string(), location.display().to_string()),
            (
                "Type".to_string(),
                match meta.kind {
                    EntryKind::Directory => "Directory",
                    EntryKind::Symlink => "Symbolic Link",
                    EntryKind::File => "File",
                }
                .to_string(),
            ),
            ("Size".to_string(), format!("{} bytes", meta.size)),
        ])
    }
}

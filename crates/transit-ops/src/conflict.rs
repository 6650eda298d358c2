//! Conflict detection and resolution.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use transit_core::{TransferError, TransferResult};
use transit_storage::PathHandle;

use crate::operation::OperationKind;

/// The kind of conflict encountered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictKind {
    /// A file already exists at the destination.
    FileExists,
    /// A directory exists where a file would go.
    DirectoryExists,
    /// Source and destination are the same entry.
    SameFile,
}

impl std::fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FileExists => write!(f, "File already exists"),
            Self::DirectoryExists => write!(f, "Directory already exists"),
            Self::SameFile => write!(f, "Source and destination are the same file"),
        }
    }
}

/// How a conflict is resolved.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Resolution {
    /// Not decided yet.
    #[default]
    Unresolved,
    /// Replace the existing destination.
    Overwrite,
    /// Write to a sibling with this name instead.
    Rename(String),
    /// Leave both source and destination alone.
    Skip,
    /// Stop the whole operation.
    CancelAll,
}

impl Resolution {
    /// Check if a decision was made.
    pub fn is_resolved(&self) -> bool {
        !matches!(self, Self::Unresolved)
    }
}

/// A source whose destination already exists.
#[derive(Debug, Clone)]
pub struct Conflict {
    /// The entry being transferred.
    pub source: PathHandle,
    /// The existing entry at the destination.
    pub destination: PathHandle,
    /// The kind of conflict.
    pub kind: ConflictKind,
    /// The chosen resolution.
    pub resolution: Resolution,
    /// Whether the user asked to reuse the resolution for later conflicts.
    pub apply_to_all: bool,
}

impl Conflict {
    /// Create an unresolved conflict.
    pub fn new(source: PathHandle, destination: PathHandle, kind: ConflictKind) -> Self {
        Self {
            source,
            destination,
            kind,
            resolution: Resolution::Unresolved,
            apply_to_all: false,
        }
    }
}

/// Output of a conflict scan.
#[derive(Debug, Default)]
pub struct ScanReport {
    /// Conflicts in depth-first discovery order.
    pub conflicts: Vec<Conflict>,
    /// URIs of destinations the operation will create.
    pub planned: HashSet<String>,
}

/// Detects destination collisions before anything is written.
///
/// Every method performs storage I/O and must run on a worker thread.
#[derive(Debug, Clone, Copy)]
pub struct ConflictResolver {
    kind: OperationKind,
}

impl ConflictResolver {
    /// Create a resolver for an operation kind.
    pub fn new(kind: OperationKind) -> Self {
        Self { kind }
    }

    /// Walk all source/destination pairs and collect existing destinations.
    ///
    /// Directories that exist on both sides are merged: the scan descends
    /// into them instead of reporting a conflict. Failing to stat or list a
    /// source is not reported here; the executor records it when it reaches
    /// the entry.
    pub fn scan(
        &self,
        sources: &[PathHandle],
        destination: Option<&PathHandle>,
        cancel: &CancellationToken,
    ) -> TransferResult<ScanReport> {
        let mut report = ScanReport::default();
        let Some(destination) = destination.filter(|_| self.kind.needs_destination()) else {
            return Ok(report);
        };

        if !destination.stat_resolved()?.is_dir() {
            return Err(TransferError::invalid_request(format!(
                "Destination is not a directory: {destination}"
            )));
        }

        for source in sources {
            self.scan_pair(source, destination.join(&source.name()), cancel, &mut report)?;
        }
        Ok(report)
    }

    fn scan_pair(
        &self,
        source: &PathHandle,
        target: PathHandle,
        cancel: &CancellationToken,
        report: &mut ScanReport,
    ) -> TransferResult<()> {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        if *source == target {
            report
                .conflicts
                .push(Conflict::new(source.clone(), target, ConflictKind::SameFile));
            return Ok(());
        }

        let existing = match target.try_stat() {
            Ok(Some(meta)) => meta,
            Ok(None) => {
                report.planned.insert(target.uri());
                return Ok(());
            }
            Err(e) => {
                warn!(target = %target, error = %e, "Cannot stat destination during conflict scan");
                return Ok(());
            }
        };

        let source_is_dir = match source.is_directory() {
            Ok(is_dir) => is_dir,
            Err(e) => {
                warn!(source = %source, error = %e, "Cannot stat source during conflict scan");
                return Ok(());
            }
        };

        if source_is_dir && existing.is_dir() {
            let children = match source.list() {
                Ok(children) => children,
                Err(e) => {
                    warn!(source = %source, error = %e, "Cannot list source during conflict scan");
                    return Ok(());
                }
            };
            for child in &children {
                let child_target = target.join(&child.name());
                self.scan_pair(child, child_target, cancel, report)?;
            }
            return Ok(());
        }

        let kind = if existing.is_dir() {
            ConflictKind::DirectoryExists
        } else {
            ConflictKind::FileExists
        };
        report.conflicts.push(Conflict::new(source.clone(), target, kind));
        Ok(())
    }

    /// Check that renaming a conflict's destination to `name` is possible.
    ///
    /// `taken` holds URIs already claimed by this operation. Returns the new
    /// destination handle.
    pub fn check_rename(
        conflict: &Conflict,
        name: &str,
        taken: &HashSet<String>,
    ) -> TransferResult<PathHandle> {
        validate_filename(name)
            .map_err(|message| TransferError::conflict(conflict.destination.display_path(), message))?;

        let target = conflict.destination.with_name(name);
        if target == conflict.source {
            return Err(TransferError::conflict(
                target.display_path(),
                "new name refers to the source itself",
            ));
        }
        if taken.contains(&target.uri()) {
            return Err(TransferError::conflict(
                target.display_path(),
                "name is already used by another item of this operation",
            ));
        }
        if target.exists()? {
            return Err(TransferError::conflict(target.display_path(), "already exists"));
        }
        Ok(target)
    }
}

/// Validate a filename for cross-platform compatibility.
pub fn validate_filename(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("Name cannot be empty".into());
    }
    if name.len() > 255 {
        return Err("Name is too long (max 255 bytes)".into());
    }
    if let Some(c) = name.chars().find(|c| matches!(c, '/' | '\\' | '\0')) {
        return Err(format!("Name cannot contain {c:?}"));
    }
    if name == "." || name == ".." {
        return Err("'.' and '..' are reserved names".into());
    }
    if name.starts_with(' ') || name.ends_with(' ') {
        return Err("Name cannot start or end with spaces".into());
    }
    if name.ends_with('.') {
        return Err("Name cannot end with a dot".into());
    }
    Ok(())
}

/// Propose the `n`th alternative for a name: `"a.txt"` becomes `"a (n).txt"`.
pub fn numbered_name(name: &str, n: usize) -> String {
    let path = Path::new(name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    match path.extension() {
        Some(ext) => format!("{stem} ({n}).{}", ext.to_string_lossy()),
        None => format!("{stem} ({n})"),
    }
}

//! Background execution of resolved operations.

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::ops::Add;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};
use transit_core::{OperationError, TransferError, TransferResult};
use transit_storage::{Metadata, PathHandle};

use crate::conflict::Resolution;
use crate::context::OperationShared;
use crate::event::ControlEvent;
use crate::operation::{OperationId, OperationKind};
use crate::progress::ProgressSnapshot;

/// Files (or empty directories) and bytes below an entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Measure {
    files: usize,
    bytes: u64,
}

impl Measure {
    /// Contribution of an entry that could not be measured.
    const ESTIMATE: Measure = Measure { files: 1, bytes: 0 };

    fn file(bytes: u64) -> Self {
        Self { files: 1, bytes }
    }
}

impl Add for Measure {
    type Output = Measure;

    fn add(self, other: Measure) -> Measure {
        Measure {
            files: self.files + other.files,
            bytes: self.bytes + other.bytes,
        }
    }
}

/// What to do with one source entry.
enum Plan {
    /// Write to a destination that does not exist yet.
    Create(PathHandle),
    /// Descend into an existing destination directory.
    Merge(PathHandle),
    /// Replace an existing destination.
    Replace { target: PathHandle, existing_is_dir: bool },
    Skip,
    Fail(TransferError),
}

/// Everything a worker needs to run one operation.
pub(crate) struct ExecutionJob {
    pub id: OperationId,
    pub kind: OperationKind,
    pub sources: Vec<PathHandle>,
    pub destination: Option<PathHandle>,
    /// Conflict resolutions keyed by source URI.
    pub resolutions: HashMap<String, Resolution>,
    pub chunk_size: usize,
    pub shared: Arc<OperationShared>,
    pub events: mpsc::Sender<ControlEvent>,
}

/// Performs the I/O of one operation on a blocking worker thread.
///
/// Per-item failures are recorded in the shared result and never stop the
/// run. The only errors returned from [`run`](Executor::run) are
/// cancellation and an unreachable destination root.
pub(crate) struct Executor {
    job: ExecutionJob,
    buffer: Vec<u8>,
    /// Bytes of the current file already reported as progress.
    streamed: u64,
}

impl Executor {
    pub(crate) fn new(job: ExecutionJob) -> Self {
        let buffer = vec![0; job.chunk_size.max(1)];
        Self {
            job,
            buffer,
            streamed: 0,
        }
    }

    pub(crate) fn run(mut self) -> TransferResult<()> {
        let destination = self.job.destination.clone();
        if let Some(destination) = &destination {
            if !destination.stat_resolved()?.is_dir() {
                return Err(TransferError::invalid_request(format!(
                    "Destination is not a directory: {destination}"
                )));
            }
        }

        let sources = self.job.sources.clone();
        let measures = self.count(&sources);
        self.check_cancel()?;

        for (source, measure) in sources.iter().zip(measures) {
            self.check_cancel()?;
            match &destination {
                None => {
                    self.delete_entry(source)?;
                }
                Some(destination) => {
                    let target = destination.join(&source.name());
                    if self.job.kind == OperationKind::Move && self.try_rename(source, &target, measure) {
                        continue;
                    }
                    self.transfer_entry(source, target)?;
                }
            }
        }

        self.update(|p| p.current_item = None);
        Ok(())
    }

    // --- counting pass ---

    fn count(&self, sources: &[PathHandle]) -> Vec<Measure> {
        let measures: Vec<Measure> = sources.iter().map(|s| self.measure(s)).collect();
        let total = measures.iter().copied().fold(Measure::default(), |acc, m| acc + m);
        debug!(
            operation_id = %self.job.id,
            files = total.files,
            bytes = total.bytes,
            "Counting pass finished"
        );
        self.update(|p| {
            p.files_total = total.files;
            p.bytes_total = total.bytes;
        });
        measures
    }

    fn measure(&self, entry: &PathHandle) -> Measure {
        let meta = match entry.stat() {
            Ok(meta) => meta,
            Err(e) => {
                warn!(operation_id = %self.job.id, entry = %entry, error = %e, "Cannot count entry, using estimate");
                return Measure::ESTIMATE;
            }
        };
        if !meta.is_dir() {
            return Measure::file(meta.size);
        }

        let children = match entry.list() {
            Ok(children) => children,
            Err(e) => {
                warn!(operation_id = %self.job.id, entry = %entry, error = %e, "Cannot count directory, using estimate");
                return Measure::ESTIMATE;
            }
        };
        if children.is_empty() {
            return Measure::file(0);
        }

        let mut total = Measure::default();
        for child in &children {
            if self.job.shared.cancel.is_cancelled() {
                break;
            }
            total = total + self.measure(child);
        }
        total
    }

    // --- progress and result bookkeeping ---

    fn update(&self, change: impl FnOnce(&mut ProgressSnapshot)) {
        let snapshot = self.job.shared.update_progress(change);
        let event = ControlEvent::Progress {
            id: self.job.id,
            snapshot,
        };
        if self.job.events.blocking_send(event).is_err() {
            // Nobody is listening any more.
            self.job.shared.cancel.cancel();
        }
    }

    fn check_cancel(&self) -> TransferResult<()> {
        if self.job.shared.cancel.is_cancelled() {
            Err(TransferError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn begin_item(&self, item: &PathHandle) {
        let name = item.display_path();
        self.update(|p| p.current_item = Some(name));
    }

    fn advance(&self, measure: Measure) {
        self.update(|p| {
            p.files_done += measure.files;
            p.bytes_done += measure.bytes;
        });
    }

    fn succeed(&self, measure: Measure, committed: u64) {
        self.job.shared.record(|r| {
            r.succeeded += measure.files;
            r.bytes_processed += committed;
        });
    }

    fn skip(&self, item: &PathHandle) {
        let measure = self.measure(item);
        debug!(operation_id = %self.job.id, item = %item, files = measure.files, "Skipping");
        self.job.shared.record(|r| r.skipped += measure.files);
        self.advance(measure);
    }

    /// Record a failure without touching progress.
    fn record_failure(&self, item: &PathHandle, error: &TransferError) {
        warn!(operation_id = %self.job.id, item = %item, error = %error, "Item failed");
        let record = OperationError::from_error(item.display_path(), error);
        self.job.shared.record(|r| r.failed.push(record));
    }

    fn fail(&self, item: &PathHandle, error: TransferError, remaining: Measure) {
        self.record_failure(item, &error);
        self.advance(remaining);
    }

    // --- transfer pass ---

    /// Move a top-level entry with a single rename when the store allows it.
    fn try_rename(&self, source: &PathHandle, target: &PathHandle, measure: Measure) -> bool {
        let target = match self.job.resolutions.get(&source.uri()) {
            None => target.clone(),
            Some(Resolution::Rename(name)) => target.with_name(name),
            Some(_) => return false,
        };
        if !source.same_store(&target) || !matches!(target.try_stat(), Ok(None)) {
            return false;
        }

        match source.rename_to(&target) {
            Ok(()) => {
                debug!(operation_id = %self.job.id, source = %source, target = %target, "Moved by rename");
                self.begin_item(source);
                self.succeed(measure, measure.bytes);
                self.advance(measure);
                true
            }
            Err(e) => {
                debug!(operation_id = %self.job.id, source = %source, error = %e, "Rename unavailable, copying instead");
                false
            }
        }
    }

    fn plan(&self, source: &PathHandle, source_is_dir: bool, target: PathHandle) -> Plan {
        let existing = match target.try_stat() {
            Ok(existing) => existing,
            Err(e) => return Plan::Fail(e),
        };

        match (existing, self.job.resolutions.get(&source.uri())) {
            (_, Some(Resolution::Rename(name))) => Plan::Create(target.with_name(name)),
            (_, Some(Resolution::Skip)) => Plan::Skip,
            (None, None) | (None, Some(Resolution::Overwrite)) => Plan::Create(target),
            (Some(_), Some(Resolution::Overwrite)) if *source == target => Plan::Fail(
                TransferError::conflict(target.display_path(), "cannot overwrite an entry with itself"),
            ),
            (Some(existing), Some(Resolution::Overwrite)) => Plan::Replace {
                target,
                existing_is_dir: existing.is_dir(),
            },
            (Some(existing), None) if existing.is_dir() && source_is_dir => Plan::Merge(target),
            (Some(_), None) => Plan::Fail(TransferError::conflict(
                target.display_path(),
                "destination appeared after the conflict check",
            )),
            (_, Some(Resolution::Unresolved | Resolution::CancelAll)) => Plan::Fail(
                TransferError::conflict(target.display_path(), "conflict was not resolved"),
            ),
        }
    }

    /// Copy or move one entry. Returns whether it was transferred completely.
    fn transfer_entry(&mut self, source: &PathHandle, target: PathHandle) -> TransferResult<bool> {
        self.check_cancel()?;

        let meta = match source.stat() {
            Ok(meta) => meta,
            Err(e) => {
                self.fail(source, e, Measure::ESTIMATE);
                return Ok(false);
            }
        };

        match self.plan(source, meta.is_dir(), target) {
            Plan::Skip => {
                self.skip(source);
                Ok(false)
            }
            Plan::Fail(e) => {
                let remaining = self.measure(source);
                self.fail(source, e, remaining);
                Ok(false)
            }
            Plan::Create(target) => self.place(source, &meta, &target, false),
            Plan::Merge(target) => self.transfer_children(source, &target),
            Plan::Replace {
                target,
                existing_is_dir,
            } => {
                if meta.is_dir() && existing_is_dir {
                    return self.transfer_children(source, &target);
                }
                if meta.is_dir() != existing_is_dir {
                    debug!(operation_id = %self.job.id, target = %target, "Removing destination of a different type");
                    if let Err(e) = remove_tree(&target) {
                        let remaining = self.measure(source);
                        self.fail(source, e, remaining);
                        return Ok(false);
                    }
                }
                self.place(source, &meta, &target, true)
            }
        }
    }

    fn place(
        &mut self,
        source: &PathHandle,
        meta: &Metadata,
        target: &PathHandle,
        replace: bool,
    ) -> TransferResult<bool> {
        if meta.is_symlink() {
            return self.transfer_link(source, meta, target, replace);
        }
        if !meta.is_dir() {
            return self.transfer_file(source, meta, target, replace);
        }
        if let Err(e) = target.create_dir() {
            let remaining = self.measure(source);
            self.fail(source, e, remaining);
            return Ok(false);
        }
        self.transfer_children(source, target)
    }

    fn transfer_children(&mut self, source: &PathHandle, target: &PathHandle) -> TransferResult<bool> {
        let children = match source.list() {
            Ok(children) => children,
            Err(e) => {
                self.fail(source, e, Measure::ESTIMATE);
                return Ok(false);
            }
        };

        if children.is_empty() {
            // An empty directory is a unit of its own.
            self.begin_item(source);
            if self.job.kind == OperationKind::Move {
                if let Err(e) = source.delete() {
                    self.fail(source, e, Measure::file(0));
                    return Ok(false);
                }
            }
            self.succeed(Measure::file(0), 0);
            self.advance(Measure::file(0));
            return Ok(true);
        }

        let mut complete = true;
        for child in &children {
            let child_target = target.join(&child.name());
            complete &= self.transfer_entry(child, child_target)?;
        }

        if complete && self.job.kind == OperationKind::Move {
            if let Err(e) = source.delete() {
                self.record_failure(source, &e);
                return Ok(false);
            }
        }
        Ok(complete)
    }

    /// Recreate a symbolic link at `target`. Stores without links receive
    /// the content of the file the link points to.
    fn transfer_link(
        &mut self,
        source: &PathHandle,
        meta: &Metadata,
        target: &PathHandle,
        replace: bool,
    ) -> TransferResult<bool> {
        self.begin_item(source);
        let unit = Measure::file(0);

        let Some(link_target) = meta.link_target.as_deref() else {
            let error = TransferError::unsupported("copying a link without a target", source.display_path());
            self.fail(source, error, unit);
            return Ok(false);
        };

        if replace {
            if let Err(e) = target.delete() {
                if !e.is_not_found() {
                    self.fail(source, e, unit);
                    return Ok(false);
                }
            }
        }

        match target.create_symlink(link_target) {
            Ok(()) => {}
            Err(TransferError::Unsupported { .. }) => {
                debug!(operation_id = %self.job.id, target = %target, "No symbolic links on destination, copying the linked file");
                return match source.stat_resolved() {
                    Ok(resolved) if !resolved.is_dir() => self.transfer_file(source, &resolved, target, replace),
                    Ok(_) => {
                        let error = TransferError::unsupported("copying a link to a directory", source.display_path());
                        self.fail(source, error, unit);
                        Ok(false)
                    }
                    Err(e) => {
                        self.fail(source, e, unit);
                        Ok(false)
                    }
                };
            }
            Err(e) => {
                self.fail(source, e, unit);
                return Ok(false);
            }
        }
        self.advance(unit);

        if self.job.kind == OperationKind::Move {
            if let Err(e) = source.delete() {
                self.record_failure(source, &e);
                return Ok(false);
            }
        }
        self.succeed(unit, 0);
        Ok(true)
    }

    fn transfer_file(
        &mut self,
        source: &PathHandle,
        meta: &Metadata,
        target: &PathHandle,
        replace: bool,
    ) -> TransferResult<bool> {
        self.begin_item(source);
        self.streamed = 0;
        let size = meta.size;

        let committed = match self.stream(source, meta, target, replace) {
            Ok(committed) => committed,
            Err(TransferError::Cancelled) => return Err(TransferError::Cancelled),
            Err(e) => {
                let remaining = Measure::file(size.saturating_sub(self.streamed));
                self.fail(source, e, remaining);
                return Ok(false);
            }
        };

        // Files that shrank since counting still complete their share.
        self.advance(Measure::file(size.saturating_sub(self.streamed)));

        if self.job.kind == OperationKind::Move {
            if let Err(e) = source.delete() {
                self.record_failure(source, &e);
                return Ok(false);
            }
        }
        self.succeed(Measure::file(committed), committed);
        Ok(true)
    }

    /// Stream one file into a transactional sink, chunk by chunk.
    ///
    /// Sources that cannot stream are materialized by the handle first;
    /// nothing becomes visible at `target` unless the whole body was written.
    /// Permissions and modification time follow the content where the
    /// destination keeps them.
    fn stream(
        &mut self,
        source: &PathHandle,
        meta: &Metadata,
        target: &PathHandle,
        replace: bool,
    ) -> TransferResult<u64> {
        let mut reader = source.open_for_read()?;
        let mut sink = target.open_for_write(replace)?;
        sink.preserve_metadata(meta);

        loop {
            if self.job.shared.cancel.is_cancelled() {
                debug!(operation_id = %self.job.id, target = %target, "Cancelled mid-file, discarding");
                sink.abort();
                return Err(TransferError::Cancelled);
            }

            let n = match reader.read(&mut self.buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    sink.abort();
                    return Err(TransferError::io(source.display_path(), e));
                }
            };

            if let Err(e) = sink.write_all(&self.buffer[..n]) {
                sink.abort();
                return Err(TransferError::io(target.display_path(), e));
            }

            self.streamed += n as u64;
            self.update(|p| p.bytes_done += n as u64);
        }

        sink.commit()
    }

    // --- delete pass ---

    /// Delete one entry, children first. Returns whether it is gone.
    /// Symbolic links are removed themselves, never what they point to.
    fn delete_entry(&mut self, entry: &PathHandle) -> TransferResult<bool> {
        self.check_cancel()?;

        let meta = match entry.stat() {
            Ok(meta) => meta,
            Err(e) => {
                self.fail(entry, e, Measure::ESTIMATE);
                return Ok(false);
            }
        };

        if !meta.is_dir() {
            self.begin_item(entry);
            let measure = Measure::file(meta.size);
            return Ok(match entry.delete() {
                Ok(()) => {
                    self.succeed(measure, meta.size);
                    self.advance(measure);
                    true
                }
                Err(e) => {
                    self.fail(entry, e, measure);
                    false
                }
            });
        }

        let children = match entry.list() {
            Ok(children) => children,
            Err(e) => {
                self.fail(entry, e, Measure::ESTIMATE);
                return Ok(false);
            }
        };

        let mut complete = true;
        for child in &children {
            complete &= self.delete_entry(child)?;
        }
        if !complete {
            return Ok(false);
        }

        if children.is_empty() {
            self.begin_item(entry);
        }
        match entry.delete() {
            Ok(()) => {
                if children.is_empty() {
                    self.succeed(Measure::file(0), 0);
                    self.advance(Measure::file(0));
                }
                Ok(true)
            }
            Err(e) if children.is_empty() => {
                self.fail(entry, e, Measure::file(0));
                Ok(false)
            }
            Err(e) => {
                self.record_failure(entry, &e);
                Ok(false)
            }
        }
    }
}

/// Remove an entry and everything below it.
fn remove_tree(entry: &PathHandle) -> TransferResult<()> {
    if entry.is_directory()? {
        for child in entry.list()? {
            remove_tree(&child)?;
        }
    }
    entry.delete()
}

//! Per-operation state.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;

use crate::conflict::{Conflict, Resolution};
use crate::operation::{OperationKind, OperationRequest};
use crate::progress::{OperationResult, ProgressSnapshot};

/// The part of an operation's state that worker threads may touch.
///
/// Workers only accumulate results, update progress and read the
/// cancellation flag. State transitions stay with the orchestrator.
#[derive(Debug)]
pub(crate) struct OperationShared {
    pub(crate) cancel: CancellationToken,
    result: Mutex<OperationResult>,
    progress: Mutex<ProgressSnapshot>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl OperationShared {
    pub(crate) fn new(kind: OperationKind) -> Arc<Self> {
        Arc::new(Self {
            cancel: CancellationToken::new(),
            result: Mutex::new(OperationResult::new(kind)),
            progress: Mutex::new(ProgressSnapshot::default()),
        })
    }

    pub(crate) fn record(&self, update: impl FnOnce(&mut OperationResult)) {
        update(&mut *lock(&self.result));
    }

    pub(crate) fn result(&self) -> OperationResult {
        lock(&self.result).clone()
    }

    /// Apply an update and return the resulting snapshot.
    ///
    /// Totals are raised when the done counters overtake them and are never
    /// lowered.
    pub(crate) fn update_progress(&self, update: impl FnOnce(&mut ProgressSnapshot)) -> ProgressSnapshot {
        let mut progress = lock(&self.progress);
        update(&mut *progress);
        progress.bytes_total = progress.bytes_total.max(progress.bytes_done);
        progress.files_total = progress.files_total.max(progress.files_done);
        progress.clone()
    }

    pub(crate) fn progress(&self) -> ProgressSnapshot {
        lock(&self.progress).clone()
    }
}

/// Mutable state of one in-flight operation, owned by its orchestrator.
#[derive(Debug)]
pub struct OperationContext {
    pub(crate) request: OperationRequest,
    pub(crate) conflicts: Vec<Conflict>,
    pub(crate) cursor: usize,
    /// Destination URIs the operation will create or already claimed by renames.
    pub(crate) taken: HashSet<String>,
    pub(crate) shared: Arc<OperationShared>,
}

impl OperationContext {
    pub(crate) fn new(request: OperationRequest) -> Self {
        let shared = OperationShared::new(request.kind);
        Self {
            request,
            conflicts: Vec::new(),
            cursor: 0,
            taken: HashSet::new(),
            shared,
        }
    }

    /// The originating request.
    pub fn request(&self) -> &OperationRequest {
        &self.request
    }

    /// Conflicts detected so far, in prompt order.
    pub fn conflicts(&self) -> &[Conflict] {
        &self.conflicts
    }

    /// Index of the conflict currently being resolved.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Check if cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Latest progress.
    pub fn progress(&self) -> ProgressSnapshot {
        self.shared.progress()
    }

    /// Result accumulated so far.
    pub fn result(&self) -> OperationResult {
        self.shared.result()
    }

    pub(crate) fn next_unresolved(&self) -> Option<usize> {
        (self.cursor..self.conflicts.len()).find(|&i| !self.conflicts[i].resolution.is_resolved())
    }

    /// Resolutions keyed by source URI, as consumed by the executor.
    pub(crate) fn resolutions(&self) -> HashMap<String, Resolution> {
        self.conflicts
            .iter()
            .map(|c| (c.source.uri(), c.resolution.clone()))
            .collect()
    }
}

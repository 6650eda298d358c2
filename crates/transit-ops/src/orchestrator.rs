//! The per-operation state machine.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use transit_core::{TransferConfig, TransferError, TransferResult};
use transit_storage::PathHandle;

use crate::conflict::{ConflictResolver, Resolution, ScanReport};
use crate::context::OperationContext;
use crate::event::{Answer, ControlEvent};
use crate::executor::{ExecutionJob, Executor};
use crate::operation::{OperationId, OperationKind, OperationRequest, OperationState};
use crate::progress::{OperationResult, ProgressSnapshot};
use crate::ui::{ConfirmReply, ConflictPrompt, ConflictReply, OperationUi, RenameReply};

/// Drives one operation from request to terminal state.
///
/// Runs on the control loop only. Storage I/O (conflict scan, rename checks,
/// execution) is handed to blocking workers whose results come back as
/// events; UI decisions come back as events too. Every prompt carries a
/// sequence number so late or duplicate answers are ignored.
pub struct OperationOrchestrator {
    id: OperationId,
    state: OperationState,
    context: OperationContext,
    config: TransferConfig,
    ui: Arc<dyn OperationUi>,
    control: mpsc::UnboundedSender<ControlEvent>,
    worker: mpsc::Sender<ControlEvent>,
    prompt: u64,
    apply_to_all: Option<Resolution>,
    notice: Option<String>,
    last_progress: Option<ProgressSnapshot>,
    outcome: Option<OperationResult>,
}

impl OperationOrchestrator {
    pub(crate) fn new(
        id: OperationId,
        request: OperationRequest,
        config: TransferConfig,
        ui: Arc<dyn OperationUi>,
        control: mpsc::UnboundedSender<ControlEvent>,
        worker: mpsc::Sender<ControlEvent>,
    ) -> Self {
        Self {
            id,
            state: OperationState::Idle,
            context: OperationContext::new(request),
            config,
            ui,
            control,
            worker,
            prompt: 0,
            apply_to_all: None,
            notice: None,
            last_progress: None,
            outcome: None,
        }
    }

    /// The operation's identifier.
    pub fn id(&self) -> OperationId {
        self.id
    }

    /// Current state.
    pub fn state(&self) -> OperationState {
        self.state
    }

    /// The operation's context.
    pub fn context(&self) -> &OperationContext {
        &self.context
    }

    /// The final result, once a terminal state was reached.
    pub fn outcome(&self) -> Option<&OperationResult> {
        self.outcome.as_ref()
    }

    pub(crate) fn cancel_token(&self) -> tokio_util::sync::CancellationToken {
        self.context.shared.cancel.clone()
    }

    pub(crate) fn into_outcome(self) -> Option<OperationResult> {
        self.outcome
    }

    fn transition(&mut self, next: OperationState) {
        debug!(operation_id = %self.id, from = %self.state, to = %next, "State transition");
        self.state = next;
    }

    fn next_prompt(&mut self) -> u64 {
        self.prompt += 1;
        self.prompt
    }

    fn needs_confirmation(&self) -> bool {
        match self.context.request.kind {
            OperationKind::Copy => self.config.confirm_copy,
            OperationKind::Move => self.config.confirm_move,
            OperationKind::Delete => self.config.confirm_delete,
        }
    }

    // --- Idle -> Confirming ---

    pub(crate) fn start(&mut self) {
        let request = &self.context.request;
        info!(
            operation_id = %self.id,
            kind = %request.kind,
            sources = request.sources.len(),
            destination = ?request.destination.as_ref().map(PathHandle::display_path),
            "Starting operation"
        );

        if let Err(e) = validate(request) {
            self.fail(e);
            return;
        }

        if self.needs_confirmation() {
            self.transition(OperationState::Confirming);
            let reply = ConfirmReply::new(self.id, self.next_prompt(), self.control.clone());
            self.ui.show_confirmation(&self.context.request, reply);
        } else {
            self.check_conflicts();
        }
    }

    // --- Confirming -> CheckingConflicts ---

    fn check_conflicts(&mut self) {
        self.transition(OperationState::CheckingConflicts);

        if !self.context.request.kind.needs_destination() {
            self.conflicts_found(Ok(ScanReport::default()));
            return;
        }

        let id = self.id;
        let resolver = ConflictResolver::new(self.context.request.kind);
        let sources = self.context.request.sources.clone();
        let destination = self.context.request.destination.clone();
        let cancel = self.cancel_token();
        let worker = self.worker.clone();

        tokio::task::spawn_blocking(move || {
            let report = resolver.scan(&sources, destination.as_ref(), &cancel);
            let _ = worker.blocking_send(ControlEvent::ScanFinished { id, report });
        });
    }

    // --- CheckingConflicts -> ResolvingConflict | Executing ---

    fn conflicts_found(&mut self, report: TransferResult<ScanReport>) {
        if self.state != OperationState::CheckingConflicts {
            return;
        }

        let report = match report {
            Ok(report) => report,
            Err(TransferError::Cancelled) => {
                self.finish(OperationState::Cancelled);
                return;
            }
            Err(e) => {
                self.fail(e);
                return;
            }
        };

        debug!(operation_id = %self.id, conflicts = report.conflicts.len(), "Conflict scan finished");
        self.context.conflicts = report.conflicts;
        self.context.taken = report.planned;
        self.context.cursor = 0;

        if self.context.request.default_overwrite {
            for conflict in &mut self.context.conflicts {
                conflict.resolution = Resolution::Overwrite;
            }
        }
        self.resolve_next();
    }

    // --- ResolvingConflict ---

    fn resolve_next(&mut self) {
        loop {
            let Some(index) = self.context.next_unresolved() else {
                self.execute();
                return;
            };
            self.context.cursor = index;

            if let Some(resolution) = self.apply_to_all.clone() {
                debug!(operation_id = %self.id, index, ?resolution, "Applying resolution to remaining conflict");
                let conflict = &mut self.context.conflicts[index];
                conflict.resolution = resolution;
                conflict.apply_to_all = true;
                continue;
            }

            if self.state != OperationState::ResolvingConflict {
                self.transition(OperationState::ResolvingConflict);
            }
            let prompt = ConflictPrompt {
                conflict: self.context.conflicts[index].clone(),
                index,
                total: self.context.conflicts.len(),
                notice: self.notice.take(),
            };
            let reply = ConflictReply::new(self.id, self.next_prompt(), self.control.clone());
            self.ui.show_conflict_dialog(&prompt, reply);
            return;
        }
    }

    fn apply_resolution(&mut self, resolution: Resolution, apply_to_all: bool) {
        let index = self.context.cursor;
        match resolution {
            Resolution::CancelAll => {
                info!(operation_id = %self.id, "Operation cancelled from conflict dialog");
                self.context.conflicts[index].resolution = Resolution::CancelAll;
                self.context.shared.cancel.cancel();
                self.finish(OperationState::Cancelled);
            }
            Resolution::Unresolved => self.resolve_next(),
            Resolution::Rename(name) => self.check_rename(name),
            Resolution::Overwrite | Resolution::Skip => {
                debug!(operation_id = %self.id, index, ?resolution, apply_to_all, "Conflict resolved");
                let conflict = &mut self.context.conflicts[index];
                conflict.apply_to_all = apply_to_all;
                conflict.resolution = resolution.clone();
                if apply_to_all {
                    self.apply_to_all = Some(resolution);
                }
                self.context.cursor += 1;
                self.resolve_next();
            }
        }
    }

    fn ask_rename(&mut self) {
        let conflict = &self.context.conflicts[self.context.cursor];
        let (source, destination) = (conflict.source.clone(), conflict.destination.clone());
        let reply = RenameReply::new(self.id, self.next_prompt(), self.control.clone());
        self.ui.show_rename_dialog(&source, &destination, reply);
    }

    fn check_rename(&mut self, name: String) {
        let id = self.id;
        let prompt = self.next_prompt();
        let conflict = self.context.conflicts[self.context.cursor].clone();
        let taken = self.context.taken.clone();
        let worker = self.worker.clone();

        tokio::task::spawn_blocking(move || {
            let outcome = ConflictResolver::check_rename(&conflict, &name, &taken);
            let _ = worker.blocking_send(ControlEvent::RenameChecked {
                id,
                prompt,
                name,
                outcome,
            });
        });
    }

    fn rename_checked(&mut self, name: String, outcome: TransferResult<PathHandle>) {
        let index = self.context.cursor;
        match outcome {
            Ok(target) => {
                debug!(operation_id = %self.id, index, target = %target, "Rename accepted");
                self.context.taken.insert(target.uri());
                self.context.conflicts[index].resolution = Resolution::Rename(name);
                self.context.cursor += 1;
                self.resolve_next();
            }
            Err(e) => {
                warn!(operation_id = %self.id, index, error = %e, "Rename rejected, asking again");
                self.context.conflicts[index].resolution = Resolution::Unresolved;
                self.notice = Some(e.to_string());
                self.resolve_next();
            }
        }
    }

    // --- Executing ---

    fn execute(&mut self) {
        self.transition(OperationState::Executing);

        let request = &self.context.request;
        let job = ExecutionJob {
            id: self.id,
            kind: request.kind,
            sources: request.sources.clone(),
            destination: request.destination.clone(),
            resolutions: self.context.resolutions(),
            chunk_size: self.config.chunk_size,
            shared: Arc::clone(&self.context.shared),
            events: self.worker.clone(),
        };
        let id = self.id;
        let worker = self.worker.clone();

        tokio::task::spawn_blocking(move || {
            let outcome = Executor::new(job).run();
            let _ = worker.blocking_send(ControlEvent::Finished { id, outcome });
        });
    }

    fn progressed(&mut self, snapshot: ProgressSnapshot) {
        if self.state != OperationState::Executing {
            return;
        }
        if let Some(last) = &self.last_progress {
            if !snapshot.follows(last) {
                debug!(operation_id = %self.id, "Dropping out-of-order progress");
                return;
            }
        }
        self.ui.report_progress(&snapshot);
        self.last_progress = Some(snapshot);
    }

    fn executed(&mut self, outcome: TransferResult<()>) {
        if self.state != OperationState::Executing {
            return;
        }
        match outcome {
            Err(TransferError::Cancelled) => self.finish(OperationState::Cancelled),
            Err(e) => self.fail(e),
            Ok(()) if self.context.is_cancelled() => self.finish(OperationState::Cancelled),
            Ok(()) => self.finish(OperationState::Completed),
        }
    }

    // --- events ---

    pub(crate) fn handle(&mut self, event: ControlEvent) {
        if self.state.is_terminal() {
            return;
        }
        match event {
            ControlEvent::Cancel { .. } => self.cancel(),
            ControlEvent::Answer { prompt, answer, .. } => {
                if prompt != self.prompt {
                    debug!(operation_id = %self.id, prompt, "Ignoring stale answer");
                    return;
                }
                self.answered(answer);
            }
            ControlEvent::ScanFinished { report, .. } => self.conflicts_found(report),
            ControlEvent::RenameChecked {
                prompt,
                name,
                outcome,
                ..
            } => {
                if prompt == self.prompt && self.state == OperationState::ResolvingConflict {
                    self.rename_checked(name, outcome);
                }
            }
            ControlEvent::Progress { snapshot, .. } => self.progressed(snapshot),
            ControlEvent::Finished { outcome, .. } => self.executed(outcome),
        }
    }

    fn answered(&mut self, answer: Answer) {
        match (self.state, answer) {
            (OperationState::Confirming, Answer::Confirm(true)) => self.check_conflicts(),
            (OperationState::Confirming, Answer::Confirm(false)) => {
                info!(operation_id = %self.id, "Operation not confirmed");
                self.finish(OperationState::Cancelled);
            }
            (
                OperationState::ResolvingConflict,
                Answer::Resolve {
                    resolution,
                    apply_to_all,
                },
            ) => self.apply_resolution(resolution, apply_to_all),
            (OperationState::ResolvingConflict, Answer::AskRename) => self.ask_rename(),
            (OperationState::ResolvingConflict, Answer::Rename(Some(name))) => self.check_rename(name),
            (OperationState::ResolvingConflict, Answer::Rename(None)) => {
                debug!(operation_id = %self.id, "Rename cancelled, back to conflict dialog");
                self.resolve_next();
            }
            (state, answer) => {
                debug!(operation_id = %self.id, %state, ?answer, "Ignoring unexpected answer");
            }
        }
    }

    /// Request cancellation. Idempotent.
    ///
    /// Outside of execution the operation ends immediately. During execution
    /// the worker stops at its next check and the operation ends once it has
    /// reported back.
    pub(crate) fn cancel(&mut self) {
        self.context.shared.cancel.cancel();
        match self.state {
            OperationState::Executing => {
                info!(operation_id = %self.id, "Cancellation requested, waiting for worker");
            }
            state if state.is_terminal() => {}
            _ => self.finish(OperationState::Cancelled),
        }
    }

    // --- terminal states ---

    fn fail(&mut self, error: TransferError) {
        warn!(operation_id = %self.id, error = %error, "Operation failed");
        let message = error.to_string();
        self.context.shared.record(|r| r.error = Some(message));
        self.finish(OperationState::Failed);
    }

    fn finish(&mut self, state: OperationState) {
        self.transition(state);
        let mut result = self.context.result();
        result.state = state;
        info!(operation_id = %self.id, summary = %result.summary(), "Operation finished");
        self.ui.report_completion(&result);
        self.outcome = Some(result);
    }
}

/// Check a request before anything is asked or touched.
///
/// Only capability flags and identities are inspected; no storage I/O.
fn validate(request: &OperationRequest) -> TransferResult<()> {
    if request.sources.is_empty() {
        return Err(TransferError::invalid_request("No sources given"));
    }

    match (&request.destination, request.kind.needs_destination()) {
        (None, true) => {
            return Err(TransferError::invalid_request(format!(
                "{} requires a destination",
                request.kind
            )));
        }
        (Some(_), false) => {
            return Err(TransferError::invalid_request(format!(
                "{} does not take a destination",
                request.kind
            )));
        }
        (Some(destination), true) => {
            if !destination.supports_write() {
                return Err(TransferError::read_only(destination.display_path()));
            }
            if let Some(source) = request.sources.iter().find(|s| destination.is_within(s)) {
                return Err(TransferError::invalid_request(format!(
                    "Cannot {} {} into itself",
                    request.kind.to_string().to_lowercase(),
                    source
                )));
            }
        }
        (None, false) => {}
    }

    if request.kind != OperationKind::Copy {
        if let Some(source) = request.sources.iter().find(|s| !s.supports_write()) {
            return Err(TransferError::read_only(source.display_path()));
        }
    }
    Ok(())
}

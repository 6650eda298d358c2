//! The UI collaborator contract.
//!
//! Dialog methods never block: each receives a one-shot reply value and
//! returns immediately. The operation advances once the reply is used, which
//! may happen later and from another thread. Dropping a reply unanswered
//! counts as the most conservative answer.

use tokio::sync::mpsc;
use transit_storage::PathHandle;

use crate::conflict::{Conflict, Resolution};
use crate::event::{Answer, ControlEvent};
use crate::operation::{OperationId, OperationRequest};
use crate::progress::{OperationResult, ProgressSnapshot};

/// Decision and reporting surface implemented by the embedding application.
///
/// Methods are called on the control loop and must not block on I/O.
pub trait OperationUi: Send + Sync {
    /// Ask whether the operation should run.
    fn show_confirmation(&self, request: &OperationRequest, reply: ConfirmReply);

    /// Ask how to resolve one conflict.
    fn show_conflict_dialog(&self, prompt: &ConflictPrompt, reply: ConflictReply);

    /// Ask for a new destination name.
    fn show_rename_dialog(&self, source: &PathHandle, destination: &PathHandle, reply: RenameReply);

    /// Progress update while executing.
    fn report_progress(&self, snapshot: &ProgressSnapshot);

    /// The final outcome. Called exactly once per operation.
    fn report_completion(&self, result: &OperationResult);
}

/// A conflict presented for resolution.
#[derive(Debug, Clone)]
pub struct ConflictPrompt {
    /// The conflict to resolve.
    pub conflict: Conflict,
    /// Zero-based position among all conflicts of the operation.
    pub index: usize,
    /// Number of conflicts in the operation.
    pub total: usize,
    /// Why a previous answer for this conflict was rejected.
    pub notice: Option<String>,
}

#[derive(Debug)]
struct ReplySlot {
    id: OperationId,
    prompt: u64,
    control: mpsc::UnboundedSender<ControlEvent>,
}

impl ReplySlot {
    fn post(self, answer: Answer) {
        let event = ControlEvent::Answer {
            id: self.id,
            prompt: self.prompt,
            answer,
        };
        if self.control.send(event).is_err() {
            tracing::debug!(operation_id = %self.id, "Reply after service shutdown ignored");
        }
    }
}

/// Reply to [`OperationUi::show_confirmation`]. Dropping it rejects.
#[derive(Debug)]
pub struct ConfirmReply(Option<ReplySlot>);

impl ConfirmReply {
    pub(crate) fn new(id: OperationId, prompt: u64, control: mpsc::UnboundedSender<ControlEvent>) -> Self {
        Self(Some(ReplySlot { id, prompt, control }))
    }

    /// Run the operation.
    pub fn confirm(mut self) {
        self.answer(true);
    }

    /// Do not run the operation.
    pub fn reject(mut self) {
        self.answer(false);
    }

    fn answer(&mut self, accepted: bool) {
        if let Some(slot) = self.0.take() {
            slot.post(Answer::Confirm(accepted));
        }
    }
}

impl Drop for ConfirmReply {
    fn drop(&mut self) {
        self.answer(false);
    }
}

/// Reply to [`OperationUi::show_conflict_dialog`]. Dropping it cancels the
/// whole operation.
#[derive(Debug)]
pub struct ConflictReply(Option<ReplySlot>);

impl ConflictReply {
    pub(crate) fn new(id: OperationId, prompt: u64, control: mpsc::UnboundedSender<ControlEvent>) -> Self {
        Self(Some(ReplySlot { id, prompt, control }))
    }

    /// Answer with an explicit resolution.
    ///
    /// `Resolution::Rename` with a name skips the rename dialog;
    /// `apply_to_all` is honored for overwrite and skip.
    pub fn resolve(mut self, resolution: Resolution, apply_to_all: bool) {
        self.send(Answer::Resolve {
            resolution,
            apply_to_all,
        });
    }

    /// Replace the existing destination.
    pub fn overwrite(self, apply_to_all: bool) {
        self.resolve(Resolution::Overwrite, apply_to_all);
    }

    /// Leave this item alone.
    pub fn skip(self, apply_to_all: bool) {
        self.resolve(Resolution::Skip, apply_to_all);
    }

    /// Ask for a new name through [`OperationUi::show_rename_dialog`].
    pub fn rename(mut self) {
        self.send(Answer::AskRename);
    }

    /// Stop the whole operation.
    pub fn cancel_all(self) {
        self.resolve(Resolution::CancelAll, false);
    }

    fn send(&mut self, answer: Answer) {
        if let Some(slot) = self.0.take() {
            slot.post(answer);
        }
    }
}

impl Drop for ConflictReply {
    fn drop(&mut self) {
        self.send(Answer::Resolve {
            resolution: Resolution::CancelAll,
            apply_to_all: false,
        });
    }
}

/// Reply to [`OperationUi::show_rename_dialog`]. Dropping it cancels the
/// rename and returns to the conflict dialog.
#[derive(Debug)]
pub struct RenameReply(Option<ReplySlot>);

impl RenameReply {
    pub(crate) fn new(id: OperationId, prompt: u64, control: mpsc::UnboundedSender<ControlEvent>) -> Self {
        Self(Some(ReplySlot { id, prompt, control }))
    }

    /// Use `name` for the destination.
    pub fn submit(mut self, name: impl Into<String>) {
        self.send(Some(name.into()));
    }

    /// Go back to the conflict dialog.
    pub fn cancel(mut self) {
        self.send(None);
    }

    fn send(&mut self, name: Option<String>) {
        if let Some(slot) = self.0.take() {
            slot.post(Answer::Rename(name));
        }
    }
}

impl Drop for RenameReply {
    fn drop(&mut self) {
        self.send(None);
    }
}

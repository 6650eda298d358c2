//! Operation requests, identifiers and lifecycle states.

use std::fmt;

use serde::{Deserialize, Serialize};
use strum::Display;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use transit_storage::PathHandle;

use crate::event::ControlEvent;

/// The kind of transfer operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
pub enum OperationKind {
    Copy,
    Move,
    Delete,
}

impl OperationKind {
    /// Whether the operation writes into a destination directory.
    pub fn needs_destination(self) -> bool {
        !matches!(self, Self::Delete)
    }

    /// Past tense used in summaries.
    pub fn past_tense(self) -> &'static str {
        match self {
            Self::Copy => "Copied",
            Self::Move => "Moved",
            Self::Delete => "Deleted",
        }
    }
}

/// Input to one operation. Never mutated once started.
#[derive(Debug, Clone)]
pub struct OperationRequest {
    /// What to do.
    pub kind: OperationKind,
    /// Entries to operate on, in order.
    pub sources: Vec<PathHandle>,
    /// Directory receiving the sources (absent for deletes).
    pub destination: Option<PathHandle>,
    /// Resolve every conflict with overwrite without asking.
    pub default_overwrite: bool,
}

impl OperationRequest {
    /// Copy `sources` into the `destination` directory.
    pub fn copy(sources: Vec<PathHandle>, destination: PathHandle) -> Self {
        Self {
            kind: OperationKind::Copy,
            sources,
            destination: Some(destination),
            default_overwrite: false,
        }
    }

    /// Move `sources` into the `destination` directory.
    pub fn move_to(sources: Vec<PathHandle>, destination: PathHandle) -> Self {
        Self {
            kind: OperationKind::Move,
            sources,
            destination: Some(destination),
            default_overwrite: false,
        }
    }

    /// Delete `targets`, recursively for directories.
    pub fn delete(targets: Vec<PathHandle>) -> Self {
        Self {
            kind: OperationKind::Delete,
            sources: targets,
            destination: None,
            default_overwrite: false,
        }
    }

    /// Overwrite conflicting destinations without prompting.
    pub fn with_default_overwrite(mut self, overwrite: bool) -> Self {
        self.default_overwrite = overwrite;
        self
    }
}

/// Identifier of one operation within a [`TransferService`](crate::TransferService).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationId(pub(crate) u64);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

/// Lifecycle states of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
pub enum OperationState {
    Idle,
    Confirming,
    CheckingConflicts,
    ResolvingConflict,
    Executing,
    Completed,
    Cancelled,
    Failed,
}

impl OperationState {
    /// Check if no further transitions can happen.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

/// Caller-side reference to a started operation.
///
/// Cancelling through the handle works from any thread: the cancellation
/// flag is raised immediately and the state machine is notified through the
/// control channel.
#[derive(Debug, Clone)]
pub struct OperationHandle {
    id: OperationId,
    cancel: CancellationToken,
    control: mpsc::UnboundedSender<ControlEvent>,
}

impl OperationHandle {
    pub(crate) fn new(
        id: OperationId,
        cancel: CancellationToken,
        control: mpsc::UnboundedSender<ControlEvent>,
    ) -> Self {
        Self {
            id,
            cancel,
            control,
        }
    }

    /// The operation's identifier.
    pub fn id(&self) -> OperationId {
        self.id
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
        // The service may already be gone; the flag alone is enough then.
        let _ = self.control.send(ControlEvent::Cancel { id: self.id });
    }

    /// Check if cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

//! Events consumed by the control loop.

use transit_core::TransferResult;
use transit_storage::PathHandle;

use crate::conflict::{Resolution, ScanReport};
use crate::operation::OperationId;
use crate::progress::ProgressSnapshot;

/// An answer from the UI collaborator to one prompt.
#[derive(Debug)]
pub(crate) enum Answer {
    Confirm(bool),
    Resolve {
        resolution: Resolution,
        apply_to_all: bool,
    },
    /// Conflict dialog chose rename without supplying a name.
    AskRename,
    /// Rename dialog result; `None` when the dialog was cancelled.
    Rename(Option<String>),
}

/// Everything that can advance an operation's state machine.
///
/// UI answers and cancellations travel on the unbounded control channel;
/// worker results travel on the bounded worker channel.
#[derive(Debug)]
pub(crate) enum ControlEvent {
    Cancel {
        id: OperationId,
    },
    Answer {
        id: OperationId,
        prompt: u64,
        answer: Answer,
    },
    ScanFinished {
        id: OperationId,
        report: TransferResult<ScanReport>,
    },
    RenameChecked {
        id: OperationId,
        prompt: u64,
        name: String,
        outcome: TransferResult<PathHandle>,
    },
    Progress {
        id: OperationId,
        snapshot: ProgressSnapshot,
    },
    Finished {
        id: OperationId,
        outcome: TransferResult<()>,
    },
}

impl ControlEvent {
    pub(crate) fn operation(&self) -> OperationId {
        match self {
            Self::Cancel { id }
            | Self::Answer { id, .. }
            | Self::ScanFinished { id, .. }
            | Self::RenameChecked { id, .. }
            | Self::Progress { id, .. }
            | Self::Finished { id, .. } => *id,
        }
    }
}

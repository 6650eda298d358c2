//! Copy, move and delete engine for transit.
//!
//! A [`TransferService`] drives each operation through its state machine:
//! confirmation, conflict detection, conflict resolution and execution. All
//! storage I/O runs on blocking worker threads that report back through a
//! bounded channel; decisions are requested from an [`OperationUi`] and
//! delivered back through one-shot reply values.

mod conflict;
mod context;
mod event;
mod executor;
mod operation;
mod orchestrator;
mod progress;
mod service;
mod ui;

pub use conflict::{
    numbered_name, validate_filename, Conflict, ConflictKind, ConflictResolver, Resolution,
    ScanReport,
};
pub use context::OperationContext;
pub use operation::{OperationHandle, OperationId, OperationKind, OperationRequest, OperationState};
pub use orchestrator::OperationOrchestrator;
pub use progress::{OperationResult, ProgressSnapshot};
pub use service::TransferService;
pub use ui::{ConfirmReply, ConflictPrompt, ConflictReply, OperationUi, RenameReply};

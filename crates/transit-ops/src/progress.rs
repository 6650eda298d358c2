//! Progress reporting and result types.

use serde::{Deserialize, Serialize};
use transit_core::OperationError;

use crate::operation::{OperationKind, OperationState};

/// Point-in-time progress of an operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// Bytes processed so far.
    pub bytes_done: u64,
    /// Total bytes to process (estimated by the counting pass).
    pub bytes_total: u64,
    /// Files and empty directories processed so far.
    pub files_done: usize,
    /// Total files and empty directories to process.
    pub files_total: usize,
    /// The entry currently being processed.
    pub current_item: Option<String>,
}

impl ProgressSnapshot {
    /// Get the progress as a percentage (0.0 to 100.0).
    pub fn percentage(&self) -> f64 {
        if self.bytes_total > 0 {
            (self.bytes_done as f64 / self.bytes_total as f64) * 100.0
        } else if self.files_total > 0 {
            (self.files_done as f64 / self.files_total as f64) * 100.0
        } else {
            0.0
        }
    }

    /// Check if `self` does not go backwards relative to `earlier`.
    pub fn follows(&self, earlier: &ProgressSnapshot) -> bool {
        self.bytes_done >= earlier.bytes_done && self.files_done >= earlier.files_done
    }
}

/// Final outcome of an operation, delivered once through
/// [`OperationUi::report_completion`](crate::OperationUi::report_completion).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResult {
    /// The type of operation.
    pub kind: OperationKind,
    /// Terminal state the operation ended in.
    pub state: OperationState,
    /// Number of items transferred or deleted.
    pub succeeded: usize,
    /// Number of items skipped by conflict resolution.
    pub skipped: usize,
    /// Per-item failures, in processing order.
    pub failed: Vec<OperationError>,
    /// Bytes committed to destinations (or freed, for deletes).
    pub bytes_processed: u64,
    /// Why the operation failed as a whole, if it did.
    pub error: Option<String>,
}

impl OperationResult {
    /// An empty result for a new operation.
    pub fn new(kind: OperationKind) -> Self {
        Self {
            kind,
            state: OperationState::Idle,
            succeeded: 0,
            skipped: 0,
            failed: Vec::new(),
            bytes_processed: 0,
            error: None,
        }
    }

    /// Check if the operation completed without any failure.
    pub fn is_success(&self) -> bool {
        self.state == OperationState::Completed && self.failed.is_empty()
    }

    /// Get a human-readable summary of the operation.
    pub fn summary(&self) -> String {
        match self.state {
            OperationState::Failed => format!(
                "{} failed: {}",
                self.kind,
                self.error.as_deref().unwrap_or("unknown error")
            ),
            OperationState::Cancelled => format!(
                "{} cancelled after {} items",
                self.kind,
                self.succeeded
            ),
            _ => {
                let mut text = format!("{} {} items", self.kind.past_tense(), self.succeeded);
                if self.skipped > 0 {
                    text.push_str(&format!(", {} skipped", self.skipped));
                }
                if !self.failed.is_empty() {
                    text.push_str(&format!(", {} failed", self.failed.len()));
                }
                text
            }
        }
    }
}

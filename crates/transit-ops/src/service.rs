//! The control loop owning every in-flight operation.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;
use transit_core::TransferConfig;

use crate::event::ControlEvent;
use crate::operation::{OperationHandle, OperationId, OperationRequest, OperationState};
use crate::orchestrator::OperationOrchestrator;
use crate::progress::{OperationResult, ProgressSnapshot};
use crate::ui::OperationUi;

/// Runs any number of concurrent operations.
///
/// Events from the UI and from workers are applied one at a time by whoever
/// polls [`next_event`](Self::next_event) or
/// [`run_until_idle`](Self::run_until_idle). Must be used inside a tokio
/// runtime: workers run on its blocking pool.
pub struct TransferService {
    config: TransferConfig,
    active: HashMap<OperationId, OperationOrchestrator>,
    finished: HashMap<OperationId, OperationResult>,
    next_id: u64,
    control_tx: mpsc::UnboundedSender<ControlEvent>,
    control_rx: mpsc::UnboundedReceiver<ControlEvent>,
    worker_tx: mpsc::Sender<ControlEvent>,
    worker_rx: mpsc::Receiver<ControlEvent>,
}

impl TransferService {
    pub fn new(config: TransferConfig) -> Self {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (worker_tx, worker_rx) = mpsc::channel(config.event_channel_size.max(1));
        Self {
            config,
            active: HashMap::new(),
            finished: HashMap::new(),
            next_id: 0,
            control_tx,
            control_rx,
            worker_tx,
            worker_rx,
        }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Start a new operation and return a handle to it.
    ///
    /// Validation errors end the operation immediately; they are reported
    /// through [`OperationUi::report_completion`] like any other outcome.
    pub fn start(&mut self, request: OperationRequest, ui: Arc<dyn OperationUi>) -> OperationHandle {
        self.next_id += 1;
        let id = OperationId(self.next_id);

        let mut orchestrator = OperationOrchestrator::new(
            id,
            request,
            self.config.clone(),
            ui,
            self.control_tx.clone(),
            self.worker_tx.clone(),
        );
        let handle = OperationHandle::new(id, orchestrator.cancel_token(), self.control_tx.clone());

        orchestrator.start();
        self.active.insert(id, orchestrator);
        self.retire_if_done(id);
        handle
    }

    /// Cancel an operation. Takes effect at once unless a worker is running,
    /// in which case the operation ends when the worker stops.
    pub fn cancel(&mut self, handle: &OperationHandle) {
        if let Some(orchestrator) = self.active.get_mut(&handle.id()) {
            orchestrator.cancel();
        }
        self.retire_if_done(handle.id());
    }

    /// Current state of an operation, active or finished.
    pub fn state(&self, id: OperationId) -> Option<OperationState> {
        self.active
            .get(&id)
            .map(OperationOrchestrator::state)
            .or_else(|| self.finished.get(&id).map(|r| r.state))
    }

    /// Final result of a finished operation.
    pub fn result(&self, id: OperationId) -> Option<&OperationResult> {
        self.finished.get(&id)
    }

    /// Latest progress of an active operation.
    pub fn progress(&self, id: OperationId) -> Option<ProgressSnapshot> {
        self.active.get(&id).map(|o| o.context().progress())
    }

    /// The orchestrator of an active operation.
    pub fn orchestrator(&self, id: OperationId) -> Option<&OperationOrchestrator> {
        self.active.get(&id)
    }

    /// Check if no operation is in flight.
    pub fn is_idle(&self) -> bool {
        self.active.is_empty()
    }

    /// Wait for and apply one event. Returns the operation it belonged to,
    /// or `None` when nothing is in flight.
    ///
    /// Control events (answers and cancellations) take priority over worker
    /// events so a cancel is never stuck behind a queue of progress updates.
    pub async fn next_event(&mut self) -> Option<OperationId> {
        if self.active.is_empty() {
            return None;
        }

        let event = tokio::select! {
            biased;
            Some(event) = self.control_rx.recv() => event,
            Some(event) = self.worker_rx.recv() => event,
            else => return None,
        };

        let id = event.operation();
        match self.active.get_mut(&id) {
            Some(orchestrator) => orchestrator.handle(event),
            None => debug!(operation_id = %id, "Ignoring event for finished operation"),
        }
        self.retire_if_done(id);
        Some(id)
    }

    /// Apply events until every operation reached a terminal state.
    pub async fn run_until_idle(&mut self) {
        while self.next_event().await.is_some() {}
    }

    /// Cancel every active operation and wait for them to stop.
    pub async fn shutdown(&mut self) {
        let ids: Vec<_> = self.active.keys().copied().collect();
        for id in ids {
            if let Some(orchestrator) = self.active.get_mut(&id) {
                orchestrator.cancel();
            }
            self.retire_if_done(id);
        }
        self.run_until_idle().await;
    }

    fn retire_if_done(&mut self, id: OperationId) {
        let done = self.active.get(&id).is_some_and(|o| o.state().is_terminal());
        if !done {
            return;
        }
        if let Some(outcome) = self.active.remove(&id).and_then(OperationOrchestrator::into_outcome) {
            self.finished.insert(id, outcome);
        }
    }
}

impl Drop for TransferService {
    fn drop(&mut self) {
        for orchestrator in self.active.values() {
            orchestrator.cancel_token().cancel();
        }
    }
}


//! Progress events emitted while a run executes.

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::report::{FailureKind, NodeState, RunStatus, SkipReason};

/// One step of a run's lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExecutionEvent {
    RunStarted {
        run_id: Uuid,
        graph_id: String,
        affected: usize,
    },
    LayerStarted {
        run_id: Uuid,
        index: usize,
    },
    NodeStarted {
        run_id: Uuid,
        node_id: String,
        attempt: u32,
    },
    NodePolling {
        run_id: Uuid,
        node_id: String,
        attempt: u32,
    },
    NodeRetrying {
        run_id: Uuid,
        node_id: String,
        attempt: u32,
        error: String,
    },
    NodeCompleted {
        run_id: Uuid,
        node_id: String,
        attempts: u32,
    },
    /// A dispatched node moved to `state`.
    NodeStateChanged {
        run_id: Uuid,
        node_id: String,
        state: NodeState,
    },
    NodeSkipped {
        run_id: Uuid,
        node_id: String,
        reason: SkipReason,
    },
    NodeFailed {
        run_id: Uuid,
        node_id: String,
        kind: FailureKind,
    },
    LayerCompleted {
        run_id: Uuid,
        index: usize,
    },
    RunCompleted {
        run_id: Uuid,
        status: RunStatus,
    },
}

/// Receives every [`ExecutionEvent`] of the runs it is attached to.
///
/// Called inline from the orchestrator, so implementations must not block.
/// A panicking observer is logged and otherwise ignored.
pub trait ExecutionObserver: Send + Sync {
    fn on_event(&self, event: &ExecutionEvent);
}

/// Fans events out to any number of async subscribers.
pub struct EventBus {
    tx: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: ExecutionEvent) {
        // No receivers is fine.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl ExecutionObserver for EventBus {
    fn on_event(&self, event: &ExecutionEvent) {
        self.publish(event.clone());
    }
}

//! Run outcome types returned by the orchestrator.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use nodes::HandlerOutputs;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::dag::ExecutionLayer;
use crate::snapshot::GraphSnapshot;

/// Final status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
    Cancelled,
}

/// Lifecycle state of a node within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Pending,
    Running,
    /// Waiting between polls of a sensor-style handler.
    Polling,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl NodeState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NodeState::Succeeded | NodeState::Failed | NodeState::Skipped | NodeState::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Fingerprint unchanged since the last snapshot.
    Unaffected,
    /// No incoming edge was traversable this run.
    NotTriggered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Fatal,
    RetryExhausted,
    PollExhausted,
    InvalidInput,
    Panicked,
}

/// Why a node failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeFailure {
    pub kind: FailureKind,
    pub message: String,
    /// Handler invocations made before giving up.
    pub attempts: u32,
}

/// Outcome of a single node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeReport {
    pub state: NodeState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    /// Handler invocations, polls and retries included.
    pub attempts: u32,
    /// Execution id of the last attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Execution ids of earlier attempts, oldest first.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub lineage: Vec<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outputs: Option<HandlerOutputs>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<NodeFailure>,
    /// Custom values recorded on the last attempt's metadata.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub values: HashMap<String, Value>,
}

impl NodeReport {
    pub fn new(state: NodeState) -> Self {
        Self {
            state,
            skip_reason: None,
            attempts: 0,
            execution_id: None,
            correlation_id: None,
            lineage: Vec::new(),
            outputs: None,
            error: None,
            values: HashMap::new(),
        }
    }

    pub fn skipped(reason: SkipReason) -> Self {
        Self {
            skip_reason: Some(reason),
            ..Self::new(NodeState::Skipped)
        }
    }

    /// Whether downstream nodes may be triggered by this node.
    pub fn produced_output(&self) -> bool {
        match self.state {
            NodeState::Succeeded => true,
            NodeState::Skipped => self.skip_reason == Some(SkipReason::Unaffected),
            _ => false,
        }
    }
}

/// Everything a caller needs to know about one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub graph_id: String,
    pub status: RunStatus,
    pub layers: Vec<ExecutionLayer>,
    pub affected: BTreeSet<String>,
    pub nodes: BTreeMap<String, NodeReport>,
    /// Run-wide metrics recorded through the managed context.
    pub metrics: BTreeMap<String, f64>,
    /// Executed nodes that reached a terminal state.
    pub steps: u64,
    #[serde(with = "duration_millis")]
    pub elapsed: Duration,
    /// Snapshot built from this run, if it succeeded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<GraphSnapshot>,
    pub snapshot_persisted: bool,
}

impl RunReport {
    pub fn node(&self, node_id: &str) -> Option<&NodeReport> {
        self.nodes.get(node_id)
    }

    /// Ids of the nodes in `state`, sorted.
    pub fn nodes_in(&self, state: NodeState) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|(_, r)| r.state == state)
            .map(|(id, _)| id.as_str())
            .collect()
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Succeeded
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }
}

//! `engine` crate: graph model, layering, incremental change detection and
//! the orchestrator that runs graphs layer by layer.

pub mod affected;
pub mod dag;
pub mod error;
pub mod events;
pub mod fingerprint;
pub mod models;
pub mod orchestrator;
pub mod registry;
pub mod report;
pub mod schedule;
pub mod snapshot;

pub use affected::{AffectedNodeDetector, AffectedNodes};
pub use dag::{execution_layers, validate_dag, ExecutionLayer, GraphIndex};
pub use error::{EngineError, SnapshotError};
pub use events::{EventBus, ExecutionEvent, ExecutionObserver};
pub use fingerprint::FingerprintCalculator;
pub use models::{Edge, Graph, Node, NodeInputs, NodeType};
pub use orchestrator::{Orchestrator, OrchestratorConfig, RunRequest};
pub use registry::HandlerRegistry;
pub use report::{FailureKind, NodeFailure, NodeReport, NodeState, RunReport, RunStatus, SkipReason};
pub use schedule::{CompiledSchedule, EdgeCondition, FnCondition, ScheduleConstraint};
pub use snapshot::{GraphSnapshot, InMemorySnapshotStore, JsonFileSnapshotStore, SnapshotStore};

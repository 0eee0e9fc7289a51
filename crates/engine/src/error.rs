//! Engine-level error types.
//!
//! Only structural problems are `EngineError`s; they abort a run before any
//! node executes. Problems inside a single node are recorded in that node's
//! [`NodeReport`](crate::report::NodeReport) instead.

use thiserror::Error;

/// Errors produced by the engine (validation, planning, snapshot access).
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Validation errors ------

    /// Two or more nodes share the same ID.
    #[error("duplicate node ID: '{0}'")]
    DuplicateNodeId(String),

    /// An edge references a node ID that doesn't exist in the graph.
    #[error("edge references unknown node '{node_id}' ({side} side)")]
    UnknownNodeReference {
        node_id: String,
        side: &'static str,
    },

    /// A task node does not name a handler.
    #[error("task node '{0}' has no handler")]
    MissingHandler(String),

    /// Layering detected a cycle; `node_id` lies on it.
    #[error("graph contains a cycle through node '{node_id}'")]
    CyclicGraph { node_id: String },

    /// An edge's schedule constraint could not be compiled.
    #[error("invalid schedule on edge '{from}' -> '{to}': {message}")]
    InvalidSchedule {
        from: String,
        to: String,
        message: String,
    },

    // ------ Planning errors ------

    /// A node names a handler that is not in the registry.
    #[error("no handler registered as '{handler}' (node '{node_id}')")]
    UnknownHandler { node_id: String, handler: String },

    /// Snapshot store failure surfaced from an explicit store call.
    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
}

/// Errors produced by a [`SnapshotStore`](crate::snapshot::SnapshotStore).
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The store cannot serve snapshots at the moment.
    #[error("snapshot unavailable: {0}")]
    Unavailable(String),
}

//! Node-level error types.

use thiserror::Error;

/// Errors produced while reading or writing a [`HandlerInputs`] bag.
///
/// [`HandlerInputs`]: crate::HandlerInputs
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InputError {
    /// Input names must be non-empty and not only whitespace.
    #[error("input name must not be blank")]
    InvalidName,

    /// No value is stored under the requested name.
    #[error("missing input '{0}'")]
    MissingInput(String),

    /// A value exists but cannot be read as the requested type.
    #[error("input '{name}' holds {found}, expected {expected}")]
    TypeMismatch {
        name: String,
        expected: &'static str,
        found: &'static str,
    },

    /// The stored value is null and the requested type cannot represent null.
    #[error("input '{0}' is null but {1} does not accept null")]
    NullNotAllowed(String, &'static str),

    /// A typed output struct did not serialize to a JSON object.
    #[error("value of type {0} does not serialize to an object")]
    NotAnObject(&'static str),

    /// A value could not be converted to or from JSON.
    #[error("serialization failed: {0}")]
    Serialization(String),
}

/// Errors returned by a handler's `execute` method.
///
/// The orchestrator uses the variant to decide retry behaviour:
/// - `Retryable`: the node is re-run with exponential back-off.
/// - `Fatal`: the node is immediately marked as failed.
/// - `Input`: the node's inputs were unusable; never retried.
#[derive(Debug, Error, Clone)]
pub enum NodeError {
    /// Transient failure; the orchestrator should re-try the node.
    #[error("retryable node error: {0}")]
    Retryable(String),

    /// Permanent failure; no retry should be attempted.
    #[error("fatal node error: {0}")]
    Fatal(String),

    /// The handler could not read its inputs.
    #[error("input error: {0}")]
    Input(#[from] InputError),
}

/// Errors produced by [`ManagedContext`](crate::ManagedContext) mutations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContextError {
    #[error("metric name must not be blank")]
    BlankName,
}

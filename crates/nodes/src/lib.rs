//! `nodes` crate: the `NodeHandler` contract and everything a handler sees.
//!
//! Every handler, built-in or host-provided, must implement
//! [`NodeHandler`] (directly, or through [`TypedHandler`] + [`Typed`]). The
//! engine crate dispatches execution through this trait object.

pub mod builtin;
pub mod context;
pub mod error;
pub mod inputs;
pub mod metadata;
pub mod mock;
pub mod traits;

pub use context::ManagedContext;
pub use error::{ContextError, InputError, NodeError};
pub use inputs::{HandlerInputs, HandlerOutputs};
pub use metadata::{NodeExecutionMetadata, MAX_LINEAGE};
pub use traits::{NodeContext, NodeHandler, NodeOutcome, RetryPolicy, Typed, TypedHandler};

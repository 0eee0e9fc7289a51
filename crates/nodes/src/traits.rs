//! The `NodeHandler` trait: the contract every node must fulfil.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::{HandlerInputs, HandlerOutputs, ManagedContext, NodeError, NodeExecutionMetadata};

/// Context passed to a handler for one execution attempt.
///
/// Defined here (in the nodes crate) so both the engine and individual
/// handler implementations can import it without a circular dependency.
#[derive(Debug, Clone)]
pub struct NodeContext {
    /// ID of the node being executed.
    pub node_id: String,
    /// ID of the graph the node belongs to.
    pub graph_id: String,
    /// ID of the current run.
    pub run_id: uuid::Uuid,
    /// Run-wide progress and metrics, shared with sibling nodes.
    pub run: Arc<ManagedContext>,
    /// Metadata of this attempt.
    pub metadata: Arc<NodeExecutionMetadata>,
    cancellation: CancellationToken,
}

impl NodeContext {
    pub fn new(
        node_id: impl Into<String>,
        graph_id: impl Into<String>,
        run_id: uuid::Uuid,
        run: Arc<ManagedContext>,
        metadata: Arc<NodeExecutionMetadata>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            graph_id: graph_id.into(),
            run_id,
            run,
            metadata,
            cancellation,
        }
    }

    /// Returns `true` once the run has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Token to `select!` on inside long-running handlers.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }
}

/// What a handler produced for one attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOutcome {
    /// The node finished; its outputs feed downstream nodes.
    Completed(HandlerOutputs),
    /// A sensor-style node whose condition is not met yet. The orchestrator
    /// polls it again after `retry_after` (or its configured poll interval).
    Pending { retry_after: Option<Duration> },
}

impl NodeOutcome {
    pub fn pending() -> Self {
        NodeOutcome::Pending { retry_after: None }
    }
}

/// Exponential back-off settings for `NodeError::Retryable` failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of times a retryable failure will be retried.
    pub max_retries: u32,
    /// Delay before the first retry; doubled for every further retry.
    pub base_delay: Duration,
    /// Upper bound for a single back-off delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Back-off before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// The core handler trait.
///
/// Handlers are registered by name and invoked by the orchestrator for every
/// node whose `handler` field names them.
#[async_trait]
pub trait NodeHandler: Send + Sync {
    /// Execute one attempt. `inputs` holds the node's static inputs, run
    /// inputs (for entry nodes) and the outputs of its upstream nodes.
    async fn execute(
        &self,
        inputs: &HandlerInputs,
        ctx: &NodeContext,
    ) -> Result<NodeOutcome, NodeError>;

    /// Per-handler retry policy; `None` uses the orchestrator's default.
    fn retry_policy(&self) -> Option<RetryPolicy> {
        None
    }
}

/// A handler with a typed input struct and a typed output struct.
///
/// Wrap it in [`Typed`] to register it; the adapter binds the input bag to
/// `Input` and flattens `Output` back into named outputs.
#[async_trait]
pub trait TypedHandler: Send + Sync {
    type Input: DeserializeOwned + Send;
    type Output: Serialize + Send;

    /// Return `Ok(None)` while a sensor condition is still unmet.
    async fn run(
        &self,
        input: Self::Input,
        ctx: &NodeContext,
    ) -> Result<Option<Self::Output>, NodeError>;

    fn retry_policy(&self) -> Option<RetryPolicy> {
        None
    }
}

/// Adapter turning a [`TypedHandler`] into a [`NodeHandler`].
pub struct Typed<H>(pub H);

#[async_trait]
impl<H: TypedHandler> NodeHandler for Typed<H> {
    async fn execute(
        &self,
        inputs: &HandlerInputs,
        ctx: &NodeContext,
    ) -> Result<NodeOutcome, NodeError> {
        let input: H::Input = inputs.bind()?;
        match self.0.run(input, ctx).await? {
            Some(output) => Ok(NodeOutcome::Completed(HandlerOutputs::from_struct(&output)?)),
            None => Ok(NodeOutcome::pending()),
        }
    }

    fn retry_policy(&self) -> Option<RetryPolicy> {
        self.0.retry_policy()
    }
}

//! Built-in handlers.

use async_trait::async_trait;
use tracing::debug;

use crate::{HandlerInputs, NodeContext, NodeError, NodeHandler, NodeOutcome};

/// Registry name of [`EchoHandler`].
pub const ECHO: &str = "echo";

/// Passes its inputs through unchanged as outputs.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoHandler;

#[async_trait]
impl NodeHandler for EchoHandler {
    async fn execute(
        &self,
        inputs: &HandlerInputs,
        ctx: &NodeContext,
    ) -> Result<NodeOutcome, NodeError> {
        debug!(node_id = %ctx.node_id, entries = inputs.len(), "echo");
        Ok(NodeOutcome::Completed(inputs.clone()))
    }
}

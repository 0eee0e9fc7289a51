//! `MockHandler`: a test double for `NodeHandler`.
//!
//! Useful in unit and integration tests where a real handler is either
//! unavailable or irrelevant.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::{
    HandlerInputs, HandlerOutputs, NodeContext, NodeError, NodeHandler, NodeOutcome, RetryPolicy,
};

/// Behaviour injected into `MockHandler` at construction time.
#[derive(Debug, Clone)]
pub enum MockBehaviour {
    /// Return the entries of a JSON object as outputs.
    ReturnValue(Value),
    /// Fail with a `Retryable` error on every call.
    FailRetryable(String),
    /// Fail with a `Fatal` error on every call.
    FailFatal(String),
    /// Fail with a `Retryable` error `failures` times, then return `value`.
    Flaky { failures: usize, value: Value },
    /// Report `Pending` `polls` times, then return `value`.
    Sensor { polls: usize, value: Value },
    /// Sleep for `delay` (honouring cancellation), then return `value`.
    Slow { delay: Duration, value: Value },
    /// Panic inside the handler.
    Panic(String),
}

/// One recorded invocation.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub inputs: HandlerInputs,
    pub attempt: u32,
    pub correlation_id: Option<String>,
    pub parent_execution_ids: Vec<uuid::Uuid>,
}

/// A mock handler that records every call it receives and returns a
/// programmer-specified result.
pub struct MockHandler {
    /// Label used in test assertions; also emitted as the `node` output.
    pub name: String,
    /// What the handler will do when `execute` is called.
    pub behaviour: MockBehaviour,
    /// All calls seen by this handler (in call order).
    pub calls: Arc<Mutex<Vec<MockCall>>>,
    retry_policy: Option<RetryPolicy>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl MockHandler {
    pub fn new(name: impl Into<String>, behaviour: MockBehaviour) -> Self {
        Self {
            name: name.into(),
            behaviour,
            calls: Arc::new(Mutex::new(Vec::new())),
            retry_policy: None,
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Create a mock that always succeeds with the given value.
    pub fn returning(name: impl Into<String>, value: Value) -> Self {
        Self::new(name, MockBehaviour::ReturnValue(value))
    }

    /// Create a mock that always fails with a `Fatal` error.
    pub fn failing_fatal(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::new(name, MockBehaviour::FailFatal(msg.into()))
    }

    /// Create a mock that always fails with a `Retryable` error.
    pub fn failing_retryable(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::new(name, MockBehaviour::FailRetryable(msg.into()))
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Number of times this handler has been executed.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Highest number of concurrent `execute` calls observed.
    pub fn peak_concurrency(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn outputs(&self, value: &Value) -> HandlerOutputs {
        // Merge the node's own name with the configured value so tests can
        // trace the data flowing through the graph.
        let mut out = HandlerOutputs::new();
        let _ = out.insert("node", self.name.as_str());
        if let Some(object) = value.as_object() {
            for (k, v) in object {
                let _ = out.insert(k.as_str(), v.clone());
            }
        }
        out
    }

    async fn respond(&self, call_index: usize, ctx: &NodeContext) -> Result<NodeOutcome, NodeError> {
        match &self.behaviour {
            MockBehaviour::ReturnValue(v) => Ok(NodeOutcome::Completed(self.outputs(v))),
            MockBehaviour::FailRetryable(msg) => Err(NodeError::Retryable(msg.clone())),
            MockBehaviour::FailFatal(msg) => Err(NodeError::Fatal(msg.clone())),
            MockBehaviour::Flaky { failures, value } => {
                if call_index < *failures {
                    Err(NodeError::Retryable(format!("flaky failure {}", call_index + 1)))
                } else {
                    Ok(NodeOutcome::Completed(self.outputs(value)))
                }
            }
            MockBehaviour::Sensor { polls, value } => {
                if call_index < *polls {
                    Ok(NodeOutcome::pending())
                } else {
                    Ok(NodeOutcome::Completed(self.outputs(value)))
                }
            }
            MockBehaviour::Slow { delay, value } => {
                tokio::select! {
                    _ = tokio::time::sleep(*delay) => Ok(NodeOutcome::Completed(self.outputs(value))),
                    _ = ctx.cancellation().cancelled() => Err(NodeError::Fatal("cancelled".into())),
                }
            }
            MockBehaviour::Panic(msg) => panic!("{msg}"),
        }
    }
}

#[async_trait]
impl NodeHandler for MockHandler {
    async fn execute(
        &self,
        inputs: &HandlerInputs,
        ctx: &NodeContext,
    ) -> Result<NodeOutcome, NodeError> {
        let call_index = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(MockCall {
                inputs: inputs.clone(),
                attempt: ctx.metadata.attempt,
                correlation_id: ctx.metadata.correlation_id.clone(),
                parent_execution_ids: ctx.metadata.parent_execution_ids(),
            });
            calls.len() - 1
        };

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let result = self.respond(call_index, ctx).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn retry_policy(&self) -> Option<RetryPolicy> {
        self.retry_policy.clone()
    }
}

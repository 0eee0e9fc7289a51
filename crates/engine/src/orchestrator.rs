//! Graph execution engine.
//!
//! `Orchestrator` is the central coordinator of a run:
//! 1. Validates and layers the graph, compiles edge schedules and resolves
//!    every task handler. Any problem here aborts the run before a node runs.
//! 2. Loads the previous snapshot and computes the affected set.
//! 3. Walks the layers in order. Within a layer, affected and triggered task
//!    nodes run concurrently on a `JoinSet`; the set is drained before the
//!    next layer starts.
//! 4. Handles `NodeOutcome::Pending` (poll again later),
//!    `NodeError::Retryable` (exponential back-off) and everything else
//!    (node failure).
//! 5. Saves a fresh snapshot when the whole run succeeded.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use nodes::{
    HandlerInputs, HandlerOutputs, ManagedContext, NodeContext, NodeError, NodeExecutionMetadata,
    NodeHandler, NodeOutcome, RetryPolicy,
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};
use uuid::Uuid;

use crate::affected::{AffectedNodeDetector, AffectedNodes};
use crate::dag::{self, GraphIndex};
use crate::events::{ExecutionEvent, ExecutionObserver};
use crate::models::{Graph, Node};
use crate::registry::HandlerRegistry;
use crate::report::{FailureKind, NodeFailure, NodeReport, NodeState, RunReport, RunStatus, SkipReason};
use crate::schedule::CompiledSchedule;
use crate::snapshot::{GraphSnapshot, SnapshotStore};
use crate::EngineError;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tuning knobs for the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Used for handlers that do not bring their own policy.
    pub retry: RetryPolicy,
    /// Wait between polls when a handler does not ask for a specific delay.
    pub poll_interval: Duration,
    /// `Pending` outcomes tolerated before a node fails.
    pub max_poll_attempts: u32,
    /// Upper bound on nodes executing at once; `None` runs a whole layer
    /// concurrently.
    pub max_parallelism: Option<usize>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            poll_interval: Duration::from_secs(1),
            max_poll_attempts: 60,
            max_parallelism: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Run request
// ---------------------------------------------------------------------------

/// Per-run parameters.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    /// Delivered to entry nodes.
    pub inputs: HandlerInputs,
    /// Outputs of earlier runs, handed downstream when a node is skipped as
    /// unaffected.
    pub retained_outputs: HashMap<String, HandlerOutputs>,
    pub cancellation: CancellationToken,
    /// Pins the instant at which edge schedules are evaluated. When unset,
    /// each edge is evaluated against the clock at the moment it is
    /// traversed.
    pub now: Option<DateTime<Utc>>,
}

impl RunRequest {
    pub fn new(inputs: HandlerInputs) -> Self {
        Self {
            inputs,
            ..Self::default()
        }
    }

    pub fn with_retained_outputs(mut self, outputs: HashMap<String, HandlerOutputs>) -> Self {
        self.retained_outputs = outputs;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = Some(now);
        self
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Runs graphs against a handler registry and a snapshot store.
///
/// Holds no per-run state; one instance can serve many runs, including
/// concurrent runs of different graphs.
pub struct Orchestrator {
    registry: HandlerRegistry,
    store: Arc<dyn SnapshotStore>,
    config: OrchestratorConfig,
    detector: AffectedNodeDetector,
    observers: Vec<Arc<dyn ExecutionObserver>>,
}

impl Orchestrator {
    pub fn new(registry: HandlerRegistry, store: Arc<dyn SnapshotStore>, config: OrchestratorConfig) -> Self {
        Self {
            registry,
            store,
            config,
            detector: AffectedNodeDetector::default(),
            observers: Vec::new(),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn ExecutionObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Which nodes a run with `inputs` would execute, without executing any.
    ///
    /// Unlike [`run`](Self::run), a failing snapshot store is an error here.
    pub async fn plan(&self, graph: &Graph, inputs: &HandlerInputs) -> Result<AffectedNodes, EngineError> {
        let previous = self.store.load(&graph.id).await?;
        self.detector
            .detect(previous.as_ref(), graph, &graph.resolve_inputs(inputs))
    }

    /// Execute `graph` once.
    ///
    /// # Errors
    /// Returns `EngineError` only for structural problems (invalid graph,
    /// bad schedule, unknown handler); per-node failures are reported in the
    /// returned [`RunReport`].
    #[instrument(skip(self, graph, request), fields(graph_id = %graph.id))]
    pub async fn run(&self, graph: &Graph, request: RunRequest) -> Result<RunReport, EngineError> {
        // ------------------------------------------------------------------
        // Validate, layer and resolve everything up front.
        // ------------------------------------------------------------------
        dag::check_structure(graph)?;
        let index = GraphIndex::new(graph);
        let layers = dag::layers_from_index(graph, &index)?;
        let schedules = compile_schedules(graph)?;
        let handlers = self.registry.resolve(graph)?;

        // ------------------------------------------------------------------
        // Decide what must run.
        // ------------------------------------------------------------------
        let previous = match self.store.load(&graph.id).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "snapshot unavailable, executing every node");
                None
            }
        };
        let static_inputs = graph.resolve_inputs(&request.inputs);
        let detection = self
            .detector
            .detect_with(previous.as_ref(), graph, &index, &layers, &static_inputs);

        let run_id = Uuid::new_v4();
        let run_ctx = Arc::new(ManagedContext::new());
        run_ctx.set_estimated_total_steps(detection.affected.len() as u64);
        let cancel = request.cancellation.clone();
        let semaphore = self
            .config
            .max_parallelism
            .map(|limit| Arc::new(Semaphore::new(limit.max(1))));

        let node_by_id: HashMap<&str, &Node> = graph.nodes.iter().map(|n| (n.id.as_str(), n)).collect();
        let mut reports: BTreeMap<String, NodeReport> = graph
            .nodes
            .iter()
            .map(|n| (n.id.clone(), NodeReport::new(NodeState::Pending)))
            .collect();
        let mut outputs: HashMap<String, HandlerOutputs> = HashMap::new();
        let last_active_layer = layers
            .iter()
            .rposition(|l| l.nodes.iter().any(|id| detection.is_affected(id)));
        let mut status = RunStatus::Succeeded;

        info!(
            %run_id,
            layers = layers.len(),
            affected = detection.affected.len(),
            "run started"
        );
        notify(
            &self.observers,
            ExecutionEvent::RunStarted {
                run_id,
                graph_id: graph.id.clone(),
                affected: detection.affected.len(),
            },
        );

        // ------------------------------------------------------------------
        // Execute layer by layer.
        // ------------------------------------------------------------------
        for (position, layer) in layers.iter().enumerate() {
            if cancel.is_cancelled() {
                status = RunStatus::Cancelled;
                break;
            }
            notify(&self.observers, ExecutionEvent::LayerStarted { run_id, index: layer.index });
            if Some(position) == last_active_layer {
                run_ctx.set_is_last_node(true);
            }

            let mut join_set = JoinSet::new();
            let mut dispatched: Vec<&str> = Vec::new();

            for node_id in &layer.nodes {
                let now = request.now.unwrap_or_else(Utc::now);
                let sources = triggering_sources(graph, &index, &schedules, &reports, node_id, now, &cancel).await;
                if cancel.is_cancelled() {
                    break;
                }
                let Some(sources) = sources else {
                    debug!(node_id = %node_id, "no traversable incoming edge");
                    self.skip(&mut reports, run_id, node_id, SkipReason::NotTriggered);
                    continue;
                };

                let is_structural = node_by_id.get(node_id.as_str()).map_or(false, |n| n.is_structural());
                if is_structural {
                    set_report(&mut reports, node_id, NodeReport::new(NodeState::Succeeded));
                    continue;
                }

                if !detection.is_affected(node_id) {
                    let mut report = NodeReport::skipped(SkipReason::Unaffected);
                    if let Some(retained) = request.retained_outputs.get(node_id) {
                        outputs.insert(node_id.clone(), retained.clone());
                        report.outputs = Some(retained.clone());
                    }
                    debug!(node_id = %node_id, "unaffected, skipping");
                    set_report(&mut reports, node_id, report);
                    notify(
                        &self.observers,
                        ExecutionEvent::NodeSkipped {
                            run_id,
                            node_id: node_id.clone(),
                            reason: SkipReason::Unaffected,
                        },
                    );
                    continue;
                }

                let Some(handler) = handlers.get(node_id).cloned() else {
                    // resolve() covered every task node
                    continue;
                };

                // Static and run inputs first, then upstream outputs in
                // predecessor-id order; later entries win on a name clash.
                let mut inputs = static_inputs.get(node_id).cloned().unwrap_or_default();
                for source in &sources {
                    if let Some(upstream) = outputs.get(source) {
                        inputs.merge(upstream);
                    }
                }

                let retry = handler
                    .retry_policy()
                    .unwrap_or_else(|| self.config.retry.clone());
                let task = NodeTask {
                    node_id: node_id.clone(),
                    graph_id: graph.id.clone(),
                    run_id,
                    handler,
                    inputs,
                    run: run_ctx.clone(),
                    cancel: cancel.clone(),
                    retry,
                    poll_interval: self.config.poll_interval,
                    max_poll_attempts: self.config.max_poll_attempts,
                    semaphore: semaphore.clone(),
                    observers: self.observers.clone(),
                };
                set_report(&mut reports, node_id, NodeReport::new(NodeState::Running));
                dispatched.push(node_id.as_str());
                let span = info_span!("node", node_id = %node_id);
                join_set.spawn(task.execute().instrument(span));
            }

            // --------------------------------------------------------------
            // Layer barrier.
            // --------------------------------------------------------------
            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok((node_id, report)) => {
                        if let (NodeState::Succeeded, Some(out)) = (report.state, &report.outputs) {
                            outputs.insert(node_id.clone(), out.clone());
                        }
                        reports.insert(node_id, report);
                    }
                    Err(e) => error!(error = %e, "node task aborted"),
                }
            }
            for node_id in dispatched {
                if let Some(report) = reports.get_mut(node_id) {
                    if !report.state.is_terminal() {
                        report.state = NodeState::Failed;
                        report.error = Some(NodeFailure {
                            kind: FailureKind::Panicked,
                            message: "node task ended without a result".into(),
                            attempts: report.attempts,
                        });
                    }
                }
            }

            notify(&self.observers, ExecutionEvent::LayerCompleted { run_id, index: layer.index });

            if cancel.is_cancelled() || layer.nodes.iter().any(|id| state_of(&reports, id) == NodeState::Cancelled) {
                status = RunStatus::Cancelled;
                break;
            }
            if layer.nodes.iter().any(|id| state_of(&reports, id) == NodeState::Failed) {
                status = RunStatus::Failed;
                warn!(layer = layer.index, "node failure, stopping after this layer");
                break;
            }
        }

        if status == RunStatus::Cancelled {
            for report in reports.values_mut().filter(|r| r.state == NodeState::Pending) {
                report.state = NodeState::Cancelled;
            }
        }

        // ------------------------------------------------------------------
        // Persist the new snapshot.
        // ------------------------------------------------------------------
        let (snapshot, snapshot_persisted) = if status == RunStatus::Succeeded {
            let fingerprints = detection
                .fingerprints
                .iter()
                .filter(|(id, _)| reports.get(*id).map_or(false, NodeReport::produced_output))
                .map(|(id, fp)| (id.clone(), fp.clone()))
                .collect();
            let snapshot = GraphSnapshot::new(detection.graph_hash.clone(), fingerprints);
            let persisted = match self.store.save(&graph.id, &snapshot).await {
                Ok(()) => true,
                Err(e) => {
                    error!(error = %e, "failed to save snapshot");
                    false
                }
            };
            (Some(snapshot), persisted)
        } else {
            (None, false)
        };

        let report = RunReport {
            run_id,
            graph_id: graph.id.clone(),
            status,
            layers,
            affected: detection.affected,
            nodes: reports,
            metrics: run_ctx.metrics().into_iter().collect(),
            steps: run_ctx.current_step(),
            elapsed: run_ctx.elapsed(),
            snapshot,
            snapshot_persisted,
        };

        info!(%run_id, status = ?report.status, steps = report.steps, "run finished");
        notify(&self.observers, ExecutionEvent::RunCompleted { run_id, status });
        Ok(report)
    }

    fn skip(&self, reports: &mut BTreeMap<String, NodeReport>, run_id: Uuid, node_id: &str, reason: SkipReason) {
        set_report(reports, node_id, NodeReport::skipped(reason));
        notify(
            &self.observers,
            ExecutionEvent::NodeSkipped {
                run_id,
                node_id: node_id.to_owned(),
                reason,
            },
        );
    }
}

fn compile_schedules(graph: &Graph) -> Result<HashMap<usize, CompiledSchedule>, EngineError> {
    let mut compiled = HashMap::new();
    for (i, edge) in graph.edges.iter().enumerate() {
        if let Some(schedule) = &edge.schedule {
            compiled.insert(i, schedule.compile(&edge.from, &edge.to)?);
        }
    }
    Ok(compiled)
}

/// Predecessors whose edges trigger `node_id`, sorted. `None` when the node
/// has incoming edges but none of them can be traversed, or when the run is
/// cancelled while a schedule is being evaluated; `Some(empty)` when it has
/// no incoming edges at all.
async fn triggering_sources(
    graph: &Graph,
    index: &GraphIndex,
    schedules: &HashMap<usize, CompiledSchedule>,
    reports: &BTreeMap<String, NodeReport>,
    node_id: &str,
    now: DateTime<Utc>,
    cancel: &CancellationToken,
) -> Option<Vec<String>> {
    let incoming = index.incoming_edges(node_id);
    if incoming.is_empty() {
        return Some(Vec::new());
    }

    let mut sources = BTreeSet::new();
    for &i in incoming {
        let edge = &graph.edges[i];
        if !reports.get(&edge.from).map_or(false, NodeReport::produced_output) {
            continue;
        }
        if let Some(schedule) = schedules.get(&i) {
            let open = tokio::select! {
                open = schedule.can_traverse(edge, now) => open,
                _ = cancel.cancelled() => return None,
            };
            if !open {
                debug!(from = %edge.from, to = %edge.to, "schedule closed");
                continue;
            }
        }
        sources.insert(edge.from.clone());
    }

    if sources.is_empty() {
        None
    } else {
        Some(sources.into_iter().collect())
    }
}

fn set_report(reports: &mut BTreeMap<String, NodeReport>, node_id: &str, report: NodeReport) {
    reports.insert(node_id.to_owned(), report);
}

fn state_of(reports: &BTreeMap<String, NodeReport>, node_id: &str) -> NodeState {
    reports.get(node_id).map_or(NodeState::Pending, |r| r.state)
}

/// Deliver `event` to every observer; a panicking observer is logged and
/// skipped.
fn notify(observers: &[Arc<dyn ExecutionObserver>], event: ExecutionEvent) {
    for observer in observers {
        let delivered = std::panic::catch_unwind(AssertUnwindSafe(|| observer.on_event(&event)));
        if delivered.is_err() {
            warn!(?event, "execution observer panicked");
        }
    }
}

// ---------------------------------------------------------------------------
// Single node execution
// ---------------------------------------------------------------------------

/// Everything one node needs to run to completion on its own task.
struct NodeTask {
    node_id: String,
    graph_id: String,
    run_id: Uuid,
    handler: Arc<dyn NodeHandler>,
    inputs: HandlerInputs,
    run: Arc<ManagedContext>,
    cancel: CancellationToken,
    retry: RetryPolicy,
    poll_interval: Duration,
    max_poll_attempts: u32,
    semaphore: Option<Arc<Semaphore>>,
    observers: Vec<Arc<dyn ExecutionObserver>>,
}

/// Result of one handler invocation.
enum Invocation {
    Finished(Result<NodeOutcome, NodeError>),
    Panicked(String),
    Cancelled,
}

/// How the attempt loop ended.
enum Terminal {
    Succeeded(HandlerOutputs),
    Failed(FailureKind, String),
    Cancelled,
}

impl NodeTask {
    async fn execute(self) -> (String, NodeReport) {
        let mut permit = None;
        if !self.acquire(&mut permit).await {
            self.transition(NodeState::Cancelled);
            return (self.node_id.clone(), NodeReport::new(NodeState::Cancelled));
        }

        let correlation_id = format!("{}:{}", self.run_id, self.node_id);
        let mut metadata = Arc::new(NodeExecutionMetadata::new("affected").with_correlation_id(correlation_id));
        let mut retries = 0u32;
        let mut polls = 0u32;

        let terminal = loop {
            let attempt = metadata.attempt;
            self.transition(NodeState::Running);
            self.emit(ExecutionEvent::NodeStarted {
                run_id: self.run_id,
                node_id: self.node_id.clone(),
                attempt,
            });
            debug!(attempt, "invoking handler");

            let ctx = NodeContext::new(
                self.node_id.clone(),
                self.graph_id.clone(),
                self.run_id,
                self.run.clone(),
                metadata.clone(),
                self.cancel.clone(),
            );
            let started = tokio::time::Instant::now();
            let invocation = self.invoke(ctx).await;
            metadata.record_metric("duration_ms", started.elapsed().as_secs_f64() * 1000.0);

            match invocation {
                Invocation::Finished(Ok(NodeOutcome::Completed(out))) => break Terminal::Succeeded(out),

                Invocation::Finished(Ok(NodeOutcome::Pending { retry_after })) => {
                    polls += 1;
                    let _ = self.run.increment_metric("node.polls", 1.0);
                    if polls > self.max_poll_attempts {
                        break Terminal::Failed(
                            FailureKind::PollExhausted,
                            format!("still pending after {} polls", self.max_poll_attempts),
                        );
                    }
                    self.transition(NodeState::Polling);
                    self.emit(ExecutionEvent::NodePolling {
                        run_id: self.run_id,
                        node_id: self.node_id.clone(),
                        attempt,
                    });
                    let delay = retry_after.unwrap_or(self.poll_interval);
                    debug!(attempt, ?delay, "pending, polling again");
                    if !self.pause(delay, &mut permit).await {
                        break Terminal::Cancelled;
                    }
                    metadata = Arc::new(metadata.next_attempt("poll"));
                }

                Invocation::Finished(Err(NodeError::Retryable(msg))) => {
                    retries += 1;
                    if retries > self.retry.max_retries {
                        break Terminal::Failed(FailureKind::RetryExhausted, msg);
                    }
                    let _ = self.run.increment_metric("node.retries", 1.0);
                    let delay = self.retry.delay_for(retries);
                    warn!(
                        attempt,
                        retry = retries,
                        max_retries = self.retry.max_retries,
                        ?delay,
                        error = %msg,
                        "retryable error"
                    );
                    self.emit(ExecutionEvent::NodeRetrying {
                        run_id: self.run_id,
                        node_id: self.node_id.clone(),
                        attempt,
                        error: msg,
                    });
                    if !self.pause(delay, &mut permit).await {
                        break Terminal::Cancelled;
                    }
                    metadata = Arc::new(metadata.next_attempt("retry"));
                }

                Invocation::Finished(Err(NodeError::Fatal(_))) if self.cancel.is_cancelled() => {
                    break Terminal::Cancelled;
                }
                Invocation::Finished(Err(NodeError::Fatal(msg))) => break Terminal::Failed(FailureKind::Fatal, msg),
                Invocation::Finished(Err(NodeError::Input(e))) => {
                    break Terminal::Failed(FailureKind::InvalidInput, e.to_string());
                }
                Invocation::Panicked(msg) => break Terminal::Failed(FailureKind::Panicked, msg),
                Invocation::Cancelled => break Terminal::Cancelled,
            }
        };

        drop(permit);
        let report = self.finish(terminal, &metadata);
        self.transition(report.state);
        (self.node_id, report)
    }

    /// Run the handler on its own task so a panic is contained.
    async fn invoke(&self, ctx: NodeContext) -> Invocation {
        let handler = self.handler.clone();
        let inputs = self.inputs.clone();
        let mut handle = tokio::spawn(async move { handler.execute(&inputs, &ctx).await });

        tokio::select! {
            joined = &mut handle => match joined {
                Ok(result) => Invocation::Finished(result),
                Err(e) if e.is_panic() => Invocation::Panicked(panic_message(e.into_panic())),
                Err(e) => Invocation::Panicked(e.to_string()),
            },
            _ = self.cancel.cancelled() => {
                handle.abort();
                Invocation::Cancelled
            }
        }
    }

    /// Wait for a concurrency slot; `false` if the run was cancelled first.
    async fn acquire(&self, permit: &mut Option<OwnedSemaphorePermit>) -> bool {
        let Some(semaphore) = &self.semaphore else {
            return true;
        };
        tokio::select! {
            acquired = semaphore.clone().acquire_owned() => {
                *permit = acquired.ok();
                true
            }
            _ = self.cancel.cancelled() => false,
        }
    }

    /// Sleep for `delay` without holding a concurrency slot; `false` if the
    /// run was cancelled meanwhile.
    async fn pause(&self, delay: Duration, permit: &mut Option<OwnedSemaphorePermit>) -> bool {
        permit.take();
        let slept = tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = self.cancel.cancelled() => false,
        };
        slept && self.acquire(permit).await
    }

    fn finish(&self, terminal: Terminal, metadata: &NodeExecutionMetadata) -> NodeReport {
        let attempts = metadata.attempt + 1;
        let mut report = NodeReport {
            attempts,
            execution_id: Some(metadata.execution_id),
            correlation_id: metadata.correlation_id.clone(),
            lineage: metadata.parent_execution_ids(),
            values: metadata.values(),
            ..NodeReport::new(NodeState::Running)
        };

        match terminal {
            Terminal::Succeeded(out) => {
                info!(attempts, "node succeeded");
                let _ = self.run.increment_metric("nodes.succeeded", 1.0);
                report.state = NodeState::Succeeded;
                report.outputs = Some(out);
                self.emit(ExecutionEvent::NodeCompleted {
                    run_id: self.run_id,
                    node_id: self.node_id.clone(),
                    attempts,
                });
            }
            Terminal::Failed(kind, message) => {
                error!(attempts, ?kind, error = %message, "node failed");
                let _ = self.run.increment_metric("nodes.failed", 1.0);
                report.state = NodeState::Failed;
                report.error = Some(NodeFailure { kind, message, attempts });
                self.emit(ExecutionEvent::NodeFailed {
                    run_id: self.run_id,
                    node_id: self.node_id.clone(),
                    kind,
                });
            }
            Terminal::Cancelled => {
                info!(attempts, "node cancelled");
                report.state = NodeState::Cancelled;
            }
        }

        self.run.increment_step();
        report
    }

    fn emit(&self, event: ExecutionEvent) {
        notify(&self.observers, event);
    }

    fn transition(&self, state: NodeState) {
        self.emit(ExecutionEvent::NodeStateChanged {
            run_id: self.run_id,
            node_id: self.node_id.clone(),
            state,
        });
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_owned()
    }
}

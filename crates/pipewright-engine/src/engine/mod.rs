//! The run engine: walks a pipeline graph for one run, dispatching each
//! ready node to its executor and folding results into the run record.

mod frontier;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use pipewright_core::catalog;
use pipewright_core::config::EngineConfig;
use pipewright_core::error::{PipelineError, Result};
use pipewright_core::event::{EventBus, PipelineEvent};
use pipewright_core::node::{LoopStep, NodeConfig, NodeState, NodeStatus, PipelineNode};
use pipewright_core::pipeline::{Pipeline, PipelineEdge, LOOP_BODY_HANDLE};
use pipewright_core::run::{
    NodeExecutionResult, NodeRunResult, PipelineRun, ResultStatus, RunReport, RunStatus,
    TriggerDescriptor,
};
use pipewright_core::traits::{EventSink, RunLog};

use crate::context::{Capabilities, ExecutionContext, ExecutorSettings};
use crate::registry::{execute_guarded, ExecutorRegistry};
use frontier::Frontier;

/// Output handle a loop node reports once it has finished iterating.
pub const LOOP_DONE_HANDLE: &str = "done";

/// Executes pipeline runs.
///
/// Traversal is sequential and depth-first: one node at a time, ready
/// successors served in edge declaration order.
pub struct RunEngine {
    registry: Arc<ExecutorRegistry>,
    capabilities: Capabilities,
    events: Arc<dyn EventSink>,
    run_log: Option<Arc<dyn RunLog>>,
    config: EngineConfig,
}

impl RunEngine {
    pub fn new(registry: ExecutorRegistry, capabilities: Capabilities) -> Self {
        Self {
            registry: Arc::new(registry),
            capabilities,
            events: Arc::new(EventBus::default()),
            run_log: None,
            config: EngineConfig::default(),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_run_log(mut self, run_log: Arc<dyn RunLog>) -> Self {
        self.run_log = Some(run_log);
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn registry(&self) -> &ExecutorRegistry {
        &self.registry
    }

    /// A fresh `pending` run record for a trigger firing.
    pub fn create_run(&self, pipeline: &Pipeline, trigger: TriggerDescriptor) -> PipelineRun {
        PipelineRun::new(pipeline.id.clone(), trigger)
    }

    /// Create a run and drive it to completion on the current task.
    pub async fn run(&self, pipeline: &Pipeline, trigger: TriggerDescriptor) -> RunReport {
        let run = self.create_run(pipeline, trigger);
        self.execute(pipeline, run, CancellationToken::new()).await
    }

    /// Start a run as its own tokio task.
    pub fn spawn(self: &Arc<Self>, pipeline: Arc<Pipeline>, trigger: TriggerDescriptor) -> RunHandle {
        let run = self.create_run(&pipeline, trigger);
        let run_id = run.id.clone();
        let cancel = CancellationToken::new();

        let engine = Arc::clone(self);
        let token = cancel.clone();
        let join = tokio::spawn(async move { engine.execute(&pipeline, run, token).await });

        RunHandle {
            run_id,
            cancel,
            join,
        }
    }

    /// Walk the graph for `run` and return the finalized record.
    ///
    /// Never fails: structural problems and node failures end up in the
    /// run's status and error.
    pub async fn execute(
        &self,
        pipeline: &Pipeline,
        run: PipelineRun,
        cancel: CancellationToken,
    ) -> RunReport {
        let span = info_span!(
            "pipeline_run",
            pipeline_id = %pipeline.id,
            run_id = %run.short_id(),
        );
        self.execute_inner(pipeline, run, cancel).instrument(span).await
    }

    async fn execute_inner(
        &self,
        pipeline: &Pipeline,
        mut run: PipelineRun,
        cancel: CancellationToken,
    ) -> RunReport {
        let started = Instant::now();
        run.status = RunStatus::Running;
        run.started_at = Utc::now();

        info!(trigger = %run.trigger.kind, nodes = pipeline.nodes.len(), "Run started");
        self.events.emit(PipelineEvent::RunStarted {
            pipeline_id: pipeline.id.clone(),
            run_id: run.id.clone(),
            trigger: run.trigger.kind.clone(),
        });
        if self.config.record_running_runs {
            self.persist(&run).await;
        }

        let ctx = ExecutionContext {
            pipeline_id: pipeline.id.clone(),
            run_id: run.id.clone(),
            capabilities: self.capabilities.clone(),
            settings: ExecutorSettings::from(&self.config),
            cancel: cancel.clone(),
        };
        let mut state = RunState::new(pipeline, run, ctx);

        let scope = top_level_scope(pipeline);
        let preflight = self.preflight(pipeline, &scope, &state.run.trigger);
        let structural_error = match preflight {
            Ok(entries) => {
                let seeds = entries.into_iter().map(|id| (id, None)).collect();
                self.walk(&mut state, &scope, seeds, None).await;
                None
            }
            Err(e) => {
                error!(error = %e, "Pipeline rejected before dispatch");
                Some(e.to_string())
            }
        };

        let RunState {
            mut run,
            node_states,
            first_error,
            ..
        } = state;

        let error = structural_error.or(first_error);
        run.status = if cancel.is_cancelled() {
            RunStatus::Cancelled
        } else if error.is_some() {
            RunStatus::Failed
        } else {
            RunStatus::Success
        };
        run.error = error;
        run.completed_at = Some(Utc::now());

        let duration_ms = started.elapsed().as_millis() as u64;
        match run.status {
            RunStatus::Failed => warn!(
                error = run.error.as_deref().unwrap_or_default(),
                duration_ms,
                "Run failed"
            ),
            status => info!(%status, nodes_run = run.node_results.len(), duration_ms, "Run finished"),
        }

        self.persist(&run).await;
        self.events.emit(PipelineEvent::RunCompleted {
            pipeline_id: run.pipeline_id.clone(),
            run_id: run.id.clone(),
            status: run.status,
            error: run.error.clone(),
            duration_ms,
        });

        RunReport { run, node_states }
    }

    /// Structural checks plus entry node selection.
    fn preflight(
        &self,
        pipeline: &Pipeline,
        scope: &HashSet<String>,
        trigger: &TriggerDescriptor,
    ) -> Result<Vec<String>> {
        pipeline.validate()?;

        for node in &pipeline.nodes {
            if catalog::lookup(node.node_type()).is_none() {
                return Err(PipelineError::UnknownNodeType(node.node_type().to_string()));
            }
            let engine_native = node.is_trigger() || matches!(node.config, NodeConfig::Loop(_));
            if !engine_native && !self.registry.contains(node.node_type()) {
                return Err(PipelineError::UnknownNodeType(format!(
                    "{} (no executor registered for node '{}')",
                    node.node_type(),
                    node.id
                )));
            }
        }

        if let Some(id) = &trigger.node_id {
            return match pipeline.node(id) {
                Some(node) if node.is_trigger() => Ok(vec![id.clone()]),
                Some(_) => Err(PipelineError::InvalidGraph(format!(
                    "node '{id}' is not a trigger"
                ))),
                None => Err(PipelineError::InvalidGraph(format!(
                    "trigger node '{id}' does not exist"
                ))),
            };
        }

        let triggers: Vec<String> = pipeline.trigger_nodes().map(|n| n.id.clone()).collect();
        if !triggers.is_empty() {
            return Ok(triggers);
        }

        let roots: Vec<String> = pipeline
            .nodes
            .iter()
            .filter(|n| scope.contains(&n.id))
            .filter(|n| {
                !pipeline
                    .incoming(&n.id)
                    .any(|e| scope.contains(&e.source) && !pipeline.is_back_edge(e))
            })
            .map(|n| n.id.clone())
            .collect();
        if roots.is_empty() {
            return Err(PipelineError::InvalidGraph("pipeline has no entry node".into()));
        }
        Ok(roots)
    }

    /// Run every reachable node in `scope`, starting from `seeds`.
    fn walk<'a, 'p>(
        &'a self,
        state: &'a mut RunState<'p>,
        scope: &'a HashSet<String>,
        seeds: Vec<(String, Option<Value>)>,
        iteration: Option<u32>,
    ) -> BoxFuture<'a, WalkOutcome> {
        Box::pin(async move {
            let pipeline = state.pipeline;
            let mut frontier = Frontier::new(pipeline, scope, &state.back_edges, seeds);
            let mut outcome = WalkOutcome::default();

            for id in frontier.take_unreachable() {
                self.mark_unreachable(state, &id);
            }

            while let Some((node_id, input)) = frontier.next_ready() {
                if state.ctx.is_cancelled() {
                    info!("Run cancelled, stopping traversal");
                    break;
                }
                let Some(node) = pipeline.node(&node_id) else {
                    continue;
                };

                let result = self.run_node(state, node, input, iteration).await;
                let output = result.output.clone().unwrap_or(Value::Null);
                match result.status {
                    ResultStatus::Failure => outcome.failed = true,
                    ResultStatus::Success if result.output.is_some() => {
                        outcome.last_output = Some(output.clone());
                    }
                    _ => {}
                }

                let decisions = frontier
                    .outgoing(&node.id)
                    .into_iter()
                    .map(|index| {
                        let edge = &pipeline.edges[index];
                        let fires = self.edge_fires(edge, &result, &output);
                        (index, fires.then(|| output.clone()))
                    })
                    .collect();
                frontier.complete(decisions);

                for id in frontier.take_unreachable() {
                    self.mark_unreachable(state, &id);
                }
            }
            outcome
        })
    }

    /// Dispatch a node, re-dispatching on failure within its retry budget.
    async fn run_node(
        &self,
        state: &mut RunState<'_>,
        node: &PipelineNode,
        input: Option<Value>,
        iteration: Option<u32>,
    ) -> NodeExecutionResult {
        let max_attempts = node.retries.saturating_add(1);
        let mut attempt = 1;

        loop {
            let started_at = Utc::now();
            {
                let node_state = state.node_states.entry(node.id.clone()).or_default();
                node_state.status = NodeStatus::Running;
                node_state.started_at = Some(started_at);
                node_state.completed_at = None;
            }
            self.events.emit(PipelineEvent::NodeStarted {
                pipeline_id: state.ctx.pipeline_id.clone(),
                run_id: state.ctx.run_id.clone(),
                node_id: node.id.clone(),
                node_type: node.node_type().to_string(),
                attempt,
            });
            debug!(node_id = %node.id, node_type = node.node_type(), attempt, ?iteration, "Dispatching node");

            let result = self.dispatch(state, node, input.as_ref(), iteration).await;
            self.record(state, node, &result, started_at, iteration, attempt);

            if result.is_failure() && attempt < max_attempts && !state.ctx.is_cancelled() {
                warn!(
                    node_id = %node.id,
                    attempt,
                    max_attempts,
                    error = result.error.as_deref().unwrap_or_default(),
                    "Node failed, retrying"
                );
                attempt += 1;
                continue;
            }

            if result.is_failure() && state.first_error.is_none() {
                state.first_error = Some(
                    result
                        .error
                        .clone()
                        .unwrap_or_else(|| format!("node '{}' failed", node.id)),
                );
            }
            return result;
        }
    }

    async fn dispatch(
        &self,
        state: &mut RunState<'_>,
        node: &PipelineNode,
        input: Option<&Value>,
        iteration: Option<u32>,
    ) -> NodeExecutionResult {
        if node.is_trigger() {
            let result = NodeExecutionResult::success(state.run.trigger.payload.clone());
            return with_sole_handle(node, result);
        }

        if let NodeConfig::Loop(cfg) = &node.config {
            let start = Instant::now();
            let result = self.run_loop(state, node, cfg, input, iteration).await;
            return result.with_duration_ms(start.elapsed().as_millis() as u64);
        }

        let result = match self.registry.get(node.node_type()) {
            Some(executor) => execute_guarded(executor.as_ref(), node, input, &state.ctx).await,
            None => NodeExecutionResult::failure(
                PipelineError::UnknownNodeType(node.node_type().to_string()).to_string(),
            ),
        };
        with_sole_handle(node, result)
    }

    /// Repeat the loop body until `maxIterations` or the stop condition.
    ///
    /// Each iteration walks the body with the current value; the output of
    /// the last body node that succeeded becomes the next value.
    async fn run_loop(
        &self,
        state: &mut RunState<'_>,
        node: &PipelineNode,
        cfg: &LoopStep,
        input: Option<&Value>,
        outer_iteration: Option<u32>,
    ) -> NodeExecutionResult {
        let pipeline = state.pipeline;
        let scope = body_scope(pipeline, &node.id);
        let entry_edges: Vec<&PipelineEdge> = pipeline
            .outgoing(&node.id)
            .filter(|e| e.source_handle.as_deref() == Some(LOOP_BODY_HANDLE))
            .filter(|e| scope.contains(&e.target))
            .collect();

        let mut value = input.cloned().unwrap_or(Value::Null);
        let mut completed = 0;

        for iteration in 0..cfg.max_iterations {
            if state.ctx.is_cancelled() {
                break;
            }

            let seeds: Vec<(String, Option<Value>)> = entry_edges
                .iter()
                .filter(|e| self.guard_passes(e, &value))
                .map(|e| (e.target.clone(), Some(value.clone())))
                .collect();
            if seeds.is_empty() {
                debug!(node_id = %node.id, iteration, "Loop body has no entry, stopping");
                break;
            }

            let outcome = self.walk(state, &scope, seeds, Some(iteration)).await;
            completed = iteration + 1;
            if outcome.failed {
                return NodeExecutionResult::failure(format!(
                    "loop body failed in iteration {iteration}"
                ));
            }
            if let Some(output) = outcome.last_output {
                value = output;
            }

            if let Some(condition) = &cfg.condition {
                match self.capabilities.evaluator.evaluate(condition, &value) {
                    Ok(true) => {
                        debug!(node_id = %node.id, iteration, "Loop stop condition met");
                        break;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        return NodeExecutionResult::failure(format!(
                            "loop condition failed: {e}"
                        ))
                    }
                }
            }
        }

        info!(node_id = %node.id, iterations = completed, ?outer_iteration, "Loop finished");
        NodeExecutionResult::success(value).with_handle(LOOP_DONE_HANDLE)
    }

    fn record(
        &self,
        state: &mut RunState<'_>,
        node: &PipelineNode,
        result: &NodeExecutionResult,
        started_at: DateTime<Utc>,
        iteration: Option<u32>,
        attempt: u32,
    ) {
        let completed_at = Utc::now();
        state.run.node_results.push(NodeRunResult {
            node_id: node.id.clone(),
            node_type: node.node_type().to_string(),
            status: result.status,
            started_at,
            completed_at,
            duration_ms: result.duration_ms,
            output: result.output.clone(),
            error: result.error.clone(),
            output_handle: result.output_handle.clone(),
            session_key: result.session_key.clone(),
            iteration,
            attempt,
        });

        let node_state = state.node_states.entry(node.id.clone()).or_default();
        node_state.status = match result.status {
            ResultStatus::Success => NodeStatus::Success,
            ResultStatus::Failure => NodeStatus::Failed,
            ResultStatus::Skipped => NodeStatus::Skipped,
        };
        node_state.completed_at = Some(completed_at);
        node_state.retry_count = attempt - 1;
        if result.is_success() {
            node_state.last_output = result.output.clone();
            node_state.last_error = None;
        } else if result.error.is_some() {
            node_state.last_error = result.error.clone();
        }

        let pipeline_id = state.ctx.pipeline_id.clone();
        let run_id = state.ctx.run_id.clone();
        let event = match result.status {
            ResultStatus::Success => {
                info!(
                    node_id = %node.id,
                    handle = result.output_handle.as_deref().unwrap_or("-"),
                    duration_ms = result.duration_ms,
                    "Node completed"
                );
                PipelineEvent::NodeCompleted {
                    pipeline_id,
                    run_id,
                    node_id: node.id.clone(),
                    output_handle: result.output_handle.clone(),
                    duration_ms: result.duration_ms,
                }
            }
            ResultStatus::Failure => {
                let error = result.error.clone().unwrap_or_default();
                warn!(node_id = %node.id, error = %error, duration_ms = result.duration_ms, "Node failed");
                PipelineEvent::NodeFailed {
                    pipeline_id,
                    run_id,
                    node_id: node.id.clone(),
                    error,
                    duration_ms: result.duration_ms,
                }
            }
            ResultStatus::Skipped => {
                info!(node_id = %node.id, reason = result.error.as_deref().unwrap_or("-"), "Node skipped");
                PipelineEvent::NodeSkipped {
                    pipeline_id,
                    run_id,
                    node_id: node.id.clone(),
                    reason: result.error.clone(),
                }
            }
        };
        self.events.emit(event);
    }

    /// A node none of whose incoming edges fired. Not invoked, no ledger entry.
    fn mark_unreachable(&self, state: &mut RunState<'_>, node_id: &str) {
        debug!(node_id, "Node not reached");
        let node_state = state.node_states.entry(node_id.to_string()).or_default();
        node_state.status = NodeStatus::Skipped;
        self.events.emit(PipelineEvent::NodeSkipped {
            pipeline_id: state.ctx.pipeline_id.clone(),
            run_id: state.ctx.run_id.clone(),
            node_id: node_id.to_string(),
            reason: Some("not reached".into()),
        });
    }

    /// An edge fires when the node succeeded, the handle matches (or the
    /// edge has none) and the guard (if any) holds for the node's output.
    fn edge_fires(&self, edge: &PipelineEdge, result: &NodeExecutionResult, output: &Value) -> bool {
        if !result.is_success() {
            return false;
        }
        if let Some(handle) = &edge.source_handle {
            if result.output_handle.as_deref() != Some(handle.as_str()) {
                return false;
            }
        }
        self.guard_passes(edge, output)
    }

    fn guard_passes(&self, edge: &PipelineEdge, value: &Value) -> bool {
        let Some(condition) = &edge.condition else {
            return true;
        };
        match self.capabilities.evaluator.evaluate(condition, value) {
            Ok(passes) => passes,
            Err(e) => {
                warn!(edge_id = %edge.id, error = %e, "Edge guard failed to evaluate, not firing");
                false
            }
        }
    }

    async fn persist(&self, run: &PipelineRun) {
        let Some(log) = &self.run_log else {
            return;
        };
        if let Err(e) = log.append(&run.pipeline_id, run).await {
            error!(status = %run.status, error = %e, "Failed to append run to run log");
        }
    }
}

/// Handle to a run spawned with [`RunEngine::spawn`].
pub struct RunHandle {
    run_id: String,
    cancel: CancellationToken,
    join: JoinHandle<RunReport>,
}

impl RunHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Ask the run to stop. A pending approval is interrupted; a node that
    /// is already running finishes first.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the run to finalize.
    pub async fn wait(self) -> Result<RunReport> {
        self.join
            .await
            .map_err(|e| PipelineError::RunTask(e.to_string()))
    }
}

/// Mutable state of one run while the engine walks it.
struct RunState<'p> {
    pipeline: &'p Pipeline,
    run: PipelineRun,
    node_states: HashMap<String, NodeState>,
    back_edges: HashSet<usize>,
    ctx: ExecutionContext,
    first_error: Option<String>,
}

impl<'p> RunState<'p> {
    fn new(pipeline: &'p Pipeline, run: PipelineRun, ctx: ExecutionContext) -> Self {
        let node_states = pipeline
            .nodes
            .iter()
            .map(|n| (n.id.clone(), NodeState::default()))
            .collect();
        let back_edges = pipeline
            .edges
            .iter()
            .enumerate()
            .filter(|(_, e)| pipeline.is_back_edge(e))
            .map(|(i, _)| i)
            .collect();
        Self {
            pipeline,
            run,
            node_states,
            back_edges,
            ctx,
            first_error: None,
        }
    }
}

#[derive(Debug, Default)]
struct WalkOutcome {
    failed: bool,
    last_output: Option<Value>,
}

/// Every node outside a loop body.
fn top_level_scope(pipeline: &Pipeline) -> HashSet<String> {
    let all = pipeline.nodes.iter().map(|n| n.id.clone()).collect();
    without_nested_bodies(pipeline, all)
}

/// The body of one loop, minus the bodies of loops nested inside it.
fn body_scope(pipeline: &Pipeline, loop_id: &str) -> HashSet<String> {
    without_nested_bodies(pipeline, pipeline.loop_body(loop_id))
}

fn without_nested_bodies(pipeline: &Pipeline, mut scope: HashSet<String>) -> HashSet<String> {
    let loops: Vec<String> = pipeline
        .nodes
        .iter()
        .filter(|n| scope.contains(&n.id) && matches!(n.config, NodeConfig::Loop(_)))
        .map(|n| n.id.clone())
        .collect();
    for loop_id in &loops {
        for member in pipeline.loop_body(loop_id) {
            scope.remove(&member);
        }
    }
    scope
}

/// A successful result with no handle reports its type's only declared
/// output, so edges naming that handle fire.
fn with_sole_handle(node: &PipelineNode, mut result: NodeExecutionResult) -> NodeExecutionResult {
    if result.is_success() && result.output_handle.is_none() {
        if let Some(&[only]) = node.descriptor().map(|d| d.outputs) {
            result.output_handle = Some(only.to_string());
        }
    }
    result
}

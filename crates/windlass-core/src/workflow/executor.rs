//! Workflow executor: topological DAG execution with suspend/resume and
//! saga rollback.
//!
//! The `WorkflowEngine` walks a published definition's nodes in Kahn
//! order, dispatching each node by type: tools through the invocation
//! bridge, conditions through the restricted evaluator, loops and
//! parallel fan-outs over their contained nodes, and approval gates by
//! suspending the run with a self-contained `EngineState` snapshot.
//!
//! # Execution flow
//!
//! 1. Fetch the definition; refuse anything not `Published`.
//! 2. Topologically sort the graph; a cycle is fatal before the run
//!    record is even created.
//! 3. Create the run, transition `Pending -> Running`, walk the order.
//! 4. Each node: persist a step record, execute, persist the terminal
//!    step status, publish lifecycle events.
//! 5. A step failure replays the compensation ledger in reverse
//!    (best-effort) and lands the run in `Failed` -- step failures are
//!    converted to a controlled transition, never an `Err` out of
//!    `execute`/`resume`.
//!
//! Resumption is a fresh invocation that reconstructs the walk position
//! from `EngineState` -- no parked threads or coroutines. Cancellation is
//! cooperative: the token is observed between nodes, and the bridge
//! timeout is the only hard bound on an in-flight tool call.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use windlass_types::error::RepositoryError;
use windlass_types::event::WorkflowEvent;
use windlass_types::workflow::{
    CompensationEntry, DefinitionStatus, EngineState, NodeData, RunStatus, StepStatus,
    WorkflowDefinition, WorkflowNode, WorkflowRun, WorkflowStep, ENGINE_STATE_VERSION,
};

use crate::event::bus::EventBus;
use crate::repository::workflow::WorkflowRepository;
use crate::tools::bridge::ToolBridge;
use crate::tools::catalog::ExternalToolsets;
use crate::tools::ToolContext;

use super::compensation::{rollback, CompensationLedger};
use super::expression::evaluate;
use super::graph::{incoming_edges, topological_sort, GraphError};
use super::path::{as_reference, interpolate, resolve_output_mapping, resolve_path};

// ---------------------------------------------------------------------------
// Collaborator trait: AI step runner
// ---------------------------------------------------------------------------

/// Executes `ai_step` nodes. Implemented by the (out-of-scope) chat/LLM
/// layer; a definition using `ai_step` without a configured runner fails
/// that step like any other step failure.
pub trait AiStepRunner: Send + Sync {
    fn run<'a>(
        &'a self,
        prompt: &'a str,
        model: Option<&'a str>,
        context: &'a Value,
    ) -> Pin<Box<dyn Future<Output = Result<Value, anyhow::Error>> + Send + 'a>>;
}

// ---------------------------------------------------------------------------
// Public API types
// ---------------------------------------------------------------------------

/// Caller decision delivered to a suspended run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeInput {
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Result of driving a run to its next stopping point (terminal status or
/// suspension).
#[derive(Debug, Clone)]
pub struct RunResult {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub output: Option<Value>,
    pub error: Option<String>,
    /// Per-step records in execution order -- enough for a caller to show
    /// which step failed and whether rollback ran.
    pub steps: Vec<WorkflowStep>,
}

/// Errors that escape `execute`/`resume`/`cancel`. Step-level failures do
/// not appear here: they are converted into a `Failed` run result.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("definition not found: {0}")]
    DefinitionNotFound(Uuid),

    #[error("workflow run not found: {0}")]
    RunNotFound(Uuid),

    #[error("definition '{name}' is not published (status: {status:?})")]
    NotPublished {
        name: String,
        status: DefinitionStatus,
    },

    /// Graph is not a DAG (or malformed). Fatal before execution starts.
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// The requested operation is not permitted in the run's current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A suspension snapshot from an incompatible engine version.
    #[error("engine state version {found} is not supported (expected {expected})")]
    StateVersion { found: u32, expected: u32 },

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
}

// ---------------------------------------------------------------------------
// Walk state
// ---------------------------------------------------------------------------

/// In-memory state owned by one execution of one run.
struct WalkState {
    step_results: HashMap<String, Value>,
    skipped: HashSet<String>,
    inactive_edges: HashSet<String>,
    ledger: CompensationLedger,
    next_step_number: u32,
    output: Option<Value>,
}

impl WalkState {
    fn new() -> Self {
        Self {
            step_results: HashMap::new(),
            skipped: HashSet::new(),
            inactive_edges: HashSet::new(),
            ledger: CompensationLedger::new(),
            next_step_number: 1,
            output: None,
        }
    }

    fn from_engine_state(state: EngineState) -> Self {
        Self {
            step_results: state.step_results,
            skipped: state.skipped.into_iter().collect(),
            inactive_edges: state.inactive_edges.into_iter().collect(),
            ledger: CompensationLedger::from_entries(state.compensations),
            next_step_number: state.next_step_number,
            output: None,
        }
    }

    fn to_engine_state(&self, pending_node_id: &str) -> EngineState {
        let mut skipped: Vec<String> = self.skipped.iter().cloned().collect();
        skipped.sort();
        let mut inactive_edges: Vec<String> = self.inactive_edges.iter().cloned().collect();
        inactive_edges.sort();
        EngineState {
            version: ENGINE_STATE_VERSION,
            pending_node_id: pending_node_id.to_string(),
            step_results: self.step_results.clone(),
            compensations: self.ledger.entries().to_vec(),
            skipped,
            inactive_edges,
            next_step_number: self.next_step_number,
        }
    }

    /// Step results as one JSON object, the context for paths and
    /// condition expressions.
    fn results_json(&self) -> Value {
        Value::Object(
            self.step_results
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    fn take_step_number(&mut self) -> u32 {
        let n = self.next_step_number;
        self.next_step_number += 1;
        n
    }
}

/// Where a walk stopped.
enum WalkOutcome {
    Completed,
    Suspended,
    Failed { node_id: String, error: String },
    Cancelled,
}

/// A step-level failure: the error plus any partial output worth keeping
/// on the step record (parallel nodes preserve settled branch outcomes).
struct StepFailure {
    error: String,
    output: Option<Value>,
}

impl StepFailure {
    fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            output: None,
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// The run state machine. Generic over `R: WorkflowRepository` for storage
/// flexibility; one engine serves many runs, but each run's walk state and
/// compensation ledger are exclusively owned by the execution driving it.
pub struct WorkflowEngine<R: WorkflowRepository> {
    repo: Arc<R>,
    bridge: Arc<ToolBridge>,
    event_bus: EventBus,
    ai_runner: Option<Arc<dyn AiStepRunner>>,
    /// Cooperative cancellation tokens keyed by run id.
    cancellations: DashMap<Uuid, CancellationToken>,
}

impl<R: WorkflowRepository + 'static> WorkflowEngine<R> {
    pub fn new(repo: Arc<R>, bridge: Arc<ToolBridge>, event_bus: EventBus) -> Self {
        Self {
            repo,
            bridge,
            event_bus,
            ai_runner: None,
            cancellations: DashMap::new(),
        }
    }

    /// Attach the collaborator that executes `ai_step` nodes.
    pub fn with_ai_runner(mut self, runner: Arc<dyn AiStepRunner>) -> Self {
        self.ai_runner = Some(runner);
        self
    }

    // -----------------------------------------------------------------------
    // Execute
    // -----------------------------------------------------------------------

    /// Execute a published definition from the beginning.
    ///
    /// A cyclic graph or an unpublished definition fails here, before any
    /// run record exists. Step failures during the walk do not escape as
    /// errors: the run result carries `Failed` plus the step records.
    pub async fn execute(
        &self,
        definition_id: Uuid,
        input: Value,
        external: Arc<ExternalToolsets>,
    ) -> Result<RunResult, EngineError> {
        let definition = self
            .repo
            .get_definition(&definition_id)
            .await?
            .ok_or(EngineError::DefinitionNotFound(definition_id))?;

        if definition.status != DefinitionStatus::Published {
            return Err(EngineError::NotPublished {
                name: definition.name.clone(),
                status: definition.status,
            });
        }

        // Cycle check before the run record is created -- a run of a
        // cyclic graph never starts.
        topological_sort(&definition.nodes, &definition.edges)?;

        let run_id = Uuid::now_v7();
        let run = WorkflowRun {
            id: run_id,
            definition_id,
            status: RunStatus::Pending,
            input: input.clone(),
            output: None,
            error: None,
            engine_state: None,
            started_at: Utc::now(),
            completed_at: None,
        };
        self.repo.create_run(&run).await?;
        self.repo
            .transition_run_status(&run_id, &[RunStatus::Pending], RunStatus::Running, None)
            .await?;

        self.event_bus.publish(WorkflowEvent::RunStarted {
            run_id,
            definition_id,
        });
        tracing::info!(
            run_id = %run_id,
            workflow = definition.name.as_str(),
            "starting workflow execution"
        );

        let cancel = CancellationToken::new();
        self.cancellations.insert(run_id, cancel.clone());

        let mut state = WalkState::new();
        let walked = self
            .run_walk(&definition, run_id, &input, &external, &mut state, None, &cancel)
            .await;

        self.cancellations.remove(&run_id);
        let outcome = walked?;
        self.finish(run_id, outcome, state, external).await
    }

    // -----------------------------------------------------------------------
    // Resume
    // -----------------------------------------------------------------------

    /// Resume a suspended run with the caller's approval decision.
    ///
    /// The `Suspended -> Running` transition is a compare-and-set, so two
    /// processes racing to resume the same run cannot both proceed. A
    /// rejection cancels the run with the supplied reason and runs no
    /// compensation -- by construction no reversible side effect has
    /// occurred at an approval gate.
    pub async fn resume(
        &self,
        run_id: Uuid,
        resume: ResumeInput,
        external: Arc<ExternalToolsets>,
    ) -> Result<RunResult, EngineError> {
        let run = self
            .repo
            .get_run(&run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))?;

        if run.status != RunStatus::Suspended {
            return Err(EngineError::InvalidState(format!(
                "cannot resume run in {:?} state",
                run.status
            )));
        }
        let Some(engine_state) = run.engine_state.clone() else {
            return Err(EngineError::InvalidState(
                "suspended run has no engine state".to_string(),
            ));
        };
        if engine_state.version != ENGINE_STATE_VERSION {
            return Err(EngineError::StateVersion {
                found: engine_state.version,
                expected: ENGINE_STATE_VERSION,
            });
        }

        let definition = self
            .repo
            .get_definition(&run.definition_id)
            .await?
            .ok_or(EngineError::DefinitionNotFound(run.definition_id))?;

        let won = self
            .repo
            .transition_run_status(&run_id, &[RunStatus::Suspended], RunStatus::Running, None)
            .await?;
        if !won {
            return Err(EngineError::InvalidState(
                "run is no longer suspended (concurrent resume?)".to_string(),
            ));
        }

        let pending_node_id = engine_state.pending_node_id.clone();
        let approval_step = self
            .repo
            .list_steps(&run_id)
            .await?
            .into_iter()
            .rev()
            .find(|s| s.node_id == pending_node_id && s.status == StepStatus::Pending);

        if !resume.approved {
            let reason = resume
                .reason
                .unwrap_or_else(|| "approval rejected".to_string());
            if let Some(mut step) = approval_step {
                step.status = StepStatus::Failed;
                step.error = Some(reason.clone());
                step.completed_at = Some(Utc::now());
                self.repo.update_step(&step).await?;
            }
            self.repo
                .transition_run_status(
                    &run_id,
                    &[RunStatus::Running],
                    RunStatus::Cancelled,
                    Some(&reason),
                )
                .await?;
            self.clear_engine_state(run_id, Some(&reason)).await?;
            self.event_bus.publish(WorkflowEvent::RunCancelled {
                run_id,
                reason: reason.clone(),
            });
            tracing::info!(run_id = %run_id, reason = reason.as_str(), "approval rejected");
            return self.load_result(run_id).await;
        }

        // Approved: close out the waiting step and continue the walk.
        if let Some(mut step) = approval_step {
            let output = json!({ "approved": true, "reason": resume.reason });
            step.status = StepStatus::Completed;
            step.output = Some(output.clone());
            step.completed_at = Some(Utc::now());
            self.repo.update_step(&step).await?;
            self.event_bus.publish(WorkflowEvent::StepCompleted {
                run_id,
                node_id: pending_node_id.clone(),
                node_type: windlass_types::workflow::NodeType::Approval,
                duration_ms: 0,
                payload: output,
            });
        }
        self.clear_engine_state(run_id, None).await?;

        tracing::info!(
            run_id = %run_id,
            node_id = pending_node_id.as_str(),
            "resuming workflow execution"
        );

        let cancel = CancellationToken::new();
        self.cancellations.insert(run_id, cancel.clone());

        let mut state = WalkState::from_engine_state(engine_state);
        let walked = self
            .run_walk(
                &definition,
                run_id,
                &run.input,
                &external,
                &mut state,
                Some(&pending_node_id),
                &cancel,
            )
            .await;

        self.cancellations.remove(&run_id);
        let outcome = walked?;
        self.finish(run_id, outcome, state, external).await
    }

    // -----------------------------------------------------------------------
    // Cancel
    // -----------------------------------------------------------------------

    /// Cancel a run from any non-terminal state.
    ///
    /// Cooperative: the walk observes the token between nodes, and an
    /// in-flight tool call is bounded only by the bridge timeout. No
    /// compensation runs -- cancellation is a user decision, not a
    /// failure.
    pub async fn cancel(&self, run_id: Uuid) -> Result<RunResult, EngineError> {
        let run = self
            .repo
            .get_run(&run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))?;

        if run.status.is_terminal() {
            return Err(EngineError::InvalidState(format!(
                "cannot cancel run in terminal {:?} state",
                run.status
            )));
        }

        let reason = "cancelled by user";
        let won = self
            .repo
            .transition_run_status(
                &run_id,
                &[RunStatus::Pending, RunStatus::Running, RunStatus::Suspended],
                RunStatus::Cancelled,
                Some(reason),
            )
            .await?;
        if !won {
            return Err(EngineError::InvalidState(
                "run reached a terminal state concurrently".to_string(),
            ));
        }

        if let Some((_, token)) = self.cancellations.remove(&run_id) {
            token.cancel();
        }
        self.clear_engine_state(run_id, Some(reason)).await?;

        self.event_bus.publish(WorkflowEvent::RunCancelled {
            run_id,
            reason: reason.to_string(),
        });
        tracing::info!(run_id = %run_id, "workflow cancelled");
        self.load_result(run_id).await
    }

    // -----------------------------------------------------------------------
    // The walk
    // -----------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    async fn run_walk(
        &self,
        definition: &WorkflowDefinition,
        run_id: Uuid,
        input: &Value,
        external: &Arc<ExternalToolsets>,
        state: &mut WalkState,
        resume_after: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<WalkOutcome, EngineError> {
        let ordered = topological_sort(&definition.nodes, &definition.edges)?;
        let contained = contained_ids(&definition.nodes);
        let incoming = incoming_edges(&definition.edges);
        let node_by_id: HashMap<&str, &WorkflowNode> = definition
            .nodes
            .iter()
            .map(|n| (n.id.as_str(), n))
            .collect();

        // On resume, fast-forward past everything up to and including the
        // approval node that suspended the run.
        let mut fast_forwarding = resume_after.is_some();
        for node in ordered {
            if fast_forwarding {
                if Some(node.id.as_str()) == resume_after {
                    fast_forwarding = false;
                }
                continue;
            }
            if contained.contains(node.id.as_str()) {
                continue;
            }
            if cancel.is_cancelled() {
                tracing::info!(run_id = %run_id, "cancellation observed, stopping walk");
                return Ok(WalkOutcome::Cancelled);
            }

            // Branch-skip propagation: a non-root node runs only when at
            // least one incoming edge is active and its source was not
            // skipped. The walk is topological, so every predecessor is
            // already resolved.
            if let Some(edges_in) = incoming.get(node.id.as_str()) {
                let reachable = edges_in.iter().any(|e| {
                    !state.inactive_edges.contains(e.id.as_str())
                        && !state.skipped.contains(e.source.as_str())
                });
                if !reachable {
                    state.skipped.insert(node.id.clone());
                    let step_number = state.take_step_number();
                    persist_step_skipped(
                        self.repo.as_ref(),
                        &self.event_bus,
                        run_id,
                        node,
                        step_number,
                    )
                    .await?;
                    continue;
                }
            }

            // Approval gates suspend instead of executing.
            if let NodeData::Approval { prompt } = &node.data {
                let resolved_prompt = interpolate(prompt, &state.results_json());
                let step_number = state.take_step_number();
                let step = WorkflowStep {
                    id: Uuid::now_v7(),
                    run_id,
                    node_id: node.id.clone(),
                    node_type: node.node_type,
                    step_number,
                    status: StepStatus::Pending,
                    input: Some(json!({ "prompt": resolved_prompt })),
                    output: None,
                    error: None,
                    started_at: Some(Utc::now()),
                    completed_at: None,
                    duration_ms: None,
                };
                self.repo.create_step(&step).await?;

                let snapshot = state.to_engine_state(&node.id);
                let mut run = self
                    .repo
                    .get_run(&run_id)
                    .await?
                    .ok_or(EngineError::RunNotFound(run_id))?;
                run.engine_state = Some(snapshot);
                self.repo.update_run(&run).await?;
                self.repo
                    .transition_run_status(
                        &run_id,
                        &[RunStatus::Running],
                        RunStatus::Suspended,
                        None,
                    )
                    .await?;

                self.event_bus.publish(WorkflowEvent::RunSuspended {
                    run_id,
                    node_id: node.id.clone(),
                    prompt: resolved_prompt,
                });
                tracing::info!(
                    run_id = %run_id,
                    node_id = node.id.as_str(),
                    "suspended at approval gate"
                );
                return Ok(WalkOutcome::Suspended);
            }

            let results = state.results_json();
            let step_number = state.take_step_number();
            let step_input = step_input_descriptor(node, input, &results);
            let step = persist_step_start(
                self.repo.as_ref(),
                &self.event_bus,
                run_id,
                node,
                step_number,
                step_input,
            )
            .await?;
            let started = Instant::now();

            let executed: Result<Value, StepFailure> = match &node.data {
                NodeData::Input {} => check_required_input(
                    definition.input_schema.as_ref(),
                    input,
                )
                .map(|_| input.clone())
                .map_err(StepFailure::new),

                NodeData::Tool { .. } | NodeData::AiStep { .. } => {
                    match run_simple_node(
                        node,
                        &results,
                        run_id,
                        &self.bridge,
                        self.ai_runner.as_ref(),
                        external,
                    )
                    .await
                    {
                        Ok((value, entry)) => {
                            if let Some(entry) = entry {
                                state.ledger.add(entry);
                            }
                            Ok(value)
                        }
                        Err(e) => Err(StepFailure::new(e)),
                    }
                }

                NodeData::Condition { expression } => {
                    let holds = evaluate(expression, &results);
                    for edge in definition.edges.iter().filter(|e| e.source == node.id) {
                        let active = match edge.source_handle.as_deref() {
                            Some("true") => holds,
                            Some("false") => !holds,
                            _ => holds,
                        };
                        if !active {
                            state.inactive_edges.insert(edge.id.clone());
                        }
                    }
                    tracing::debug!(
                        run_id = %run_id,
                        node_id = node.id.as_str(),
                        expression = expression.as_str(),
                        result = holds,
                        "condition evaluated"
                    );
                    Ok(json!({ "result": holds }))
                }

                NodeData::Loop { items, body } => self
                    .run_loop(items, body, &node_by_id, run_id, external, state)
                    .await?
                    .map_err(StepFailure::new),

                NodeData::Parallel { branches } => self
                    .run_parallel(branches, &node_by_id, run_id, external, state)
                    .await?
                    .map_err(|(error, outcomes)| StepFailure {
                        error,
                        output: Some(outcomes),
                    }),

                NodeData::Output { mapping } => {
                    let value = if mapping.is_empty() {
                        results.clone()
                    } else {
                        Value::Object(resolve_output_mapping(mapping, &results))
                    };
                    state.output = Some(value.clone());
                    Ok(value)
                }

                NodeData::Approval { .. } => unreachable!("handled above"),
            };

            match executed {
                Ok(value) => {
                    persist_step_complete(
                        self.repo.as_ref(),
                        &self.event_bus,
                        step,
                        value.clone(),
                        started,
                    )
                    .await?;
                    state.step_results.insert(node.id.clone(), value);
                }
                Err(failure) => {
                    persist_step_failed(
                        self.repo.as_ref(),
                        &self.event_bus,
                        step,
                        &failure.error,
                        failure.output,
                        started,
                    )
                    .await?;
                    return Ok(WalkOutcome::Failed {
                        node_id: node.id.clone(),
                        error: failure.error,
                    });
                }
            }
        }

        Ok(WalkOutcome::Completed)
    }

    // -----------------------------------------------------------------------
    // Loop nodes
    // -----------------------------------------------------------------------

    /// Run a loop node: the contained body once per item, in order.
    ///
    /// `item` and `index` are exposed to path resolution inside each
    /// iteration, alongside the body outputs produced so far in that
    /// iteration. An iteration failure fails the whole loop node; tool
    /// compensation entries already recorded for completed iterations
    /// stay in the ledger.
    async fn run_loop(
        &self,
        items_path: &str,
        body: &[String],
        node_by_id: &HashMap<&str, &WorkflowNode>,
        run_id: Uuid,
        external: &Arc<ExternalToolsets>,
        state: &mut WalkState,
    ) -> Result<Result<Value, String>, EngineError> {
        let results = state.results_json();
        let Some(Value::Array(items)) = resolve_path(items_path, &results) else {
            return Ok(Err(format!(
                "loop items path '{items_path}' did not resolve to an array"
            )));
        };

        let mut iterations: Vec<Value> = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            let mut iter_outputs = Map::new();
            for body_id in body {
                let Some(body_node) = node_by_id.get(body_id.as_str()) else {
                    return Ok(Err(format!(
                        "loop body references unknown node '{body_id}'"
                    )));
                };

                // Iteration scope: global results + item/index + this
                // iteration's earlier body outputs.
                let mut scope = match &results {
                    Value::Object(map) => map.clone(),
                    _ => Map::new(),
                };
                scope.insert("item".to_string(), item.clone());
                scope.insert("index".to_string(), json!(index));
                for (k, v) in &iter_outputs {
                    scope.insert(k.clone(), v.clone());
                }
                let scope = Value::Object(scope);

                let step_number = state.take_step_number();
                let step = persist_step_start(
                    self.repo.as_ref(),
                    &self.event_bus,
                    run_id,
                    body_node,
                    step_number,
                    Some(json!({ "item": item, "index": index })),
                )
                .await?;
                let started = Instant::now();

                match run_simple_node(
                    body_node,
                    &scope,
                    run_id,
                    &self.bridge,
                    self.ai_runner.as_ref(),
                    external,
                )
                .await
                {
                    Ok((value, entry)) => {
                        if let Some(entry) = entry {
                            state.ledger.add(entry);
                        }
                        persist_step_complete(
                            self.repo.as_ref(),
                            &self.event_bus,
                            step,
                            value.clone(),
                            started,
                        )
                        .await?;
                        iter_outputs.insert(body_id.clone(), value);
                    }
                    Err(e) => {
                        persist_step_failed(
                            self.repo.as_ref(),
                            &self.event_bus,
                            step,
                            &e,
                            None,
                            started,
                        )
                        .await?;
                        return Ok(Err(format!(
                            "iteration {index} failed at node '{body_id}': {e}"
                        )));
                    }
                }
            }
            iterations.push(Value::Object(iter_outputs));
        }

        Ok(Ok(json!({
            "iterations": iterations.len(),
            "results": iterations,
        })))
    }

    // -----------------------------------------------------------------------
    // Parallel nodes
    // -----------------------------------------------------------------------

    /// Run a parallel node: every declared branch concurrently, joined
    /// with a settle-all barrier.
    ///
    /// All branch outcomes are collected before the node resolves, so
    /// sibling results survive even when one branch fails. Compensation
    /// entries merge in branch index order. On failure the error carries
    /// the first failing branch and the returned outcomes value preserves
    /// every branch's result.
    async fn run_parallel(
        &self,
        branches: &[Vec<String>],
        node_by_id: &HashMap<&str, &WorkflowNode>,
        run_id: Uuid,
        external: &Arc<ExternalToolsets>,
        state: &mut WalkState,
    ) -> Result<Result<Value, (String, Value)>, EngineError> {
        let base_results = state.results_json();
        let counter = Arc::new(AtomicU32::new(state.next_step_number));
        let mut join_set = JoinSet::new();

        for (branch_index, branch) in branches.iter().enumerate() {
            let mut nodes = Vec::with_capacity(branch.len());
            for id in branch {
                match node_by_id.get(id.as_str()) {
                    Some(n) => nodes.push((*n).clone()),
                    None => {
                        return Ok(Err((
                            format!("parallel branch references unknown node '{id}'"),
                            Value::Null,
                        )))
                    }
                }
            }

            let repo = Arc::clone(&self.repo);
            let bridge = Arc::clone(&self.bridge);
            let bus = self.event_bus.clone();
            let ai = self.ai_runner.clone();
            let ext = Arc::clone(external);
            let results = base_results.clone();
            let counter = Arc::clone(&counter);

            join_set.spawn(async move {
                let outcome =
                    run_branch(repo, bridge, bus, ai, ext, run_id, nodes, results, counter)
                        .await;
                (branch_index, outcome)
            });
        }

        // Settle-all barrier: every branch is collected before the node
        // resolves, success or failure.
        let mut settled: Vec<(usize, BranchOutcome)> = Vec::with_capacity(branches.len());
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(pair) => settled.push(pair),
                Err(e) => {
                    tracing::warn!(run_id = %run_id, error = %e, "parallel branch task died");
                    settled.push((
                        usize::MAX,
                        BranchOutcome {
                            outputs: Map::new(),
                            entries: Vec::new(),
                            error: Some(format!("branch task join error: {e}")),
                        },
                    ));
                }
            }
        }
        settled.sort_by_key(|(i, _)| *i);
        state.next_step_number = counter.load(Ordering::SeqCst);

        let mut first_error: Option<String> = None;
        let mut branch_values = Vec::with_capacity(settled.len());
        for (index, outcome) in settled {
            for entry in outcome.entries {
                state.ledger.add(entry);
            }
            // Completed branch outputs become globally addressable for
            // downstream path references.
            for (node_id, value) in &outcome.outputs {
                state.step_results.insert(node_id.clone(), value.clone());
            }
            if let Some(error) = &outcome.error {
                if first_error.is_none() {
                    first_error = Some(format!("branch {index} failed: {error}"));
                }
            }
            branch_values.push(json!({
                "branch": index,
                "status": if outcome.error.is_none() { "completed" } else { "failed" },
                "outputs": Value::Object(outcome.outputs),
                "error": outcome.error,
            }));
        }

        let summary = json!({ "branches": branch_values });
        match first_error {
            None => Ok(Ok(summary)),
            Some(error) => Ok(Err((error, summary))),
        }
    }

    // -----------------------------------------------------------------------
    // Run completion
    // -----------------------------------------------------------------------

    /// Convert a walk outcome into the persisted terminal state (running
    /// rollback for failures) and load the caller-facing result.
    async fn finish(
        &self,
        run_id: Uuid,
        outcome: WalkOutcome,
        state: WalkState,
        external: Arc<ExternalToolsets>,
    ) -> Result<RunResult, EngineError> {
        match outcome {
            WalkOutcome::Completed => {
                let transitioned = self
                    .repo
                    .transition_run_status(
                        &run_id,
                        &[RunStatus::Running],
                        RunStatus::Completed,
                        None,
                    )
                    .await?;
                if transitioned {
                    let mut run = self
                        .repo
                        .get_run(&run_id)
                        .await?
                        .ok_or(EngineError::RunNotFound(run_id))?;
                    run.output = state.output.clone();
                    run.engine_state = None;
                    run.completed_at = Some(Utc::now());
                    self.repo.update_run(&run).await?;

                    let duration_ms = run
                        .completed_at
                        .map(|end| (end - run.started_at).num_milliseconds().max(0) as u64)
                        .unwrap_or(0);
                    self.event_bus.publish(WorkflowEvent::RunCompleted {
                        run_id,
                        duration_ms,
                    });
                    tracing::info!(run_id = %run_id, duration_ms, "workflow completed");
                }
                self.load_result(run_id).await
            }

            WalkOutcome::Suspended => self.load_result(run_id).await,

            WalkOutcome::Failed { node_id, error } => {
                if state.ledger.has_compensations() {
                    let rolled = rollback(
                        &state.ledger,
                        &self.bridge,
                        run_id,
                        Arc::clone(&external),
                    )
                    .await;
                    tracing::info!(
                        run_id = %run_id,
                        attempted = rolled.attempted,
                        succeeded = rolled.succeeded,
                        "compensation rollback finished"
                    );
                }

                let full_error = format!("node '{node_id}' failed: {error}");
                let transitioned = self
                    .repo
                    .transition_run_status(
                        &run_id,
                        &[RunStatus::Running],
                        RunStatus::Failed,
                        Some(&full_error),
                    )
                    .await?;
                if transitioned {
                    let mut run = self
                        .repo
                        .get_run(&run_id)
                        .await?
                        .ok_or(EngineError::RunNotFound(run_id))?;
                    run.error = Some(full_error.clone());
                    run.engine_state = None;
                    run.completed_at = Some(Utc::now());
                    self.repo.update_run(&run).await?;

                    self.event_bus.publish(WorkflowEvent::RunFailed {
                        run_id,
                        error: full_error,
                    });
                }
                self.load_result(run_id).await
            }

            // `cancel` already performed the status transition; the walk
            // merely observed the token and unwound.
            WalkOutcome::Cancelled => self.load_result(run_id).await,
        }
    }

    /// Drop the suspension snapshot (and stamp completion when terminal).
    async fn clear_engine_state(
        &self,
        run_id: Uuid,
        error: Option<&str>,
    ) -> Result<(), EngineError> {
        let mut run = self
            .repo
            .get_run(&run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))?;
        run.engine_state = None;
        if let Some(error) = error {
            run.error = Some(error.to_string());
        }
        if run.status.is_terminal() {
            run.completed_at = Some(Utc::now());
        }
        self.repo.update_run(&run).await?;
        Ok(())
    }

    async fn load_result(&self, run_id: Uuid) -> Result<RunResult, EngineError> {
        let run = self
            .repo
            .get_run(&run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))?;
        let steps = self.repo.list_steps(&run_id).await?;
        Ok(RunResult {
            run_id,
            status: run.status,
            output: run.output,
            error: run.error,
            steps,
        })
    }
}

// ---------------------------------------------------------------------------
// Branch execution (free functions so spawned tasks stay 'static)
// ---------------------------------------------------------------------------

struct BranchOutcome {
    outputs: Map<String, Value>,
    entries: Vec<CompensationEntry>,
    error: Option<String>,
}

#[allow(clippy::too_many_arguments)]
async fn run_branch<R: WorkflowRepository>(
    repo: Arc<R>,
    bridge: Arc<ToolBridge>,
    event_bus: EventBus,
    ai_runner: Option<Arc<dyn AiStepRunner>>,
    external: Arc<ExternalToolsets>,
    run_id: Uuid,
    nodes: Vec<WorkflowNode>,
    base_results: Value,
    step_counter: Arc<AtomicU32>,
) -> BranchOutcome {
    let mut outputs = Map::new();
    let mut entries = Vec::new();

    for node in &nodes {
        // Branch scope: global results + this branch's outputs so far.
        let mut scope = match &base_results {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        for (k, v) in &outputs {
            scope.insert(k.clone(), v.clone());
        }
        let scope = Value::Object(scope);

        let step_number = step_counter.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();
        let step = match persist_step_start(
            repo.as_ref(),
            &event_bus,
            run_id,
            node,
            step_number,
            None,
        )
        .await
        {
            Ok(step) => step,
            Err(e) => {
                return BranchOutcome {
                    outputs,
                    entries,
                    error: Some(format!("repository error: {e}")),
                }
            }
        };

        match run_simple_node(node, &scope, run_id, &bridge, ai_runner.as_ref(), &external)
            .await
        {
            Ok((value, entry)) => {
                if let Some(entry) = entry {
                    entries.push(entry);
                }
                if let Err(e) = persist_step_complete(
                    repo.as_ref(),
                    &event_bus,
                    step,
                    value.clone(),
                    started,
                )
                .await
                {
                    return BranchOutcome {
                        outputs,
                        entries,
                        error: Some(format!("repository error: {e}")),
                    };
                }
                outputs.insert(node.id.clone(), value);
            }
            Err(e) => {
                let _ = persist_step_failed(
                    repo.as_ref(),
                    &event_bus,
                    step,
                    &e,
                    None,
                    started,
                )
                .await;
                return BranchOutcome {
                    outputs,
                    entries,
                    error: Some(format!("node '{}': {e}", node.id)),
                };
            }
        }
    }

    BranchOutcome {
        outputs,
        entries,
        error: None,
    }
}

// ---------------------------------------------------------------------------
// Simple node execution (tool / ai_step)
// ---------------------------------------------------------------------------

/// Execute a tool or AI node against a results context. Shared by the
/// top-level walk, loop bodies, and parallel branches. Returns the output
/// and, for compensation-eligible tools, the ledger entry to record.
async fn run_simple_node(
    node: &WorkflowNode,
    results: &Value,
    run_id: Uuid,
    bridge: &ToolBridge,
    ai_runner: Option<&Arc<dyn AiStepRunner>>,
    external: &Arc<ExternalToolsets>,
) -> Result<(Value, Option<CompensationEntry>), String> {
    match &node.data {
        NodeData::Tool { tool, arguments } => {
            let resolved = resolve_arguments(arguments, results);
            let ctx = ToolContext::new(run_id, node.id.clone(), Arc::clone(external));
            match bridge
                .invoke(tool, Value::Object(resolved.clone()), &ctx)
                .await
            {
                Ok(value) => {
                    let entry =
                        bridge
                            .catalog()
                            .inverse_action(tool)
                            .map(|inverse| CompensationEntry {
                                node_id: node.id.clone(),
                                tool_name: tool.clone(),
                                compensate_action: inverse.to_string(),
                                compensate_args: json!({
                                    "input": Value::Object(resolved),
                                    "output": value,
                                }),
                            });
                    Ok((value, entry))
                }
                Err(e) => Err(e.to_string()),
            }
        }

        NodeData::AiStep { prompt, model } => {
            let Some(runner) = ai_runner else {
                return Err(format!(
                    "node '{}' requires an AI step runner, none is configured",
                    node.id
                ));
            };
            let resolved_prompt = interpolate(prompt, results);
            runner
                .run(&resolved_prompt, model.as_deref(), results)
                .await
                .map(|value| (value, None))
                .map_err(|e| e.to_string())
        }

        _ => Err(format!(
            "node '{}' of type {:?} cannot run inside a container",
            node.id, node.node_type
        )),
    }
}

/// Resolve tool arguments: a string of the exact form `{{ dot.path }}`
/// becomes the referenced value from step results (null when missing);
/// everything else passes through as a literal.
fn resolve_arguments(arguments: &Map<String, Value>, results: &Value) -> Map<String, Value> {
    arguments
        .iter()
        .map(|(key, value)| {
            let resolved = match value {
                Value::String(s) => match as_reference(s) {
                    Some(path) => resolve_path(path, results).unwrap_or(Value::Null),
                    None => value.clone(),
                },
                _ => value.clone(),
            };
            (key.clone(), resolved)
        })
        .collect()
}

/// Shape-check the run input against the definition's declared schema.
/// Only the top-level `required` key list is enforced.
fn check_required_input(schema: Option<&Value>, input: &Value) -> Result<(), String> {
    let Some(required) = schema
        .and_then(|s| s.get("required"))
        .and_then(Value::as_array)
    else {
        return Ok(());
    };
    for key in required {
        let Some(name) = key.as_str() else { continue };
        let present = input
            .as_object()
            .map(|map| map.contains_key(name))
            .unwrap_or(false);
        if !present {
            return Err(format!("run input is missing required key '{name}'"));
        }
    }
    Ok(())
}

/// The audit-record input descriptor for a node's step record.
fn step_input_descriptor(node: &WorkflowNode, input: &Value, results: &Value) -> Option<Value> {
    match &node.data {
        NodeData::Input {} => Some(input.clone()),
        NodeData::Tool { tool, arguments } => Some(json!({
            "tool": tool,
            "arguments": Value::Object(resolve_arguments(arguments, results)),
        })),
        NodeData::Condition { expression } => Some(json!({ "expression": expression })),
        NodeData::Loop { items, .. } => Some(json!({ "items": items })),
        NodeData::AiStep { prompt, .. } => {
            Some(json!({ "prompt": interpolate(prompt, results) }))
        }
        NodeData::Parallel { branches } => Some(json!({ "branches": branches.len() })),
        NodeData::Output { .. } | NodeData::Approval { .. } => None,
    }
}

/// Node ids contained by loop bodies and parallel branches; these are
/// excluded from the top-level walk and run only inside their container.
fn contained_ids(nodes: &[WorkflowNode]) -> HashSet<&str> {
    let mut contained = HashSet::new();
    for node in nodes {
        match &node.data {
            NodeData::Loop { body, .. } => {
                contained.extend(body.iter().map(String::as_str));
            }
            NodeData::Parallel { branches } => {
                contained.extend(branches.iter().flatten().map(String::as_str));
            }
            _ => {}
        }
    }
    contained
}

// ---------------------------------------------------------------------------
// Step record persistence
// ---------------------------------------------------------------------------

async fn persist_step_start<R: WorkflowRepository>(
    repo: &R,
    bus: &EventBus,
    run_id: Uuid,
    node: &WorkflowNode,
    step_number: u32,
    input: Option<Value>,
) -> Result<WorkflowStep, RepositoryError> {
    let step = WorkflowStep {
        id: Uuid::now_v7(),
        run_id,
        node_id: node.id.clone(),
        node_type: node.node_type,
        step_number,
        status: StepStatus::Running,
        input,
        output: None,
        error: None,
        started_at: Some(Utc::now()),
        completed_at: None,
        duration_ms: None,
    };
    repo.create_step(&step).await?;
    bus.publish(WorkflowEvent::StepStarted {
        run_id,
        node_id: node.id.clone(),
        node_type: node.node_type,
    });
    tracing::debug!(run_id = %run_id, node_id = node.id.as_str(), "step started");
    Ok(step)
}

async fn persist_step_complete<R: WorkflowRepository>(
    repo: &R,
    bus: &EventBus,
    mut step: WorkflowStep,
    output: Value,
    started: Instant,
) -> Result<(), RepositoryError> {
    let duration_ms = started.elapsed().as_millis() as u64;
    step.status = StepStatus::Completed;
    step.output = Some(output.clone());
    step.completed_at = Some(Utc::now());
    step.duration_ms = Some(duration_ms);
    repo.update_step(&step).await?;
    bus.publish(WorkflowEvent::StepCompleted {
        run_id: step.run_id,
        node_id: step.node_id.clone(),
        node_type: step.node_type,
        duration_ms,
        payload: output,
    });
    Ok(())
}

async fn persist_step_failed<R: WorkflowRepository>(
    repo: &R,
    bus: &EventBus,
    mut step: WorkflowStep,
    error: &str,
    output: Option<Value>,
    started: Instant,
) -> Result<(), RepositoryError> {
    let duration_ms = started.elapsed().as_millis() as u64;
    step.status = StepStatus::Failed;
    step.error = Some(error.to_string());
    step.output = output;
    step.completed_at = Some(Utc::now());
    step.duration_ms = Some(duration_ms);
    repo.update_step(&step).await?;
    bus.publish(WorkflowEvent::StepFailed {
        run_id: step.run_id,
        node_id: step.node_id.clone(),
        node_type: step.node_type,
        error: error.to_string(),
    });
    tracing::warn!(
        run_id = %step.run_id,
        node_id = step.node_id.as_str(),
        error,
        "step failed"
    );
    Ok(())
}

async fn persist_step_skipped<R: WorkflowRepository>(
    repo: &R,
    bus: &EventBus,
    run_id: Uuid,
    node: &WorkflowNode,
    step_number: u32,
) -> Result<(), RepositoryError> {
    let now = Utc::now();
    let step = WorkflowStep {
        id: Uuid::now_v7(),
        run_id,
        node_id: node.id.clone(),
        node_type: node.node_type,
        step_number,
        status: StepStatus::Skipped,
        input: None,
        output: None,
        error: None,
        started_at: Some(now),
        completed_at: Some(now),
        duration_ms: Some(0),
    };
    repo.create_step(&step).await?;
    bus.publish(WorkflowEvent::StepSkipped {
        run_id,
        node_id: node.id.clone(),
        node_type: node.node_type,
    });
    tracing::debug!(run_id = %run_id, node_id = node.id.as_str(), "step skipped");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! End-to-end engine scenarios against an in-memory repository and a
//! recording tool catalog.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use uuid::Uuid;

use windlass_core::event::bus::EventBus;
use windlass_core::repository::workflow::WorkflowRepository;
use windlass_core::tools::bridge::ToolBridge;
use windlass_core::tools::catalog::{ExternalToolsets, ToolCatalog};
use windlass_core::tools::{ToolContext, ToolHandler};
use windlass_core::workflow::executor::{
    EngineError, ResumeInput, RunResult, WorkflowEngine,
};
use windlass_types::error::RepositoryError;
use windlass_types::workflow::{
    DefinitionStatus, NodeData, NodeType, RunStatus, StepStatus, WorkflowDefinition,
    WorkflowEdge, WorkflowNode, WorkflowRun, WorkflowStep,
};

// ---------------------------------------------------------------------------
// In-memory repository
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryRepo {
    definitions: Mutex<HashMap<Uuid, WorkflowDefinition>>,
    runs: Mutex<HashMap<Uuid, WorkflowRun>>,
    steps: Mutex<Vec<WorkflowStep>>,
}

impl MemoryRepo {
    fn insert_definition(&self, def: WorkflowDefinition) {
        self.definitions.lock().unwrap().insert(def.id, def);
    }

    fn run(&self, run_id: &Uuid) -> WorkflowRun {
        self.runs.lock().unwrap().get(run_id).cloned().unwrap()
    }
}

impl WorkflowRepository for MemoryRepo {
    async fn get_definition(
        &self,
        id: &Uuid,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        Ok(self.definitions.lock().unwrap().get(id).cloned())
    }

    async fn create_run(&self, run: &WorkflowRun) -> Result<(), RepositoryError> {
        self.runs.lock().unwrap().insert(run.id, run.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<WorkflowRun>, RepositoryError> {
        Ok(self.runs.lock().unwrap().get(run_id).cloned())
    }

    async fn update_run(&self, run: &WorkflowRun) -> Result<(), RepositoryError> {
        let mut runs = self.runs.lock().unwrap();
        if !runs.contains_key(&run.id) {
            return Err(RepositoryError::NotFound);
        }
        runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn transition_run_status(
        &self,
        run_id: &Uuid,
        from: &[RunStatus],
        to: RunStatus,
        error: Option<&str>,
    ) -> Result<bool, RepositoryError> {
        let mut runs = self.runs.lock().unwrap();
        let run = runs.get_mut(run_id).ok_or(RepositoryError::NotFound)?;
        if !from.contains(&run.status) {
            return Ok(false);
        }
        run.status = to;
        if let Some(error) = error {
            run.error = Some(error.to_string());
        }
        Ok(true)
    }

    async fn create_step(&self, step: &WorkflowStep) -> Result<(), RepositoryError> {
        self.steps.lock().unwrap().push(step.clone());
        Ok(())
    }

    async fn update_step(&self, step: &WorkflowStep) -> Result<(), RepositoryError> {
        let mut steps = self.steps.lock().unwrap();
        let existing = steps
            .iter_mut()
            .find(|s| s.id == step.id)
            .ok_or(RepositoryError::NotFound)?;
        *existing = step.clone();
        Ok(())
    }

    async fn list_steps(&self, run_id: &Uuid) -> Result<Vec<WorkflowStep>, RepositoryError> {
        let mut steps: Vec<WorkflowStep> = self
            .steps
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.run_id == *run_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.step_number);
        Ok(steps)
    }
}

// ---------------------------------------------------------------------------
// Recording tools
// ---------------------------------------------------------------------------

type CallLog = Arc<Mutex<Vec<(String, Value)>>>;

enum Behavior {
    /// Succeed with a fixed value.
    Ok(Value),
    /// Succeed, echoing the received arguments back.
    Echo,
    /// Fail with a message.
    Fail(&'static str),
}

struct TestTool {
    name: String,
    behavior: Behavior,
    log: CallLog,
}

impl ToolHandler for TestTool {
    fn execute<'a>(
        &'a self,
        args: Value,
        _ctx: &'a ToolContext,
    ) -> Pin<Box<dyn Future<Output = Result<Value, anyhow::Error>> + Send + 'a>> {
        self.log.lock().unwrap().push((self.name.clone(), args.clone()));
        Box::pin(async move {
            match &self.behavior {
                Behavior::Ok(value) => Ok(value.clone()),
                Behavior::Echo => Ok(args),
                Behavior::Fail(message) => Err(anyhow::anyhow!("{message}")),
            }
        })
    }
}

/// Calls made to a given tool name, in invocation order.
fn calls_to(log: &CallLog, name: &str) -> Vec<Value> {
    log.lock()
        .unwrap()
        .iter()
        .filter(|(n, _)| n == name)
        .map(|(_, args)| args.clone())
        .collect()
}

// ---------------------------------------------------------------------------
// Definition builders
// ---------------------------------------------------------------------------

fn node(id: &str, data: NodeData) -> WorkflowNode {
    let node_type = match &data {
        NodeData::Input {} => NodeType::Input,
        NodeData::Tool { .. } => NodeType::Tool,
        NodeData::Condition { .. } => NodeType::Condition,
        NodeData::Loop { .. } => NodeType::Loop,
        NodeData::Approval { .. } => NodeType::Approval,
        NodeData::AiStep { .. } => NodeType::AiStep,
        NodeData::Output { .. } => NodeType::Output,
        NodeData::Parallel { .. } => NodeType::Parallel,
    };
    WorkflowNode {
        id: id.to_string(),
        node_type,
        data,
    }
}

fn tool_node(id: &str, tool: &str, arguments: &[(&str, Value)]) -> WorkflowNode {
    node(
        id,
        NodeData::Tool {
            tool: tool.to_string(),
            arguments: arguments
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        },
    )
}

fn edge(id: &str, source: &str, target: &str) -> WorkflowEdge {
    WorkflowEdge {
        id: id.to_string(),
        source: source.to_string(),
        target: target.to_string(),
        source_handle: None,
    }
}

fn branch_edge(id: &str, source: &str, target: &str, handle: &str) -> WorkflowEdge {
    WorkflowEdge {
        id: id.to_string(),
        source: source.to_string(),
        target: target.to_string(),
        source_handle: Some(handle.to_string()),
    }
}

fn published(nodes: Vec<WorkflowNode>, edges: Vec<WorkflowEdge>) -> WorkflowDefinition {
    WorkflowDefinition {
        id: Uuid::now_v7(),
        name: "test-flow".to_string(),
        description: None,
        status: DefinitionStatus::Published,
        version: 1,
        nodes,
        edges,
        input_schema: None,
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    repo: Arc<MemoryRepo>,
    engine: WorkflowEngine<MemoryRepo>,
    log: CallLog,
}

impl Harness {
    /// Catalog with a compensable `createServer` (inverse `deleteServer`),
    /// a plain `notify`, a failing `breakThings`, and an echoing
    /// `tagVolume`.
    fn new() -> Self {
        let log: CallLog = Arc::new(Mutex::new(Vec::new()));
        let mut catalog = ToolCatalog::new();
        catalog.register_with_inverse(
            "createServer",
            Arc::new(TestTool {
                name: "createServer".to_string(),
                behavior: Behavior::Ok(json!({ "id": "srv-1", "state": "RUNNING" })),
                log: Arc::clone(&log),
            }),
            "deleteServer",
        );
        catalog.register(
            "deleteServer",
            Arc::new(TestTool {
                name: "deleteServer".to_string(),
                behavior: Behavior::Ok(json!({ "deleted": true })),
                log: Arc::clone(&log),
            }),
        );
        catalog.register(
            "notify",
            Arc::new(TestTool {
                name: "notify".to_string(),
                behavior: Behavior::Ok(json!({ "sent": true })),
                log: Arc::clone(&log),
            }),
        );
        catalog.register(
            "breakThings",
            Arc::new(TestTool {
                name: "breakThings".to_string(),
                behavior: Behavior::Fail("service unavailable"),
                log: Arc::clone(&log),
            }),
        );
        catalog.register(
            "tagVolume",
            Arc::new(TestTool {
                name: "tagVolume".to_string(),
                behavior: Behavior::Echo,
                log: Arc::clone(&log),
            }),
        );
        catalog.register(
            "listVolumes",
            Arc::new(TestTool {
                name: "listVolumes".to_string(),
                behavior: Behavior::Ok(json!({ "volumes": ["v1", "v2", "v3"] })),
                log: Arc::clone(&log),
            }),
        );

        let repo = Arc::new(MemoryRepo::default());
        let engine = WorkflowEngine::new(
            Arc::clone(&repo),
            Arc::new(ToolBridge::new(Arc::new(catalog))),
            EventBus::new(64),
        );
        Self { repo, engine, log }
    }

    async fn execute(&self, def: &WorkflowDefinition, input: Value) -> RunResult {
        self.repo.insert_definition(def.clone());
        self.engine
            .execute(def.id, input, Arc::new(ExternalToolsets::new()))
            .await
            .expect("execute must not error for step-level failures")
    }

    fn step(&self, result: &RunResult, node_id: &str) -> WorkflowStep {
        result
            .steps
            .iter()
            .find(|s| s.node_id == node_id)
            .unwrap_or_else(|| panic!("no step record for '{node_id}'"))
            .clone()
    }
}

// ---------------------------------------------------------------------------
// Happy path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn linear_run_completes_with_mapped_output() {
    let h = Harness::new();
    let def = published(
        vec![
            node("start", NodeData::Input {}),
            tool_node("create", "createServer", &[("name", json!("{{ start.name }}"))]),
            tool_node("announce", "notify", &[("server", json!("{{ create.id }}"))]),
            node(
                "done",
                NodeData::Output {
                    mapping: HashMap::from([(
                        "server_id".to_string(),
                        "create.id".to_string(),
                    )]),
                },
            ),
        ],
        vec![
            edge("e1", "start", "create"),
            edge("e2", "create", "announce"),
            edge("e3", "announce", "done"),
        ],
    );

    let result = h.execute(&def, json!({ "name": "web-1" })).await;

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.output, Some(json!({ "server_id": "srv-1" })));
    assert!(result.error.is_none());

    // Argument references resolved against prior step results.
    let create_calls = calls_to(&h.log, "createServer");
    assert_eq!(create_calls, vec![json!({ "name": "web-1" })]);
    let notify_calls = calls_to(&h.log, "notify");
    assert_eq!(notify_calls, vec![json!({ "server": "srv-1" })]);

    // Steps recorded in execution order with terminal statuses.
    let ids: Vec<&str> = result.steps.iter().map(|s| s.node_id.as_str()).collect();
    assert_eq!(ids, vec!["start", "create", "announce", "done"]);
    assert!(result.steps.iter().all(|s| s.status == StepStatus::Completed));
    assert!(result.steps.iter().all(|s| s.duration_ms.is_some()));
}

#[tokio::test]
async fn input_shape_check_enforces_required_keys() {
    let h = Harness::new();
    let mut def = published(
        vec![node("start", NodeData::Input {})],
        vec![],
    );
    def.input_schema = Some(json!({ "required": ["name"] }));

    let result = h.execute(&def, json!({ "other": 1 })).await;
    assert_eq!(result.status, RunStatus::Failed);
    assert!(result.error.unwrap().contains("required key 'name'"));
}

// ---------------------------------------------------------------------------
// Failure and compensation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failed_step_rolls_back_compensable_tools() {
    let h = Harness::new();
    let def = published(
        vec![
            node("start", NodeData::Input {}),
            tool_node("create", "createServer", &[("name", json!("web-1"))]),
            tool_node("boom", "breakThings", &[]),
            node("done", NodeData::Output { mapping: HashMap::new() }),
        ],
        vec![
            edge("e1", "start", "create"),
            edge("e2", "create", "boom"),
            edge("e3", "boom", "done"),
        ],
    );

    let result = h.execute(&def, json!({})).await;

    assert_eq!(result.status, RunStatus::Failed);
    let error = result.error.clone().unwrap();
    assert!(error.contains("boom"), "error names the failed node: {error}");
    assert!(error.contains("service unavailable"));

    // Exactly one compensation ran, with the forward call's input and
    // output available to the inverse action.
    let deletes = calls_to(&h.log, "deleteServer");
    assert_eq!(deletes.len(), 1);
    assert_eq!(deletes[0]["input"], json!({ "name": "web-1" }));
    assert_eq!(deletes[0]["output"]["id"], json!("srv-1"));

    assert_eq!(h.step(&result, "create").status, StepStatus::Completed);
    let boom = h.step(&result, "boom");
    assert_eq!(boom.status, StepStatus::Failed);
    assert!(boom.error.unwrap().contains("service unavailable"));

    // No continuation past the failure.
    assert!(result.steps.iter().all(|s| s.node_id != "done"));
}

#[tokio::test]
async fn unknown_tool_fails_the_run_without_side_effects() {
    let h = Harness::new();
    let def = published(
        vec![tool_node("ghost", "fabricatedTool", &[])],
        vec![],
    );

    let result = h.execute(&def, json!({})).await;
    assert_eq!(result.status, RunStatus::Failed);
    assert!(result.error.unwrap().contains("tool not found"));
    assert!(h.log.lock().unwrap().is_empty(), "nothing may execute");
}

// ---------------------------------------------------------------------------
// Approval suspend / resume
// ---------------------------------------------------------------------------

fn approval_flow() -> WorkflowDefinition {
    published(
        vec![
            node("start", NodeData::Input {}),
            tool_node("create", "createServer", &[("name", json!("web-1"))]),
            node(
                "review",
                NodeData::Approval {
                    prompt: "Confirm server {{ create.id }}".to_string(),
                },
            ),
            tool_node("announce", "notify", &[("server", json!("{{ create.id }}"))]),
            node("done", NodeData::Output { mapping: HashMap::new() }),
        ],
        vec![
            edge("e1", "start", "create"),
            edge("e2", "create", "review"),
            edge("e3", "review", "announce"),
            edge("e4", "announce", "done"),
        ],
    )
}

#[tokio::test]
async fn approval_gate_suspends_and_resumes_to_completion() {
    let h = Harness::new();
    let def = approval_flow();
    let result = h.execute(&def, json!({})).await;

    assert_eq!(result.status, RunStatus::Suspended);
    // Nothing past the gate ran.
    assert!(calls_to(&h.log, "notify").is_empty());

    // The snapshot is self-contained and names the gate.
    let run = h.repo.run(&result.run_id);
    let state = run.engine_state.expect("suspended run keeps engine state");
    assert_eq!(state.pending_node_id, "review");
    assert!(state.step_results.contains_key("create"));
    assert_eq!(state.compensations.len(), 1);

    // Waiting step record, prompt interpolated from step results.
    let review = h.step(&result, "review");
    assert_eq!(review.status, StepStatus::Pending);
    assert_eq!(review.input.unwrap()["prompt"], json!("Confirm server srv-1"));

    // Resume with approval: run continues to completion.
    let resumed = h
        .engine
        .resume(
            result.run_id,
            ResumeInput {
                approved: true,
                reason: None,
            },
            Arc::new(ExternalToolsets::new()),
        )
        .await
        .unwrap();

    assert_eq!(resumed.status, RunStatus::Completed);
    assert_eq!(calls_to(&h.log, "notify").len(), 1);
    assert_eq!(h.step(&resumed, "review").status, StepStatus::Completed);
    assert!(h.repo.run(&result.run_id).engine_state.is_none());
}

#[tokio::test]
async fn rejected_approval_cancels_without_compensation() {
    let h = Harness::new();
    let def = approval_flow();
    let result = h.execute(&def, json!({})).await;
    assert_eq!(result.status, RunStatus::Suspended);

    let resumed = h
        .engine
        .resume(
            result.run_id,
            ResumeInput {
                approved: false,
                reason: Some("wrong shape requested".to_string()),
            },
            Arc::new(ExternalToolsets::new()),
        )
        .await
        .unwrap();

    assert_eq!(resumed.status, RunStatus::Cancelled);
    assert_eq!(resumed.error, Some("wrong shape requested".to_string()));
    // Rejection is a human decision: no compensation, no continuation.
    assert!(calls_to(&h.log, "deleteServer").is_empty());
    assert!(calls_to(&h.log, "notify").is_empty());

    let review = h.step(&resumed, "review");
    assert_eq!(review.status, StepStatus::Failed);
}

#[tokio::test]
async fn double_resume_loses_the_cas_race() {
    let h = Harness::new();
    let def = approval_flow();
    let result = h.execute(&def, json!({})).await;

    let first = h
        .engine
        .resume(
            result.run_id,
            ResumeInput {
                approved: true,
                reason: None,
            },
            Arc::new(ExternalToolsets::new()),
        )
        .await
        .unwrap();
    assert_eq!(first.status, RunStatus::Completed);

    // The run is no longer suspended; a second resume is a caller error.
    let second = h
        .engine
        .resume(
            result.run_id,
            ResumeInput {
                approved: true,
                reason: None,
            },
            Arc::new(ExternalToolsets::new()),
        )
        .await;
    assert!(matches!(second, Err(EngineError::InvalidState(_))));
}

// ---------------------------------------------------------------------------
// Invalid state transitions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn resume_on_completed_run_is_invalid_state() {
    let h = Harness::new();
    let def = published(
        vec![node("start", NodeData::Input {})],
        vec![],
    );
    let result = h.execute(&def, json!({})).await;
    assert_eq!(result.status, RunStatus::Completed);

    let err = h
        .engine
        .resume(
            result.run_id,
            ResumeInput {
                approved: true,
                reason: None,
            },
            Arc::new(ExternalToolsets::new()),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidState(_)));

    // The run was not mutated.
    assert_eq!(h.repo.run(&result.run_id).status, RunStatus::Completed);
}

#[tokio::test]
async fn cancel_on_failed_run_is_invalid_state() {
    let h = Harness::new();
    let def = published(
        vec![tool_node("boom", "breakThings", &[])],
        vec![],
    );
    let result = h.execute(&def, json!({})).await;
    assert_eq!(result.status, RunStatus::Failed);

    let err = h.engine.cancel(result.run_id).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidState(_)));
    assert_eq!(h.repo.run(&result.run_id).status, RunStatus::Failed);
}

#[tokio::test]
async fn cancel_suspended_run_is_permitted() {
    let h = Harness::new();
    let def = approval_flow();
    let result = h.execute(&def, json!({})).await;
    assert_eq!(result.status, RunStatus::Suspended);

    let cancelled = h.engine.cancel(result.run_id).await.unwrap();
    assert_eq!(cancelled.status, RunStatus::Cancelled);
    // Cancellation never compensates.
    assert!(calls_to(&h.log, "deleteServer").is_empty());
}

// ---------------------------------------------------------------------------
// Pre-execution rejection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cyclic_definition_never_starts_a_run() {
    let h = Harness::new();
    let def = published(
        vec![
            tool_node("a", "notify", &[]),
            tool_node("b", "notify", &[]),
        ],
        vec![edge("e1", "a", "b"), edge("e2", "b", "a")],
    );
    h.repo.insert_definition(def.clone());

    let err = h
        .engine
        .execute(def.id, json!({}), Arc::new(ExternalToolsets::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Graph(_)));
    assert!(h.repo.runs.lock().unwrap().is_empty(), "run never starts");
    assert!(h.log.lock().unwrap().is_empty());
}

#[tokio::test]
async fn draft_definition_is_not_executable() {
    let h = Harness::new();
    let mut def = published(vec![node("start", NodeData::Input {})], vec![]);
    def.status = DefinitionStatus::Draft;
    h.repo.insert_definition(def.clone());

    let err = h
        .engine
        .execute(def.id, json!({}), Arc::new(ExternalToolsets::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotPublished { .. }));
}

// ---------------------------------------------------------------------------
// Condition branching
// ---------------------------------------------------------------------------

#[tokio::test]
async fn inactive_condition_branch_is_skipped_not_executed() {
    let h = Harness::new();
    let def = published(
        vec![
            node("start", NodeData::Input {}),
            node(
                "check",
                NodeData::Condition {
                    expression: "start.flag == true".to_string(),
                },
            ),
            tool_node("when-true", "createServer", &[]),
            tool_node("when-false", "notify", &[]),
        ],
        vec![
            edge("e1", "start", "check"),
            branch_edge("e2", "check", "when-true", "true"),
            branch_edge("e3", "check", "when-false", "false"),
        ],
    );

    let result = h.execute(&def, json!({ "flag": false })).await;

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(h.step(&result, "check").output.unwrap(), json!({ "result": false }));
    assert_eq!(h.step(&result, "when-true").status, StepStatus::Skipped);
    assert_eq!(h.step(&result, "when-false").status, StepStatus::Completed);
    assert!(calls_to(&h.log, "createServer").is_empty());
    assert_eq!(calls_to(&h.log, "notify").len(), 1);
}

#[tokio::test]
async fn skip_propagates_through_downstream_nodes() {
    let h = Harness::new();
    let def = published(
        vec![
            node("start", NodeData::Input {}),
            node(
                "check",
                NodeData::Condition {
                    expression: "start.flag".to_string(),
                },
            ),
            tool_node("first", "createServer", &[]),
            tool_node("second", "notify", &[]),
        ],
        vec![
            edge("e1", "start", "check"),
            branch_edge("e2", "check", "first", "true"),
            edge("e3", "first", "second"),
        ],
    );

    let result = h.execute(&def, json!({ "flag": false })).await;

    assert_eq!(result.status, RunStatus::Completed);
    // `second` is reachable only through the skipped `first`.
    assert_eq!(h.step(&result, "first").status, StepStatus::Skipped);
    assert_eq!(h.step(&result, "second").status, StepStatus::Skipped);
    assert!(h.log.lock().unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Loops
// ---------------------------------------------------------------------------

#[tokio::test]
async fn loop_runs_body_per_item_and_accumulates() {
    let h = Harness::new();
    let def = published(
        vec![
            tool_node("seed", "listVolumes", &[]),
            node(
                "tag-all",
                NodeData::Loop {
                    items: "seed.volumes".to_string(),
                    body: vec!["tag-one".to_string()],
                },
            ),
            tool_node("tag-one", "tagVolume", &[("volume", json!("{{ item }}"))]),
        ],
        vec![edge("e1", "seed", "tag-all")],
    );

    let result = h.execute(&def, json!({})).await;

    assert_eq!(result.status, RunStatus::Completed);
    let tag_calls = calls_to(&h.log, "tagVolume");
    assert_eq!(
        tag_calls,
        vec![
            json!({ "volume": "v1" }),
            json!({ "volume": "v2" }),
            json!({ "volume": "v3" }),
        ]
    );

    let loop_step = h.step(&result, "tag-all");
    let output = loop_step.output.unwrap();
    assert_eq!(output["iterations"], json!(3));
    assert_eq!(output["results"][1]["tag-one"], json!({ "volume": "v2" }));

    // One step record per iteration of the body node.
    let body_steps: Vec<&WorkflowStep> = result
        .steps
        .iter()
        .filter(|s| s.node_id == "tag-one")
        .collect();
    assert_eq!(body_steps.len(), 3);
}

#[tokio::test]
async fn loop_over_non_array_fails_the_node() {
    let h = Harness::new();
    let def = published(
        vec![
            node("start", NodeData::Input {}),
            node(
                "tag-all",
                NodeData::Loop {
                    items: "start.missing".to_string(),
                    body: vec!["tag-one".to_string()],
                },
            ),
            tool_node("tag-one", "tagVolume", &[]),
        ],
        vec![edge("e1", "start", "tag-all")],
    );

    let result = h.execute(&def, json!({})).await;
    assert_eq!(result.status, RunStatus::Failed);
    assert!(result.error.unwrap().contains("did not resolve to an array"));
}

// ---------------------------------------------------------------------------
// Parallel fan-out
// ---------------------------------------------------------------------------

#[tokio::test]
async fn parallel_settles_all_branches_before_failing() {
    let h = Harness::new();
    let def = published(
        vec![
            node("start", NodeData::Input {}),
            node(
                "fan",
                NodeData::Parallel {
                    branches: vec![
                        vec!["b1".to_string()],
                        vec!["b2".to_string()],
                        vec!["b3".to_string()],
                    ],
                },
            ),
            tool_node("b1", "notify", &[]),
            tool_node("b2", "breakThings", &[]),
            tool_node("b3", "tagVolume", &[("volume", json!("v9"))]),
        ],
        vec![edge("e1", "start", "fan")],
    );

    let result = h.execute(&def, json!({})).await;

    assert_eq!(result.status, RunStatus::Failed);
    assert!(result.error.clone().unwrap().contains("branch 1 failed"));

    // All three branches settled: two successes and one failure.
    assert_eq!(h.step(&result, "b1").status, StepStatus::Completed);
    assert_eq!(h.step(&result, "b2").status, StepStatus::Failed);
    assert_eq!(h.step(&result, "b3").status, StepStatus::Completed);

    // The parallel node's record preserves every branch outcome.
    let fan = h.step(&result, "fan");
    assert_eq!(fan.status, StepStatus::Failed);
    let outcomes = fan.output.unwrap();
    let branches = outcomes["branches"].as_array().unwrap();
    assert_eq!(branches.len(), 3);
    assert_eq!(branches[0]["status"], json!("completed"));
    assert_eq!(branches[1]["status"], json!("failed"));
    assert_eq!(branches[2]["status"], json!("completed"));
}

#[tokio::test]
async fn parallel_branch_outputs_feed_downstream_nodes() {
    let h = Harness::new();
    let def = published(
        vec![
            node("start", NodeData::Input {}),
            node(
                "fan",
                NodeData::Parallel {
                    branches: vec![vec!["b1".to_string()], vec!["b2".to_string()]],
                },
            ),
            tool_node("b1", "createServer", &[]),
            tool_node("b2", "notify", &[]),
            tool_node("after", "tagVolume", &[("server", json!("{{ b1.id }}"))]),
            node("done", NodeData::Output { mapping: HashMap::new() }),
        ],
        vec![edge("e1", "start", "fan"), edge("e2", "fan", "after"), edge("e3", "after", "done")],
    );

    let result = h.execute(&def, json!({})).await;

    assert_eq!(result.status, RunStatus::Completed);
    // Downstream references a branch node's output.
    assert_eq!(calls_to(&h.log, "tagVolume"), vec![json!({ "server": "srv-1" })]);

    // A compensable tool inside a branch still records its ledger entry;
    // nothing failed, so it was never invoked.
    assert!(calls_to(&h.log, "deleteServer").is_empty());
}

#[tokio::test]
async fn parallel_branch_compensations_roll_back_on_later_failure() {
    let h = Harness::new();
    let def = published(
        vec![
            node("start", NodeData::Input {}),
            node(
                "fan",
                NodeData::Parallel {
                    branches: vec![vec!["b1".to_string()], vec!["b2".to_string()]],
                },
            ),
            tool_node("b1", "createServer", &[]),
            tool_node("b2", "notify", &[]),
            tool_node("boom", "breakThings", &[]),
        ],
        vec![edge("e1", "start", "fan"), edge("e2", "fan", "boom")],
    );

    let result = h.execute(&def, json!({})).await;

    assert_eq!(result.status, RunStatus::Failed);
    // The branch-recorded compensation ran during rollback.
    assert_eq!(calls_to(&h.log, "deleteServer").len(), 1);
}

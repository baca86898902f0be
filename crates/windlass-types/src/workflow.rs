//! Workflow domain types for Windlass.
//!
//! Defines the canonical representation of a workflow graph: nodes, edges,
//! and the definition that carries them. This module also contains execution
//! tracking types (`WorkflowRun`, `WorkflowStep`), the compensation entry
//! recorded for reversible steps, and the serialized engine state persisted
//! while a run is suspended at an approval gate.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Workflow Definition (canonical graph)
// ---------------------------------------------------------------------------

/// A workflow definition: a directed acyclic graph of nodes and edges.
///
/// Produced by the (out-of-scope) planner and persisted by the repository
/// layer. Only `Published` definitions are executable; the validator refuses
/// to publish a definition whose graph contains a cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// UUIDv7 assigned on first save.
    pub id: Uuid,
    /// Human-readable workflow name.
    pub name: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Publication status. Only `Published` definitions may run.
    pub status: DefinitionStatus,
    /// Monotonic definition version, bumped on each published revision.
    pub version: u32,
    /// The graph nodes. Node ids are unique within a definition.
    pub nodes: Vec<WorkflowNode>,
    /// The directed edges defining the partial execution order.
    pub edges: Vec<WorkflowEdge>,
    /// Optional JSON schema describing the expected run input. Only the
    /// top-level `required` key list is enforced by the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
}

/// Publication status of a workflow definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionStatus {
    Draft,
    Published,
    Archived,
}

// ---------------------------------------------------------------------------
// Nodes and edges
// ---------------------------------------------------------------------------

/// A single node in the workflow graph. Immutable once a run starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowNode {
    /// Planner-assigned node id (e.g. "provision-db"). Unique per definition.
    pub id: String,
    /// The kind of node.
    #[serde(rename = "type")]
    pub node_type: NodeType,
    /// Type-specific payload.
    pub data: NodeData,
}

/// The kind of node in a workflow graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Input,
    Tool,
    Condition,
    Loop,
    Approval,
    AiStep,
    Output,
    Parallel,
}

/// Node-type-specific configuration payload.
///
/// Internally tagged by `type` to match the planner's JSON:
/// ```json
/// { "type": "tool", "tool": "createInstance", "arguments": { ... } }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeData {
    /// Entry node: passes the run input through, optionally shape-checked
    /// against the definition's `input_schema`.
    Input {},
    /// Invoke a tool through the invocation bridge.
    Tool {
        /// Tool name, resolved against the built-in catalog and then the
        /// run's external toolsets.
        tool: String,
        /// Call arguments. A string value of the exact form
        /// `{{ dot.path }}` is resolved against prior step results;
        /// everything else is passed through as a literal.
        #[serde(default)]
        arguments: serde_json::Map<String, Value>,
    },
    /// Conditional branch point evaluated against accumulated step outputs.
    Condition {
        /// Restricted comparison expression (e.g. `check.status == "ok"`).
        expression: String,
    },
    /// Repeat a contained node sub-sequence per item of an iterable input.
    Loop {
        /// Dot path into prior step results resolving to a JSON array.
        items: String,
        /// Contained node ids executed once per item, in order. These nodes
        /// are excluded from the top-level walk.
        body: Vec<String>,
    },
    /// Human approval gate: execution suspends until `resume` is called.
    Approval {
        /// Prompt shown to the approver.
        prompt: String,
    },
    /// Delegated LLM step (summarization, drafting, etc.).
    AiStep {
        prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },
    /// Terminal node: maps step results into the run output.
    Output {
        /// Output key -> dot path into step results. An empty mapping
        /// emits the full step-results object.
        #[serde(default)]
        mapping: HashMap<String, String>,
    },
    /// Concurrent fan-out of contained branches with a settle-all join.
    Parallel {
        /// Contained node ids per branch. These nodes are excluded from
        /// the top-level walk.
        branches: Vec<Vec<String>>,
    },
}

/// A directed edge between two nodes.
///
/// Multiple edges may share a source (branching) or a target (joining).
/// A node cannot execute until every predecessor has completed or been
/// skipped by an inactive condition branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEdge {
    pub id: String,
    /// Source node id.
    pub source: String,
    /// Target node id.
    pub target: String,
    /// Branch label on edges leaving a condition node: `"true"` edges are
    /// active when the condition holds, `"false"` edges when it does not.
    /// Unlabeled edges follow the truthy branch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
}

// ---------------------------------------------------------------------------
// Run and step execution records
// ---------------------------------------------------------------------------

/// Overall status of a workflow run.
///
/// Lifecycle: `Pending -> Running -> {Completed | Failed | Cancelled}`,
/// with the non-terminal `Suspended` reachable from `Running` at an
/// approval gate and returning to `Running` on resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Suspended,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Whether this status permits no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

/// Status of an individual step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// One execution instance of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// UUIDv7 run id.
    pub id: Uuid,
    /// The definition being executed.
    pub definition_id: Uuid,
    /// Current run status.
    pub status: RunStatus,
    /// Caller-supplied run input.
    pub input: Value,
    /// Final output, written on completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Error message if the run failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Serialized executor state. Non-null only while `Suspended`; captures
    /// everything needed to resume, possibly from a different process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_state: Option<EngineState>,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Execution record for a single node within a run.
///
/// Created when the executor begins a node, mutated to a terminal status
/// when the node finishes; immutable thereafter. Used for audit and UI
/// progress display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// UUIDv7 step record id.
    pub id: Uuid,
    /// Parent run id.
    pub run_id: Uuid,
    /// Node id matching `WorkflowNode.id`. Repeats across loop iterations.
    pub node_id: String,
    /// Node type, denormalized for display.
    pub node_type: NodeType,
    /// 1-based position in execution order within the run.
    pub step_number: u32,
    /// Current step status.
    pub status: StepStatus,
    /// Resolved input passed to this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    /// Output produced by this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Error message if the step failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When step execution started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When step execution finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Wall-clock duration of the step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Compensation
// ---------------------------------------------------------------------------

/// A recorded inverse action for a successfully executed reversible step.
///
/// Appended by the executor immediately after an eligible tool step
/// succeeds; never mutated; consumed in reverse insertion order during
/// rollback. Only tools whose inverse is registered in the trusted catalog
/// ever produce an entry -- a planner-fabricated action name cannot reach
/// execution through the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationEntry {
    /// Node that produced the side effect.
    pub node_id: String,
    /// Tool that was executed.
    pub tool_name: String,
    /// Catalog-validated inverse action name.
    pub compensate_action: String,
    /// Arguments passed to the inverse action.
    pub compensate_args: Value,
}

// ---------------------------------------------------------------------------
// Engine state (suspension snapshot)
// ---------------------------------------------------------------------------

/// Current engine state format version. `resume` rejects a snapshot
/// persisted by a different engine version rather than misinterpreting it.
pub const ENGINE_STATE_VERSION: u32 = 1;

/// Serialized executor state captured when a run suspends.
///
/// Self-contained: a different process instance can re-hydrate this and
/// continue the walk without any in-memory carry-over.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineState {
    /// Format version, checked against `ENGINE_STATE_VERSION` on resume.
    pub version: u32,
    /// The approval node the run is suspended at.
    pub pending_node_id: String,
    /// Step outputs accumulated so far, keyed by node id.
    pub step_results: HashMap<String, Value>,
    /// Compensation ledger contents at suspension time.
    pub compensations: Vec<CompensationEntry>,
    /// Node ids already marked skipped by inactive condition branches.
    pub skipped: Vec<String>,
    /// Edge ids deactivated by already-evaluated condition nodes. Needed so
    /// skip propagation keeps working for nodes visited after resume.
    pub inactive_edges: Vec<String>,
    /// Next 1-based step number to assign.
    pub next_step_number: u32,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

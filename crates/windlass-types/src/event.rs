//! Event types for the Windlass streaming notifier.
//!
//! `WorkflowEvent` is the unified event type broadcast during workflow
//! execution. All variants are Clone + Send + Sync for use with tokio
//! broadcast channels. Events are observational only -- consumers (UI,
//! logging) must never be on the correctness path of a run.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::NodeType;

/// Events emitted during workflow run execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// A run has transitioned to `Running`.
    RunStarted { run_id: Uuid, definition_id: Uuid },

    /// A run has completed successfully.
    RunCompleted { run_id: Uuid, duration_ms: u64 },

    /// A run has failed; compensation has already been attempted.
    RunFailed { run_id: Uuid, error: String },

    /// A run has suspended at an approval gate.
    RunSuspended {
        run_id: Uuid,
        node_id: String,
        prompt: String,
    },

    /// A run has been cancelled.
    RunCancelled { run_id: Uuid, reason: String },

    /// A node has started executing.
    StepStarted {
        run_id: Uuid,
        node_id: String,
        node_type: NodeType,
    },

    /// A node completed successfully.
    StepCompleted {
        run_id: Uuid,
        node_id: String,
        node_type: NodeType,
        duration_ms: u64,
        payload: serde_json::Value,
    },

    /// A node failed.
    StepFailed {
        run_id: Uuid,
        node_id: String,
        node_type: NodeType,
        error: String,
    },

    /// A node was skipped by an inactive condition branch.
    StepSkipped {
        run_id: Uuid,
        node_id: String,
        node_type: NodeType,
    },
}

//! Workflow definition validation.
//!
//! Structural checks run at authoring time, before a definition may be
//! published: unique node ids, valid edge endpoints, valid container
//! references, and acyclicity via the DFS-based [`detect_cycles`] --
//! deliberately independent of the executor's Kahn-based check so
//! authoring feedback does not share a code path with execution.

use std::collections::HashSet;

use thiserror::Error;
use windlass_types::workflow::{NodeData, WorkflowDefinition};

use super::graph::detect_cycles;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised by definition validation.
#[derive(Debug, Error)]
pub enum DefinitionError {
    /// Structural validation failure.
    #[error("validation error: {0}")]
    Validation(String),

    /// An edge or container references an unknown node id.
    #[error("unknown node: {0}")]
    UnknownNode(String),

    /// The node/edge set contains a cycle.
    #[error("cycle detected: {0}")]
    CycleDetected(String),
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a `WorkflowDefinition`.
///
/// Checks:
/// - Name is non-empty and contains only alphanumeric characters and hyphens
/// - At least one node exists
/// - All node ids are unique
/// - All edge endpoints reference existing nodes
/// - Loop bodies and parallel branches reference existing nodes, and no
///   node is contained by more than one container
/// - The graph is acyclic
///
/// The publish path must run this before flipping a definition to
/// `Published`; the executor independently refuses cyclic graphs at run
/// time.
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), DefinitionError> {
    if def.name.is_empty() {
        return Err(DefinitionError::Validation(
            "workflow name must not be empty".to_string(),
        ));
    }
    if !def.name.chars().all(|c| c.is_alphanumeric() || c == '-') {
        return Err(DefinitionError::Validation(format!(
            "workflow name '{}' contains invalid characters (only alphanumeric and hyphens allowed)",
            def.name
        )));
    }

    if def.nodes.is_empty() {
        return Err(DefinitionError::Validation(
            "workflow must have at least one node".to_string(),
        ));
    }

    // Unique node ids
    let mut seen_ids = HashSet::new();
    for node in &def.nodes {
        if !seen_ids.insert(node.id.as_str()) {
            return Err(DefinitionError::Validation(format!(
                "duplicate node id: '{}'",
                node.id
            )));
        }
    }

    // Edge endpoints must exist
    for edge in &def.edges {
        for endpoint in [&edge.source, &edge.target] {
            if !seen_ids.contains(endpoint.as_str()) {
                return Err(DefinitionError::UnknownNode(format!(
                    "edge '{}' references unknown node '{}'",
                    edge.id, endpoint
                )));
            }
        }
    }

    // Container references must exist and not overlap
    let mut contained = HashSet::new();
    for node in &def.nodes {
        let referenced: Vec<&str> = match &node.data {
            NodeData::Loop { body, .. } => body.iter().map(String::as_str).collect(),
            NodeData::Parallel { branches } => branches
                .iter()
                .flat_map(|b| b.iter().map(String::as_str))
                .collect(),
            _ => continue,
        };

        for id in referenced {
            if !seen_ids.contains(id) {
                return Err(DefinitionError::UnknownNode(format!(
                    "container '{}' references unknown node '{}'",
                    node.id, id
                )));
            }
            if !contained.insert(id) {
                return Err(DefinitionError::Validation(format!(
                    "node '{id}' is contained by more than one container"
                )));
            }
            if id == node.id {
                return Err(DefinitionError::Validation(format!(
                    "container '{id}' cannot contain itself"
                )));
            }
        }
    }

    if detect_cycles(&def.nodes, &def.edges) {
        return Err(DefinitionError::CycleDetected(format!(
            "workflow '{}' contains a cycle",
            def.name
        )));
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Graph utilities: adjacency construction, topological sort, cycle detection.
//!
//! Pure functions over a definition's node/edge lists. The executor orders
//! a run with `topological_sort` (Kahn's algorithm, FIFO ready queue --
//! the dequeue order among equal-rank nodes is stable for reproducibility);
//! the definition validator uses the independent DFS-based `detect_cycles`
//! so authoring-time feedback does not depend on the execution path.

use std::collections::{HashMap, VecDeque};

use thiserror::Error;
use windlass_types::workflow::{WorkflowEdge, WorkflowNode};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors produced by graph construction and ordering.
#[derive(Debug, Error)]
pub enum GraphError {
    /// The node/edge set is not a DAG.
    #[error("cycle detected: workflow graph is not acyclic ({0})")]
    Cycle(String),

    /// An edge references a node id that does not exist.
    #[error("edge '{edge_id}' references unknown node '{node_id}'")]
    UnknownNode { edge_id: String, node_id: String },
}

// ---------------------------------------------------------------------------
// Adjacency
// ---------------------------------------------------------------------------

/// Build forward adjacency lists and in-degree counts for the graph.
///
/// Every node starts with an empty neighbor list and zero in-degree; each
/// edge then appends `target` to `source`'s neighbors and increments
/// `target`'s in-degree. O(N + E).
pub fn build_adjacency(
    nodes: &[WorkflowNode],
    edges: &[WorkflowEdge],
) -> Result<(HashMap<String, Vec<String>>, HashMap<String, usize>), GraphError> {
    let mut adjacency: HashMap<String, Vec<String>> = nodes
        .iter()
        .map(|n| (n.id.clone(), Vec::new()))
        .collect();
    let mut in_degree: HashMap<String, usize> =
        nodes.iter().map(|n| (n.id.clone(), 0)).collect();

    for edge in edges {
        if !adjacency.contains_key(&edge.source) {
            return Err(GraphError::UnknownNode {
                edge_id: edge.id.clone(),
                node_id: edge.source.clone(),
            });
        }
        let degree = in_degree
            .get_mut(&edge.target)
            .ok_or_else(|| GraphError::UnknownNode {
                edge_id: edge.id.clone(),
                node_id: edge.target.clone(),
            })?;
        *degree += 1;
        adjacency
            .get_mut(&edge.source)
            .expect("source presence checked above")
            .push(edge.target.clone());
    }

    Ok((adjacency, in_degree))
}

/// Group incoming edges by target node id.
///
/// Used by the executor to decide whether a node is reachable through at
/// least one active branch.
pub fn incoming_edges<'a>(
    edges: &'a [WorkflowEdge],
) -> HashMap<&'a str, Vec<&'a WorkflowEdge>> {
    let mut incoming: HashMap<&str, Vec<&WorkflowEdge>> = HashMap::new();
    for edge in edges {
        incoming.entry(edge.target.as_str()).or_default().push(edge);
    }
    incoming
}

// ---------------------------------------------------------------------------
// Topological sort (Kahn)
// ---------------------------------------------------------------------------

/// Order the nodes so that every edge's source precedes its target.
///
/// Kahn's algorithm with a FIFO ready queue seeded in node-list order:
/// nodes of equal topological rank dequeue in the order they appear in the
/// definition. Callers must not rely on that tie-break for correctness,
/// but it is stable so runs are reproducible.
///
/// Fails with [`GraphError::Cycle`] when fewer nodes come out than went in
/// -- the sole cycle-detection path used before execution.
pub fn topological_sort<'a>(
    nodes: &'a [WorkflowNode],
    edges: &[WorkflowEdge],
) -> Result<Vec<&'a WorkflowNode>, GraphError> {
    let (adjacency, mut in_degree) = build_adjacency(nodes, edges)?;
    let node_by_id: HashMap<&str, &WorkflowNode> =
        nodes.iter().map(|n| (n.id.as_str(), n)).collect();

    let mut queue: VecDeque<&str> = nodes
        .iter()
        .filter(|n| in_degree[&n.id] == 0)
        .map(|n| n.id.as_str())
        .collect();

    let mut ordered = Vec::with_capacity(nodes.len());
    while let Some(id) = queue.pop_front() {
        ordered.push(node_by_id[id]);
        for neighbor in &adjacency[id] {
            let degree = in_degree
                .get_mut(neighbor)
                .expect("adjacency targets validated during construction");
            *degree -= 1;
            if *degree == 0 {
                queue.push_back(neighbor.as_str());
            }
        }
    }

    if ordered.len() < nodes.len() {
        let stuck: Vec<&str> = nodes
            .iter()
            .filter(|n| in_degree[&n.id] > 0)
            .map(|n| n.id.as_str())
            .collect();
        return Err(GraphError::Cycle(format!(
            "nodes never became ready: {}",
            stuck.join(", ")
        )));
    }

    Ok(ordered)
}

// ---------------------------------------------------------------------------
// Cycle detection (three-color DFS)
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Whether the node/edge set contains a cycle, including self-loops.
///
/// Iterative DFS with the classic three-color scheme: an edge back to a
/// gray (in-progress) node is a cycle. Edges referencing unknown node ids
/// are ignored here -- the definition validator reports those separately.
pub fn detect_cycles(nodes: &[WorkflowNode], edges: &[WorkflowEdge]) -> bool {
    let mut adjacency: HashMap<&str, Vec<&str>> =
        nodes.iter().map(|n| (n.id.as_str(), Vec::new())).collect();
    for edge in edges {
        if adjacency.contains_key(edge.target.as_str()) {
            if let Some(neighbors) = adjacency.get_mut(edge.source.as_str()) {
                neighbors.push(edge.target.as_str());
            }
        }
    }

    let mut colors: HashMap<&str, Color> =
        nodes.iter().map(|n| (n.id.as_str(), Color::White)).collect();

    for start in nodes {
        if colors[start.id.as_str()] != Color::White {
            continue;
        }

        // Stack of (node, next-neighbor-index) frames.
        let mut stack: Vec<(&str, usize)> = vec![(start.id.as_str(), 0)];
        colors.insert(start.id.as_str(), Color::Gray);

        while let Some(frame) = stack.last_mut() {
            let id = frame.0;
            let neighbors = &adjacency[id];
            if frame.1 < neighbors.len() {
                let neighbor = neighbors[frame.1];
                frame.1 += 1;
                match colors[neighbor] {
                    Color::Gray => return true,
                    Color::White => {
                        colors.insert(neighbor, Color::Gray);
                        stack.push((neighbor, 0));
                    }
                    Color::Black => {}
                }
            } else {
                colors.insert(id, Color::Black);
                stack.pop();
            }
        }
    }

    false
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

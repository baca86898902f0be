//! Workflow engine core: graph algorithms, safe evaluation, compensation,
//! and DAG execution.
//!
//! - `graph` -- adjacency construction, Kahn topological sort, cycle detection
//! - `path` -- denylisted property-path resolution over step results
//! - `expression` -- restricted comparison evaluator for condition nodes
//! - `definition` -- authoring-time structural validation
//! - `compensation` -- ordered ledger of reversible actions, LIFO rollback
//! - `executor` -- the run state machine: execute, suspend/resume, cancel

pub mod compensation;
pub mod definition;
pub mod executor;
pub mod expression;
pub mod graph;
pub mod path;

//! Shared domain types for Windlass.
//!
//! This crate contains the core domain types used across the Windlass
//! workflow engine: workflow definitions (nodes and edges), run and step
//! execution records, compensation entries, engine suspension state, and
//! streaming events.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod error;
pub mod event;
pub mod workflow;

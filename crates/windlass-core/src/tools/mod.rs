//! Tool invocation: the capability trait, the trusted catalog, external
//! toolsets, and the timeout-bounded bridge.
//!
//! A "tool" is an arbitrary side-effecting callable (cloud API call,
//! notification, etc.) supplied by collaborators. The engine only ever
//! reaches one through [`bridge::ToolBridge`], which resolves the declared
//! name against the built-in catalog first and a per-run external toolset
//! map second -- an unresolvable name fails before any side effect.

pub mod bridge;
pub mod catalog;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use self::catalog::ExternalToolsets;

/// Object-safe capability interface implemented by every invokable tool.
///
/// Boxed futures keep the trait dyn-compatible; both the sealed built-in
/// catalog and externally supplied toolsets implement this one trait, so
/// the bridge dispatches polymorphically with no reflection.
pub trait ToolHandler: Send + Sync {
    fn execute<'a>(
        &'a self,
        args: Value,
        ctx: &'a ToolContext,
    ) -> Pin<Box<dyn Future<Output = Result<Value, anyhow::Error>> + Send + 'a>>;
}

/// Per-invocation context handed to tool handlers and the bridge.
#[derive(Clone)]
pub struct ToolContext {
    /// The run this invocation belongs to.
    pub run_id: Uuid,
    /// The node being executed.
    pub node_id: String,
    /// External toolsets attached to this run by the (out-of-scope)
    /// provider, already connected and ready.
    pub external: Arc<ExternalToolsets>,
}

impl ToolContext {
    pub fn new(run_id: Uuid, node_id: impl Into<String>, external: Arc<ExternalToolsets>) -> Self {
        Self {
            run_id,
            node_id: node_id.into(),
            external,
        }
    }
}

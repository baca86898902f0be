//! The tool invocation bridge.
//!
//! Resolves a declared tool name against the built-in catalog and then the
//! run's external toolsets, and races the invocation against a bounded
//! timeout. Resolution happens before any execution side effect, so an
//! upstream planner cannot fabricate a name that reaches a live call. The
//! bridge performs no retries -- retry policy, if any, belongs to the
//! caller.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use super::catalog::ToolCatalog;
use super::ToolContext;

/// Default bound on a single tool invocation.
pub const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 30;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised by the invocation bridge. All variants are step failures
/// that trigger compensation rollback in the executor.
#[derive(Debug, Error)]
pub enum ToolError {
    /// The declared name resolved in neither registry.
    #[error("tool not found: '{0}'")]
    NotFound(String),

    /// The invocation exceeded the bridge timeout.
    #[error("tool '{name}' timed out after {timeout_secs}s")]
    Timeout { name: String, timeout_secs: u64 },

    /// The handler itself failed.
    #[error("tool '{name}' failed: {message}")]
    Failed { name: String, message: String },
}

// ---------------------------------------------------------------------------
// ToolBridge
// ---------------------------------------------------------------------------

/// Resolves and invokes tools with a bounded timeout.
pub struct ToolBridge {
    catalog: Arc<ToolCatalog>,
    timeout: Duration,
}

impl ToolBridge {
    /// Create a bridge with the default 30s invocation timeout.
    pub fn new(catalog: Arc<ToolCatalog>) -> Self {
        Self::with_timeout(catalog, Duration::from_secs(DEFAULT_TOOL_TIMEOUT_SECS))
    }

    /// Create a bridge with a custom invocation timeout.
    pub fn with_timeout(catalog: Arc<ToolCatalog>, timeout: Duration) -> Self {
        Self { catalog, timeout }
    }

    /// The trusted catalog backing this bridge.
    pub fn catalog(&self) -> &ToolCatalog {
        &self.catalog
    }

    /// Resolve `name` and invoke it with `args`.
    ///
    /// Resolution order: built-in catalog by exact name, then the run
    /// context's external toolset map (`server__tool` qualified names).
    pub async fn invoke(
        &self,
        name: &str,
        args: Value,
        ctx: &ToolContext,
    ) -> Result<Value, ToolError> {
        let handler = self
            .catalog
            .get(name)
            .or_else(|| ctx.external.get(name))
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;

        tracing::debug!(
            run_id = %ctx.run_id,
            node_id = ctx.node_id.as_str(),
            tool = name,
            "invoking tool"
        );

        match tokio::time::timeout(self.timeout, handler.execute(args, ctx)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(ToolError::Failed {
                name: name.to_string(),
                message: e.to_string(),
            }),
            Err(_elapsed) => Err(ToolError::Timeout {
                name: name.to_string(),
                timeout_secs: self.timeout.as_secs(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

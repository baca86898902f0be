//! Tool registries: the trusted built-in catalog and per-run external
//! toolsets.
//!
//! The catalog is the only source of compensation eligibility: a tool gets
//! a compensation entry only when the catalog declares an inverse action
//! for it AND that inverse name is itself registered. Inverse names are
//! registry data, never planner or user input -- this closes the injection
//! vector where a fabricated "compensate" action name could reach
//! execution during rollback.

use std::collections::HashMap;
use std::sync::Arc;

use super::ToolHandler;

// ---------------------------------------------------------------------------
// Built-in catalog
// ---------------------------------------------------------------------------

struct CatalogEntry {
    handler: Arc<dyn ToolHandler>,
    /// Declared inverse action name (e.g. `deleteInstance` for
    /// `createInstance`). Consulted by compensation eligibility.
    inverse: Option<String>,
}

/// The trusted, sealed tool registry.
#[derive(Default)]
pub struct ToolCatalog {
    tools: HashMap<String, CatalogEntry>,
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool with no declared inverse.
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn ToolHandler>) {
        self.tools.insert(
            name.into(),
            CatalogEntry {
                handler,
                inverse: None,
            },
        );
    }

    /// Register a tool and declare its inverse action name.
    ///
    /// The inverse is only honored once a tool of that name is also
    /// registered -- see [`ToolCatalog::inverse_action`].
    pub fn register_with_inverse(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn ToolHandler>,
        inverse: impl Into<String>,
    ) {
        self.tools.insert(
            name.into(),
            CatalogEntry {
                handler,
                inverse: Some(inverse.into()),
            },
        );
    }

    /// Look up a registered handler by exact name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.tools.get(name).map(|e| Arc::clone(&e.handler))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// The registry-validated inverse action for a tool, if any.
    ///
    /// Returns the declared inverse only when the inverse itself resolves
    /// in this catalog; a dangling declaration yields `None`, so no
    /// compensation entry is ever recorded for it.
    pub fn inverse_action(&self, name: &str) -> Option<&str> {
        let inverse = self.tools.get(name)?.inverse.as_deref()?;
        if self.tools.contains_key(inverse) {
            Some(inverse)
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// External toolsets
// ---------------------------------------------------------------------------

/// Dynamically attached toolsets supplied per run context.
///
/// Names are namespaced `server__tool` to avoid collisions between
/// servers. The bridge falls back to this map only after the built-in
/// catalog misses; entries are never eligible for compensation.
#[derive(Default)]
pub struct ExternalToolsets {
    tools: HashMap<String, Arc<dyn ToolHandler>>,
}

impl ExternalToolsets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a tool under its server namespace.
    pub fn attach(&mut self, server: &str, tool: &str, handler: Arc<dyn ToolHandler>) {
        self.tools.insert(Self::qualify(server, tool), handler);
    }

    /// Look up a handler by its fully qualified `server__tool` name.
    pub fn get(&self, qualified_name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.tools.get(qualified_name).map(Arc::clone)
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// The qualified name for a server-scoped tool.
    pub fn qualify(server: &str, tool: &str) -> String {
        format!("{server}__{tool}")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

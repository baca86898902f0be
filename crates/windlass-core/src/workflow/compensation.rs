//! Compensation ledger: ordered record of reversible actions and LIFO
//! best-effort rollback (the saga pattern).
//!
//! The executor appends one entry per successfully executed tool step
//! whose inverse is registered in the trusted catalog. On an unrecoverable
//! failure the ledger is replayed in reverse through the same invocation
//! bridge used forward. A failure during compensation is logged and
//! swallowed per entry -- rollback is best-effort and must neither mask
//! the original failure nor abort the remaining entries.

use std::sync::Arc;

use uuid::Uuid;
use windlass_types::workflow::CompensationEntry;

use crate::tools::bridge::ToolBridge;
use crate::tools::catalog::ExternalToolsets;
use crate::tools::ToolContext;

// ---------------------------------------------------------------------------
// CompensationLedger
// ---------------------------------------------------------------------------

/// Ordered record of reversible actions taken during a run.
///
/// Owned exclusively by the executor instance driving one execution; it is
/// never shared across concurrent runs.
#[derive(Debug, Default, Clone)]
pub struct CompensationLedger {
    entries: Vec<CompensationEntry>,
}

impl CompensationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore a ledger from a suspension snapshot.
    pub fn from_entries(entries: Vec<CompensationEntry>) -> Self {
        Self { entries }
    }

    /// Append an entry. O(1), never rejects.
    pub fn add(&mut self, entry: CompensationEntry) {
        self.entries.push(entry);
    }

    /// Read-only snapshot in insertion order.
    pub fn entries(&self) -> &[CompensationEntry] {
        &self.entries
    }

    /// Cheap check to skip rollback entirely for runs with no reversible
    /// steps.
    pub fn has_compensations(&self) -> bool {
        !self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Consume the ledger for a suspension snapshot.
    pub fn into_entries(self) -> Vec<CompensationEntry> {
        self.entries
    }
}

// ---------------------------------------------------------------------------
// Rollback
// ---------------------------------------------------------------------------

/// Result of a rollback pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollbackOutcome {
    /// Entries replayed (all of them, regardless of individual failures).
    pub attempted: usize,
    /// Entries whose inverse action succeeded.
    pub succeeded: usize,
}

/// Replay the ledger in reverse insertion order through the bridge.
///
/// Every entry is attempted: a per-entry failure is logged and swallowed
/// so later (earlier-recorded) entries still run.
pub async fn rollback(
    ledger: &CompensationLedger,
    bridge: &ToolBridge,
    run_id: Uuid,
    external: Arc<ExternalToolsets>,
) -> RollbackOutcome {
    let mut succeeded = 0;

    for entry in ledger.entries().iter().rev() {
        let ctx = ToolContext::new(run_id, entry.node_id.clone(), Arc::clone(&external));
        match bridge
            .invoke(&entry.compensate_action, entry.compensate_args.clone(), &ctx)
            .await
        {
            Ok(_) => {
                tracing::debug!(
                    run_id = %run_id,
                    node_id = entry.node_id.as_str(),
                    action = entry.compensate_action.as_str(),
                    "compensation applied"
                );
                succeeded += 1;
            }
            Err(e) => {
                tracing::warn!(
                    run_id = %run_id,
                    node_id = entry.node_id.as_str(),
                    action = entry.compensate_action.as_str(),
                    error = %e,
                    "compensation failed, continuing rollback"
                );
            }
        }
    }

    RollbackOutcome {
        attempted: ledger.len(),
        succeeded,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

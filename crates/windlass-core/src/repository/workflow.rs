//! Workflow repository trait definition.
//!
//! Defines the storage interface for workflow definitions, execution runs,
//! and step records. The infrastructure layer implements this trait; the
//! engine only ever talks to the port.
//!
//! Uses native async fn in traits (RPITIT), no async_trait macro.

use uuid::Uuid;
use windlass_types::error::RepositoryError;
use windlass_types::workflow::{
    RunStatus, WorkflowDefinition, WorkflowRun, WorkflowStep,
};

/// Repository trait for workflow persistence.
///
/// Covers three entity families:
/// - **Definitions:** read access for the executor (authoring CRUD lives
///   with the out-of-scope portal layer).
/// - **Runs:** create/update/query workflow execution instances. Status
///   transitions go through [`WorkflowRepository::transition_run_status`],
///   a compare-and-set: the store must apply the change atomically only
///   when the run is currently in one of the expected states. This is how
///   the "one active execution per run" invariant is enforced -- two
///   processes racing to resume the same suspended run cannot both win
///   the `Suspended -> Running` transition.
/// - **Steps:** create/update/query individual step execution records.
pub trait WorkflowRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Get a workflow definition by its UUID.
    fn get_definition(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Create a new workflow run record.
    fn create_run(
        &self,
        run: &WorkflowRun,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a workflow run by its UUID.
    fn get_run(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowRun>, RepositoryError>> + Send;

    /// Replace a run record wholesale (output, engine state, timestamps).
    fn update_run(
        &self,
        run: &WorkflowRun,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Atomically transition a run's status.
    ///
    /// Applies `to` (and the optional error message) only when the run's
    /// current status is one of `from`; returns `false` without mutating
    /// anything otherwise.
    fn transition_run_status(
        &self,
        run_id: &Uuid,
        from: &[RunStatus],
        to: RunStatus,
        error: Option<&str>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    /// Create a new step execution record.
    fn create_step(
        &self,
        step: &WorkflowStep,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Replace a step record (terminal status, output, error, timing).
    fn update_step(
        &self,
        step: &WorkflowStep,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// List all step records for a run, ordered by step number.
    fn list_steps(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowStep>, RepositoryError>> + Send;
}

//! Pluggable persistence for orchestration state.
//!
//! The [`RunStore`] trait is the persistence handle the orchestrator and
//! scheduler share: runs, call records, schedule entries and asset
//! reservations.
//!
//! ## Design Principles
//!
//! - **Atomic methods**: each method is its own unit of work
//! - **CAS semantics**: schedule entry status changes use compare-and-swap, so
//!   concurrent admission, dispatch and cancellation cannot double-apply
//! - **Append-only runs**: runs are saved, never deleted

pub mod memory;

use async_trait::async_trait;

use workcell_core::{CallId, RunId};

use crate::call::CallRecord;
use crate::error::Result;
use crate::run::Run;
use crate::scheduler::{AssetReservation, EntryPatch, ScheduleEntry, ScheduleStatus};

/// Result of a compare-and-swap operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasResult {
    /// Operation succeeded.
    Success,
    /// Entity not found.
    NotFound,
    /// State didn't match expected value.
    StateMismatch {
        /// The actual state that was found.
        actual: ScheduleStatus,
    },
}

impl CasResult {
    /// Returns true if the operation succeeded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Returns true if the entity was not found.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

/// Persistence handle for runs, calls, schedule entries and reservations.
///
/// ## Thread Safety
///
/// All methods are `Send + Sync`; runs on different tasks share one store.
#[async_trait]
pub trait RunStore: Send + Sync {
    // --- Runs ---

    /// Inserts a new run. Fails if the ID already exists.
    async fn insert_run(&self, run: &Run) -> Result<()>;

    /// Gets a run by ID.
    async fn get_run(&self, run_id: &RunId) -> Result<Option<Run>>;

    /// Replaces a stored run.
    async fn save_run(&self, run: &Run) -> Result<()>;

    /// Lists runs, oldest first.
    async fn list_runs(&self) -> Result<Vec<Run>>;

    // --- Call records ---

    /// Inserts an open call record.
    async fn insert_call(&self, call: &CallRecord) -> Result<()>;

    /// Replaces a call record. Closed records are immutable.
    async fn update_call(&self, call: &CallRecord) -> Result<()>;

    /// Gets a call record.
    async fn get_call(&self, call_id: &CallId) -> Result<Option<CallRecord>>;

    /// Lists a run's call records ordered by sequence.
    async fn list_calls(&self, run_id: &RunId) -> Result<Vec<CallRecord>>;

    // --- Schedule entries ---

    /// Inserts a schedule entry. Fails if the run already has one.
    async fn insert_schedule_entry(&self, entry: &ScheduleEntry) -> Result<()>;

    /// Gets the schedule entry of a run.
    async fn get_schedule_entry(&self, run_id: &RunId) -> Result<Option<ScheduleEntry>>;

    /// Lists schedule entries, optionally filtered by status.
    async fn list_schedule_entries(
        &self,
        status: Option<ScheduleStatus>,
    ) -> Result<Vec<ScheduleEntry>>;

    /// Atomically moves an entry from `expected` to `target`, applying `patch`.
    async fn transition_schedule_entry(
        &self,
        run_id: &RunId,
        expected: ScheduleStatus,
        target: ScheduleStatus,
        patch: EntryPatch,
    ) -> Result<CasResult>;

    /// Sets the priority of an entry that has not been dispatched.
    ///
    /// Returns `StateMismatch` for dispatched or finished entries.
    async fn update_schedule_priority(&self, run_id: &RunId, priority: u8) -> Result<CasResult>;

    // --- Reservations ---

    /// Inserts or replaces the reservation of `owner_run` on its asset.
    async fn save_reservation(&self, reservation: &AssetReservation) -> Result<()>;

    /// Lists the reservations of a run.
    async fn list_reservations(&self, run_id: &RunId) -> Result<Vec<AssetReservation>>;

    /// Lists every RESERVED or ACTIVE reservation.
    async fn list_live_reservations(&self) -> Result<Vec<AssetReservation>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cas_result_predicates() {
        assert!(CasResult::Success.is_success());
        assert!(!CasResult::NotFound.is_success());
        assert!(
            !CasResult::StateMismatch {
                actual: ScheduleStatus::Running
            }
            .is_success()
        );
        assert!(CasResult::NotFound.is_not_found());
        assert!(!CasResult::Success.is_not_found());
    }
}

//! In-memory store implementation for testing.
//!
//! This module provides [`InMemoryStore`], a simple in-memory implementation of
//! the [`RunStore`] trait suitable for testing, development and the demo binary.
//!
//! ## Limitations
//!
//! - **Single-process only**: state is not shared across process boundaries
//! - **No persistence**: all state is lost when the process exits

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::Utc;

use workcell_core::{CallId, RunId};

use super::{CasResult, RunStore};
use crate::call::CallRecord;
use crate::error::{Error, Result};
use crate::run::Run;
use crate::scheduler::{AssetReservation, EntryPatch, ScheduleEntry, ScheduleStatus};

#[derive(Debug, Default)]
struct Tables {
    runs: HashMap<RunId, Run>,
    calls: HashMap<CallId, CallRecord>,
    entries: HashMap<RunId, ScheduleEntry>,
    reservations: HashMap<RunId, Vec<AssetReservation>>,
    next_submission: u64,
}

/// In-memory store for testing.
///
/// All tables live behind one `RwLock`, which makes every method atomic.
///
/// ## Example
///
/// ```rust
/// use workcell_flow::store::memory::InMemoryStore;
///
/// let store = InMemoryStore::new();
/// assert_eq!(store.run_count().unwrap(), 0);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

/// Converts a lock poison error to a persistence error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::persistence("lock poisoned")
}

impl InMemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of runs currently stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn run_count(&self) -> Result<usize> {
        Ok(self.tables.read().map_err(poison_err)?.runs.len())
    }
}

#[async_trait]
impl RunStore for InMemoryStore {
    async fn insert_run(&self, run: &Run) -> Result<()> {
        let mut tables = self.tables.write().map_err(poison_err)?;
        if tables.runs.contains_key(&run.id) {
            return Err(Error::persistence(format!("run {} already exists", run.id)));
        }
        tables.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: &RunId) -> Result<Option<Run>> {
        let tables = self.tables.read().map_err(poison_err)?;
        Ok(tables.runs.get(run_id).cloned())
    }

    async fn save_run(&self, run: &Run) -> Result<()> {
        let mut tables = self.tables.write().map_err(poison_err)?;
        match tables.runs.get_mut(&run.id) {
            Some(stored) => {
                *stored = run.clone();
                Ok(())
            }
            None => Err(Error::RunNotFound { run_id: run.id }),
        }
    }

    async fn list_runs(&self) -> Result<Vec<Run>> {
        let tables = self.tables.read().map_err(poison_err)?;
        let mut runs: Vec<Run> = tables.runs.values().cloned().collect();
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(runs)
    }

    async fn insert_call(&self, call: &CallRecord) -> Result<()> {
        let mut tables = self.tables.write().map_err(poison_err)?;
        if tables.calls.contains_key(&call.call_id) {
            return Err(Error::persistence(format!(
                "call {} already exists",
                call.call_id
            )));
        }
        tables.calls.insert(call.call_id, call.clone());
        Ok(())
    }

    async fn update_call(&self, call: &CallRecord) -> Result<()> {
        let mut tables = self.tables.write().map_err(poison_err)?;
        match tables.calls.get_mut(&call.call_id) {
            Some(stored) if stored.is_closed() => Err(Error::persistence(format!(
                "call {} is closed",
                call.call_id
            ))),
            Some(stored) => {
                *stored = call.clone();
                Ok(())
            }
            None => Err(Error::persistence(format!("call {} not found", call.call_id))),
        }
    }

    async fn get_call(&self, call_id: &CallId) -> Result<Option<CallRecord>> {
        let tables = self.tables.read().map_err(poison_err)?;
        Ok(tables.calls.get(call_id).cloned())
    }

    async fn list_calls(&self, run_id: &RunId) -> Result<Vec<CallRecord>> {
        let tables = self.tables.read().map_err(poison_err)?;
        let mut calls: Vec<CallRecord> = tables
            .calls
            .values()
            .filter(|c| c.run_id == *run_id)
            .cloned()
            .collect();
        calls.sort_by_key(|c| c.sequence);
        Ok(calls)
    }

    async fn insert_schedule_entry(&self, entry: &ScheduleEntry) -> Result<()> {
        let mut tables = self.tables.write().map_err(poison_err)?;
        if tables.entries.contains_key(&entry.run_id) {
            return Err(Error::InvalidInput(format!(
                "run {} already has a schedule entry",
                entry.run_id
            )));
        }
        tables.next_submission += 1;
        let mut entry = entry.clone();
        entry.submission_seq = tables.next_submission;
        tables.entries.insert(entry.run_id, entry);
        Ok(())
    }

    async fn get_schedule_entry(&self, run_id: &RunId) -> Result<Option<ScheduleEntry>> {
        let tables = self.tables.read().map_err(poison_err)?;
        Ok(tables.entries.get(run_id).cloned())
    }

    async fn list_schedule_entries(
        &self,
        status: Option<ScheduleStatus>,
    ) -> Result<Vec<ScheduleEntry>> {
        let tables = self.tables.read().map_err(poison_err)?;
        let mut entries: Vec<ScheduleEntry> = tables
            .entries
            .values()
            .filter(|e| status.is_none_or(|s| e.status == s))
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.submission_seq);
        Ok(entries)
    }

    async fn transition_schedule_entry(
        &self,
        run_id: &RunId,
        expected: ScheduleStatus,
        target: ScheduleStatus,
        patch: EntryPatch,
    ) -> Result<CasResult> {
        let mut tables = self.tables.write().map_err(poison_err)?;
        let Some(entry) = tables.entries.get_mut(run_id) else {
            return Ok(CasResult::NotFound);
        };
        if entry.status != expected {
            return Ok(CasResult::StateMismatch {
                actual: entry.status,
            });
        }
        entry.apply(target, patch, Utc::now());
        Ok(CasResult::Success)
    }

    async fn update_schedule_priority(&self, run_id: &RunId, priority: u8) -> Result<CasResult> {
        let mut tables = self.tables.write().map_err(poison_err)?;
        let Some(entry) = tables.entries.get_mut(run_id) else {
            return Ok(CasResult::NotFound);
        };
        if !entry.status.is_pending() {
            return Ok(CasResult::StateMismatch {
                actual: entry.status,
            });
        }
        entry.priority = priority;
        Ok(CasResult::Success)
    }

    async fn save_reservation(&self, reservation: &AssetReservation) -> Result<()> {
        let mut tables = self.tables.write().map_err(poison_err)?;
        let held = tables.reservations.entry(reservation.owner_run).or_default();
        match held
            .iter_mut()
            .find(|r| r.asset_name == reservation.asset_name)
        {
            Some(existing) => *existing = reservation.clone(),
            None => held.push(reservation.clone()),
        }
        Ok(())
    }

    async fn list_reservations(&self, run_id: &RunId) -> Result<Vec<AssetReservation>> {
        let tables = self.tables.read().map_err(poison_err)?;
        Ok(tables.reservations.get(run_id).cloned().unwrap_or_default())
    }

    async fn list_live_reservations(&self) -> Result<Vec<AssetReservation>> {
        let tables = self.tables.read().map_err(poison_err)?;
        Ok(tables
            .reservations
            .values()
            .flatten()
            .filter(|r| r.status.is_live())
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::{Map, Value};

    use super::*;
    use crate::registry::StepKey;
    use crate::scheduler::ReservationStatus;

    fn run() -> Run {
        Run::new(StepKey::new("protocol", "1"), Map::new(), Map::new(), 1)
    }

    #[tokio::test]
    async fn runs_are_inserted_once_and_saved() -> Result<()> {
        let store = InMemoryStore::new();
        let mut run = run();
        store.insert_run(&run).await?;
        assert!(store.insert_run(&run).await.is_err());

        run.transition_to(crate::run::RunStatus::Preparing)?;
        store.save_run(&run).await?;
        let loaded = store.get_run(&run.id).await?.expect("run");
        assert_eq!(loaded.status, crate::run::RunStatus::Preparing);
        assert_eq!(store.run_count()?, 1);

        let other = self::run();
        assert!(matches!(
            store.save_run(&other).await,
            Err(Error::RunNotFound { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn closed_calls_are_immutable() -> Result<()> {
        let store = InMemoryStore::new();
        let run_id = RunId::generate();
        let mut call = CallRecord::open(
            CallId::generate(),
            run_id,
            None,
            1,
            StepKey::new("mix", "1"),
            Value::Null,
        );
        store.insert_call(&call).await?;
        call.close_success(Value::Bool(true))?;
        store.update_call(&call).await?;
        assert!(store.update_call(&call).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn calls_list_in_sequence_order() -> Result<()> {
        let store = InMemoryStore::new();
        let run_id = RunId::generate();
        for seq in [3, 1, 2] {
            store
                .insert_call(&CallRecord::open(
                    CallId::generate(),
                    run_id,
                    None,
                    seq,
                    StepKey::new("mix", "1"),
                    Value::Null,
                ))
                .await?;
        }
        let seqs: Vec<u64> = store
            .list_calls(&run_id)
            .await?
            .iter()
            .map(|c| c.sequence)
            .collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        Ok(())
    }

    #[tokio::test]
    async fn schedule_entry_cas() -> Result<()> {
        let store = InMemoryStore::new();
        let run_id = RunId::generate();
        let entry = ScheduleEntry::new(run_id, 2, Vec::new(), None);
        store.insert_schedule_entry(&entry).await?;
        assert!(store.insert_schedule_entry(&entry).await.is_err());

        let ok = store
            .transition_schedule_entry(
                &run_id,
                ScheduleStatus::Queued,
                ScheduleStatus::Analyzing,
                EntryPatch::default(),
            )
            .await?;
        assert!(ok.is_success());

        let mismatch = store
            .transition_schedule_entry(
                &run_id,
                ScheduleStatus::Queued,
                ScheduleStatus::Analyzing,
                EntryPatch::default(),
            )
            .await?;
        assert_eq!(
            mismatch,
            CasResult::StateMismatch {
                actual: ScheduleStatus::Analyzing
            }
        );

        let missing = store
            .transition_schedule_entry(
                &RunId::generate(),
                ScheduleStatus::Queued,
                ScheduleStatus::Analyzing,
                EntryPatch::default(),
            )
            .await?;
        assert!(missing.is_not_found());

        let stored = store.get_schedule_entry(&run_id).await?.expect("entry");
        assert!(stored.phase_timestamps.contains_key(&ScheduleStatus::Analyzing));
        assert_eq!(stored.submission_seq, 1);
        Ok(())
    }

    #[tokio::test]
    async fn priority_updates_skip_dispatched_entries() -> Result<()> {
        let store = InMemoryStore::new();
        let run_id = RunId::generate();
        store
            .insert_schedule_entry(&ScheduleEntry::new(run_id, 1, Vec::new(), None))
            .await?;
        assert!(store.update_schedule_priority(&run_id, 5).await?.is_success());

        store
            .transition_schedule_entry(
                &run_id,
                ScheduleStatus::Queued,
                ScheduleStatus::Running,
                EntryPatch::default(),
            )
            .await?;
        assert!(!store.update_schedule_priority(&run_id, 9).await?.is_success());
        let entry = store.get_schedule_entry(&run_id).await?.expect("entry");
        assert_eq!(entry.priority, 5);
        Ok(())
    }

    #[tokio::test]
    async fn reservations_upsert_per_asset() -> Result<()> {
        let store = InMemoryStore::new();
        let run_id = RunId::generate();
        let mut reservation = AssetReservation {
            asset_type: "pipette".into(),
            asset_name: "p1".into(),
            owner_run: run_id,
            status: ReservationStatus::Reserved,
            lease_expires_at: Utc::now(),
            capabilities: Vec::new(),
            priority: 1,
        };
        store.save_reservation(&reservation).await?;
        assert_eq!(store.list_live_reservations().await?.len(), 1);

        reservation.status = ReservationStatus::Released;
        store.save_reservation(&reservation).await?;
        assert_eq!(store.list_reservations(&run_id).await?.len(), 1);
        assert!(store.list_live_reservations().await?.is_empty());

        let by_status: BTreeMap<_, _> = store
            .list_reservations(&run_id)
            .await?
            .into_iter()
            .map(|r| (r.asset_name, r.status))
            .collect();
        assert_eq!(by_status["p1"], ReservationStatus::Released);
        Ok(())
    }
}

//! Run store with fault injection.
//!
//! Wraps [`InMemoryStore`] so runs, calls and schedule entries behave as
//! usual, while tests can make call record writes or run saves fail.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use workcell_core::{CallId, RunId};
use workcell_flow::call::CallRecord;
use workcell_flow::error::{Error, Result};
use workcell_flow::run::Run;
use workcell_flow::scheduler::{AssetReservation, EntryPatch, ScheduleEntry, ScheduleStatus};
use workcell_flow::store::memory::InMemoryStore;
use workcell_flow::store::{CasResult, RunStore};

/// Sentinel for "run saves never fail".
const NEVER: usize = usize::MAX;

/// In-memory run store whose writes can be made to fail.
#[derive(Debug)]
pub struct FaultyRunStore {
    inner: Arc<InMemoryStore>,
    fail_call_writes: AtomicBool,
    saves_before_failure: AtomicUsize,
    rejected_call_writes: AtomicUsize,
    rejected_run_saves: AtomicUsize,
}

impl Default for FaultyRunStore {
    fn default() -> Self {
        Self {
            inner: Arc::new(InMemoryStore::new()),
            fail_call_writes: AtomicBool::new(false),
            saves_before_failure: AtomicUsize::new(NEVER),
            rejected_call_writes: AtomicUsize::new(0),
            rejected_run_saves: AtomicUsize::new(0),
        }
    }
}

impl FaultyRunStore {
    /// Creates a store with no faults injected.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns the wrapped store, which sees every accepted write.
    pub fn inner(&self) -> &Arc<InMemoryStore> {
        &self.inner
    }

    /// Makes every call record insert and update fail while `failing`.
    pub fn fail_call_writes(&self, failing: bool) {
        self.fail_call_writes.store(failing, Ordering::SeqCst);
    }

    /// Lets `allowed` more run saves through, then fails every later one.
    pub fn fail_run_saves_after(&self, allowed: usize) {
        self.saves_before_failure.store(allowed, Ordering::SeqCst);
    }

    /// Stops failing run saves.
    pub fn heal_run_saves(&self) {
        self.saves_before_failure.store(NEVER, Ordering::SeqCst);
    }

    /// Returns how many call record writes were rejected.
    pub fn rejected_call_writes(&self) -> usize {
        self.rejected_call_writes.load(Ordering::SeqCst)
    }

    /// Returns how many run saves were rejected.
    pub fn rejected_run_saves(&self) -> usize {
        self.rejected_run_saves.load(Ordering::SeqCst)
    }

    fn check_call_write(&self, call: &CallRecord) -> Result<()> {
        if self.fail_call_writes.load(Ordering::SeqCst) {
            self.rejected_call_writes.fetch_add(1, Ordering::SeqCst);
            return Err(Error::persistence(format!(
                "injected failure writing call {}",
                call.call_id
            )));
        }
        Ok(())
    }

    fn check_run_save(&self, run: &Run) -> Result<()> {
        let allowed = self
            .saves_before_failure
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                NEVER | 0 => None,
                left => Some(left - 1),
            });
        if allowed == Err(0) {
            self.rejected_run_saves.fetch_add(1, Ordering::SeqCst);
            return Err(Error::persistence(format!(
                "injected failure saving run {}",
                run.id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl RunStore for FaultyRunStore {
    async fn insert_run(&self, run: &Run) -> Result<()> {
        self.inner.insert_run(run).await
    }

    async fn get_run(&self, run_id: &RunId) -> Result<Option<Run>> {
        self.inner.get_run(run_id).await
    }

    async fn save_run(&self, run: &Run) -> Result<()> {
        self.check_run_save(run)?;
        self.inner.save_run(run).await
    }

    async fn list_runs(&self) -> Result<Vec<Run>> {
        self.inner.list_runs().await
    }

    async fn insert_call(&self, call: &CallRecord) -> Result<()> {
        self.check_call_write(call)?;
        self.inner.insert_call(call).await
    }

    async fn update_call(&self, call: &CallRecord) -> Result<()> {
        self.check_call_write(call)?;
        self.inner.update_call(call).await
    }

    async fn get_call(&self, call_id: &CallId) -> Result<Option<CallRecord>> {
        self.inner.get_call(call_id).await
    }

    async fn list_calls(&self, run_id: &RunId) -> Result<Vec<CallRecord>> {
        self.inner.list_calls(run_id).await
    }

    async fn insert_schedule_entry(&self, entry: &ScheduleEntry) -> Result<()> {
        self.inner.insert_schedule_entry(entry).await
    }

    async fn get_schedule_entry(&self, run_id: &RunId) -> Result<Option<ScheduleEntry>> {
        self.inner.get_schedule_entry(run_id).await
    }

    async fn list_schedule_entries(
        &self,
        status: Option<ScheduleStatus>,
    ) -> Result<Vec<ScheduleEntry>> {
        self.inner.list_schedule_entries(status).await
    }

    async fn transition_schedule_entry(
        &self,
        run_id: &RunId,
        expected: ScheduleStatus,
        target: ScheduleStatus,
        patch: EntryPatch,
    ) -> Result<CasResult> {
        self.inner
            .transition_schedule_entry(run_id, expected, target, patch)
            .await
    }

    async fn update_schedule_priority(&self, run_id: &RunId, priority: u8) -> Result<CasResult> {
        self.inner.update_schedule_priority(run_id, priority).await
    }

    async fn save_reservation(&self, reservation: &AssetReservation) -> Result<()> {
        self.inner.save_reservation(reservation).await
    }

    async fn list_reservations(&self, run_id: &RunId) -> Result<Vec<AssetReservation>> {
        self.inner.list_reservations(run_id).await
    }

    async fn list_live_reservations(&self) -> Result<Vec<AssetReservation>> {
        self.inner.list_live_reservations().await
    }
}

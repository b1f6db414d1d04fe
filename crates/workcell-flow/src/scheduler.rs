//! Admission control and prioritized dispatch.
//!
//! Every run gets exactly one [`ScheduleEntry`]. The entry moves through:
//!
//! ```text
//! QUEUED -> ANALYZING -> RESERVING -> READY -> RUNNING -> COMPLETED | FAILED | CANCELLED
//!    ^          |            |
//!    +----------+------------+   (asset held or lock backend down: back to QUEUED)
//! ```
//!
//! Reservation is all-or-nothing. When any asset cannot be acquired, the
//! partial set is released before the entry returns to QUEUED, so no run ever
//! waits while holding a subset of its assets.
//!
//! Dispatch picks the highest priority READY entry, breaking ties by
//! submission order.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use workcell_core::{AssetLockManager, RunId, ScheduleEntryId};

use crate::config::{FlowConfig, ReservationRetryPolicy};
use crate::dispatch::{DispatchEnvelope, WorkerPool};
use crate::error::{Error, Result};
use crate::metrics::FlowMetrics;
use crate::store::{CasResult, RunStore};

/// Schedule entry states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduleStatus {
    /// Waiting for (re)admission.
    Queued,
    /// Requirements are being validated.
    Analyzing,
    /// Assets are being acquired.
    Reserving,
    /// All assets held; waiting for a worker.
    Ready,
    /// Handed to the worker pool.
    Running,
    /// The run completed.
    Completed,
    /// Analysis failed, retries were exhausted, or the run failed.
    Failed,
    /// Removed before or during execution.
    Cancelled,
}

impl ScheduleStatus {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns true while the entry has not been dispatched.
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        matches!(
            self,
            Self::Queued | Self::Analyzing | Self::Reserving | Self::Ready
        )
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub const fn can_transition_to(&self, target: Self) -> bool {
        use ScheduleStatus::{
            Analyzing, Cancelled, Completed, Failed, Queued, Ready, Reserving, Running,
        };
        matches!(
            (self, target),
            (Queued, Analyzing | Cancelled | Failed)
                | (Analyzing, Reserving | Queued | Failed | Cancelled)
                | (Reserving, Ready | Queued | Failed | Cancelled)
                | (Ready, Running | Failed | Cancelled)
                // Worker pool rejected the hand-off.
                | (Running, Ready | Completed | Failed | Cancelled)
        )
    }

    /// Returns the status name as stored and displayed.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Analyzing => "ANALYZING",
            Self::Reserving => "RESERVING",
            Self::Ready => "READY",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One asset a run needs exclusive use of.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirement {
    /// Parameter the asset was named by.
    pub param: String,
    /// Required asset kind.
    pub asset_type: String,
    /// Asset to reserve.
    pub asset_name: String,
    /// Capabilities the asset must advertise.
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// The queueing record for a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleEntry {
    /// Entry identifier.
    pub id: ScheduleEntryId,
    /// The run this entry schedules.
    pub run_id: RunId,
    /// Priority (higher dispatches first).
    pub priority: u8,
    /// Current status.
    pub status: ScheduleStatus,
    /// Expected run duration, if declared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_duration: Option<Duration>,
    /// Assets the run needs.
    pub requirements: Vec<ResourceRequirement>,
    /// Position in the pending queue, as of the last queue listing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<usize>,
    /// Submission order, assigned by the store on insert.
    #[serde(default)]
    pub submission_seq: u64,
    /// When the entry was submitted.
    pub submitted_at: DateTime<Utc>,
    /// When each status was (last) entered.
    pub phase_timestamps: BTreeMap<ScheduleStatus, DateTime<Utc>>,
    /// Reservation attempts that found an asset held.
    #[serde(default)]
    pub attempts: u32,
    /// Recorded failure, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Earliest time the entry is retried.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_at: Option<DateTime<Utc>>,
    /// Asset whose holder the entry is waiting on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_on: Option<String>,
}

impl ScheduleEntry {
    /// Creates a QUEUED entry.
    #[must_use]
    pub fn new(
        run_id: RunId,
        priority: u8,
        requirements: Vec<ResourceRequirement>,
        estimated_duration: Option<Duration>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ScheduleEntryId::generate(),
            run_id,
            priority,
            status: ScheduleStatus::Queued,
            estimated_duration,
            requirements,
            queue_position: None,
            submission_seq: 0,
            submitted_at: now,
            phase_timestamps: BTreeMap::from([(ScheduleStatus::Queued, now)]),
            attempts: 0,
            error: None,
            retry_at: None,
            blocked_on: None,
        }
    }

    /// Dispatch order: higher priority first, then earlier submission.
    #[must_use]
    pub fn dispatch_cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then(self.submission_seq.cmp(&other.submission_seq))
            .then(self.submitted_at.cmp(&other.submitted_at))
            .then(self.id.cmp(&other.id))
    }

    /// Returns true if a QUEUED entry may be retried at `now`.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == ScheduleStatus::Queued && self.retry_at.is_none_or(|at| at <= now)
    }

    /// Moves to `target` and applies `patch`. Used by stores under CAS.
    pub fn apply(&mut self, target: ScheduleStatus, patch: EntryPatch, now: DateTime<Utc>) {
        if self.status != target {
            self.phase_timestamps.insert(target, now);
        }
        self.status = target;
        if let Some(attempts) = patch.attempts {
            self.attempts = attempts;
        }
        if let Some(error) = patch.error {
            self.error = error;
        }
        if let Some(retry_at) = patch.retry_at {
            self.retry_at = retry_at;
        }
        if let Some(blocked_on) = patch.blocked_on {
            self.blocked_on = blocked_on;
        }
    }
}

/// Field updates applied together with a schedule entry transition.
///
/// `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryPatch {
    /// New attempt count.
    pub attempts: Option<u32>,
    /// New recorded error.
    pub error: Option<Option<String>>,
    /// New retry time.
    pub retry_at: Option<Option<DateTime<Utc>>>,
    /// New blocking asset.
    pub blocked_on: Option<Option<String>>,
}

impl EntryPatch {
    /// Records an error.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            error: Some(Some(message.into())),
            retry_at: Some(None),
            blocked_on: Some(None),
            ..Self::default()
        }
    }

    /// Schedules a retry.
    #[must_use]
    pub fn requeue(attempts: u32, retry_at: DateTime<Utc>, blocked_on: Option<String>) -> Self {
        Self {
            attempts: Some(attempts),
            error: None,
            retry_at: Some(Some(retry_at)),
            blocked_on: Some(blocked_on),
        }
    }

    /// Clears the wait state so the entry is due immediately.
    #[must_use]
    pub fn wake() -> Self {
        Self {
            retry_at: Some(None),
            blocked_on: Some(None),
            ..Self::default()
        }
    }
}

/// Asset reservation states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationStatus {
    /// Being acquired.
    Pending,
    /// Lock held; the run has not started using the asset.
    Reserved,
    /// Lock held and the run is executing.
    Active,
    /// Released by the owner.
    Released,
    /// Lease lapsed without renewal.
    Expired,
    /// Could not be acquired.
    Failed,
}

impl ReservationStatus {
    /// Returns true while the reservation claims its asset.
    #[must_use]
    pub const fn is_live(&self) -> bool {
        matches!(self, Self::Reserved | Self::Active)
    }
}

/// A time-bounded claim on an asset for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetReservation {
    /// Asset kind.
    pub asset_type: String,
    /// Reserved asset.
    pub asset_name: String,
    /// Run holding the claim.
    pub owner_run: RunId,
    /// Current status.
    pub status: ReservationStatus,
    /// When the lease lapses unless renewed.
    pub lease_expires_at: DateTime<Utc>,
    /// Capabilities the run required.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Priority of the owning run.
    pub priority: u8,
}

/// What the scheduler knows about an asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetDescriptor {
    /// Asset kind.
    pub kind: String,
    /// Advertised capabilities.
    pub capabilities: Vec<String>,
}

/// Source of truth for requirement analysis.
pub trait AssetCatalog: Send + Sync {
    /// Describes an asset, or returns `None` if it is unknown.
    fn describe(&self, name: &str) -> Option<AssetDescriptor>;
}

/// Result of one admission attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// All assets reserved; the entry is READY.
    Ready,
    /// Returned to QUEUED for a later retry.
    Waiting {
        /// The held asset, or `None` if the lock backend was unreachable.
        blocked_on: Option<String>,
    },
    /// Requirement analysis failed; the entry is FAILED.
    Rejected {
        /// Why analysis failed.
        reason: String,
    },
    /// Retry policy exhausted; the entry is FAILED.
    Exhausted {
        /// The asset that stayed held.
        asset: String,
        /// Attempts made.
        attempts: u32,
    },
    /// The entry was not QUEUED, or changed concurrently.
    Skipped,
}

enum Reservation {
    Acquired(Vec<ResourceRequirement>),
    Held(String),
    Unavailable(Error),
}

/// Admission control and prioritized dispatch.
pub struct Scheduler {
    store: Arc<dyn RunStore>,
    locks: AssetLockManager,
    catalog: Arc<dyn AssetCatalog>,
    pool: Arc<dyn WorkerPool>,
    lease: Duration,
    retry: ReservationRetryPolicy,
    metrics: FlowMetrics,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("locks", &self.locks)
            .field("pool", &self.pool.name())
            .field("lease", &self.lease)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

fn deadline(from: DateTime<Utc>, after: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(after)
        .ok()
        .and_then(|after| from.checked_add_signed(after))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl Scheduler {
    /// Creates a scheduler.
    #[must_use]
    pub fn new(
        store: Arc<dyn RunStore>,
        locks: AssetLockManager,
        catalog: Arc<dyn AssetCatalog>,
        pool: Arc<dyn WorkerPool>,
        config: &FlowConfig,
    ) -> Self {
        Self {
            store,
            locks,
            catalog,
            pool,
            lease: config.lease_duration,
            retry: config.reservation_retry.clone(),
            metrics: FlowMetrics::new(),
        }
    }

    /// Returns the lock manager reservations are made through.
    #[must_use]
    pub const fn locks(&self) -> &AssetLockManager {
        &self.locks
    }

    /// Records an entry and attempts admission right away.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidInput`] for priority 0 or a run that already has an entry
    /// - [`Error::RequirementAnalysis`] if analysis rejected the requirements
    /// - [`Error::AssetUnavailable`] if the retry policy allows no further attempt
    /// - [`Error::LockBackendUnavailable`] if the lock backend is down; the
    ///   entry stays QUEUED
    pub async fn schedule(
        &self,
        run_id: RunId,
        requirements: Vec<ResourceRequirement>,
        priority: u8,
    ) -> Result<ScheduleEntryId> {
        self.schedule_with_estimate(run_id, requirements, priority, None)
            .await
    }

    /// Like [`Scheduler::schedule`], recording an expected duration.
    ///
    /// # Errors
    ///
    /// See [`Scheduler::schedule`].
    #[tracing::instrument(skip_all, fields(run_id = %run_id, priority = priority))]
    pub async fn schedule_with_estimate(
        &self,
        run_id: RunId,
        requirements: Vec<ResourceRequirement>,
        priority: u8,
        estimated_duration: Option<Duration>,
    ) -> Result<ScheduleEntryId> {
        if priority == 0 {
            return Err(Error::InvalidInput(
                "priority must be a positive integer".into(),
            ));
        }
        let entry = ScheduleEntry::new(run_id, priority, requirements, estimated_duration);
        let entry_id = entry.id;
        self.store.insert_schedule_entry(&entry).await?;
        tracing::debug!(%entry_id, "schedule entry queued");

        match self.admit(run_id).await? {
            Admission::Ready | Admission::Waiting { .. } | Admission::Skipped => Ok(entry_id),
            Admission::Rejected { reason } => Err(Error::RequirementAnalysis { message: reason }),
            Admission::Exhausted { asset, attempts } => {
                Err(Error::AssetUnavailable { asset, attempts })
            }
        }
    }

    /// Runs one admission attempt for a QUEUED entry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockBackendUnavailable`] after requeueing the entry
    /// when the lock backend cannot be reached, or a persistence error.
    #[tracing::instrument(skip_all, fields(run_id = %run_id))]
    pub async fn admit(&self, run_id: RunId) -> Result<Admission> {
        let entry = self
            .store
            .get_schedule_entry(&run_id)
            .await?
            .ok_or(Error::RunNotFound { run_id })?;
        if entry.status != ScheduleStatus::Queued {
            return Ok(Admission::Skipped);
        }
        if !self
            .cas(run_id, ScheduleStatus::Queued, ScheduleStatus::Analyzing, EntryPatch::default())
            .await?
        {
            return Ok(Admission::Skipped);
        }

        if let Err(reason) = self.analyze(&entry.requirements) {
            tracing::warn!(%reason, "requirement analysis failed");
            self.cas(
                run_id,
                ScheduleStatus::Analyzing,
                ScheduleStatus::Failed,
                EntryPatch::failed(reason.clone()),
            )
            .await?;
            self.metrics.record_reservation("rejected");
            return Ok(Admission::Rejected { reason });
        }

        if !self
            .cas(run_id, ScheduleStatus::Analyzing, ScheduleStatus::Reserving, EntryPatch::default())
            .await?
        {
            return Ok(Admission::Skipped);
        }

        let now = Utc::now();
        match self.reserve_all(&entry).await {
            Reservation::Acquired(acquired) => self.commit_reservations(&entry, acquired).await,
            Reservation::Held(asset) => {
                let attempts = entry.attempts + 1;
                self.metrics.record_reservation("held");
                if self.retry.is_exhausted(attempts) {
                    tracing::warn!(%asset, attempts, "reservation retries exhausted");
                    let err = Error::AssetUnavailable {
                        asset: asset.clone(),
                        attempts,
                    };
                    self.cas(
                        run_id,
                        ScheduleStatus::Reserving,
                        ScheduleStatus::Failed,
                        EntryPatch {
                            attempts: Some(attempts),
                            ..EntryPatch::failed(err.to_string())
                        },
                    )
                    .await?;
                    return Ok(Admission::Exhausted { asset, attempts });
                }
                tracing::debug!(%asset, attempts, "asset held; entry requeued");
                self.cas(
                    run_id,
                    ScheduleStatus::Reserving,
                    ScheduleStatus::Queued,
                    EntryPatch::requeue(
                        attempts,
                        deadline(now, self.retry.backoff),
                        Some(asset.clone()),
                    ),
                )
                .await?;
                Ok(Admission::Waiting {
                    blocked_on: Some(asset),
                })
            }
            Reservation::Unavailable(err) => {
                tracing::warn!(error = %err, "lock backend unavailable; entry requeued");
                self.metrics.record_reservation("backend_unavailable");
                self.cas(
                    run_id,
                    ScheduleStatus::Reserving,
                    ScheduleStatus::Queued,
                    EntryPatch::requeue(entry.attempts, deadline(now, self.retry.backoff), None),
                )
                .await?;
                Err(err)
            }
        }
    }

    /// Attempts admission of every due QUEUED entry, in dispatch order.
    ///
    /// Lock backend outages are reported as [`Admission::Waiting`] with no
    /// blocking asset; the entry stays QUEUED.
    ///
    /// # Errors
    ///
    /// Returns an error on persistence failure.
    pub async fn admit_queued(&self) -> Result<Vec<(RunId, Admission)>> {
        let now = Utc::now();
        let mut due: Vec<ScheduleEntry> = self
            .store
            .list_schedule_entries(Some(ScheduleStatus::Queued))
            .await?
            .into_iter()
            .filter(|e| e.is_due(now))
            .collect();
        due.sort_by(ScheduleEntry::dispatch_cmp);

        let mut outcomes = Vec::with_capacity(due.len());
        for entry in due {
            let outcome = match self.admit(entry.run_id).await {
                Ok(outcome) => outcome,
                Err(err) if err.is_lock_backend_unavailable() => {
                    Admission::Waiting { blocked_on: None }
                }
                Err(err) => return Err(err),
            };
            outcomes.push((entry.run_id, outcome));
        }
        Ok(outcomes)
    }

    /// Hands the best READY entry to the worker pool.
    ///
    /// Returns `None` when nothing is READY.
    ///
    /// # Errors
    ///
    /// Returns the pool's error after putting the entry back to READY, or a
    /// persistence error.
    pub async fn dispatch(&self) -> Result<Option<DispatchEnvelope>> {
        let mut ready = self
            .store
            .list_schedule_entries(Some(ScheduleStatus::Ready))
            .await?;
        ready.sort_by(ScheduleEntry::dispatch_cmp);

        for entry in ready {
            if !self
                .cas(
                    entry.run_id,
                    ScheduleStatus::Ready,
                    ScheduleStatus::Running,
                    EntryPatch::default(),
                )
                .await?
            {
                continue;
            }
            let envelope = DispatchEnvelope::new(entry.run_id, entry.id, entry.priority);
            if let Err(err) = self.pool.submit(envelope.clone()).await {
                tracing::warn!(run_id = %entry.run_id, error = %err, "worker pool rejected run");
                self.metrics.record_dispatch("rejected");
                self.cas(
                    entry.run_id,
                    ScheduleStatus::Running,
                    ScheduleStatus::Ready,
                    EntryPatch::default(),
                )
                .await?;
                return Err(err);
            }
            tracing::info!(run_id = %entry.run_id, priority = entry.priority, "run dispatched");
            self.metrics.record_dispatch("submitted");
            return Ok(Some(envelope));
        }
        Ok(None)
    }

    /// Dispatches READY entries until none is left.
    ///
    /// # Errors
    ///
    /// See [`Scheduler::dispatch`].
    pub async fn dispatch_ready(&self) -> Result<Vec<DispatchEnvelope>> {
        let mut dispatched = Vec::new();
        while let Some(envelope) = self.dispatch().await? {
            dispatched.push(envelope);
        }
        Ok(dispatched)
    }

    /// Removes a run from scheduling.
    ///
    /// Pending entries are cancelled and their reservations released. A
    /// RUNNING entry is only cancelled with `force`; its reservations stay
    /// with the executing run, which releases them when it stops.
    ///
    /// Returns false if the entry is missing, terminal, or RUNNING without
    /// `force`.
    ///
    /// # Errors
    ///
    /// Returns an error on persistence or lock backend failure.
    #[tracing::instrument(skip_all, fields(run_id = %run_id, force = force))]
    pub async fn cancel_schedule(&self, run_id: RunId, force: bool) -> Result<bool> {
        // Admission may move the entry between reads; retry on mismatch.
        for _ in 0..8 {
            let Some(entry) = self.store.get_schedule_entry(&run_id).await? else {
                return Ok(false);
            };
            if entry.status.is_terminal() {
                return Ok(false);
            }
            let running = entry.status == ScheduleStatus::Running;
            if running && !force {
                return Ok(false);
            }
            if !self
                .cas(
                    run_id,
                    entry.status,
                    ScheduleStatus::Cancelled,
                    EntryPatch::failed("cancelled"),
                )
                .await?
            {
                continue;
            }
            if !running {
                self.release_all(run_id).await?;
            }
            tracing::info!(from = %entry.status, "schedule entry cancelled");
            return Ok(true);
        }
        Err(Error::persistence(format!(
            "schedule entry for run {run_id} kept changing during cancellation"
        )))
    }

    /// Changes the priority of an entry that has not been dispatched.
    ///
    /// Returns false for unknown, dispatched or finished entries.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for priority 0, or a persistence error.
    pub async fn update_priority(&self, run_id: RunId, priority: u8) -> Result<bool> {
        if priority == 0 {
            return Err(Error::InvalidInput(
                "priority must be a positive integer".into(),
            ));
        }
        let result = self.store.update_schedule_priority(&run_id, priority).await?;
        tracing::debug!(%run_id, priority, applied = result.is_success(), "priority update");
        Ok(result.is_success())
    }

    /// Promotes the run's RESERVED reservations to ACTIVE.
    ///
    /// # Errors
    ///
    /// Returns an error on persistence failure.
    pub async fn activate(&self, run_id: RunId) -> Result<()> {
        for mut reservation in self.store.list_reservations(&run_id).await? {
            if reservation.status == ReservationStatus::Reserved {
                reservation.status = ReservationStatus::Active;
                self.store.save_reservation(&reservation).await?;
            }
        }
        Ok(())
    }

    /// Extends the leases of the run's live reservations.
    ///
    /// A reservation whose lock is no longer held by the run is marked
    /// EXPIRED. Returns the number of leases renewed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockBackendUnavailable`] or a persistence error.
    pub async fn renew_leases(&self, run_id: RunId) -> Result<usize> {
        let owner = run_id.to_string();
        let mut renewed = 0;
        for mut reservation in self.store.list_reservations(&run_id).await? {
            if !reservation.status.is_live() {
                continue;
            }
            if self
                .locks
                .renew(&reservation.asset_name, &owner, self.lease)
                .await?
            {
                reservation.lease_expires_at = deadline(Utc::now(), self.lease);
                renewed += 1;
            } else {
                tracing::warn!(
                    %run_id,
                    asset = %reservation.asset_name,
                    "lease lost before renewal"
                );
                reservation.status = ReservationStatus::Expired;
            }
            self.store.save_reservation(&reservation).await?;
        }
        Ok(renewed)
    }

    /// Releases the run's reservations and closes its entry with `terminal`.
    ///
    /// QUEUED entries blocked on a released asset are woken so they are
    /// retried without waiting out their backoff.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for a non-terminal status. Lock backend
    /// failures are returned after every other reservation was processed; the
    /// affected leases still lapse on their own.
    #[tracing::instrument(skip_all, fields(run_id = %run_id, status = %terminal))]
    pub async fn finish(&self, run_id: RunId, terminal: ScheduleStatus) -> Result<()> {
        if !terminal.is_terminal() {
            return Err(Error::InvalidInput(format!(
                "{terminal} is not a terminal schedule status"
            )));
        }
        let released = self.release_all(run_id).await;

        // Close the entry unless it is already terminal.
        for _ in 0..8 {
            let Some(entry) = self.store.get_schedule_entry(&run_id).await? else {
                break;
            };
            if entry.status.is_terminal() {
                break;
            }
            let result = self
                .store
                .transition_schedule_entry(&run_id, entry.status, terminal, EntryPatch::default())
                .await?;
            if result.is_success() {
                break;
            }
        }

        released.map(|_| ())
    }

    /// Force-expires live reservations whose lease passed at `now` and whose
    /// lock the owning run no longer holds. Returns how many were expired.
    ///
    /// # Errors
    ///
    /// Returns an error on persistence or lock backend failure.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut expired = 0;
        for mut reservation in self.store.list_live_reservations().await? {
            if reservation.lease_expires_at > now {
                continue;
            }
            let owner = reservation.owner_run.to_string();
            let still_held = self
                .locks
                .holder(&reservation.asset_name)
                .await?
                .is_some_and(|info| info.is_held_by(&owner));
            if still_held {
                continue;
            }
            tracing::warn!(
                run_id = %reservation.owner_run,
                asset = %reservation.asset_name,
                "reservation lease expired"
            );
            reservation.status = ReservationStatus::Expired;
            self.store.save_reservation(&reservation).await?;
            expired += 1;
        }
        Ok(expired)
    }

    /// Lists undispatched entries in dispatch order with positions filled in.
    ///
    /// # Errors
    ///
    /// Returns an error on persistence failure.
    pub async fn pending_queue(&self) -> Result<Vec<ScheduleEntry>> {
        let mut pending: Vec<ScheduleEntry> = self
            .store
            .list_schedule_entries(None)
            .await?
            .into_iter()
            .filter(|e| e.status.is_pending())
            .collect();
        pending.sort_by(ScheduleEntry::dispatch_cmp);
        for (position, entry) in pending.iter_mut().enumerate() {
            entry.queue_position = Some(position);
        }
        Ok(pending)
    }

    fn analyze(&self, requirements: &[ResourceRequirement]) -> std::result::Result<(), String> {
        let mut seen = HashSet::new();
        for requirement in requirements {
            if requirement.asset_name.is_empty() {
                return Err(format!(
                    "parameter '{}' names no asset",
                    requirement.param
                ));
            }
            if !seen.insert(requirement.asset_name.as_str()) {
                return Err(format!(
                    "asset '{}' is required more than once",
                    requirement.asset_name
                ));
            }
            let Some(descriptor) = self.catalog.describe(&requirement.asset_name) else {
                return Err(format!("unknown asset '{}'", requirement.asset_name));
            };
            if descriptor.kind != requirement.asset_type {
                return Err(format!(
                    "asset '{}' is a {}, parameter '{}' needs a {}",
                    requirement.asset_name,
                    descriptor.kind,
                    requirement.param,
                    requirement.asset_type
                ));
            }
            if let Some(missing) = requirement
                .capabilities
                .iter()
                .find(|c| !descriptor.capabilities.contains(c))
            {
                return Err(format!(
                    "asset '{}' lacks capability '{missing}'",
                    requirement.asset_name
                ));
            }
        }
        Ok(())
    }

    async fn reserve_all(&self, entry: &ScheduleEntry) -> Reservation {
        let owner = entry.run_id.to_string();
        let operation = format!("run {}", entry.run_id);
        let mut acquired: Vec<ResourceRequirement> = Vec::new();

        for requirement in &entry.requirements {
            let outcome = self
                .locks
                .acquire_with_operation(
                    &requirement.asset_name,
                    &owner,
                    self.lease,
                    Some(operation.clone()),
                )
                .await;
            match outcome {
                Ok(true) => acquired.push(requirement.clone()),
                Ok(false) => {
                    self.rollback(&owner, &acquired).await;
                    return Reservation::Held(requirement.asset_name.clone());
                }
                Err(err) => {
                    self.rollback(&owner, &acquired).await;
                    return Reservation::Unavailable(err.into());
                }
            }
        }
        Reservation::Acquired(acquired)
    }

    async fn rollback(&self, owner: &str, acquired: &[ResourceRequirement]) {
        for requirement in acquired {
            if let Err(err) = self.locks.release(&requirement.asset_name, owner).await {
                // The lease lapses on its own.
                tracing::warn!(
                    asset = %requirement.asset_name,
                    error = %err,
                    "failed to roll back partial reservation"
                );
            }
        }
    }

    async fn commit_reservations(
        &self,
        entry: &ScheduleEntry,
        acquired: Vec<ResourceRequirement>,
    ) -> Result<Admission> {
        let lease_expires_at = deadline(Utc::now(), self.lease);
        for requirement in &acquired {
            self.store
                .save_reservation(&AssetReservation {
                    asset_type: requirement.asset_type.clone(),
                    asset_name: requirement.asset_name.clone(),
                    owner_run: entry.run_id,
                    status: ReservationStatus::Reserved,
                    lease_expires_at,
                    capabilities: requirement.capabilities.clone(),
                    priority: entry.priority,
                })
                .await?;
        }

        if self
            .cas(
                entry.run_id,
                ScheduleStatus::Reserving,
                ScheduleStatus::Ready,
                EntryPatch::wake(),
            )
            .await?
        {
            tracing::debug!(run_id = %entry.run_id, assets = acquired.len(), "entry ready");
            self.metrics.record_reservation("reserved");
            Ok(Admission::Ready)
        } else {
            // Cancelled while reserving.
            self.release_all(entry.run_id).await?;
            Ok(Admission::Skipped)
        }
    }

    /// Releases every lock the run holds and records the reservation outcome.
    async fn release_all(&self, run_id: RunId) -> Result<Vec<String>> {
        let owner = run_id.to_string();
        let mut released = Vec::new();
        let mut failure = None;

        for mut reservation in self.store.list_reservations(&run_id).await? {
            if !matches!(
                reservation.status,
                ReservationStatus::Pending | ReservationStatus::Reserved | ReservationStatus::Active
            ) {
                continue;
            }
            match self.locks.release(&reservation.asset_name, &owner).await {
                Ok(true) => {
                    reservation.status = ReservationStatus::Released;
                    released.push(reservation.asset_name.clone());
                }
                Ok(false) => reservation.status = ReservationStatus::Expired,
                Err(err) => {
                    tracing::warn!(
                        %run_id,
                        asset = %reservation.asset_name,
                        error = %err,
                        "failed to release reservation"
                    );
                    failure.get_or_insert(err);
                    continue;
                }
            }
            self.store.save_reservation(&reservation).await?;
        }

        self.wake_waiters(&released).await?;
        match failure {
            Some(err) => Err(err.into()),
            None => Ok(released),
        }
    }

    async fn wake_waiters(&self, released: &[String]) -> Result<()> {
        if released.is_empty() {
            return Ok(());
        }
        for entry in self
            .store
            .list_schedule_entries(Some(ScheduleStatus::Queued))
            .await?
        {
            let blocked = entry
                .blocked_on
                .as_ref()
                .is_some_and(|asset| released.contains(asset));
            if blocked {
                self.store
                    .transition_schedule_entry(
                        &entry.run_id,
                        ScheduleStatus::Queued,
                        ScheduleStatus::Queued,
                        EntryPatch::wake(),
                    )
                    .await?;
                tracing::debug!(run_id = %entry.run_id, "waiting entry woken");
            }
        }
        Ok(())
    }

    async fn cas(
        &self,
        run_id: RunId,
        expected: ScheduleStatus,
        target: ScheduleStatus,
        patch: EntryPatch,
    ) -> Result<bool> {
        debug_assert!(expected.can_transition_to(target), "{expected} -> {target}");
        match self
            .store
            .transition_schedule_entry(&run_id, expected, target, patch)
            .await?
        {
            CasResult::Success => Ok(true),
            CasResult::StateMismatch { actual } => {
                tracing::debug!(%run_id, %expected, %actual, %target, "schedule entry moved concurrently");
                Ok(false)
            }
            CasResult::NotFound => Err(Error::RunNotFound { run_id }),
        }
    }
}

//! Run orchestration.
//!
//! The [`Orchestrator`] owns every run record. It accepts submissions,
//! hands them to the [`Scheduler`] for admission, executes dispatched runs,
//! and applies control commands at step boundaries.
//!
//! ## Execution model
//!
//! Every step invocation goes through [`Orchestrator::run_step`]:
//!
//! 1. take the next run-wide sequence number and open a call record
//! 2. fork the context so nested calls see this call as their parent
//! 3. apply pending control commands (pause, cancel, intervene)
//! 4. validate arguments and invoke the body
//! 5. close the call record with the outcome
//!
//! Call record writes are audit only: a failed write is logged and counted,
//! never surfaced to the step.
//!
//! Runs mutate under a per-run mutex with a read-modify-write against the
//! store, so a cancel racing a submission or a start sees a consistent run.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock};
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use workcell_core::observability::{run_span, step_span};
use workcell_core::{CallId, RunId};

use crate::assets::{AssetRegistry, LiveAsset};
use crate::call::{CallRecord, CallStatus};
use crate::config::FlowConfig;
use crate::context::{CallContext, RunScope, SharedState, StepInvoker};
use crate::control::{ControlChannel, ControlCommand, ControlOutcome};
use crate::dispatch::DispatchEnvelope;
use crate::error::{Error, Result};
use crate::metrics::{time_scheduler_tick, FlowMetrics};
use crate::registry::{RegisteredStep, StepBody, StepKey, StepRegistry};
use crate::run::{Run, RunStatus};
use crate::scheduler::{Admission, ScheduleStatus, Scheduler};
use crate::store::RunStore;

/// Consecutive failed call record writes after which the run logs at error level.
pub const AUDIT_FAILURE_ALARM_THRESHOLD: u32 = 3;

/// Reason recorded when a run's token fires without a CANCEL command.
const IMPLICIT_CANCEL_REASON: &str = "run cancelled";

/// A request to start a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRequest {
    /// Top-level step to execute.
    pub definition: StepKey,
    /// Input arguments for the top-level step.
    pub inputs: Map<String, Value>,
    /// Shared state the run starts with.
    pub initial_state: Map<String, Value>,
    /// Scheduling priority; the configured default when `None`.
    pub priority: Option<u8>,
}

impl RunRequest {
    /// Creates a request with no inputs, empty state and default priority.
    #[must_use]
    pub fn new(definition: StepKey) -> Self {
        Self {
            definition,
            inputs: Map::new(),
            initial_state: Map::new(),
            priority: None,
        }
    }

    /// Sets the input arguments.
    #[must_use]
    pub fn with_inputs(mut self, inputs: Map<String, Value>) -> Self {
        self.inputs = inputs;
        self
    }

    /// Sets the initial shared state.
    #[must_use]
    pub fn with_state(mut self, state: Map<String, Value>) -> Self {
        self.initial_state = state;
        self
    }

    /// Sets the priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// What one scheduler tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Entries that reached READY.
    pub admitted: usize,
    /// Runs failed because their requirements cannot be met.
    pub failed: Vec<RunId>,
    /// Reservations marked expired.
    pub swept: usize,
    /// Entries handed to the worker pool.
    pub dispatched: usize,
}

/// Owns run lifecycles and step execution.
pub struct Orchestrator {
    registry: Arc<StepRegistry>,
    store: Arc<dyn RunStore>,
    control: Arc<dyn ControlChannel>,
    scheduler: Arc<Scheduler>,
    assets: Arc<AssetRegistry>,
    config: FlowConfig,
    metrics: FlowMetrics,
    active: RwLock<HashMap<RunId, CancellationToken>>,
    run_locks: StdMutex<HashMap<RunId, Arc<Mutex<()>>>>,
    audit_alarms: AtomicU64,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("steps", &self.registry.len())
            .field("scheduler", &self.scheduler)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::persistence("orchestrator lock poisoned")
}

/// Maps a terminal run status to the schedule status that closes its entry.
const fn schedule_status_for(status: RunStatus) -> Option<ScheduleStatus> {
    match status {
        RunStatus::Completed => Some(ScheduleStatus::Completed),
        RunStatus::Failed => Some(ScheduleStatus::Failed),
        RunStatus::Cancelled => Some(ScheduleStatus::Cancelled),
        _ => None,
    }
}

impl Orchestrator {
    /// Creates an orchestrator.
    #[must_use]
    pub fn new(
        registry: Arc<StepRegistry>,
        store: Arc<dyn RunStore>,
        control: Arc<dyn ControlChannel>,
        scheduler: Arc<Scheduler>,
        assets: Arc<AssetRegistry>,
        config: FlowConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            store,
            control,
            scheduler,
            assets,
            config,
            metrics: FlowMetrics::new(),
            active: RwLock::new(HashMap::new()),
            run_locks: StdMutex::new(HashMap::new()),
            audit_alarms: AtomicU64::new(0),
        })
    }

    /// Returns the scheduler runs are admitted through.
    #[must_use]
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Returns the live asset registry.
    #[must_use]
    pub fn assets(&self) -> &Arc<AssetRegistry> {
        &self.assets
    }

    /// Returns the run store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    /// Returns the active configuration.
    #[must_use]
    pub const fn config(&self) -> &FlowConfig {
        &self.config
    }

    /// Returns the runs currently executing on this orchestrator.
    #[must_use]
    pub fn active_runs(&self) -> Vec<RunId> {
        self.active
            .read()
            .map(|active| active.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Returns how many call record writes were logged as an alarm, that is,
    /// at or past [`AUDIT_FAILURE_ALARM_THRESHOLD`] consecutive failures.
    #[must_use]
    pub fn audit_alarms(&self) -> u64 {
        self.audit_alarms.load(Ordering::Relaxed)
    }

    // ========================================================================
    // Submission
    // ========================================================================

    /// Submits a run of `definition` with default priority.
    ///
    /// # Errors
    ///
    /// See [`Orchestrator::submit`].
    pub async fn submit_run(
        &self,
        definition: StepKey,
        inputs: Map<String, Value>,
        initial_state: Map<String, Value>,
    ) -> Result<RunId> {
        self.submit(
            RunRequest::new(definition)
                .with_inputs(inputs)
                .with_state(initial_state),
        )
        .await
    }

    /// Creates a run and queues it for scheduling.
    ///
    /// Requirement failures do not fail the call: the run is created and
    /// moved to FAILED. An unreachable lock backend leaves it QUEUED for the
    /// next tick.
    ///
    /// # Errors
    ///
    /// - [`Error::DefinitionNotFound`] if `definition` is not a registered top-level step
    /// - [`Error::InvalidInput`] for priority 0
    /// - a persistence error from the run store
    pub async fn submit(&self, request: RunRequest) -> Result<RunId> {
        let registered = self.registry.resolve_top_level(&request.definition)?;
        let priority = request.priority.unwrap_or(self.config.default_priority);
        if priority == 0 {
            return Err(Error::InvalidInput(
                "priority must be a positive integer".into(),
            ));
        }

        let run = Run::new(
            request.definition,
            request.inputs,
            request.initial_state,
            priority,
        );
        let run_id = run.id;
        self.store.insert_run(&run).await?;

        let span = run_span("submit", &run_id.to_string());
        self.prepare(run, &registered).instrument(span).await?;
        Ok(run_id)
    }

    async fn prepare(&self, run: Run, registered: &RegisteredStep) -> Result<()> {
        let run_id = run.id;
        tracing::info!(definition = %run.definition, priority = run.priority, "run submitted");

        let preparing = self
            .modify_run(run_id, |run| {
                if run.status != RunStatus::Pending {
                    return Ok(false);
                }
                run.transition_to(RunStatus::Preparing)?;
                Ok(true)
            })
            .await?;
        if !preparing {
            return Ok(());
        }

        let manifest = &registered.definition.manifest;
        let prepared = manifest
            .validate_args(&Value::Object(run.inputs.clone()))
            .and_then(|()| manifest.resolve_assets(&run.inputs));
        let (requirements, assignments) = match prepared {
            Ok(prepared) => prepared,
            Err(err) => {
                let err = Error::RequirementAnalysis {
                    message: err.to_string(),
                };
                tracing::warn!(error = %err, "run rejected before scheduling");
                return self.fail_run(run_id, &err).await;
            }
        };

        let queued = self
            .modify_run(run_id, move |run| {
                if run.status != RunStatus::Preparing {
                    return Ok(false);
                }
                run.assets = assignments;
                run.transition_to(RunStatus::Queued)?;
                Ok(true)
            })
            .await?;
        if !queued {
            return Ok(());
        }

        match self
            .scheduler
            .schedule_with_estimate(
                run_id,
                requirements,
                run.priority,
                manifest.estimated_duration,
            )
            .await
        {
            Ok(entry_id) => tracing::debug!(%entry_id, "run scheduled"),
            Err(err) if err.is_lock_backend_unavailable() => {
                tracing::warn!(error = %err, "lock backend unavailable; run stays queued");
            }
            Err(err @ (Error::RequirementAnalysis { .. } | Error::AssetUnavailable { .. })) => {
                return self.fail_run(run_id, &err).await;
            }
            Err(err) => return Err(err),
        }

        if let Err(err) = self.scheduler.dispatch_ready().await {
            tracing::warn!(error = %err, "dispatch after submission failed");
        }
        Ok(())
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Executes a dispatched run to a terminal status.
    ///
    /// A run that is no longer QUEUED (cancelled while waiting for a worker)
    /// is skipped and its schedule entry closed.
    ///
    /// # Errors
    ///
    /// Returns an error only when the run cannot be loaded or started; step
    /// failures end the run in FAILED and are not returned.
    pub async fn execute_run(self: &Arc<Self>, run_id: RunId) -> Result<RunStatus> {
        let span = run_span("execute", &run_id.to_string());
        self.execute(run_id).instrument(span).await
    }

    async fn execute(self: &Arc<Self>, run_id: RunId) -> Result<RunStatus> {
        let token = CancellationToken::new();
        self.register_active(run_id, token.clone())?;

        let started = self
            .modify_run(run_id, |run| {
                if run.status != RunStatus::Queued {
                    return Ok(None);
                }
                run.transition_to(RunStatus::Running)?;
                Ok(Some(run.clone()))
            })
            .await;
        let run = match started {
            Ok(Some(run)) => run,
            Ok(None) => {
                self.unregister_active(run_id);
                return self.skip_dispatched(run_id).await;
            }
            Err(err) => {
                self.unregister_active(run_id);
                return Err(err);
            }
        };

        let guard = ReleaseGuard::new(Arc::clone(&self.scheduler), run_id);
        tracing::info!(definition = %run.definition, "run started");
        if let Err(err) = self.scheduler.activate(run_id).await {
            tracing::warn!(error = %err, "failed to activate reservations");
        }
        let heartbeat = (!run.assets.is_empty()).then(|| self.spawn_heartbeat(run_id));

        let status = match self.build_context(&run, token) {
            Ok(ctx) => {
                let args = Value::Object(run.inputs.clone());
                let outcome = self.run_step(&ctx, &run.definition, args).await;
                match self.finalize(&ctx, outcome).await {
                    Ok(status) => status,
                    Err(err) => {
                        tracing::error!(error = %err, "failed to record run outcome");
                        self.fail_run(run_id, &err).await.ok();
                        RunStatus::Failed
                    }
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "run could not be started");
                if let Err(write) = self.fail_run(run_id, &err).await {
                    tracing::error!(error = %write, "failed to record run failure");
                }
                RunStatus::Failed
            }
        };

        if let Some(stop) = heartbeat {
            stop.cancel();
        }
        let terminal = schedule_status_for(status).unwrap_or(ScheduleStatus::Failed);
        if let Err(err) = guard.release(terminal).await {
            tracing::warn!(error = %err, "failed to release run reservations");
        }
        self.drain_control(run_id).await;
        self.unregister_active(run_id);
        tracing::info!(%status, "run finished");

        if let Err(err) = self.tick().await {
            tracing::warn!(error = %err, "post-run scheduling failed");
        }
        Ok(status)
    }

    async fn skip_dispatched(&self, run_id: RunId) -> Result<RunStatus> {
        let run = self.load_run(run_id).await?;
        tracing::warn!(status = %run.status, "dispatched run is not queued; skipping");
        if let Some(terminal) = schedule_status_for(run.status) {
            self.scheduler.finish(run_id, terminal).await?;
        }
        Ok(run.status)
    }

    fn build_context(self: &Arc<Self>, run: &Run, token: CancellationToken) -> Result<CallContext> {
        let mut handles: BTreeMap<String, Arc<dyn LiveAsset>> = BTreeMap::new();
        for asset in run.assets.values() {
            handles.insert(asset.clone(), self.assets.get_asset(asset)?);
        }
        let invoker: Arc<dyn StepInvoker> = Arc::clone(self) as Arc<dyn StepInvoker>;
        let scope = RunScope::new(run.id, Arc::clone(&self.store), invoker)
            .with_state(SharedState::new(run.initial_state.clone()))
            .with_last_sequence(run.call_sequence)
            .with_assets(handles, run.assets.clone())
            .with_cancellation(token);
        Ok(CallContext::new(scope))
    }

    async fn finalize(&self, ctx: &CallContext, outcome: Result<Value>) -> Result<RunStatus> {
        let run_id = ctx.run_id();
        let outcome = match outcome {
            // A step that gave up because the token fired counts as cancelled.
            Err(err) if !err.is_cancellation() && ctx.cancellation().is_cancelled() => {
                tracing::debug!(error = %err, "step failed after cancellation was requested");
                Err(Error::RunCancelled {
                    run_id,
                    reason: self.pending_cancel_reason(ctx).await,
                })
            }
            other => other,
        };
        let final_state = ctx.state().snapshot().ok();
        let sequence = ctx.last_sequence();

        self.modify_run(run_id, move |run| {
            run.call_sequence = run.call_sequence.max(sequence);
            run.final_state = final_state;
            match outcome {
                // The body caught a cancellation and returned normally.
                Ok(_) if run.status.is_terminal() => {
                    tracing::warn!(status = %run.status, "step returned after the run ended");
                }
                Ok(output) => {
                    run.transition_to(RunStatus::Completed)?;
                    run.output = Some(output);
                }
                Err(Error::RunCancelled { reason, .. }) => run.cancel(&reason)?,
                Err(err) if run.status.is_terminal() => {
                    tracing::warn!(status = %run.status, error = %err, "run already terminal");
                }
                Err(err) => {
                    tracing::warn!(error = %err, "run failed");
                    run.fail(&err)?;
                }
            }
            Ok(run.status)
        })
        .await
    }

    fn spawn_heartbeat(&self, run_id: RunId) -> CancellationToken {
        let stop = CancellationToken::new();
        let scheduler = Arc::clone(&self.scheduler);
        let every = self.config.lease_renew_interval;
        let stopped = stop.clone();
        tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        () = stopped.cancelled() => break,
                        _ = ticker.tick() => match scheduler.renew_leases(run_id).await {
                            Ok(renewed) => tracing::trace!(renewed, "leases renewed"),
                            Err(err) => tracing::warn!(error = %err, "lease renewal failed"),
                        },
                    }
                }
            }
            .instrument(run_span("heartbeat", &run_id.to_string())),
        );
        stop
    }

    // ========================================================================
    // Step invocation
    // ========================================================================

    /// Runs one step invocation within `ctx`.
    ///
    /// The call record is opened before control handling, so a run cancelled
    /// at this boundary still leaves a record (closed as UNKNOWN).
    ///
    /// # Errors
    ///
    /// - [`Error::StepNotRegistered`] if `step` is unknown
    /// - [`Error::RunCancelled`] if the run was cancelled
    /// - [`Error::StepExecution`] wrapping whatever the step raised
    pub async fn run_step(&self, ctx: &CallContext, step: &StepKey, args: Value) -> Result<Value> {
        let registered = self
            .registry
            .resolve(step)
            .ok_or_else(|| Error::StepNotRegistered {
                step: step.to_string(),
            })?;

        let sequence = ctx.next_sequence();
        let call_id = CallId::generate();
        let mut record = CallRecord::open(
            call_id,
            ctx.run_id(),
            ctx.current_call(),
            sequence,
            step.clone(),
            args.clone(),
        );
        let opened = self.audit(ctx, "call_open", self.store.insert_call(&record).await);
        let child = ctx.fork_for_nested_call(call_id);

        let span = step_span(&ctx.run_id().to_string(), &step.to_string(), sequence);
        let started = Instant::now();
        let outcome = async {
            self.handle_control(ctx).await?;
            registered.definition.manifest.validate_args(&args)?;
            invoke_body(&registered, &child, args).await
        }
        .instrument(span)
        .await
        .map_err(|err| err.into_step_error(&step.to_string()));

        let closed = match &outcome {
            Ok(result) => record.close_success(result.clone()),
            Err(err) if err.is_cancellation() => record.close_cancelled(),
            Err(err) => record.close_error(err),
        };
        if let Err(err) = closed {
            tracing::warn!(%call_id, error = %err, "call record already closed");
        }
        let write = if opened {
            self.store.update_call(&record).await
        } else {
            self.store.insert_call(&record).await
        };
        self.audit(ctx, "call_close", write);

        let status = match &outcome {
            Ok(_) => CallStatus::Success,
            Err(err) if err.is_cancellation() => CallStatus::Unknown,
            Err(_) => CallStatus::Error,
        };
        self.metrics.observe_step_duration(
            &step.to_string(),
            &status.to_string(),
            started.elapsed().as_secs_f64(),
        );
        outcome
    }

    fn audit(&self, ctx: &CallContext, record: &str, result: Result<()>) -> bool {
        match result {
            Ok(()) => {
                ctx.note_audit_success();
                true
            }
            Err(err) => {
                self.metrics.record_audit_failure(record);
                let consecutive = ctx.note_audit_failure();
                if consecutive >= AUDIT_FAILURE_ALARM_THRESHOLD {
                    self.audit_alarms.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        run_id = %ctx.run_id(),
                        record,
                        consecutive,
                        error = %err,
                        "call record writes keep failing"
                    );
                } else {
                    tracing::warn!(run_id = %ctx.run_id(), record, error = %err, "call record write failed");
                }
                false
            }
        }
    }

    // ========================================================================
    // Control handling (run side)
    // ========================================================================

    /// Applies pending control commands at a call boundary.
    ///
    /// Runs under the run's control gate. A pause keeps the gate until the
    /// run resumes or is cancelled, so sibling boundaries of a paused run
    /// block here instead of running their bodies, and only the paused
    /// boundary can take the RESUME.
    async fn handle_control(&self, ctx: &CallContext) -> Result<()> {
        let _gate = ctx.control_gate().lock().await;
        loop {
            let Some(command) = self.next_command(ctx.run_id()).await? else {
                if ctx.cancellation().is_cancelled() {
                    return self.apply_cancel(ctx, IMPLICIT_CANCEL_REASON).await;
                }
                return Ok(());
            };
            match command {
                ControlCommand::Pause => {
                    self.set_status(ctx, RunStatus::Pausing).await?;
                    self.set_status(ctx, RunStatus::Paused).await?;
                    tracing::info!(run_id = %ctx.run_id(), "run paused");
                    self.pause_loop(ctx).await?;
                }
                ControlCommand::Resume => tracing::debug!("resume ignored; run is not paused"),
                ControlCommand::Cancel { reason } => return self.apply_cancel(ctx, &reason).await,
                ControlCommand::Intervene { payload } => {
                    self.intervene(ctx, RunStatus::Running, &payload).await?;
                }
            }
        }
    }

    async fn pause_loop(&self, ctx: &CallContext) -> Result<()> {
        let poll = self.config.control_poll_interval;
        loop {
            match self.next_command(ctx.run_id()).await? {
                Some(ControlCommand::Resume) => {
                    self.set_status(ctx, RunStatus::Resuming).await?;
                    self.set_status(ctx, RunStatus::Running).await?;
                    tracing::info!(run_id = %ctx.run_id(), "run resumed");
                    return Ok(());
                }
                Some(ControlCommand::Cancel { reason }) => {
                    return self.apply_cancel(ctx, &reason).await;
                }
                Some(ControlCommand::Intervene { payload }) => {
                    self.intervene(ctx, RunStatus::Paused, &payload).await?;
                }
                Some(ControlCommand::Pause) => tracing::debug!("run already paused"),
                None if ctx.cancellation().is_cancelled() => {
                    return self.apply_cancel(ctx, IMPLICIT_CANCEL_REASON).await;
                }
                None => {
                    tokio::select! {
                        () = tokio::time::sleep(poll) => {}
                        () = ctx.cancellation().cancelled() => {}
                    }
                }
            }
        }
    }

    async fn intervene(&self, ctx: &CallContext, back_to: RunStatus, payload: &Value) -> Result<()> {
        self.set_status(ctx, RunStatus::Intervening).await?;
        tracing::info!(run_id = %ctx.run_id(), %payload, "intervention recorded");
        self.set_status(ctx, back_to).await
    }

    /// Moves the run through CANCELING to CANCELLED and fires its token.
    ///
    /// Always returns [`Error::RunCancelled`].
    async fn apply_cancel(&self, ctx: &CallContext, reason: &str) -> Result<()> {
        let run_id = ctx.run_id();
        let sequence = ctx.last_sequence();
        self.modify_run(run_id, move |run| {
            run.call_sequence = run.call_sequence.max(sequence);
            if matches!(run.status, RunStatus::Canceling | RunStatus::Cancelled) {
                return Ok(());
            }
            run.transition_to(RunStatus::Canceling)
        })
        .await?;
        let marker = reason.to_string();
        self.modify_run(run_id, move |run| run.cancel(&marker)).await?;

        ctx.cancellation().cancel();
        tracing::info!(%run_id, reason, "run cancelled");
        Err(Error::RunCancelled {
            run_id,
            reason: reason.to_string(),
        })
    }

    async fn set_status(&self, ctx: &CallContext, target: RunStatus) -> Result<()> {
        let sequence = ctx.last_sequence();
        self.modify_run(ctx.run_id(), move |run| {
            run.call_sequence = run.call_sequence.max(sequence);
            run.transition_to(target)
        })
        .await
    }

    /// Takes the oldest parseable command, discarding unknown ones.
    ///
    /// Callers hold the run's control gate, so a command is delivered to
    /// exactly one boundary.
    async fn next_command(&self, run_id: RunId) -> Result<Option<ControlCommand>> {
        while let Some(raw) = self.control.get(&run_id).await? {
            self.control.clear(&run_id).await?;
            match ControlCommand::parse(&raw) {
                Ok(command) => {
                    tracing::info!(%run_id, %command, "control command received");
                    return Ok(Some(command));
                }
                Err(err) => {
                    tracing::warn!(%run_id, %raw, error = %err, "discarding unknown control command");
                }
            }
        }
        Ok(None)
    }

    async fn pending_cancel_reason(&self, ctx: &CallContext) -> String {
        let run_id = ctx.run_id();
        let _gate = ctx.control_gate().lock().await;
        while let Ok(Some(command)) = self.next_command(run_id).await {
            if let ControlCommand::Cancel { reason } = command {
                return reason;
            }
        }
        IMPLICIT_CANCEL_REASON.to_string()
    }

    async fn drain_control(&self, run_id: RunId) {
        loop {
            match self.control.get(&run_id).await {
                Ok(Some(raw)) => {
                    tracing::debug!(%run_id, %raw, "dropping control command for finished run");
                    if let Err(err) = self.control.clear(&run_id).await {
                        tracing::warn!(%run_id, error = %err, "failed to drain control channel");
                        return;
                    }
                }
                Ok(None) => return,
                Err(err) => {
                    tracing::warn!(%run_id, error = %err, "failed to drain control channel");
                    return;
                }
            }
        }
    }

    // ========================================================================
    // Control API (operator side)
    // ========================================================================

    /// Requests that a run pause at its next step boundary.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RunNotFound`] or a persistence error.
    pub async fn pause_run(&self, run_id: RunId) -> Result<ControlOutcome> {
        let command = ControlCommand::Pause;
        let run = self.load_run(run_id).await?;
        let outcome = match run.status {
            status if status.is_terminal() => ControlOutcome::RunFinished,
            RunStatus::Pausing | RunStatus::Paused => ControlOutcome::AlreadyInEffect,
            _ => self.enqueue(run_id, &command).await?,
        };
        self.record_control(&command, outcome);
        Ok(outcome)
    }

    /// Requests that a paused run resume.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RunNotFound`] or a persistence error.
    pub async fn resume_run(&self, run_id: RunId) -> Result<ControlOutcome> {
        let command = ControlCommand::Resume;
        let run = self.load_run(run_id).await?;
        let outcome = match run.status {
            status if status.is_terminal() => ControlOutcome::RunFinished,
            RunStatus::Resuming => ControlOutcome::AlreadyInEffect,
            RunStatus::Pausing | RunStatus::Paused | RunStatus::Intervening => {
                self.enqueue(run_id, &command).await?
            }
            // Not paused and nothing queued that could pause it.
            _ => {
                if self.control.pending(&run_id).await? == 0 {
                    ControlOutcome::AlreadyInEffect
                } else {
                    self.enqueue(run_id, &command).await?
                }
            }
        };
        self.record_control(&command, outcome);
        Ok(outcome)
    }

    /// Cancels a run.
    ///
    /// A run that has not started executing is cancelled immediately and
    /// its schedule entry removed. An executing run is cancelled at its next
    /// step boundary.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RunNotFound`] or a persistence error.
    pub async fn cancel_run(&self, run_id: RunId, reason: &str) -> Result<ControlOutcome> {
        let command = ControlCommand::Cancel {
            reason: reason.to_string(),
        };
        let run = self.load_run(run_id).await?;
        let outcome = match run.status {
            RunStatus::Canceling | RunStatus::Cancelled => ControlOutcome::AlreadyInEffect,
            status if status.is_terminal() => ControlOutcome::RunFinished,
            status if status.is_pre_execution() && !self.is_active(run_id)? => {
                self.cancel_before_execution(run_id, &command, reason).await?
            }
            _ => self.enqueue_cancel(run_id, &command).await?,
        };
        self.record_control(&command, outcome);
        Ok(outcome)
    }

    /// Records an operator intervention at the next step boundary.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RunNotFound`] or a persistence error.
    pub async fn intervene_run(&self, run_id: RunId, payload: Value) -> Result<ControlOutcome> {
        let command = ControlCommand::Intervene { payload };
        let run = self.load_run(run_id).await?;
        let outcome = match run.status {
            status if status.is_terminal() => ControlOutcome::RunFinished,
            RunStatus::Intervening => ControlOutcome::AlreadyInEffect,
            _ => self.enqueue(run_id, &command).await?,
        };
        self.record_control(&command, outcome);
        Ok(outcome)
    }

    async fn cancel_before_execution(
        &self,
        run_id: RunId,
        command: &ControlCommand,
        reason: &str,
    ) -> Result<ControlOutcome> {
        let marker = reason.to_string();
        let applied = self
            .modify_run(run_id, move |run| {
                if !run.status.is_pre_execution() {
                    return Ok(false);
                }
                run.cancel(&marker)?;
                Ok(true)
            })
            .await?;
        if applied {
            self.scheduler.cancel_schedule(run_id, false).await?;
            tracing::info!(%run_id, reason, "run cancelled before execution");
            return Ok(ControlOutcome::Applied);
        }

        // Execution started in between.
        let run = self.load_run(run_id).await?;
        if run.status.is_terminal() {
            return Ok(ControlOutcome::RunFinished);
        }
        self.enqueue_cancel(run_id, command).await
    }

    async fn enqueue_cancel(&self, run_id: RunId, command: &ControlCommand) -> Result<ControlOutcome> {
        let outcome = self.enqueue(run_id, command).await?;
        let token = self
            .active
            .read()
            .map_err(poison_err)?
            .get(&run_id)
            .cloned();
        if let Some(token) = token {
            token.cancel();
        }
        Ok(outcome)
    }

    async fn enqueue(&self, run_id: RunId, command: &ControlCommand) -> Result<ControlOutcome> {
        self.control.put(&run_id, command.encode()?).await?;
        tracing::info!(%run_id, %command, "control command enqueued");
        Ok(ControlOutcome::Enqueued)
    }

    fn record_control(&self, command: &ControlCommand, outcome: ControlOutcome) {
        self.metrics
            .record_control_command(command.name(), outcome.as_str());
    }

    // ========================================================================
    // Queries and scheduling
    // ========================================================================

    /// Loads a run.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RunNotFound`] or a persistence error.
    pub async fn get_run(&self, run_id: RunId) -> Result<Run> {
        self.load_run(run_id).await
    }

    /// Lists a run's call records in sequence order.
    ///
    /// # Errors
    ///
    /// Returns a persistence error.
    pub async fn list_calls(&self, run_id: RunId) -> Result<Vec<CallRecord>> {
        self.store.list_calls(&run_id).await
    }

    /// Changes the priority of a run that is still waiting for dispatch.
    ///
    /// Returns false when the run has no pending schedule entry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for priority 0 or a persistence error.
    pub async fn update_priority(&self, run_id: RunId, priority: u8) -> Result<bool> {
        if !self.scheduler.update_priority(run_id, priority).await? {
            return Ok(false);
        }
        self.modify_run(run_id, move |run| {
            run.priority = priority;
            Ok(())
        })
        .await?;
        Ok(true)
    }

    /// Runs one scheduling pass: admission, lease sweep, dispatch.
    ///
    /// Runs whose requirements can never be met are moved to FAILED.
    ///
    /// # Errors
    ///
    /// Returns a persistence error from the schedule store.
    pub async fn tick(&self) -> Result<TickReport> {
        let _timing = time_scheduler_tick();
        let mut report = TickReport::default();

        for (run_id, admission) in self.scheduler.admit_queued().await? {
            let err = match admission {
                Admission::Ready => {
                    report.admitted += 1;
                    continue;
                }
                Admission::Waiting { .. } | Admission::Skipped => continue,
                Admission::Rejected { reason } => Error::RequirementAnalysis { message: reason },
                Admission::Exhausted { asset, attempts } => {
                    Error::AssetUnavailable { asset, attempts }
                }
            };
            self.fail_run(run_id, &err).await?;
            report.failed.push(run_id);
        }

        report.swept = self.scheduler.sweep_expired(Utc::now()).await?;
        match self.scheduler.dispatch_ready().await {
            Ok(dispatched) => report.dispatched = dispatched.len(),
            Err(err) => tracing::warn!(error = %err, "dispatch failed"),
        }
        if report != TickReport::default() {
            tracing::debug!(?report, "scheduler tick");
        }
        Ok(report)
    }

    /// Starts the worker and scheduler loops.
    ///
    /// Envelopes arriving on `dispatched` are executed concurrently, one task
    /// per run.
    #[must_use]
    pub fn start(
        self: &Arc<Self>,
        mut dispatched: mpsc::UnboundedReceiver<DispatchEnvelope>,
    ) -> OrchestratorHandle {
        let shutdown = CancellationToken::new();

        let this = Arc::clone(self);
        let stop = shutdown.clone();
        let worker = tokio::spawn(async move {
            let mut runs = JoinSet::new();
            loop {
                tokio::select! {
                    () = stop.cancelled() => break,
                    envelope = dispatched.recv() => {
                        let Some(envelope) = envelope else { break };
                        let orchestrator = Arc::clone(&this);
                        runs.spawn(async move {
                            if let Err(err) = orchestrator.execute_run(envelope.run_id).await {
                                tracing::error!(run_id = %envelope.run_id, error = %err, "run execution failed");
                            }
                        });
                    }
                    Some(_) = runs.join_next(), if !runs.is_empty() => {}
                }
            }
            this.cancel_active("orchestrator shutting down").await;
            while runs.join_next().await.is_some() {}
            tracing::debug!("worker loop stopped");
        });

        let this = Arc::clone(self);
        let stop = shutdown.clone();
        let ticker = tokio::spawn(async move {
            let every = this.config.scheduler_tick_interval;
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = this.tick().await {
                            tracing::warn!(error = %err, "scheduler tick failed");
                        }
                    }
                }
            }
            tracing::debug!("scheduler loop stopped");
        });

        OrchestratorHandle {
            shutdown,
            worker,
            ticker,
        }
    }

    async fn cancel_active(&self, reason: &str) {
        for run_id in self.active_runs() {
            if let Err(err) = self.cancel_run(run_id, reason).await {
                tracing::warn!(%run_id, error = %err, "failed to cancel run on shutdown");
            }
        }
    }

    // ========================================================================
    // Run record access
    // ========================================================================

    async fn load_run(&self, run_id: RunId) -> Result<Run> {
        self.store
            .get_run(&run_id)
            .await?
            .ok_or(Error::RunNotFound { run_id })
    }

    async fn fail_run(&self, run_id: RunId, error: &Error) -> Result<()> {
        self.modify_run(run_id, |run| {
            if run.status.is_terminal() {
                return Ok(());
            }
            run.fail(error)
        })
        .await
    }

    /// Read-modify-write of one run under its mutex.
    ///
    /// Nothing is saved when `f` fails.
    async fn modify_run<T, F>(&self, run_id: RunId, f: F) -> Result<T>
    where
        T: Send,
        F: FnOnce(&mut Run) -> Result<T> + Send,
    {
        let lock = self.run_lock(run_id)?;
        let _guard = lock.lock().await;

        let mut run = self.load_run(run_id).await?;
        let seen = run.status_history.len();
        let out = f(&mut run)?;
        self.store.save_run(&run).await?;

        for pair in run.status_history[seen.saturating_sub(1)..].windows(2) {
            self.metrics
                .record_run_transition(pair[0].status.as_str(), pair[1].status.as_str());
        }
        if run.status.is_terminal() {
            self.forget_run_lock(run_id);
        }
        Ok(out)
    }

    fn run_lock(&self, run_id: RunId) -> Result<Arc<Mutex<()>>> {
        let mut locks = self.run_locks.lock().map_err(poison_err)?;
        Ok(Arc::clone(locks.entry(run_id).or_default()))
    }

    fn forget_run_lock(&self, run_id: RunId) {
        if let Ok(mut locks) = self.run_locks.lock() {
            locks.remove(&run_id);
        }
    }

    fn register_active(&self, run_id: RunId, token: CancellationToken) -> Result<()> {
        let mut active = self.active.write().map_err(poison_err)?;
        active.insert(run_id, token);
        self.metrics.set_active_runs(active.len());
        Ok(())
    }

    fn unregister_active(&self, run_id: RunId) {
        if let Ok(mut active) = self.active.write() {
            active.remove(&run_id);
            self.metrics.set_active_runs(active.len());
        }
    }

    fn is_active(&self, run_id: RunId) -> Result<bool> {
        Ok(self.active.read().map_err(poison_err)?.contains_key(&run_id))
    }
}

#[async_trait]
impl StepInvoker for Orchestrator {
    async fn invoke(&self, ctx: &CallContext, step: &StepKey, args: Value) -> Result<Value> {
        self.run_step(ctx, step, args).await
    }
}

async fn invoke_body(registered: &RegisteredStep, ctx: &CallContext, args: Value) -> Result<Value> {
    match &registered.definition.body {
        StepBody::Async(step) => step.run(ctx, args).await,
        StepBody::Blocking(body) => {
            let body = Arc::clone(body);
            let ctx = ctx.clone();
            tokio::task::spawn_blocking(move || body(&ctx, args))
                .await
                .map_err(|err| Error::step_failure(format!("blocking step did not finish: {err}")))?
        }
    }
}

/// Releases a run's reservations and closes its schedule entry.
///
/// Dropping the guard without calling [`ReleaseGuard::release`] (a panic or
/// an aborted task) still releases, from a spawned task, marking the entry
/// FAILED.
struct ReleaseGuard {
    scheduler: Arc<Scheduler>,
    run_id: RunId,
    armed: bool,
}

impl ReleaseGuard {
    const fn new(scheduler: Arc<Scheduler>, run_id: RunId) -> Self {
        Self {
            scheduler,
            run_id,
            armed: true,
        }
    }

    async fn release(mut self, terminal: ScheduleStatus) -> Result<()> {
        self.armed = false;
        self.scheduler.finish(self.run_id, terminal).await
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = Handle::try_current() else {
            tracing::error!(run_id = %self.run_id, "no runtime to release reservations on");
            return;
        };
        let scheduler = Arc::clone(&self.scheduler);
        let run_id = self.run_id;
        handle.spawn(async move {
            if let Err(err) = scheduler.finish(run_id, ScheduleStatus::Failed).await {
                tracing::error!(%run_id, error = %err, "failed to release reservations of an aborted run");
            }
        });
    }
}

/// Handle to the background loops started by [`Orchestrator::start`].
#[derive(Debug)]
pub struct OrchestratorHandle {
    shutdown: CancellationToken,
    worker: JoinHandle<()>,
    ticker: JoinHandle<()>,
}

impl OrchestratorHandle {
    /// Stops intake, cancels executing runs and waits for them to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(err) = self.ticker.await {
            tracing::warn!(error = %err, "scheduler loop panicked");
        }
        if let Err(err) = self.worker.await {
            tracing::warn!(error = %err, "worker loop panicked");
        }
    }
}

//! Observability metrics for orchestration.
//!
//! Metrics go through the `metrics` crate facade; without an installed
//! recorder every call is a no-op. They double as the side channel for
//! failures that must not abort a run, such as call record writes.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `workcell_flow_run_transitions_total` | Counter | `from_state`, `to_state` | Run state transitions |
//! | `workcell_flow_step_duration_seconds` | Histogram | `step`, `status` | Step execution time |
//! | `workcell_flow_active_runs` | Gauge | - | Runs currently executing |
//! | `workcell_flow_reservations_total` | Counter | `result` | Reservation attempts by outcome |
//! | `workcell_flow_dispatches_total` | Counter | `result` | Dispatch hand-offs by outcome |
//! | `workcell_flow_audit_write_failures_total` | Counter | `record` | Failed call record writes |
//! | `workcell_flow_control_commands_total` | Counter | `command`, `result` | Control commands issued |
//! | `workcell_flow_scheduler_tick_duration_seconds` | Histogram | - | Scheduler tick processing time |
//! | `workcell_flow_asset_backups_total` | Counter | `result` | Asset snapshot writes |
//!
//! ## Usage
//!
//! ```rust,no_run
//! use workcell_flow::metrics::FlowMetrics;
//!
//! let metrics = FlowMetrics::new();
//! metrics.record_run_transition("QUEUED", "RUNNING");
//! metrics.observe_step_duration("transfer@1", "SUCCESS", 2.5);
//! metrics.set_active_runs(3);
//! ```

use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: Run state transitions.
    pub const RUN_TRANSITIONS_TOTAL: &str = "workcell_flow_run_transitions_total";
    /// Histogram: Step execution duration in seconds.
    pub const STEP_DURATION_SECONDS: &str = "workcell_flow_step_duration_seconds";
    /// Gauge: Runs currently executing.
    pub const ACTIVE_RUNS: &str = "workcell_flow_active_runs";
    /// Counter: Reservation attempts.
    pub const RESERVATIONS_TOTAL: &str = "workcell_flow_reservations_total";
    /// Counter: Dispatch hand-offs.
    pub const DISPATCHES_TOTAL: &str = "workcell_flow_dispatches_total";
    /// Counter: Failed audit record writes.
    pub const AUDIT_WRITE_FAILURES_TOTAL: &str = "workcell_flow_audit_write_failures_total";
    /// Counter: Control commands issued.
    pub const CONTROL_COMMANDS_TOTAL: &str = "workcell_flow_control_commands_total";
    /// Histogram: Scheduler tick processing time in seconds.
    pub const SCHEDULER_TICK_DURATION_SECONDS: &str =
        "workcell_flow_scheduler_tick_duration_seconds";
    /// Counter: Asset snapshot writes.
    pub const ASSET_BACKUPS_TOTAL: &str = "workcell_flow_asset_backups_total";
}

/// Label keys used across metrics.
pub mod labels {
    /// Previous run state (for transitions).
    pub const FROM_STATE: &str = "from_state";
    /// Target run state (for transitions).
    pub const TO_STATE: &str = "to_state";
    /// Step key (`name@version`).
    pub const STEP: &str = "step";
    /// Call outcome (SUCCESS, ERROR, UNKNOWN).
    pub const STATUS: &str = "status";
    /// Result of an operation.
    pub const RESULT: &str = "result";
    /// Kind of audit record that failed to write.
    pub const RECORD: &str = "record";
    /// Control command name.
    pub const COMMAND: &str = "command";
}

/// High-level interface for recording orchestration metrics.
///
/// Cheap to clone and share across tasks.
#[derive(Debug, Clone, Default)]
pub struct FlowMetrics {
    _private: (),
}

impl FlowMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a run state transition.
    pub fn record_run_transition(&self, from_state: &str, to_state: &str) {
        counter!(
            names::RUN_TRANSITIONS_TOTAL,
            labels::FROM_STATE => from_state.to_string(),
            labels::TO_STATE => to_state.to_string(),
        )
        .increment(1);
    }

    /// Records how long a step ran.
    pub fn observe_step_duration(&self, step: &str, status: &str, duration_secs: f64) {
        histogram!(
            names::STEP_DURATION_SECONDS,
            labels::STEP => step.to_string(),
            labels::STATUS => status.to_string(),
        )
        .record(duration_secs);
    }

    /// Sets the number of executing runs.
    #[allow(clippy::cast_precision_loss)] // Gauge values are typically small
    pub fn set_active_runs(&self, count: usize) {
        gauge!(names::ACTIVE_RUNS).set(count as f64);
    }

    /// Records a reservation attempt outcome.
    pub fn record_reservation(&self, result: &str) {
        counter!(
            names::RESERVATIONS_TOTAL,
            labels::RESULT => result.to_string(),
        )
        .increment(1);
    }

    /// Records a dispatch hand-off outcome.
    pub fn record_dispatch(&self, result: &str) {
        counter!(
            names::DISPATCHES_TOTAL,
            labels::RESULT => result.to_string(),
        )
        .increment(1);
    }

    /// Records a failed audit record write.
    pub fn record_audit_failure(&self, record: &str) {
        counter!(
            names::AUDIT_WRITE_FAILURES_TOTAL,
            labels::RECORD => record.to_string(),
        )
        .increment(1);
    }

    /// Records a control command and what the control call did with it.
    pub fn record_control_command(&self, command: &str, result: &str) {
        counter!(
            names::CONTROL_COMMANDS_TOTAL,
            labels::COMMAND => command.to_string(),
            labels::RESULT => result.to_string(),
        )
        .increment(1);
    }

    /// Records scheduler tick duration.
    pub fn observe_scheduler_tick_duration(&self, duration: Duration) {
        histogram!(names::SCHEDULER_TICK_DURATION_SECONDS).record(duration.as_secs_f64());
    }

    /// Records an asset snapshot write.
    pub fn record_asset_backup(&self, result: &str) {
        counter!(
            names::ASSET_BACKUPS_TOTAL,
            labels::RESULT => result.to_string(),
        )
        .increment(1);
    }
}

/// RAII guard for timing operations.
///
/// Automatically records duration when dropped.
///
/// ## Example
///
/// ```rust,no_run
/// use workcell_flow::metrics::{FlowMetrics, TimingGuard};
///
/// let metrics = FlowMetrics::new();
///
/// {
///     let _guard = TimingGuard::new(|duration| {
///         metrics.observe_scheduler_tick_duration(duration);
///     });
///
///     // Do work...
/// } // Duration recorded automatically on drop
/// ```
pub struct TimingGuard<F>
where
    F: FnOnce(Duration),
{
    start: Instant,
    on_drop: Option<F>,
}

impl<F> TimingGuard<F>
where
    F: FnOnce(Duration),
{
    /// Creates a new timing guard that will call `on_drop` with the elapsed duration.
    pub fn new(on_drop: F) -> Self {
        Self {
            start: Instant::now(),
            on_drop: Some(on_drop),
        }
    }

    /// Returns the elapsed time since the guard was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl<F> Drop for TimingGuard<F>
where
    F: FnOnce(Duration),
{
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f(self.start.elapsed());
        }
    }
}

/// Creates a timing guard for scheduler tick metrics.
#[must_use]
pub fn time_scheduler_tick() -> TimingGuard<impl FnOnce(Duration)> {
    TimingGuard::new(|duration| {
        histogram!(names::SCHEDULER_TICK_DURATION_SECONDS).record(duration.as_secs_f64());
    })
}

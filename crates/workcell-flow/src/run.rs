//! Protocol run tracking.
//!
//! A run is one execution of a top-level step definition. It captures:
//!
//! - **Inputs**: the parameters the run was submitted with
//! - **Assets**: which named asset each asset parameter resolved to
//! - **State**: shared-state snapshots at start and end
//! - **Outcome**: status, output payload and the last error
//!
//! Runs are mutated only by the orchestrator and never deleted. Every status
//! change is appended to `status_history`, so the path a run took through the
//! state machine is always inspectable.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use workcell_core::RunId;

use crate::error::{Error, Result};
use crate::registry::StepKey;

/// Run state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// Created, not yet examined.
    Pending,
    /// Resource requirements are being resolved.
    Preparing,
    /// Waiting in the scheduler for assets and a worker.
    Queued,
    /// Steps are executing.
    Running,
    /// A pause was requested and is being applied.
    Pausing,
    /// Suspended at a step boundary.
    Paused,
    /// Leaving the paused state.
    Resuming,
    /// An intervention is being recorded.
    Intervening,
    /// A cancel was requested and is being applied.
    Canceling,
    /// Cancelled by an operator.
    Cancelled,
    /// The top-level step returned normally.
    Completed,
    /// The run failed.
    Failed,
}

impl RunStatus {
    /// Every status, in declaration order.
    pub const ALL: [Self; 12] = [
        Self::Pending,
        Self::Preparing,
        Self::Queued,
        Self::Running,
        Self::Pausing,
        Self::Paused,
        Self::Resuming,
        Self::Intervening,
        Self::Canceling,
        Self::Cancelled,
        Self::Completed,
        Self::Failed,
    ];

    /// Returns true if this is a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns true if the run is held at a step boundary.
    #[must_use]
    pub const fn is_paused(&self) -> bool {
        matches!(self, Self::Pausing | Self::Paused)
    }

    /// Returns true while the run has not started executing steps.
    #[must_use]
    pub const fn is_pre_execution(&self) -> bool {
        matches!(self, Self::Pending | Self::Preparing | Self::Queued)
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        // Cancellation in progress may never be masked as a failure.
        if target == Self::Failed {
            return !self.is_terminal() && *self != Self::Canceling;
        }
        match self {
            Self::Pending => matches!(target, Self::Preparing | Self::Canceling),
            Self::Preparing => matches!(target, Self::Queued | Self::Pausing | Self::Canceling),
            Self::Queued => matches!(target, Self::Running | Self::Canceling),
            Self::Running => matches!(
                target,
                Self::Pausing | Self::Canceling | Self::Intervening | Self::Completed
            ),
            Self::Pausing => matches!(target, Self::Paused | Self::Canceling),
            Self::Paused => matches!(
                target,
                Self::Resuming | Self::Canceling | Self::Intervening
            ),
            Self::Resuming => matches!(target, Self::Running),
            Self::Intervening => {
                matches!(target, Self::Running | Self::Paused | Self::Canceling)
            }
            Self::Canceling => matches!(target, Self::Cancelled),
            Self::Completed | Self::Failed | Self::Cancelled => false,
        }
    }

    /// Returns the status name as stored and displayed.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Preparing => "PREPARING",
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Pausing => "PAUSING",
            Self::Paused => "PAUSED",
            Self::Resuming => "RESUMING",
            Self::Intervening => "INTERVENING",
            Self::Canceling => "CANCELING",
            Self::Cancelled => "CANCELLED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry in a run's status history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChange {
    /// Status entered.
    pub status: RunStatus,
    /// When it was entered.
    pub at: DateTime<Utc>,
}

/// The last error a run recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunError {
    /// Human-readable message.
    pub message: String,
    /// Rendered cause chain.
    pub trace: String,
}

/// One protocol execution instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    /// Unique run identifier.
    pub id: RunId,
    /// The top-level step this run executes.
    pub definition: StepKey,
    /// Current status.
    pub status: RunStatus,
    /// Scheduling priority (higher runs first).
    pub priority: u8,
    /// Input parameters.
    pub inputs: Map<String, Value>,
    /// Asset parameter name to reserved asset name.
    pub assets: BTreeMap<String, String>,
    /// Shared state when the run started.
    pub initial_state: Map<String, Value>,
    /// Shared state when the run finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_state: Option<Map<String, Value>>,
    /// Output payload (return value, error details or cancellation marker).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// The last error, if the run failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
    /// Last call sequence number handed out (0 before the first call).
    pub call_sequence: u64,
    /// Every status the run has entered, oldest first.
    pub status_history: Vec<StatusChange>,
    /// When the run was created.
    pub created_at: DateTime<Utc>,
    /// When the run first entered RUNNING.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the run reached a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl Run {
    /// Creates a new run in PENDING.
    #[must_use]
    pub fn new(
        definition: StepKey,
        inputs: Map<String, Value>,
        initial_state: Map<String, Value>,
        priority: u8,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: RunId::generate(),
            definition,
            status: RunStatus::Pending,
            priority,
            inputs,
            assets: BTreeMap::new(),
            initial_state,
            final_state: None,
            output: None,
            error: None,
            call_sequence: 0,
            status_history: vec![StatusChange {
                status: RunStatus::Pending,
                at: now,
            }],
            created_at: now,
            started_at: None,
            ended_at: None,
        }
    }

    /// Attempts to transition to a new status.
    ///
    /// # Errors
    ///
    /// Returns an error if the transition is invalid.
    #[tracing::instrument(skip(self), fields(run_id = %self.id, from = %self.status, to = %target))]
    pub fn transition_to(&mut self, target: RunStatus) -> Result<()> {
        if !self.status.can_transition_to(target) {
            return Err(Error::InvalidStateTransition {
                from: self.status.to_string(),
                to: target.to_string(),
                reason: "invalid run state transition".into(),
            });
        }

        let now = Utc::now();

        match target {
            RunStatus::Running if self.started_at.is_none() => {
                self.started_at = Some(now);
            }
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled => {
                self.ended_at = Some(now);
            }
            _ => {}
        }

        self.status = target;
        self.status_history.push(StatusChange {
            status: target,
            at: now,
        });
        Ok(())
    }

    /// Records a failure and moves the run to FAILED.
    ///
    /// # Errors
    ///
    /// Returns an error if the run cannot fail from its current status.
    pub fn fail(&mut self, error: &Error) -> Result<()> {
        self.transition_to(RunStatus::Failed)?;
        let message = error.to_string();
        self.output = Some(serde_json::json!({ "error": message }));
        self.error = Some(RunError {
            message,
            trace: error.trace(),
        });
        Ok(())
    }

    /// Drives the run through CANCELING to CANCELLED, recording the marker.
    ///
    /// Idempotent: an already-cancelled run is left untouched.
    ///
    /// # Errors
    ///
    /// Returns an error if the run cannot be cancelled from its current status.
    pub fn cancel(&mut self, reason: &str) -> Result<()> {
        if self.status == RunStatus::Cancelled {
            return Ok(());
        }
        if self.status != RunStatus::Canceling {
            self.transition_to(RunStatus::Canceling)?;
        }
        self.transition_to(RunStatus::Cancelled)?;
        self.output = Some(serde_json::json!({ "cancelled": true, "reason": reason }));
        Ok(())
    }

    /// Returns the statuses visited, oldest first.
    #[must_use]
    pub fn status_path(&self) -> Vec<RunStatus> {
        self.status_history.iter().map(|c| c.status).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run() -> Run {
        Run::new(StepKey::new("protocol", "1"), Map::new(), Map::new(), 1)
    }

    #[test]
    fn happy_path_is_recorded() -> Result<()> {
        let mut run = run();
        for status in [
            RunStatus::Preparing,
            RunStatus::Queued,
            RunStatus::Running,
            RunStatus::Completed,
        ] {
            run.transition_to(status)?;
        }
        assert_eq!(
            run.status_path(),
            vec![
                RunStatus::Pending,
                RunStatus::Preparing,
                RunStatus::Queued,
                RunStatus::Running,
                RunStatus::Completed
            ]
        );
        assert!(run.started_at.is_some());
        assert!(run.ended_at.is_some());
        Ok(())
    }

    #[test]
    fn terminal_states_accept_nothing() {
        for terminal in RunStatus::ALL.iter().filter(|s| s.is_terminal()) {
            for target in RunStatus::ALL {
                assert!(!terminal.can_transition_to(target), "{terminal} -> {target}");
            }
        }
    }

    #[test]
    fn canceling_cannot_fail() {
        assert!(!RunStatus::Canceling.can_transition_to(RunStatus::Failed));
        assert!(RunStatus::Paused.can_transition_to(RunStatus::Failed));
    }

    #[test]
    fn pause_cycle_is_valid() -> Result<()> {
        let mut run = run();
        for status in [
            RunStatus::Preparing,
            RunStatus::Queued,
            RunStatus::Running,
            RunStatus::Pausing,
            RunStatus::Paused,
            RunStatus::Intervening,
            RunStatus::Paused,
            RunStatus::Resuming,
            RunStatus::Running,
        ] {
            run.transition_to(status)?;
        }
        assert_eq!(run.status, RunStatus::Running);
        Ok(())
    }

    #[test]
    fn invalid_transition_is_rejected() {
        let mut run = run();
        let err = run.transition_to(RunStatus::Running).unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.status_history.len(), 1);
    }

    #[test]
    fn cancel_is_idempotent_and_marks_output() -> Result<()> {
        let mut run = run();
        run.cancel("operator request")?;
        run.cancel("again")?;
        assert_eq!(
            run.status_path(),
            vec![RunStatus::Pending, RunStatus::Canceling, RunStatus::Cancelled]
        );
        assert_eq!(run.output.as_ref().expect("output")["cancelled"], Value::Bool(true));
        Ok(())
    }

    #[test]
    fn fail_records_error_details() -> Result<()> {
        let mut run = run();
        run.fail(&Error::step("mix@1", "stirrer jammed"))?;
        assert_eq!(run.status, RunStatus::Failed);
        let error = run.error.expect("error");
        assert!(error.message.contains("stirrer jammed"));
        assert!(run.ended_at.is_some());
        Ok(())
    }

    #[test]
    fn status_serializes_screaming_snake() {
        let json = serde_json::to_string(&RunStatus::Intervening).expect("serialize");
        assert_eq!(json, "\"INTERVENING\"");
    }
}

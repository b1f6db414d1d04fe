//! Error types for the orchestration domain.

use std::fmt::Write as _;

use workcell_core::RunId;

/// The result type used throughout workcell-flow.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in orchestration operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A run was submitted against a definition the registry cannot resolve.
    #[error("definition not found: {definition}")]
    DefinitionNotFound {
        /// The unresolved definition reference.
        definition: String,
    },

    /// A step was invoked without registered runtime metadata.
    #[error("step not registered: {step}")]
    StepNotRegistered {
        /// The step key that failed to resolve.
        step: String,
    },

    /// The lock backend could not be reached.
    #[error("lock backend unavailable: {message}")]
    LockBackendUnavailable {
        /// Description of the backend failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Required assets could not be reserved within the retry policy.
    #[error("asset unavailable: {asset} ({attempts} reservation attempts)")]
    AssetUnavailable {
        /// The asset that blocked reservation.
        asset: String,
        /// Number of reservation attempts made.
        attempts: u32,
    },

    /// The run was cancelled. A control-flow signal, not a failure.
    #[error("run {run_id} cancelled: {reason}")]
    RunCancelled {
        /// The cancelled run.
        run_id: RunId,
        /// Why the run was cancelled.
        reason: String,
    },

    /// A step body raised an error.
    #[error("step {step} failed: {message}")]
    StepExecution {
        /// The failing step key.
        step: String,
        /// Description of the failure.
        message: String,
        /// The originating error, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The persistence handle failed.
    #[error("persistence error: {message}")]
    Persistence {
        /// Description of the failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A run was not found.
    #[error("run not found: {run_id}")]
    RunNotFound {
        /// The run ID that was not found.
        run_id: RunId,
    },

    /// A live asset was not found in the registry.
    #[error("asset not found: {name}")]
    AssetNotFound {
        /// The asset name that was looked up.
        name: String,
    },

    /// A live asset with this name is already registered.
    #[error("asset already registered: {name}")]
    DuplicateAsset {
        /// The conflicting asset name.
        name: String,
    },

    /// An invalid state transition was attempted.
    #[error("invalid state transition: {from} -> {to} ({reason})")]
    InvalidStateTransition {
        /// The current state.
        from: String,
        /// The attempted target state.
        to: String,
        /// The reason the transition is invalid.
        reason: String,
    },

    /// Resource requirements failed analysis.
    #[error("requirement analysis failed: {message}")]
    RequirementAnalysis {
        /// Description of the failure.
        message: String,
    },

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Configuration is missing or malformed.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the problem.
        message: String,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// An error from workcell-core.
    #[error("core error: {0}")]
    Core(workcell_core::Error),
}

impl From<workcell_core::Error> for Error {
    fn from(err: workcell_core::Error) -> Self {
        match err {
            workcell_core::Error::LockBackendUnavailable { message, source } => {
                Self::LockBackendUnavailable { message, source }
            }
            other => Self::Core(other),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

impl Error {
    /// Creates a step execution error from a message.
    ///
    /// This is what step bodies return for application failures.
    #[must_use]
    pub fn step(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StepExecution {
            step: step.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Creates a step execution error attributed to whichever step raises it.
    ///
    /// The step wrapper fills in the step key when the error leaves the body.
    #[must_use]
    pub fn step_failure(message: impl Into<String>) -> Self {
        Self::step(String::new(), message)
    }

    /// Creates a new persistence error.
    #[must_use]
    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new persistence error with a source.
    #[must_use]
    pub fn persistence_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Persistence {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Returns true for the run-cancelled control-flow signal.
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::RunCancelled { .. })
    }

    /// Returns true if the lock backend could not be reached.
    #[must_use]
    pub const fn is_lock_backend_unavailable(&self) -> bool {
        matches!(self, Self::LockBackendUnavailable { .. })
    }

    /// Wraps an error escaping a step body as [`Error::StepExecution`].
    ///
    /// Cancellation and errors that already name a failing step pass through
    /// unchanged so nested failures keep their innermost attribution.
    #[must_use]
    pub fn into_step_error(self, step: &str) -> Self {
        match self {
            Self::StepExecution {
                step: ref unattributed,
                message,
                source,
            } if unattributed.is_empty() => Self::StepExecution {
                step: step.to_string(),
                message,
                source,
            },
            Self::RunCancelled { .. } | Self::StepExecution { .. } => self,
            other => Self::StepExecution {
                step: step.to_string(),
                message: other.to_string(),
                source: Some(Box::new(other)),
            },
        }
    }

    /// Renders the error and its `source()` chain, one cause per line.
    #[must_use]
    pub fn trace(&self) -> String {
        let mut out = self.to_string();
        let mut cause = std::error::Error::source(self);
        while let Some(err) = cause {
            let _ = write!(out, "\ncaused by: {err}");
            cause = std::error::Error::source(err);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_lock_backend_error_keeps_its_identity() {
        let core = workcell_core::Error::lock_backend(
            "write locks/assets/arm.lock.json",
            workcell_core::Error::storage("timeout"),
        );
        let err: Error = core.into();
        assert!(err.is_lock_backend_unavailable());
        assert!(err.trace().contains("timeout"));
    }

    #[test]
    fn other_core_errors_are_wrapped() {
        let err: Error = workcell_core::Error::InvalidInput("bad".into()).into();
        assert!(matches!(err, Error::Core(_)));
    }

    #[test]
    fn cancellation_passes_through_step_wrapping() {
        let err = Error::RunCancelled {
            run_id: RunId::generate(),
            reason: "operator".into(),
        }
        .into_step_error("transfer@1");
        assert!(err.is_cancellation());
    }

    #[test]
    fn step_wrapping_preserves_origin() {
        let err = Error::InvalidInput("volume must be positive".into()).into_step_error("dispense@2");
        assert!(matches!(err, Error::StepExecution { ref step, .. } if step == "dispense@2"));
        let trace = err.trace();
        assert!(trace.contains("volume must be positive"));
        assert!(trace.contains("caused by"));

        let again = err.into_step_error("outer@1");
        assert!(matches!(again, Error::StepExecution { ref step, .. } if step == "dispense@2"));
    }

    #[test]
    fn unattributed_step_failure_takes_the_wrapping_step() {
        let err = Error::step_failure("tip not found").into_step_error("pick_tip@1");
        assert_eq!(err.to_string(), "step pick_tip@1 failed: tip not found");
    }

    #[test]
    fn state_transition_error_display() {
        let err = Error::InvalidStateTransition {
            from: "COMPLETED".into(),
            to: "RUNNING".into(),
            reason: "terminal".into(),
        };
        assert_eq!(
            err.to_string(),
            "invalid state transition: COMPLETED -> RUNNING (terminal)"
        );
    }
}

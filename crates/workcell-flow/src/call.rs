//! Audit records for step invocations.
//!
//! Every step invocation opens a [`CallRecord`]; the parent pointer links the
//! records of one run into a tree rooted at the top-level call. A record is
//! closed exactly once and is immutable afterwards.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use workcell_core::{CallId, RunId};

use crate::error::{Error, Result};
use crate::registry::StepKey;

/// Outcome of a step invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallStatus {
    /// The step returned normally.
    Success,
    /// The step raised an error.
    Error,
    /// Still open, or ended without a result (cancellation).
    Unknown,
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Success => "SUCCESS",
            Self::Error => "ERROR",
            Self::Unknown => "UNKNOWN",
        })
    }
}

/// One invocation of a step within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    /// Unique call identifier.
    pub call_id: CallId,
    /// Run the call belongs to.
    pub run_id: RunId,
    /// Enclosing call; `None` only for the top-level call.
    pub parent_call_id: Option<CallId>,
    /// Run-wide sequence number, assigned before the call begins.
    pub sequence: u64,
    /// The invoked step.
    pub step: StepKey,
    /// Serialized input arguments.
    pub args: Value,
    /// Outcome; `Unknown` while open.
    pub status: CallStatus,
    /// Serialized return value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error message, for failed or cancelled calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Rendered cause chain, for failed calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
    /// When the call started.
    pub started_at: DateTime<Utc>,
    /// When the call ended; `None` while open.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl CallRecord {
    /// Opens a record for a call that is about to begin.
    #[must_use]
    pub fn open(
        call_id: CallId,
        run_id: RunId,
        parent_call_id: Option<CallId>,
        sequence: u64,
        step: StepKey,
        args: Value,
    ) -> Self {
        Self {
            call_id,
            run_id,
            parent_call_id,
            sequence,
            step,
            args,
            status: CallStatus::Unknown,
            result: None,
            error: None,
            trace: None,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    /// Returns true once the record has been closed.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.ended_at.is_some()
    }

    /// Closes the record with the step's return value.
    ///
    /// # Errors
    ///
    /// Returns an error if the record is already closed.
    pub fn close_success(&mut self, result: Value) -> Result<()> {
        self.close(CallStatus::Success)?;
        self.result = Some(result);
        Ok(())
    }

    /// Closes the record with the error the step raised.
    ///
    /// # Errors
    ///
    /// Returns an error if the record is already closed.
    pub fn close_error(&mut self, error: &Error) -> Result<()> {
        self.close(CallStatus::Error)?;
        self.error = Some(error.to_string());
        self.trace = Some(error.trace());
        Ok(())
    }

    /// Closes the record of a call the run was cancelled during.
    ///
    /// # Errors
    ///
    /// Returns an error if the record is already closed.
    pub fn close_cancelled(&mut self) -> Result<()> {
        self.close(CallStatus::Unknown)?;
        self.error = Some("run cancelled".to_string());
        Ok(())
    }

    fn close(&mut self, status: CallStatus) -> Result<()> {
        if self.is_closed() {
            return Err(Error::InvalidStateTransition {
                from: self.status.to_string(),
                to: status.to_string(),
                reason: format!("call {} is already closed", self.call_id),
            });
        }
        self.status = status;
        self.ended_at = Some(Utc::now());
        Ok(())
    }
}

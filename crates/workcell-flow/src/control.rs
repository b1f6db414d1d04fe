//! Control commands and the run-scoped control channel.
//!
//! Operators steer a run by enqueueing commands; the run consumes them at
//! step boundaries. The channel is a per-run FIFO mailbox of serialized
//! commands: [`ControlChannel::get`] peeks the oldest entry and
//! [`ControlChannel::clear`] acknowledges it. Delivery is at-least-once, so
//! consumption is idempotent on the run side.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use workcell_core::RunId;

use crate::error::{Error, Result};

/// An out-of-band instruction for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlCommand {
    /// Suspend at the next step boundary.
    Pause,
    /// Leave the paused state.
    Resume,
    /// Abort the run.
    Cancel {
        /// Operator-supplied reason.
        reason: String,
    },
    /// Record an operator intervention.
    Intervene {
        /// Opaque intervention payload.
        #[serde(default)]
        payload: Value,
    },
}

impl ControlCommand {
    /// Returns the command name used in logs and metrics.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Pause => "PAUSE",
            Self::Resume => "RESUME",
            Self::Cancel { .. } => "CANCEL",
            Self::Intervene { .. } => "INTERVENE",
        }
    }

    /// Serializes the command for the channel.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses a command read from the channel.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] for unknown or malformed commands.
    pub fn parse(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What a control call did.
///
/// Control calls report the enqueue, never the eventual transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlOutcome {
    /// The command was enqueued for the run.
    Enqueued,
    /// The run is already in the command's transitional or target state.
    AlreadyInEffect,
    /// The run is terminal; nothing was enqueued.
    RunFinished,
    /// The command was applied directly (cancel before execution).
    Applied,
}

impl ControlOutcome {
    /// Returns the outcome name used in logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Enqueued => "enqueued",
            Self::AlreadyInEffect => "already_in_effect",
            Self::RunFinished => "run_finished",
            Self::Applied => "applied",
        }
    }
}

/// Run-keyed mailbox used to deliver control commands.
#[async_trait]
pub trait ControlChannel: Send + Sync {
    /// Appends a serialized command to the run's mailbox.
    ///
    /// Implementations may drop a command identical to the newest pending
    /// one. Every command is idempotent while its predecessor is still
    /// pending, so only alternations (PAUSE, RESUME, PAUSE) need to
    /// survive. A command that is kept is delivered to exactly one call
    /// boundary of the run.
    async fn put(&self, run_id: &RunId, command: String) -> Result<()>;

    /// Returns the oldest unacknowledged command, if any.
    async fn get(&self, run_id: &RunId) -> Result<Option<String>>;

    /// Acknowledges the oldest command.
    async fn clear(&self, run_id: &RunId) -> Result<()>;

    /// Returns the number of unacknowledged commands.
    async fn pending(&self, run_id: &RunId) -> Result<usize>;
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::persistence("control channel lock poisoned")
}

/// In-process control channel.
///
/// A per-run FIFO that collapses a command equal to the newest pending one.
#[derive(Debug, Default)]
pub struct InMemoryControlChannel {
    mailboxes: RwLock<HashMap<RunId, VecDeque<String>>>,
}

impl InMemoryControlChannel {
    /// Creates an empty channel.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ControlChannel for InMemoryControlChannel {
    async fn put(&self, run_id: &RunId, command: String) -> Result<()> {
        let mut mailboxes = self.mailboxes.write().map_err(poison_err)?;
        let mailbox = mailboxes.entry(*run_id).or_default();
        if mailbox.back() != Some(&command) {
            mailbox.push_back(command);
        }
        Ok(())
    }

    async fn get(&self, run_id: &RunId) -> Result<Option<String>> {
        let mailboxes = self.mailboxes.read().map_err(poison_err)?;
        Ok(mailboxes.get(run_id).and_then(|m| m.front().cloned()))
    }

    async fn clear(&self, run_id: &RunId) -> Result<()> {
        let mut mailboxes = self.mailboxes.write().map_err(poison_err)?;
        if let Some(mailbox) = mailboxes.get_mut(run_id) {
            mailbox.pop_front();
            if mailbox.is_empty() {
                mailboxes.remove(run_id);
            }
        }
        Ok(())
    }

    async fn pending(&self, run_id: &RunId) -> Result<usize> {
        let mailboxes = self.mailboxes.read().map_err(poison_err)?;
        Ok(mailboxes.get(run_id).map_or(0, VecDeque::len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn commands_use_tagged_encoding() -> Result<()> {
        let raw = ControlCommand::Cancel {
            reason: "spill".into(),
        }
        .encode()?;
        assert_eq!(raw, r#"{"command":"CANCEL","reason":"spill"}"#);
        assert_eq!(ControlCommand::parse(r#"{"command":"PAUSE"}"#)?, ControlCommand::Pause);
        assert!(ControlCommand::parse(r#"{"command":"REBOOT"}"#).is_err());
        assert!(ControlCommand::parse("garbage").is_err());
        Ok(())
    }

    #[test]
    fn intervene_payload_defaults_to_null() -> Result<()> {
        let cmd = ControlCommand::parse(r#"{"command":"INTERVENE"}"#)?;
        assert_eq!(cmd, ControlCommand::Intervene { payload: Value::Null });
        Ok(())
    }

    #[tokio::test]
    async fn mailbox_is_fifo_with_peek_then_ack() -> Result<()> {
        let channel = InMemoryControlChannel::new();
        let run = RunId::generate();
        assert_eq!(channel.get(&run).await?, None);

        channel.put(&run, ControlCommand::Pause.encode()?).await?;
        channel
            .put(&run, ControlCommand::Intervene { payload: json!({ "note": "refill" }) }.encode()?)
            .await?;

        let first = channel.get(&run).await?.expect("first");
        assert_eq!(ControlCommand::parse(&first)?, ControlCommand::Pause);
        assert_eq!(channel.get(&run).await?, Some(first));
        channel.clear(&run).await?;

        let second = channel.get(&run).await?.expect("second");
        assert_eq!(ControlCommand::parse(&second)?.name(), "INTERVENE");
        channel.clear(&run).await?;
        assert_eq!(channel.pending(&run).await?, 0);
        channel.clear(&run).await?;
        Ok(())
    }

    #[tokio::test]
    async fn consecutive_duplicates_collapse() -> Result<()> {
        let channel = InMemoryControlChannel::new();
        let run = RunId::generate();
        channel.put(&run, ControlCommand::Pause.encode()?).await?;
        channel.put(&run, ControlCommand::Pause.encode()?).await?;
        assert_eq!(channel.pending(&run).await?, 1);
        channel.put(&run, ControlCommand::Resume.encode()?).await?;
        channel.put(&run, ControlCommand::Pause.encode()?).await?;
        assert_eq!(channel.pending(&run).await?, 3);
        Ok(())
    }

    #[tokio::test]
    async fn mailboxes_are_run_scoped() -> Result<()> {
        let channel = InMemoryControlChannel::new();
        let a = RunId::generate();
        let b = RunId::generate();
        channel.put(&a, ControlCommand::Pause.encode()?).await?;
        assert_eq!(channel.get(&b).await?, None);
        assert_eq!(channel.pending(&a).await?, 1);
        Ok(())
    }
}

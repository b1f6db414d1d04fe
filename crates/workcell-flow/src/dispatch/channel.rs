//! Channel-backed worker pool.
//!
//! [`ChannelWorkerPool`] forwards envelopes to an unbounded tokio channel.
//! The receiving half is driven by the orchestrator's worker loop, which
//! spawns one task per run.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{DispatchEnvelope, WorkerPool};
use crate::error::{Error, Result};

/// Worker pool that feeds an in-process worker loop.
#[derive(Debug, Clone)]
pub struct ChannelWorkerPool {
    name: String,
    sender: mpsc::UnboundedSender<DispatchEnvelope>,
}

impl ChannelWorkerPool {
    /// Creates a pool and the receiver the worker loop consumes.
    #[must_use]
    pub fn new(name: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<DispatchEnvelope>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                name: name.into(),
                sender,
            },
            receiver,
        )
    }
}

#[async_trait]
impl WorkerPool for ChannelWorkerPool {
    async fn submit(&self, envelope: DispatchEnvelope) -> Result<()> {
        let run_id = envelope.run_id;
        self.sender.send(envelope).map_err(|_| Error::InvalidInput(format!(
            "worker pool '{}' is shut down; run {run_id} not accepted",
            self.name
        )))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use workcell_core::{RunId, ScheduleEntryId};

    use super::*;

    #[tokio::test]
    async fn envelopes_reach_the_receiver() -> Result<()> {
        let (pool, mut rx) = ChannelWorkerPool::new("local");
        let envelope = DispatchEnvelope::new(RunId::generate(), ScheduleEntryId::generate(), 3);
        pool.submit(envelope.clone()).await?;
        assert_eq!(rx.recv().await, Some(envelope));
        assert_eq!(pool.name(), "local");
        Ok(())
    }

    #[tokio::test]
    async fn closed_receiver_rejects_submissions() {
        let (pool, rx) = ChannelWorkerPool::new("local");
        drop(rx);
        let result = pool
            .submit(DispatchEnvelope::new(RunId::generate(), ScheduleEntryId::generate(), 1))
            .await;
        assert!(result.is_err());
    }
}

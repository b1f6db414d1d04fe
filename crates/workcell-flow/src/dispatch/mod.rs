//! Worker pool abstraction for run dispatch.
//!
//! This module provides:
//!
//! - [`WorkerPool`]: trait for handing a dispatched run to something that
//!   executes it asynchronously
//! - [`DispatchEnvelope`]: serializable dispatch payload
//! - [`channel::ChannelWorkerPool`]: feeds an in-process worker loop
//! - [`memory::InMemoryWorkerPool`]: records envelopes for tests
//!
//! ## Design Principles
//!
//! - **Backend agnostic**: same interface for local workers and remote queues
//! - **Fire and forget**: `submit` returns once the run is handed off; the
//!   outcome is observed through the run record

pub mod channel;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use workcell_core::{RunId, ScheduleEntryId};

use crate::error::Result;

/// Envelope for a run handed to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchEnvelope {
    /// The run to execute.
    pub run_id: RunId,
    /// The schedule entry that was dispatched.
    pub entry_id: ScheduleEntryId,
    /// Priority at dispatch time.
    pub priority: u8,
    /// When the scheduler dispatched the run.
    pub dispatched_at: DateTime<Utc>,
}

impl DispatchEnvelope {
    /// Creates an envelope stamped with the current time.
    #[must_use]
    pub fn new(run_id: RunId, entry_id: ScheduleEntryId, priority: u8) -> Self {
        Self {
            run_id,
            entry_id,
            priority,
            dispatched_at: Utc::now(),
        }
    }
}

/// Begins executing dispatched runs asynchronously.
#[async_trait]
pub trait WorkerPool: Send + Sync {
    /// Hands a run to the pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool cannot accept the run; the scheduler then
    /// returns the entry to READY.
    async fn submit(&self, envelope: DispatchEnvelope) -> Result<()>;

    /// Returns the pool name (for logging and metrics).
    fn name(&self) -> &str;
}

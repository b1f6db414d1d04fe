//! In-memory worker pool implementation for testing.
//!
//! [`InMemoryWorkerPool`] records envelopes instead of executing them, so
//! tests can assert dispatch order and drive execution by hand.
//!
//! ## Limitations
//!
//! - **Nothing executes**: callers take envelopes and run them explicitly
//! - **Single-process only**: envelopes are not visible across processes

use std::collections::VecDeque;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use super::{DispatchEnvelope, WorkerPool};
use crate::error::{Error, Result};

/// In-memory worker pool for testing.
///
/// ## Example
///
/// ```rust
/// use workcell_flow::dispatch::memory::InMemoryWorkerPool;
///
/// let pool = InMemoryWorkerPool::new("test-pool");
/// assert!(pool.take().unwrap().is_none());
/// ```
#[derive(Debug)]
pub struct InMemoryWorkerPool {
    name: String,
    queue: RwLock<VecDeque<DispatchEnvelope>>,
    max_capacity: Option<usize>,
}

impl Default for InMemoryWorkerPool {
    fn default() -> Self {
        Self::new("default")
    }
}

/// Converts a lock poison error to a persistence error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::persistence("worker pool lock poisoned")
}

impl InMemoryWorkerPool {
    /// Creates an unbounded pool.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queue: RwLock::new(VecDeque::new()),
            max_capacity: None,
        }
    }

    /// Creates a pool that rejects submissions beyond `max_capacity`.
    #[must_use]
    pub fn with_capacity(name: impl Into<String>, max_capacity: usize) -> Self {
        Self {
            max_capacity: Some(max_capacity),
            ..Self::new(name)
        }
    }

    /// Takes the oldest envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn take(&self) -> Result<Option<DispatchEnvelope>> {
        Ok(self.queue.write().map_err(poison_err)?.pop_front())
    }

    /// Takes every envelope, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn drain(&self) -> Result<Vec<DispatchEnvelope>> {
        Ok(self.queue.write().map_err(poison_err)?.drain(..).collect())
    }

    /// Returns the number of waiting envelopes.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        Ok(self.queue.read().map_err(poison_err)?.len())
    }

    /// Returns true if no envelope is waiting.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

#[async_trait]
impl WorkerPool for InMemoryWorkerPool {
    async fn submit(&self, envelope: DispatchEnvelope) -> Result<()> {
        let mut queue = self.queue.write().map_err(poison_err)?;
        if self.max_capacity.is_some_and(|max| queue.len() >= max) {
            return Err(Error::InvalidInput(format!(
                "worker pool '{}' is at capacity",
                self.name
            )));
        }
        queue.push_back(envelope);
        drop(queue);
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use workcell_core::{RunId, ScheduleEntryId};

    use super::*;

    fn envelope(priority: u8) -> DispatchEnvelope {
        DispatchEnvelope::new(RunId::generate(), ScheduleEntryId::generate(), priority)
    }

    #[tokio::test]
    async fn envelopes_are_kept_in_submission_order() -> Result<()> {
        let pool = InMemoryWorkerPool::new("test");
        let first = envelope(5);
        let second = envelope(1);
        pool.submit(first.clone()).await?;
        pool.submit(second.clone()).await?;
        assert_eq!(pool.len()?, 2);
        assert_eq!(pool.take()?, Some(first));
        assert_eq!(pool.drain()?, vec![second]);
        assert!(pool.is_empty()?);
        Ok(())
    }

    #[tokio::test]
    async fn capacity_is_enforced() -> Result<()> {
        let pool = InMemoryWorkerPool::with_capacity("tiny", 1);
        pool.submit(envelope(1)).await?;
        assert!(pool.submit(envelope(1)).await.is_err());
        pool.take()?;
        pool.submit(envelope(1)).await?;
        Ok(())
    }
}

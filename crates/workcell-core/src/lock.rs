//! Lease-based exclusive locks over named assets.
//!
//! Lock records live in the shared [`StorageBackend`] so independent worker
//! processes contend on the same rows. The manager relies on:
//! - **CAS (Compare-and-Swap)**: acquisition, takeover, renewal and release
//!   are all preconditioned writes
//! - **Leases**: every record carries an expiry, so a crashed holder's lock is
//!   reclaimable without its cooperation
//! - **Fencing**: each takeover increments a sequence number that identifies
//!   the holder generation
//!
//! # How It Works
//!
//! 1. `acquire` writes a record with the `DoesNotExist` precondition; only one
//!    writer can succeed.
//! 2. If a record exists and is expired, the writer takes it over with a CAS
//!    on the version observed before reading the record.
//! 3. `release` writes an expired record via CAS instead of deleting, so a
//!    release racing a takeover can never remove the new holder's record.
//!
//! # Example
//!
//! ```rust
//! # async fn demo() -> workcell_core::Result<()> {
//! use std::sync::Arc;
//! use std::time::Duration;
//! use workcell_core::lock::AssetLockManager;
//! use workcell_core::storage::MemoryBackend;
//!
//! let locks = AssetLockManager::new(Arc::new(MemoryBackend::new()));
//! assert!(locks.acquire("pipette-1", "run-a", Duration::from_secs(30)).await?);
//! assert!(!locks.acquire("pipette-1", "run-b", Duration::from_secs(30)).await?);
//! assert!(locks.release("pipette-1", "run-a").await?);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::storage::{ObjectMeta, StorageBackend, WritePrecondition, WriteResult};

/// Default lease for asset locks (30 seconds).
pub const DEFAULT_LEASE: Duration = Duration::from_secs(30);

/// How many times `acquire` restarts when the record vanishes mid-attempt.
const MAX_RACE_RETRIES: usize = 3;

/// Lock record contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    /// Owner that holds (or last held) the lock.
    pub holder_id: String,

    /// When the lease expires.
    pub expires_at: DateTime<Utc>,

    /// When the current holder generation acquired the lock.
    pub acquired_at: DateTime<Utc>,

    /// Fencing token, incremented on every change of holder generation.
    #[serde(default)]
    pub sequence_number: u64,

    /// Optional description of what the holder is doing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
}

impl LockInfo {
    /// Creates a new lock record with the given holder, lease and sequence number.
    #[must_use]
    pub fn new(holder_id: impl Into<String>, lease: Duration, sequence_number: u64) -> Self {
        let now = Utc::now();
        Self {
            holder_id: holder_id.into(),
            expires_at: lease_deadline(now, lease),
            acquired_at: now,
            sequence_number,
            operation: None,
        }
    }

    /// Returns whether this lease has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Returns whether `owner` holds a live lease on this record.
    #[must_use]
    pub fn is_held_by(&self, owner: &str) -> bool {
        self.holder_id == owner && !self.is_expired()
    }

    /// Returns the remaining lease, or zero if expired.
    #[must_use]
    pub fn remaining_lease(&self) -> Duration {
        let millis = (self.expires_at - Utc::now()).num_milliseconds();
        if millis <= 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(u64::try_from(millis).unwrap_or(u64::MAX))
        }
    }
}

fn lease_deadline(from: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    from + chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::seconds(30))
}

/// Exclusive, lease-based locks over named assets.
///
/// The manager itself is stateless; every decision is made against the
/// backing store, so any number of managers over the same store arbitrate
/// correctly between processes.
pub struct AssetLockManager<S: StorageBackend + ?Sized = dyn StorageBackend> {
    storage: Arc<S>,
    prefix: String,
}

// Manual Clone implementation to avoid requiring S: Clone
impl<S: StorageBackend + ?Sized> Clone for AssetLockManager<S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            prefix: self.prefix.clone(),
        }
    }
}

impl<S: StorageBackend + ?Sized> std::fmt::Debug for AssetLockManager<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssetLockManager")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl<S: StorageBackend + ?Sized> AssetLockManager<S> {
    /// Creates a lock manager storing records under [`paths::ASSET_LOCK_PREFIX`].
    #[must_use]
    pub fn new(storage: Arc<S>) -> Self {
        Self::with_prefix(storage, paths::ASSET_LOCK_PREFIX)
    }

    /// Creates a lock manager storing records under a custom prefix.
    #[must_use]
    pub fn with_prefix(storage: Arc<S>, prefix: impl Into<String>) -> Self {
        Self {
            storage,
            prefix: prefix.into(),
        }
    }

    /// Returns the storage path of the lock record for `asset`.
    #[must_use]
    pub fn lock_path(&self, asset: &str) -> String {
        format!("{}{asset}.lock.json", self.prefix)
    }

    /// Attempts to take the lock on `asset` for `owner`.
    ///
    /// Returns `Ok(false)` when another owner holds a live lease. Re-acquiring
    /// a lock the owner already holds refreshes the lease and returns `Ok(true)`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockBackendUnavailable`] if the store cannot be reached.
    pub async fn acquire(&self, asset: &str, owner: &str, lease: Duration) -> Result<bool> {
        self.acquire_with_operation(asset, owner, lease, None).await
    }

    /// Attempts to take the lock, recording what the holder is doing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockBackendUnavailable`] if the store cannot be reached.
    #[tracing::instrument(skip(self, operation))]
    pub async fn acquire_with_operation(
        &self,
        asset: &str,
        owner: &str,
        lease: Duration,
        operation: Option<String>,
    ) -> Result<bool> {
        let path = self.lock_path(asset);

        for _ in 0..MAX_RACE_RETRIES {
            // New locks start with sequence_number = 1
            let mut fresh = LockInfo::new(owner, lease, 1);
            fresh.operation.clone_from(&operation);
            if self
                .write(&path, &fresh, WritePrecondition::DoesNotExist)
                .await?
                .is_success()
            {
                tracing::debug!(asset, owner, "asset lock acquired");
                return Ok(true);
            }

            // Record exists. Version is read before contents so the expiry
            // decision is bound to the version used for the CAS.
            let Some((meta, existing)) = self.read(&path).await? else {
                continue;
            };

            let next = if existing.is_held_by(owner) {
                LockInfo {
                    expires_at: lease_deadline(Utc::now(), lease),
                    operation: operation.clone().or(existing.operation.clone()),
                    ..existing
                }
            } else if existing.is_expired() {
                let mut takeover =
                    LockInfo::new(owner, lease, existing.sequence_number.saturating_add(1));
                takeover.operation.clone_from(&operation);
                takeover
            } else {
                tracing::debug!(asset, owner, holder = %existing.holder_id, "asset lock held");
                return Ok(false);
            };

            let acquired = self
                .write(&path, &next, WritePrecondition::MatchesVersion(meta.version))
                .await?
                .is_success();
            if acquired {
                tracing::debug!(asset, owner, sequence = next.sequence_number, "asset lock acquired");
            }
            return Ok(acquired);
        }

        Ok(false)
    }

    /// Releases the lock on `asset` if `owner` is the current holder.
    ///
    /// Returns `Ok(false)` when the record is absent or belongs to someone
    /// else; stale releases are ignored rather than treated as errors.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockBackendUnavailable`] if the store cannot be reached.
    pub async fn release(&self, asset: &str, owner: &str) -> Result<bool> {
        let path = self.lock_path(asset);
        let Some((meta, info)) = self.read(&path).await? else {
            return Ok(false);
        };
        if info.holder_id != owner {
            tracing::debug!(asset, owner, holder = %info.holder_id, "ignoring stale release");
            return Ok(false);
        }

        // Leave an expired record in place; the sequence number survives so
        // the next holder increments it.
        let expired = LockInfo {
            expires_at: Utc::now() - chrono::Duration::seconds(1),
            operation: None,
            ..info
        };
        let released = self
            .write(&path, &expired, WritePrecondition::MatchesVersion(meta.version))
            .await?
            .is_success();
        if released {
            tracing::debug!(asset, owner, "asset lock released");
        }
        Ok(released)
    }

    /// Extends the lease if `owner` still holds a live lock on `asset`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockBackendUnavailable`] if the store cannot be reached.
    pub async fn renew(&self, asset: &str, owner: &str, lease: Duration) -> Result<bool> {
        let path = self.lock_path(asset);
        let Some((meta, mut info)) = self.read(&path).await? else {
            return Ok(false);
        };
        if !info.is_held_by(owner) {
            return Ok(false);
        }

        info.expires_at = lease_deadline(Utc::now(), lease);
        Ok(self
            .write(&path, &info, WritePrecondition::MatchesVersion(meta.version))
            .await?
            .is_success())
    }

    /// Checks whether any owner holds a live lease on `asset`.
    ///
    /// Diagnostic only; correctness rests on `acquire` being atomic.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockBackendUnavailable`] if the store cannot be reached.
    pub async fn is_locked(&self, asset: &str) -> Result<bool> {
        Ok(self
            .holder(asset)
            .await?
            .is_some_and(|info| !info.is_expired()))
    }

    /// Reads the lock record for `asset`, live or expired.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockBackendUnavailable`] if the store cannot be reached.
    pub async fn holder(&self, asset: &str) -> Result<Option<LockInfo>> {
        Ok(self
            .read(&self.lock_path(asset))
            .await?
            .map(|(_, info)| info))
    }

    /// Forcefully removes the lock record for `asset` (admin operation).
    ///
    /// Only for recovery when a holder is known to be gone but its lease is
    /// long. The fencing sequence restarts at 1 afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockBackendUnavailable`] if the store cannot be reached.
    pub async fn force_break(&self, asset: &str) -> Result<()> {
        let path = self.lock_path(asset);
        self.storage
            .delete(&path)
            .await
            .map_err(|e| Error::lock_backend(format!("delete {path}"), e))
    }

    async fn read(&self, path: &str) -> Result<Option<(ObjectMeta, LockInfo)>> {
        let meta = self
            .storage
            .head(path)
            .await
            .map_err(|e| Error::lock_backend(format!("head {path}"), e))?;
        let Some(meta) = meta else {
            return Ok(None);
        };

        let data = match self.storage.get(path).await {
            Ok(data) => data,
            Err(Error::NotFound(_)) => return Ok(None),
            Err(e) => return Err(Error::lock_backend(format!("read {path}"), e)),
        };
        let info: LockInfo = serde_json::from_slice(&data).map_err(|e| Error::Internal {
            message: format!("parse lock {path}: {e}"),
        })?;
        Ok(Some((meta, info)))
    }

    async fn write(
        &self,
        path: &str,
        info: &LockInfo,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let bytes = Bytes::from(serde_json::to_vec(info).map_err(|e| Error::Internal {
            message: format!("serialize lock: {e}"),
        })?);
        self.storage
            .put(path, bytes, precondition)
            .await
            .map_err(|e| Error::lock_backend(format!("write {path}"), e))
    }
}

/// Path constants for lock records.
pub mod paths {
    /// Prefix for asset lock records.
    pub const ASSET_LOCK_PREFIX: &str = "locks/assets/";
}

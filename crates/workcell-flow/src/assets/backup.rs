//! Rotating asset state backups.
//!
//! Snapshots are JSON objects written under `{prefix}{ulid}.json`. ULIDs sort
//! by creation time, so listing and sorting by path yields the backups oldest
//! first. After each write, the oldest snapshots beyond `retain` are pruned.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use ulid::Generator;

use workcell_core::{StorageBackend, WritePrecondition};

use super::AssetRegistry;
use crate::config::BackupConfig;
use crate::error::{Error, Result};
use crate::metrics::FlowMetrics;

/// One persisted snapshot of every asset's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetSnapshot {
    /// When the snapshot was taken.
    pub taken_at: DateTime<Utc>,
    /// Serialized state per asset name.
    pub assets: BTreeMap<String, Value>,
}

/// Writes, rotates and reads asset snapshots.
pub struct AssetBackupStore {
    storage: Arc<dyn StorageBackend>,
    prefix: String,
    retain: usize,
    ids: Mutex<Generator>,
    metrics: FlowMetrics,
}

impl std::fmt::Debug for AssetBackupStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssetBackupStore")
            .field("prefix", &self.prefix)
            .field("retain", &self.retain)
            .finish_non_exhaustive()
    }
}

impl AssetBackupStore {
    /// Creates a backup store over `storage`.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>, config: &BackupConfig) -> Self {
        Self {
            storage,
            prefix: config.prefix.clone(),
            retain: config.retain.max(1),
            ids: Mutex::new(Generator::new()),
            metrics: FlowMetrics::new(),
        }
    }

    /// Snapshots `registry`, writes it and prunes old backups.
    ///
    /// Returns the path written. A failed prune is logged and leaves extra
    /// backups behind; it does not fail the backup.
    ///
    /// # Errors
    ///
    /// Returns an asset error from the snapshot sweep or a storage error
    /// writing the snapshot.
    pub async fn backup(&self, registry: &AssetRegistry) -> Result<String> {
        let snapshot = AssetSnapshot {
            taken_at: Utc::now(),
            assets: registry.snapshot_state()?,
        };
        let path = self.next_path()?;
        let data = Bytes::from(serde_json::to_vec(&snapshot)?);

        let written = self
            .storage
            .put(&path, data, WritePrecondition::DoesNotExist)
            .await
            .map_err(|e| self.storage_failure("write", e))?;
        if !written.is_success() {
            self.metrics.record_asset_backup("conflict");
            return Err(Error::persistence(format!("backup {path} already exists")));
        }
        self.metrics.record_asset_backup("written");
        tracing::info!(%path, assets = snapshot.assets.len(), "asset backup written");

        // The snapshot is durable; rotation catches up on the next backup.
        if let Err(err) = self.prune().await {
            self.metrics.record_asset_backup("prune_failed");
            tracing::warn!(%path, error = %err, "failed to prune old asset backups");
        }
        Ok(path)
    }

    /// Lists backup paths, oldest first.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn list(&self) -> Result<Vec<String>> {
        let mut paths: Vec<String> = self
            .storage
            .list(&self.prefix)
            .await
            .map_err(|e| self.storage_failure("list", e))?
            .into_iter()
            .map(|meta| meta.path)
            .filter(|path| path.ends_with(".json"))
            .collect();
        paths.sort();
        Ok(paths)
    }

    /// Reads the newest snapshot.
    ///
    /// # Errors
    ///
    /// Returns a storage or decoding error.
    pub async fn latest(&self) -> Result<Option<AssetSnapshot>> {
        let Some(path) = self.list().await?.pop() else {
            return Ok(None);
        };
        let data = self
            .storage
            .get(&path)
            .await
            .map_err(|e| self.storage_failure("read", e))?;
        Ok(Some(serde_json::from_slice(&data)?))
    }

    /// Restores `registry` from the newest snapshot.
    ///
    /// Returns the number of assets restored, or `None` without backups.
    ///
    /// # Errors
    ///
    /// Returns a storage, decoding or asset error.
    pub async fn restore_latest(&self, registry: &AssetRegistry) -> Result<Option<usize>> {
        match self.latest().await? {
            Some(snapshot) => {
                let restored = registry.restore_state(&snapshot.assets)?;
                tracing::info!(taken_at = %snapshot.taken_at, restored, "assets restored from backup");
                Ok(Some(restored))
            }
            None => Ok(None),
        }
    }

    /// Runs [`AssetBackupStore::backup`] every `interval` until `shutdown`.
    ///
    /// The first backup is taken one interval after start. Failed backups
    /// are logged and retried on the next tick.
    #[must_use]
    pub fn spawn_backup_loop(
        self: Arc<Self>,
        registry: Arc<AssetRegistry>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = self.backup(&registry).await {
                            self.metrics.record_asset_backup("failed");
                            tracing::warn!(error = %err, "asset backup failed");
                        }
                    }
                }
            }
            tracing::debug!("asset backup loop stopped");
        })
    }

    async fn prune(&self) -> Result<()> {
        let paths = self.list().await?;
        let excess = paths.len().saturating_sub(self.retain);
        for path in &paths[..excess] {
            self.storage
                .delete(path)
                .await
                .map_err(|e| self.storage_failure("delete", e))?;
            tracing::debug!(%path, "old asset backup pruned");
        }
        Ok(())
    }

    fn next_path(&self) -> Result<String> {
        let id = self
            .ids
            .lock()
            .map_err(|_: PoisonError<_>| Error::persistence("backup id generator poisoned"))?
            .generate()
            .map_err(|e| Error::persistence(format!("backup id generation failed: {e}")))?;
        Ok(format!("{}{id}.json", self.prefix))
    }

    fn storage_failure(&self, op: &str, err: workcell_core::Error) -> Error {
        Error::persistence_with_source(format!("asset backup {op} under {}", self.prefix), err)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;
    use workcell_core::MemoryBackend;

    use super::*;
    use crate::assets::LiveAsset;

    struct Counter {
        name: &'static str,
        value: Mutex<i64>,
    }

    #[async_trait]
    impl LiveAsset for Counter {
        fn name(&self) -> &str {
            self.name
        }

        fn kind(&self) -> &str {
            "counter"
        }

        fn snapshot(&self) -> Result<Value> {
            Ok(json!(*self.value.lock().expect("lock")))
        }

        fn restore(&self, state: Value) -> Result<()> {
            *self.value.lock().expect("lock") = state.as_i64().unwrap_or_default();
            Ok(())
        }
    }

    fn setup(retain: usize) -> (AssetBackupStore, Arc<AssetRegistry>, Arc<Counter>) {
        let config = BackupConfig {
            retain,
            ..BackupConfig::default()
        };
        let store = AssetBackupStore::new(Arc::new(MemoryBackend::new()), &config);
        let registry = Arc::new(AssetRegistry::new());
        let counter = Arc::new(Counter {
            name: "c1",
            value: Mutex::new(0),
        });
        registry.add_asset(counter.clone()).expect("add");
        (store, registry, counter)
    }

    #[tokio::test]
    async fn backups_rotate_oldest_first() -> Result<()> {
        let (store, registry, counter) = setup(2);
        let mut written = Vec::new();
        for value in 1..=4 {
            *counter.value.lock().expect("lock") = value;
            written.push(store.backup(&registry).await?);
        }
        assert_eq!(store.list().await?, written[2..].to_vec());
        let latest = store.latest().await?.expect("latest");
        assert_eq!(latest.assets["c1"], json!(4));
        Ok(())
    }

    #[tokio::test]
    async fn restore_latest_reapplies_state() -> Result<()> {
        let (store, registry, counter) = setup(3);
        assert_eq!(store.restore_latest(&registry).await?, None);

        *counter.value.lock().expect("lock") = 7;
        store.backup(&registry).await?;
        *counter.value.lock().expect("lock") = -1;

        assert_eq!(store.restore_latest(&registry).await?, Some(1));
        assert_eq!(*counter.value.lock().expect("lock"), 7);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn backup_loop_runs_until_cancelled() -> Result<()> {
        let (store, registry, _counter) = setup(10);
        let store = Arc::new(store);
        let shutdown = CancellationToken::new();
        let handle = store.clone().spawn_backup_loop(
            registry,
            Duration::from_secs(60),
            shutdown.clone(),
        );

        tokio::time::sleep(Duration::from_secs(150)).await;
        shutdown.cancel();
        handle.await.expect("join");
        assert_eq!(store.list().await?.len(), 2);
        Ok(())
    }
}

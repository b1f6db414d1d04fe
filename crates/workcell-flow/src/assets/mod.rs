//! Runtime asset registry.
//!
//! The registry owns the live handles of instantiated devices for the
//! workcell's uptime. Handles are keyed by name and never duplicated; steps
//! reach the ones their run reserved through the call context.
//!
//! Each asset kind defines how its state serializes. The registry only
//! sweeps: [`AssetRegistry::snapshot_state`] collects every asset's state and
//! [`AssetRegistry::restore_state`] pushes it back. [`backup`] persists those
//! snapshots on a rotating schedule.

pub mod backup;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::scheduler::{AssetCatalog, AssetDescriptor};

/// A live handle to an instantiated device or resource.
///
/// Implemented by the device driver layer. Handles are shared, so state
/// changes go through interior mutability.
#[async_trait]
pub trait LiveAsset: Send + Sync {
    /// Unique asset name.
    fn name(&self) -> &str;

    /// Asset kind, matched against step requirements.
    fn kind(&self) -> &str;

    /// Capabilities the asset advertises.
    fn capabilities(&self) -> Vec<String> {
        Vec::new()
    }

    /// Serializes the asset's current state.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be read.
    fn snapshot(&self) -> Result<Value>;

    /// Replaces the asset's state with a snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot does not fit this asset.
    fn restore(&self, state: Value) -> Result<()>;

    /// Brings the device up.
    async fn setup(&self) -> Result<()> {
        Ok(())
    }

    /// Shuts the device down.
    async fn teardown(&self) -> Result<()> {
        Ok(())
    }
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::persistence("asset registry lock poisoned")
}

/// Owner of every live asset handle.
#[derive(Default)]
pub struct AssetRegistry {
    assets: RwLock<BTreeMap<String, Arc<dyn LiveAsset>>>,
}

impl fmt::Debug for AssetRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = self.names().unwrap_or_default();
        f.debug_struct("AssetRegistry").field("assets", &names).finish()
    }
}

impl AssetRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a live handle under its name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateAsset`] if the name is taken.
    pub fn add_asset(&self, handle: Arc<dyn LiveAsset>) -> Result<()> {
        let name = handle.name().to_string();
        let mut assets = self.assets.write().map_err(poison_err)?;
        if assets.contains_key(&name) {
            return Err(Error::DuplicateAsset { name });
        }
        tracing::info!(asset = %name, kind = handle.kind(), "asset registered");
        assets.insert(name, handle);
        Ok(())
    }

    /// Looks up a handle by name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AssetNotFound`] for unknown names.
    pub fn get_asset(&self, name: &str) -> Result<Arc<dyn LiveAsset>> {
        self.assets
            .read()
            .map_err(poison_err)?
            .get(name)
            .cloned()
            .ok_or_else(|| Error::AssetNotFound {
                name: name.to_string(),
            })
    }

    /// Removes a handle, returning it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AssetNotFound`] for unknown names.
    pub fn remove_asset(&self, name: &str) -> Result<Arc<dyn LiveAsset>> {
        self.assets
            .write()
            .map_err(poison_err)?
            .remove(name)
            .ok_or_else(|| Error::AssetNotFound {
                name: name.to_string(),
            })
    }

    /// Returns every handle of one kind, by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry lock is poisoned.
    pub fn assets_of_kind(&self, kind: &str) -> Result<Vec<Arc<dyn LiveAsset>>> {
        Ok(self
            .assets
            .read()
            .map_err(poison_err)?
            .values()
            .filter(|a| a.kind() == kind)
            .cloned()
            .collect())
    }

    /// Returns every asset name, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry lock is poisoned.
    pub fn names(&self) -> Result<Vec<String>> {
        Ok(self.assets.read().map_err(poison_err)?.keys().cloned().collect())
    }

    /// Collects every asset's serialized state.
    ///
    /// # Errors
    ///
    /// Returns the first asset error.
    pub fn snapshot_state(&self) -> Result<BTreeMap<String, Value>> {
        let handles = self.handles()?;
        let mut state = BTreeMap::new();
        for (name, handle) in handles {
            state.insert(name, handle.snapshot()?);
        }
        Ok(state)
    }

    /// Pushes serialized state back into the matching assets.
    ///
    /// Entries for assets that are no longer registered are skipped with a
    /// warning. Returns the number of assets restored.
    ///
    /// # Errors
    ///
    /// Returns the first asset error.
    pub fn restore_state(&self, state: &BTreeMap<String, Value>) -> Result<usize> {
        let handles = self.handles()?;
        let mut restored = 0;
        for (name, value) in state {
            match handles.get(name) {
                Some(handle) => {
                    handle.restore(value.clone())?;
                    restored += 1;
                }
                None => tracing::warn!(asset = %name, "snapshot names an unregistered asset"),
            }
        }
        Ok(restored)
    }

    /// Runs `setup` on every asset.
    ///
    /// # Errors
    ///
    /// Returns the first setup error.
    pub async fn setup_all(&self) -> Result<()> {
        for (name, handle) in self.handles()? {
            handle.setup().await?;
            tracing::debug!(asset = %name, "asset set up");
        }
        Ok(())
    }

    /// Runs `teardown` on every asset, continuing past failures.
    ///
    /// # Errors
    ///
    /// Returns the first teardown error after every asset was attempted.
    pub async fn teardown_all(&self) -> Result<()> {
        let mut first_error = None;
        for (name, handle) in self.handles()? {
            if let Err(err) = handle.teardown().await {
                tracing::warn!(asset = %name, error = %err, "asset teardown failed");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    // Cloned out so no lock is held across asset calls.
    fn handles(&self) -> Result<BTreeMap<String, Arc<dyn LiveAsset>>> {
        Ok(self.assets.read().map_err(poison_err)?.clone())
    }
}

impl AssetCatalog for AssetRegistry {
    fn describe(&self, name: &str) -> Option<AssetDescriptor> {
        let handle = self.get_asset(name).ok()?;
        Some(AssetDescriptor {
            kind: handle.kind().to_string(),
            capabilities: handle.capabilities(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;

    struct Shaker {
        name: String,
        rpm: Mutex<u64>,
        fail_teardown: bool,
    }

    impl Shaker {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                rpm: Mutex::new(0),
                fail_teardown: false,
            })
        }
    }

    #[async_trait]
    impl LiveAsset for Shaker {
        fn name(&self) -> &str {
            &self.name
        }

        fn kind(&self) -> &str {
            "shaker"
        }

        fn capabilities(&self) -> Vec<String> {
            vec!["orbital".into()]
        }

        fn snapshot(&self) -> Result<Value> {
            Ok(json!({ "rpm": *self.rpm.lock().expect("lock") }))
        }

        fn restore(&self, state: Value) -> Result<()> {
            let rpm = state["rpm"]
                .as_u64()
                .ok_or_else(|| Error::InvalidInput("rpm missing".into()))?;
            *self.rpm.lock().expect("lock") = rpm;
            Ok(())
        }

        async fn teardown(&self) -> Result<()> {
            if self.fail_teardown {
                return Err(Error::step_failure("stuck"));
            }
            Ok(())
        }
    }

    #[test]
    fn names_are_unique() -> Result<()> {
        let registry = AssetRegistry::new();
        registry.add_asset(Shaker::new("s1"))?;
        let err = registry.add_asset(Shaker::new("s1")).unwrap_err();
        assert!(matches!(err, Error::DuplicateAsset { .. }));
        assert_eq!(registry.names()?, vec!["s1".to_string()]);
        Ok(())
    }

    #[test]
    fn lookup_and_categorization() -> Result<()> {
        let registry = AssetRegistry::new();
        registry.add_asset(Shaker::new("s1"))?;
        registry.add_asset(Shaker::new("s2"))?;
        assert_eq!(registry.get_asset("s2")?.name(), "s2");
        assert!(matches!(
            registry.get_asset("nope"),
            Err(Error::AssetNotFound { .. })
        ));
        assert_eq!(registry.assets_of_kind("shaker")?.len(), 2);
        assert!(registry.assets_of_kind("pipette")?.is_empty());

        registry.remove_asset("s1")?;
        assert!(registry.get_asset("s1").is_err());
        Ok(())
    }

    #[test]
    fn snapshot_restore_round_trip() -> Result<()> {
        let registry = AssetRegistry::new();
        let shaker = Shaker::new("s1");
        registry.add_asset(shaker.clone())?;
        *shaker.rpm.lock().expect("lock") = 1200;

        let snapshot = registry.snapshot_state()?;
        *shaker.rpm.lock().expect("lock") = 0;

        let mut with_stale = snapshot.clone();
        with_stale.insert("retired".into(), json!({ "rpm": 5 }));
        assert_eq!(registry.restore_state(&with_stale)?, 1);
        assert_eq!(registry.snapshot_state()?, snapshot);
        Ok(())
    }

    #[test]
    fn registry_describes_assets_for_analysis() -> Result<()> {
        let registry = AssetRegistry::new();
        registry.add_asset(Shaker::new("s1"))?;
        let descriptor = registry.describe("s1").expect("known");
        assert_eq!(descriptor.kind, "shaker");
        assert_eq!(descriptor.capabilities, vec!["orbital".to_string()]);
        assert!(registry.describe("s9").is_none());
        Ok(())
    }

    #[tokio::test]
    async fn teardown_continues_past_failures() -> Result<()> {
        let registry = AssetRegistry::new();
        registry.add_asset(Arc::new(Shaker {
            name: "bad".into(),
            rpm: Mutex::new(0),
            fail_teardown: true,
        }))?;
        registry.add_asset(Shaker::new("good"))?;
        registry.setup_all().await?;
        assert!(registry.teardown_all().await.is_err());
        Ok(())
    }
}

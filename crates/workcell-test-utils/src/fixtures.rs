//! Devices and steps for integration tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use workcell_flow::assets::LiveAsset;
use workcell_flow::error::{Error, Result};
use workcell_flow::registry::{StepDefinition, StepKey};

/// A fake device with JSON state and lifecycle counters.
#[derive(Debug)]
pub struct TestDevice {
    name: String,
    kind: String,
    capabilities: Vec<String>,
    state: Mutex<Value>,
    setups: AtomicUsize,
    teardowns: AtomicUsize,
}

impl TestDevice {
    /// Creates a device with `null` state and no capabilities.
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Arc<Self> {
        Self::with_capabilities(name, kind, &[])
    }

    /// Creates a device advertising `capabilities`.
    pub fn with_capabilities(
        name: impl Into<String>,
        kind: impl Into<String>,
        capabilities: &[&str],
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            kind: kind.into(),
            capabilities: capabilities.iter().map(ToString::to_string).collect(),
            state: Mutex::new(Value::Null),
            setups: AtomicUsize::new(0),
            teardowns: AtomicUsize::new(0),
        })
    }

    /// Returns the current state.
    pub fn state(&self) -> Value {
        self.state.lock().expect("lock").clone()
    }

    /// Replaces the current state.
    pub fn set_state(&self, state: Value) {
        *self.state.lock().expect("lock") = state;
    }

    /// Returns how often `setup` ran.
    pub fn setups(&self) -> usize {
        self.setups.load(Ordering::SeqCst)
    }

    /// Returns how often `teardown` ran.
    pub fn teardowns(&self) -> usize {
        self.teardowns.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LiveAsset for TestDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        &self.kind
    }

    fn capabilities(&self) -> Vec<String> {
        self.capabilities.clone()
    }

    fn snapshot(&self) -> Result<Value> {
        Ok(self.state())
    }

    fn restore(&self, state: Value) -> Result<()> {
        self.set_state(state);
        Ok(())
    }

    async fn setup(&self) -> Result<()> {
        self.setups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn teardown(&self) -> Result<()> {
        self.teardowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Key of a version-1 step.
pub fn step_key(name: &str) -> StepKey {
    StepKey::new(name, "1")
}

/// Top-level step returning its arguments.
pub fn echo_step(name: &str) -> StepDefinition {
    StepDefinition::builder(name, "1")
        .top_level()
        .run(|_ctx, args| async move { Ok(args) })
}

/// Nested step returning its arguments.
pub fn leaf_step(name: &str) -> StepDefinition {
    StepDefinition::builder(name, "1").run(|_ctx, args| async move { Ok(args) })
}

/// Top-level step that raises a step failure with `message`.
pub fn failing_step(name: &str, message: &'static str) -> StepDefinition {
    StepDefinition::builder(name, "1")
        .top_level()
        .run(move |_ctx, _args| async move { Err::<Value, _>(Error::step_failure(message)) })
}

/// Top-level step that holds one asset of `asset_type` for `hold`.
///
/// Returns the name of the asset it was given.
pub fn holding_step(name: &str, asset_type: &str, hold: Duration) -> StepDefinition {
    StepDefinition::builder(name, "1")
        .top_level()
        .asset("device", asset_type)
        .run(move |ctx, _args| async move {
            let device = ctx.assigned_asset("device")?;
            tokio::time::sleep(hold).await;
            Ok(json!(device.name()))
        })
}

/// Top-level step calling `leaf` once per entry of the `items` argument.
///
/// Each nested call runs after a short `pace`, so control commands issued
/// mid-run land between calls.
pub fn looping_step(name: &str, leaf: &str, pace: Duration) -> StepDefinition {
    let leaf = step_key(leaf);
    StepDefinition::builder(name, "1")
        .top_level()
        .param("items", true)
        .run(move |ctx, args| {
            let leaf = leaf.clone();
            async move {
                let items = args["items"].as_array().cloned().unwrap_or_default();
                let mut results = Vec::with_capacity(items.len());
                for item in items {
                    tokio::time::sleep(pace).await;
                    results.push(ctx.call(&leaf, item).await?);
                }
                Ok(Value::Array(results))
            }
        })
}

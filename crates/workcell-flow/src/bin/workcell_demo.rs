//! Workcell demo: runs a small assay protocol against simulated devices.
//!
//! Configuration comes from `WORKCELL_*` environment variables (see
//! [`FlowConfig::from_env`]); `WORKCELL_LOG_FORMAT=json` switches to JSON logs.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;

use workcell_core::observability::{LogFormat, init_logging};
use workcell_core::{AssetLockManager, MemoryBackend, RunId, StorageBackend};
use workcell_flow::assets::backup::AssetBackupStore;
use workcell_flow::assets::{AssetRegistry, LiveAsset};
use workcell_flow::config::FlowConfig;
use workcell_flow::control::InMemoryControlChannel;
use workcell_flow::dispatch::channel::ChannelWorkerPool;
use workcell_flow::error::{Error, Result};
use workcell_flow::orchestrator::{Orchestrator, RunRequest};
use workcell_flow::registry::{StepDefinition, StepKey, StepRegistry};
use workcell_flow::run::Run;
use workcell_flow::scheduler::Scheduler;
use workcell_flow::store::memory::InMemoryStore;

/// A simulated device whose only state is a usage counter.
struct SimDevice {
    name: String,
    kind: &'static str,
    uses: Mutex<u64>,
}

impl SimDevice {
    fn new(name: &str, kind: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            kind,
            uses: Mutex::new(0),
        })
    }
}

#[async_trait]
impl LiveAsset for SimDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        self.kind
    }

    fn snapshot(&self) -> Result<Value> {
        let uses = self
            .uses
            .lock()
            .map_err(|_: PoisonError<_>| Error::persistence("device state poisoned"))?;
        Ok(json!({ "uses": *uses }))
    }

    fn restore(&self, state: Value) -> Result<()> {
        let restored = state["uses"].as_u64().unwrap_or_default();
        *self
            .uses
            .lock()
            .map_err(|_: PoisonError<_>| Error::persistence("device state poisoned"))? = restored;
        Ok(())
    }
}

fn log_format_from_env() -> LogFormat {
    std::env::var("WORKCELL_LOG_FORMAT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or_default()
}

fn register_steps(registry: &mut StepRegistry) -> Result<()> {
    registry.register(
        StepDefinition::builder("transfer", "1")
            .param("volume", true)
            .run(|ctx, args| async move {
                let pipette = ctx.assigned_asset("pipette")?;
                tokio::time::sleep(Duration::from_millis(50)).await;
                let volume = args["volume"].as_f64().unwrap_or_default();
                ctx.state().update(|state| {
                    let total = state.get("dispensed").and_then(Value::as_f64).unwrap_or_default();
                    state.insert("dispensed".into(), json!(total + volume));
                })?;
                Ok(json!({ "pipette": pipette.name(), "volume": volume }))
            }),
    )?;

    registry.register(
        StepDefinition::builder("read_plate", "1").run_blocking(|ctx, _args| {
            let reader = ctx.assigned_asset("reader")?;
            std::thread::sleep(Duration::from_millis(30));
            Ok(json!({ "reader": reader.name(), "od600": 0.42 }))
        }),
    )?;

    registry.register(
        StepDefinition::builder("assay", "1")
            .top_level()
            .state_param("plate")
            .param("wells", true)
            .asset("pipette", "pipette")
            .asset("reader", "plate_reader")
            .estimated_duration(Duration::from_secs(1))
            .run(|ctx, args| async move {
                let wells = args["wells"].as_u64().unwrap_or(1);
                for _ in 0..wells {
                    ctx.call(&StepKey::new("transfer", "1"), json!({ "volume": 10.0 }))
                        .await?;
                }
                ctx.call(&StepKey::new("read_plate", "1"), Value::Null).await
            }),
    )?;
    Ok(())
}

fn assay_request(pipette: &str, wells: u64, priority: u8) -> RunRequest {
    let mut inputs = Map::new();
    inputs.insert("wells".into(), json!(wells));
    inputs.insert("pipette".into(), json!(pipette));
    inputs.insert("reader".into(), json!("reader-1"));
    RunRequest::new(StepKey::new("assay", "1"))
        .with_inputs(inputs)
        .with_priority(priority)
}

async fn wait_settled(orchestrator: &Orchestrator, run_id: RunId) -> Result<Run> {
    loop {
        let run = orchestrator.get_run(run_id).await?;
        if run.status.is_terminal() {
            return Ok(run);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging(log_format_from_env());

    let config = FlowConfig::from_env()?;
    tracing::info!(?config, "starting workcell demo");

    let mut registry = StepRegistry::new();
    register_steps(&mut registry)?;

    let assets = Arc::new(AssetRegistry::new());
    for device in [
        SimDevice::new("pipette-1", "pipette"),
        SimDevice::new("pipette-2", "pipette"),
        SimDevice::new("reader-1", "plate_reader"),
    ] {
        assets.add_asset(device)?;
    }
    assets.setup_all().await?;

    let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let backups = Arc::new(AssetBackupStore::new(Arc::clone(&storage), &config.backup));
    if let Some(restored) = backups.restore_latest(&assets).await? {
        tracing::info!(restored, "asset state restored");
    }
    let shutdown = CancellationToken::new();
    let backup_loop = Arc::clone(&backups).spawn_backup_loop(
        Arc::clone(&assets),
        config.backup.interval,
        shutdown.clone(),
    );

    let store = Arc::new(InMemoryStore::new());
    let (pool, dispatched) = ChannelWorkerPool::new("local");
    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        AssetLockManager::new(Arc::clone(&storage)),
        assets.clone(),
        Arc::new(pool),
        &config,
    ));
    let orchestrator = Orchestrator::new(
        Arc::new(registry),
        store,
        Arc::new(InMemoryControlChannel::new()),
        scheduler,
        assets.clone(),
        config,
    );
    let handle = orchestrator.start(dispatched);

    // Both runs need the reader; the second waits until the first releases it.
    let first = orchestrator.submit(assay_request("pipette-1", 3, 1)).await?;
    let second = orchestrator.submit(assay_request("pipette-2", 2, 5)).await?;
    let outcome = orchestrator.pause_run(first).await?;
    tracing::info!(run_id = %first, ?outcome, "pause requested");
    tokio::time::sleep(Duration::from_millis(200)).await;
    let outcome = orchestrator.resume_run(first).await?;
    tracing::info!(run_id = %first, ?outcome, "resume requested");

    for run_id in [first, second] {
        let run = wait_settled(&orchestrator, run_id).await?;
        let calls = orchestrator.list_calls(run_id).await?;
        tracing::info!(
            %run_id,
            status = %run.status,
            calls = calls.len(),
            path = ?run.status_path(),
            output = ?run.output,
            "run settled"
        );
    }

    let path = backups.backup(&assets).await?;
    tracing::info!(%path, "final asset backup written");

    handle.shutdown().await;
    shutdown.cancel();
    if let Err(err) = backup_loop.await {
        tracing::warn!(error = %err, "backup loop panicked");
    }
    assets.teardown_all().await?;
    Ok(())
}

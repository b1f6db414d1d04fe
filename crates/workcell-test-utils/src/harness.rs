//! A fully wired in-memory workcell for integration tests.

use std::sync::Arc;
use std::time::Duration;

use workcell_core::{AssetLockManager, RunId, StorageBackend};
use workcell_flow::assets::{AssetRegistry, LiveAsset};
use workcell_flow::config::FlowConfig;
use workcell_flow::control::InMemoryControlChannel;
use workcell_flow::dispatch::channel::ChannelWorkerPool;
use workcell_flow::orchestrator::{Orchestrator, OrchestratorHandle};
use workcell_flow::registry::{StepDefinition, StepRegistry};
use workcell_flow::run::{Run, RunStatus};
use workcell_flow::scheduler::Scheduler;
use workcell_flow::store::RunStore;
use workcell_flow::store::memory::InMemoryStore;

use crate::storage::TracingMemoryBackend;
use crate::store::FaultyRunStore;

/// Default wait used by the `wait_for_*` helpers.
pub const DEFAULT_WAIT: Duration = Duration::from_secs(10);

/// Configuration with short intervals so tests settle quickly.
pub fn fast_config() -> FlowConfig {
    let mut config = FlowConfig {
        control_poll_interval: Duration::from_millis(5),
        scheduler_tick_interval: Duration::from_millis(10),
        lease_renew_interval: Duration::from_millis(100),
        ..FlowConfig::default()
    };
    config.reservation_retry.backoff = Duration::from_millis(10);
    config
}

/// Builder for [`TestWorkcell`].
#[derive(Default)]
pub struct TestWorkcellBuilder {
    steps: Vec<StepDefinition>,
    assets: Vec<Arc<dyn LiveAsset>>,
    config: Option<FlowConfig>,
    storage: Option<TracingMemoryBackend>,
    run_store: Option<Arc<FaultyRunStore>>,
}

impl TestWorkcellBuilder {
    /// Registers a step.
    #[must_use]
    pub fn step(mut self, definition: StepDefinition) -> Self {
        self.steps.push(definition);
        self
    }

    /// Adds a live asset.
    #[must_use]
    pub fn asset(mut self, asset: Arc<dyn LiveAsset>) -> Self {
        self.assets.push(asset);
        self
    }

    /// Overrides [`fast_config`].
    #[must_use]
    pub fn config(mut self, config: FlowConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Uses `storage` as the lock backend.
    #[must_use]
    pub fn storage(mut self, storage: TracingMemoryBackend) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Persists runs through `store`, for fault injection.
    #[must_use]
    pub fn run_store(mut self, store: Arc<FaultyRunStore>) -> Self {
        self.run_store = Some(store);
        self
    }

    /// Wires everything and starts the orchestrator loops.
    ///
    /// Must be called within a Tokio runtime.
    pub fn start(self) -> TestWorkcell {
        let config = self.config.unwrap_or_else(fast_config);
        let lock_storage = self.storage.unwrap_or_default();

        let mut registry = StepRegistry::new();
        for step in self.steps {
            registry.register(step).expect("register step");
        }
        let assets = Arc::new(AssetRegistry::new());
        for asset in self.assets {
            assets.add_asset(asset).expect("add asset");
        }

        let store = self
            .run_store
            .as_ref()
            .map_or_else(|| Arc::new(InMemoryStore::new()), |faulty| Arc::clone(faulty.inner()));
        let run_store: Arc<dyn RunStore> = match self.run_store {
            Some(faulty) => faulty,
            None => store.clone(),
        };
        let (pool, dispatched) = ChannelWorkerPool::new("test");
        let backend: Arc<dyn StorageBackend> = Arc::new(lock_storage.clone());
        let scheduler = Arc::new(Scheduler::new(
            run_store.clone(),
            AssetLockManager::new(backend),
            assets.clone(),
            Arc::new(pool),
            &config,
        ));
        let orchestrator = Orchestrator::new(
            Arc::new(registry),
            run_store,
            Arc::new(InMemoryControlChannel::new()),
            scheduler,
            assets,
            config,
        );
        let handle = orchestrator.start(dispatched);

        TestWorkcell {
            orchestrator,
            store,
            lock_storage,
            handle: Some(handle),
        }
    }
}

/// A running in-memory workcell.
pub struct TestWorkcell {
    /// The orchestrator under test.
    pub orchestrator: Arc<Orchestrator>,
    /// The run store behind it (behind the faulty wrapper when one is set).
    pub store: Arc<InMemoryStore>,
    /// The lock backend, for tracing and fault injection.
    pub lock_storage: TracingMemoryBackend,
    handle: Option<OrchestratorHandle>,
}

impl TestWorkcell {
    /// Starts building a workcell.
    pub fn builder() -> TestWorkcellBuilder {
        TestWorkcellBuilder::default()
    }

    /// Loads a run.
    pub async fn run(&self, run_id: RunId) -> Run {
        self.orchestrator.get_run(run_id).await.expect("run exists")
    }

    /// Polls until the run satisfies `done`, panicking after `timeout`.
    pub async fn wait_for(
        &self,
        run_id: RunId,
        timeout: Duration,
        done: impl Fn(&Run) -> bool,
    ) -> Run {
        let waited = tokio::time::timeout(timeout, async {
            loop {
                let run = self.run(run_id).await;
                if done(&run) {
                    return run;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        match waited {
            Ok(run) => run,
            Err(_) => {
                let run = self.run(run_id).await;
                panic!(
                    "run {run_id} did not reach the expected state within {timeout:?}; status {} path {:?}",
                    run.status,
                    run.status_path()
                );
            }
        }
    }

    /// Waits until the run has status `status`.
    pub async fn wait_for_status(&self, run_id: RunId, status: RunStatus) -> Run {
        self.wait_for(run_id, DEFAULT_WAIT, |run| run.status == status)
            .await
    }

    /// Waits until the run is terminal.
    pub async fn wait_for_settled(&self, run_id: RunId) -> Run {
        self.wait_for(run_id, DEFAULT_WAIT, |run| run.status.is_terminal())
            .await
    }

    /// Stops the orchestrator loops, cancelling runs still executing.
    pub async fn shutdown(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.shutdown().await;
        }
    }
}

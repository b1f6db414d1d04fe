//! # workcell-flow
//!
//! Run orchestration for laboratory automation protocols.
//!
//! This crate implements the orchestration domain, providing:
//!
//! - **Run State Machine**: Validated lifecycle transitions with full history
//! - **Scheduling**: Priority dispatch with exclusive asset reservations
//! - **Control Commands**: Pause, resume, cancel and intervene at step boundaries
//! - **Call Trees**: An audit record per step invocation with run-wide sequencing
//! - **Live Assets**: A registry of device handles with snapshot and restore
//!
//! ## Core Concepts
//!
//! - **Step**: A registered unit of work, addressed as `name@version`
//! - **Run**: One execution of a top-level step, with inputs, shared state and output
//! - **Call**: One invocation of a step within a run; calls nest into a tree
//! - **Asset**: A named physical resource a run must hold exclusively
//!
//! ## Guarantees
//!
//! - **Exclusive**: An asset is reserved by at most one run at a time
//! - **Ordered**: Call sequence numbers are unique and increasing within a run
//! - **Released**: Every exit from execution releases the run's reservations
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use serde_json::{json, Map};
//! use workcell_core::{AssetLockManager, MemoryBackend, StorageBackend};
//! use workcell_flow::prelude::*;
//!
//! # async fn demo() -> Result<()> {
//! let mut registry = StepRegistry::new();
//! registry.register(
//!     StepDefinition::builder("hello", "1")
//!         .top_level()
//!         .run(|_ctx, _args| async move { Ok(json!("hi")) }),
//! )?;
//!
//! let config = FlowConfig::default();
//! let store = Arc::new(InMemoryStore::new());
//! let assets = Arc::new(AssetRegistry::new());
//! let (pool, dispatched) = ChannelWorkerPool::new("local");
//! let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
//! let scheduler = Arc::new(Scheduler::new(
//!     store.clone(),
//!     AssetLockManager::new(backend),
//!     assets.clone(),
//!     Arc::new(pool),
//!     &config,
//! ));
//! let orchestrator = Orchestrator::new(
//!     Arc::new(registry),
//!     store,
//!     Arc::new(InMemoryControlChannel::new()),
//!     scheduler,
//!     assets,
//!     config,
//! );
//!
//! let handle = orchestrator.start(dispatched);
//! let run_id = orchestrator
//!     .submit_run(StepKey::new("hello", "1"), Map::new(), Map::new())
//!     .await?;
//! # let _ = run_id;
//! handle.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod assets;
pub mod call;
pub mod config;
pub mod context;
pub mod control;
pub mod dispatch;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod registry;
pub mod run;
pub mod scheduler;
pub mod store;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::assets::backup::{AssetBackupStore, AssetSnapshot};
    pub use crate::assets::{AssetRegistry, LiveAsset};
    pub use crate::call::{CallRecord, CallStatus};
    pub use crate::config::{BackupConfig, FlowConfig, ReservationRetryPolicy};
    pub use crate::context::{CallContext, RunScope, SharedState, StepInvoker};
    pub use crate::control::{
        ControlChannel, ControlCommand, ControlOutcome, InMemoryControlChannel,
    };
    pub use crate::dispatch::channel::ChannelWorkerPool;
    pub use crate::dispatch::memory::InMemoryWorkerPool;
    pub use crate::dispatch::{DispatchEnvelope, WorkerPool};
    pub use crate::error::{Error, Result};
    pub use crate::metrics::FlowMetrics;
    pub use crate::orchestrator::{Orchestrator, OrchestratorHandle, RunRequest, TickReport};
    pub use crate::registry::{Step, StepDefinition, StepKey, StepManifest, StepRegistry};
    pub use crate::run::{Run, RunStatus};
    pub use crate::scheduler::{
        Admission, AssetCatalog, AssetDescriptor, ResourceRequirement, ScheduleEntry,
        ScheduleStatus, Scheduler,
    };
    pub use crate::store::memory::InMemoryStore;
    pub use crate::store::{CasResult, RunStore};
}

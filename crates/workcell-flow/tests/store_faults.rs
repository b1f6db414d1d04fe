//! Runs against a run store that rejects writes.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value, json};

use workcell_core::{AssetLockManager, StorageBackend};
use workcell_flow::assets::AssetRegistry;
use workcell_flow::call::CallStatus;
use workcell_flow::control::InMemoryControlChannel;
use workcell_flow::dispatch::memory::InMemoryWorkerPool;
use workcell_flow::orchestrator::{AUDIT_FAILURE_ALARM_THRESHOLD, Orchestrator, RunRequest};
use workcell_flow::registry::StepRegistry;
use workcell_flow::run::RunStatus;
use workcell_flow::scheduler::Scheduler;
use workcell_test_utils::{
    FaultyRunStore, TestDevice, TestWorkcell, TracingMemoryBackend, assert_all_calls,
    assert_run_completed, fast_config, holding_step, leaf_step, looping_step, step_key,
};

fn items(n: u64) -> Map<String, Value> {
    let mut inputs = Map::new();
    inputs.insert(
        "items".into(),
        Value::Array((1..=n).map(|i| json!(i)).collect()),
    );
    inputs
}

#[tokio::test]
async fn failed_call_writes_do_not_change_the_outcome() {
    let store = FaultyRunStore::new();
    store.fail_call_writes(true);
    let cell = TestWorkcell::builder()
        .step(looping_step("protocol", "leaf", Duration::from_millis(5)))
        .step(leaf_step("leaf"))
        .run_store(store.clone())
        .start();

    let run_id = cell
        .orchestrator
        .submit(RunRequest::new(step_key("protocol")).with_inputs(items(2)))
        .await
        .expect("submit");
    let run = cell.wait_for_settled(run_id).await;
    assert_run_completed(&run);
    assert_eq!(run.output, Some(json!([1, 2])));
    assert_eq!(run.call_sequence, 3);

    // Each of the three calls lost its open and its close write.
    assert_eq!(store.rejected_call_writes(), 6);
    assert!(cell.orchestrator.list_calls(run_id).await.unwrap().is_empty());
    let alarms = cell.orchestrator.audit_alarms();
    assert_eq!(alarms, 6 - u64::from(AUDIT_FAILURE_ALARM_THRESHOLD) + 1);

    // The consecutive count is per run and resets once writes go through.
    store.fail_call_writes(false);
    let healthy = cell
        .orchestrator
        .submit(RunRequest::new(step_key("protocol")).with_inputs(items(2)))
        .await
        .expect("submit");
    assert_run_completed(&cell.wait_for_settled(healthy).await);
    let calls = cell.orchestrator.list_calls(healthy).await.unwrap();
    assert_eq!(calls.len(), 3);
    assert_all_calls(&calls, CallStatus::Success);
    assert_eq!(cell.orchestrator.audit_alarms(), alarms);
    cell.shutdown().await;
}

#[tokio::test]
async fn failure_to_record_a_start_error_still_cleans_up() {
    let store = FaultyRunStore::new();
    let mut registry = StepRegistry::new();
    registry
        .register(holding_step("hold", "arm", Duration::from_millis(10)))
        .unwrap();
    let assets = Arc::new(AssetRegistry::new());
    assets.add_asset(TestDevice::new("arm-1", "arm")).unwrap();

    let config = fast_config();
    let pool = Arc::new(InMemoryWorkerPool::new("faults"));
    let backend: Arc<dyn StorageBackend> = Arc::new(TracingMemoryBackend::new());
    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        AssetLockManager::new(backend),
        assets.clone(),
        pool.clone(),
        &config,
    ));
    let orchestrator = Orchestrator::new(
        Arc::new(registry),
        store.clone(),
        Arc::new(InMemoryControlChannel::new()),
        scheduler,
        assets.clone(),
        config,
    );

    let mut inputs = Map::new();
    inputs.insert("device".into(), json!("arm-1"));
    let run_id = orchestrator
        .submit(RunRequest::new(step_key("hold")).with_inputs(inputs))
        .await
        .unwrap();
    let envelope = pool.take().unwrap().expect("dispatched");
    assert_eq!(envelope.run_id, run_id);
    let locks = orchestrator.scheduler().locks();
    assert!(locks.is_locked("arm-1").await.unwrap());

    // The device disappears before the worker builds the run's context, and
    // only the RUNNING transition can still be saved.
    assets.remove_asset("arm-1").unwrap();
    store.fail_run_saves_after(1);

    let status = orchestrator.execute_run(run_id).await.expect("execute");
    assert_eq!(status, RunStatus::Failed);
    assert_eq!(store.rejected_run_saves(), 1);
    assert!(orchestrator.active_runs().is_empty());
    assert!(!locks.is_locked("arm-1").await.unwrap());
    assert!(pool.is_empty().unwrap());
}

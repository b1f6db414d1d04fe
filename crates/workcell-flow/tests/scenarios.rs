//! End-to-end scenarios against a running in-memory workcell.
//!
//! Each test wires a full orchestrator (scheduler, lock manager, worker
//! loop, ticker) through [`TestWorkcell`] and drives it with the public
//! control API only.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::time::Duration;

use serde_json::{Map, Value, json};

use workcell_core::RunId;
use workcell_flow::call::{CallRecord, CallStatus};
use workcell_flow::context::CallContext;
use workcell_flow::control::ControlOutcome;
use workcell_flow::error::Error;
use workcell_flow::orchestrator::RunRequest;
use workcell_flow::registry::StepDefinition;
use workcell_flow::run::RunStatus;
use workcell_flow::scheduler::{ScheduleEntry, ScheduleStatus};
use workcell_flow::store::RunStore;
use workcell_test_utils::{
    DEFAULT_WAIT, TestDevice, TestWorkcell, assert_all_calls, assert_call_tree,
    assert_run_completed, assert_valid_status_path, echo_step, failing_step, fast_config,
    holding_step, init_test_logging, leaf_step, looping_step, step_key,
};

const PACE: Duration = Duration::from_millis(30);

fn inputs(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), v.clone()))
        .collect()
}

fn items(n: u64) -> Map<String, Value> {
    inputs(&[("items", Value::Array((1..=n).map(|i| json!(i)).collect()))])
}

fn looping_cell() -> TestWorkcell {
    TestWorkcell::builder()
        .step(looping_step("protocol", "leaf", PACE))
        .step(leaf_step("leaf"))
        .start()
}

/// Holds an arm and keeps calling `leaf` until cancelled.
fn tending_step() -> StepDefinition {
    StepDefinition::builder("tend", "1")
        .top_level()
        .asset("device", "arm")
        .run(|ctx, _args| async move {
            for _ in 0..1_000 {
                tokio::time::sleep(PACE).await;
                ctx.call(&step_key("leaf"), Value::Null).await?;
            }
            Ok(Value::Null)
        })
}

/// Calls `leaf` `rounds` times on each of two concurrent branches.
fn fanout_step(rounds: u64) -> StepDefinition {
    StepDefinition::builder("fanout", "1")
        .top_level()
        .run(move |ctx, _args| async move {
            let branch = move |ctx: CallContext| async move {
                for round in 0..rounds {
                    tokio::time::sleep(PACE).await;
                    ctx.call(&step_key("leaf"), json!(round)).await?;
                }
                Ok::<_, Error>(())
            };
            tokio::try_join!(branch(ctx.clone()), branch(ctx.clone()))?;
            Ok(Value::Null)
        })
}

async fn wait_for_entry(
    cell: &TestWorkcell,
    run_id: RunId,
    done: impl Fn(&ScheduleEntry) -> bool,
) -> ScheduleEntry {
    tokio::time::timeout(DEFAULT_WAIT, async {
        loop {
            if let Some(entry) = cell.store.get_schedule_entry(&run_id).await.expect("entry") {
                if done(&entry) {
                    return entry;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("schedule entry reached the expected state in time")
}

fn closed(calls: &[CallRecord]) -> usize {
    calls.iter().filter(|c| c.is_closed()).count()
}

fn paused_once_path() -> Vec<RunStatus> {
    vec![
        RunStatus::Pending,
        RunStatus::Preparing,
        RunStatus::Queued,
        RunStatus::Running,
        RunStatus::Pausing,
        RunStatus::Paused,
        RunStatus::Resuming,
        RunStatus::Running,
        RunStatus::Completed,
    ]
}

async fn wait_for_unlocked(cell: &TestWorkcell, asset: &str) {
    let locks = cell.orchestrator.scheduler().locks();
    tokio::time::timeout(DEFAULT_WAIT, async {
        while locks.is_locked(asset).await.expect("lock backend") {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("asset released in time");
}

async fn submit(cell: &TestWorkcell, name: &str, inputs: Map<String, Value>) -> RunId {
    cell.orchestrator
        .submit(RunRequest::new(step_key(name)).with_inputs(inputs))
        .await
        .expect("submit")
}

async fn calls(cell: &TestWorkcell, run_id: RunId) -> Vec<CallRecord> {
    cell.orchestrator.list_calls(run_id).await.expect("calls")
}

async fn wait_for_calls(cell: &TestWorkcell, run_id: RunId, at_least: usize) {
    tokio::time::timeout(DEFAULT_WAIT, async {
        while calls(cell, run_id).await.len() < at_least {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("calls recorded in time");
}

// ============================================================================
// Execution
// ============================================================================

#[tokio::test]
async fn simple_run_completes_with_a_single_call() {
    init_test_logging();
    let cell = TestWorkcell::builder().step(echo_step("hello")).start();

    let mut state = Map::new();
    state.insert("plate".into(), json!("P-001"));
    let run_id = cell
        .orchestrator
        .submit_run(step_key("hello"), inputs(&[("greeting", json!("hi"))]), state)
        .await
        .expect("submit");

    let run = cell.wait_for_settled(run_id).await;
    assert_run_completed(&run);
    assert_valid_status_path(&run);
    assert_eq!(
        run.status_path(),
        vec![
            RunStatus::Pending,
            RunStatus::Preparing,
            RunStatus::Queued,
            RunStatus::Running,
            RunStatus::Completed,
        ]
    );
    assert_eq!(run.output, Some(json!({ "greeting": "hi" })));
    assert_eq!(
        run.final_state.as_ref().and_then(|s| s.get("plate")),
        Some(&json!("P-001"))
    );

    let calls = calls(&cell, run_id).await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].sequence, 1);
    assert_all_calls(&calls, CallStatus::Success);
    cell.shutdown().await;
}

#[tokio::test]
async fn nested_calls_form_a_sequenced_tree() {
    let cell = looping_cell();
    let run_id = submit(&cell, "protocol", items(4)).await;

    let run = cell.wait_for_settled(run_id).await;
    assert_run_completed(&run);
    assert_eq!(run.output, Some(json!([1, 2, 3, 4])));
    assert_eq!(run.call_sequence, 5);

    let calls = calls(&cell, run_id).await;
    assert_eq!(calls.len(), 5);
    assert_call_tree(&calls);
    assert_all_calls(&calls, CallStatus::Success);
    let root = calls[0].call_id;
    assert!(calls[1..].iter().all(|c| c.parent_call_id == Some(root)));
    cell.shutdown().await;
}

#[tokio::test]
async fn step_failure_fails_the_run_with_a_trace() {
    let cell = TestWorkcell::builder()
        .step(failing_step("broken", "gripper jammed"))
        .start();
    let run_id = submit(&cell, "broken", Map::new()).await;

    let run = cell.wait_for_settled(run_id).await;
    assert_eq!(run.status, RunStatus::Failed);
    assert_valid_status_path(&run);
    let error = run.error.expect("error recorded");
    assert!(error.message.contains("gripper jammed"), "{}", error.message);
    assert!(!error.trace.is_empty());

    let calls = calls(&cell, run_id).await;
    assert_all_calls(&calls, CallStatus::Error);
    assert!(calls[0].error.as_deref().unwrap_or_default().contains("gripper jammed"));
    cell.shutdown().await;
}

#[tokio::test]
async fn failed_run_releases_its_asset() {
    let cell = TestWorkcell::builder()
        .step(
            StepDefinition::builder("clamp", "1")
                .top_level()
                .asset("device", "arm")
                .run(|_ctx, _args| async move {
                    tokio::time::sleep(PACE).await;
                    Err::<Value, _>(Error::step_failure("clamp pressure low"))
                }),
        )
        .asset(TestDevice::new("arm-1", "arm"))
        .start();

    let run_id = submit(&cell, "clamp", inputs(&[("device", json!("arm-1"))])).await;
    let run = cell.wait_for_settled(run_id).await;
    assert_eq!(run.status, RunStatus::Failed);
    assert_all_calls(&calls(&cell, run_id).await, CallStatus::Error);

    wait_for_unlocked(&cell, "arm-1").await;
    cell.shutdown().await;
}

#[tokio::test]
async fn missing_input_fails_before_queueing() {
    let cell = looping_cell();
    let run_id = submit(&cell, "protocol", Map::new()).await;

    let run = cell.wait_for_settled(run_id).await;
    assert_eq!(
        run.status_path(),
        vec![RunStatus::Pending, RunStatus::Preparing, RunStatus::Failed]
    );
    assert!(calls(&cell, run_id).await.is_empty());
    cell.shutdown().await;
}

#[tokio::test]
async fn unknown_definition_creates_no_run() {
    let cell = TestWorkcell::builder().step(leaf_step("leaf")).start();

    // Registered, but not top-level.
    let err = cell
        .orchestrator
        .submit(RunRequest::new(step_key("leaf")))
        .await
        .expect_err("not top-level");
    assert!(matches!(err, Error::DefinitionNotFound { .. }));
    assert_eq!(cell.store.run_count().expect("count"), 0);
    cell.shutdown().await;
}

// ============================================================================
// Assets and scheduling
// ============================================================================

#[tokio::test]
async fn contended_asset_is_held_by_one_run_at_a_time() {
    let cell = TestWorkcell::builder()
        .step(holding_step("hold", "arm", Duration::from_millis(150)))
        .asset(TestDevice::new("arm-1", "arm"))
        .start();

    let first = submit(&cell, "hold", inputs(&[("device", json!("arm-1"))])).await;
    let second = submit(&cell, "hold", inputs(&[("device", json!("arm-1"))])).await;

    // The holder's entry went straight through admission to RUNNING.
    let holder = wait_for_entry(&cell, first, |e| e.status == ScheduleStatus::Running).await;
    for phase in [
        ScheduleStatus::Queued,
        ScheduleStatus::Analyzing,
        ScheduleStatus::Reserving,
        ScheduleStatus::Ready,
        ScheduleStatus::Running,
    ] {
        assert!(holder.phase_timestamps.contains_key(&phase), "holder never {phase}");
    }
    assert_eq!(holder.attempts, 0);

    // The waiter found the asset held and went back to QUEUED.
    let waiting = wait_for_entry(&cell, second, |e| {
        e.status == ScheduleStatus::Queued && e.attempts >= 1
    })
    .await;
    assert_eq!(waiting.blocked_on.as_deref(), Some("arm-1"));
    assert!(waiting.phase_timestamps.contains_key(&ScheduleStatus::Reserving));
    assert!(!waiting.phase_timestamps.contains_key(&ScheduleStatus::Ready));
    let queue = cell.orchestrator.scheduler().pending_queue().await.unwrap();
    assert_eq!(queue.iter().map(|e| e.run_id).collect::<Vec<_>>(), vec![second]);
    assert_eq!(queue[0].queue_position, Some(0));
    assert_eq!(cell.run(second).await.status, RunStatus::Queued);

    let a = cell.wait_for_settled(first).await;
    let b = cell.wait_for_settled(second).await;
    assert_run_completed(&a);
    assert_run_completed(&b);

    let admitted = wait_for_entry(&cell, second, |e| e.status.is_terminal()).await;
    assert_eq!(admitted.status, ScheduleStatus::Completed);
    assert!(admitted.phase_timestamps.contains_key(&ScheduleStatus::Ready));
    assert!(admitted.phase_timestamps.contains_key(&ScheduleStatus::Running));
    assert!(admitted.attempts >= 1);
    assert_eq!(admitted.blocked_on, None);
    assert!(cell.orchestrator.scheduler().pending_queue().await.unwrap().is_empty());
    assert_eq!(a.output, Some(json!("arm-1")));
    assert_eq!(b.assets.get("device").map(String::as_str), Some("arm-1"));

    let (a_end, b_start) = (a.ended_at.unwrap(), b.started_at.unwrap());
    assert!(b_start >= a_end, "second run started at {b_start} before first ended at {a_end}");
    cell.shutdown().await;
}

#[tokio::test]
async fn distinct_assets_run_concurrently() {
    let cell = TestWorkcell::builder()
        .step(holding_step("hold", "arm", Duration::from_millis(200)))
        .asset(TestDevice::new("arm-1", "arm"))
        .asset(TestDevice::new("arm-2", "arm"))
        .start();

    let first = submit(&cell, "hold", inputs(&[("device", json!("arm-1"))])).await;
    let second = submit(&cell, "hold", inputs(&[("device", json!("arm-2"))])).await;

    let a = cell.wait_for_settled(first).await;
    let b = cell.wait_for_settled(second).await;
    assert_run_completed(&a);
    assert_run_completed(&b);
    assert!(a.started_at.unwrap() < b.ended_at.unwrap());
    assert!(b.started_at.unwrap() < a.ended_at.unwrap());
    cell.shutdown().await;
}

#[tokio::test]
async fn waiting_runs_are_admitted_by_priority() {
    let mut config = fast_config();
    // Admission only happens when the holder finishes.
    config.scheduler_tick_interval = Duration::from_secs(3600);
    config.reservation_retry.backoff = Duration::ZERO;
    let cell = TestWorkcell::builder()
        .step(holding_step("hold", "arm", Duration::from_millis(100)))
        .asset(TestDevice::new("arm-1", "arm"))
        .config(config)
        .start();

    let device = || inputs(&[("device", json!("arm-1"))]);
    let holder = submit(&cell, "hold", device()).await;
    let low = cell
        .orchestrator
        .submit(RunRequest::new(step_key("hold")).with_inputs(device()).with_priority(1))
        .await
        .expect("submit low");
    let high = cell
        .orchestrator
        .submit(RunRequest::new(step_key("hold")).with_inputs(device()).with_priority(9))
        .await
        .expect("submit high");

    assert_eq!(cell.run(low).await.status, RunStatus::Queued);
    assert_eq!(cell.run(high).await.status, RunStatus::Queued);

    assert_run_completed(&cell.wait_for_settled(holder).await);
    let high = cell.wait_for_settled(high).await;
    let low = cell.wait_for_settled(low).await;
    assert_run_completed(&high);
    assert_run_completed(&low);
    assert!(high.started_at.unwrap() < low.started_at.unwrap());
    cell.shutdown().await;
}

#[tokio::test]
async fn unknown_asset_fails_requirement_analysis() {
    let cell = TestWorkcell::builder()
        .step(holding_step("hold", "arm", Duration::from_millis(10)))
        .asset(TestDevice::new("arm-1", "arm"))
        .start();

    let run_id = submit(&cell, "hold", inputs(&[("device", json!("ghost"))])).await;
    let run = cell.wait_for_settled(run_id).await;
    assert_eq!(run.status, RunStatus::Failed);
    assert_valid_status_path(&run);
    let message = run.error.expect("error").message;
    assert!(message.contains("ghost"), "{message}");
    cell.shutdown().await;
}

#[tokio::test]
async fn lock_backend_outage_leaves_run_queued_until_recovery() {
    let cell = TestWorkcell::builder()
        .step(holding_step("hold", "arm", Duration::from_millis(10)))
        .asset(TestDevice::new("arm-1", "arm"))
        .start();
    cell.lock_storage.inject_failure("");

    let run_id = submit(&cell, "hold", inputs(&[("device", json!("arm-1"))])).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let run = cell.run(run_id).await;
    assert_eq!(run.status, RunStatus::Queued);
    assert!(run.error.is_none());

    cell.lock_storage.clear_failures();
    let run = cell.wait_for_settled(run_id).await;
    assert_run_completed(&run);
    assert!(!cell.lock_storage.operations().is_empty());
    cell.shutdown().await;
}

#[tokio::test]
async fn priority_of_a_waiting_run_can_be_raised() {
    let cell = TestWorkcell::builder()
        .step(holding_step("hold", "arm", Duration::from_millis(150)))
        .asset(TestDevice::new("arm-1", "arm"))
        .start();

    let holder = submit(&cell, "hold", inputs(&[("device", json!("arm-1"))])).await;
    let waiting = submit(&cell, "hold", inputs(&[("device", json!("arm-1"))])).await;

    assert!(cell.orchestrator.update_priority(waiting, 7).await.expect("update"));
    assert_eq!(cell.run(waiting).await.priority, 7);
    assert!(cell.orchestrator.update_priority(waiting, 0).await.is_err());

    assert_run_completed(&cell.wait_for_settled(holder).await);
    assert_run_completed(&cell.wait_for_settled(waiting).await);
    cell.shutdown().await;
}

// ============================================================================
// Control commands
// ============================================================================

#[tokio::test]
async fn pause_holds_the_run_between_steps_until_resumed() {
    let cell = looping_cell();
    let run_id = submit(&cell, "protocol", items(6)).await;
    wait_for_calls(&cell, run_id, 2).await;

    let orchestrator = &cell.orchestrator;
    assert_eq!(orchestrator.pause_run(run_id).await.unwrap(), ControlOutcome::Enqueued);
    cell.wait_for_status(run_id, RunStatus::Paused).await;
    assert_eq!(
        orchestrator.pause_run(run_id).await.unwrap(),
        ControlOutcome::AlreadyInEffect
    );

    let while_paused = calls(&cell, run_id).await.len();
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(calls(&cell, run_id).await.len(), while_paused);
    assert_eq!(cell.run(run_id).await.status, RunStatus::Paused);

    assert_eq!(orchestrator.resume_run(run_id).await.unwrap(), ControlOutcome::Enqueued);
    let run = cell.wait_for_settled(run_id).await;
    assert_run_completed(&run);
    assert_valid_status_path(&run);
    assert_eq!(run.status_path(), paused_once_path());

    let calls = calls(&cell, run_id).await;
    assert_eq!(calls.len(), 7);
    assert_call_tree(&calls);
    assert_all_calls(&calls, CallStatus::Success);
    cell.shutdown().await;
}

#[tokio::test]
async fn pause_holds_concurrent_sibling_calls() {
    let cell = TestWorkcell::builder()
        .step(fanout_step(30))
        .step(leaf_step("leaf"))
        .start();
    let run_id = submit(&cell, "fanout", Map::new()).await;
    wait_for_calls(&cell, run_id, 5).await;

    assert_eq!(
        cell.orchestrator.pause_run(run_id).await.unwrap(),
        ControlOutcome::Enqueued
    );
    cell.wait_for_status(run_id, RunStatus::Paused).await;
    // The other branch may still open one call before reaching its boundary.
    tokio::time::sleep(PACE * 3).await;
    let held = calls(&cell, run_id).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    let later = calls(&cell, run_id).await;
    assert_eq!(later.len(), held.len());
    assert_eq!(closed(&later), closed(&held));
    assert_eq!(cell.run(run_id).await.status, RunStatus::Paused);

    // Exactly one boundary takes the resume; the sibling follows it.
    assert_eq!(
        cell.orchestrator.resume_run(run_id).await.unwrap(),
        ControlOutcome::Enqueued
    );
    let run = cell.wait_for_settled(run_id).await;
    assert_run_completed(&run);
    assert_eq!(run.status_path(), paused_once_path());

    let calls = calls(&cell, run_id).await;
    assert_eq!(calls.len(), 61);
    assert_call_tree(&calls);
    assert_all_calls(&calls, CallStatus::Success);
    cell.shutdown().await;
}

#[tokio::test]
async fn cancel_mid_run_marks_interrupted_calls_unknown() {
    let cell = looping_cell();
    let run_id = submit(&cell, "protocol", items(50)).await;
    wait_for_calls(&cell, run_id, 3).await;

    assert_eq!(
        cell.orchestrator.cancel_run(run_id, "operator abort").await.unwrap(),
        ControlOutcome::Enqueued
    );
    let run = cell.wait_for_settled(run_id).await;
    assert_eq!(run.status, RunStatus::Cancelled);
    assert_valid_status_path(&run);
    assert_eq!(
        run.output,
        Some(json!({ "cancelled": true, "reason": "operator abort" }))
    );
    assert!(run.error.is_none());

    let calls = calls(&cell, run_id).await;
    assert!(calls.len() < 51);
    assert_call_tree(&calls);
    assert_eq!(calls[0].status, CallStatus::Unknown);
    assert_eq!(calls.last().unwrap().status, CallStatus::Unknown);
    assert_all_calls(&calls[1..calls.len() - 1], CallStatus::Success);
    assert!(calls.iter().all(CallRecord::is_closed));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(cell.orchestrator.list_calls(run_id).await.unwrap().len(), calls.len());
    assert_eq!(
        cell.orchestrator.cancel_run(run_id, "again").await.unwrap(),
        ControlOutcome::AlreadyInEffect
    );
    cell.shutdown().await;
}

#[tokio::test]
async fn cancelling_a_paused_run_releases_its_asset() {
    let cell = TestWorkcell::builder()
        .step(tending_step())
        .step(leaf_step("leaf"))
        .asset(TestDevice::new("arm-1", "arm"))
        .start();
    let run_id = submit(&cell, "tend", inputs(&[("device", json!("arm-1"))])).await;
    wait_for_calls(&cell, run_id, 2).await;

    cell.orchestrator.pause_run(run_id).await.unwrap();
    cell.wait_for_status(run_id, RunStatus::Paused).await;
    let locks = cell.orchestrator.scheduler().locks();
    assert!(locks.is_locked("arm-1").await.unwrap());
    assert_eq!(
        cell.orchestrator.cancel_run(run_id, "plate dropped").await.unwrap(),
        ControlOutcome::Enqueued
    );

    let run = cell.wait_for_settled(run_id).await;
    assert_eq!(run.status, RunStatus::Cancelled);
    assert_valid_status_path(&run);
    assert!(!run.status_path().contains(&RunStatus::Resuming));
    assert_eq!(
        run.output,
        Some(json!({ "cancelled": true, "reason": "plate dropped" }))
    );

    wait_for_unlocked(&cell, "arm-1").await;
    assert!(
        locks
            .acquire("arm-1", "another-owner", Duration::from_secs(5))
            .await
            .unwrap()
    );
    cell.shutdown().await;
}

#[tokio::test]
async fn cancelled_run_releases_its_asset() {
    let cell = TestWorkcell::builder()
        .step(tending_step())
        .step(leaf_step("leaf"))
        .step(holding_step("hold", "arm", Duration::from_millis(10)))
        .asset(TestDevice::new("arm-1", "arm"))
        .start();

    let tender = submit(&cell, "tend", inputs(&[("device", json!("arm-1"))])).await;
    wait_for_calls(&cell, tender, 2).await;
    let waiting = submit(&cell, "hold", inputs(&[("device", json!("arm-1"))])).await;
    assert_eq!(cell.run(waiting).await.status, RunStatus::Queued);

    cell.orchestrator.cancel_run(tender, "done tending").await.unwrap();
    assert_eq!(cell.wait_for_settled(tender).await.status, RunStatus::Cancelled);
    assert_run_completed(&cell.wait_for_settled(waiting).await);
    cell.shutdown().await;
}

#[tokio::test]
async fn cancel_before_execution_applies_immediately() {
    let cell = TestWorkcell::builder()
        .step(holding_step("hold", "arm", Duration::from_millis(150)))
        .asset(TestDevice::new("arm-1", "arm"))
        .start();

    let holder = submit(&cell, "hold", inputs(&[("device", json!("arm-1"))])).await;
    let waiting = submit(&cell, "hold", inputs(&[("device", json!("arm-1"))])).await;

    assert_eq!(
        cell.orchestrator.cancel_run(waiting, "not needed").await.unwrap(),
        ControlOutcome::Applied
    );
    let run = cell.run(waiting).await;
    assert_eq!(
        run.status_path(),
        vec![
            RunStatus::Pending,
            RunStatus::Preparing,
            RunStatus::Queued,
            RunStatus::Canceling,
            RunStatus::Cancelled,
        ]
    );
    let queue = cell.orchestrator.scheduler().pending_queue().await.unwrap();
    assert!(queue.iter().all(|e| e.run_id != waiting));

    assert_run_completed(&cell.wait_for_settled(holder).await);
    assert!(calls(&cell, waiting).await.is_empty());
    cell.shutdown().await;
}

#[tokio::test]
async fn intervention_returns_to_the_interrupted_status() {
    let cell = looping_cell();
    let run_id = submit(&cell, "protocol", items(8)).await;
    wait_for_calls(&cell, run_id, 2).await;

    // While running.
    assert_eq!(
        cell.orchestrator
            .intervene_run(run_id, json!({ "note": "refill tips" }))
            .await
            .unwrap(),
        ControlOutcome::Enqueued
    );
    cell.wait_for(run_id, DEFAULT_WAIT, |run| {
        run.status_path().contains(&RunStatus::Intervening)
    })
    .await;

    // While paused.
    cell.orchestrator.pause_run(run_id).await.unwrap();
    cell.wait_for_status(run_id, RunStatus::Paused).await;
    cell.orchestrator
        .intervene_run(run_id, json!({ "note": "swap plate" }))
        .await
        .unwrap();
    let run = cell
        .wait_for(run_id, DEFAULT_WAIT, |run| {
            let path = run.status_path();
            path.ends_with(&[RunStatus::Paused, RunStatus::Intervening, RunStatus::Paused])
        })
        .await;
    assert_eq!(run.status, RunStatus::Paused);

    cell.orchestrator.resume_run(run_id).await.unwrap();
    let run = cell.wait_for_settled(run_id).await;
    assert_run_completed(&run);
    assert_valid_status_path(&run);
    let interventions = run
        .status_path()
        .iter()
        .filter(|s| **s == RunStatus::Intervening)
        .count();
    assert_eq!(interventions, 2);
    assert_all_calls(&calls(&cell, run_id).await, CallStatus::Success);
    cell.shutdown().await;
}

#[tokio::test]
async fn control_commands_on_finished_runs_report_run_finished() {
    let cell = TestWorkcell::builder().step(echo_step("hello")).start();
    let run_id = submit(&cell, "hello", Map::new()).await;
    assert_run_completed(&cell.wait_for_settled(run_id).await);

    let orchestrator = &cell.orchestrator;
    assert_eq!(orchestrator.pause_run(run_id).await.unwrap(), ControlOutcome::RunFinished);
    assert_eq!(orchestrator.resume_run(run_id).await.unwrap(), ControlOutcome::RunFinished);
    assert_eq!(
        orchestrator.cancel_run(run_id, "late").await.unwrap(),
        ControlOutcome::RunFinished
    );
    assert_eq!(
        orchestrator.intervene_run(run_id, Value::Null).await.unwrap(),
        ControlOutcome::RunFinished
    );
    assert_eq!(cell.run(run_id).await.status, RunStatus::Completed);

    let missing = RunId::generate();
    assert!(matches!(
        orchestrator.pause_run(missing).await,
        Err(Error::RunNotFound { .. })
    ));
    cell.shutdown().await;
}

#[tokio::test]
async fn shutdown_cancels_executing_runs() {
    let cell = looping_cell();
    let run_id = submit(&cell, "protocol", items(100)).await;
    wait_for_calls(&cell, run_id, 2).await;

    let orchestrator = cell.orchestrator.clone();
    cell.shutdown().await;
    let run = orchestrator.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);
    assert_eq!(
        run.output,
        Some(json!({ "cancelled": true, "reason": "orchestrator shutting down" }))
    );
}

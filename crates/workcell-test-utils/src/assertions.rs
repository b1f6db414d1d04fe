//! Custom assertion helpers for integration tests.

use std::collections::HashSet;

use workcell_flow::call::{CallRecord, CallStatus};
use workcell_flow::run::{Run, RunStatus};

/// Asserts that every step of the run's status history is a legal transition.
///
/// # Panics
///
/// Panics on the first illegal transition.
pub fn assert_valid_status_path(run: &Run) {
    let path = run.status_path();
    assert_eq!(
        path.first(),
        Some(&RunStatus::Pending),
        "run {} did not start in PENDING: {path:?}",
        run.id
    );
    for pair in path.windows(2) {
        assert!(
            pair[0].can_transition_to(pair[1]),
            "run {} made an illegal transition {} -> {} in {path:?}",
            run.id,
            pair[0],
            pair[1]
        );
    }
}

/// Asserts that a run completed successfully.
///
/// # Panics
///
/// Panics if the run did not complete.
pub fn assert_run_completed(run: &Run) {
    assert_eq!(
        run.status,
        RunStatus::Completed,
        "expected run to complete, but status was {} (error: {:?})",
        run.status,
        run.error
    );
    assert!(run.ended_at.is_some(), "completed run has no end time");
}

/// Asserts that call records form a single tree with unique, increasing
/// sequence numbers.
///
/// Records must be in sequence order, as the store lists them.
///
/// # Panics
///
/// Panics if there is not exactly one root, a parent is missing, a parent
/// has a later sequence than its child, or sequences repeat.
pub fn assert_call_tree(calls: &[CallRecord]) {
    let roots: Vec<_> = calls.iter().filter(|c| c.parent_call_id.is_none()).collect();
    assert_eq!(roots.len(), 1, "expected one top-level call, found {}", roots.len());

    let mut seen = HashSet::new();
    for (i, call) in calls.iter().enumerate() {
        if i > 0 {
            assert!(
                calls[i - 1].sequence < call.sequence,
                "sequence numbers not strictly increasing at {}",
                call.sequence
            );
        }
        if let Some(parent) = call.parent_call_id {
            assert!(
                seen.contains(&parent),
                "call {} (seq {}) has parent {parent} that did not start before it",
                call.call_id,
                call.sequence
            );
        }
        seen.insert(call.call_id);
    }
}

/// Asserts that every call record is closed with `status`.
///
/// # Panics
///
/// Panics naming the first record with another status.
pub fn assert_all_calls(calls: &[CallRecord], status: CallStatus) {
    for call in calls {
        assert_eq!(
            call.status, status,
            "call {} ({}, seq {}) has status {}",
            call.call_id, call.step, call.sequence, call.status
        );
        assert!(call.is_closed(), "call {} is still open", call.call_id);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Map, Value};
    use workcell_core::{CallId, RunId};
    use workcell_flow::registry::StepKey;

    use super::*;

    fn record(seq: u64, parent: Option<CallId>) -> CallRecord {
        CallRecord::open(
            CallId::generate(),
            RunId::generate(),
            parent,
            seq,
            StepKey::new("s", "1"),
            Value::Null,
        )
    }

    #[test]
    fn accepts_a_well_formed_tree() {
        let root = record(1, None);
        let child = record(2, Some(root.call_id));
        let grandchild = record(3, Some(child.call_id));
        assert_call_tree(&[root, child, grandchild]);
    }

    #[test]
    #[should_panic(expected = "did not start before it")]
    fn rejects_orphans() {
        let root = record(1, None);
        let orphan = record(2, Some(CallId::generate()));
        assert_call_tree(&[root, orphan]);
    }

    #[test]
    fn fresh_run_path_is_valid() {
        let run = Run::new(StepKey::new("s", "1"), Map::new(), Map::new(), 1);
        assert_valid_status_path(&run);
    }
}

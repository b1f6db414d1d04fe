//! Explicit call contexts for step execution.
//!
//! Every step receives a [`CallContext`]. Everything that is per-run lives
//! behind one shared [`RunScope`]: the shared state, the persistence handle,
//! the sequence counter and the run's reserved assets. A context adds only
//! the "current call" pointer. Forking for a nested call therefore copies
//! one pointer and shares the rest, so nested calls continue the same
//! run-wide sequence.
//!
//! The scope also carries the run's control gate. Call boundaries read the
//! control mailbox only while holding it, and a boundary that pauses the run
//! keeps it until the run resumes, so concurrent sibling calls of a paused
//! run wait at their own boundaries.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use workcell_core::{CallId, RunId};

use crate::assets::LiveAsset;
use crate::error::{Error, Result};
use crate::registry::StepKey;
use crate::store::RunStore;

/// Executes nested step invocations on behalf of a context.
///
/// Implemented by the orchestrator; injected so contexts never hold a
/// reference to a concrete orchestrator.
#[async_trait]
pub trait StepInvoker: Send + Sync {
    /// Runs `step` as a child of the context's current call.
    async fn invoke(&self, ctx: &CallContext, step: &StepKey, args: Value) -> Result<Value>;
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::persistence("shared state lock poisoned")
}

/// The run's shared mutable state object.
#[derive(Debug, Clone, Default)]
pub struct SharedState {
    inner: Arc<RwLock<Map<String, Value>>>,
}

impl SharedState {
    /// Wraps an initial state object.
    #[must_use]
    pub fn new(initial: Map<String, Value>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(initial)),
        }
    }

    /// Reads one key.
    ///
    /// # Errors
    ///
    /// Returns an error if the state lock is poisoned.
    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.inner.read().map_err(poison_err)?.get(key).cloned())
    }

    /// Writes one key, returning the previous value.
    ///
    /// # Errors
    ///
    /// Returns an error if the state lock is poisoned.
    pub fn set(&self, key: impl Into<String>, value: Value) -> Result<Option<Value>> {
        Ok(self.inner.write().map_err(poison_err)?.insert(key.into(), value))
    }

    /// Applies `f` to the state under the write lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the state lock is poisoned.
    pub fn update<R>(&self, f: impl FnOnce(&mut Map<String, Value>) -> R) -> Result<R> {
        let mut guard = self.inner.write().map_err(poison_err)?;
        Ok(f(&mut guard))
    }

    /// Copies the whole state.
    ///
    /// # Errors
    ///
    /// Returns an error if the state lock is poisoned.
    pub fn snapshot(&self) -> Result<Map<String, Value>> {
        Ok(self.inner.read().map_err(poison_err)?.clone())
    }
}

/// Per-run data shared by every context of one run.
pub struct RunScope {
    run_id: RunId,
    state: SharedState,
    store: Arc<dyn RunStore>,
    invoker: Arc<dyn StepInvoker>,
    next_sequence: AtomicU64,
    assets: BTreeMap<String, Arc<dyn LiveAsset>>,
    assignments: BTreeMap<String, String>,
    cancellation: CancellationToken,
    audit_failures: AtomicU32,
    control_gate: Mutex<()>,
}

impl RunScope {
    /// Creates a scope with empty state whose first sequence number is 1.
    #[must_use]
    pub fn new(run_id: RunId, store: Arc<dyn RunStore>, invoker: Arc<dyn StepInvoker>) -> Self {
        Self {
            run_id,
            state: SharedState::default(),
            store,
            invoker,
            next_sequence: AtomicU64::new(1),
            assets: BTreeMap::new(),
            assignments: BTreeMap::new(),
            cancellation: CancellationToken::new(),
            audit_failures: AtomicU32::new(0),
            control_gate: Mutex::new(()),
        }
    }

    /// Uses `state` as the shared state.
    #[must_use]
    pub fn with_state(mut self, state: SharedState) -> Self {
        self.state = state;
        self
    }

    /// Continues numbering after `last`.
    #[must_use]
    pub fn with_last_sequence(mut self, last: u64) -> Self {
        self.next_sequence = AtomicU64::new(last + 1);
        self
    }

    /// Makes the run's reserved assets reachable from steps.
    ///
    /// `handles` is keyed by asset name; `assignments` maps asset parameter
    /// names to asset names.
    #[must_use]
    pub fn with_assets(
        mut self,
        handles: BTreeMap<String, Arc<dyn LiveAsset>>,
        assignments: BTreeMap<String, String>,
    ) -> Self {
        self.assets = handles;
        self.assignments = assignments;
        self
    }

    /// Ties the scope to the run's cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }
}

impl fmt::Debug for RunScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunScope")
            .field("run_id", &self.run_id)
            .field("next_sequence", &self.next_sequence)
            .field("assets", &self.assets.keys().collect::<Vec<_>>())
            .field("assignments", &self.assignments)
            .finish_non_exhaustive()
    }
}

/// Handle passed explicitly to every step body.
#[derive(Debug, Clone)]
pub struct CallContext {
    scope: Arc<RunScope>,
    current_call: Option<CallId>,
}

impl CallContext {
    /// Creates the root context of a run (no current call).
    #[must_use]
    pub fn new(scope: RunScope) -> Self {
        Self {
            scope: Arc::new(scope),
            current_call: None,
        }
    }

    /// Returns the run this context belongs to.
    #[must_use]
    pub fn run_id(&self) -> RunId {
        self.scope.run_id
    }

    /// Returns the call that is active in this context.
    #[must_use]
    pub const fn current_call(&self) -> Option<CallId> {
        self.current_call
    }

    /// Returns the run's shared state.
    #[must_use]
    pub fn state(&self) -> &SharedState {
        &self.scope.state
    }

    /// Returns the persistence handle.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.scope.store
    }

    /// Returns the run's cancellation token.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.scope.cancellation
    }

    /// Returns the next sequence number and advances the shared counter.
    pub fn next_sequence(&self) -> u64 {
        self.scope.next_sequence.fetch_add(1, Ordering::SeqCst)
    }

    /// Returns the last sequence number handed out (0 before the first).
    #[must_use]
    pub fn last_sequence(&self) -> u64 {
        self.scope.next_sequence.load(Ordering::SeqCst).saturating_sub(1)
    }

    /// Returns a context whose current call is `parent`.
    ///
    /// Everything else, including the sequence counter, is shared.
    #[must_use]
    pub fn fork_for_nested_call(&self, parent: CallId) -> Self {
        Self {
            scope: Arc::clone(&self.scope),
            current_call: Some(parent),
        }
    }

    /// Invokes a nested step as a child of the current call.
    ///
    /// # Errors
    ///
    /// Propagates the nested step's error, including cancellation.
    pub async fn call(&self, step: &StepKey, args: Value) -> Result<Value> {
        self.scope.invoker.invoke(self, step, args).await
    }

    /// Invokes a nested step from a blocking step body.
    ///
    /// Must be called from a thread spawned with `spawn_blocking`; blocks the
    /// calling thread until the nested call finishes.
    ///
    /// # Errors
    ///
    /// Returns an error if no runtime is reachable, or propagates the nested
    /// step's error.
    pub fn call_blocking(&self, step: &StepKey, args: Value) -> Result<Value> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::step_failure(format!("no runtime for nested call: {e}")))?;
        handle.block_on(self.call(step, args))
    }

    /// Returns a reserved asset by name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AssetNotFound`] unless the run reserved the asset.
    pub fn asset(&self, name: &str) -> Result<Arc<dyn LiveAsset>> {
        self.scope
            .assets
            .get(name)
            .cloned()
            .ok_or_else(|| Error::AssetNotFound {
                name: name.to_string(),
            })
    }

    /// Returns the asset assigned to an asset parameter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AssetNotFound`] if the parameter was not assigned.
    pub fn assigned_asset(&self, param: &str) -> Result<Arc<dyn LiveAsset>> {
        let name = self
            .scope
            .assignments
            .get(param)
            .ok_or_else(|| Error::AssetNotFound {
                name: param.to_string(),
            })?;
        self.asset(name)
    }

    /// Returns the gate serializing control handling across the run's call
    /// boundaries.
    pub(crate) fn control_gate(&self) -> &Mutex<()> {
        &self.scope.control_gate
    }

    /// Records a failed audit write and returns the run's consecutive count.
    pub(crate) fn note_audit_failure(&self) -> u32 {
        self.scope.audit_failures.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Resets the consecutive audit failure count.
    pub(crate) fn note_audit_success(&self) {
        self.scope.audit_failures.store(0, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use serde_json::json;

    use super::*;
    use crate::store::memory::InMemoryStore;

    struct EchoInvoker;

    #[async_trait]
    impl StepInvoker for EchoInvoker {
        async fn invoke(&self, ctx: &CallContext, step: &StepKey, args: Value) -> Result<Value> {
            Ok(json!({
                "step": step.to_string(),
                "parent": ctx.current_call().map(|c| c.to_string()),
                "args": args,
            }))
        }
    }

    fn context() -> CallContext {
        CallContext::new(RunScope::new(
            RunId::generate(),
            Arc::new(InMemoryStore::new()),
            Arc::new(EchoInvoker),
        ))
    }

    #[test]
    fn sequence_starts_at_one_and_is_shared_with_forks() {
        let root = context();
        assert_eq!(root.last_sequence(), 0);
        assert_eq!(root.next_sequence(), 1);

        let child = root.fork_for_nested_call(CallId::generate());
        assert_eq!(child.next_sequence(), 2);
        let grandchild = child.fork_for_nested_call(CallId::generate());
        assert_eq!(grandchild.next_sequence(), 3);
        assert_eq!(root.next_sequence(), 4);
        assert_eq!(root.last_sequence(), 4);
    }

    #[test]
    fn fork_only_changes_current_call() {
        let root = context();
        let parent = CallId::generate();
        let child = root.fork_for_nested_call(parent);
        assert_eq!(root.current_call(), None);
        assert_eq!(child.current_call(), Some(parent));
        assert_eq!(child.run_id(), root.run_id());
    }

    #[test]
    fn resumed_scope_continues_numbering() {
        let ctx = CallContext::new(
            RunScope::new(
                RunId::generate(),
                Arc::new(InMemoryStore::new()),
                Arc::new(EchoInvoker),
            )
            .with_last_sequence(41),
        );
        assert_eq!(ctx.next_sequence(), 42);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_allocation_is_unique() {
        let root = context();
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let ctx = root.fork_for_nested_call(CallId::generate());
            tasks.push(tokio::spawn(async move {
                (0..100).map(|_| ctx.next_sequence()).collect::<Vec<_>>()
            }));
        }
        let mut seen = HashSet::new();
        for task in tasks {
            let values = task.await.expect("join");
            assert!(values.windows(2).all(|w| w[0] < w[1]));
            for v in values {
                assert!(seen.insert(v), "duplicate sequence {v}");
            }
        }
        assert_eq!(seen.len(), 800);
    }

    #[tokio::test]
    async fn nested_call_goes_through_invoker() -> Result<()> {
        let root = context();
        let parent = CallId::generate();
        let out = root
            .fork_for_nested_call(parent)
            .call(&StepKey::new("mix", "1"), json!({ "rpm": 300 }))
            .await?;
        assert_eq!(out["step"], "mix@1");
        assert_eq!(out["parent"], parent.to_string());
        Ok(())
    }

    #[tokio::test]
    async fn control_gate_is_shared_by_forks() {
        let root = context();
        let child = root.fork_for_nested_call(CallId::generate());
        let held = root.control_gate().lock().await;
        assert!(child.control_gate().try_lock().is_err());
        drop(held);
        assert!(child.control_gate().try_lock().is_ok());
    }

    #[test]
    fn shared_state_is_visible_across_forks() -> Result<()> {
        let root = context();
        let child = root.fork_for_nested_call(CallId::generate());
        child.state().set("plate", json!("A1"))?;
        assert_eq!(root.state().get("plate")?, Some(json!("A1")));
        root.state().update(|s| s.remove("plate"))?;
        assert!(child.state().snapshot()?.is_empty());
        Ok(())
    }

    #[test]
    fn unreserved_assets_are_not_reachable() {
        let ctx = context();
        assert!(matches!(
            ctx.asset("pipette-1"),
            Err(Error::AssetNotFound { .. })
        ));
        assert!(ctx.assigned_asset("pipette").is_err());
    }
}

use crate::cycles;
use crate::functions::{BuildFunction, FunctionRegistry, Step};
use crate::store::{GraphStore, NodePlan};
use anvil_core::{AnvilError, EngineConfig, Key, Result, Value, Version};
use dashmap::DashMap;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

type NodeOutcome = std::result::Result<Value, AnvilError>;
type NodeFuture = Shared<BoxFuture<'static, NodeOutcome>>;

#[derive(Debug, Clone, Copy)]
pub struct EvalOptions {
    pub workers: usize,
    pub keep_going: bool,
    pub restart_budget: u32,
}

impl Default for EvalOptions {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            keep_going: false,
            restart_budget: 20,
        }
    }
}

impl From<&EngineConfig> for EvalOptions {
    fn from(c: &EngineConfig) -> Self {
        Self {
            workers: c.workers.max(1),
            keep_going: c.keep_going,
            restart_budget: c.restart_budget,
        }
    }
}

/// Per-build evaluation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvalStats {
    /// Function invocations, including restarts.
    pub functions_invoked: u64,
    /// Nodes served from a value already confirmed this build.
    pub nodes_reused: u64,
    /// Nodes confirmed fresh by dep-checking alone, without recomputation.
    pub nodes_pruned: u64,
    /// Missing-dep restarts.
    pub restarts: u64,
}

#[derive(Default)]
struct StatsInner {
    invoked: AtomicU64,
    reused: AtomicU64,
    pruned: AtomicU64,
    restarts: AtomicU64,
}

impl StatsInner {
    fn snapshot(&self) -> EvalStats {
        EvalStats {
            functions_invoked: self.invoked.load(Ordering::Relaxed),
            nodes_reused: self.reused.load(Ordering::Relaxed),
            nodes_pruned: self.pruned.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
        }
    }
}

/// The outcome of evaluating a set of top-level keys.
#[derive(Debug, Default)]
pub struct EvalResult {
    pub values: FxHashMap<Key, Value>,
    pub errors: Vec<(Key, AnvilError)>,
    pub stats: EvalStats,
    pub cancelled: bool,
}

impl EvalResult {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty() && !self.cancelled
    }

    pub fn first_error(&self) -> Option<&AnvilError> {
        self.errors.first().map(|(_, e)| e)
    }
}

struct EvalShared {
    store: Arc<GraphStore>,
    registry: Arc<FunctionRegistry>,
    permits: Semaphore,
    in_flight: DashMap<Key, NodeFuture>,
    /// Dependency requests of currently blocked nodes; every node records
    /// its edges here before awaiting deps, which is what makes cycles
    /// visible to whichever participant closes the ring last.
    pending: Mutex<FxHashMap<Key, Vec<Key>>>,
    cancel: CancellationToken,
    keep_going: bool,
    restart_budget: u32,
    version: Version,
    stats: StatsInner,
}

/// The handle a function uses to read its dependencies. Every request is
/// recorded in order; an unavailable dependency obliges the function to
/// finish the invocation with `Step::NeedsDeps`.
pub struct EvalEnv {
    shared: Arc<EvalShared>,
    requested: Mutex<Vec<Key>>,
    missing: Mutex<Vec<Key>>,
}

impl EvalEnv {
    fn new(shared: Arc<EvalShared>) -> Self {
        Self {
            shared,
            requested: Mutex::new(Vec::new()),
            missing: Mutex::new(Vec::new()),
        }
    }

    fn record(&self, key: &Key) {
        let mut requested = self.requested.lock();
        if !requested.contains(key) {
            requested.push(key.clone());
        }
    }

    fn record_missing(&self, key: &Key) {
        let mut missing = self.missing.lock();
        if !missing.contains(key) {
            missing.push(key.clone());
        }
    }

    /// The dep's value if it is ready at the current version, else `None`
    /// (and the request is remembered for the restart).
    pub fn get(&self, key: &Key) -> Option<Value> {
        self.record(key);
        match self.shared.store.value_if_fresh(key, self.shared.version) {
            Some(v) => Some(v),
            None => {
                self.record_missing(key);
                None
            }
        }
    }

    /// Like `get`, but a dependency that failed at the current version
    /// surfaces its typed error instead of `None`.
    pub fn get_or_err(&self, key: &Key) -> Result<Option<Value>> {
        self.record(key);
        if let Some(e) = self.shared.store.error_if_fresh(key, self.shared.version) {
            return Err(AnvilError::dep_failed(key, e));
        }
        match self.shared.store.value_if_fresh(key, self.shared.version) {
            Some(v) => Ok(Some(v)),
            None => {
                self.record_missing(key);
                Ok(None)
            }
        }
    }

    /// Batched variant; result order mirrors the argument order.
    pub fn get_batch(&self, keys: &[Key]) -> Vec<Option<Value>> {
        keys.iter().map(|k| self.get(k)).collect()
    }

    /// Keys requested by this invocation, in request order.
    pub fn requested(&self) -> Vec<Key> {
        self.requested.lock().clone()
    }

    /// The unavailable subset of the requested keys.
    pub fn missing_deps(&self) -> Vec<Key> {
        self.missing.lock().clone()
    }

    pub fn version(&self) -> Version {
        self.shared.version
    }

    /// The key's value from a previous evaluation, whatever its freshness.
    /// Not recorded as a dependency; used by functions that seed this run
    /// from last run's result (e.g. previously discovered inputs).
    pub fn previous_value(&self, key: &Key) -> Option<Value> {
        self.shared.store.value(key)
    }

    pub fn cancelled(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Rewind support: invalidate the listed nodes in place and drop their
    /// memoized evaluations so the next request re-runs them at the current
    /// version.
    pub fn restart_nodes(&self, keys: &[Key]) {
        self.shared.store.invalidate(keys);
        for key in keys {
            self.shared.in_flight.remove(key);
        }
    }
}

/// Removes a node's pending-edge record when its evaluation leaves scope.
struct PendingGuard {
    shared: Arc<EvalShared>,
    key: Key,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.shared.pending.lock().remove(&self.key);
    }
}

/// Parallel memoizing evaluator for one build. Single-flight per key via
/// shared futures; CPU-side concurrency bounded by a semaphore sized to the
/// worker count. Construct after `GraphStore::begin_build`.
pub struct Evaluator {
    shared: Arc<EvalShared>,
}

impl Evaluator {
    pub fn new(
        store: Arc<GraphStore>,
        registry: Arc<FunctionRegistry>,
        options: EvalOptions,
    ) -> Self {
        Self::with_cancellation(store, registry, options, CancellationToken::new())
    }

    /// Construct with an externally owned cancellation token, so collaborators
    /// (e.g. the action executor) can share the same build-wide flag.
    pub fn with_cancellation(
        store: Arc<GraphStore>,
        registry: Arc<FunctionRegistry>,
        options: EvalOptions,
        cancel: CancellationToken,
    ) -> Self {
        let version = store.current_version();
        Evaluator {
            shared: Arc::new(EvalShared {
                store,
                registry,
                permits: Semaphore::new(options.workers.max(1)),
                in_flight: DashMap::new(),
                pending: Mutex::new(FxHashMap::default()),
                cancel,
                keep_going: options.keep_going,
                restart_budget: options.restart_budget,
                version,
                stats: StatsInner::default(),
            }),
        }
    }

    pub fn version(&self) -> Version {
        self.shared.version
    }

    /// Cooperative cancellation: in-flight function invocations finish,
    /// nothing new starts, and `evaluate` returns a partial result.
    pub fn cancel(&self) {
        self.shared.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    pub fn stats(&self) -> EvalStats {
        self.shared.stats.snapshot()
    }

    /// Drop memoized evaluations for `keys` (rewind support).
    pub fn forget(&self, keys: &[Key]) {
        for key in keys {
            self.shared.in_flight.remove(key);
        }
    }

    /// Bring the requested keys up to date and return their values or
    /// errors. Sibling behavior under failure follows `keep_going`.
    pub async fn evaluate(&self, roots: &[Key]) -> EvalResult {
        let root_futures: Vec<NodeFuture> =
            roots.iter().map(|k| ensure(&self.shared, k)).collect();
        let outcomes = futures::future::join_all(root_futures).await;

        let mut result = EvalResult {
            stats: self.shared.stats.snapshot(),
            cancelled: self.shared.cancel.is_cancelled(),
            ..Default::default()
        };
        for (key, outcome) in roots.iter().zip(outcomes) {
            match outcome {
                Ok(value) => {
                    result.values.insert(key.clone(), value);
                }
                Err(AnvilError::Cancelled) => {}
                Err(e) => result.errors.push((key.clone(), e)),
            }
        }
        debug!(
            roots = roots.len(),
            ok = result.values.len(),
            errors = result.errors.len(),
            cancelled = result.cancelled,
            "evaluation finished"
        );
        result
    }
}

fn ensure(shared: &Arc<EvalShared>, key: &Key) -> NodeFuture {
    if let Some(existing) = shared.in_flight.get(key) {
        return existing.clone();
    }
    shared
        .in_flight
        .entry(key.clone())
        .or_insert_with(|| {
            let shared = Arc::clone(shared);
            let key = key.clone();
            async move { eval_node(shared, key).await }.boxed().shared()
        })
        .clone()
}

async fn eval_node(shared: Arc<EvalShared>, key: Key) -> NodeOutcome {
    if shared.cancel.is_cancelled() {
        return Err(AnvilError::Cancelled);
    }
    let function = shared
        .registry
        .get(key.function())
        .ok_or_else(|| AnvilError::Internal(format!("no function registered for {}", key.function())))?;
    let hermetic = function.hermetic();

    match shared.store.plan_for(&key, shared.version, hermetic) {
        NodePlan::Fresh(value) => {
            shared.stats.reused.fetch_add(1, Ordering::Relaxed);
            return Ok(value);
        }
        NodePlan::FreshError(e) => return Err(e),
        NodePlan::Remembered(e) => {
            shared.stats.reused.fetch_add(1, Ordering::Relaxed);
            shared.store.refresh_error(&key, shared.version);
            return Err(e);
        }
        NodePlan::CheckDeps {
            value,
            deps,
            computed_at,
        } => {
            match check_deps(&shared, &key, &deps, computed_at).await? {
                DepCheck::Unchanged => {
                    shared.store.mark_clean(&key, shared.version);
                    shared.stats.pruned.fetch_add(1, Ordering::Relaxed);
                    trace!(%key, "deps unchanged; version bumped without recomputation");
                    return Ok(value);
                }
                DepCheck::Changed => {}
            }
        }
        NodePlan::Rebuild => {}
    }

    run_function(shared, key, function, hermetic).await
}

enum DepCheck {
    Unchanged,
    Changed,
}

/// Whether this failure drains the pool. User and transient errors respect
/// `keep_going`; internal and catastrophic failures always abort.
fn should_cancel(shared: &EvalShared, error: &AnvilError) -> bool {
    match error.category() {
        anvil_core::ErrorCategory::Internal | anvil_core::ErrorCategory::Catastrophe => true,
        _ => !shared.keep_going,
    }
}

/// Re-evaluate the recorded deps of a `CheckDeps` node, in consumption
/// order, and report whether any value actually changed since the node was
/// computed.
async fn check_deps(
    shared: &Arc<EvalShared>,
    key: &Key,
    deps: &[Key],
    computed_at: Version,
) -> std::result::Result<DepCheck, AnvilError> {
    if deps.is_empty() {
        return Ok(DepCheck::Unchanged);
    }
    let _guard = register_pending(shared, key, deps.to_vec())?;

    let mut changed = false;
    for dep in deps {
        match ensure(shared, dep).await {
            Ok(_) => {
                if shared.store.changed_at(dep) > Some(computed_at) {
                    changed = true;
                }
            }
            Err(AnvilError::Cancelled) => return Err(AnvilError::Cancelled),
            Err(e) => {
                let wrapped = AnvilError::dep_failed(dep, e);
                shared
                    .store
                    .write_error(key, wrapped.clone(), deps.to_vec(), shared.version);
                if should_cancel(shared, &wrapped) {
                    shared.cancel.cancel();
                }
                return Err(wrapped);
            }
        }
    }
    Ok(if changed { DepCheck::Changed } else { DepCheck::Unchanged })
}

/// Record the node's outgoing dependency requests and scan for a ring they
/// would close. Registration and scan happen under one lock so concurrent
/// registrants cannot both miss a cycle they jointly create.
fn register_pending(
    shared: &Arc<EvalShared>,
    key: &Key,
    requested: Vec<Key>,
) -> std::result::Result<PendingGuard, AnvilError> {
    let ring = {
        let mut pending = shared.pending.lock();
        pending.insert(key.clone(), requested.clone());
        cycles::find_ring(key, &requested, &pending)
    };
    let guard = PendingGuard {
        shared: Arc::clone(shared),
        key: key.clone(),
    };
    if let Some(ring) = ring {
        let error = AnvilError::Cycle {
            ring: cycles::render_ring(&ring),
        };
        warn!(%key, "dependency cycle detected");
        shared
            .store
            .write_error(key, error.clone(), Vec::new(), shared.version);
        if should_cancel(shared, &error) {
            shared.cancel.cancel();
        }
        return Err(error);
    }
    Ok(guard)
}

async fn run_function(
    shared: Arc<EvalShared>,
    key: Key,
    function: Arc<dyn BuildFunction>,
    hermetic: bool,
) -> NodeOutcome {
    let mut restarts: u32 = 0;
    loop {
        if shared.cancel.is_cancelled() {
            return Err(AnvilError::Cancelled);
        }

        let env = EvalEnv::new(Arc::clone(&shared));
        let step = {
            let _permit = shared
                .permits
                .acquire()
                .await
                .map_err(|_| AnvilError::Cancelled)?;
            shared.stats.invoked.fetch_add(1, Ordering::Relaxed);
            function.compute(&key, &env).await
        };
        let requested = env.requested();

        match step {
            Ok(Step::Done(value)) => {
                let changed =
                    shared
                        .store
                        .write_value(&key, value.clone(), requested, shared.version, hermetic);
                trace!(%key, changed, "node computed");
                return Ok(value);
            }
            Ok(Step::NeedsDeps(missing)) => {
                restarts += 1;
                shared.stats.restarts.fetch_add(1, Ordering::Relaxed);
                if restarts > shared.restart_budget {
                    let error = AnvilError::RestartBudgetExceeded {
                        key: key.to_string(),
                        restarts,
                    };
                    shared
                        .store
                        .write_error(&key, error.clone(), requested, shared.version);
                    return Err(error);
                }
                if missing.is_empty() {
                    let error = AnvilError::Internal(format!(
                        "{key}: function signalled missing deps but requested none"
                    ));
                    shared
                        .store
                        .write_error(&key, error.clone(), requested, shared.version);
                    return Err(error);
                }

                let _guard = register_pending(&shared, &key, requested.clone())?;
                let dep_futures: Vec<NodeFuture> =
                    missing.iter().map(|d| ensure(&shared, d)).collect();
                let outcomes = futures::future::join_all(dep_futures).await;

                let mut first_error: Option<(Key, AnvilError)> = None;
                let mut saw_cancelled = false;
                for (dep, outcome) in missing.iter().zip(outcomes) {
                    match outcome {
                        Ok(_) => {}
                        Err(AnvilError::Cancelled) => saw_cancelled = true,
                        Err(e) => {
                            if first_error.is_none() {
                                first_error = Some((dep.clone(), e));
                            }
                        }
                    }
                }
                if let Some((dep, cause)) = first_error {
                    let wrapped = AnvilError::dep_failed(&dep, cause);
                    shared
                        .store
                        .write_error(&key, wrapped.clone(), requested, shared.version);
                    if should_cancel(&shared, &wrapped) {
                        shared.cancel.cancel();
                    }
                    return Err(wrapped);
                }
                if saw_cancelled {
                    return Err(AnvilError::Cancelled);
                }
                // All deps ready: re-invoke.
            }
            Err(e) => {
                shared
                    .store
                    .write_error(&key, e.clone(), requested, shared.version);
                if should_cancel(&shared, &e) {
                    shared.cancel.cancel();
                }
                return Err(e);
            }
        }
    }
}

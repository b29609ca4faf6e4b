use crate::critical_path::CriticalPathTracker;
use crate::executor::{ActionExecutor, ExecStats};
use crate::functions::{
    ActionExecutionFunction, ArtifactFunction, EnvVarFunction, FileStateFunction, TopLevelFunction,
};
use crate::registry::ActionRegistry;
use crate::rewind::RewindPlanner;
use anvil_cache::{ActionCache, CacheStats, OutputStore};
use anvil_core::{
    crash_reports_enabled, BuildEvent, CoreContext, CriticalPathEntry, ErrorCategory, Key, Result,
};
use anvil_graph::{
    load_or_cold, EvalOptions, EvalResult, Evaluator, FunctionRegistry, GraphSnapshot, GraphStore,
};
use std::io::Write;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Everything a finished build reports back.
#[derive(Debug)]
pub struct BuildOutcome {
    pub result: EvalResult,
    pub critical_path: Vec<CriticalPathEntry>,
    pub cache_stats: CacheStats,
    pub exec_stats: ExecStats,
}

impl BuildOutcome {
    pub fn success(&self) -> bool {
        self.result.is_success()
    }
}

/// One engine instance across builds: the persistent graph store, the
/// action cache, the output store and the action registry, threaded through
/// an explicit context. Each `build` call creates the per-build ephemeral
/// state (evaluator, executor, tracker, planner) and tears it down on every
/// exit path.
pub struct BuildSession {
    ctx: CoreContext,
    store: Arc<GraphStore>,
    actions: Arc<ActionRegistry>,
    cache: Arc<ActionCache>,
    blobs: Arc<OutputStore>,
}

impl BuildSession {
    pub fn new(ctx: CoreContext) -> Result<Self> {
        let config = &ctx.config;
        std::fs::create_dir_all(&config.output_base)?;
        std::fs::create_dir_all(config.exec_root())?;
        let store = load_or_cold(&config.graph_snapshot_file());
        let cache = Arc::new(ActionCache::open(&config.action_cache_file())?);
        let blobs = Arc::new(OutputStore::new(config.action_outputs_dir()));
        Ok(BuildSession {
            ctx,
            store,
            actions: Arc::new(ActionRegistry::new()),
            cache,
            blobs,
        })
    }

    pub fn actions(&self) -> &Arc<ActionRegistry> {
        &self.actions
    }

    pub fn store(&self) -> &Arc<GraphStore> {
        &self.store
    }

    pub fn context(&self) -> &CoreContext {
        &self.ctx
    }

    /// Bring the named targets up to date.
    pub async fn build(&self, targets: &[&str]) -> BuildOutcome {
        let config = Arc::clone(&self.ctx.config);
        let bus = Arc::clone(&self.ctx.bus);
        let version = self.store.begin_build();
        info!(%version, targets = ?targets, "build starting");

        // Per-build ephemeral state.
        let cancel = CancellationToken::new();
        let tracker = Arc::new(CriticalPathTracker::new());
        let executor = ActionExecutor::new(
            Arc::clone(&self.actions),
            Arc::clone(&self.cache),
            Arc::clone(&self.blobs),
            Arc::clone(&bus),
            Arc::clone(&tracker),
            config.exec_root(),
            config.dir_lock_stripes,
            config.sigterm_grace(),
            cancel.clone(),
        );
        let planner = Arc::new(RewindPlanner::new(
            Arc::clone(&self.actions),
            config.rewind_log_file(),
            config.rewind_budget,
        ));

        let mut functions = FunctionRegistry::new();
        functions.register(Arc::new(FileStateFunction::new(config.exec_root())));
        functions.register(Arc::new(EnvVarFunction));
        functions.register(Arc::new(ArtifactFunction::new(Arc::clone(&self.actions))));
        functions.register(Arc::new(ActionExecutionFunction::new(
            Arc::clone(&self.actions),
            Arc::clone(&executor),
            planner,
        )));
        functions.register(Arc::new(TopLevelFunction::new(Arc::clone(&self.actions))));

        let evaluator = Evaluator::with_cancellation(
            Arc::clone(&self.store),
            Arc::new(functions),
            EvalOptions::from(config.as_ref()),
            cancel.clone(),
        );

        let roots: Vec<Key> = targets.iter().map(|t| Key::top_level(*t)).collect();
        let result = evaluator.evaluate(&roots).await;

        // Teardown runs on every path from here down; nothing below returns
        // early.
        executor.finish_build();
        let critical_path = tracker.critical_path();
        if !critical_path.is_empty() {
            bus.post(BuildEvent::CriticalPath {
                components: critical_path.clone(),
            });
        }
        for (key, err) in &result.errors {
            match err.root_cause().category() {
                ErrorCategory::Catastrophe => {
                    bus.post(BuildEvent::Catastrophe {
                        message: err.to_string(),
                    });
                }
                ErrorCategory::Internal => self.report_crash(key, err),
                _ => {}
            }
        }
        if let Err(e) = GraphSnapshot::capture(&self.store).save(&config.graph_snapshot_file()) {
            warn!(error = %e, "failed to persist graph snapshot");
        }

        let outcome = BuildOutcome {
            critical_path,
            cache_stats: self.cache.stats(),
            exec_stats: executor.stats(),
            result,
        };
        info!(
            ok = outcome.result.values.len(),
            errors = outcome.result.errors.len(),
            invoked = outcome.result.stats.functions_invoked,
            pruned = outcome.result.stats.nodes_pruned,
            cache_hits = outcome.cache_stats.hits,
            spawned = outcome.exec_stats.spawned,
            "build finished"
        );
        outcome
    }

    /// Internal errors leave a bug report next to the output base, unless
    /// running under a test runner.
    fn report_crash(&self, key: &Key, err: &anvil_core::AnvilError) {
        error!(%key, error = %err, "internal error");
        if !crash_reports_enabled() {
            return;
        }
        let path = self.ctx.config.output_base.join("crash_report.txt");
        if let Ok(mut f) = std::fs::File::create(&path) {
            let _ = writeln!(f, "build id: {}", self.ctx.build_id);
            let _ = writeln!(f, "engine started: {}", self.ctx.started_at);
            let _ = writeln!(f, "key: {key}");
            let _ = writeln!(f, "error: {err}");
        }
    }
}

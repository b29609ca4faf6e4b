use crate::executor::ActionExecutor;
use crate::registry::ActionRegistry;
use crate::rewind::RewindPlanner;
use anvil_core::{
    ActionResultValue, AnvilError, ArtifactValue, ExecPath, FunctionName, Key, KeyArg, Result,
    Value,
};
use anvil_graph::{BuildFunction, EvalEnv, Step};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

/// Filesystem state of one file under the execution root. Non-hermetic:
/// re-reads the disk once per build, which is what lets content changes
/// flow into the graph without explicit invalidation.
pub struct FileStateFunction {
    root: PathBuf,
}

impl FileStateFunction {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl BuildFunction for FileStateFunction {
    fn name(&self) -> FunctionName {
        FunctionName::FileState
    }

    fn hermetic(&self) -> bool {
        false
    }

    async fn compute(&self, key: &Key, _env: &EvalEnv) -> Result<Step> {
        let KeyArg::FileState(path) = key.arg() else {
            return Err(AnvilError::Internal(format!("bad FileState arg in {key}")));
        };
        let full = if path.is_absolute() {
            path.clone()
        } else {
            self.root.join(path)
        };
        let value = match std::fs::metadata(&full) {
            Ok(meta) if meta.is_file() => {
                let mtime_nanos = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
                    .map(|d| d.as_nanos() as u64)
                    .unwrap_or(0);
                anvil_core::FileStateValue {
                    digest: anvil_core::Digest::of_file(&full)?,
                    size: meta.len(),
                    mtime_nanos,
                    exists: true,
                }
            }
            _ => anvil_core::FileStateValue::missing(),
        };
        Ok(Step::Done(Value::FileState(value)))
    }
}

/// An environment variable registered as a dependency by the caller.
/// Non-hermetic by definition.
pub struct EnvVarFunction;

#[async_trait]
impl BuildFunction for EnvVarFunction {
    fn name(&self) -> FunctionName {
        FunctionName::EnvVar
    }

    fn hermetic(&self) -> bool {
        false
    }

    async fn compute(&self, key: &Key, _env: &EvalEnv) -> Result<Step> {
        let KeyArg::EnvVar(name) = key.arg() else {
            return Err(AnvilError::Internal(format!("bad EnvVar arg in {key}")));
        };
        Ok(Step::Done(Value::EnvVar(std::env::var(name).ok())))
    }
}

/// Content digest of one artifact: a source file's state, or the projection
/// of the generating action's result onto this output.
pub struct ArtifactFunction {
    registry: Arc<ActionRegistry>,
}

impl ArtifactFunction {
    pub fn new(registry: Arc<ActionRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl BuildFunction for ArtifactFunction {
    fn name(&self) -> FunctionName {
        FunctionName::Artifact
    }

    async fn compute(&self, key: &Key, env: &EvalEnv) -> Result<Step> {
        let KeyArg::Artifact(path) = key.arg() else {
            return Err(AnvilError::Internal(format!("bad Artifact arg in {key}")));
        };

        if let Some(action) = self.registry.generating_action(path) {
            let dep = action.execution_key();
            return match env.get_or_err(&dep)? {
                Some(Value::ActionResult(result)) => match result.outputs.get(path) {
                    Some(value) => Ok(Step::Done(Value::Artifact(*value))),
                    None => Err(AnvilError::Internal(format!(
                        "{} did not produce declared output {path}",
                        action.action_ref()
                    ))),
                },
                Some(other) => Err(AnvilError::Internal(format!(
                    "unexpected value for {dep}: {other:?}"
                ))),
                None => Ok(Step::NeedsDeps(env.missing_deps())),
            };
        }

        // No generator: a source artifact, read from disk.
        let dep = Key::file_state(path.as_str());
        match env.get(&dep) {
            Some(Value::FileState(fs)) => {
                if !fs.exists {
                    return Err(AnvilError::SourceFileMissing { path: path.clone() });
                }
                Ok(Step::Done(Value::Artifact(ArtifactValue {
                    digest: fs.digest,
                    size: fs.size,
                    mtime_nanos: fs.mtime_nanos,
                })))
            }
            Some(other) => Err(AnvilError::Internal(format!(
                "unexpected value for {dep}: {other:?}"
            ))),
            None => Ok(Step::NeedsDeps(env.missing_deps())),
        }
    }
}

/// Executes one action through the executor, with its declared inputs
/// resolved through artifact dependencies. Lost-input failures consult the
/// rewind planner, apply the plan, and restart.
pub struct ActionExecutionFunction {
    registry: Arc<ActionRegistry>,
    executor: Arc<ActionExecutor>,
    planner: Arc<RewindPlanner>,
}

impl ActionExecutionFunction {
    pub fn new(
        registry: Arc<ActionRegistry>,
        executor: Arc<ActionExecutor>,
        planner: Arc<RewindPlanner>,
    ) -> Self {
        Self {
            registry,
            executor,
            planner,
        }
    }
}

#[async_trait]
impl BuildFunction for ActionExecutionFunction {
    fn name(&self) -> FunctionName {
        FunctionName::ActionExecution
    }

    async fn compute(&self, key: &Key, env: &EvalEnv) -> Result<Step> {
        let KeyArg::ActionExecution { owner, index } = key.arg() else {
            return Err(AnvilError::Internal(format!("bad ActionExecution arg in {key}")));
        };
        let action = self
            .registry
            .action(owner, *index)
            .ok_or_else(|| AnvilError::Internal(format!("unknown action {key}")))?;

        // Declared inputs, plus whatever last run discovered: both feed the
        // request fingerprint, so a changed header misses the cache even
        // though it was never declared.
        let mut wanted: Vec<ExecPath> = action.inputs.clone();
        if action.discovers_inputs {
            if let Some(Value::ActionResult(prev)) = env.previous_value(key) {
                for path in &prev.discovered_inputs {
                    if !wanted.contains(path) {
                        wanted.push(path.clone());
                    }
                }
            }
        }

        let mut inputs = BTreeMap::new();
        for path in &wanted {
            match env.get_or_err(&Key::artifact(path.clone()))? {
                Some(Value::Artifact(v)) => {
                    inputs.insert(path.clone(), v.digest);
                }
                Some(other) => {
                    return Err(AnvilError::Internal(format!(
                        "unexpected value for input {path}: {other:?}"
                    )))
                }
                None => {}
            }
        }
        if inputs.len() < wanted.len() {
            return Ok(Step::NeedsDeps(env.missing_deps()));
        }

        loop {
            match self.executor.execute(Arc::clone(&action), inputs.clone()).await {
                Ok(executed) => {
                    let discovered = if executed.from_cache {
                        wanted[action.inputs.len()..].to_vec()
                    } else {
                        executed.discovered_inputs.clone()
                    };
                    // Freshly discovered inputs become graph dependencies,
                    // so the next build re-checks this node when they
                    // change. Their artifact nodes may not be evaluated
                    // yet; the executor memoizes the finished run across
                    // the restart.
                    let mut missing = false;
                    for path in &discovered {
                        if env.get(&Key::artifact(path.clone())).is_none() {
                            missing = true;
                        }
                    }
                    if missing {
                        return Ok(Step::NeedsDeps(env.missing_deps()));
                    }
                    return Ok(Step::Done(Value::ActionResult(Arc::new(ActionResultValue {
                        outputs: executed.outputs.clone(),
                        discovered_inputs: discovered,
                        from_cache: executed.from_cache,
                        elapsed_nanos: executed.elapsed.as_nanos() as u64,
                    }))));
                }
                Err(AnvilError::LostInputs { lost, .. }) => {
                    // May fail with LostSourceInput or RewindExhausted,
                    // which end the rewind attempts for good.
                    let plan = self.planner.plan(&action, &lost)?;
                    env.restart_nodes(&plan.nodes_to_restart);
                    self.executor.forget_actions(&plan.actions_to_rerun);
                    if plan.self_only {
                        // The lost files are regenerated by this action's
                        // own sub-spawns; re-execute immediately.
                        continue;
                    }
                    let upstream: Vec<Key> = plan
                        .nodes_to_restart
                        .iter()
                        .filter(|k| k.is_artifact())
                        .cloned()
                        .collect();
                    return Ok(Step::NeedsDeps(upstream));
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Fans a requested top-level target out to its declared artifacts and
/// collects their digests.
pub struct TopLevelFunction {
    registry: Arc<ActionRegistry>,
}

impl TopLevelFunction {
    pub fn new(registry: Arc<ActionRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl BuildFunction for TopLevelFunction {
    fn name(&self) -> FunctionName {
        FunctionName::TopLevel
    }

    async fn compute(&self, key: &Key, env: &EvalEnv) -> Result<Step> {
        let KeyArg::TopLevel(name) = key.arg() else {
            return Err(AnvilError::Internal(format!("bad TopLevel arg in {key}")));
        };
        let artifacts = self
            .registry
            .target_artifacts(name)
            .ok_or_else(|| AnvilError::TargetNotFound(name.clone()))?;

        let keys: Vec<Key> = artifacts.iter().cloned().map(Key::artifact).collect();
        let mut digests = BTreeMap::new();
        for (path, key) in artifacts.iter().zip(&keys) {
            match env.get_or_err(key)? {
                Some(Value::Artifact(v)) => {
                    digests.insert(path.clone(), v.digest);
                }
                Some(other) => {
                    return Err(AnvilError::Internal(format!(
                        "unexpected value for {key}: {other:?}"
                    )))
                }
                None => {}
            }
        }
        if digests.len() < artifacts.len() {
            return Ok(Step::NeedsDeps(env.missing_deps()));
        }
        Ok(Step::Done(Value::TopLevel(Arc::new(digests))))
    }
}

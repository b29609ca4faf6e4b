use crate::registry::ActionRegistry;
use anvil_core::{Action, AnvilError, ExecPath, Key, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// What to invalidate and re-run after a lost-inputs failure.
#[derive(Debug, Clone, Default)]
pub struct RewindPlan {
    /// Graph keys to invalidate in place at the current build version.
    pub nodes_to_restart: Vec<Key>,
    /// Primary outputs whose in-flight futures the executor must drop.
    pub actions_to_rerun: Vec<ExecPath>,
    /// The lost inputs are regenerated inside the failing action itself
    /// (a sequence of sub-spawns); nothing upstream to restart.
    pub self_only: bool,
}

#[derive(Serialize)]
struct RewindLogLine<'a> {
    action: String,
    lost: Vec<&'a str>,
    plan: Vec<String>,
}

/// Converts lost-input failures into restart plans: identifies the minimal
/// set of upstream generating actions to re-execute, honoring tree
/// artifacts, aggregations one and two levels deep, and insensitively
/// propagating aggregators.
pub struct RewindPlanner {
    registry: Arc<ActionRegistry>,
    log_path: PathBuf,
    log: Mutex<Option<std::fs::File>>,
    /// Rewind attempts per failing action's primary output; per build.
    attempts: DashMap<ExecPath, u32>,
    budget: u32,
}

impl RewindPlanner {
    pub fn new(registry: Arc<ActionRegistry>, log_path: PathBuf, budget: u32) -> Self {
        RewindPlanner {
            registry,
            log_path,
            log: Mutex::new(None),
            attempts: DashMap::new(),
            budget,
        }
    }

    /// Build the plan for `action` failing with `lost` inputs. Source
    /// inputs cannot be regenerated and fail the build; exhausting the
    /// per-action budget promotes to a persistent failure.
    pub fn plan(&self, action: &Action, lost: &[ExecPath]) -> Result<RewindPlan> {
        let primary = action.primary_output.path.clone();
        let attempts = {
            let mut entry = self.attempts.entry(primary).or_insert(0);
            *entry += 1;
            *entry
        };
        if attempts > self.budget {
            warn!(action = %action.action_ref(), attempts, "rewind budget exhausted");
            return Err(AnvilError::RewindExhausted {
                action: action.action_ref(),
                attempts,
            });
        }

        let mut plan = RewindPlan::default();
        let mut seen_actions: FxHashSet<ExecPath> = FxHashSet::default();
        let mut matched_any_dep = false;

        for lost_path in lost {
            let (owning_artifact, generator) = self.resolve_owner(lost_path)?;
            let generator = match generator {
                Some(g) => g,
                None => {
                    return Err(AnvilError::LostSourceInput {
                        action: action.action_ref(),
                        path: lost_path.clone(),
                    });
                }
            };
            if self.dep_containing(action, lost_path).is_some() {
                matched_any_dep = true;
            }
            self.add_generator(&owning_artifact, &generator, &mut plan, &mut seen_actions);
        }

        // No direct dep owns any lost input: the action regenerates them
        // itself between its sub-spawns.
        if !matched_any_dep && !lost.is_empty() {
            plan.self_only = true;
            plan.nodes_to_restart.clear();
            plan.actions_to_rerun = vec![action.primary_output.path.clone()];
        }

        self.append_log(action, lost, &plan);
        info!(
            action = %action.action_ref(),
            restart = plan.nodes_to_restart.len(),
            rerun = plan.actions_to_rerun.len(),
            self_only = plan.self_only,
            "rewind planned"
        );
        Ok(plan)
    }

    /// Resolve the artifact that owns a lost path: the path itself, or the
    /// tree artifact containing it. `None` generator means source artifact.
    fn resolve_owner(&self, lost: &ExecPath) -> Result<(ExecPath, Option<Arc<Action>>)> {
        if let Some(generator) = self.registry.generating_action(lost) {
            return Ok((lost.clone(), Some(generator)));
        }
        if let Some((tree_root, generator)) =
            self.registry.generating_action_of_tree_containing(lost)
        {
            return Ok((tree_root, Some(generator)));
        }
        Ok((lost.clone(), None))
    }

    /// The direct dep of `action` whose subtree contains `lost`: the dep
    /// itself, a tree artifact above it, an aggregation listing it, or an
    /// aggregation listing an aggregation that lists it.
    fn dep_containing(&self, action: &Action, lost: &ExecPath) -> Option<ExecPath> {
        for dep in &action.inputs {
            if dep == lost || dep.is_path_prefix_of(lost) {
                return Some(dep.clone());
            }
            if let Some(agg) = self.registry.aggregation(dep) {
                if agg.contains(lost) {
                    return Some(dep.clone());
                }
                // One aggregation deeper.
                for entry in agg.entries() {
                    if let Some(nested) = self.registry.aggregation(entry) {
                        if nested.contains(lost) {
                            return Some(dep.clone());
                        }
                    }
                }
            }
        }
        None
    }

    fn add_generator(
        &self,
        artifact: &ExecPath,
        generator: &Arc<Action>,
        plan: &mut RewindPlan,
        seen: &mut FxHashSet<ExecPath>,
    ) {
        if !seen.insert(generator.primary_output.path.clone()) {
            return;
        }
        plan.nodes_to_restart.push(Key::artifact(artifact.clone()));
        plan.nodes_to_restart.push(generator.execution_key());
        plan.actions_to_rerun
            .push(generator.primary_output.path.clone());

        // An aggregator that links rather than copies gives no signal about
        // which of its inputs went stale; pull in its whole non-source
        // input closure.
        if generator.insensitive_propagator {
            for input in &generator.inputs {
                if let Some(upstream) = self.registry.generating_action(input) {
                    plan.nodes_to_restart.push(Key::artifact(input.clone()));
                    self.add_generator(input, &upstream, plan, seen);
                }
            }
        }
    }

    fn append_log(&self, action: &Action, lost: &[ExecPath], plan: &RewindPlan) {
        let line = RewindLogLine {
            action: action.action_ref().to_string(),
            lost: lost.iter().map(|p| p.as_str()).collect(),
            plan: plan
                .nodes_to_restart
                .iter()
                .map(|k| k.to_string())
                .collect(),
        };
        let mut guard = self.log.lock();
        if guard.is_none() {
            if let Some(parent) = self.log_path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            *guard = std::fs::OpenOptions::new()
                .append(true)
                .create(true)
                .open(&self.log_path)
                .ok();
        }
        if let (Some(file), Ok(json)) = (guard.as_mut(), serde_json::to_string(&line)) {
            let _ = writeln!(file, "{json}");
        }
    }
}

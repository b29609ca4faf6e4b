use anvil_core::{
    Action, ActionOwner, AggregationValue, AnvilError, ExecPath,
};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

/// A conflict shared by both involved actions; `reported` makes sure the
/// failure surfaces as exactly one event no matter which party the build
/// reaches first.
struct ConflictRecord {
    error: AnvilError,
    reported: AtomicBool,
}

#[derive(Default)]
struct Inner {
    actions: Vec<Arc<Action>>,
    by_execution_key: FxHashMap<(ActionOwner, u32), usize>,
    /// First registrant per output path; for shared actions this is the
    /// canonical producer.
    by_output: FxHashMap<ExecPath, usize>,
    /// All registered output paths, ordered, for prefix scans.
    output_paths: BTreeSet<String>,
    /// Conflicts recorded during registration, surfaced at execution time,
    /// indexed by the actions involved.
    conflicts: FxHashMap<(ActionOwner, u32), Arc<ConflictRecord>>,
    /// Expansions of aggregating (runfiles / middleman) artifacts.
    aggregations: FxHashMap<ExecPath, AggregationValue>,
    /// Top-level target name → requested artifacts.
    targets: FxHashMap<String, Vec<ExecPath>>,
}

/// Registration-time view of the action graph: actions indexed by execution
/// key and by output, output conflicts, aggregation expansions and
/// top-level targets. Populated during analysis, read-only during
/// execution.
#[derive(Default)]
pub struct ActionRegistry {
    inner: RwLock<Inner>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one action. Output conflicts (duplicate outputs between
    /// non-equivalent actions, and exec-path prefix overlaps) are recorded,
    /// not returned: the executor surfaces them as failures before running
    /// either party, regardless of registration order.
    pub fn register(&self, action: Action) -> Arc<Action> {
        let action = Arc::new(action);
        let mut inner = self.inner.write();
        let index = inner.actions.len();

        for output in action.all_outputs() {
            let path = &output.path;
            if let Some(&existing_idx) = inner.by_output.get(path) {
                let existing = Arc::clone(&inner.actions[existing_idx]);
                let equivalent = existing.shareable
                    && action.shareable
                    && *path == action.primary_output.path
                    && *path == existing.primary_output.path
                    && existing.action_key() == action.action_key();
                if !equivalent {
                    let conflict = Arc::new(ConflictRecord {
                        error: AnvilError::DuplicateOutput {
                            path: path.clone(),
                            first: existing.action_ref(),
                            second: action.action_ref(),
                        },
                        reported: AtomicBool::new(false),
                    });
                    warn!(%path, "duplicate output registered");
                    inner
                        .conflicts
                        .insert((existing.owner.clone(), existing.index), Arc::clone(&conflict));
                    inner
                        .conflicts
                        .insert((action.owner.clone(), action.index), conflict);
                }
            }

            // Prefix conflicts, both directions, independent of order:
            // an existing ancestor of `path`, or existing paths under it.
            let ancestor_conflict = path
                .parent()
                .into_iter()
                .flat_map(|p| {
                    // Walk every ancestor of the new path.
                    std::iter::successors(Some(p), |p| p.parent())
                })
                .find(|p| inner.output_paths.contains(p.as_str()));
            let descendant_conflict = {
                let low = format!("{}/", path.as_str());
                let high = format!("{}0", path.as_str()); // '0' sorts just after '/'
                inner
                    .output_paths
                    .range(low..high)
                    .next()
                    .and_then(|s| ExecPath::new(s.as_str()).ok())
            };
            let overlap = ancestor_conflict
                .map(|shorter| (shorter, path.clone()))
                .or_else(|| descendant_conflict.map(|longer| (path.clone(), longer)));
            if let Some((shorter, longer)) = overlap {
                let other_path = if shorter == *path { longer.clone() } else { shorter.clone() };
                if let Some(&other_idx) = inner.by_output.get(&other_path) {
                    let other = Arc::clone(&inner.actions[other_idx]);
                    let conflict = Arc::new(ConflictRecord {
                        error: AnvilError::PrefixConflict {
                            shorter,
                            longer: longer.clone(),
                            first: other.action_ref(),
                            second: action.action_ref(),
                        },
                        reported: AtomicBool::new(false),
                    });
                    warn!(path = %path, other = %other_path, "output prefix conflict registered");
                    inner
                        .conflicts
                        .insert((other.owner.clone(), other.index), Arc::clone(&conflict));
                    inner
                        .conflicts
                        .insert((action.owner.clone(), action.index), conflict);
                }
            }
        }

        for output in action.all_outputs() {
            inner
                .by_output
                .entry(output.path.clone())
                .or_insert(index);
            inner.output_paths.insert(output.path.as_str().to_string());
        }
        inner
            .by_execution_key
            .insert((action.owner.clone(), action.index), index);
        inner.actions.push(Arc::clone(&action));
        action
    }

    pub fn register_aggregation(&self, path: ExecPath, value: AggregationValue) {
        self.inner.write().aggregations.insert(path, value);
    }

    pub fn register_target(&self, name: impl Into<String>, artifacts: Vec<ExecPath>) {
        self.inner.write().targets.insert(name.into(), artifacts);
    }

    pub fn action(&self, owner: &ActionOwner, index: u32) -> Option<Arc<Action>> {
        let inner = self.inner.read();
        inner
            .by_execution_key
            .get(&(owner.clone(), index))
            .map(|&i| Arc::clone(&inner.actions[i]))
    }

    /// The canonical generating action for an artifact path, if any. A path
    /// with no generator is a source artifact.
    pub fn generating_action(&self, path: &ExecPath) -> Option<Arc<Action>> {
        let inner = self.inner.read();
        inner
            .by_output
            .get(path)
            .map(|&i| Arc::clone(&inner.actions[i]))
    }

    /// The generator of a tree artifact containing `path`, when `path`
    /// points inside a declared tree output.
    pub fn generating_action_of_tree_containing(&self, path: &ExecPath) -> Option<(ExecPath, Arc<Action>)> {
        let inner = self.inner.read();
        let mut ancestor = path.parent();
        while let Some(p) = ancestor {
            if let Some(&i) = inner.by_output.get(&p) {
                return Some((p, Arc::clone(&inner.actions[i])));
            }
            ancestor = p.parent();
        }
        None
    }

    pub fn aggregation(&self, path: &ExecPath) -> Option<AggregationValue> {
        self.inner.read().aggregations.get(path).cloned()
    }

    pub fn target_artifacts(&self, name: &str) -> Option<Vec<ExecPath>> {
        self.inner.read().targets.get(name).cloned()
    }

    pub fn conflict_for(&self, action: &Action) -> Option<AnvilError> {
        self.inner
            .read()
            .conflicts
            .get(&(action.owner.clone(), action.index))
            .map(|c| c.error.clone())
    }

    /// True exactly once per conflict, for whichever involved action reaches
    /// execution first; subsequent claims (from either party) are denied.
    pub fn claim_conflict_report(&self, action: &Action) -> bool {
        self.inner
            .read()
            .conflicts
            .get(&(action.owner.clone(), action.index))
            .map(|c| !c.reported.swap(true, Ordering::SeqCst))
            .unwrap_or(false)
    }
}

use crate::node::{DirtyState, Node};
use anvil_core::{AnvilError, Key, Value, Version};
use dashmap::DashMap;
use rustc_hash::FxHashSet;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Counts reported by an invalidation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InvalidationResult {
    /// Nodes marked for unconditional recomputation.
    pub cleared: usize,
    /// Reverse-dependencies marked for dependency re-checking.
    pub dirtied: usize,
}

/// What the evaluator should do with a key at the current version.
#[derive(Debug, Clone)]
pub enum NodePlan {
    /// Value already confirmed at this version.
    Fresh(Value),
    /// Error already recorded at this version.
    FreshError(AnvilError),
    /// Persistent user error remembered from an earlier build.
    Remembered(AnvilError),
    /// Value exists from an earlier build; re-check the recorded deps and
    /// recompute only if one actually changed since `computed_at`.
    CheckDeps {
        value: Value,
        deps: Vec<Key>,
        computed_at: Version,
    },
    /// Run the function.
    Rebuild,
}

/// The concurrent key → node map that survives across builds.
///
/// Synchronization is per entry via the concurrent map; multi-entry updates
/// (reverse-dependency maintenance) touch one entry at a time in key order
/// and never hold two entry guards at once.
pub struct GraphStore {
    nodes: DashMap<Key, Node>,
    version: AtomicU64,
}

impl GraphStore {
    pub fn new() -> Self {
        GraphStore {
            nodes: DashMap::new(),
            version: AtomicU64::new(0),
        }
    }

    pub fn current_version(&self) -> Version {
        Version(self.version.load(Ordering::SeqCst))
    }

    /// Assigns and returns the version for a new build.
    pub fn begin_build(&self) -> Version {
        Version(self.version.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.nodes.contains_key(key)
    }

    /// The version at which the key's value last changed, if evaluated.
    pub fn changed_at(&self, key: &Key) -> Option<Version> {
        self.nodes.get(key).map(|n| n.changed_at)
    }

    pub fn value(&self, key: &Key) -> Option<Value> {
        self.nodes.get(key).and_then(|n| n.value.clone())
    }

    /// Value only if confirmed fresh at `version`; this is what the
    /// evaluation environment's `get` consults.
    pub fn value_if_fresh(&self, key: &Key, version: Version) -> Option<Value> {
        let node = self.nodes.get(key)?;
        if node.checked_at == version && node.dirty == DirtyState::Clean {
            node.value.clone()
        } else {
            None
        }
    }

    /// Error recorded at `version`, for `get_or_err`.
    pub fn error_if_fresh(&self, key: &Key, version: Version) -> Option<AnvilError> {
        let node = self.nodes.get(key)?;
        if node.checked_at == version {
            node.error.clone()
        } else {
            None
        }
    }

    pub fn deps(&self, key: &Key) -> Vec<Key> {
        self.nodes.get(key).map(|n| n.deps.clone()).unwrap_or_default()
    }

    pub fn rdeps(&self, key: &Key) -> Vec<Key> {
        self.nodes
            .get(key)
            .map(|n| n.rdeps.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Decide what evaluating `key` requires at `version`.
    pub fn plan_for(&self, key: &Key, version: Version, hermetic: bool) -> NodePlan {
        let Some(node) = self.nodes.get(key) else {
            return NodePlan::Rebuild;
        };
        if node.checked_at == version {
            if let Some(e) = &node.error {
                return NodePlan::FreshError(e.clone());
            }
            if node.dirty == DirtyState::Clean {
                if let Some(v) = &node.value {
                    return NodePlan::Fresh(v.clone());
                }
            }
            // Checked this build but invalidated since (rewind): recompute.
            return NodePlan::Rebuild;
        }
        if let Some(e) = &node.error {
            if e.cacheable_across_builds() {
                return NodePlan::Remembered(e.clone());
            }
            return NodePlan::Rebuild;
        }
        if !hermetic || !node.hermetic {
            return NodePlan::Rebuild;
        }
        match (&node.value, node.dirty) {
            (_, DirtyState::NeedsRebuild) | (None, _) => NodePlan::Rebuild,
            (Some(v), _) => NodePlan::CheckDeps {
                value: v.clone(),
                deps: node.deps.clone(),
                computed_at: node.computed_at,
            },
        }
    }

    /// Record a freshly computed value. Returns whether the value actually
    /// changed (which is what re-dirties consumers).
    pub fn write_value(
        &self,
        key: &Key,
        value: Value,
        deps: Vec<Key>,
        version: Version,
        hermetic: bool,
    ) -> bool {
        let (changed, old_deps) = {
            let mut node = self.nodes.entry(key.clone()).or_default();
            let changed = node.value.as_ref() != Some(&value);
            if changed {
                node.changed_at = version;
            }
            let old_deps = std::mem::replace(&mut node.deps, deps.clone());
            node.value = Some(value);
            node.error = None;
            node.computed_at = version;
            node.checked_at = version;
            node.dirty = DirtyState::Clean;
            node.hermetic = hermetic;
            (changed, old_deps)
        };
        self.update_rdep_edges(key, &old_deps, &deps);
        changed
    }

    /// Record a failed evaluation. Cancellations are never recorded.
    pub fn write_error(&self, key: &Key, error: AnvilError, deps: Vec<Key>, version: Version) {
        if matches!(error, AnvilError::Cancelled) {
            return;
        }
        let old_deps = {
            let mut node = self.nodes.entry(key.clone()).or_default();
            let old_deps = std::mem::replace(&mut node.deps, deps.clone());
            node.value = None;
            node.error = Some(error);
            node.computed_at = version;
            node.checked_at = version;
            node.changed_at = version;
            node.dirty = DirtyState::Clean;
            old_deps
        };
        self.update_rdep_edges(key, &old_deps, &deps);
    }

    /// Confirm a `CheckDeps` node unchanged: bump `checked_at` without
    /// recomputation. This is the central incrementality optimization.
    pub fn mark_clean(&self, key: &Key, version: Version) {
        if let Some(mut node) = self.nodes.get_mut(key) {
            node.checked_at = version;
            node.dirty = DirtyState::Clean;
        }
    }

    /// Re-surface a remembered persistent error at the current version.
    pub fn refresh_error(&self, key: &Key, version: Version) {
        if let Some(mut node) = self.nodes.get_mut(key) {
            if node.error.is_some() {
                node.checked_at = version;
            }
        }
    }

    /// Mark `keys` for unconditional recomputation and transitively mark
    /// their reverse-dependency closure for dependency re-checking.
    pub fn invalidate(&self, keys: &[Key]) -> InvalidationResult {
        let mut result = InvalidationResult::default();
        let mut queue: VecDeque<Key> = VecDeque::new();
        let mut seen: FxHashSet<Key> = FxHashSet::default();

        for key in keys {
            let rdeps = {
                let Some(mut node) = self.nodes.get_mut(key) else {
                    continue;
                };
                if node.dirty != DirtyState::NeedsRebuild {
                    node.dirty = DirtyState::NeedsRebuild;
                    result.cleared += 1;
                }
                node.rdeps.iter().cloned().collect::<Vec<_>>()
            };
            seen.insert(key.clone());
            queue.extend(rdeps);
        }

        while let Some(key) = queue.pop_front() {
            if !seen.insert(key.clone()) {
                continue;
            }
            let rdeps = {
                let Some(mut node) = self.nodes.get_mut(&key) else {
                    continue;
                };
                match node.dirty {
                    // Never downgrade a stronger mark.
                    DirtyState::NeedsRebuild | DirtyState::CheckDeps => continue,
                    DirtyState::Clean => {
                        node.dirty = DirtyState::CheckDeps;
                        result.dirtied += 1;
                    }
                }
                node.rdeps.iter().cloned().collect::<Vec<_>>()
            };
            queue.extend(rdeps);
        }

        debug!(
            cleared = result.cleared,
            dirtied = result.dirtied,
            "invalidated graph nodes"
        );
        result
    }

    /// Iterate all nodes; used by snapshot capture.
    pub fn for_each_node(&self, mut f: impl FnMut(&Key, &Node)) {
        for entry in self.nodes.iter() {
            f(entry.key(), entry.value());
        }
    }

    /// Install a node loaded from a snapshot. Reverse edges are rebuilt by
    /// the caller from the forward edges.
    pub(crate) fn install_restored(&self, key: Key, node: Node) {
        self.nodes.insert(key, node);
    }

    pub(crate) fn add_rdep(&self, dep: &Key, rdep: Key) {
        let mut node = self.nodes.entry(dep.clone()).or_default();
        node.rdeps.insert(rdep);
    }

    pub(crate) fn set_version(&self, version: Version) {
        self.version.store(version.0, Ordering::SeqCst);
    }

    fn update_rdep_edges(&self, key: &Key, old_deps: &[Key], new_deps: &[Key]) {
        let old: FxHashSet<&Key> = old_deps.iter().collect();
        let new: FxHashSet<&Key> = new_deps.iter().collect();
        // Per-node exclusive writes in key order; one entry guard at a time.
        let mut removed: Vec<&Key> = old.difference(&new).copied().collect();
        removed.sort();
        for dep in removed {
            if let Some(mut node) = self.nodes.get_mut(dep) {
                node.rdeps.remove(key);
            }
        }
        let mut added: Vec<&Key> = new.difference(&old).copied().collect();
        added.sort();
        for dep in added {
            let mut node = self.nodes.entry((*dep).clone()).or_default();
            node.rdeps.insert(key.clone());
        }
    }
}

impl Default for GraphStore {
    fn default() -> Self {
        Self::new()
    }
}

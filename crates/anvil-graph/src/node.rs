use anvil_core::{AnvilError, Key, Value, Version};
use rustc_hash::FxHashSet;

/// Dirty state of a node relative to the current build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirtyState {
    /// Value is valid as of `checked_at`.
    Clean,
    /// A transitive dependency was invalidated; direct deps must be
    /// re-checked before the value can be trusted.
    CheckDeps,
    /// The node itself was invalidated; its function must run again.
    NeedsRebuild,
}

/// Everything the graph store holds for one evaluated key.
///
/// Version bookkeeping: `computed_at` is the build at which the function
/// last ran, `checked_at` the build at which the value was last confirmed
/// fresh (possibly without recomputation), and `changed_at` the build at
/// which the value last actually changed. A dependency "actually changed"
/// for a consumer iff `dep.changed_at > consumer.computed_at`.
#[derive(Debug, Clone)]
pub struct Node {
    pub value: Option<Value>,
    pub error: Option<AnvilError>,
    /// Direct deps in the order the function consumed them.
    pub deps: Vec<Key>,
    pub rdeps: FxHashSet<Key>,
    pub computed_at: Version,
    pub checked_at: Version,
    pub changed_at: Version,
    pub dirty: DirtyState,
    /// Whether the producing function is hermetic; non-hermetic values are
    /// never carried across builds.
    pub hermetic: bool,
}

impl Node {
    pub fn new() -> Self {
        Node {
            value: None,
            error: None,
            deps: Vec::new(),
            rdeps: FxHashSet::default(),
            computed_at: Version::ZERO,
            checked_at: Version::ZERO,
            changed_at: Version::ZERO,
            dirty: DirtyState::NeedsRebuild,
            hermetic: true,
        }
    }
}

impl Default for Node {
    fn default() -> Self {
        Self::new()
    }
}

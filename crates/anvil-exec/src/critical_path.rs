use anvil_core::{ActionRef, CriticalPathEntry, ExecPath};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

/// Per-action timing component. `aggregated` is this action's elapsed time
/// plus the largest aggregated time among its dependencies; the chain of
/// `longest_dep` links from the maximal component is the critical path.
#[derive(Debug, Clone)]
struct Component {
    action: ActionRef,
    start_nanos: u64,
    finish_nanos: u64,
    elapsed: Duration,
    aggregated: Duration,
    longest_dep: Option<ExecPath>,
    finished: bool,
}

/// Thread-compatible critical-path recorder, reset per build. Updates are
/// synchronized per component; concurrent completions of unrelated actions
/// never contend.
pub struct CriticalPathTracker {
    components: DashMap<ExecPath, Arc<Mutex<Component>>>,
    epoch: Instant,
}

impl CriticalPathTracker {
    pub fn new() -> Self {
        CriticalPathTracker {
            components: DashMap::new(),
            epoch: Instant::now(),
        }
    }

    pub fn now_nanos(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    pub fn action_started(&self, action: &ActionRef) -> u64 {
        let start = self.now_nanos();
        self.record_start(action, start);
        start
    }

    pub fn record_start(&self, action: &ActionRef, start_nanos: u64) {
        let key = action.primary_output.clone();
        let component = self
            .components
            .entry(key)
            .or_insert_with(|| {
                Arc::new(Mutex::new(Component {
                    action: action.clone(),
                    start_nanos,
                    finish_nanos: 0,
                    elapsed: Duration::ZERO,
                    aggregated: Duration::ZERO,
                    longest_dep: None,
                    finished: false,
                }))
            })
            .clone();
        let mut c = component.lock();
        // A rewound action starts again; measure the latest run.
        if c.finished {
            c.start_nanos = start_nanos;
        }
    }

    pub fn action_finished(&self, action: &ActionRef, dep_outputs: &[ExecPath]) {
        self.record_finish(action, self.now_nanos(), dep_outputs);
    }

    /// Record a completion. When a shared action finishes a second time the
    /// greater elapsed is kept and the aggregate recomputed; this matches
    /// the historical accounting even though it can overstate downstream
    /// paths.
    pub fn record_finish(&self, action: &ActionRef, finish_nanos: u64, dep_outputs: &[ExecPath]) {
        let (longest_dep, dep_aggregated) = self.longest_dependency(dep_outputs);
        let key = action.primary_output.clone();
        let component = self
            .components
            .entry(key)
            .or_insert_with(|| {
                Arc::new(Mutex::new(Component {
                    action: action.clone(),
                    start_nanos: finish_nanos,
                    finish_nanos,
                    elapsed: Duration::ZERO,
                    aggregated: Duration::ZERO,
                    longest_dep: None,
                    finished: false,
                }))
            })
            .clone();

        let mut c = component.lock();
        let elapsed = Duration::from_nanos(finish_nanos.saturating_sub(c.start_nanos));
        if !c.finished || elapsed > c.elapsed {
            c.elapsed = elapsed;
        }
        c.finish_nanos = finish_nanos;
        c.finished = true;
        c.aggregated = c.elapsed + dep_aggregated;
        c.longest_dep = longest_dep;
        trace!(action = %c.action, elapsed_ns = c.elapsed.as_nanos() as u64, "component finished");
    }

    fn longest_dependency(&self, dep_outputs: &[ExecPath]) -> (Option<ExecPath>, Duration) {
        let mut longest: Option<ExecPath> = None;
        let mut max = Duration::ZERO;
        for dep in dep_outputs {
            if let Some(component) = self.components.get(dep) {
                let aggregated = component.lock().aggregated;
                if aggregated > max {
                    max = aggregated;
                    longest = Some(dep.clone());
                }
            }
        }
        (longest, max)
    }

    /// Walk back from the component with the greatest aggregated time
    /// through the chain of chosen dependencies.
    pub fn critical_path(&self) -> Vec<CriticalPathEntry> {
        let mut head: Option<(ExecPath, Duration)> = None;
        for entry in self.components.iter() {
            let c = entry.value().lock();
            if !c.finished {
                continue;
            }
            if head.as_ref().map_or(true, |(_, best)| c.aggregated > *best) {
                head = Some((entry.key().clone(), c.aggregated));
            }
        }

        let mut path = Vec::new();
        let mut cursor = head.map(|(k, _)| k);
        while let Some(key) = cursor {
            let Some(component) = self.components.get(&key) else {
                break;
            };
            let c = component.lock();
            path.push(CriticalPathEntry {
                action: c.action.clone(),
                elapsed: c.elapsed,
                aggregated: c.aggregated,
            });
            cursor = c.longest_dep.clone();
        }
        path
    }
}

impl Default for CriticalPathTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anvil_core::ExecPath;

    fn aref(out: &str) -> ActionRef {
        ActionRef {
            owner: format!("//pkg:{out}"),
            mnemonic: "Test".to_string(),
            primary_output: ExecPath::new(out).unwrap(),
        }
    }

    fn p(out: &str) -> ExecPath {
        ExecPath::new(out).unwrap()
    }

    #[test]
    fn chain_aggregates_longest_dependency() {
        let t = CriticalPathTracker::new();
        // leaf: 100ns; mid over leaf: 50ns; other: 20ns; top over mid+other.
        t.record_start(&aref("out/leaf"), 0);
        t.record_finish(&aref("out/leaf"), 100, &[]);
        t.record_start(&aref("out/other"), 0);
        t.record_finish(&aref("out/other"), 20, &[]);
        t.record_start(&aref("out/mid"), 100);
        t.record_finish(&aref("out/mid"), 150, &[p("out/leaf")]);
        t.record_start(&aref("out/top"), 150);
        t.record_finish(&aref("out/top"), 180, &[p("out/mid"), p("out/other")]);

        let path = t.critical_path();
        let outputs: Vec<&str> = path
            .iter()
            .map(|e| e.action.primary_output.as_str())
            .collect();
        assert_eq!(outputs, vec!["out/top", "out/mid", "out/leaf"]);
        assert_eq!(path[0].aggregated, Duration::from_nanos(30 + 50 + 100));
        assert_eq!(path[0].elapsed, Duration::from_nanos(30));
    }

    /// A shared action completing a second time keeps the larger elapsed.
    /// This intentionally pins the historical keep-max behavior, imprecise
    /// as it is for downstream aggregation.
    #[test]
    fn shared_completion_keeps_max_elapsed() {
        let t = CriticalPathTracker::new();
        t.record_start(&aref("out/shared"), 0);
        t.record_finish(&aref("out/shared"), 100, &[]);
        // Second completion reports a shorter run; the first one wins.
        t.record_start(&aref("out/shared"), 200);
        t.record_finish(&aref("out/shared"), 240, &[]);

        let path = t.critical_path();
        assert_eq!(path.len(), 1);
        assert_eq!(path[0].elapsed, Duration::from_nanos(100));

        // A second completion reporting a longer run replaces it.
        t.record_start(&aref("out/shared"), 300);
        t.record_finish(&aref("out/shared"), 450, &[]);
        let path = t.critical_path();
        assert_eq!(path[0].elapsed, Duration::from_nanos(150));
    }

    #[test]
    fn unfinished_components_are_ignored() {
        let t = CriticalPathTracker::new();
        t.record_start(&aref("out/hung"), 0);
        t.record_start(&aref("out/done"), 0);
        t.record_finish(&aref("out/done"), 10, &[]);
        let path = t.critical_path();
        assert_eq!(path.len(), 1);
        assert_eq!(path[0].action.primary_output.as_str(), "out/done");
    }
}

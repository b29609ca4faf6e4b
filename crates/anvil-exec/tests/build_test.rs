use anvil_core::{
    Action, ActionOwner, AggregationValue, AnvilError, Artifact, BuildEvent, CoreContext, Digest,
    EngineConfig, ExecPath, Key, Value,
};
use anvil_exec::{BuildOutcome, BuildSession};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

fn p(s: &str) -> ExecPath {
    ExecPath::new(s).unwrap()
}

struct TestBuild {
    dir: TempDir,
    session: BuildSession,
    events: Arc<Mutex<Vec<BuildEvent>>>,
}

impl TestBuild {
    fn new() -> TestBuild {
        Self::with_config(EngineConfig::default())
    }

    fn with_config(mut config: EngineConfig) -> TestBuild {
        let dir = tempfile::tempdir().unwrap();
        config.output_base = dir.path().join("ob");
        let ctx = CoreContext::new(config);
        let events = ctx.bus.collector();
        let session = BuildSession::new(ctx).unwrap();
        TestBuild { dir, session, events }
    }

    /// Reopen the engine on the same output base (server restart).
    fn reopen(self) -> TestBuild {
        let config = (*self.session.context().config).clone();
        let ctx = CoreContext::new(config);
        let events = ctx.bus.collector();
        let session = BuildSession::new(ctx).unwrap();
        TestBuild {
            dir: self.dir,
            session,
            events,
        }
    }

    fn exec_root(&self) -> PathBuf {
        self.session.context().config.exec_root()
    }

    fn write_source(&self, rel: &str, content: &str) {
        let path = self.exec_root().join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }

    fn shell(&self, label: &str, script: &str, inputs: &[&str], primary: &str) -> Arc<Action> {
        self.session.actions().register(
            Action::new(
                ActionOwner::new(label, Digest::of_bytes(b"cfg")),
                0,
                "Shell",
                Artifact::file(p(primary)),
            )
            .with_command(["/bin/sh", "-c", script])
            .with_inputs(inputs.iter().map(|s| p(s)).collect()),
        )
    }

    fn target(&self, name: &str, artifacts: &[&str]) {
        self.session
            .actions()
            .register_target(name, artifacts.iter().map(|s| p(s)).collect());
    }

    async fn build(&self, targets: &[&str]) -> BuildOutcome {
        self.session.build(targets).await
    }

    /// Kinds of events for one primary output, from `mark` on.
    fn events_for(&self, mark: usize, primary: &str) -> Vec<String> {
        self.events.lock()[mark..]
            .iter()
            .filter(|e| {
                e.action()
                    .map(|a| a.primary_output.as_str() == primary)
                    .unwrap_or(false)
            })
            .map(|e| e.kind().to_string())
            .collect()
    }

    fn mark(&self) -> usize {
        self.events.lock().len()
    }
}

fn top_level_digests(outcome: &BuildOutcome, target: &str) -> Vec<Digest> {
    match &outcome.result.values[&Key::top_level(target)] {
        Value::TopLevel(map) => map.values().copied().collect(),
        other => panic!("unexpected value: {other:?}"),
    }
}

/// Scenario 1: rebuild with only an mtime touch. The action function
/// re-checks but the subprocess does not run again; the cache answers.
#[tokio::test]
async fn mtime_touch_rebuild_hits_the_cache() {
    let tb = TestBuild::new();
    tb.write_source("s.txt", "x");
    tb.shell("//pkg:t", "cat s.txt > out/o", &["s.txt"], "out/o");
    tb.target("t", &["out/o"]);

    let first = tb.build(&["t"]).await;
    assert!(first.success(), "{:?}", first.result.errors);
    assert_eq!(first.exec_stats.spawned, 1);

    // Touch: rewrite identical content after the filesystem clock ticks.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    tb.write_source("s.txt", "x");

    let mark = tb.mark();
    let second = tb.build(&["t"]).await;
    assert!(second.success());
    assert_eq!(second.exec_stats.spawned, 0, "content unchanged; no re-run");
    assert_eq!(
        tb.events_for(mark, "out/o"),
        vec!["ActionStarted", "ActionCached"],
    );
    assert!(second.result.stats.nodes_pruned >= 1);
    assert_eq!(top_level_digests(&first, "t"), top_level_digests(&second, "t"));
}

/// Scenario 2: input content change re-runs the action and changes the
/// output digest downstream.
#[tokio::test]
async fn content_change_reruns_and_invalidates_downstream() {
    let tb = TestBuild::new();
    tb.write_source("s.txt", "x");
    tb.shell("//pkg:t", "cat s.txt > out/o", &["s.txt"], "out/o");
    tb.target("t", &["out/o"]);

    let first = tb.build(&["t"]).await;
    assert!(first.success());

    tb.write_source("s.txt", "y");
    let mark = tb.mark();
    let second = tb.build(&["t"]).await;
    assert!(second.success());
    assert_eq!(second.exec_stats.spawned, 1);
    assert_eq!(
        tb.events_for(mark, "out/o"),
        vec!["ActionStarted", "ActionCompleted"],
    );
    assert_ne!(top_level_digests(&first, "t"), top_level_digests(&second, "t"));
}

/// Scenario 4 / P5: output path prefix conflicts fail the build with one
/// conflict, in either registration order.
#[tokio::test]
async fn prefix_conflict_fails_the_build_once() {
    for reverse in [false, true] {
        let tb = TestBuild::new();
        let mut declarations = vec![("//a:short", "echo 1 > out/a", "out/a"),
                                    ("//b:long", "echo 2 > out/a/b", "out/a/b")];
        if reverse {
            declarations.reverse();
        }
        for (label, script, primary) in &declarations {
            tb.shell(label, script, &[], primary);
        }
        tb.target("t1", &[declarations[0].2]);
        tb.target("t2", &[declarations[1].2]);

        let outcome = tb.build(&["t1", "t2"]).await;
        assert!(!outcome.success());
        assert!(
            outcome
                .result
                .errors
                .iter()
                .any(|(_, e)| matches!(e.root_cause(), AnvilError::PrefixConflict { .. })),
            "expected prefix conflict: {:?}",
            outcome.result.errors
        );
        let conflict_events = tb
            .events
            .lock()
            .iter()
            .filter(|e| matches!(e, BuildEvent::ActionFailed { error, .. } if error.contains("prefix conflict")))
            .count();
        assert_eq!(conflict_events, 1);
        assert_eq!(outcome.exec_stats.spawned, 0);
    }
}

/// Scenario 5 / P7: a lost derived input triggers a rewind that re-executes
/// the generator and then the consumer, exactly once each, in order.
#[tokio::test]
async fn lost_input_rewind_reexecutes_generator_then_consumer() {
    let tb = TestBuild::new();
    tb.write_source("s.txt", "x");
    let _gen = tb.shell("//b:gen", "cat s.txt > out/b", &["s.txt"], "out/b");
    let consumer = tb.shell("//a:use", "cat out/b > out/a", &["out/b"], "out/a");
    tb.target("t", &["out/a"]);

    let first = tb.build(&["t"]).await;
    assert!(first.success());
    assert_eq!(first.exec_stats.spawned, 2);

    // Simulate remote-cache eviction: the intermediate and final outputs
    // vanish along with every stored blob, and the consumer is invalidated.
    std::fs::remove_file(tb.exec_root().join("out/b")).unwrap();
    std::fs::remove_file(tb.exec_root().join("out/a")).unwrap();
    std::fs::remove_dir_all(tb.session.context().config.action_outputs_dir()).unwrap();
    tb.session.store().invalidate(&[consumer.execution_key()]);

    let mark = tb.mark();
    let second = tb.build(&["t"]).await;
    assert!(second.success(), "{:?}", second.result.errors);
    // P7: generator and consumer re-executed exactly once each.
    assert_eq!(second.exec_stats.spawned, 2);
    assert_eq!(second.exec_stats.rewound, 1);

    let relevant: Vec<(String, String)> = tb.events.lock()[mark..]
        .iter()
        .filter_map(|e| {
            e.action()
                .map(|a| (e.kind().to_string(), a.primary_output.as_str().to_string()))
        })
        .collect();
    let expected = [
        ("ActionStarted", "out/a"),
        ("LostInputsDetected", "out/a"),
        ("ActionStarted", "out/b"),
        ("ActionCompleted", "out/b"),
        ("ActionCompleted", "out/a"),
    ];
    let mut cursor = relevant.iter();
    for (kind, output) in expected {
        assert!(
            cursor.any(|(k, o)| k.as_str() == kind && o.as_str() == output),
            "missing {kind}({output}) in order; got {relevant:?}"
        );
    }

    // The rewind debug log recorded the plan.
    let log = std::fs::read_to_string(tb.session.context().config.rewind_log_file()).unwrap();
    assert!(log.contains("out/b"));
}

/// Scenario 6 / P6: an action cycle is reported without spawning anything.
#[tokio::test]
async fn action_cycle_is_detected_before_spawning() {
    let tb = TestBuild::new();
    tb.shell("//x", "cat out/y > out/x", &["out/y"], "out/x");
    tb.shell("//y", "cat out/x > out/y", &["out/x"], "out/y");
    tb.target("t", &["out/x"]);

    let outcome = tb.build(&["t"]).await;
    assert!(!outcome.success());
    assert_eq!(outcome.exec_stats.spawned, 0, "no subprocess for a cycle");
    let (_, err) = &outcome.result.errors[0];
    match err.root_cause() {
        AnvilError::Cycle { ring } => {
            let text = ring.join(" ");
            assert!(text.contains("out/x") && text.contains("out/y"), "{ring:?}");
        }
        other => panic!("expected cycle, got {other:?}"),
    }
}

/// Boundary: a zero-input action caches by its fingerprint alone, across
/// engine restarts with a cold graph.
#[tokio::test]
async fn zero_input_action_is_cached_by_fingerprint_alone() {
    let tb = TestBuild::new();
    tb.shell("//z", "echo made > out/z", &[], "out/z");
    tb.target("t", &["out/z"]);
    let first = tb.build(&["t"]).await;
    assert!(first.success());
    assert_eq!(first.exec_stats.spawned, 1);

    // Same engine: the graph prunes without even probing.
    let second = tb.build(&["t"]).await;
    assert_eq!(second.exec_stats.spawned, 0);

    // Cold graph, warm action cache: the probe answers.
    std::fs::remove_file(tb.session.context().config.graph_snapshot_file()).unwrap();
    let tb = tb.reopen();
    tb.shell("//z", "echo made > out/z", &[], "out/z");
    tb.target("t", &["out/z"]);
    let mark = tb.mark();
    let third = tb.build(&["t"]).await;
    assert!(third.success());
    assert_eq!(third.exec_stats.spawned, 0);
    assert_eq!(tb.events_for(mark, "out/z"), vec!["ActionStarted", "ActionCached"]);
}

#[tokio::test]
async fn keep_going_builds_unrelated_targets_past_a_failure() {
    let mut config = EngineConfig::default();
    config.keep_going = true;
    let tb = TestBuild::with_config(config);
    tb.shell("//bad", "echo oops >&2; exit 3", &[], "out/bad");
    tb.shell("//good", "echo fine > out/good", &[], "out/good");
    tb.target("tbad", &["out/bad"]);
    tb.target("tgood", &["out/good"]);

    let outcome = tb.build(&["tbad", "tgood"]).await;
    assert!(!outcome.success());
    assert!(outcome.result.values.contains_key(&Key::top_level("tgood")));
    let (_, err) = &outcome.result.errors[0];
    assert!(matches!(err.root_cause(), AnvilError::ActionExited { code: 3, .. }));

    let failed = tb
        .events
        .lock()
        .iter()
        .filter(|e| e.kind() == "ActionFailed")
        .count();
    assert_eq!(failed, 1, "one ActionFailed per failed action");
}

#[tokio::test]
async fn timeouts_are_distinct_from_execution_failures() {
    let tb = TestBuild::new();
    let action = Action::new(
        ActionOwner::new("//slow", Digest::of_bytes(b"cfg")),
        0,
        "Sleep",
        Artifact::file(p("out/slow")),
    )
    .with_command(["/bin/sh", "-c", "sleep 30"])
    .with_requirement(anvil_core::requirements::TIMEOUT, "1");
    tb.session.actions().register(action);
    tb.target("t", &["out/slow"]);

    let outcome = tb.build(&["t"]).await;
    assert!(!outcome.success());
    let (_, err) = &outcome.result.errors[0];
    assert!(matches!(err.root_cause(), AnvilError::Timeout { .. }));
}

#[tokio::test]
async fn middleman_actions_are_elided() {
    let tb = TestBuild::new();
    tb.shell("//z", "echo z > out/z", &[], "out/z");
    let middleman = Action::new(
        ActionOwner::new("//mm", Digest::of_bytes(b"cfg")),
        0,
        "Middleman",
        Artifact::file(p("out/mm.runfiles")),
    );
    tb.session.actions().register(middleman);
    tb.session.actions().register_aggregation(
        p("out/mm.runfiles"),
        AggregationValue::new(vec![p("out/z")]).unwrap(),
    );
    tb.target("t", &["out/mm.runfiles"]);

    let mark = tb.mark();
    let outcome = tb.build(&["t"]).await;
    assert!(outcome.success(), "{:?}", outcome.result.errors);
    assert_eq!(outcome.exec_stats.spawned, 0);
    assert_eq!(
        tb.events_for(mark, "out/mm.runfiles"),
        vec!["ActionStarted", "ActionCompleted", "MiddlemanElided"],
    );
}

/// The critical path covers the longest chain and is posted at build end.
#[tokio::test]
async fn critical_path_follows_the_dependency_chain() {
    let tb = TestBuild::new();
    tb.write_source("s.txt", "x");
    tb.shell("//b", "sleep 0.1; cat s.txt > out/b", &["s.txt"], "out/b");
    tb.shell("//a", "sleep 0.05; cat out/b > out/a", &["out/b"], "out/a");
    tb.shell("//c", "echo quick > out/c", &[], "out/c");
    tb.target("t", &["out/a", "out/c"]);

    let outcome = tb.build(&["t"]).await;
    assert!(outcome.success());
    let outputs: Vec<&str> = outcome
        .critical_path
        .iter()
        .map(|e| e.action.primary_output.as_str())
        .collect();
    assert_eq!(outputs, vec!["out/a", "out/b"]);
    assert!(outcome.critical_path[0].aggregated >= outcome.critical_path[1].aggregated);
    assert!(tb
        .events
        .lock()
        .iter()
        .any(|e| e.kind() == "CriticalPath"));
}

/// Inputs discovered at run time (dep-file entries) invalidate the action
/// exactly like declared inputs do.
#[tokio::test]
async fn discovered_inputs_invalidate_like_declared_ones() {
    let tb = TestBuild::new();
    tb.write_source("s.txt", "body");
    tb.write_source("extra.h", "v1");
    tb.session.actions().register(
        Action::new(
            ActionOwner::new("//pkg:scan", Digest::of_bytes(b"cfg")),
            0,
            "Scan",
            Artifact::file(p("out/o")),
        )
        .with_command([
            "/bin/sh",
            "-c",
            "cat s.txt extra.h > out/o; printf 'extra.h\\n' > out/o.d",
        ])
        .with_inputs(vec![p("s.txt")])
        .with_discovered_inputs("out/o.d"),
    );
    tb.target("t", &["out/o"]);

    let first = tb.build(&["t"]).await;
    assert!(first.success(), "{:?}", first.result.errors);
    assert_eq!(first.exec_stats.spawned, 1);

    // Nothing changed: the discovered header is a graph dependency now and
    // the node prunes without re-running.
    let second = tb.build(&["t"]).await;
    assert!(second.success());
    assert_eq!(second.exec_stats.spawned, 0);

    // Changing only the undeclared-but-discovered header re-runs the action.
    tb.write_source("extra.h", "v2");
    let third = tb.build(&["t"]).await;
    assert!(third.success());
    assert_eq!(third.exec_stats.spawned, 1);
    assert_ne!(top_level_digests(&first, "t"), top_level_digests(&third, "t"));
}

/// A missing source file surfaces as a persistent user error, and the
/// failing node is remembered across builds.
#[tokio::test]
async fn missing_source_is_a_user_error() {
    let tb = TestBuild::new();
    tb.shell("//a", "cat nope.txt > out/a", &["nope.txt"], "out/a");
    tb.target("t", &["out/a"]);

    let outcome = tb.build(&["t"]).await;
    assert!(!outcome.success());
    let (_, err) = &outcome.result.errors[0];
    assert!(matches!(err.root_cause(), AnvilError::SourceFileMissing { .. }));

    let again = tb.build(&["t"]).await;
    assert!(!again.success());
    assert_eq!(again.exec_stats.spawned, 0);
}

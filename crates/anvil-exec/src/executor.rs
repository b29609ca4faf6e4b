use crate::outputs::{prepare_output_dirs, validate_outputs, StripedLocks};
use crate::registry::ActionRegistry;
use crate::spawn::{run_command, tail};
use anvil_cache::{combined_inputs_digest, request_fingerprint, ActionCache, CachedRecord, OutputStore, Probe};
use anvil_core::{
    Action, AnvilError, ArtifactValue, BuildEvent, Digest, EventBus, ExecPath, Result,
};
use crate::critical_path::CriticalPathTracker;
use dashmap::DashMap;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use metrics::counter;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const STDIO_TAIL_BYTES: usize = 4096;

/// The materialized result of executing (or cache-hitting) one action.
#[derive(Debug)]
pub struct ExecutedAction {
    pub outputs: BTreeMap<ExecPath, ArtifactValue>,
    /// Inputs the command reported consuming beyond the declared set,
    /// parsed from its dep file.
    pub discovered_inputs: Vec<ExecPath>,
    pub from_cache: bool,
    pub elapsed: Duration,
}

/// Executor lifecycle counters for the build summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecStats {
    pub spawned: u64,
    pub cache_hits: u64,
    pub coalesced: u64,
    pub rewound: u64,
}

#[derive(Default)]
struct CountersInner {
    spawned: AtomicU64,
    cache_hits: AtomicU64,
    coalesced: AtomicU64,
    rewound: AtomicU64,
}

type ActionFuture = Shared<BoxFuture<'static, std::result::Result<Arc<ExecutedAction>, AnvilError>>>;

/// Orchestrates the lifecycle of every action in a build: conflict
/// surfacing, single-flight per primary output, cache probing, output
/// directory preparation, subprocess execution, output validation, cache
/// commit and event posting. Created fresh per build; the caches and
/// registry it borrows persist.
pub struct ActionExecutor {
    registry: Arc<ActionRegistry>,
    cache: Arc<ActionCache>,
    blobs: Arc<OutputStore>,
    bus: Arc<EventBus>,
    tracker: Arc<CriticalPathTracker>,
    dir_locks: StripedLocks,
    exec_root: PathBuf,
    in_flight: DashMap<ExecPath, ActionFuture>,
    cancel: CancellationToken,
    sigterm_grace: Duration,
    counters: CountersInner,
}

impl ActionExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<ActionRegistry>,
        cache: Arc<ActionCache>,
        blobs: Arc<OutputStore>,
        bus: Arc<EventBus>,
        tracker: Arc<CriticalPathTracker>,
        exec_root: PathBuf,
        dir_lock_stripes: usize,
        sigterm_grace: Duration,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(ActionExecutor {
            registry,
            cache,
            blobs,
            bus,
            tracker,
            dir_locks: StripedLocks::new(dir_lock_stripes),
            exec_root,
            in_flight: DashMap::new(),
            cancel,
            sigterm_grace,
            counters: CountersInner::default(),
        })
    }

    pub fn exec_root(&self) -> &PathBuf {
        &self.exec_root
    }

    pub fn stats(&self) -> ExecStats {
        ExecStats {
            spawned: self.counters.spawned.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            coalesced: self.counters.coalesced.load(Ordering::Relaxed),
            rewound: self.counters.rewound.load(Ordering::Relaxed),
        }
    }

    /// Execute `action`, whose declared inputs must already be up to date
    /// with the given digests. Concurrent callers for the same primary
    /// output share one execution; a sharing caller's result is projected
    /// onto its own declared output set.
    pub async fn execute(
        self: &Arc<Self>,
        action: Arc<Action>,
        inputs: BTreeMap<ExecPath, Digest>,
    ) -> Result<Arc<ExecutedAction>> {
        // Conflicts recorded during analysis pre-empt everything. Both
        // parties fail with the same error, but it surfaces as exactly one
        // event however the build reaches the two actions.
        if let Some(conflict) = self.registry.conflict_for(&action) {
            if self.registry.claim_conflict_report(&action) {
                self.bus.post(BuildEvent::ActionFailed {
                    action: action.action_ref(),
                    error: conflict.to_string(),
                    stdout_tail: String::new(),
                    stderr_tail: String::new(),
                });
            }
            return Err(conflict);
        }

        let primary = action.primary_output.path.clone();
        let future = match self.in_flight.get(&primary) {
            Some(existing) => {
                self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                counter!("anvil_actions_coalesced").increment(1);
                existing.clone()
            }
            None => self
                .in_flight
                .entry(primary.clone())
                .or_insert_with(|| {
                    let executor = Arc::clone(self);
                    let action = Arc::clone(&action);
                    async move { executor.run_one(action, inputs).await }
                        .boxed()
                        .shared()
                })
                .clone(),
        };

        let outcome = future.await;
        if outcome.is_err() {
            // Leave failures out of the single-flight map so a rewound or
            // retried build can execute again; attached waiters already
            // share this error.
            self.in_flight.remove(&primary);
        }
        let executed = outcome?;
        Ok(self.project(&action, executed))
    }

    /// Drop in-flight futures for the named primary outputs (rewind).
    pub fn forget_actions(&self, primaries: &[ExecPath]) {
        for primary in primaries {
            self.in_flight.remove(primary);
        }
        self.counters
            .rewound
            .fetch_add(primaries.len() as u64, Ordering::Relaxed);
        counter!("anvil_actions_rewound").increment(primaries.len() as u64);
    }

    /// Per-build teardown: drop in-flight futures and in-build cache claims.
    pub fn finish_build(&self) {
        self.in_flight.clear();
        self.cache.finish_build();
    }

    /// A share-partner receives the produced output map projected onto its
    /// own declared output set, digests copied through.
    fn project(&self, action: &Action, executed: Arc<ExecutedAction>) -> Arc<ExecutedAction> {
        let declared: Vec<&ExecPath> = action.all_outputs().map(|a| &a.path).collect();
        if declared.iter().all(|p| executed.outputs.contains_key(*p))
            && executed.outputs.len() == declared.len()
        {
            return executed;
        }
        let outputs = declared
            .into_iter()
            .filter_map(|p| executed.outputs.get(p).map(|v| (p.clone(), *v)))
            .collect();
        Arc::new(ExecutedAction {
            outputs,
            discovered_inputs: executed.discovered_inputs.clone(),
            from_cache: executed.from_cache,
            elapsed: executed.elapsed,
        })
    }

    async fn run_one(
        self: Arc<Self>,
        action: Arc<Action>,
        inputs: BTreeMap<ExecPath, Digest>,
    ) -> std::result::Result<Arc<ExecutedAction>, AnvilError> {
        let started = Instant::now();
        let aref = action.action_ref();
        let start_nanos = self.tracker.action_started(&aref);
        self.bus.post(BuildEvent::ActionStarted {
            action: aref.clone(),
            start_nanos,
        });

        let result = self.run_inner(&action, &inputs, started).await;
        match &result {
            Ok(executed) => {
                self.tracker
                    .action_finished(&aref, &self.dep_outputs(&inputs));
                if executed.from_cache {
                    self.bus.post(BuildEvent::ActionCached {
                        action: aref.clone(),
                        outputs: digests_of(&executed.outputs),
                    });
                } else {
                    self.bus.post(BuildEvent::ActionCompleted {
                        action: aref.clone(),
                        duration: executed.elapsed,
                        outputs: digests_of(&executed.outputs),
                    });
                    if action.is_middleman() {
                        self.bus.post(BuildEvent::MiddlemanElided { action: aref.clone() });
                    }
                }
            }
            Err(AnvilError::LostInputs { lost, .. }) => {
                self.bus.post(BuildEvent::LostInputsDetected {
                    action: aref.clone(),
                    lost: lost.clone(),
                });
            }
            Err(AnvilError::Cancelled) => {}
            // Subprocess failures post their event where the stdio buffers
            // are in scope, inside run_inner.
            Err(AnvilError::ActionExited { .. }) | Err(AnvilError::ActionSignaled { .. }) => {}
            Err(e) => {
                self.bus.post(BuildEvent::ActionFailed {
                    action: aref.clone(),
                    error: e.to_string(),
                    stdout_tail: String::new(),
                    stderr_tail: String::new(),
                });
            }
        }
        result
    }

    async fn run_inner(
        &self,
        action: &Arc<Action>,
        inputs: &BTreeMap<ExecPath, Digest>,
        started: Instant,
    ) -> std::result::Result<Arc<ExecutedAction>, AnvilError> {
        self.check_inputs_present(action, inputs)?;

        let fingerprint = request_fingerprint(
            &action.action_key(),
            inputs,
            &action.env,
            &action.execution_requirements,
        );

        // Probe until we either trust a record or own the completion token.
        let token = loop {
            match self.cache.probe(fingerprint, inputs).await {
                Probe::Hit(record) => match self.restore_cached(action, &record) {
                    Ok(outputs) => {
                        self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                        counter!("anvil_action_cache_hits").increment(1);
                        debug!(action = %action.action_ref(), "action cache hit");
                        return Ok(Arc::new(ExecutedAction {
                            outputs,
                            discovered_inputs: Vec::new(),
                            from_cache: true,
                            elapsed: started.elapsed(),
                        }));
                    }
                    Err(e) => {
                        warn!(action = %action.action_ref(), error = %e, "cached outputs unrestorable; re-executing");
                        self.cache.evict(&fingerprint);
                    }
                },
                Probe::Miss(token) => break token,
            }
        };

        if action.is_middleman() {
            let outputs = self.middleman_outputs(action);
            drop(token); // zero-work results are not worth a cache entry
            return Ok(Arc::new(ExecutedAction {
                outputs,
                discovered_inputs: Vec::new(),
                from_cache: false,
                elapsed: started.elapsed(),
            }));
        }

        prepare_output_dirs(&self.exec_root, action, &self.dir_locks)?;

        self.counters.spawned.fetch_add(1, Ordering::Relaxed);
        counter!("anvil_actions_spawned").increment(1);
        let outcome = run_command(action, &self.exec_root, self.sigterm_grace, &self.cancel).await?;

        if !outcome.success() {
            let error = match outcome.signal {
                Some(signal) => AnvilError::ActionSignaled {
                    action: action.action_ref(),
                    signal,
                },
                None => AnvilError::ActionExited {
                    action: action.action_ref(),
                    code: outcome.code.unwrap_or(-1),
                },
            };
            // Exactly one ActionFailed per failed action, carrying the
            // stdio tail for the terminal summary.
            self.bus.post(BuildEvent::ActionFailed {
                action: action.action_ref(),
                error: error.to_string(),
                stdout_tail: tail(&outcome.stdout, STDIO_TAIL_BYTES),
                stderr_tail: tail(&outcome.stderr, STDIO_TAIL_BYTES),
            });
            return Err(error);
        }

        let outputs = validate_outputs(&self.exec_root, action)?;
        for (path, value) in &outputs {
            let on_disk = path.under(&self.exec_root);
            if on_disk.is_file() {
                let stored = self.blobs.put_file(&on_disk)?;
                if stored != value.digest {
                    return Err(AnvilError::Internal(format!(
                        "{}: output {path} changed while being stored",
                        action.action_ref()
                    )));
                }
            }
        }

        // Fold run-time discovered inputs into the recorded input set; the
        // committed fingerprint covers them so the next build, probing with
        // last run's discovered set, hits only when they are unchanged.
        let discovered_inputs = self.read_depfile(action)?;
        let mut full_inputs = inputs.clone();
        for path in &discovered_inputs {
            if full_inputs.contains_key(path) {
                continue;
            }
            let on_disk = path.under(&self.exec_root);
            if on_disk.is_file() {
                full_inputs.insert(path.clone(), Digest::of_file(&on_disk)?);
            }
        }
        let final_fingerprint = if discovered_inputs.is_empty() {
            fingerprint
        } else {
            request_fingerprint(
                &action.action_key(),
                &full_inputs,
                &action.env,
                &action.execution_requirements,
            )
        };

        token.commit(CachedRecord {
            fingerprint: final_fingerprint,
            action_name: action.mnemonic.clone(),
            inputs_digest: combined_inputs_digest(&full_inputs),
            outputs: outputs.iter().map(|(p, v)| (p.clone(), v.digest)).collect(),
            timestamp_nanos: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos() as u64,
        })?;

        info!(action = %action.action_ref(), elapsed = ?started.elapsed(), "action completed");
        Ok(Arc::new(ExecutedAction {
            outputs,
            discovered_inputs,
            from_cache: false,
            elapsed: started.elapsed(),
        }))
    }

    /// Parse the newline-separated dep file of an input-discovering action.
    /// Entries that are not readable files are dropped; the action may list
    /// paths it only probed.
    fn read_depfile(&self, action: &Action) -> std::result::Result<Vec<ExecPath>, AnvilError> {
        if !action.discovers_inputs {
            return Ok(Vec::new());
        }
        let Some(depfile) = action.depfile() else {
            return Ok(Vec::new());
        };
        let raw = match std::fs::read_to_string(depfile.under(&self.exec_root)) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut discovered = Vec::new();
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match ExecPath::new(line) {
                Ok(path) => discovered.push(path),
                Err(reason) => {
                    warn!(action = %action.action_ref(), %reason, "ignoring dep file entry");
                }
            }
        }
        Ok(discovered)
    }

    /// Declared inputs must be on disk when execution begins. A missing
    /// derived input was produced earlier and lost since (rewindable); a
    /// missing source input is a user error.
    fn check_inputs_present(
        &self,
        action: &Action,
        inputs: &BTreeMap<ExecPath, Digest>,
    ) -> std::result::Result<(), AnvilError> {
        let mut lost = Vec::new();
        for path in inputs.keys() {
            if self.registry.aggregation(path).is_some() {
                continue; // aggregations have no on-disk identity
            }
            if path.under(&self.exec_root).exists() {
                continue;
            }
            if self.registry.generating_action(path).is_some() {
                lost.push(path.clone());
            } else {
                return Err(AnvilError::MissingInput {
                    action: action.action_ref(),
                    path: path.clone(),
                });
            }
        }
        if !lost.is_empty() {
            return Err(AnvilError::LostInputs {
                action: action.action_ref(),
                lost,
            });
        }
        Ok(())
    }

    fn restore_cached(
        &self,
        action: &Action,
        record: &CachedRecord,
    ) -> Result<BTreeMap<ExecPath, ArtifactValue>> {
        let mut outputs = BTreeMap::new();
        for (path, digest) in &record.outputs {
            let on_disk = path.under(&self.exec_root);
            if !on_disk.exists() {
                self.blobs.materialize(digest, &on_disk)?;
            }
            let size = std::fs::metadata(&on_disk)?.len();
            outputs.insert(path.clone(), ArtifactValue::derived(*digest, size));
        }
        // Every declared mandatory output must be covered by the record.
        for declared in action.mandatory_outputs() {
            if !outputs.contains_key(&declared.path) {
                return Err(AnvilError::Internal(format!(
                    "cached record for {} lacks declared output {}",
                    action.action_ref(),
                    declared.path
                )));
            }
        }
        Ok(outputs)
    }

    /// A middleman produces no files; its value is the digest of its
    /// aggregation expansion.
    fn middleman_outputs(&self, action: &Action) -> BTreeMap<ExecPath, ArtifactValue> {
        let mut outputs = BTreeMap::new();
        for artifact in action.all_outputs() {
            let digest = match self.registry.aggregation(&artifact.path) {
                Some(agg) => {
                    let mut w = anvil_core::DigestWriter::new();
                    w.u32(agg.entries().len() as u32);
                    for entry in agg.entries() {
                        w.str(entry.as_str());
                    }
                    w.finish()
                }
                None => Digest::ZERO,
            };
            outputs.insert(artifact.path.clone(), ArtifactValue::derived(digest, 0));
        }
        outputs
    }

    fn dep_outputs(&self, inputs: &BTreeMap<ExecPath, Digest>) -> Vec<ExecPath> {
        inputs
            .keys()
            .filter_map(|p| {
                self.registry
                    .generating_action(p)
                    .map(|a| a.primary_output.path.clone())
            })
            .collect()
    }
}

fn digests_of(outputs: &BTreeMap<ExecPath, ArtifactValue>) -> BTreeMap<ExecPath, Digest> {
    outputs.iter().map(|(p, v)| (p.clone(), v.digest)).collect()
}

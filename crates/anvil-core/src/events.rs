use crate::action::ActionRef;
use crate::types::{Digest, ExecPath};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// One component on the emitted critical path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CriticalPathEntry {
    pub action: ActionRef,
    pub elapsed: Duration,
    pub aggregated: Duration,
}

/// Immutable lifecycle events fanned out to subscribers. Per action key the
/// executor posts `ActionStarted` followed by exactly one of
/// `ActionCached` / `ActionCompleted` / `ActionFailed`.
#[derive(Debug, Clone, PartialEq)]
pub enum BuildEvent {
    ActionStarted {
        action: ActionRef,
        start_nanos: u64,
    },
    ActionCached {
        action: ActionRef,
        outputs: BTreeMap<ExecPath, Digest>,
    },
    ActionCompleted {
        action: ActionRef,
        duration: Duration,
        outputs: BTreeMap<ExecPath, Digest>,
    },
    ActionFailed {
        action: ActionRef,
        error: String,
        stdout_tail: String,
        stderr_tail: String,
    },
    LostInputsDetected {
        action: ActionRef,
        lost: Vec<ExecPath>,
    },
    MiddlemanElided {
        action: ActionRef,
    },
    CriticalPath {
        components: Vec<CriticalPathEntry>,
    },
    Catastrophe {
        message: String,
    },
}

impl BuildEvent {
    pub fn action(&self) -> Option<&ActionRef> {
        match self {
            BuildEvent::ActionStarted { action, .. }
            | BuildEvent::ActionCached { action, .. }
            | BuildEvent::ActionCompleted { action, .. }
            | BuildEvent::ActionFailed { action, .. }
            | BuildEvent::LostInputsDetected { action, .. }
            | BuildEvent::MiddlemanElided { action } => Some(action),
            BuildEvent::CriticalPath { .. } | BuildEvent::Catastrophe { .. } => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BuildEvent::ActionStarted { .. } => "ActionStarted",
            BuildEvent::ActionCached { .. } => "ActionCached",
            BuildEvent::ActionCompleted { .. } => "ActionCompleted",
            BuildEvent::ActionFailed { .. } => "ActionFailed",
            BuildEvent::LostInputsDetected { .. } => "LostInputsDetected",
            BuildEvent::MiddlemanElided { .. } => "MiddlemanElided",
            BuildEvent::CriticalPath { .. } => "CriticalPath",
            BuildEvent::Catastrophe { .. } => "Catastrophe",
        }
    }
}

type Handler = dyn Fn(&BuildEvent) + Send + Sync;

struct Subscription {
    handler: Box<Handler>,
    /// `Some` for non-concurrent subscribers: invocations serialize on this
    /// mutex, per registration.
    serial: Option<Mutex<()>>,
}

/// Fan-out bus for build lifecycle events.
///
/// Posting is synchronous on the caller, which is what preserves per-
/// publisher order: events posted in sequence from one thread reach each
/// subscriber in that sequence. Subscribers registered `concurrent=false`
/// additionally serialize invocations across publisher threads. The bus
/// itself never fails; a panicking subscriber is logged and skipped.
#[derive(Default)]
pub struct EventBus {
    subs: RwLock<Vec<Arc<Subscription>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, concurrent: bool, handler: F)
    where
        F: Fn(&BuildEvent) + Send + Sync + 'static,
    {
        let sub = Subscription {
            handler: Box::new(handler),
            serial: (!concurrent).then(|| Mutex::new(())),
        };
        self.subs.write().push(Arc::new(sub));
    }

    /// Convenience subscriber that collects every event into a shared vec;
    /// registered non-concurrent so the collected order is the post order.
    pub fn collector(&self) -> Arc<Mutex<Vec<BuildEvent>>> {
        let collected = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&collected);
        self.subscribe(false, move |ev| sink.lock().push(ev.clone()));
        collected
    }

    /// Channel-backed subscription for consumers that drain events on their
    /// own thread (progress UIs, log shippers). The subscriber side never
    /// blocks the bus; a dropped receiver just discards further events.
    pub fn channel(&self) -> crossbeam_channel::Receiver<BuildEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.subscribe(true, move |ev| {
            let _ = tx.send(ev.clone());
        });
        rx
    }

    pub fn post(&self, event: BuildEvent) {
        let subs: Vec<Arc<Subscription>> = self.subs.read().iter().cloned().collect();
        for sub in subs {
            let _serial = sub.serial.as_ref().map(|m| m.lock());
            let outcome = catch_unwind(AssertUnwindSafe(|| (sub.handler)(&event)));
            if outcome.is_err() {
                warn!(event = event.kind(), "event subscriber panicked; continuing");
            }
        }
    }
}

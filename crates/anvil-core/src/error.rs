use crate::action::ActionRef;
use crate::types::ExecPath;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Whether an error would recur on an identical retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persistence {
    /// Retrying with identical inputs may succeed.
    Transient,
    /// Retrying with identical inputs will fail again.
    Persistent,
}

/// Coarse error category; drives keep-going behavior, cross-build error
/// memory and how the failure is surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    User,
    TransientExecution,
    LostInputs,
    Internal,
    Catastrophe,
}

#[derive(Error, Debug, Clone)]
pub enum AnvilError {
    // ---- user errors ----
    #[error("duplicate output {path}: produced by both {first} and {second}")]
    DuplicateOutput {
        path: ExecPath,
        first: ActionRef,
        second: ActionRef,
    },

    #[error("output path prefix conflict: {shorter} (from {first}) is a prefix of {longer} (from {second})")]
    PrefixConflict {
        shorter: ExecPath,
        longer: ExecPath,
        first: ActionRef,
        second: ActionRef,
    },

    #[error("{action}: missing mandatory input {path}")]
    MissingInput { action: ActionRef, path: ExecPath },

    #[error("missing source file: {path}")]
    SourceFileMissing { path: ExecPath },

    #[error("{action}: declared output {path} was not created{detail}")]
    OutputMissing {
        action: ActionRef,
        path: ExecPath,
        /// Distinguishes a plain missing file from a dangling symlink or an
        /// entirely absent tree directory.
        detail: String,
    },

    #[error("{action}: action failed with exit code {code:?}")]
    ActionExited { action: ActionRef, code: i32 },

    #[error("cycle detected: {}", ring.join(" -> "))]
    Cycle { ring: Vec<String> },

    #[error("target not found: {0}")]
    TargetNotFound(String),

    #[error("configuration error: {0}")]
    Config(String),

    // ---- transient execution errors ----
    #[error("{action}: process died with signal {signal}")]
    ActionSignaled { action: ActionRef, signal: i32 },

    #[error("{action}: timed out after {after:?}")]
    Timeout { action: ActionRef, after: Duration },

    #[error("{action}: failed to spawn: {message}")]
    SpawnFailed { action: ActionRef, message: String },

    // ---- lost inputs ----
    #[error("{action}: lost inputs: {}", lost.iter().map(|p| p.as_str()).collect::<Vec<_>>().join(", "))]
    LostInputs {
        action: ActionRef,
        lost: Vec<ExecPath>,
    },

    #[error("{action}: input {path} was lost and cannot be regenerated (source file)")]
    LostSourceInput { action: ActionRef, path: ExecPath },

    #[error("{action}: rewind budget exhausted after {attempts} attempts")]
    RewindExhausted { action: ActionRef, attempts: u32 },

    // ---- propagation ----
    #[error("dependency {dep} failed: {cause}")]
    DepFailed { dep: String, cause: Arc<AnvilError> },

    #[error("evaluation cancelled")]
    Cancelled,

    // ---- internal ----
    #[error("{key}: restarted {restarts} times without quiescing")]
    RestartBudgetExceeded { key: String, restarts: u32 },

    #[error("internal error: {0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("action cache corrupt: {0}")]
    CacheCorrupt(String),

    // ---- infrastructure ----
    #[error("catastrophic failure: {0}")]
    Catastrophe(String),
}

impl AnvilError {
    pub fn category(&self) -> ErrorCategory {
        use AnvilError::*;
        match self {
            DuplicateOutput { .. }
            | PrefixConflict { .. }
            | MissingInput { .. }
            | SourceFileMissing { .. }
            | OutputMissing { .. }
            | ActionExited { .. }
            | Cycle { .. }
            | TargetNotFound(_)
            | Config(_) => ErrorCategory::User,
            ActionSignaled { .. } | Timeout { .. } | SpawnFailed { .. } => {
                ErrorCategory::TransientExecution
            }
            LostInputs { .. } => ErrorCategory::LostInputs,
            // An exhausted rewind or a lost source file cannot be helped by
            // retrying; they surface as user-visible failures.
            LostSourceInput { .. } | RewindExhausted { .. } => ErrorCategory::User,
            DepFailed { cause, .. } => cause.category(),
            Cancelled | RestartBudgetExceeded { .. } | Internal(_) | Io(_) | Serialization(_)
            | CacheCorrupt(_) => ErrorCategory::Internal,
            Catastrophe(_) => ErrorCategory::Catastrophe,
        }
    }

    pub fn persistence(&self) -> Persistence {
        match self.category() {
            ErrorCategory::User => Persistence::Persistent,
            ErrorCategory::TransientExecution | ErrorCategory::LostInputs => Persistence::Transient,
            ErrorCategory::Internal | ErrorCategory::Catastrophe => Persistence::Persistent,
        }
    }

    /// Persistent user errors are remembered on the node across builds so
    /// repeated requests do not re-run known-failing actions.
    pub fn cacheable_across_builds(&self) -> bool {
        self.category() == ErrorCategory::User
    }

    pub fn dep_failed(dep: impl std::fmt::Display, cause: AnvilError) -> AnvilError {
        // Collapse chains: surface the root cause, not a tower of wrappers.
        let cause = match cause {
            AnvilError::DepFailed { cause, .. } => cause,
            other => Arc::new(other),
        };
        AnvilError::DepFailed {
            dep: dep.to_string(),
            cause,
        }
    }

    /// The root failure underneath any propagation wrappers.
    pub fn root_cause(&self) -> &AnvilError {
        match self {
            AnvilError::DepFailed { cause, .. } => cause.root_cause(),
            other => other,
        }
    }
}

impl From<std::io::Error> for AnvilError {
    fn from(e: std::io::Error) -> Self {
        AnvilError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for AnvilError {
    fn from(e: serde_json::Error) -> Self {
        AnvilError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AnvilError>;

use crate::error::{AnvilError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Engine-wide configuration. All knobs have working defaults; a TOML file
/// may override any subset.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Evaluator worker parallelism. Defaults to the CPU count.
    pub workers: usize,
    /// Visit unrelated subtrees after the first error instead of draining.
    pub keep_going: bool,
    /// Stripe count for the output-directory preparation locks.
    pub dir_lock_stripes: usize,
    /// Maximum missing-dep restarts of a single node per build.
    pub restart_budget: u32,
    /// Maximum rewind attempts per action per build.
    pub rewind_budget: u32,
    /// Grace between SIGTERM and SIGKILL when cancelling a subprocess.
    pub sigterm_grace_ms: u64,
    /// Root of all persisted state (cache, outputs, graph snapshot).
    pub output_base: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            keep_going: false,
            dir_lock_stripes: 64,
            restart_budget: 20,
            rewind_budget: 5,
            sigterm_grace_ms: 2000,
            output_base: PathBuf::from("anvil-out"),
        }
    }
}

impl EngineConfig {
    pub fn with_output_base(mut self, output_base: impl Into<PathBuf>) -> Self {
        self.output_base = output_base.into();
        self
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| AnvilError::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn sigterm_grace(&self) -> Duration {
        Duration::from_millis(self.sigterm_grace_ms)
    }

    // Persisted state layout under the output base.

    pub fn action_cache_dir(&self) -> PathBuf {
        self.output_base.join("action_cache")
    }

    pub fn action_cache_file(&self) -> PathBuf {
        self.action_cache_dir().join("cache.bin")
    }

    pub fn action_outputs_dir(&self) -> PathBuf {
        self.output_base.join("action_outputs")
    }

    pub fn graph_dir(&self) -> PathBuf {
        self.output_base.join("graph")
    }

    pub fn graph_snapshot_file(&self) -> PathBuf {
        self.graph_dir().join("snapshot.bin")
    }

    pub fn rewind_log_file(&self) -> PathBuf {
        self.output_base.join("rewind.log")
    }

    /// Execution root where action inputs are read and outputs written.
    pub fn exec_root(&self) -> PathBuf {
        self.output_base.join("execroot")
    }
}

/// Crash reports are suppressed under test runners, keyed off `TEST_TMPDIR`.
pub fn crash_reports_enabled() -> bool {
    std::env::var_os("TEST_TMPDIR").is_none()
}

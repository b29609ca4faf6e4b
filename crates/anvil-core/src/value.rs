use crate::types::{Digest, ExecPath};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Filesystem state of one source file. Non-hermetic: recomputed every
/// build. Carries metadata as well as the content digest so that a metadata
/// change re-checks downstream consumers, which then prune on unchanged
/// content digests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStateValue {
    pub digest: Digest,
    pub size: u64,
    pub mtime_nanos: u64,
    pub exists: bool,
}

impl FileStateValue {
    pub fn missing() -> Self {
        FileStateValue {
            digest: Digest::ZERO,
            size: 0,
            mtime_nanos: 0,
            exists: false,
        }
    }
}

/// Content digest and metadata of one materialized artifact. For source
/// artifacts `mtime_nanos` carries the file's timestamp, so a metadata-only
/// touch re-checks consumers (which then hit the action cache on the
/// unchanged content digest); derived artifacts pin it to zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactValue {
    pub digest: Digest,
    pub size: u64,
    pub mtime_nanos: u64,
}

impl ArtifactValue {
    pub fn derived(digest: Digest, size: u64) -> Self {
        ArtifactValue {
            digest,
            size,
            mtime_nanos: 0,
        }
    }
}

/// The value of an action-execution node: what the action produced.
///
/// Equality drives change-pruning and deliberately ignores `from_cache` and
/// timing: an action that re-ran but produced identical outputs must not
/// dirty its consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResultValue {
    pub outputs: BTreeMap<ExecPath, ArtifactValue>,
    pub discovered_inputs: Vec<ExecPath>,
    pub from_cache: bool,
    pub elapsed_nanos: u64,
}

impl PartialEq for ActionResultValue {
    fn eq(&self, other: &Self) -> bool {
        self.outputs == other.outputs && self.discovered_inputs == other.discovered_inputs
    }
}

impl Eq for ActionResultValue {}

/// An ordered, duplicate-free set of artifact paths forwarded by an
/// aggregating action (runfiles and middleman expansions). Duplicate entries
/// are rejected at construction so that iteration order can never mask one
/// entry with another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationValue {
    entries: Vec<ExecPath>,
}

impl AggregationValue {
    pub fn new(entries: Vec<ExecPath>) -> Result<Self, String> {
        let mut seen = std::collections::HashSet::with_capacity(entries.len());
        for e in &entries {
            if !seen.insert(e.clone()) {
                return Err(format!("duplicate aggregation entry: {e}"));
            }
        }
        Ok(AggregationValue { entries })
    }

    pub fn entries(&self) -> &[ExecPath] {
        &self.entries
    }

    pub fn contains(&self, path: &ExecPath) -> bool {
        self.entries.iter().any(|e| e == path)
    }
}

/// The value computed for a graph key. One variant per key family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    FileState(FileStateValue),
    Artifact(ArtifactValue),
    ActionResult(Arc<ActionResultValue>),
    EnvVar(Option<String>),
    /// The digests of a top-level target's requested artifacts.
    TopLevel(Arc<BTreeMap<ExecPath, Digest>>),
}

impl Value {
    pub fn as_file_state(&self) -> Option<&FileStateValue> {
        match self {
            Value::FileState(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_artifact(&self) -> Option<&ArtifactValue> {
        match self {
            Value::Artifact(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_action_result(&self) -> Option<&Arc<ActionResultValue>> {
        match self {
            Value::ActionResult(v) => Some(v),
            _ => None,
        }
    }
}

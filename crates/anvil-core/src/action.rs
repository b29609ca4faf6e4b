use crate::key::Key;
use crate::types::{Digest, DigestWriter, ExecPath};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Well-known execution-requirement keys.
pub mod requirements {
    pub const NO_REMOTE: &str = "no-remote";
    pub const REQUIRES_NETWORK: &str = "requires-network";
    /// Per-action timeout in whole seconds.
    pub const TIMEOUT: &str = "timeout";
    /// Exec path of the newline-separated dependency file the command
    /// writes, for actions that discover inputs at run time.
    pub const DEPFILE: &str = "depfile";
}

/// Who declared an action: a label plus the fingerprint of the configuration
/// it was analyzed under. Two owners with the same label but different
/// configurations are distinct.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActionOwner {
    pub label: String,
    pub config_digest: Digest,
}

impl ActionOwner {
    pub fn new(label: impl Into<String>, config_digest: Digest) -> Self {
        Self {
            label: label.into(),
            config_digest,
        }
    }
}

impl fmt::Display for ActionOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArtifactKind {
    /// A regular file output.
    File,
    /// A symlink output; may legitimately dangle only if declared optional.
    Symlink,
    /// A directory output whose contents are determined at execution time.
    Tree,
}

/// A declared file-like output, identified by its exec path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Artifact {
    pub path: ExecPath,
    pub kind: ArtifactKind,
}

impl Artifact {
    pub fn file(path: ExecPath) -> Self {
        Artifact {
            path,
            kind: ArtifactKind::File,
        }
    }

    pub fn symlink(path: ExecPath) -> Self {
        Artifact {
            path,
            kind: ArtifactKind::Symlink,
        }
    }

    pub fn tree(path: ExecPath) -> Self {
        Artifact {
            path,
            kind: ArtifactKind::Tree,
        }
    }
}

/// One build action: an opaque command from declared inputs to declared
/// outputs. The engine never interprets the command; determinism is the
/// caller's contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub owner: ActionOwner,
    /// Index of this action within its owner's action-lookup node.
    pub index: u32,
    /// Short category name, e.g. `CppCompile`.
    pub mnemonic: String,
    /// The distinguished output used for single-flight deduplication.
    pub primary_output: Artifact,
    /// Additional declared outputs, not including the primary.
    pub outputs: Vec<Artifact>,
    /// Outputs that may legitimately be absent after execution.
    pub optional_outputs: Vec<Artifact>,
    /// Mandatory inputs; must exist before execution.
    pub inputs: Vec<ExecPath>,
    /// Whether the action may consume inputs beyond the declared set,
    /// discovered at run time (e.g. scanned headers).
    pub discovers_inputs: bool,
    /// argv; empty for zero-work middleman actions.
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub execution_requirements: BTreeMap<String, String>,
    /// Whether an identical action from another owner may be coalesced with
    /// this one at execution.
    pub shareable: bool,
    /// An aggregator that forwards rather than copies its inputs; rewinding
    /// through it must pull in its whole non-source input closure.
    pub insensitive_propagator: bool,
}

impl Action {
    pub fn new(owner: ActionOwner, index: u32, mnemonic: impl Into<String>, primary: Artifact) -> Self {
        Action {
            owner,
            index,
            mnemonic: mnemonic.into(),
            primary_output: primary,
            outputs: Vec::new(),
            optional_outputs: Vec::new(),
            inputs: Vec::new(),
            discovers_inputs: false,
            command: Vec::new(),
            env: BTreeMap::new(),
            execution_requirements: BTreeMap::new(),
            shareable: false,
            insensitive_propagator: false,
        }
    }

    pub fn with_command<I, S>(mut self, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = argv.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_inputs(mut self, inputs: Vec<ExecPath>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_outputs(mut self, outputs: Vec<Artifact>) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_requirement(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.execution_requirements.insert(key.into(), value.into());
        self
    }

    pub fn shareable(mut self) -> Self {
        self.shareable = true;
        self
    }

    /// All declared outputs, primary first, optional last.
    pub fn all_outputs(&self) -> impl Iterator<Item = &Artifact> {
        std::iter::once(&self.primary_output)
            .chain(self.outputs.iter())
            .chain(self.optional_outputs.iter())
    }

    /// Outputs whose absence after execution is an error.
    pub fn mandatory_outputs(&self) -> impl Iterator<Item = &Artifact> {
        std::iter::once(&self.primary_output).chain(self.outputs.iter())
    }

    /// Zero-work aggregation action: nothing to spawn.
    pub fn is_middleman(&self) -> bool {
        self.command.is_empty()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.execution_requirements
            .get(requirements::TIMEOUT)
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
    }

    /// The dep file announced by an input-discovering action, if any.
    pub fn depfile(&self) -> Option<ExecPath> {
        self.execution_requirements
            .get(requirements::DEPFILE)
            .and_then(|s| ExecPath::new(s.as_str()).ok())
    }

    pub fn with_discovered_inputs(mut self, depfile: &str) -> Self {
        self.discovers_inputs = true;
        self.execution_requirements
            .insert(requirements::DEPFILE.to_string(), depfile.to_string());
        self
    }

    /// Content fingerprint of the action's identity: owner, mnemonic,
    /// command, environment, declared outputs and execution requirements.
    /// Input *digests* are deliberately excluded; they enter the cache
    /// request fingerprint instead.
    pub fn action_key(&self) -> Digest {
        let mut w = DigestWriter::new();
        w.str(&self.owner.label)
            .digest(&self.owner.config_digest)
            .str(&self.mnemonic);
        w.u32(self.command.len() as u32);
        for arg in &self.command {
            w.str(arg);
        }
        w.u32(self.env.len() as u32);
        for (k, v) in &self.env {
            w.str(k).str(v);
        }
        let outputs: Vec<&Artifact> = self.all_outputs().collect();
        w.u32(outputs.len() as u32);
        for out in outputs {
            w.str(out.path.as_str());
        }
        w.u32(self.execution_requirements.len() as u32);
        for (k, v) in &self.execution_requirements {
            w.str(k).str(v);
        }
        w.finish()
    }

    pub fn execution_key(&self) -> Key {
        Key::action_execution(self.owner.clone(), self.index)
    }

    pub fn action_ref(&self) -> ActionRef {
        ActionRef {
            owner: self.owner.label.clone(),
            mnemonic: self.mnemonic.clone(),
            primary_output: self.primary_output.path.clone(),
        }
    }
}

/// Lightweight, displayable handle on an action, used in events and error
/// messages. Carries the rule location (owner label) per the reporting
/// contract for failed actions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionRef {
    pub owner: String,
    pub mnemonic: String,
    pub primary_output: ExecPath,
}

impl fmt::Display for ActionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.mnemonic, self.primary_output, self.owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner() -> ActionOwner {
        ActionOwner::new("//pkg:lib", Digest::of_bytes(b"cfg"))
    }

    fn out(p: &str) -> Artifact {
        Artifact::file(ExecPath::new(p).unwrap())
    }

    #[test]
    fn action_key_is_stable() {
        let a = Action::new(owner(), 0, "Compile", out("out/a.o"))
            .with_command(["cc", "-c", "a.c"])
            .with_env("PATH", "/usr/bin");
        assert_eq!(a.action_key(), a.clone().action_key());
    }

    #[test]
    fn action_key_depends_on_command_and_env() {
        let base = Action::new(owner(), 0, "Compile", out("out/a.o")).with_command(["cc", "-c"]);
        let other_cmd = base.clone().with_command(["cc", "-O2", "-c"]);
        let other_env = base.clone().with_env("CC_LOG", "1");
        assert_ne!(base.action_key(), other_cmd.action_key());
        assert_ne!(base.action_key(), other_env.action_key());
    }

    #[test]
    fn timeout_parses_from_requirements() {
        let a = Action::new(owner(), 0, "Slow", out("out/x"))
            .with_requirement(requirements::TIMEOUT, "30");
        assert_eq!(a.timeout(), Some(Duration::from_secs(30)));
        let b = Action::new(owner(), 0, "Fast", out("out/y"));
        assert_eq!(b.timeout(), None);
    }

    #[test]
    fn middleman_is_commandless() {
        assert!(Action::new(owner(), 0, "Middleman", out("out/mm")).is_middleman());
    }
}

use crate::action::ActionOwner;
use crate::types::ExecPath;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Identifies which registered function produces the value for a key.
/// Dispatch is a table lookup in the function registry; there is exactly one
/// variant per key family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FunctionName {
    /// Filesystem state of a source file. Non-hermetic.
    FileState,
    /// Content digest and metadata of one artifact, source or derived.
    Artifact,
    /// Execution of one action inside an action-lookup node.
    ActionExecution,
    /// An environment variable read registered by the caller. Non-hermetic.
    EnvVar,
    /// A requested top-level target; fans out to its declared artifacts.
    TopLevel,
}

impl fmt::Display for FunctionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FunctionName::FileState => "FileState",
            FunctionName::Artifact => "Artifact",
            FunctionName::ActionExecution => "ActionExecution",
            FunctionName::EnvVar => "EnvVar",
            FunctionName::TopLevel => "TopLevel",
        };
        f.write_str(s)
    }
}

/// The immutable, hashable argument half of a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum KeyArg {
    FileState(PathBuf),
    Artifact(ExecPath),
    ActionExecution { owner: ActionOwner, index: u32 },
    EnvVar(String),
    TopLevel(String),
}

/// A graph key: `(functionName, argument)`. Keys are equal iff both parts
/// are equal; the argument variant must match the function name, which the
/// constructors below guarantee. The ordering is what multi-node writers
/// lock in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Key {
    function: FunctionName,
    arg: KeyArg,
}

impl Key {
    pub fn file_state(path: impl Into<PathBuf>) -> Key {
        Key {
            function: FunctionName::FileState,
            arg: KeyArg::FileState(path.into()),
        }
    }

    pub fn artifact(path: ExecPath) -> Key {
        Key {
            function: FunctionName::Artifact,
            arg: KeyArg::Artifact(path),
        }
    }

    pub fn action_execution(owner: ActionOwner, index: u32) -> Key {
        Key {
            function: FunctionName::ActionExecution,
            arg: KeyArg::ActionExecution { owner, index },
        }
    }

    pub fn env_var(name: impl Into<String>) -> Key {
        Key {
            function: FunctionName::EnvVar,
            arg: KeyArg::EnvVar(name.into()),
        }
    }

    pub fn top_level(target: impl Into<String>) -> Key {
        Key {
            function: FunctionName::TopLevel,
            arg: KeyArg::TopLevel(target.into()),
        }
    }

    pub fn function(&self) -> FunctionName {
        self.function
    }

    pub fn arg(&self) -> &KeyArg {
        &self.arg
    }

    pub fn is_action_execution(&self) -> bool {
        self.function == FunctionName::ActionExecution
    }

    pub fn is_artifact(&self) -> bool {
        self.function == FunctionName::Artifact
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.arg {
            KeyArg::FileState(p) => write!(f, "FileState({})", p.display()),
            KeyArg::Artifact(p) => write!(f, "Artifact({p})"),
            KeyArg::ActionExecution { owner, index } => {
                write!(f, "ActionExecution({owner} #{index})")
            }
            KeyArg::EnvVar(n) => write!(f, "EnvVar({n})"),
            KeyArg::TopLevel(t) => write!(f, "TopLevel({t})"),
        }
    }
}

pub mod critical_path;
pub mod executor;
pub mod functions;
pub mod outputs;
pub mod registry;
pub mod rewind;
pub mod session;
pub mod spawn;

pub use critical_path::CriticalPathTracker;
pub use executor::{ActionExecutor, ExecStats, ExecutedAction};
pub use functions::{
    ActionExecutionFunction, ArtifactFunction, EnvVarFunction, FileStateFunction, TopLevelFunction,
};
pub use outputs::{prepare_output_dirs, validate_outputs, StripedLocks};
pub use registry::ActionRegistry;
pub use rewind::{RewindPlan, RewindPlanner};
pub use session::{BuildOutcome, BuildSession};
pub use spawn::{run_command, SpawnOutcome};

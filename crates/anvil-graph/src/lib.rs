pub mod cycles;
pub mod eval;
pub mod functions;
pub mod node;
pub mod snapshot;
pub mod store;

pub use eval::{EvalEnv, EvalOptions, EvalResult, EvalStats, Evaluator};
pub use functions::{BuildFunction, FunctionRegistry, Step};
pub use node::{DirtyState, Node};
pub use snapshot::{load_or_cold, GraphSnapshot};
pub use store::{GraphStore, InvalidationResult, NodePlan};

use crate::eval::EvalEnv;
use anvil_core::{FunctionName, Key, Result, Value};
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// What one invocation of a function produced.
#[derive(Debug, Clone)]
pub enum Step {
    Done(Value),
    /// The function requested keys that were not yet available and expects
    /// to be re-invoked once they are. The listed keys are the unavailable
    /// subset, in request order.
    NeedsDeps(Vec<Key>),
}

/// A keyed function: given its key and the evaluation environment, produce
/// a value, a missing-dependency signal, or a typed failure.
///
/// Implementations must be restartable: any invocation may be thrown away
/// after a `NeedsDeps` return and repeated later with more dependencies
/// available. All dependency access goes through the environment so the
/// evaluator can record it.
#[async_trait]
pub trait BuildFunction: Send + Sync {
    fn name(&self) -> FunctionName;

    /// Hermetic functions depend only on their declared dependencies and
    /// are eligible for cross-build reuse. Non-hermetic functions (readers
    /// of filesystem or environment state) are recomputed every build, once.
    fn hermetic(&self) -> bool {
        true
    }

    async fn compute(&self, key: &Key, env: &EvalEnv) -> Result<Step>;
}

/// Table-dispatch registry of functions, keyed by `FunctionName`.
#[derive(Default)]
pub struct FunctionRegistry {
    table: FxHashMap<FunctionName, Arc<dyn BuildFunction>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, function: Arc<dyn BuildFunction>) {
        self.table.insert(function.name(), function);
    }

    pub fn get(&self, name: FunctionName) -> Option<Arc<dyn BuildFunction>> {
        self.table.get(&name).cloned()
    }
}

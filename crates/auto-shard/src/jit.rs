//! Graph-mode entry points memoized per callable.
//!
//! The shard site caches closures by full strategy. Underneath it sits a second,
//! independent layer keyed only by the callable's identity: one [`GraphFunction`] per
//! function, shared by every shard site and strategy that targets it. The executor behind
//! it is responsible for specializing graphs on argument signatures.

use std::sync::{Arc, Mutex, PoisonError};
use std::sync::atomic::{AtomicUsize, Ordering};

use hashbrown::HashMap;

use crate::error::ExecutionError;
use crate::function::{Function, FunctionId, FunctionRef};
use crate::strategy::StrategyDescriptor;
use crate::tensor::TensorMeta;

/// Graph compiler and executor consumed by the shard layer.
///
/// `compile_and_run` lowers `function` under `strategy` for the signature of `args`
/// (reusing an earlier specialization when there is one), runs it, and returns the
/// outputs. It is synchronous and may block for as long as compilation takes.
pub trait GraphExecutor: Send + Sync + 'static {
    /// Tensor type the executor runs on.
    type Tensor: TensorMeta + Clone + Send + Sync + 'static;

    /// Compiles or reuses the specialization for `args` and runs it.
    fn compile_and_run(
        &self,
        strategy: &StrategyDescriptor,
        function: &FunctionRef<Self::Tensor>,
        args: &[Self::Tensor],
    ) -> Result<Vec<Self::Tensor>, ExecutionError>;
}

/// Graph-mode wrapper of one callable.
pub struct GraphFunction<E: GraphExecutor> {
    function: FunctionRef<E::Tensor>,
    executor: Arc<E>,
    calls: AtomicUsize,
}

impl<E: GraphExecutor> GraphFunction<E> {
    /// The wrapped callable.
    pub fn function(&self) -> &FunctionRef<E::Tensor> {
        &self.function
    }

    /// Runs the wrapped function under `strategy`.
    ///
    /// The function itself travels as the leading argument of the graph call so that the
    /// executor can key its specializations on it.
    pub fn call(&self, strategy: &StrategyDescriptor, args: &[E::Tensor]) -> Result<Vec<E::Tensor>, ExecutionError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.executor.compile_and_run(strategy, &self.function, args)
    }

    /// Number of graph calls made through this wrapper.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

/// Per-identity cache of [`GraphFunction`]s over one executor.
///
/// Entries keep their function alive, so an identity is never reused while it is cached.
/// Nothing is evicted; the cache grows with every distinct function until
/// [`clear`](GraphFunctionCache::clear).
pub struct GraphFunctionCache<E: GraphExecutor> {
    executor: Arc<E>,
    functions: Mutex<HashMap<FunctionId, Arc<GraphFunction<E>>>>,
}

impl<E: GraphExecutor> GraphFunctionCache<E> {
    /// Empty cache dispatching to `executor`.
    pub fn new(executor: Arc<E>) -> Self {
        Self {
            executor,
            functions: Mutex::new(HashMap::new()),
        }
    }

    /// Executor the wrappers dispatch to.
    pub fn executor(&self) -> &Arc<E> {
        &self.executor
    }

    /// Returns the wrapper of `function`, creating it on first use.
    pub fn get_or_create(&self, function: &FunctionRef<E::Tensor>) -> Arc<GraphFunction<E>> {
        let id = FunctionId::of(function);
        let mut functions = self.functions.lock().unwrap_or_else(PoisonError::into_inner);
        functions
            .entry(id)
            .or_insert_with(|| {
                log::debug!("Creating graph function for '{}' ({id})", function.name());
                Arc::new(GraphFunction {
                    function: function.clone(),
                    executor: self.executor.clone(),
                    calls: AtomicUsize::new(0),
                })
            })
            .clone()
    }

    /// Number of cached functions.
    pub fn len(&self) -> usize {
        self.functions.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Returns `true` if no function is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every wrapper, releasing the functions they hold.
    pub fn clear(&self) {
        self.functions.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

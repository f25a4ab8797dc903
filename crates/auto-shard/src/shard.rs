//! Shard sites: the strategy cache and the validating entry point.

use core::fmt;
use std::sync::Arc;

use crate::context::{ContextService, DatasetStrategy, ExecutionMode, ParallelMode, SearchMode};
use crate::error::{ConfigurationError, ExecutionError, ShardError};
use crate::function::{Function, FunctionId, FunctionRef};
use crate::jit::{GraphExecutor, GraphFunction, GraphFunctionCache};
use crate::strategy::{ShardArgs, StrategyDescriptor};

/// Distributed-execution closure returned by a shard site.
///
/// Calling it runs the bound function under the bound strategy through the graph
/// executor. It has the calling convention of the function it wraps.
pub struct ShardFn<E: GraphExecutor> {
    strategy: StrategyDescriptor,
    graph: Arc<GraphFunction<E>>,
}

impl<E: GraphExecutor> ShardFn<E> {
    /// Runs the sharded function. Executor and function errors are returned unchanged.
    pub fn call(&self, args: &[E::Tensor]) -> Result<Vec<E::Tensor>, ExecutionError> {
        self.graph.call(&self.strategy, args)
    }

    /// Strategy this closure was built for.
    pub fn strategy(&self) -> &StrategyDescriptor {
        &self.strategy
    }

    /// The wrapped function.
    pub fn function(&self) -> &FunctionRef<E::Tensor> {
        self.graph.function()
    }
}

impl<E: GraphExecutor> fmt::Debug for ShardFn<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardFn")
            .field("function", &self.function().name())
            .field("strategy", &self.strategy)
            .finish()
    }
}

/// Cache entry of a shard site.
struct ShardBinding<E: GraphExecutor> {
    function: FunctionRef<E::Tensor>,
    strategy: StrategyDescriptor,
    shard_fn: Arc<ShardFn<E>>,
}

impl<E: GraphExecutor> ShardBinding<E> {
    fn matches(&self, function: &FunctionRef<E::Tensor>, strategy: &StrategyDescriptor) -> bool {
        FunctionId::of(&self.function) == FunctionId::of(function) && self.strategy == *strategy
    }
}

/// One shard site.
///
/// A site remembers the last function and strategy it was asked for and the closure it
/// built for them. Asking again for the same pair returns the very same closure; asking
/// for anything else replaces it. Only one closure is alive per site.
///
/// A site is driven by one thread at a time, which `&mut self` enforces. Sites can share
/// a [`GraphFunctionCache`] through [`Shard::with_graph_cache`].
///
/// # Example
///
/// ```rust
/// # use std::sync::Arc;
/// # use auto_shard::*;
/// let context = Arc::new(ParallelContext::new(ContextConfig::sharding_propagation(DeviceTarget::Ascend, 2)));
/// let executor = Arc::new(HostExecutor::new(context.clone()));
/// let mut site = Shard::new(context, executor);
///
/// let add = from_fn("add", |args: &[HostTensor]| Ok(vec![&args[0] + &args[1]]));
/// let sharded = site.apply(&add, ShardArgs::new(((2, 1), (2, 1)))).unwrap();
///
/// let x = HostTensor::ones(vec![32, 10]);
/// let outputs = sharded.call(&[x.clone(), x]).unwrap();
/// assert_eq!(outputs[0], HostTensor::from_elem(vec![32, 10], 2.0));
/// ```
pub struct Shard<E: GraphExecutor> {
    context: Arc<dyn ContextService>,
    graphs: Arc<GraphFunctionCache<E>>,
    binding: Option<ShardBinding<E>>,
    compilations: usize,
}

impl<E: GraphExecutor> Shard<E> {
    /// Creates an empty site with its own graph-function cache over `executor`.
    pub fn new(context: Arc<dyn ContextService>, executor: Arc<E>) -> Self {
        Self::with_graph_cache(context, Arc::new(GraphFunctionCache::new(executor)))
    }

    /// Creates an empty site that shares `graphs` with other sites.
    ///
    /// The cache only grows: it holds every function any of its sites has bound until
    /// [`GraphFunctionCache::clear`] is called.
    pub fn with_graph_cache(context: Arc<dyn ContextService>, graphs: Arc<GraphFunctionCache<E>>) -> Self {
        Self {
            context,
            graphs,
            binding: None,
            compilations: 0,
        }
    }

    /// Validates the context and `args`, applies the global overrides sharding needs, and
    /// returns the closure for `function` under the resulting strategy.
    ///
    /// Nothing is mutated when validation fails: the context keeps its flags and the
    /// site keeps its previous closure.
    pub fn apply(&mut self, function: &FunctionRef<E::Tensor>, args: ShardArgs) -> Result<Arc<ShardFn<E>>, ShardError> {
        if function.as_parameter_bearing().is_none() {
            log::warn!(
                "'{}' is not a parameter-bearing unit and its definition cannot involve parameters; \
                 otherwise, the result may be incorrect.",
                function.name()
            );
        }

        self.check_context()?;
        let strategy = args.validate()?;
        self.override_context();

        Ok(self.obtain(function, strategy))
    }

    /// Returns the cached closure when `(function, strategy)` matches the binding, and
    /// builds a new one otherwise.
    pub fn obtain(&mut self, function: &FunctionRef<E::Tensor>, strategy: StrategyDescriptor) -> Arc<ShardFn<E>> {
        if let Some(binding) = &self.binding {
            if binding.matches(function, &strategy) {
                log::debug!("Reusing sharded '{}'", function.name());
                return binding.shard_fn.clone();
            }
        }

        let shard_fn = self.trigger(function, &strategy);
        self.binding = Some(ShardBinding {
            function: function.clone(),
            strategy,
            shard_fn: shard_fn.clone(),
        });
        shard_fn
    }

    /// Strategy of the current binding.
    pub fn strategy(&self) -> Option<&StrategyDescriptor> {
        self.binding.as_ref().map(|binding| &binding.strategy)
    }

    /// Closure of the current binding.
    pub fn shard_fn(&self) -> Option<&Arc<ShardFn<E>>> {
        self.binding.as_ref().map(|binding| &binding.shard_fn)
    }

    /// Number of closures this site has built.
    pub fn compilations(&self) -> usize {
        self.compilations
    }

    /// Graph-function cache the site dispatches through.
    pub fn graphs(&self) -> &Arc<GraphFunctionCache<E>> {
        &self.graphs
    }

    fn check_context(&self) -> Result<(), ConfigurationError> {
        let mode = self.context.execution_mode();
        if mode != ExecutionMode::Pynative {
            return Err(ConfigurationError::ExecutionMode { mode });
        }
        let mode = self.context.parallel_mode();
        if mode != ParallelMode::AutoParallel {
            return Err(ConfigurationError::ParallelMode { mode });
        }
        let mode = self.context.search_mode();
        if mode != SearchMode::ShardingPropagation {
            return Err(ConfigurationError::SearchMode { mode });
        }
        let device = self.context.device_target();
        if !device.is_shardable() {
            return Err(ConfigurationError::DeviceTarget { device });
        }
        Ok(())
    }

    fn override_context(&self) {
        if self.context.fully_use_devices() {
            log::warn!(
                "After calling 'shard', the algorithm parameter 'fully_use_devices' will be overwritten as False."
            );
            self.context.set_fully_use_devices(false);
        }

        if !self.context.full_batch_is_set() {
            log::warn!(
                "When calling the shard interface, 'dataset_strategy' or 'full_batch' is not manually set by the user, \
                 and the 'dataset_strategy' will be set to 'full_batch'."
            );
            self.context.set_dataset_strategy(DatasetStrategy::FullBatch);
        }
    }

    fn trigger(&mut self, function: &FunctionRef<E::Tensor>, strategy: &StrategyDescriptor) -> Arc<ShardFn<E>> {
        self.compilations += 1;

        if let Some(bearing) = function.as_parameter_bearing() {
            for parameter in bearing.trainable_parameters() {
                parameter.set_in_shard(true);
            }
        }

        log::debug!("Binding '{}' to a new sharding strategy", function.name());
        Arc::new(ShardFn {
            strategy: strategy.clone(),
            graph: self.graphs.get_or_create(function),
        })
    }
}

/// Shards `function` at a fresh site.
///
/// Every call builds a new closure; keep a [`Shard`] around to reuse closures across
/// calls.
pub fn shard<E: GraphExecutor>(
    context: Arc<dyn ContextService>,
    executor: Arc<E>,
    function: &FunctionRef<E::Tensor>,
    args: ShardArgs,
) -> Result<Arc<ShardFn<E>>, ShardError> {
    Shard::new(context, executor).apply(function, args)
}

//! Reference [`GraphExecutor`] that plans layouts on a simulated mesh and runs on the host.
//!
//! Compilation resolves every input and planned parameter to a [`ShardedTensor`] over
//! `device_num` devices and rejects layouts the mesh cannot realise. Execution then runs
//! the function once over the global tensors, which is what the distributed program
//! computes as a whole.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use hashbrown::HashMap;

use crate::context::ContextService;
use crate::error::ExecutionError;
use crate::function::{Function, FunctionId, FunctionRef};
use crate::jit::GraphExecutor;
use crate::sharding::Layout;
use crate::strategy::StrategyDescriptor;
use crate::tensor::{HostTensor, ShardedTensor, TensorMeta, TensorSignature};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct SpecializationKey {
    function: FunctionId,
    signature: Vec<TensorSignature>,
    strategy: StrategyDescriptor,
}

/// A cached specialization and the function it was planned for.
///
/// Holding the function keeps its address, and so its [`FunctionId`], from being reused
/// by another function while the entry exists.
struct CachedGraph {
    _function: FunctionRef<HostTensor>,
    graph: Arc<CompiledGraph>,
}

/// Distribution plan of one specialization.
#[derive(Debug)]
pub struct CompiledGraph {
    device_num: usize,
    inputs: Vec<ShardedTensor<usize>>,
    parameters: Vec<(String, ShardedTensor<usize>)>,
}

impl CompiledGraph {
    /// Number of devices the plan spans.
    pub fn device_num(&self) -> usize {
        self.device_num
    }

    /// Placement of every input, in argument order.
    pub fn inputs(&self) -> &[ShardedTensor<usize>] {
        &self.inputs
    }

    /// Placement of every parameter named by the parameter plan, sorted by name.
    pub fn parameters(&self) -> &[(String, ShardedTensor<usize>)] {
        &self.parameters
    }
}

/// Host-side [`GraphExecutor`] over [`HostTensor`]s.
///
/// Specializations are cached per function, argument signature and strategy, and are
/// never evicted. Each entry keeps its function alive for the lifetime of the executor.
pub struct HostExecutor {
    context: Arc<dyn ContextService>,
    graphs: Mutex<HashMap<SpecializationKey, CachedGraph>>,
    compilations: AtomicUsize,
}

impl HostExecutor {
    /// Creates an executor that reads `device_num` from `context` at compile time.
    pub fn new(context: Arc<dyn ContextService>) -> Self {
        Self {
            context,
            graphs: Mutex::new(HashMap::new()),
            compilations: AtomicUsize::new(0),
        }
    }

    /// Number of specializations compiled so far.
    pub fn compilations(&self) -> usize {
        self.compilations.load(Ordering::Relaxed)
    }

    /// Compiles (or fetches) the specialization of `function` for `args`.
    pub fn compile(
        &self,
        strategy: &StrategyDescriptor,
        function: &FunctionRef<HostTensor>,
        args: &[HostTensor],
    ) -> Result<Arc<CompiledGraph>, ExecutionError> {
        let key = SpecializationKey {
            function: FunctionId::of(function),
            signature: args.iter().map(TensorMeta::signature).collect(),
            strategy: strategy.clone(),
        };
        if let Some(cached) = self.lock_graphs().get(&key) {
            return Ok(cached.graph.clone());
        }

        // The lock is not held while planning; a racing compilation of the same key
        // produces an identical plan and the first one stored wins.
        let graph = Arc::new(self.plan(strategy, function, args)?);
        self.compilations.fetch_add(1, Ordering::Relaxed);
        log::info!(
            "Compiled '{}' for {} input(s) over {} device(s)",
            function.name(),
            args.len(),
            graph.device_num
        );

        let mut graphs = self.lock_graphs();
        let cached = graphs.entry(key).or_insert_with(|| CachedGraph {
            _function: function.clone(),
            graph,
        });
        Ok(cached.graph.clone())
    }

    fn lock_graphs(&self) -> MutexGuard<'_, HashMap<SpecializationKey, CachedGraph>> {
        self.graphs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn plan(
        &self,
        strategy: &StrategyDescriptor,
        function: &FunctionRef<HostTensor>,
        args: &[HostTensor],
    ) -> Result<CompiledGraph, ExecutionError> {
        let device_num = self.context.device_num().ok_or(ExecutionError::DeviceNumNotSet)?;
        if strategy.in_strategy.len() != args.len() {
            return Err(ExecutionError::StrategyCountMismatch {
                inputs: args.len(),
                strategies: strategy.in_strategy.len(),
            });
        }

        let inputs = strategy
            .in_strategy
            .iter()
            .zip(args)
            .enumerate()
            .map(|(index, (layout, arg))| {
                let shape = TensorMeta::shape(arg);
                let layout = match layout {
                    Some(layout) if layout.rank() != shape.len() => {
                        return Err(ExecutionError::RankMismatch {
                            index,
                            rank: shape.len(),
                            layout_rank: layout.rank(),
                        });
                    }
                    Some(layout) => layout.clone(),
                    None => Layout::data_parallel(shape.len(), device_num),
                };
                ShardedTensor::new(shape, &layout, (0..device_num).collect())
            })
            .collect::<Result<Vec<_>, _>>()?;

        let parameters = match &strategy.parameter_plan {
            Some(plan) => plan_parameters(function, plan.iter(), device_num)?,
            None => Vec::new(),
        };

        Ok(CompiledGraph {
            device_num,
            inputs,
            parameters,
        })
    }
}

fn plan_parameters<'a>(
    function: &FunctionRef<HostTensor>,
    plan: impl Iterator<Item = (&'a str, &'a Layout)>,
    device_num: usize,
) -> Result<Vec<(String, ShardedTensor<usize>)>, ExecutionError> {
    let parameters = function
        .as_parameter_bearing()
        .map(|bearing| bearing.trainable_parameters())
        .unwrap_or_default();

    let mut planned = Vec::new();
    for (name, layout) in plan {
        let Some(parameter) = parameters.iter().find(|parameter| parameter.name() == name) else {
            log::warn!(
                "Parameter '{name}' in 'parameter_plan' is not a trainable parameter of '{}'; its layout is ignored",
                function.name()
            );
            continue;
        };
        if parameter.shape().len() != layout.rank() {
            return Err(ExecutionError::ParameterRankMismatch {
                name: name.to_owned(),
                rank: parameter.shape().len(),
                layout_rank: layout.rank(),
            });
        }
        let placement = ShardedTensor::new(parameter.shape(), layout, (0..device_num).collect())?;
        planned.push((name.to_owned(), placement));
    }
    Ok(planned)
}

impl GraphExecutor for HostExecutor {
    type Tensor = HostTensor;

    fn compile_and_run(
        &self,
        strategy: &StrategyDescriptor,
        function: &FunctionRef<HostTensor>,
        args: &[HostTensor],
    ) -> Result<Vec<HostTensor>, ExecutionError> {
        self.compile(strategy, function, args)?;
        function.call(args)
    }
}

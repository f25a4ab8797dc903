//! Execution and auto-parallel configuration consumed by the shard entry point.
//!
//! The framework keeps these knobs in process-wide state. Here they sit behind the
//! [`ContextService`] trait so that every shard site works against an injected instance,
//! and tests can hand each case its own [`ParallelContext`].

use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::sharding::Layout;

/// How operators are dispatched.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ExecutionMode {
    /// Ahead-of-time graph construction.
    #[default]
    Graph,
    /// Eager, per-op execution.
    Pynative,
}

/// Parallel execution mode of the auto-parallel context.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ParallelMode {
    /// Single device.
    #[default]
    StandAlone,
    /// Every device holds the whole model and a slice of the batch.
    DataParallel,
    /// Users annotate operators and the rest is derived.
    SemiAutoParallel,
    /// Strategies are searched automatically.
    AutoParallel,
    /// Users write the communication themselves.
    HybridParallel,
}

/// Strategy search algorithm used by auto-parallel.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SearchMode {
    /// Exhaustive cost-model search.
    #[default]
    DynamicProgramming,
    /// Fast heuristic search over repeated structures.
    RecursiveProgramming,
    /// Only anchors carry explicit layouts; the rest is inferred by propagation.
    ShardingPropagation,
}

/// Device class a computation targets.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, EnumString,
)]
pub enum DeviceTarget {
    /// Host processors.
    #[serde(rename = "CPU")]
    #[strum(serialize = "CPU")]
    Cpu,
    /// Graphics processors.
    #[serde(rename = "GPU")]
    #[strum(serialize = "GPU")]
    Gpu,
    /// Ascend neural processors.
    #[default]
    Ascend,
}

impl DeviceTarget {
    /// Device targets a shard site can run under.
    pub const SHARDABLE: [DeviceTarget; 2] = [DeviceTarget::Ascend, DeviceTarget::Gpu];

    /// Returns `true` if sharding is supported when the context targets this device.
    pub fn is_shardable(self) -> bool {
        Self::SHARDABLE.contains(&self)
    }
}

/// How the dataset feeds inputs to a parallel graph.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetStrategy {
    /// Every device receives the full batch.
    FullBatch,
    /// The batch is split along its first dimension.
    DataParallel,
    /// Explicit per-input layouts applied at the input stage.
    Layouts(Vec<Layout>),
}

/// Serializable snapshot of the context knobs.
///
/// Missing fields take their defaults when deserializing, so a JSON document only needs
/// the keys it changes:
///
/// ```rust
/// # use auto_shard::{ContextConfig, ParallelMode};
/// let config: ContextConfig = serde_json::from_str(r#"{"parallel_mode": "auto_parallel"}"#).unwrap();
/// assert_eq!(config.parallel_mode, ParallelMode::AutoParallel);
/// assert!(config.fully_use_devices);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Operator dispatch mode.
    pub mode: ExecutionMode,
    /// Device class the process runs on.
    pub device_target: DeviceTarget,
    /// Auto-parallel mode.
    pub parallel_mode: ParallelMode,
    /// Strategy search algorithm.
    pub search_mode: SearchMode,
    /// Number of devices in the parallel group. `None` until set explicitly.
    pub device_num: Option<usize>,
    /// Whether strategy search only considers strategies using every device.
    pub fully_use_devices: bool,
    /// `None` until the user picks a dataset strategy or sets full batch.
    pub dataset_strategy: Option<DatasetStrategy>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::default(),
            device_target: DeviceTarget::default(),
            parallel_mode: ParallelMode::default(),
            search_mode: SearchMode::default(),
            device_num: None,
            fully_use_devices: true,
            dataset_strategy: None,
        }
    }
}

impl ContextConfig {
    /// Eager execution, auto-parallel with sharding propagation over `device_num` devices.
    pub fn sharding_propagation(device_target: DeviceTarget, device_num: usize) -> Self {
        Self {
            mode: ExecutionMode::Pynative,
            device_target,
            parallel_mode: ParallelMode::AutoParallel,
            search_mode: SearchMode::ShardingPropagation,
            device_num: Some(device_num),
            ..Self::default()
        }
    }
}

/// Read/write access to the execution and auto-parallel configuration.
pub trait ContextService: Send + Sync {
    /// Current operator dispatch mode.
    fn execution_mode(&self) -> ExecutionMode;
    /// Current auto-parallel mode.
    fn parallel_mode(&self) -> ParallelMode;
    /// Current strategy search algorithm.
    fn search_mode(&self) -> SearchMode;
    /// Device class the process runs on.
    fn device_target(&self) -> DeviceTarget;
    /// Size of the parallel group, if set.
    fn device_num(&self) -> Option<usize>;

    /// Whether strategy search is limited to strategies that use every device.
    fn fully_use_devices(&self) -> bool;
    /// Sets the fully-use-devices flag.
    fn set_fully_use_devices(&self, enabled: bool);

    /// Dataset strategy the user picked, if any.
    fn dataset_strategy(&self) -> Option<DatasetStrategy>;
    /// Sets the dataset strategy.
    fn set_dataset_strategy(&self, strategy: DatasetStrategy);

    /// Whether the user picked a dataset strategy (or full batch) explicitly.
    fn full_batch_is_set(&self) -> bool {
        self.dataset_strategy().is_some()
    }
}

/// In-memory [`ContextService`].
#[derive(Debug, Default)]
pub struct ParallelContext {
    config: RwLock<ContextConfig>,
}

impl ParallelContext {
    /// Context holding `config`.
    pub fn new(config: ContextConfig) -> Self {
        Self {
            config: RwLock::new(config),
        }
    }

    /// Builds a context from a JSON document holding a [`ContextConfig`].
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json).map(Self::new)
    }

    /// Copy of the current configuration.
    pub fn snapshot(&self) -> ContextConfig {
        self.read(Clone::clone)
    }

    /// Applies `update` to the configuration.
    pub fn update(&self, update: impl FnOnce(&mut ContextConfig)) {
        let mut config = self.config.write().unwrap_or_else(PoisonError::into_inner);
        update(&mut config);
    }

    fn read<R>(&self, read: impl FnOnce(&ContextConfig) -> R) -> R {
        let config = self.config.read().unwrap_or_else(PoisonError::into_inner);
        read(&config)
    }
}

impl ContextService for ParallelContext {
    fn execution_mode(&self) -> ExecutionMode {
        self.read(|config| config.mode)
    }

    fn parallel_mode(&self) -> ParallelMode {
        self.read(|config| config.parallel_mode)
    }

    fn search_mode(&self) -> SearchMode {
        self.read(|config| config.search_mode)
    }

    fn device_target(&self) -> DeviceTarget {
        self.read(|config| config.device_target)
    }

    fn device_num(&self) -> Option<usize> {
        self.read(|config| config.device_num)
    }

    fn fully_use_devices(&self) -> bool {
        self.read(|config| config.fully_use_devices)
    }

    fn set_fully_use_devices(&self, enabled: bool) {
        self.update(|config| config.fully_use_devices = enabled);
    }

    fn dataset_strategy(&self) -> Option<DatasetStrategy> {
        self.read(|config| config.dataset_strategy.clone())
    }

    fn set_dataset_strategy(&self, strategy: DatasetStrategy) {
        self.update(|config| config.dataset_strategy = Some(strategy));
    }
}

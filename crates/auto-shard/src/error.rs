use core::fmt;

use thiserror::Error;

use crate::context::{DeviceTarget, ExecutionMode, ParallelMode, SearchMode};
use crate::sharding::{MeshError, ShardingError};

/// Errors returned by [`Shard::apply`](crate::Shard::apply) and [`shard`](crate::shard).
///
/// Every variant is produced before the shard site's binding is touched, so a failed call
/// leaves any previously cached closure usable.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum ShardError {
    /// The ambient context is not configured for sharding.
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// One or more arguments are malformed.
    #[error(transparent)]
    InvalidArguments(#[from] ArgumentErrors),
}

impl ShardError {
    /// Returns `true` if this error was raised by a context check.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }

    /// Returns `true` if this error reports a problem with the argument called `name`.
    pub fn mentions_argument(&self, name: &str) -> bool {
        match self {
            Self::Configuration(_) => false,
            Self::InvalidArguments(errors) => errors.mentions(name),
        }
    }
}

/// Incompatible ambient configuration.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum ConfigurationError {
    /// Sharding re-enters graph mode per call and therefore needs eager execution.
    #[error("'Shard' only supports auto parallel under PyNative mode, but the execution mode is '{mode}'")]
    ExecutionMode {
        /// Execution mode found in the context.
        mode: ExecutionMode,
    },

    /// The context is not in `auto_parallel` mode.
    #[error("'Shard' only supports auto parallel under PyNative mode, but the parallel mode is '{mode}'")]
    ParallelMode {
        /// Parallel mode found in the context.
        mode: ParallelMode,
    },

    /// Strategy search is not `sharding_propagation`.
    #[error("'search_mode' must be 'sharding_propagation' for 'Shard', but got '{mode}'")]
    SearchMode {
        /// Search mode found in the context.
        mode: SearchMode,
    },

    /// The context targets a device class sharding does not run on.
    #[error("'Shard' now only supports 'Ascend' and 'GPU', but the device target is '{device}'")]
    DeviceTarget {
        /// Device target found in the context.
        device: DeviceTarget,
    },
}

/// A single malformed argument passed to the shard entry point.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum ArgumentError {
    /// The argument has the wrong type altogether.
    #[error("For 'Shard', the '{argument}' should be {expected}, but got {got}")]
    UnexpectedType {
        /// Name of the argument.
        argument: &'static str,
        /// Accepted types, as a phrase.
        expected: &'static str,
        /// Type name of the value received.
        got: &'static str,
    },

    /// An element of a strategy sequence is neither `None` nor a layout.
    #[error(
        "For 'Shard', element #{index} of '{argument}' should be None or a tuple of positive integers, but got {got}"
    )]
    InvalidLayout {
        /// `in_strategy` or `out_strategy`.
        argument: &'static str,
        /// Position of the element in the sequence.
        index: usize,
        /// The element as it was passed.
        got: String,
    },

    /// A `parameter_plan` key is not a string.
    #[error("For 'Shard', the type of each key in 'parameter_plan' must be str, but got {got}")]
    InvalidParameterName {
        /// Type name of the key.
        got: &'static str,
    },

    /// A `parameter_plan` key is the empty string.
    #[error("For 'Shard', the keys of 'parameter_plan' must be non-empty")]
    EmptyParameterName,

    /// A parameter is named twice in `parameter_plan`.
    #[error("For 'Shard', the parameter '{name}' appears more than once in 'parameter_plan'")]
    DuplicateParameter {
        /// The repeated name.
        name: String,
    },

    /// A `parameter_plan` value is not a layout.
    #[error(
        "For 'Shard', the layout of parameter '{name}' in 'parameter_plan' must be a tuple of positive integers, but got {got}"
    )]
    InvalidParameterLayout {
        /// Parameter the layout was given for.
        name: String,
        /// The value as it was passed.
        got: String,
    },

    /// `device` names no known device class.
    #[error("For 'Shard', the 'device' must be one of [CPU, GPU, Ascend], but got '{device}'")]
    UnsupportedDevice {
        /// The name received.
        device: String,
    },

    /// `level` is an integer outside the known levels.
    #[error("For 'Shard', the 'level' must be one of [0, 1, 2], but got {level}")]
    UnsupportedLevel {
        /// The level received.
        level: i64,
    },
}

impl ArgumentError {
    /// Name of the argument this error refers to.
    pub fn argument(&self) -> &'static str {
        match self {
            Self::UnexpectedType { argument, .. } | Self::InvalidLayout { argument, .. } => argument,
            Self::InvalidParameterName { .. }
            | Self::EmptyParameterName
            | Self::DuplicateParameter { .. }
            | Self::InvalidParameterLayout { .. } => "parameter_plan",
            Self::UnsupportedDevice { .. } => "device",
            Self::UnsupportedLevel { .. } => "level",
        }
    }
}

/// Every malformed argument of one call, in argument order.
///
/// Fields are validated independently, so fixing one of them surfaces the remaining ones
/// on the next attempt instead of hiding them behind the first failure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArgumentErrors(Vec<ArgumentError>);

impl ArgumentErrors {
    pub(crate) fn new(errors: Vec<ArgumentError>) -> Self {
        Self(errors)
    }

    /// Iterates over the individual errors.
    pub fn iter(&self) -> impl Iterator<Item = &ArgumentError> {
        self.0.iter()
    }

    /// Number of malformed fields reported.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always `false` for errors produced by validation.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns `true` if any of the errors refers to the argument called `name`.
    pub fn mentions(&self, name: &str) -> bool {
        self.0.iter().any(|error| error.argument() == name)
    }
}

impl fmt::Display for ArgumentErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, error) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ArgumentErrors {}

/// Failures raised while compiling or running a sharded graph.
///
/// These come from the graph executor or from the sharded function itself and reach the
/// caller of [`ShardFn::call`](crate::ShardFn::call) unchanged.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum ExecutionError {
    /// The context has no device number.
    #[error("device_num must be set when use shard function")]
    DeviceNumNotSet,

    /// `in_strategy` has a different length than the argument list.
    #[error("Input numbers: {inputs} is not equal to in_strategy numbers: {strategies}")]
    StrategyCountMismatch {
        /// Number of arguments.
        inputs: usize,
        /// Number of input layouts.
        strategies: usize,
    },

    /// An input layout has a different rank than its argument.
    #[error("Input dimension: {rank} is not equal to in_strategy dimension: {layout_rank} at index {index}")]
    RankMismatch {
        /// Argument position.
        index: usize,
        /// Rank of the argument.
        rank: usize,
        /// Rank of its layout.
        layout_rank: usize,
    },

    /// A planned parameter has a different rank than its layout.
    #[error("Parameter '{name}' has {rank} dimension(s) but its layout has {layout_rank}")]
    ParameterRankMismatch {
        /// Parameter name.
        name: String,
        /// Rank of the parameter.
        rank: usize,
        /// Rank of its layout.
        layout_rank: usize,
    },

    /// A layout cannot be realised on the available devices.
    #[error(transparent)]
    Mesh(#[from] MeshError),

    /// A layout does not fit the shape of its tensor.
    #[error(transparent)]
    Sharding(#[from] ShardingError),

    /// The sharded function reported an error.
    #[error("function '{name}' failed: {message}")]
    Function {
        /// Name of the failing function.
        name: String,
        /// What went wrong.
        message: String,
    },
}

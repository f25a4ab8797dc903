//! Callables that can be sharded.
//!
//! A [`Function`] maps input tensors to output tensors. Functions that own trainable state
//! additionally expose it through [`ParameterBearing`], which lets the shard site track
//! their parameters and lets executors apply a parameter plan.

use core::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::ExecutionError;

/// Shared handle to a callable. Shard sites and graph caches key on its identity.
pub type FunctionRef<T> = Arc<dyn Function<T>>;

/// A unit of computation that can run under a parallel strategy.
pub trait Function<T>: Send + Sync {
    /// Name used in logs and error messages.
    fn name(&self) -> &str;

    /// Runs the computation on global (unsharded) tensors.
    fn call(&self, args: &[T]) -> Result<Vec<T>, ExecutionError>;

    /// Returns the parameter view of this function if it owns trainable state.
    fn as_parameter_bearing(&self) -> Option<&dyn ParameterBearing> {
        None
    }
}

/// Capability of composable units with learnable parameters.
pub trait ParameterBearing {
    /// Parameters updated by training, in a stable order.
    fn trainable_parameters(&self) -> Vec<Parameter>;
}

/// Identity of a [`FunctionRef`]: the address of its shared allocation.
///
/// Two handles have the same id exactly when they point to the same callable. An id is
/// only stable while some handle keeps the callable alive, so caches keyed by it also
/// hold a handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionId(usize);

impl FunctionId {
    /// Identity of the callable behind `function`.
    pub fn of<T>(function: &FunctionRef<T>) -> Self {
        Self(Arc::as_ptr(function).cast::<()>() as usize)
    }
}

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A named trainable tensor owned by a parameter-bearing function.
///
/// Clones share the `in_shard` flag, so marking a parameter through any handle is visible
/// to the function that owns it.
#[derive(Clone, Debug)]
pub struct Parameter {
    name: String,
    shape: Vec<usize>,
    in_shard: Arc<AtomicBool>,
}

impl Parameter {
    /// Creates a parameter that is not yet used inside a shard.
    pub fn new<S: Into<String>>(name: S, shape: Vec<usize>) -> Self {
        Self {
            name: name.into(),
            shape,
            in_shard: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Name the parameter plan refers to it by.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Global shape of the parameter.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Whether this parameter is used inside a sharded function.
    pub fn is_in_shard(&self) -> bool {
        self.in_shard.load(Ordering::Relaxed)
    }

    /// Marks or unmarks the parameter as used inside a sharded function.
    pub fn set_in_shard(&self, in_shard: bool) {
        self.in_shard.store(in_shard, Ordering::Relaxed);
    }
}

/// A plain closure wrapped as a [`Function`]. It owns no parameters.
pub struct FnFunction<F> {
    name: String,
    func: F,
}

impl<T, F> Function<T> for FnFunction<F>
where
    F: Fn(&[T]) -> Result<Vec<T>, ExecutionError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn call(&self, args: &[T]) -> Result<Vec<T>, ExecutionError> {
        (self.func)(args)
    }
}

/// Wraps a closure as a shareable [`Function`].
///
/// ```rust
/// # use auto_shard::{from_fn, Function, HostTensor};
/// let double = from_fn("double", |args: &[HostTensor]| Ok(vec![&args[0] * 2.0]));
/// assert_eq!(double.name(), "double");
/// ```
pub fn from_fn<T, F>(name: impl Into<String>, func: F) -> FunctionRef<T>
where
    T: 'static,
    F: Fn(&[T]) -> Result<Vec<T>, ExecutionError> + Send + Sync + 'static,
{
    Arc::new(FnFunction {
        name: name.into(),
        func,
    })
}

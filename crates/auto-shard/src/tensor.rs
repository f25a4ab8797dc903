use ndarray::ArrayD;
use strum::Display;

use crate::error::ExecutionError;
use crate::sharding::{DeviceMesh, Layout, ShardingSpec};

/// Tensor type used by the host executor.
pub type HostTensor = ArrayD<f32>;

/// Element type of a tensor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum DType {
    /// Boolean.
    Bool,
    /// 32-bit signed integer.
    I32,
    /// 64-bit signed integer.
    I64,
    /// 32-bit float.
    F32,
    /// 64-bit float.
    F64,
}

/// Element types with a known [`DType`].
pub trait Element {
    /// The element's dtype.
    const DTYPE: DType;
}

impl Element for bool {
    const DTYPE: DType = DType::Bool;
}

impl Element for i32 {
    const DTYPE: DType = DType::I32;
}

impl Element for i64 {
    const DTYPE: DType = DType::I64;
}

impl Element for f32 {
    const DTYPE: DType = DType::F32;
}

impl Element for f64 {
    const DTYPE: DType = DType::F64;
}

/// Shape and dtype of a tensor, which is everything graph specialization looks at.
pub trait TensorMeta {
    /// Size of every dimension.
    fn shape(&self) -> &[usize];
    /// Element type.
    fn dtype(&self) -> DType;

    /// Shape and dtype together.
    fn signature(&self) -> TensorSignature {
        TensorSignature {
            shape: self.shape().to_vec(),
            dtype: self.dtype(),
        }
    }
}

impl<A: Element> TensorMeta for ArrayD<A> {
    fn shape(&self) -> &[usize] {
        ndarray::ArrayBase::shape(self)
    }

    fn dtype(&self) -> DType {
        A::DTYPE
    }
}

/// Abstract description of one argument of a compiled graph.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TensorSignature {
    /// Global shape.
    pub shape: Vec<usize>,
    /// Element type.
    pub dtype: DType,
}

/// Represents a tensor that is distributed (sharded or replicated) across multiple devices.
///
/// Only metadata is kept: the global shape, the per-device shard shape, and the
/// [`ShardingSpec`] relating the two. Graph executors produce one per input and per
/// planned parameter when they compile a sharded graph.
#[derive(Clone, Debug)]
pub struct ShardedTensor<T> {
    /// Specification of how this tensor is sharded
    sharding_spec: ShardingSpec<T>,
    /// Global shape of the tensor (across all devices)
    global_shape: Vec<usize>,
    /// Shape of the shard held by each device
    local_shape: Vec<usize>,
}

impl<T> ShardedTensor<T> {
    /// Distributes a tensor of shape `global_shape` over `devices` according to `layout`.
    pub fn new(global_shape: &[usize], layout: &Layout, devices: Vec<T>) -> Result<Self, ExecutionError> {
        let mesh = DeviceMesh::for_layout(devices, layout)?;
        let sharding_spec = ShardingSpec::from_layout(layout, mesh);
        let local_shape = sharding_spec.local_shape(global_shape)?;
        Ok(Self {
            sharding_spec,
            global_shape: global_shape.to_vec(),
            local_shape,
        })
    }

    /// How the tensor is distributed.
    pub fn sharding_spec(&self) -> &ShardingSpec<T> {
        &self.sharding_spec
    }

    /// Shape across all devices.
    pub fn global_shape(&self) -> &[usize] {
        &self.global_shape
    }

    /// Shape of each device's shard.
    pub fn local_shape(&self) -> &[usize] {
        &self.local_shape
    }
}

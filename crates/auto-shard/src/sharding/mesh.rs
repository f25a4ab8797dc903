use hashbrown::{HashMap, HashSet};
use thiserror::Error;

use super::Layout;

/// Name of the mesh dimension that holds the replicas of a layout.
pub const REPEAT_DIM: &str = "repeat";

/// Represents a logical mesh dimension, identified by a unique name.
///
/// Mesh dimensions are used to define the logical structure of a device mesh. Layout
/// meshes name the replica axis [`REPEAT_DIM`] and the axis that splits tensor dimension
/// `i` as `dim{i}` (see [`MeshDim::tensor`]).
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct MeshDim {
    /// A name that uniquely identifies the mesh dimension.
    name: String,
}

impl MeshDim {
    /// Constructs a new [`MeshDim`] with the given name.
    pub fn new<S: Into<String>>(name: S) -> Self {
        MeshDim { name: name.into() }
    }

    /// The mesh dimension that shards tensor dimension `dimension`.
    pub fn tensor(dimension: usize) -> Self {
        Self::new(format!("dim{dimension}"))
    }

    /// Name of the dimension.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Logical arrangement of devices used for parallel computation.
///
/// A `DeviceMesh` defines an N-dimensional topology over a set of devices in which every
/// dimension carries a unique name. A layout such as `(2, 1)` on 8 devices is realised as
/// the mesh `[4, 2, 1]` with dimensions `["repeat", "dim0", "dim1"]`: each shard of the
/// tensor is computed by 4 replicas.
#[derive(Clone, Debug)]
pub struct DeviceMesh<T> {
    /// Devices in row-major order over `shape`.
    devices: Vec<T>,
    /// Shape of the logical mesh
    shape: Vec<usize>,
    /// Maps dimension names to their indices in the mesh
    dims: HashMap<MeshDim, usize>,
}

/// Errors that can occur when constructing a [`DeviceMesh`].
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum MeshError {
    /// A dimension was mapped past the end of the mesh shape.
    #[error("Index {index} exceeds mesh shape {shape:?}")]
    IndexOutOfBounds {
        /// The offending index.
        index: usize,
        /// Shape of the mesh.
        shape: Vec<usize>,
    },

    /// Two names were mapped to the same index.
    #[error("Dimension {index} already mapped")]
    DimensionAlreadyMapped {
        /// The index mapped twice.
        index: usize,
    },

    /// Some index of the mesh shape has no name.
    #[error("Not all mesh dimensions are mapped. Got {mapped}, expected {expected}")]
    UnmappedDimensions {
        /// Number of mapped indices.
        mapped: usize,
        /// Rank of the mesh.
        expected: usize,
    },

    /// The device list does not fill the mesh shape.
    #[error("Device count ({devices}) doesn't match mesh shape {shape:?}")]
    DeviceCountMismatch {
        /// Number of devices given.
        devices: usize,
        /// Shape of the mesh.
        shape: Vec<usize>,
    },

    /// A layout needs more devices than are available.
    #[error("required device number: {required} is larger than available device number: {available}")]
    InsufficientDevices {
        /// Product of the layout factors.
        required: usize,
        /// Number of devices.
        available: usize,
    },

    /// The product of a layout's factors does not fit in a `usize`.
    #[error(
        "required device number of shard factors {factors:?} overflows; available device number: {available}"
    )]
    ShardCountOverflow {
        /// Factors of the layout.
        factors: Vec<usize>,
        /// Number of devices.
        available: usize,
    },

    /// The device number is not a multiple of the shards a layout needs.
    #[error("required device number: {required} is not divisible by device number: {available}")]
    IndivisibleDevices {
        /// Product of the layout factors.
        required: usize,
        /// Number of devices.
        available: usize,
    },
}

impl<T> DeviceMesh<T> {
    /// Derives the mesh that realises `layout` over `devices`.
    ///
    /// The product of the layout factors must not exceed the number of devices and must
    /// divide it. The remaining factor becomes the leading [`REPEAT_DIM`] dimension.
    ///
    /// # Example
    ///
    /// ```rust
    /// # use auto_shard::sharding::{DeviceMesh, Layout};
    /// let mesh = DeviceMesh::for_layout((0..8).collect(), &Layout::new([2, 1]).unwrap()).unwrap();
    /// assert_eq!(mesh.shape(), &[4, 2, 1]);
    /// ```
    pub fn for_layout(devices: Vec<T>, layout: &Layout) -> Result<Self, MeshError> {
        let available = devices.len();
        let Some(required) = layout.shard_count() else {
            return Err(MeshError::ShardCountOverflow {
                factors: layout.factors().to_vec(),
                available,
            });
        };
        if required > available {
            return Err(MeshError::InsufficientDevices { required, available });
        }
        if available % required != 0 {
            return Err(MeshError::IndivisibleDevices { required, available });
        }

        let mut shape = Vec::with_capacity(layout.rank() + 1);
        shape.push(available / required);
        shape.extend_from_slice(layout.factors());

        let builder = (0..layout.rank()).fold(
            DeviceMeshBuilder::new(devices, shape).with_dim(0, MeshDim::new(REPEAT_DIM)),
            |builder, dimension| builder.with_dim(dimension + 1, MeshDim::tensor(dimension)),
        );
        builder.build()
    }

    /// Devices of the mesh in row-major order.
    pub fn devices(&self) -> &[T] {
        &self.devices
    }

    /// Size of every mesh dimension.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Index of `dim` in the mesh shape, if the mesh has such a dimension.
    pub fn dim_index(&self, dim: &MeshDim) -> Option<usize> {
        self.dims.get(dim).copied()
    }

    /// Size of `dim`, if the mesh has such a dimension.
    pub fn dim_size(&self, dim: &MeshDim) -> Option<usize> {
        self.dim_index(dim).map(|index| self.shape[index])
    }
}

/// A builder for constructing a [`DeviceMesh`].
///
/// Define the mesh shape, map every shape index to a named [`MeshDim`], then call
/// [`build`](DeviceMeshBuilder::build) to validate the result.
#[derive(Clone, Debug)]
pub struct DeviceMeshBuilder<T> {
    devices: Vec<T>,
    shape: Vec<usize>,
    dims: HashMap<MeshDim, usize>,
}

impl<T> DeviceMeshBuilder<T> {
    /// Creates a new [`DeviceMeshBuilder`] with the given devices and shape.
    ///
    /// # Arguments
    /// * `devices` - A vector of devices to be arranged in the mesh.
    /// * `shape` - A vector representing the shape (dimensions) of the mesh.
    pub fn new<S: Into<Vec<usize>>>(devices: Vec<T>, shape: S) -> Self {
        Self {
            devices,
            shape: shape.into(),
            dims: HashMap::new(),
        }
    }

    /// Maps the mesh dimension `dim` to index `idx` of the mesh shape.
    ///
    /// Mapping the same name twice keeps only the last index, which later makes
    /// [`build`](DeviceMeshBuilder::build) report an unmapped dimension.
    ///
    /// # Example
    ///
    /// ```rust
    /// # use auto_shard::sharding::{DeviceMeshBuilder, MeshDim};
    /// let mesh = DeviceMeshBuilder::new(vec![0, 1, 2, 3], [2, 2])
    ///     .with_dim(0, MeshDim::new("repeat"))
    ///     .with_dim(1, MeshDim::new("dim0"))
    ///     .build()
    ///     .unwrap();
    /// assert_eq!(mesh.dim_size(&MeshDim::new("dim0")), Some(2));
    /// ```
    pub fn with_dim(mut self, idx: usize, dim: MeshDim) -> Self {
        self.dims.insert(dim, idx);
        self
    }

    /// Builds a [`DeviceMesh`] from the current configuration.
    ///
    /// Every index must be in bounds and mapped exactly once, and the number of devices
    /// must equal the product of the shape.
    pub fn build(self) -> Result<DeviceMesh<T>, MeshError> {
        let ndim = self.shape.len();
        let mut seen_indices = HashSet::new();

        for &index in self.dims.values() {
            if index >= ndim {
                return Err(MeshError::IndexOutOfBounds {
                    index,
                    shape: self.shape.clone(),
                });
            }
            if !seen_indices.insert(index) {
                return Err(MeshError::DimensionAlreadyMapped { index });
            }
        }

        if seen_indices.len() != ndim {
            return Err(MeshError::UnmappedDimensions {
                mapped: seen_indices.len(),
                expected: ndim,
            });
        }

        let expected_devices = self.shape.iter().product::<usize>();
        if self.devices.len() != expected_devices {
            return Err(MeshError::DeviceCountMismatch {
                devices: self.devices.len(),
                shape: self.shape,
            });
        }

        Ok(DeviceMesh {
            devices: self.devices,
            shape: self.shape,
            dims: self.dims,
        })
    }
}

use thiserror::Error;

use super::{DeviceMesh, Layout, MeshDim};

/// Specifies how a single dimension is distributed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DimDistribution {
    /// Dimension is sharded across a specific mesh dimension.
    Sharded(MeshDim),
    /// Dimension is replicated (not sharded).
    Replicated,
}

/// Errors raised when applying a [`ShardingSpec`] to a concrete tensor shape.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum ShardingError {
    /// The tensor and the spec have different ranks.
    #[error("tensor of rank {rank} cannot use a sharding spec of rank {spec_rank}")]
    RankMismatch {
        /// Rank of the tensor.
        rank: usize,
        /// Rank of the spec.
        spec_rank: usize,
    },

    /// A sharded dimension does not split evenly.
    #[error("dimension {dimension} of size {size} is not divisible by shard factor {factor}")]
    IndivisibleDimension {
        /// Tensor dimension.
        dimension: usize,
        /// Its global size.
        size: usize,
        /// Mesh size it is split over.
        factor: usize,
    },

    /// The spec names a mesh dimension the mesh lacks.
    #[error("mesh has no dimension named '{name}'")]
    UnknownMeshDim {
        /// The missing name.
        name: String,
    },
}

/// Describes how a tensor is distributed across devices
#[derive(Clone, Debug)]
pub struct ShardingSpec<T> {
    /// Distribution pattern for each tensor dimension
    dim_distributions: Vec<DimDistribution>,
    /// Description of the device mesh
    device_mesh: DeviceMesh<T>,
}

impl<T> ShardingSpec<T> {
    /// Distribution of a tensor laid out by `layout` on a mesh built by
    /// [`DeviceMesh::for_layout`].
    ///
    /// Dimensions with a factor of one stay replicated.
    pub fn from_layout(layout: &Layout, device_mesh: DeviceMesh<T>) -> Self {
        let dim_distributions = layout
            .factors()
            .iter()
            .enumerate()
            .map(|(dimension, &factor)| match factor {
                1 => DimDistribution::Replicated,
                _ => DimDistribution::Sharded(MeshDim::tensor(dimension)),
            })
            .collect();

        Self {
            dim_distributions,
            device_mesh,
        }
    }

    /// Distribution of every tensor dimension.
    pub fn dim_distributions(&self) -> &[DimDistribution] {
        &self.dim_distributions
    }

    /// Mesh the tensor is laid out on.
    pub fn device_mesh(&self) -> &DeviceMesh<T> {
        &self.device_mesh
    }

    /// Shape of the shard each device holds for a tensor of shape `global_shape`.
    pub fn local_shape(&self, global_shape: &[usize]) -> Result<Vec<usize>, ShardingError> {
        if global_shape.len() != self.dim_distributions.len() {
            return Err(ShardingError::RankMismatch {
                rank: global_shape.len(),
                spec_rank: self.dim_distributions.len(),
            });
        }

        global_shape
            .iter()
            .zip(&self.dim_distributions)
            .enumerate()
            .map(|(dimension, (&size, distribution))| {
                let DimDistribution::Sharded(dim) = distribution else {
                    return Ok(size);
                };
                let factor = self.device_mesh.dim_size(dim).ok_or_else(|| {
                    ShardingError::UnknownMeshDim {
                        name: dim.name().to_owned(),
                    }
                })?;
                if size % factor != 0 {
                    return Err(ShardingError::IndivisibleDimension {
                        dimension,
                        size,
                        factor,
                    });
                }
                Ok(size / factor)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(factors: &[usize], device_num: usize) -> ShardingSpec<usize> {
        let layout = Layout::new(factors.to_vec()).unwrap();
        let mesh = DeviceMesh::for_layout((0..device_num).collect(), &layout).unwrap();
        ShardingSpec::from_layout(&layout, mesh)
    }

    #[test]
    fn test_local_shape_splits_sharded_dims() {
        let spec = spec(&[2, 1], 8);

        assert_eq!(
            spec.dim_distributions(),
            &[
                DimDistribution::Sharded(MeshDim::tensor(0)),
                DimDistribution::Replicated
            ]
        );
        assert_eq!(spec.local_shape(&[32, 10]).unwrap(), vec![16, 10]);
    }

    #[test]
    fn test_local_shape_rank_mismatch() {
        assert_eq!(
            spec(&[2, 1], 2).local_shape(&[32]),
            Err(ShardingError::RankMismatch {
                rank: 1,
                spec_rank: 2
            })
        );
    }

    #[test]
    fn test_local_shape_indivisible() {
        assert_eq!(
            spec(&[4], 4).local_shape(&[10]),
            Err(ShardingError::IndivisibleDimension {
                dimension: 0,
                size: 10,
                factor: 4
            })
        );
    }
}

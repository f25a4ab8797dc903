use core::fmt;

use serde::{Deserialize, Serialize};

/// Shard factors of a single tensor, one per tensor dimension.
///
/// A layout `(2, 1)` splits the first dimension in two and keeps the second whole. Factors
/// are always positive; a layout with no factors describes a scalar.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "Vec<usize>", into = "Vec<usize>")]
pub struct Layout {
    factors: Vec<usize>,
}

/// Error returned when building a [`Layout`] from a zero factor.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("shard factor at dimension {dimension} must be positive")]
pub struct ZeroShardFactor {
    /// Dimension holding the zero factor.
    pub dimension: usize,
}

impl Layout {
    /// Creates a layout from its shard factors.
    pub fn new<F: Into<Vec<usize>>>(factors: F) -> Result<Self, ZeroShardFactor> {
        let factors = factors.into();
        if let Some(dimension) = factors.iter().position(|&factor| factor == 0) {
            return Err(ZeroShardFactor { dimension });
        }
        Ok(Self { factors })
    }

    /// Layout that keeps every one of `rank` dimensions whole.
    pub fn replicated(rank: usize) -> Self {
        Self {
            factors: vec![1; rank],
        }
    }

    /// Data-parallel layout: the first dimension is split `device_num` ways.
    ///
    /// Scalars have nothing to split and are replicated.
    pub fn data_parallel(rank: usize, device_num: usize) -> Self {
        let mut layout = Self::replicated(rank);
        if let Some(first) = layout.factors.first_mut() {
            *first = device_num.max(1);
        }
        layout
    }

    /// Shard factors, one per tensor dimension.
    pub fn factors(&self) -> &[usize] {
        &self.factors
    }

    /// Number of tensor dimensions the layout describes.
    pub fn rank(&self) -> usize {
        self.factors.len()
    }

    /// Number of distinct shards, i.e. the product of all factors.
    ///
    /// Returns `None` when the product does not fit in a `usize`.
    pub fn shard_count(&self) -> Option<usize> {
        self.factors.iter().try_fold(1usize, |count, &factor| count.checked_mul(factor))
    }
}

impl TryFrom<Vec<usize>> for Layout {
    type Error = ZeroShardFactor;

    fn try_from(factors: Vec<usize>) -> Result<Self, Self::Error> {
        Self::new(factors)
    }
}

impl From<Layout> for Vec<usize> {
    fn from(layout: Layout) -> Self {
        layout.factors
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, factor) in self.factors.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{factor}")?;
        }
        if self.factors.len() == 1 {
            f.write_str(",")?;
        }
        f.write_str(")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_rejects_zero_factor() {
        assert_eq!(Layout::new([2, 0]), Err(ZeroShardFactor { dimension: 1 }));
    }

    #[test]
    fn test_layout_shard_count() {
        let layout = Layout::new([2, 4]).unwrap();
        assert_eq!(layout.rank(), 2);
        assert_eq!(layout.shard_count(), Some(8));
        assert_eq!(Layout::replicated(0).shard_count(), Some(1));
    }

    #[test]
    fn test_layout_shard_count_overflow() {
        let layout = Layout::new([usize::MAX / 2, 2, 2]).unwrap();
        assert_eq!(layout.shard_count(), None);
    }

    #[test]
    fn test_data_parallel_layout() {
        assert_eq!(Layout::data_parallel(3, 8).factors(), &[8, 1, 1]);
        assert_eq!(Layout::data_parallel(0, 8).factors(), &[] as &[usize]);
    }

    #[test]
    fn test_layout_display() {
        assert_eq!(Layout::new([2, 1]).unwrap().to_string(), "(2, 1)");
        assert_eq!(Layout::new([4]).unwrap().to_string(), "(4,)");
    }

    #[test]
    fn test_layout_deserialize_rejects_zero() {
        assert!(serde_json::from_str::<Layout>("[2, 0]").is_err());
        assert_eq!(serde_json::from_str::<Layout>("[2, 1]").unwrap().factors(), &[2, 1]);
    }
}

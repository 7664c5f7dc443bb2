//! Rank arithmetic on the (pipeline, data, tensor) mesh.
//!
//! Ranks `0..world_size` are laid out row-major in an array of shape
//! `(pp, dp, tp)`: the tensor index varies fastest, the pipeline index
//! slowest. Everything here is pure and identical on every rank.

use crate::utils::error::{MeshError, Result};
use std::fmt;

/// One axis of the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    Tensor,
    Data,
    Pipeline,
}

impl Axis {
    /// Axes in group-creation order.
    pub const CREATION_ORDER: [Axis; 3] = [Axis::Tensor, Axis::Data, Axis::Pipeline];

    pub fn name(&self) -> &'static str {
        match self {
            Axis::Tensor => "tensor",
            Axis::Data => "data",
            Axis::Pipeline => "pipeline",
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Position of a rank on the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MeshCoordinate {
    pub pipeline: usize,
    pub data: usize,
    pub tensor: usize,
}

impl MeshCoordinate {
    pub fn new(pipeline: usize, data: usize, tensor: usize) -> Self {
        Self { pipeline, data, tensor }
    }

    pub fn along(&self, axis: Axis) -> usize {
        match axis {
            Axis::Tensor => self.tensor,
            Axis::Data => self.data,
            Axis::Pipeline => self.pipeline,
        }
    }
}

/// Shape of the mesh. Invariant: `pipeline * data * tensor == world_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshShape {
    pipeline: usize,
    data: usize,
    tensor: usize,
}

impl MeshShape {
    /// Validate the parallel sizes against the world size.
    pub fn new(world_size: usize, tp_size: usize, dp_size: usize, pp_size: usize) -> Result<Self> {
        if world_size == 0 || tp_size == 0 || dp_size == 0 || pp_size == 0 {
            return Err(MeshError::Config(format!(
                "parallel sizes must be positive: world={} tp={} dp={} pp={}",
                world_size, tp_size, dp_size, pp_size
            )));
        }
        if world_size % dp_size != 0 {
            return Err(MeshError::Config(format!(
                "world_size ({}) must be divisible by dp_size ({})",
                world_size, dp_size
            )));
        }
        let per_model = tp_size * pp_size;
        if world_size % per_model != 0 {
            return Err(MeshError::Config(format!(
                "world_size ({}) must be divisible by tp_size * pp_size ({})",
                world_size, per_model
            )));
        }
        if per_model * dp_size != world_size {
            return Err(MeshError::Config(format!(
                "TP({}) x DP({}) x PP({}) = {} != world_size({})",
                tp_size,
                dp_size,
                pp_size,
                per_model * dp_size,
                world_size
            )));
        }

        Ok(Self {
            pipeline: pp_size,
            data: dp_size,
            tensor: tp_size,
        })
    }

    pub fn world_size(&self) -> usize {
        self.pipeline * self.data * self.tensor
    }

    pub fn size(&self, axis: Axis) -> usize {
        match axis {
            Axis::Tensor => self.tensor,
            Axis::Data => self.data,
            Axis::Pipeline => self.pipeline,
        }
    }

    pub fn coordinate(&self, rank: usize) -> Result<MeshCoordinate> {
        if rank >= self.world_size() {
            return Err(MeshError::Config(format!(
                "rank {} outside world of size {}",
                rank,
                self.world_size()
            )));
        }
        Ok(MeshCoordinate {
            pipeline: rank / (self.tensor * self.data),
            data: (rank / self.tensor) % self.data,
            tensor: rank % self.tensor,
        })
    }

    /// Inverse of `coordinate`.
    pub fn rank_of(&self, coord: MeshCoordinate) -> usize {
        (coord.pipeline * self.data + coord.data) * self.tensor + coord.tensor
    }

    /// Every group along `axis`, in creation order.
    ///
    /// The two complementary axes are walked row-major in mesh order, e.g.
    /// data groups are enumerated as `for p { for t { [rank(p, d, t) for d] } }`.
    pub fn axis_groups(&self, axis: Axis) -> Vec<Vec<usize>> {
        let mut groups = Vec::new();
        match axis {
            Axis::Tensor => {
                for p in 0..self.pipeline {
                    for d in 0..self.data {
                        groups.push(
                            (0..self.tensor)
                                .map(|t| self.rank_of(MeshCoordinate::new(p, d, t)))
                                .collect(),
                        );
                    }
                }
            }
            Axis::Data => {
                for p in 0..self.pipeline {
                    for t in 0..self.tensor {
                        groups.push(
                            (0..self.data)
                                .map(|d| self.rank_of(MeshCoordinate::new(p, d, t)))
                                .collect(),
                        );
                    }
                }
            }
            Axis::Pipeline => {
                for t in 0..self.tensor {
                    for d in 0..self.data {
                        groups.push(
                            (0..self.pipeline)
                                .map(|p| self.rank_of(MeshCoordinate::new(p, d, t)))
                                .collect(),
                        );
                    }
                }
            }
        }
        groups
    }

    /// Tensor x pipeline ranks of each data-parallel replica.
    pub fn model_parallel_groups(&self) -> Vec<Vec<usize>> {
        (0..self.data)
            .map(|d| {
                let mut ranks = Vec::with_capacity(self.pipeline * self.tensor);
                for p in 0..self.pipeline {
                    for t in 0..self.tensor {
                        ranks.push(self.rank_of(MeshCoordinate::new(p, d, t)));
                    }
                }
                ranks
            })
            .collect()
    }

    /// The group along `axis` that contains `rank`.
    pub fn group_of(&self, axis: Axis, rank: usize) -> Result<Vec<usize>> {
        let coord = self.coordinate(rank)?;
        Ok((0..self.size(axis))
            .map(|i| {
                let mut c = coord;
                match axis {
                    Axis::Tensor => c.tensor = i,
                    Axis::Data => c.data = i,
                    Axis::Pipeline => c.pipeline = i,
                }
                self.rank_of(c)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_validation() {
        assert!(MeshShape::new(8, 2, 2, 2).is_ok());
        // world not divisible by dp
        assert!(MeshShape::new(8, 1, 3, 1).is_err());
        // world not divisible by tp * pp
        assert!(MeshShape::new(8, 3, 1, 1).is_err());
        // divisible but product mismatch
        assert!(MeshShape::new(8, 2, 2, 1).is_err());
        assert!(MeshShape::new(8, 0, 2, 4).is_err());
    }

    #[test]
    fn test_coordinate_of_rank_five() -> Result<()> {
        let shape = MeshShape::new(8, 2, 2, 2)?;
        assert_eq!(shape.coordinate(5)?, MeshCoordinate::new(1, 0, 1));
        Ok(())
    }

    #[test]
    fn test_coordinates_are_a_bijection() -> Result<()> {
        for &(world, tp, dp, pp) in &[(8, 2, 2, 2), (12, 3, 2, 2), (6, 1, 6, 1), (16, 4, 1, 4), (1, 1, 1, 1)] {
            let shape = MeshShape::new(world, tp, dp, pp)?;
            let mut seen = HashSet::new();
            for rank in 0..world {
                let c = shape.coordinate(rank)?;
                assert!(c.pipeline < pp && c.data < dp && c.tensor < tp);
                assert_eq!(shape.rank_of(c), rank);
                assert!(seen.insert(c));
            }
            assert!(shape.coordinate(world).is_err());
        }
        Ok(())
    }

    #[test]
    fn test_axis_groups_partition_the_world() -> Result<()> {
        let shape = MeshShape::new(12, 3, 2, 2)?;
        for axis in Axis::CREATION_ORDER {
            let groups = shape.axis_groups(axis);
            assert_eq!(groups.len(), 12 / shape.size(axis));
            let mut all: Vec<usize> = groups.iter().flatten().copied().collect();
            all.sort_unstable();
            assert_eq!(all, (0..12).collect::<Vec<_>>());
            for group in &groups {
                assert_eq!(group.len(), shape.size(axis));
                for &rank in group {
                    assert_eq!(&shape.group_of(axis, rank)?, group);
                }
            }
        }
        Ok(())
    }

    #[test]
    fn test_enumeration_order() -> Result<()> {
        let shape = MeshShape::new(8, 2, 2, 2)?;
        assert_eq!(
            shape.axis_groups(Axis::Tensor),
            vec![vec![0, 1], vec![2, 3], vec![4, 5], vec![6, 7]]
        );
        assert_eq!(
            shape.axis_groups(Axis::Data),
            vec![vec![0, 2], vec![1, 3], vec![4, 6], vec![5, 7]]
        );
        assert_eq!(
            shape.axis_groups(Axis::Pipeline),
            vec![vec![0, 4], vec![2, 6], vec![1, 5], vec![3, 7]]
        );
        assert_eq!(
            shape.model_parallel_groups(),
            vec![vec![0, 1, 4, 5], vec![2, 3, 6, 7]]
        );
        Ok(())
    }
}

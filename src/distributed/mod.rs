//! Distributed coordination for 3D-parallel training.
//!
//! Provides:
//! - Mesh arithmetic over (pipeline, data, tensor) axes
//! - Communication group construction and teardown
//! - Placeholder routing of per-step inputs along the pipeline axis
//! - Cross-rank sanity checks on routed batches

use crate::utils::error::Result;
use candle_core::Tensor;
use std::ops::Range;
use std::sync::Arc;

/// Trait for collective communications within one group.
///
/// Every call blocks until all members of the group reach the matching call.
/// Members must issue collectives in the same relative order.
///
/// Implementations include:
/// - `LocalCommunicator`: In-process simulation, one thread per rank
pub trait CollectiveCommunicator: Send + Sync {
    /// Rank of this process within the group
    fn rank(&self) -> usize;

    /// Number of members in the group
    fn world_size(&self) -> usize;

    /// Block until every member has arrived.
    fn barrier(&self) -> Result<()>;

    /// All-reduce: Sum tensor across all ranks and broadcast result.
    fn all_reduce(&self, tensor: &Tensor) -> Result<Tensor>;

    /// All-gather: Gather tensors from all ranks, concatenating along dim 0.
    fn all_gather(&self, tensor: &Tensor) -> Result<Tensor>;

    /// Sum a 1-D tensor across ranks, returning only this rank's range.
    ///
    /// `ranges[i]` is the range owned by group rank `i`. Returns `None` when
    /// this rank owns an empty range; the call is still collective.
    fn reduce_scatter_ranges(
        &self,
        tensor: &Tensor,
        ranges: &[Range<usize>],
    ) -> Result<Option<Tensor>> {
        // Default implementation: all-reduce then slice
        let reduced = self.all_reduce(tensor)?;
        match ranges.get(self.rank()) {
            Some(r) if !r.is_empty() => Ok(Some(reduced.narrow(0, r.start, r.len())?)),
            _ => Ok(None),
        }
    }
}

/// A transport able to create communication groups.
///
/// `new_group` is itself a collective: every rank of the world calls it with
/// the same member list in the same order, members and non-members alike.
/// Non-members get `None`.
pub trait CommunicationBackend: Send + Sync {
    /// Backend identifier ("local", "nccl", ...)
    fn name(&self) -> &str;

    /// Global rank of this process
    fn rank(&self) -> usize;

    /// Total number of processes
    fn world_size(&self) -> usize;

    fn new_group(&self, ranks: &[usize]) -> Result<Option<Arc<dyn CollectiveCommunicator>>>;
}

pub mod backend;
pub mod groups;
pub mod mesh;
pub mod placeholder;
pub mod sanity;

// Re-export commonly used items
pub use backend::{init_backend, LocalBackend, LocalCommunicator, LocalWorld};
pub use groups::{bind_device, ProcessGroup, TopologyBuilder, TopologyDescriptor};
pub use mesh::{Axis, MeshCoordinate, MeshShape};
pub use placeholder::{Batch, FieldSpec, PlaceholderRouter, Slot, TensorPointer};
pub use sanity::{BatchSanityChecker, ReplicaPolicy};

/// Average a tensor across a group.
///
/// All members must call this with tensors in the same order.
pub fn all_reduce_mean(tensor: &Tensor, communicator: &dyn CollectiveCommunicator) -> Result<Tensor> {
    if communicator.world_size() == 1 {
        return Ok(tensor.clone());
    }

    let summed = communicator.all_reduce(tensor)?;
    Ok(summed.affine(1.0 / communicator.world_size() as f64, 0.0)?)
}

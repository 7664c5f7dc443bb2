//! Communication group construction for 3D parallelism.
//!
//! Builds, for the local rank:
//! - the global group
//! - Tensor Parallel (TP), Data Parallel (DP) and Pipeline Parallel (PP) groups
//! - the model-parallel group (TP x PP ranks of one data-parallel replica)
//!
//! Group creation is collective. Every rank walks the same enumeration, in
//! the same order, creating every group of the mesh (not only its own), and
//! groups with equal sorted membership share one context.

use super::mesh::{Axis, MeshCoordinate, MeshShape};
use super::{CollectiveCommunicator, CommunicationBackend};
use crate::utils::config::DistributedConfig;
use crate::utils::digest::{digest_to_tensor, gathered_digests};
use crate::utils::error::{MeshError, Result};
use candle_core::Device;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Process group handle
#[derive(Clone)]
pub struct ProcessGroup {
    /// Ranks in this group, in creation order (group rank -> global rank)
    ranks: Vec<usize>,
    /// Communicator for this group; `None` when the local rank is not a member
    communicator: Option<Arc<dyn CollectiveCommunicator>>,
}

impl ProcessGroup {
    pub fn new(ranks: Vec<usize>, communicator: Option<Arc<dyn CollectiveCommunicator>>) -> Self {
        Self { ranks, communicator }
    }

    pub fn ranks(&self) -> &[usize] {
        &self.ranks
    }

    pub fn size(&self) -> usize {
        self.ranks.len()
    }

    pub fn contains(&self, global_rank: usize) -> bool {
        self.ranks.contains(&global_rank)
    }

    /// Get local rank within this group
    pub fn local_rank(&self, global_rank: usize) -> Option<usize> {
        self.ranks.iter().position(|&r| r == global_rank)
    }

    /// Global rank of a group rank.
    pub fn global_rank(&self, group_rank: usize) -> Option<usize> {
        self.ranks.get(group_rank).copied()
    }

    /// Sorted member tuple identifying the group.
    pub fn key(&self) -> Vec<usize> {
        sorted_key(&self.ranks)
    }

    pub fn is_member(&self) -> bool {
        self.communicator.is_some()
    }

    pub fn communicator(&self) -> Result<&Arc<dyn CollectiveCommunicator>> {
        self.communicator.as_ref().ok_or_else(|| {
            MeshError::Coordination(format!("local rank is not a member of group {:?}", self.ranks))
        })
    }

    /// True when both handles refer to the same underlying context.
    pub fn same_context(&self, other: &ProcessGroup) -> bool {
        match (&self.communicator, &other.communicator) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for ProcessGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessGroup")
            .field("ranks", &self.ranks)
            .field("member", &self.is_member())
            .finish()
    }
}

fn sorted_key(ranks: &[usize]) -> Vec<usize> {
    let mut key = ranks.to_vec();
    key.sort_unstable();
    key
}

/// Bind this process to its accelerator.
///
/// Purely local: the device ordinal is the process's position on its host.
/// Falls back to CPU when no CUDA device is present.
pub fn bind_device(local_rank: usize) -> Result<Device> {
    if candle_core::utils::cuda_is_available() {
        let device = Device::new_cuda(local_rank)?;
        debug!(local_rank, "bound CUDA device");
        Ok(device)
    } else {
        debug!(local_rank, "no CUDA device available, using CPU");
        Ok(Device::Cpu)
    }
}

/// Builds the topology descriptor. Run identically on every rank.
#[derive(Debug, Clone)]
pub struct TopologyBuilder {
    shape: MeshShape,
    local_rank: Option<usize>,
    ranks_per_host: usize,
}

impl TopologyBuilder {
    /// Fails fast on a world that cannot be factored into the requested sizes.
    pub fn new(world_size: usize, tp_size: usize, dp_size: usize, pp_size: usize) -> Result<Self> {
        Ok(Self {
            shape: MeshShape::new(world_size, tp_size, dp_size, pp_size)?,
            local_rank: None,
            ranks_per_host: 8,
        })
    }

    pub fn from_config(config: &DistributedConfig) -> Result<Self> {
        let mut builder = Self::new(config.world_size, config.tp_size, config.dp_size, config.pp_size)?;
        builder.local_rank = config.local_rank;
        builder.ranks_per_host = config.ranks_per_host.max(1);
        Ok(builder)
    }

    /// Position of this process on its host; defaults to `rank % ranks_per_host`.
    pub fn with_local_rank(mut self, local_rank: usize) -> Self {
        self.local_rank = Some(local_rank);
        self
    }

    pub fn with_ranks_per_host(mut self, ranks_per_host: usize) -> Self {
        self.ranks_per_host = ranks_per_host.max(1);
        self
    }

    pub fn shape(&self) -> MeshShape {
        self.shape
    }

    /// Every distinct group in creation order, starting with the global group.
    pub fn planned_groups(&self) -> Vec<Vec<usize>> {
        let world: Vec<usize> = (0..self.shape.world_size()).collect();
        let candidates = std::iter::once(world)
            .chain(Axis::CREATION_ORDER.iter().flat_map(|&axis| self.shape.axis_groups(axis)))
            .chain(self.shape.model_parallel_groups());

        let mut seen = std::collections::HashSet::new();
        candidates.filter(|ranks| seen.insert(sorted_key(ranks))).collect()
    }

    /// SHA256 over the shape and the planned creation sequence.
    pub fn enumeration_digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(format!(
            "pp={} dp={} tp={};",
            self.shape.size(Axis::Pipeline),
            self.shape.size(Axis::Data),
            self.shape.size(Axis::Tensor)
        ));
        for ranks in self.planned_groups() {
            hasher.update(format!("{:?};", ranks));
        }
        hasher.finalize().into()
    }

    /// Create all groups and return the local rank's view of the mesh.
    pub fn build(&self, backend: &dyn CommunicationBackend) -> Result<TopologyDescriptor> {
        let world_size = self.shape.world_size();
        if backend.world_size() != world_size {
            return Err(MeshError::Config(format!(
                "backend world size {} does not match mesh world size {}",
                backend.world_size(),
                world_size
            )));
        }

        let rank = backend.rank();
        let coordinate = self.shape.coordinate(rank)?;

        // Collective initialization needs a bound device.
        let local_rank = self.local_rank.unwrap_or(rank % self.ranks_per_host);
        let device = bind_device(local_rank)?;

        info!(
            rank,
            world_size,
            tp = self.shape.size(Axis::Tensor),
            dp = self.shape.size(Axis::Data),
            pp = self.shape.size(Axis::Pipeline),
            backend = backend.name(),
            "Building 3D parallel topology"
        );

        let plan = self.planned_groups();
        let mut groups: Vec<ProcessGroup> = Vec::with_capacity(plan.len());
        let mut index: BTreeMap<Vec<usize>, usize> = BTreeMap::new();

        let world_ranks = &plan[0];
        let world = ProcessGroup::new(world_ranks.clone(), backend.new_group(world_ranks)?);
        index.insert(world.key(), 0);
        groups.push(world.clone());

        self.verify_enumeration(&world, rank)?;

        let mut create = |ranks: Vec<usize>| -> Result<ProcessGroup> {
            let key = sorted_key(&ranks);
            if let Some(&i) = index.get(&key) {
                return Ok(groups[i].clone());
            }
            let group = ProcessGroup::new(ranks.clone(), backend.new_group(&ranks)?);
            debug!(ranks = ?ranks, member = group.is_member(), "created communication group");
            index.insert(key, groups.len());
            groups.push(group.clone());
            Ok(group)
        };

        let mut axis_groups: BTreeMap<&'static str, ProcessGroup> = BTreeMap::new();
        for axis in Axis::CREATION_ORDER {
            for ranks in self.shape.axis_groups(axis) {
                let contains_self = ranks.contains(&rank);
                let group = create(ranks)?;
                if contains_self {
                    axis_groups.insert(axis.name(), group);
                }
            }
        }
        let mut mp_group = None;
        for ranks in self.shape.model_parallel_groups() {
            let contains_self = ranks.contains(&rank);
            let group = create(ranks)?;
            if contains_self {
                mp_group = Some(group);
            }
        }

        let mut take = |axis: Axis| {
            axis_groups.remove(axis.name()).ok_or_else(|| {
                MeshError::Coordination(format!("rank {} landed in no {} group", rank, axis))
            })
        };
        let tp_group = take(Axis::Tensor)?;
        let dp_group = take(Axis::Data)?;
        let pp_group = take(Axis::Pipeline)?;
        let mp_group = mp_group.ok_or_else(|| {
            MeshError::Coordination(format!("rank {} landed in no model-parallel group", rank))
        })?;

        // Ensure every rank finished creating groups before anyone uses them
        world.communicator()?.barrier()?;

        let rank_table = (0..world_size)
            .map(|r| self.shape.coordinate(r))
            .collect::<Result<Vec<_>>>()?;

        info!(
            rank,
            pp = coordinate.pipeline,
            dp = coordinate.data,
            tp = coordinate.tensor,
            groups = groups.len(),
            "Topology ready"
        );

        Ok(TopologyDescriptor {
            shape: self.shape,
            rank,
            coordinate,
            device,
            rank_table,
            world,
            tp_group,
            dp_group,
            pp_group,
            mp_group,
            groups,
            index,
        })
    }

    /// Exchange the enumeration digest so divergent ranks fail instead of deadlocking.
    fn verify_enumeration(&self, world: &ProcessGroup, rank: usize) -> Result<()> {
        let local = self.enumeration_digest();
        let gathered = world.communicator()?.all_gather(&digest_to_tensor(&local)?)?;
        let digests = gathered_digests(&gathered)?;
        let reference = &digests[0];
        if let Some(divergent) = digests.iter().position(|d| d != reference) {
            error!(rank, divergent, "group enumeration differs across ranks");
            return Err(MeshError::Coordination(format!(
                "group enumeration on rank {} differs from rank {}",
                world.global_rank(divergent).unwrap_or(divergent),
                world.global_rank(0).unwrap_or(0)
            )));
        }
        Ok(())
    }
}

/// Immutable description of the mesh as seen from one rank.
///
/// Owns every communication group for the lifetime of the process; released
/// together by `destroy`.
pub struct TopologyDescriptor {
    shape: MeshShape,
    rank: usize,
    coordinate: MeshCoordinate,
    device: Device,
    rank_table: Vec<MeshCoordinate>,
    world: ProcessGroup,
    tp_group: ProcessGroup,
    dp_group: ProcessGroup,
    pp_group: ProcessGroup,
    mp_group: ProcessGroup,
    /// All groups in creation order; index 0 is the global group
    groups: Vec<ProcessGroup>,
    index: BTreeMap<Vec<usize>, usize>,
}

impl TopologyDescriptor {
    pub fn shape(&self) -> MeshShape {
        self.shape
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.shape.world_size()
    }

    pub fn coordinate(&self) -> MeshCoordinate {
        self.coordinate
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Coordinate of any rank in the world.
    pub fn coordinate_of(&self, rank: usize) -> Option<MeshCoordinate> {
        self.rank_table.get(rank).copied()
    }

    pub fn rank_table(&self) -> &[MeshCoordinate] {
        &self.rank_table
    }

    pub fn world_group(&self) -> &ProcessGroup {
        &self.world
    }

    pub fn tp_group(&self) -> &ProcessGroup {
        &self.tp_group
    }

    pub fn dp_group(&self) -> &ProcessGroup {
        &self.dp_group
    }

    pub fn pp_group(&self) -> &ProcessGroup {
        &self.pp_group
    }

    pub fn model_parallel_group(&self) -> &ProcessGroup {
        &self.mp_group
    }

    pub fn group(&self, axis: Axis) -> &ProcessGroup {
        match axis {
            Axis::Tensor => &self.tp_group,
            Axis::Data => &self.dp_group,
            Axis::Pipeline => &self.pp_group,
        }
    }

    /// Look a group up by membership, in any order.
    pub fn group_for_ranks(&self, ranks: &[usize]) -> Option<&ProcessGroup> {
        self.index.get(&sorted_key(ranks)).map(|&i| &self.groups[i])
    }

    /// Number of distinct communication contexts.
    pub fn num_groups(&self) -> usize {
        self.groups.len()
    }

    pub fn tp_rank(&self) -> usize {
        self.coordinate.tensor
    }

    pub fn dp_rank(&self) -> usize {
        self.coordinate.data
    }

    pub fn pp_rank(&self) -> usize {
        self.coordinate.pipeline
    }

    /// Tear down every group, the global group last.
    ///
    /// Each multi-member group the local rank belongs to is synchronized
    /// before release, walking groups in creation order so members meet in
    /// the same sequence.
    pub fn destroy(self) -> Result<()> {
        let TopologyDescriptor { rank, world, groups, .. } = self;

        for group in groups.into_iter().skip(1) {
            if group.is_member() && group.size() > 1 {
                group.communicator()?.barrier()?;
            }
            drop(group);
        }

        world.communicator()?.barrier()?;
        drop(world);

        info!(rank, "Topology destroyed");
        Ok(())
    }
}

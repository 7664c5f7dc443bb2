//! ZeRO stage 1: optimizer state sharded across the data-parallel group.
//!
//! All parameters are laid end to end in construction order and the flat
//! range is split into `dp_size` contiguous chunks, as even as integer
//! division allows. Each rank's base optimizer only sees the slices of its
//! chunk; after every step the updated slices are reassembled on all ranks.

use super::optimizer::{
    check_unique_names, NamedOptimizer, NamedParams, OptimizerKind, ParamGroup, StateDict,
};
use super::parameter::Parameter;
use crate::distributed::groups::ProcessGroup;
use crate::utils::error::{MeshError, Result};
use candle_core::{DType, Tensor};
use std::collections::BTreeMap;
use std::ops::Range;
use tracing::info;

/// Which flat range of each parameter every data-parallel rank owns.
///
/// Fixed at construction and never rebalanced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardLayout {
    dp_size: usize,
    dp_rank: usize,
    offsets: BTreeMap<String, Vec<Range<usize>>>,
    rank_elements: Vec<usize>,
}

impl ShardLayout {
    /// Balanced split of `(name, numel)` pairs laid end to end.
    pub fn balanced(named_sizes: &[(String, usize)], dp_size: usize, dp_rank: usize) -> Result<Self> {
        if dp_size == 0 || dp_rank >= dp_size {
            return Err(MeshError::Config(format!(
                "data-parallel rank {} outside group of size {}",
                dp_rank, dp_size
            )));
        }

        let total: usize = named_sizes.iter().map(|(_, n)| n).sum();
        let base = total / dp_size;
        let remainder = total % dp_size;
        // The first `remainder` ranks take one extra element.
        let rank_elements: Vec<usize> = (0..dp_size)
            .map(|r| base + usize::from(r < remainder))
            .collect();
        let mut bounds = Vec::with_capacity(dp_size);
        let mut start = 0;
        for &len in &rank_elements {
            bounds.push(start..start + len);
            start += len;
        }

        let mut offsets = BTreeMap::new();
        let mut param_start = 0;
        for (name, numel) in named_sizes {
            let param_end = param_start + numel;
            let ranges = bounds
                .iter()
                .map(|b| {
                    let lo = b.start.max(param_start);
                    let hi = b.end.min(param_end);
                    if lo < hi {
                        (lo - param_start)..(hi - param_start)
                    } else {
                        0..0
                    }
                })
                .collect();
            if offsets.insert(name.clone(), ranges).is_some() {
                return Err(MeshError::DuplicateKey(format!(
                    "parameter `{}` appears more than once",
                    name
                )));
            }
            param_start = param_end;
        }

        Ok(Self {
            dp_size,
            dp_rank,
            offsets,
            rank_elements,
        })
    }

    pub fn dp_size(&self) -> usize {
        self.dp_size
    }

    pub fn dp_rank(&self) -> usize {
        self.dp_rank
    }

    /// `offsets[name][r]`: range of `name` owned by data-parallel rank `r`.
    pub fn param_offsets(&self) -> &BTreeMap<String, Vec<Range<usize>>> {
        &self.offsets
    }

    /// The local rank's range of `name`, if non-empty.
    pub fn local_range(&self, name: &str) -> Option<Range<usize>> {
        self.offsets
            .get(name)
            .and_then(|ranges| ranges.get(self.dp_rank))
            .filter(|r| !r.is_empty())
            .cloned()
    }

    /// Elements of optimizer state held by data-parallel rank `rank`.
    pub fn rank_elements(&self, rank: usize) -> usize {
        self.rank_elements.get(rank).copied().unwrap_or(0)
    }
}

struct Sharded {
    name: String,
    full: Parameter,
    shard: Option<(Range<usize>, Parameter)>,
}

/// Wraps a base optimizer so that each data-parallel rank owns a slice of its state.
///
/// Gradients on the full parameters must already be averaged across the
/// data-parallel group, which the fp32 accumulator does when it wraps this
/// optimizer.
pub struct ZeroShardedOptimizer {
    layout: ShardLayout,
    params: Vec<Sharded>,
    optimizer: Box<dyn NamedOptimizer>,
    dp_group: ProcessGroup,
}

impl ZeroShardedOptimizer {
    pub fn new<O>(named_params: impl Into<NamedParams>, optimizer_builder: O, dp_group: &ProcessGroup) -> Result<Self>
    where
        O: FnOnce(Vec<ParamGroup>) -> Result<Box<dyn NamedOptimizer>>,
    {
        let groups = named_params.into().into_groups();
        check_unique_names(&groups)?;

        let dp_rank = if dp_group.size() > 1 { dp_group.communicator()?.rank() } else { 0 };
        let named_sizes: Vec<(String, usize)> = groups
            .iter()
            .flat_map(|g| g.named_params.iter())
            .map(|(name, p)| (name.clone(), p.elem_count()))
            .collect();
        let layout = ShardLayout::balanced(&named_sizes, dp_group.size(), dp_rank)?;

        let mut params = Vec::with_capacity(named_sizes.len());
        let mut shard_groups = Vec::with_capacity(groups.len());
        for group in &groups {
            let mut shard_params = Vec::new();
            for (name, full) in &group.named_params {
                let shard = match layout.local_range(name) {
                    Some(range) => {
                        let slice = full.tensor().flatten_all()?.narrow(0, range.start, range.len())?;
                        let shard = Parameter::new(&slice)?;
                        shard_params.push((name.clone(), shard.clone()));
                        Some((range, shard))
                    }
                    None => None,
                };
                params.push(Sharded {
                    name: name.clone(),
                    full: full.clone(),
                    shard,
                });
            }
            shard_groups.push(group.with_params(shard_params));
        }

        let optimizer = optimizer_builder(shard_groups)?;
        info!(
            dp_rank,
            dp_size = dp_group.size(),
            local_elements = layout.rank_elements(dp_rank),
            base = %optimizer.kind(),
            "Built ZeRO-1 sharded optimizer"
        );

        Ok(Self {
            layout,
            params,
            optimizer,
            dp_group: dp_group.clone(),
        })
    }

    /// Rebuild every full parameter from the slices owned across the group.
    fn gather_params(&self) -> Result<()> {
        for p in &self.params {
            let numel = p.full.elem_count();
            let flat = match &p.shard {
                Some((range, shard)) => {
                    let device = p.full.device();
                    let mut pieces = Vec::with_capacity(3);
                    if range.start > 0 {
                        pieces.push(Tensor::zeros(range.start, DType::F32, device)?);
                    }
                    pieces.push(shard.tensor().to_dtype(DType::F32)?);
                    if range.end < numel {
                        pieces.push(Tensor::zeros(numel - range.end, DType::F32, device)?);
                    }
                    Tensor::cat(&pieces, 0)?
                }
                None => Tensor::zeros(numel, DType::F32, p.full.device())?,
            };

            // Every element has exactly one owner, so the sum is the owner's value.
            let full = if self.dp_group.size() > 1 {
                self.dp_group.communicator()?.all_reduce(&flat)?
            } else {
                flat
            };
            p.full.set(&full.reshape(p.full.shape())?)?;
        }
        Ok(())
    }
}

impl NamedOptimizer for ZeroShardedOptimizer {
    fn kind(&self) -> OptimizerKind {
        OptimizerKind::ZeroSharded
    }

    fn inner(&self) -> Option<&dyn NamedOptimizer> {
        Some(self.optimizer.as_ref())
    }

    fn step(&mut self) -> Result<()> {
        for p in &self.params {
            let Some((range, shard)) = &p.shard else {
                continue;
            };
            let grad = match p.full.grad() {
                Some(g) => Some(g.flatten_all()?.narrow(0, range.start, range.len())?),
                None => None,
            };
            shard.set_grad(grad)?;
        }
        self.optimizer.step()?;
        self.gather_params()
    }

    fn zero_grad(&mut self) -> Result<()> {
        self.optimizer.zero_grad()?;
        for p in &self.params {
            p.full.zero_grad();
        }
        Ok(())
    }

    /// Only the local shard's state; every data-parallel rank saves its own.
    fn state_dict(&self) -> Result<StateDict> {
        self.optimizer.state_dict()
    }

    fn load_state_dict(&mut self, state: StateDict) -> Result<()> {
        self.optimizer.load_state_dict(state)
    }

    fn shard_layout(&self) -> Option<&ShardLayout> {
        Some(&self.layout)
    }

    fn param_names(&self) -> Vec<String> {
        self.params.iter().map(|p| p.name.clone()).collect()
    }
}

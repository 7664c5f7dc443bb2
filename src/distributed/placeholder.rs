//! Placeholder routing along the pipeline axis.
//!
//! A value produced by one pipeline stage exists on that stage only. Every
//! other stage carries a `TensorPointer` naming the owner, which is what the
//! pipeline transport keys its sends and receives on.

use super::groups::TopologyDescriptor;
use super::mesh::{Axis, MeshCoordinate, MeshShape};
use crate::utils::error::{MeshError, Result};
use candle_core::Tensor;
use std::collections::BTreeMap;

/// Stand-in for a tensor held by another pipeline rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorPointer {
    /// Pipeline rank holding the real value
    pub group_rank: usize,
}

/// A value slot: always exactly one of real payload or placeholder.
#[derive(Debug, Clone)]
pub enum Slot {
    Real { owner: usize, tensor: Tensor },
    Placeholder(TensorPointer),
}

impl Slot {
    /// Pipeline rank owning the value, whichever variant this is.
    pub fn owner_rank(&self) -> usize {
        match self {
            Slot::Real { owner, .. } => *owner,
            Slot::Placeholder(pointer) => pointer.group_rank,
        }
    }

    pub fn is_real(&self) -> bool {
        matches!(self, Slot::Real { .. })
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, Slot::Placeholder(_))
    }

    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            Slot::Real { tensor, .. } => Some(tensor),
            Slot::Placeholder(_) => None,
        }
    }

    /// Payload of a real slot. Reading a placeholder is an error.
    pub fn tensor(&self) -> Result<&Tensor> {
        self.as_tensor().ok_or_else(|| placeholder_read(self.owner_rank()))
    }

    pub fn into_tensor(self) -> Result<Tensor> {
        match self {
            Slot::Real { tensor, .. } => Ok(tensor),
            Slot::Placeholder(pointer) => Err(placeholder_read(pointer.group_rank)),
        }
    }
}

fn placeholder_read(owner: usize) -> MeshError {
    MeshError::Coordination(format!(
        "attempted to read a placeholder; the value lives on pipeline rank {}",
        owner
    ))
}

/// Per-micro-batch mapping of field name to slot, iterated in name order.
pub type Batch = BTreeMap<String, Slot>;

/// A named field and the pipeline rank that owns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: String,
    pub owner: usize,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, owner: usize) -> Self {
        Self { name: name.into(), owner }
    }
}

/// Decides, for the local rank, which values are materialized.
#[derive(Debug, Clone, Copy)]
pub struct PlaceholderRouter {
    pp_rank: usize,
    pp_size: usize,
}

impl PlaceholderRouter {
    pub fn new(pp_rank: usize, pp_size: usize) -> Result<Self> {
        if pp_size == 0 || pp_rank >= pp_size {
            return Err(MeshError::Config(format!(
                "pipeline rank {} outside pipeline of size {}",
                pp_rank, pp_size
            )));
        }
        Ok(Self { pp_rank, pp_size })
    }

    pub fn for_topology(topology: &TopologyDescriptor) -> Result<Self> {
        Self::new(topology.pp_rank(), topology.shape().size(Axis::Pipeline))
    }

    pub fn from_coordinate(coordinate: MeshCoordinate, shape: MeshShape) -> Result<Self> {
        Self::new(coordinate.pipeline, shape.size(Axis::Pipeline))
    }

    pub fn pp_rank(&self) -> usize {
        self.pp_rank
    }

    /// Whether the local rank materializes values owned by `owner`.
    pub fn owns(&self, owner: usize) -> Result<bool> {
        if owner >= self.pp_size {
            return Err(MeshError::Config(format!(
                "owner pipeline rank {} outside pipeline of size {}",
                owner, self.pp_size
            )));
        }
        Ok(owner == self.pp_rank)
    }

    /// Route one value. `produce` only runs on the owning rank.
    pub fn route<F>(&self, owner: usize, produce: F) -> Result<Slot>
    where
        F: FnOnce() -> Result<Tensor>,
    {
        if self.owns(owner)? {
            Ok(Slot::Real { owner, tensor: produce()? })
        } else {
            Ok(Slot::Placeholder(TensorPointer { group_rank: owner }))
        }
    }

    /// Route every field independently in one pass.
    pub fn route_batch<F>(&self, fields: &[FieldSpec], mut produce: F) -> Result<Batch>
    where
        F: FnMut(&str) -> Result<Tensor>,
    {
        let mut batch = Batch::new();
        for field in fields {
            if batch.contains_key(&field.name) {
                return Err(MeshError::DuplicateKey(field.name.clone()));
            }
            let slot = self.route(field.owner, || produce(&field.name))?;
            batch.insert(field.name.clone(), slot);
        }
        Ok(batch)
    }

    /// Move every field of `batch` onto pipeline rank `owner`.
    ///
    /// The owner keeps its payloads; every other rank gets placeholders.
    pub fn set_placeholders(&self, batch: Batch, owner: usize) -> Result<Batch> {
        let owned = self.owns(owner)?;
        batch
            .into_iter()
            .map(|(name, slot)| {
                let slot = if owned {
                    Slot::Real { owner, tensor: slot.into_tensor()? }
                } else {
                    Slot::Placeholder(TensorPointer { group_rank: owner })
                };
                Ok((name, slot))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn ones() -> Result<Tensor> {
        Ok(Tensor::ones((2, 3), candle_core::DType::F32, &Device::Cpu)?)
    }

    #[test]
    fn test_exactly_one_real_value_per_pipeline_group() -> Result<()> {
        let shape = MeshShape::new(8, 2, 2, 2)?;
        for owner in 0..2 {
            for group in shape.axis_groups(Axis::Pipeline) {
                let mut real = 0;
                for &rank in &group {
                    let router = PlaceholderRouter::from_coordinate(shape.coordinate(rank)?, shape)?;
                    let slot = router.route(owner, ones)?;
                    assert_eq!(slot.owner_rank(), owner);
                    if slot.is_real() {
                        real += 1;
                    }
                }
                assert_eq!(real, 1);
            }
        }
        Ok(())
    }

    #[test]
    fn test_fields_are_classified_independently() -> Result<()> {
        let fields = [FieldSpec::new("input_ids", 0), FieldSpec::new("label_ids", 3)];

        let first = PlaceholderRouter::new(0, 4)?.route_batch(&fields, |_| ones())?;
        assert!(first["input_ids"].is_real());
        assert!(first["label_ids"].is_placeholder());

        let middle = PlaceholderRouter::new(1, 4)?.route_batch(&fields, |_| ones())?;
        assert!(middle.values().all(Slot::is_placeholder));
        Ok(())
    }

    #[test]
    fn test_producer_runs_only_on_owner() -> Result<()> {
        let router = PlaceholderRouter::new(1, 2)?;
        let mut calls = 0;
        let fields = [FieldSpec::new("a", 0), FieldSpec::new("b", 1)];
        router.route_batch(&fields, |_| {
            calls += 1;
            ones()
        })?;
        assert_eq!(calls, 1);
        Ok(())
    }

    #[test]
    fn test_placeholder_payload_is_unreadable() -> Result<()> {
        let slot = PlaceholderRouter::new(0, 2)?.route(1, ones)?;
        assert!(slot.as_tensor().is_none());
        assert!(slot.tensor().is_err());
        assert_eq!(slot.owner_rank(), 1);
        Ok(())
    }

    #[test]
    fn test_rejects_bad_owner_and_duplicates() -> Result<()> {
        let router = PlaceholderRouter::new(0, 2)?;
        assert!(matches!(router.route(2, ones), Err(MeshError::Config(_))));

        let fields = [FieldSpec::new("x", 0), FieldSpec::new("x", 1)];
        assert!(matches!(
            router.route_batch(&fields, |_| ones()),
            Err(MeshError::DuplicateKey(_))
        ));
        Ok(())
    }

    #[test]
    fn test_set_placeholders() -> Result<()> {
        let owner = PlaceholderRouter::new(0, 2)?;
        let other = PlaceholderRouter::new(1, 2)?;
        let fields = [FieldSpec::new("x", 0), FieldSpec::new("y", 0)];

        let batch = owner.route_batch(&fields, |_| ones())?;
        let moved = owner.set_placeholders(batch, 0)?;
        assert!(moved.values().all(Slot::is_real));

        let batch = other.route_batch(&fields, |_| ones())?;
        let moved = other.set_placeholders(batch, 0)?;
        assert!(moved.values().all(|s| s.is_placeholder() && s.owner_rank() == 0));

        // The new owner cannot conjure payloads it never had.
        let batch = other.route_batch(&fields, |_| ones())?;
        assert!(other.set_placeholders(batch, 1).is_err());
        Ok(())
    }
}

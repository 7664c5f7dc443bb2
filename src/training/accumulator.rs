//! Gradient accumulation buffers.
//!
//! The accumulator sits between the model and the optimizer: micro-batch
//! gradients land in its buffers, and the optimizer only ever sees the
//! "optimizer view" of each parameter that the accumulator hands out.

use super::optimizer::{state_tensor, take_nested, StateDict, StateValue};
use super::parameter::Parameter;
use crate::distributed::groups::ProcessGroup;
use crate::utils::error::{MeshError, Result};
use candle_core::{DType, Device, Tensor};
use std::collections::BTreeMap;
use std::ops::Range;
use tracing::{debug, info};

/// Per-name accumulation contract.
pub trait GradientAccumulator: Send {
    /// The parameter the optimizer should update in place of `name`.
    fn parameter_for_optimizer(&self, name: &str) -> Result<Parameter>;

    /// Move the gradients currently on the model parameters into the buffers.
    fn accumulate_model_grads(&mut self) -> Result<()>;

    /// Reduce the buffers and publish them as optimizer-view gradients.
    fn sync_gradients(&mut self) -> Result<()>;

    /// Propagate optimizer-view values back to the model after an update.
    fn step(&mut self) -> Result<()>;

    fn zero_grad(&mut self) -> Result<()>;

    fn state_dict(&self) -> Result<StateDict>;

    fn load_state_dict(&mut self, state: StateDict) -> Result<()>;

    /// Restrict reduction to the flat ranges owned by `dp_rank`.
    ///
    /// `offsets[name][r]` is the range of `name` owned by data-parallel rank `r`.
    fn assign_param_offsets(
        &mut self,
        dp_rank: usize,
        offsets: &BTreeMap<String, Vec<Range<usize>>>,
    ) -> Result<()>;
}

struct Slot {
    model: Parameter,
    master: Parameter,
    buffer: Tensor,
    offsets: Option<Vec<Range<usize>>>,
}

/// Accumulates gradients in fp32 and keeps fp32 master weights.
pub struct Fp32GradientAccumulator {
    slots: BTreeMap<String, Slot>,
    dp_group: Option<ProcessGroup>,
    dp_rank: Option<usize>,
    step: u64,
}

impl Fp32GradientAccumulator {
    pub fn new(named_params: Vec<(String, Parameter)>) -> Result<Self> {
        let mut slots = BTreeMap::new();
        for (name, model) in named_params {
            if slots.contains_key(&name) {
                return Err(MeshError::DuplicateKey(format!(
                    "parameter `{}` appears more than once",
                    name
                )));
            }
            let master = Parameter::new(&model.tensor().to_dtype(DType::F32)?)?;
            let buffer = Tensor::zeros(model.shape(), DType::F32, model.device())?;
            slots.insert(name, Slot { model, master, buffer, offsets: None });
        }

        let total: usize = slots.values().map(|s| s.model.elem_count()).sum();
        info!(params = slots.len(), elements = total, "Built fp32 gradient accumulator");

        Ok(Self {
            slots,
            dp_group: None,
            dp_rank: None,
            step: 0,
        })
    }

    /// Average gradients across `group` before every update.
    pub fn with_data_parallel(mut self, group: &ProcessGroup) -> Self {
        self.dp_group = Some(group.clone());
        self
    }

    /// Add a gradient for `name` directly.
    pub fn accumulate_grad(&mut self, name: &str, grad: &Tensor) -> Result<()> {
        let slot = self.slot_mut(name)?;
        if grad.dims() != slot.buffer.dims() {
            return Err(MeshError::Config(format!(
                "gradient for `{}` has shape {:?}, expected {:?}",
                name,
                grad.dims(),
                slot.buffer.dims()
            )));
        }
        slot.buffer = slot.buffer.add(&grad.to_dtype(DType::F32)?)?;
        Ok(())
    }

    pub fn buffer(&self, name: &str) -> Result<&Tensor> {
        Ok(&self.slot(name)?.buffer)
    }

    pub fn step_count(&self) -> u64 {
        self.step
    }

    /// Data-parallel rank whose ranges are reduced, once offsets are assigned.
    pub fn assigned_dp_rank(&self) -> Option<usize> {
        self.dp_rank
    }

    fn slot(&self, name: &str) -> Result<&Slot> {
        self.slots
            .get(name)
            .ok_or_else(|| MeshError::UnknownParameter(name.to_string()))
    }

    fn slot_mut(&mut self, name: &str) -> Result<&mut Slot> {
        self.slots
            .get_mut(name)
            .ok_or_else(|| MeshError::UnknownParameter(name.to_string()))
    }

    /// Mean of `slot.buffer` over the data-parallel group.
    fn reduced_grad(slot: &Slot, group: Option<&ProcessGroup>) -> Result<Tensor> {
        let Some(group) = group.filter(|g| g.size() > 1) else {
            return Ok(slot.buffer.clone());
        };
        let comm = group.communicator()?;
        let scale = 1.0 / group.size() as f64;

        match &slot.offsets {
            None => Ok((comm.all_reduce(&slot.buffer)? * scale)?),
            Some(ranges) => {
                // Only the owned range is reduced; the rest stays zero since
                // the sharded optimizer never reads it.
                let flat = slot.buffer.flatten_all()?;
                let n = flat.elem_count();
                let own = ranges.get(comm.rank()).cloned().unwrap_or(0..0);
                let reduced = comm.reduce_scatter_ranges(&flat, ranges)?;
                let grad = match reduced {
                    Some(part) => {
                        let device = flat.device();
                        let mut pieces = Vec::with_capacity(3);
                        if own.start > 0 {
                            pieces.push(Tensor::zeros(own.start, DType::F32, device)?);
                        }
                        pieces.push((part * scale)?);
                        if own.end < n {
                            pieces.push(Tensor::zeros(n - own.end, DType::F32, device)?);
                        }
                        Tensor::cat(&pieces, 0)?
                    }
                    None => flat.zeros_like()?,
                };
                Ok(grad.reshape(slot.buffer.shape())?)
            }
        }
    }
}

impl GradientAccumulator for Fp32GradientAccumulator {
    fn parameter_for_optimizer(&self, name: &str) -> Result<Parameter> {
        Ok(self.slot(name)?.master.clone())
    }

    fn accumulate_model_grads(&mut self) -> Result<()> {
        for slot in self.slots.values_mut() {
            if let Some(grad) = slot.model.take_grad() {
                slot.buffer = slot.buffer.add(&grad.to_dtype(DType::F32)?)?;
            }
        }
        Ok(())
    }

    fn sync_gradients(&mut self) -> Result<()> {
        // Pick up anything still sitting on the model parameters.
        self.accumulate_model_grads()?;
        let group = self.dp_group.as_ref();
        for slot in self.slots.values() {
            let grad = Self::reduced_grad(slot, group)?;
            slot.master.set_grad(Some(grad))?;
        }
        Ok(())
    }

    fn step(&mut self) -> Result<()> {
        for slot in self.slots.values() {
            slot.model.set(slot.master.tensor())?;
        }
        self.step += 1;
        Ok(())
    }

    fn zero_grad(&mut self) -> Result<()> {
        for slot in self.slots.values_mut() {
            slot.buffer = slot.buffer.zeros_like()?;
            slot.master.zero_grad();
            slot.model.zero_grad();
        }
        Ok(())
    }

    /// `{"step": i64[1], "buffers": {name: f32}, "master": {name: f32}}`
    fn state_dict(&self) -> Result<StateDict> {
        let mut buffers = StateDict::new();
        let mut master = StateDict::new();
        for (name, slot) in &self.slots {
            buffers.insert(name.clone(), StateValue::Tensor(slot.buffer.clone()));
            master.insert(name.clone(), StateValue::Tensor(slot.master.snapshot()?));
        }

        let mut state = StateDict::new();
        state.insert(
            "step".to_string(),
            StateValue::Tensor(Tensor::new(&[self.step as i64], &Device::Cpu)?),
        );
        state.insert("buffers".to_string(), StateValue::Nested(buffers));
        state.insert("master".to_string(), StateValue::Nested(master));
        Ok(state)
    }

    fn load_state_dict(&mut self, mut state: StateDict) -> Result<()> {
        let step = state_tensor(&state, "step")?
            .to_vec1::<i64>()?
            .first()
            .copied()
            .ok_or_else(|| MeshError::Checkpoint("empty step counter".to_string()))?;
        let buffers = take_nested(&mut state, "buffers")?;
        let master = take_nested(&mut state, "master")?;

        for name in buffers.keys().chain(master.keys()) {
            self.slot(name)?;
        }
        for (name, slot) in self.slots.iter_mut() {
            let buffer = state_tensor(&buffers, name)?;
            if buffer.dims() != slot.buffer.dims() {
                return Err(MeshError::Checkpoint(format!(
                    "buffer `{}` has shape {:?}, expected {:?}",
                    name,
                    buffer.dims(),
                    slot.buffer.dims()
                )));
            }
            slot.buffer = buffer.to_dtype(DType::F32)?.to_device(slot.model.device())?;
            slot.master.set(state_tensor(&master, name)?)?;
        }

        self.step = step as u64;
        Ok(())
    }

    fn assign_param_offsets(
        &mut self,
        dp_rank: usize,
        offsets: &BTreeMap<String, Vec<Range<usize>>>,
    ) -> Result<()> {
        if let Some(group) = self.dp_group.as_ref().filter(|g| g.is_member()) {
            let own = group.communicator()?.rank();
            if own != dp_rank {
                return Err(MeshError::Config(format!(
                    "offsets assigned for data-parallel rank {} on rank {}",
                    dp_rank, own
                )));
            }
        }
        for (name, ranges) in offsets {
            let slot = self.slot_mut(name)?;
            let covered: usize = ranges.iter().map(|r| r.len()).sum();
            if covered != slot.buffer.elem_count() {
                return Err(MeshError::Config(format!(
                    "offsets for `{}` cover {} of {} elements",
                    name,
                    covered,
                    slot.buffer.elem_count()
                )));
            }
            slot.offsets = Some(ranges.clone());
        }
        self.dp_rank = Some(dp_rank);
        debug!(dp_rank, params = offsets.len(), "Assigned sharded reduction offsets");
        Ok(())
    }
}

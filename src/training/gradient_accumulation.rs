//! Optimizer built on top of a gradient accumulator.
//!
//! The accumulator is built first and decides which parameter each name is
//! optimized through; the base optimizer is only built afterwards, over those
//! optimizer views. Neither layer knows the other's internals.

use super::accumulator::GradientAccumulator;
use super::optimizer::{
    check_unique_names, NamedOptimizer, NamedParams, OptimizerKind, ParamGroup, StateDict,
    StateValue,
};
use super::parameter::Parameter;
use crate::utils::error::{MeshError, Result};
use std::collections::BTreeSet;
use tracing::info;

/// State-dict key under which the accumulator's state is nested.
pub const ACCUMULATOR_STATE_KEY: &str = "gradient_accumulator";

pub struct GradientAccumulationOptimizer {
    accumulator: Box<dyn GradientAccumulator>,
    optimizer: Box<dyn NamedOptimizer>,
}

impl GradientAccumulationOptimizer {
    /// Compose an accumulator factory with a base optimizer factory.
    ///
    /// Fails with `DuplicateKey` if a name appears twice across groups.
    pub fn new<A, O>(named_params: impl Into<NamedParams>, accumulator_builder: A, optimizer_builder: O) -> Result<Self>
    where
        A: FnOnce(Vec<(String, Parameter)>) -> Result<Box<dyn GradientAccumulator>>,
        O: FnOnce(Vec<ParamGroup>) -> Result<Box<dyn NamedOptimizer>>,
    {
        let groups = named_params.into().into_groups();
        check_unique_names(&groups)?;

        let all_params: Vec<(String, Parameter)> = groups
            .iter()
            .flat_map(|g| g.named_params.iter().cloned())
            .collect();
        let mut accumulator = accumulator_builder(all_params)?;

        // Rewire every group onto the accumulator's optimizer views
        let converted = groups
            .iter()
            .map(|group| {
                let named_params = group
                    .named_params
                    .iter()
                    .map(|(name, _)| Ok((name.clone(), accumulator.parameter_for_optimizer(name)?)))
                    .collect::<Result<Vec<_>>>()?;
                Ok(group.with_params(named_params))
            })
            .collect::<Result<Vec<_>>>()?;
        let optimizer = optimizer_builder(converted)?;

        // A sharded base optimizer only needs its own ranges reduced
        if let Some(layout) = optimizer.shard_layout() {
            accumulator.assign_param_offsets(layout.dp_rank(), layout.param_offsets())?;
        }

        info!(
            groups = groups.len(),
            params = optimizer.param_names().len(),
            base = %optimizer.kind(),
            sharded = optimizer.shard_layout().is_some(),
            "Built gradient accumulation optimizer"
        );

        Ok(Self {
            accumulator,
            optimizer,
        })
    }

    pub fn accumulator(&self) -> &dyn GradientAccumulator {
        self.accumulator.as_ref()
    }

    pub fn accumulator_mut(&mut self) -> &mut dyn GradientAccumulator {
        self.accumulator.as_mut()
    }
}

impl NamedOptimizer for GradientAccumulationOptimizer {
    fn kind(&self) -> OptimizerKind {
        OptimizerKind::GradientAccumulation
    }

    fn inner(&self) -> Option<&dyn NamedOptimizer> {
        Some(self.optimizer.as_ref())
    }

    fn accumulate(&mut self) -> Result<()> {
        self.accumulator.accumulate_model_grads()
    }

    /// Publish reduced gradients, update through the base optimizer, then
    /// let the accumulator propagate the new values to the model.
    fn step(&mut self) -> Result<()> {
        self.accumulator.sync_gradients()?;
        self.optimizer.step()?;
        self.accumulator.step()
    }

    fn zero_grad(&mut self) -> Result<()> {
        self.optimizer.zero_grad()?;
        self.accumulator.zero_grad()
    }

    fn state_dict(&self) -> Result<StateDict> {
        let mut state = self.optimizer.state_dict()?;
        if state.contains_key(ACCUMULATOR_STATE_KEY) {
            return Err(MeshError::DuplicateKey(format!(
                "base optimizer state already has `{}`",
                ACCUMULATOR_STATE_KEY
            )));
        }
        state.insert(
            ACCUMULATOR_STATE_KEY.to_string(),
            StateValue::Nested(self.accumulator.state_dict()?),
        );
        Ok(state)
    }

    fn load_state_dict(&mut self, mut state: StateDict) -> Result<()> {
        // The base optimizer must never see the accumulator's key.
        let accumulator_state = match state.remove(ACCUMULATOR_STATE_KEY) {
            Some(StateValue::Nested(inner)) => inner,
            Some(StateValue::Tensor(_)) => {
                return Err(MeshError::Checkpoint(format!(
                    "`{}` must be a mapping",
                    ACCUMULATOR_STATE_KEY
                )))
            }
            None => {
                return Err(MeshError::Checkpoint(format!(
                    "state dict has no `{}` entry",
                    ACCUMULATOR_STATE_KEY
                )))
            }
        };
        self.optimizer.load_state_dict(state)?;
        self.accumulator.load_state_dict(accumulator_state)
    }

    fn state_dict_additional_keys(&self) -> BTreeSet<String> {
        let mut keys = self.optimizer.state_dict_additional_keys();
        keys.insert(ACCUMULATOR_STATE_KEY.to_string());
        keys
    }

    fn param_names(&self) -> Vec<String> {
        self.optimizer.param_names()
    }
}

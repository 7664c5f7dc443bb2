//! Optimizer capability contract shared by every layer of the optimizer stack.
//!
//! Layers compose by wrapping: a layer owns the optimizer it delegates to and
//! exposes it through `inner()`, which is what `is_wrapping` walks.

use super::parameter::Parameter;
use super::zero::ShardLayout;
use crate::utils::error::{MeshError, Result};
use candle_core::Tensor;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

/// Leaf or subtree of a state dict.
#[derive(Debug, Clone)]
pub enum StateValue {
    Tensor(Tensor),
    Nested(StateDict),
}

/// Nested mapping with string keys and tensor leaves.
pub type StateDict = BTreeMap<String, StateValue>;

/// Borrow a tensor leaf.
pub fn state_tensor<'a>(state: &'a StateDict, key: &str) -> Result<&'a Tensor> {
    match state.get(key) {
        Some(StateValue::Tensor(t)) => Ok(t),
        Some(StateValue::Nested(_)) => Err(MeshError::Checkpoint(format!("`{}` is not a tensor", key))),
        None => Err(MeshError::Checkpoint(format!("missing state entry `{}`", key))),
    }
}

/// Remove a subtree.
pub fn take_nested(state: &mut StateDict, key: &str) -> Result<StateDict> {
    match state.remove(key) {
        Some(StateValue::Nested(inner)) => Ok(inner),
        Some(StateValue::Tensor(_)) => Err(MeshError::Checkpoint(format!("`{}` is not a mapping", key))),
        None => Err(MeshError::Checkpoint(format!("missing state entry `{}`", key))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptimizerKind {
    AdamW,
    GradientAccumulation,
    ZeroSharded,
}

impl OptimizerKind {
    pub fn name(&self) -> &'static str {
        match self {
            OptimizerKind::AdamW => "AdamW",
            OptimizerKind::GradientAccumulation => "GradientAccumulationOptimizer",
            OptimizerKind::ZeroSharded => "ZeroShardedOptimizer",
        }
    }
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Named parameters sharing hyperparameter overrides.
#[derive(Debug, Clone, Default)]
pub struct ParamGroup {
    pub named_params: Vec<(String, Parameter)>,
    pub lr: Option<f64>,
    pub weight_decay: Option<f64>,
}

impl ParamGroup {
    pub fn new(named_params: Vec<(String, Parameter)>) -> Self {
        Self {
            named_params,
            ..Default::default()
        }
    }

    pub fn with_lr(mut self, lr: f64) -> Self {
        self.lr = Some(lr);
        self
    }

    pub fn with_weight_decay(mut self, weight_decay: f64) -> Self {
        self.weight_decay = Some(weight_decay);
        self
    }

    /// Same overrides, different parameters.
    pub fn with_params(&self, named_params: Vec<(String, Parameter)>) -> Self {
        Self {
            named_params,
            lr: self.lr,
            weight_decay: self.weight_decay,
        }
    }
}

/// Either a flat list of named parameters or explicit groups.
#[derive(Debug, Clone)]
pub enum NamedParams {
    Flat(Vec<(String, Parameter)>),
    Grouped(Vec<ParamGroup>),
}

impl NamedParams {
    pub fn into_groups(self) -> Vec<ParamGroup> {
        match self {
            NamedParams::Flat(params) => vec![ParamGroup::new(params)],
            NamedParams::Grouped(groups) => groups,
        }
    }
}

impl From<Vec<(String, Parameter)>> for NamedParams {
    fn from(params: Vec<(String, Parameter)>) -> Self {
        NamedParams::Flat(params)
    }
}

impl From<Vec<ParamGroup>> for NamedParams {
    fn from(groups: Vec<ParamGroup>) -> Self {
        NamedParams::Grouped(groups)
    }
}

/// Names must be unique across all groups; tied parameters share one name.
pub fn check_unique_names(groups: &[ParamGroup]) -> Result<()> {
    let mut seen = HashSet::new();
    for (name, _) in groups.iter().flat_map(|g| g.named_params.iter()) {
        if !seen.insert(name.as_str()) {
            return Err(MeshError::DuplicateKey(format!(
                "parameter `{}` appears more than once",
                name
            )));
        }
    }
    Ok(())
}

/// A per-parameter optimizer addressed by parameter name.
pub trait NamedOptimizer: Send {
    fn kind(&self) -> OptimizerKind;

    /// The optimizer this layer delegates to, if it wraps one.
    fn inner(&self) -> Option<&dyn NamedOptimizer> {
        None
    }

    /// True if this layer or any layer below it is of `kind`.
    fn is_wrapping(&self, kind: OptimizerKind) -> bool {
        self.kind() == kind || self.inner().is_some_and(|inner| inner.is_wrapping(kind))
    }

    /// Fold the model's current gradients into accumulation state.
    ///
    /// Layers that read gradients straight off the parameters have nothing to do.
    fn accumulate(&mut self) -> Result<()> {
        Ok(())
    }

    fn step(&mut self) -> Result<()>;

    fn zero_grad(&mut self) -> Result<()>;

    fn state_dict(&self) -> Result<StateDict>;

    fn load_state_dict(&mut self, state: StateDict) -> Result<()>;

    /// Top-level state keys that are not per-parameter state.
    fn state_dict_additional_keys(&self) -> BTreeSet<String> {
        self.inner()
            .map(|inner| inner.state_dict_additional_keys())
            .unwrap_or_default()
    }

    /// Data-parallel partition of optimizer state, when state is sharded.
    fn shard_layout(&self) -> Option<&ShardLayout> {
        self.inner().and_then(|inner| inner.shard_layout())
    }

    /// Names of the parameters this optimizer updates, in construction order.
    fn param_names(&self) -> Vec<String>;
}

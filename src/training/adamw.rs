//! AdamW addressed by parameter name.
//!
//! Moments are kept in fp32 regardless of the parameter dtype.

use super::optimizer::{
    check_unique_names, state_tensor, take_nested, NamedOptimizer, NamedParams, OptimizerKind,
    StateDict, StateValue,
};
use super::parameter::Parameter;
use crate::utils::config::OptimizerConfig;
use crate::utils::error::{MeshError, Result};
use candle_core::{DType, Device, Tensor};
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamWConfig {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
}

impl Default for AdamWConfig {
    fn default() -> Self {
        Self::from(&OptimizerConfig::default())
    }
}

impl From<&OptimizerConfig> for AdamWConfig {
    fn from(c: &OptimizerConfig) -> Self {
        Self {
            lr: c.learning_rate,
            beta1: c.beta1,
            beta2: c.beta2,
            eps: c.eps,
            weight_decay: c.weight_decay,
        }
    }
}

struct Entry {
    name: String,
    param: Parameter,
    lr: Option<f64>,
    weight_decay: Option<f64>,
}

struct Moments {
    exp_avg: Tensor,
    exp_avg_sq: Tensor,
}

pub struct AdamW {
    config: AdamWConfig,
    entries: Vec<Entry>,
    state: BTreeMap<String, Moments>,
    step: u64,
}

impl AdamW {
    pub fn new(named_params: impl Into<NamedParams>, config: AdamWConfig) -> Result<Self> {
        let groups = named_params.into().into_groups();
        check_unique_names(&groups)?;

        let entries: Vec<Entry> = groups
            .into_iter()
            .flat_map(|group| {
                let (lr, weight_decay) = (group.lr, group.weight_decay);
                group.named_params.into_iter().map(move |(name, param)| Entry {
                    name,
                    param,
                    lr,
                    weight_decay,
                })
            })
            .collect();
        debug!(params = entries.len(), lr = config.lr, "Built AdamW");

        Ok(Self {
            config,
            entries,
            state: BTreeMap::new(),
            step: 0,
        })
    }

    pub fn config(&self) -> &AdamWConfig {
        &self.config
    }

    /// Override the base learning rate, e.g. from a scheduler.
    pub fn set_lr(&mut self, lr: f64) {
        self.config.lr = lr;
    }

    pub fn step_count(&self) -> u64 {
        self.step
    }

    fn update(&mut self, index: usize) -> Result<()> {
        let Entry { name, param, lr, weight_decay } = &self.entries[index];
        let Some(grad) = param.grad() else {
            return Ok(());
        };
        let c = self.config;
        let lr = lr.unwrap_or(c.lr);
        let weight_decay = weight_decay.unwrap_or(c.weight_decay);
        let grad = grad.to_dtype(DType::F32)?;

        let moments = match self.state.remove(name) {
            Some(m) => m,
            None => Moments {
                exp_avg: grad.zeros_like()?,
                exp_avg_sq: grad.zeros_like()?,
            },
        };
        let exp_avg = ((moments.exp_avg * c.beta1)? + (&grad * (1.0 - c.beta1))?)?;
        let exp_avg_sq = ((moments.exp_avg_sq * c.beta2)? + (grad.sqr()? * (1.0 - c.beta2))?)?;

        let t = self.step as i32;
        let bias1 = 1.0 - c.beta1.powi(t);
        let bias2 = 1.0 - c.beta2.powi(t);
        let m_hat = (&exp_avg / bias1)?;
        let denom = ((&exp_avg_sq / bias2)?.sqrt()? + c.eps)?;
        let update = (m_hat.div(&denom)? * lr)?;

        let value = param.tensor().to_dtype(DType::F32)?;
        let value = ((value * (1.0 - lr * weight_decay))? - update)?;
        param.set(&value)?;

        self.state.insert(name.clone(), Moments { exp_avg, exp_avg_sq });
        Ok(())
    }

    fn param(&self, name: &str) -> Result<&Parameter> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| &e.param)
            .ok_or_else(|| MeshError::UnknownParameter(name.to_string()))
    }
}

fn load_moment(state: &StateDict, key: &str, param: &Parameter, device: &Device) -> Result<Tensor> {
    let t = state_tensor(state, key)?;
    if t.dims() != param.shape().dims() {
        return Err(MeshError::Checkpoint(format!(
            "`{}` has shape {:?}, parameter has {:?}",
            key,
            t.dims(),
            param.shape().dims()
        )));
    }
    Ok(t.to_dtype(DType::F32)?.to_device(device)?)
}

impl NamedOptimizer for AdamW {
    fn kind(&self) -> OptimizerKind {
        OptimizerKind::AdamW
    }

    fn step(&mut self) -> Result<()> {
        self.step += 1;
        for i in 0..self.entries.len() {
            self.update(i)?;
        }
        Ok(())
    }

    fn zero_grad(&mut self) -> Result<()> {
        for entry in &self.entries {
            entry.param.zero_grad();
        }
        Ok(())
    }

    /// `{"step": i64[1], "state": {name: {"exp_avg", "exp_avg_sq"}}}`
    fn state_dict(&self) -> Result<StateDict> {
        let mut per_param = StateDict::new();
        for (name, m) in &self.state {
            let mut entry = StateDict::new();
            entry.insert("exp_avg".to_string(), StateValue::Tensor(m.exp_avg.clone()));
            entry.insert("exp_avg_sq".to_string(), StateValue::Tensor(m.exp_avg_sq.clone()));
            per_param.insert(name.clone(), StateValue::Nested(entry));
        }

        let mut state = StateDict::new();
        state.insert(
            "step".to_string(),
            StateValue::Tensor(Tensor::new(&[self.step as i64], &Device::Cpu)?),
        );
        state.insert("state".to_string(), StateValue::Nested(per_param));
        Ok(state)
    }

    fn load_state_dict(&mut self, mut state: StateDict) -> Result<()> {
        let step = state_tensor(&state, "step")?.to_vec1::<i64>()?;
        let step = step
            .first()
            .copied()
            .ok_or_else(|| MeshError::Checkpoint("empty step counter".to_string()))?;
        let per_param = take_nested(&mut state, "state")?;

        let mut restored = BTreeMap::new();
        for (name, value) in per_param {
            let param = self.param(&name)?;
            let StateValue::Nested(entry) = value else {
                return Err(MeshError::Checkpoint(format!("state of `{}` is not a mapping", name)));
            };
            let device = param.device().clone();
            let moments = Moments {
                exp_avg: load_moment(&entry, "exp_avg", param, &device)?,
                exp_avg_sq: load_moment(&entry, "exp_avg_sq", param, &device)?,
            };
            restored.insert(name, moments);
        }

        self.state = restored;
        self.step = step as u64;
        Ok(())
    }

    fn param_names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.name.clone()).collect()
    }
}

//! Assemble the optimizer stack described by an `OptimizerConfig`.
//!
//! Layers, outermost first: fp32 gradient accumulation when
//! `accumulate_grad_in_fp32` is set, ZeRO-1 sharding when `zero_stage > 0`,
//! then AdamW.

use super::accumulator::{Fp32GradientAccumulator, GradientAccumulator};
use super::adamw::{AdamW, AdamWConfig};
use super::gradient_accumulation::GradientAccumulationOptimizer;
use super::optimizer::{NamedOptimizer, NamedParams, ParamGroup};
use super::zero::ZeroShardedOptimizer;
use crate::distributed::ProcessGroup;
use crate::utils::config::OptimizerConfig;
use crate::utils::error::{MeshError, Result};
use tracing::info;

/// Build the configured optimizer over `named_params`.
///
/// `dp_group` is where gradients are averaged and state is sharded. Without
/// the fp32 accumulator nothing in the stack reduces gradients, so callers
/// must synchronize them before `step()`.
pub fn build_optimizer(
    named_params: impl Into<NamedParams>,
    config: &OptimizerConfig,
    dp_group: &ProcessGroup,
) -> Result<Box<dyn NamedOptimizer>> {
    if config.zero_stage > 1 {
        return Err(MeshError::NotImplemented(format!(
            "zero stage {}",
            config.zero_stage
        )));
    }
    let adamw = AdamWConfig::from(config);
    let zero_stage = config.zero_stage;

    let base = move |groups: Vec<ParamGroup>| -> Result<Box<dyn NamedOptimizer>> {
        if zero_stage > 0 {
            let zero = ZeroShardedOptimizer::new(
                groups,
                |shards| Ok(Box::new(AdamW::new(shards, adamw)?) as Box<dyn NamedOptimizer>),
                dp_group,
            )?;
            Ok(Box::new(zero))
        } else {
            Ok(Box::new(AdamW::new(groups, adamw)?))
        }
    };

    let optimizer: Box<dyn NamedOptimizer> = if config.accumulate_grad_in_fp32 {
        Box::new(GradientAccumulationOptimizer::new(
            named_params,
            |params| {
                let accumulator = Fp32GradientAccumulator::new(params)?.with_data_parallel(dp_group);
                Ok(Box::new(accumulator) as Box<dyn GradientAccumulator>)
            },
            base,
        )?)
    } else {
        base(named_params.into().into_groups())?
    };

    info!(
        kind = %optimizer.kind(),
        zero_stage,
        fp32_accumulation = config.accumulate_grad_in_fp32,
        "Built optimizer stack"
    );
    Ok(optimizer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::optimizer::OptimizerKind;
    use crate::training::parameter::Parameter;
    use candle_core::{DType, Device, Tensor};

    fn named() -> Result<Vec<(String, Parameter)>> {
        let p = Parameter::new(&Tensor::new(&[1.0f32, 2.0], &Device::Cpu)?.to_dtype(DType::BF16)?)?;
        Ok(vec![("w".to_string(), p)])
    }

    fn single_rank() -> ProcessGroup {
        ProcessGroup::new(vec![0], None)
    }

    #[test]
    fn test_default_stack_accumulates_in_fp32() -> Result<()> {
        let opt = build_optimizer(named()?, &OptimizerConfig::default(), &single_rank())?;
        assert_eq!(opt.kind(), OptimizerKind::GradientAccumulation);
        assert!(opt.is_wrapping(OptimizerKind::AdamW));
        assert!(!opt.is_wrapping(OptimizerKind::ZeroSharded));
        Ok(())
    }

    #[test]
    fn test_plain_adamw() -> Result<()> {
        let config = OptimizerConfig { accumulate_grad_in_fp32: false, ..Default::default() };
        let opt = build_optimizer(named()?, &config, &single_rank())?;
        assert_eq!(opt.kind(), OptimizerKind::AdamW);
        assert!(opt.shard_layout().is_none());
        Ok(())
    }

    #[test]
    fn test_sharded_stack_on_one_rank() -> Result<()> {
        let config = OptimizerConfig { zero_stage: 1, ..Default::default() };
        let mut opt = build_optimizer(named()?, &config, &single_rank())?;
        assert!(opt.is_wrapping(OptimizerKind::ZeroSharded));
        assert_eq!(opt.shard_layout().map(|l| l.rank_elements(0)), Some(2));
        opt.step()?;
        Ok(())
    }

    #[test]
    fn test_unsupported_zero_stage() -> Result<()> {
        let config = OptimizerConfig { zero_stage: 2, ..Default::default() };
        assert!(matches!(
            build_optimizer(named()?, &config, &single_rank()),
            Err(MeshError::NotImplemented(_))
        ));
        Ok(())
    }

    #[test]
    fn test_step_through_built_stack() -> Result<()> {
        let params = named()?;
        let model = params[0].1.clone();
        let config = OptimizerConfig { learning_rate: 0.1, weight_decay: 0.0, ..Default::default() };
        let mut opt = build_optimizer(params, &config, &single_rank())?;

        model.set_grad(Some(Tensor::new(&[1.0f32, -1.0], &Device::Cpu)?.to_dtype(DType::BF16)?))?;
        opt.accumulate()?;
        opt.step()?;
        let v = model.tensor().to_dtype(DType::F32)?.to_vec1::<f32>()?;
        assert!(v[0] < 1.0 && v[1] > 2.0);
        Ok(())
    }
}

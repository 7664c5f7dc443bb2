use candle_core::{Device, Tensor};
use parallel_mesh::data::collator::{ClmCollator, INPUT_IDS, INPUT_MASK, LABEL_IDS, LABEL_MASK};
use parallel_mesh::data::sampler::{BatchSampler, DomainDataset, DomainSampler, SamplerOptions, SkipBatchSampler, SplitKind};
use parallel_mesh::distributed::{BatchSanityChecker, LocalWorld, PlaceholderRouter, TopologyBuilder, TopologyDescriptor};
use parallel_mesh::training::accumulator::{Fp32GradientAccumulator, GradientAccumulator};
use parallel_mesh::training::adamw::{AdamW, AdamWConfig};
use parallel_mesh::training::gradient_accumulation::GradientAccumulationOptimizer;
use parallel_mesh::training::optimizer::{state_tensor, NamedOptimizer, OptimizerKind, StateDict};
use parallel_mesh::training::parameter::Parameter;
use parallel_mesh::training::zero::ZeroShardedOptimizer;
use parallel_mesh::utils::checkpoint::{flatten_state_dict, load_optimizer, save_optimizer, OPTIMIZER_CONFIG_FILE};
use parallel_mesh::utils::digest::tensor_digest;
use parallel_mesh::utils::config::MeshConfig;
use parallel_mesh::{MeshError, Result};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(20);
const SEQ_LEN: usize = 4;

fn domains() -> Vec<DomainDataset> {
    vec![DomainDataset::new("web", 40), DomainDataset::new("code", 20)]
}

/// Token rows for a batch of global indices; row `i` is unique to index `i`.
fn token_rows(indices: &[usize]) -> Result<Tensor> {
    let width = SEQ_LEN + 1;
    let data: Vec<u32> = indices
        .iter()
        .flat_map(|&i| (0..width).map(move |j| (i * width + j) as u32))
        .collect();
    Ok(Tensor::from_vec(data, (indices.len(), width), &Device::Cpu)?)
}

/// Which fields each rank materialized for its first micro-batch.
#[test]
fn test_sampled_batches_route_onto_pipeline_stages() {
    let results = LocalWorld::spawn(4, TIMEOUT, |backend| -> Result<_> {
        let topo = TopologyBuilder::new(4, 1, 2, 2)?.build(&backend)?;
        let options = SamplerOptions {
            dp_size: 2,
            dp_rank: topo.dp_rank(),
            micro_batch_size: 2,
            seed: 7,
            split: SplitKind::Train,
        };
        let sampler = DomainSampler::new(domains(), &[1.0, 1.0], options)?;
        let batches = sampler.batches();
        let first = batches
            .first()
            .ok_or_else(|| MeshError::Config("sampler produced no batches".to_string()))?;

        let router = PlaceholderRouter::for_topology(&topo)?;
        let collator = ClmCollator::new(SEQ_LEN, 0, 1);
        let batch = collator.collate(&router, Some(&token_rows(first)?))?;
        BatchSanityChecker::new(true).check(&batch, &topo)?;

        let real: Vec<String> = batch
            .iter()
            .filter(|(_, slot)| slot.is_real())
            .map(|(name, _)| name.clone())
            .collect();
        let pp_rank = topo.pp_rank();
        topo.destroy()?;
        Ok((pp_rank, real))
    });

    for r in results {
        let (pp_rank, real) = r.unwrap();
        if pp_rank == 0 {
            assert_eq!(real, vec![INPUT_IDS, INPUT_MASK]);
        } else {
            assert_eq!(real, vec![LABEL_IDS, LABEL_MASK]);
        }
    }
}

#[test]
fn test_identical_replicas_are_caught_before_the_step() {
    let results = LocalWorld::spawn(2, TIMEOUT, |backend| -> Result<()> {
        let topo = TopologyBuilder::new(2, 1, 2, 1)?.build(&backend)?;
        let router = PlaceholderRouter::for_topology(&topo)?;
        // Both replicas read the same samples
        let batch = ClmCollator::new(SEQ_LEN, 0, 0).collate(&router, Some(&token_rows(&[0, 1])?))?;
        let outcome = BatchSanityChecker::new(true).check(&batch, &topo);
        topo.destroy()?;
        outcome
    });
    for r in results {
        assert!(matches!(r, Err(MeshError::Consistency { ref group, .. }) if group == "data"));
    }
}

fn build_optimizer(
    topo: &TopologyDescriptor,
    named: Vec<(String, Parameter)>,
) -> Result<GradientAccumulationOptimizer> {
    let config = AdamWConfig { lr: 0.1, weight_decay: 0.0, ..Default::default() };
    GradientAccumulationOptimizer::new(
        named,
        |params| {
            let accumulator = Fp32GradientAccumulator::new(params)?.with_data_parallel(topo.dp_group());
            Ok(Box::new(accumulator) as Box<dyn GradientAccumulator>)
        },
        |groups| {
            let zero = ZeroShardedOptimizer::new(
                groups,
                |shards| Ok(Box::new(AdamW::new(shards, config)?) as Box<dyn NamedOptimizer>),
                topo.dp_group(),
            )?;
            Ok(Box::new(zero) as Box<dyn NamedOptimizer>)
        },
    )
}

fn model() -> Result<(Parameter, Parameter)> {
    Ok((
        Parameter::new(&Tensor::new(&[1.0f32, 2.0, 3.0], &Device::Cpu)?)?,
        Parameter::new(&Tensor::new(&[0.5f32], &Device::Cpu)?)?,
    ))
}

type LeafDigests = BTreeMap<String, [u8; 32]>;

fn leaf_digests(state: &StateDict) -> Result<LeafDigests> {
    let (tensors, _) = flatten_state_dict(state)?;
    tensors.iter().map(|(k, t)| Ok((k.clone(), tensor_digest(t)?))).collect()
}

struct ShardedRun {
    w: Vec<f32>,
    b: Vec<f32>,
    step: i64,
    saved: LeafDigests,
    restored: LeafDigests,
}

fn run_sharded_training(dir: &Path) -> Vec<Result<ShardedRun>> {
    LocalWorld::spawn(2, TIMEOUT, |backend| -> Result<_> {
        let topo = TopologyBuilder::new(2, 1, 2, 1)?.build(&backend)?;
        let (w, b) = model()?;
        let named = vec![("w".to_string(), w.clone()), ("b".to_string(), b.clone())];
        let mut opt = build_optimizer(&topo, named)?;
        assert!(opt.is_wrapping(OptimizerKind::ZeroSharded));
        assert!(opt.is_wrapping(OptimizerKind::AdamW));

        // Two micro-batches per replica; replicas average to a gradient of 2
        let scale = (topo.dp_rank() * 2 + 1) as f32;
        for _ in 0..2 {
            w.set_grad(Some(Tensor::new(&[scale / 2.0; 3], &Device::Cpu)?))?;
            b.set_grad(Some(Tensor::new(&[scale / 2.0], &Device::Cpu)?))?;
            opt.accumulate()?;
        }
        opt.step()?;
        opt.zero_grad()?;

        // A pending micro-batch keeps the saved buffers non-zero
        w.set_grad(Some(Tensor::new(&[scale; 3], &Device::Cpu)?))?;
        b.set_grad(Some(Tensor::new(&[-scale], &Device::Cpu)?))?;
        opt.accumulate()?;

        let saved = leaf_digests(&opt.state_dict()?)?;
        save_optimizer(&opt, &topo, dir)?;
        topo.world_group().communicator()?.barrier()?;

        let (w2, b2) = model()?;
        let mut restored = build_optimizer(&topo, vec![("w".to_string(), w2), ("b".to_string(), b2)])?;
        load_optimizer(&mut restored, &topo, dir)?;
        let state = restored.state_dict()?;
        let step = state_tensor(&state, "step")?.to_vec1::<i64>()?[0];

        let out = ShardedRun {
            w: w.tensor().to_vec1::<f32>()?,
            b: b.tensor().to_vec1::<f32>()?,
            step,
            saved,
            restored: leaf_digests(&state)?,
        };
        topo.destroy()?;
        Ok(out)
    })
}

#[test]
fn test_accumulated_sharded_step_and_checkpoint() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let results = run_sharded_training(dir.path());

    // Reference: one replicated AdamW step on the averaged gradient
    let (w, b) = model()?;
    let config = AdamWConfig { lr: 0.1, weight_decay: 0.0, ..Default::default() };
    let mut reference = AdamW::new(vec![("w".to_string(), w.clone()), ("b".to_string(), b.clone())], config)?;
    w.set_grad(Some(Tensor::new(&[2.0f32; 3], &Device::Cpu)?))?;
    b.set_grad(Some(Tensor::new(&[2.0f32], &Device::Cpu)?))?;
    reference.step()?;
    let expected_w = w.tensor().to_vec1::<f32>()?;
    let expected_b = b.tensor().to_vec1::<f32>()?;

    for r in results {
        let run = r?;
        for (g, e) in run.w.iter().chain(&run.b).zip(expected_w.iter().chain(&expected_b)) {
            assert!((g - e).abs() < 1e-5, "{} != {}", g, e);
        }
        assert_eq!(run.step, 1);

        // Every leaf survives the files bit for bit
        for prefix in ["gradient_accumulator/buffers/", "gradient_accumulator/master/", "state/"] {
            assert!(run.saved.keys().any(|k| k.starts_with(prefix)), "no `{}` leaves", prefix);
        }
        assert!(run.saved.keys().any(|k| k.ends_with("/exp_avg_sq")));
        assert_eq!(run.saved, run.restored);
    }

    assert!(dir.path().join(OPTIMIZER_CONFIG_FILE).exists());
    for dp in 0..2 {
        let file = format!("optimizer_pp-0-of-1_dp-{}-of-2_tp-0-of-1.safetensors", dp);
        assert!(dir.path().join(file).exists());
    }
    Ok(())
}

#[test]
fn test_replicated_state_is_written_once() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let results = LocalWorld::spawn(2, TIMEOUT, |backend| -> Result<Option<String>> {
        let topo = TopologyBuilder::new(2, 1, 2, 1)?.build(&backend)?;
        let (w, _) = model()?;
        let opt = AdamW::new(vec![("w".to_string(), w)], AdamWConfig::default())?;
        let written = save_optimizer(&opt, &topo, dir.path())?;
        topo.destroy()?;
        Ok(written.and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned())))
    });

    let written: Vec<_> = results.into_iter().collect::<Result<_>>()?;
    assert_eq!(
        written,
        vec![Some("optimizer_pp-0-of-1_tp-0-of-1.safetensors".to_string()), None]
    );
    Ok(())
}

#[test]
fn test_config_drives_topology_and_resumption() -> Result<()> {
    let mut config = MeshConfig::default();
    config.distributed.world_size = 2;
    config.distributed.dp_size = 2;
    config.data.micro_batch_size = 2;
    config.data.consumed_train_samples = 4;
    config.validate()?;

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("mesh.json");
    config.save(&path)?;
    let loaded = MeshConfig::from_file(&path)?;

    let results = LocalWorld::spawn(2, TIMEOUT, |backend| -> Result<usize> {
        let topo = TopologyBuilder::from_config(&loaded.distributed)?.build(&backend)?;
        let options = SamplerOptions::from_config(&loaded.data, 2, topo.dp_rank())?;
        let fresh = DomainSampler::new(domains(), &[1.0, 1.0], options.clone())?;
        let resumed = SkipBatchSampler::new(
            DomainSampler::new(domains(), &[1.0, 1.0], options)?,
            loaded.data.consumed_train_samples,
            2,
        )?;
        assert_eq!(resumed.batches(), fresh.batches()[2..].to_vec());
        let n = resumed.len();
        topo.destroy()?;
        Ok(n)
    });
    for r in results {
        assert_eq!(r?, 6);
    }
    Ok(())
}

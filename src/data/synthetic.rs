//! Endless random token batches for throughput runs without a dataset.

use super::collator::{ClmCollator, INPUT_IDS, LABEL_IDS};
use crate::distributed::{Batch, PlaceholderRouter, TopologyDescriptor};
use crate::utils::config::DataConfig;
use crate::utils::error::{MeshError, Result};
use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

/// Infinite iterator of random causal-LM batches.
///
/// Fields follow `ClmCollator`: inputs are materialized on the input stage,
/// labels on the output stage, placeholders everywhere else. The generator is
/// seeded with `seed * (1 + dp_rank) * (1 + pp_rank)`, so every tensor-parallel
/// rank of a replica draws the same tokens.
pub struct SyntheticBatches {
    layout: ClmCollator,
    micro_batch_size: usize,
    vocab_size: usize,
    router: PlaceholderRouter,
    rng: StdRng,
    device: Device,
}

impl SyntheticBatches {
    pub fn new(
        layout: ClmCollator,
        micro_batch_size: usize,
        vocab_size: usize,
        seed: u64,
        dp_rank: usize,
        router: PlaceholderRouter,
        device: Device,
    ) -> Result<Self> {
        if micro_batch_size == 0 || layout.sequence_length == 0 || vocab_size == 0 {
            return Err(MeshError::Config(format!(
                "synthetic batches need positive sizes, got micro_batch_size={} sequence_length={} vocab_size={}",
                micro_batch_size, layout.sequence_length, vocab_size
            )));
        }
        let rank_seed = seed
            .wrapping_mul(1 + dp_rank as u64)
            .wrapping_mul(1 + router.pp_rank() as u64);
        info!(
            dp_rank,
            pp_rank = router.pp_rank(),
            seed = rank_seed,
            "Generating synthetic batches"
        );
        Ok(Self {
            layout,
            micro_batch_size,
            vocab_size,
            router,
            rng: StdRng::seed_from_u64(rank_seed),
            device,
        })
    }

    /// Generator for the local rank of `topology`, sized from `config`.
    pub fn for_topology(
        config: &DataConfig,
        input_pp_rank: usize,
        output_pp_rank: usize,
        topology: &TopologyDescriptor,
    ) -> Result<Self> {
        Self::new(
            ClmCollator::new(config.sequence_length, input_pp_rank, output_pp_rank),
            config.micro_batch_size,
            config.vocab_size,
            config.seed,
            topology.dp_rank(),
            PlaceholderRouter::for_topology(topology)?,
            topology.device().clone(),
        )
    }

    fn random_tokens(&mut self) -> Result<Tensor> {
        let shape = (self.micro_batch_size, self.layout.sequence_length);
        let vocab = self.vocab_size as u32;
        let data: Vec<u32> = (0..shape.0 * shape.1).map(|_| self.rng.gen_range(0..vocab)).collect();
        Ok(Tensor::from_vec(data, shape, &self.device)?)
    }

    /// Next batch. Only owned fields consume randomness.
    pub fn next_batch(&mut self) -> Result<Batch> {
        let fields = self.layout.fields();
        let router = self.router;
        router.route_batch(&fields, |name| match name {
            INPUT_IDS | LABEL_IDS => self.random_tokens(),
            _ => Ok(Tensor::ones(
                (self.micro_batch_size, self.layout.sequence_length),
                DType::U8,
                &self.device,
            )?),
        })
    }
}

impl Iterator for SyntheticBatches {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.next_batch())
    }
}

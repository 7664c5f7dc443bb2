//! Domain-weighted, data-parallel aware batch sampling.
//!
//! Sub-datasets are laid end to end in one global index space. Each
//! data-parallel rank owns the same contiguous slice of every sub-dataset and
//! draws from it in proportion to the domain weights.

use crate::utils::config::DataConfig;
use crate::utils::error::{MeshError, Result};
use rand::rngs::StdRng;
use rand::seq::{index, SliceRandom};
use rand::SeedableRng;
use std::ops::Range;
use tracing::{debug, info};

/// Which half of a dataset mix a split name refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitKind {
    Train,
    Test,
}

impl SplitKind {
    /// Any name containing "train" is a training split, any containing "test"
    /// a test split, e.g. `train_ift` or `test_rm`.
    pub fn parse(split: &str) -> Result<Self> {
        if split.contains("train") {
            Ok(SplitKind::Train)
        } else if split.contains("test") {
            Ok(SplitKind::Test)
        } else {
            Err(MeshError::Config(format!(
                "split `{}` is not recognized as one of test or train",
                split
            )))
        }
    }
}

/// A named sub-dataset of known length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainDataset {
    pub name: String,
    pub len: usize,
}

impl DomainDataset {
    pub fn new(name: impl Into<String>, len: usize) -> Self {
        Self { name: name.into(), len }
    }
}

#[derive(Debug, Clone)]
pub struct SamplerOptions {
    pub dp_size: usize,
    pub dp_rank: usize,
    pub micro_batch_size: usize,
    pub seed: u64,
    pub split: SplitKind,
}

impl SamplerOptions {
    pub fn from_config(config: &DataConfig, dp_size: usize, dp_rank: usize) -> Result<Self> {
        Ok(Self {
            dp_size,
            dp_rank,
            micro_batch_size: config.micro_batch_size,
            seed: config.seed,
            split: SplitKind::parse(&config.split)?,
        })
    }
}

/// Produces micro-batches of global indices.
pub trait BatchSampler: Send + Sync {
    /// Every batch of one pass, in order.
    fn batches(&self) -> Vec<Vec<usize>>;

    /// Number of batches one pass yields.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct DomainSampler {
    datasets: Vec<DomainDataset>,
    weights: Vec<f64>,
    offsets: Vec<usize>,
    options: SamplerOptions,
    total_size: usize,
    epoch: u64,
}

impl DomainSampler {
    /// Weights are normalized to sum to one. Fails on an empty mix.
    pub fn new(datasets: Vec<DomainDataset>, weights: &[f64], options: SamplerOptions) -> Result<Self> {
        if datasets.len() != weights.len() {
            return Err(MeshError::Config(format!(
                "{} datasets but {} domain weights",
                datasets.len(),
                weights.len()
            )));
        }
        if options.dp_size == 0 || options.dp_rank >= options.dp_size {
            return Err(MeshError::Config(format!(
                "data-parallel rank {} outside group of size {}",
                options.dp_rank, options.dp_size
            )));
        }
        if options.micro_batch_size == 0 {
            return Err(MeshError::Config("micro_batch_size must be positive".to_string()));
        }
        if let Some((d, w)) = datasets
            .iter()
            .zip(weights)
            .find(|(_, w)| !w.is_finite() || **w < 0.0)
        {
            return Err(MeshError::Config(format!(
                "dataset fraction for domain `{}` is invalid (= {})",
                d.name, w
            )));
        }
        let weight_sum: f64 = weights.iter().sum();
        if weight_sum <= 0.0 {
            return Err(MeshError::Config("domain weights sum to zero".to_string()));
        }

        let total: usize = datasets.iter().map(|d| d.len).sum();
        if total == 0 {
            return Err(MeshError::Config("combined dataset is empty".to_string()));
        }

        let offsets = datasets
            .iter()
            .scan(0, |acc, d| {
                let start = *acc;
                *acc += d.len;
                Some(start)
            })
            .collect();
        let bs = options.micro_batch_size;
        let sampler = Self {
            weights: weights.iter().map(|w| w / weight_sum).collect(),
            datasets,
            offsets,
            total_size: total.div_ceil(bs) * bs,
            options,
            epoch: 0,
        };

        let pool: usize = sampler.draw_counts().iter().sum();
        if pool == 0 {
            return Err(MeshError::Config(format!(
                "data-parallel rank {} would draw no samples from {} total",
                sampler.options.dp_rank, total
            )));
        }
        info!(
            domains = sampler.datasets.len(),
            total,
            local_samples = pool,
            dp_rank = sampler.options.dp_rank,
            "Built domain sampler"
        );
        Ok(sampler)
    }

    /// Reseed for another pass over the data.
    pub fn set_epoch(&mut self, epoch: u64) {
        self.epoch = epoch;
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// Global index range of the local partition of every domain.
    pub fn local_partitions(&self) -> Vec<Range<usize>> {
        self.datasets
            .iter()
            .zip(&self.offsets)
            .map(|(d, &offset)| {
                let size = d.len / self.options.dp_size;
                let start = offset + self.options.dp_rank * size;
                start..start + size
            })
            .collect()
    }

    /// How many indices each domain contributes to one pass.
    pub fn draw_counts(&self) -> Vec<usize> {
        self.local_partitions()
            .iter()
            .zip(&self.weights)
            .map(|(partition, w)| match self.options.split {
                SplitKind::Train => (partition.len() as f64 * w).floor() as usize,
                // No subsampling for test data so evaluations stay comparable
                SplitKind::Test => partition.len(),
            })
            .collect()
    }

    /// Every index of one pass, shuffled.
    pub fn indices(&self) -> Vec<usize> {
        let mut rng = StdRng::seed_from_u64(self.options.seed.wrapping_add(self.epoch));
        let mut pool = Vec::new();
        for (partition, count) in self.local_partitions().into_iter().zip(self.draw_counts()) {
            let drawn = index::sample(&mut rng, partition.len(), count);
            pool.extend(drawn.into_iter().map(|i| partition.start + i));
        }
        pool.shuffle(&mut rng);
        pool.truncate(self.total_size);
        debug!(samples = pool.len(), epoch = self.epoch, "Sampled indices");
        pool
    }

    /// Map a global index back to (domain, index within that domain).
    pub fn locate(&self, global_index: usize) -> Option<(usize, usize)> {
        self.datasets
            .iter()
            .zip(&self.offsets)
            .enumerate()
            .find(|(_, (d, &offset))| global_index >= offset && global_index < offset + d.len)
            .map(|(i, (_, &offset))| (i, global_index - offset))
    }
}

impl BatchSampler for DomainSampler {
    fn batches(&self) -> Vec<Vec<usize>> {
        self.indices()
            .chunks(self.options.micro_batch_size)
            .map(|c| c.to_vec())
            .collect()
    }

    fn len(&self) -> usize {
        let samples: usize = self.draw_counts().iter().sum();
        samples.min(self.total_size).div_ceil(self.options.micro_batch_size)
    }
}

/// Skips the batches already consumed before a restart.
///
/// `consumed_samples` is global across data-parallel replicas, so each rank
/// drops `consumed_samples / dp_size` of its batches.
pub struct SkipBatchSampler<S> {
    inner: S,
    skip_batches: usize,
}

impl<S: BatchSampler> SkipBatchSampler<S> {
    pub fn new(inner: S, consumed_samples: usize, dp_size: usize) -> Result<Self> {
        if dp_size == 0 {
            return Err(MeshError::Config("dp_size must be positive".to_string()));
        }
        Ok(Self {
            inner,
            skip_batches: consumed_samples / dp_size,
        })
    }

    pub fn skip_batches(&self) -> usize {
        self.skip_batches
    }

    /// Batches of the wrapped sampler, skipped or not.
    pub fn total_length(&self) -> usize {
        self.inner.len()
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: BatchSampler> BatchSampler for SkipBatchSampler<S> {
    fn batches(&self) -> Vec<Vec<usize>> {
        self.inner.batches().into_iter().skip(self.skip_batches).collect()
    }

    fn len(&self) -> usize {
        self.inner.len().saturating_sub(self.skip_batches)
    }
}

/// Training sampler for one data-parallel rank, resuming after
/// `consumed_samples` when non-zero.
pub fn train_sampler(
    datasets: Vec<DomainDataset>,
    weights: &[f64],
    options: SamplerOptions,
    consumed_samples: usize,
) -> Result<Box<dyn BatchSampler>> {
    let dp_size = options.dp_size;
    let sampler = DomainSampler::new(datasets, weights, options)?;
    if consumed_samples > 0 {
        Ok(Box::new(SkipBatchSampler::new(sampler, consumed_samples, dp_size)?))
    } else {
        Ok(Box::new(sampler))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn options(dp_size: usize, dp_rank: usize, micro_batch_size: usize) -> SamplerOptions {
        SamplerOptions {
            dp_size,
            dp_rank,
            micro_batch_size,
            seed: 1234,
            split: SplitKind::Train,
        }
    }

    fn two_domains() -> Vec<DomainDataset> {
        vec![DomainDataset::new("web", 100), DomainDataset::new("code", 50)]
    }

    #[test]
    fn test_split_kinds() {
        assert_eq!(SplitKind::parse("train").ok(), Some(SplitKind::Train));
        assert_eq!(SplitKind::parse("train_ift").ok(), Some(SplitKind::Train));
        assert_eq!(SplitKind::parse("test_rm").ok(), Some(SplitKind::Test));
        assert!(matches!(SplitKind::parse("validation"), Err(MeshError::Config(_))));
    }

    #[test]
    fn test_two_domain_scenario() -> Result<()> {
        let sampler = DomainSampler::new(two_domains(), &[0.5, 0.5], options(2, 0, 4))?;
        assert_eq!(sampler.local_partitions(), vec![0..50, 100..125]);
        assert_eq!(sampler.draw_counts(), vec![25, 12]);

        let indices = sampler.indices();
        assert_eq!(indices.len(), 37);
        assert_eq!(indices.iter().filter(|&&i| i < 50).count(), 25);
        assert_eq!(indices.iter().filter(|&&i| (100..125).contains(&i)).count(), 12);
        assert_eq!(indices.iter().collect::<HashSet<_>>().len(), 37);
        Ok(())
    }

    #[test]
    fn test_weights_are_normalized() -> Result<()> {
        let sampler = DomainSampler::new(two_domains(), &[3.0, 1.0], options(1, 0, 1))?;
        assert_eq!(sampler.weights(), &[0.75, 0.25]);
        assert_eq!(sampler.draw_counts(), vec![75, 12]);
        Ok(())
    }

    #[test]
    fn test_same_seed_same_sequence() -> Result<()> {
        let a = DomainSampler::new(two_domains(), &[0.5, 0.5], options(2, 1, 4))?;
        let b = DomainSampler::new(two_domains(), &[0.5, 0.5], options(2, 1, 4))?;
        assert_eq!(a.batches(), b.batches());

        let mut c = DomainSampler::new(two_domains(), &[0.5, 0.5], options(2, 1, 4))?;
        c.set_epoch(1);
        assert_ne!(a.indices(), c.indices());
        Ok(())
    }

    #[test]
    fn test_ranks_are_disjoint() -> Result<()> {
        let dp = 3;
        let mut seen = HashSet::new();
        for rank in 0..dp {
            let sampler = DomainSampler::new(two_domains(), &[1.0, 1.0], options(dp, rank, 2))?;
            for i in sampler.indices() {
                assert!(seen.insert(i), "index {} drawn by two ranks", i);
            }
        }
        Ok(())
    }

    #[test]
    fn test_batches_and_len_agree() -> Result<()> {
        let sampler = DomainSampler::new(two_domains(), &[0.5, 0.5], options(2, 0, 4))?;
        let batches = sampler.batches();
        // 37 samples: nine full batches and a trailing one
        assert_eq!(batches.len(), 10);
        assert_eq!(sampler.len(), 10);
        assert_eq!(batches.last().map(Vec::len), Some(1));
        Ok(())
    }

    #[test]
    fn test_test_split_ignores_weights() -> Result<()> {
        let mut opts = options(2, 0, 4);
        opts.split = SplitKind::Test;
        let sampler = DomainSampler::new(two_domains(), &[1.0, 0.0], opts)?;
        assert_eq!(sampler.draw_counts(), vec![50, 25]);
        Ok(())
    }

    #[test]
    fn test_resume_matches_uninterrupted_run() -> Result<()> {
        let dp_size = 2;
        let full = DomainSampler::new(two_domains(), &[0.5, 0.5], options(dp_size, 0, 4))?.batches();

        let consumed = 6;
        let resumed = SkipBatchSampler::new(
            DomainSampler::new(two_domains(), &[0.5, 0.5], options(dp_size, 0, 4))?,
            consumed,
            dp_size,
        )?;
        assert_eq!(resumed.skip_batches(), 3);
        assert_eq!(resumed.total_length(), full.len());
        assert_eq!(resumed.len(), full.len() - 3);
        assert_eq!(resumed.batches(), full[3..].to_vec());
        Ok(())
    }

    #[test]
    fn test_locate() -> Result<()> {
        let sampler = DomainSampler::new(two_domains(), &[0.5, 0.5], options(1, 0, 1))?;
        assert_eq!(sampler.locate(0), Some((0, 0)));
        assert_eq!(sampler.locate(99), Some((0, 99)));
        assert_eq!(sampler.locate(100), Some((1, 0)));
        assert_eq!(sampler.locate(149), Some((1, 49)));
        assert_eq!(sampler.locate(150), None);
        Ok(())
    }

    #[test]
    fn test_misconfigurations() {
        assert!(DomainSampler::new(vec![DomainDataset::new("a", 0)], &[1.0], options(1, 0, 1)).is_err());
        assert!(DomainSampler::new(two_domains(), &[1.0], options(1, 0, 1)).is_err());
        assert!(DomainSampler::new(two_domains(), &[-1.0, 2.0], options(1, 0, 1)).is_err());
        assert!(DomainSampler::new(two_domains(), &[0.0, 0.0], options(1, 0, 1)).is_err());
        assert!(DomainSampler::new(two_domains(), &[0.5, 0.5], options(2, 2, 1)).is_err());
        // Every partition rounds down to nothing
        assert!(DomainSampler::new(vec![DomainDataset::new("a", 1)], &[1.0], options(2, 0, 1)).is_err());
    }

    #[test]
    fn test_train_sampler_wraps_on_resume() -> Result<()> {
        let fresh = train_sampler(two_domains(), &[0.5, 0.5], options(2, 0, 4), 0)?;
        let resumed = train_sampler(two_domains(), &[0.5, 0.5], options(2, 0, 4), 4)?;
        assert_eq!(fresh.len(), resumed.len() + 2);
        Ok(())
    }
}

//! Cross-rank consistency checks on routed batches.
//!
//! Tensors are compared by SHA-256 digest of their raw bytes; only the
//! 32-byte digest is all-gathered. Checks are collective over the tensor and
//! data groups, so every rank must run them on the same field names.

use super::groups::{ProcessGroup, TopologyDescriptor};
use super::placeholder::Batch;
use crate::utils::digest::{digest_to_tensor, gathered_digests, tensor_digest};
use crate::utils::config::GeneralConfig;
use crate::utils::error::{MeshError, Result};
use tracing::{error, warn};

/// What data-parallel replicas are expected to see for a non-exempt field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplicaPolicy {
    /// Each replica reads its own shard of the data: every replica must
    /// differ from data-parallel rank 0.
    #[default]
    MustDiffer,
    /// Every replica must hold the same bytes.
    MustMatch,
}

/// Fields allowed to be anything across data-parallel replicas.
pub fn is_mask_field(name: &str) -> bool {
    name.contains("mask")
}

pub struct BatchSanityChecker {
    enabled: bool,
    policy: ReplicaPolicy,
    exempt: fn(&str) -> bool,
}

impl BatchSanityChecker {
    pub fn new(enabled: bool) -> Self {
        if !enabled {
            warn!("Batch sanity checks are disabled");
        }
        Self {
            enabled,
            policy: ReplicaPolicy::default(),
            exempt: is_mask_field,
        }
    }

    /// Checks run unless `general.ignore_sanity_checks` is set.
    pub fn from_config(config: &GeneralConfig) -> Self {
        Self::new(!config.ignore_sanity_checks)
    }

    pub fn with_policy(mut self, policy: ReplicaPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Replace the predicate deciding which fields skip the data-parallel check.
    pub fn with_exemption(mut self, exempt: fn(&str) -> bool) -> Self {
        self.exempt = exempt;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Verify every real field of `batch` across the tensor and data groups.
    ///
    /// Disabled checkers return immediately without communicating.
    pub fn check(&self, batch: &Batch, topology: &TopologyDescriptor) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        for (name, slot) in batch {
            let Some(tensor) = slot.as_tensor() else {
                continue;
            };
            let digest = tensor_digest(tensor)?;

            // Tensor-parallel ranks must see the same logical input
            let digests = exchange(topology.tp_group(), &digest)?;
            if let Some(divergent) = digests.iter().position(|d| d != &digests[0]) {
                return Err(divergence(name, topology.tp_group(), divergent, "tensor"));
            }

            if (self.exempt)(name) {
                continue;
            }
            let digests = exchange(topology.dp_group(), &digest)?;
            let offending = match self.policy {
                ReplicaPolicy::MustMatch => digests.iter().position(|d| d != &digests[0]),
                ReplicaPolicy::MustDiffer => digests
                    .iter()
                    .skip(1)
                    .position(|d| d == &digests[0])
                    .map(|i| i + 1),
            };
            if let Some(offending) = offending {
                return Err(divergence(name, topology.dp_group(), offending, "data"));
            }
        }
        Ok(())
    }
}

/// All-gather this rank's digest over `group`, one word vector per group rank.
fn exchange(group: &ProcessGroup, digest: &[u8; 32]) -> Result<Vec<Vec<u32>>> {
    let words = gathered_digests(&digest_to_tensor(digest)?)?;
    if group.size() == 1 {
        return Ok(words);
    }
    let gathered = group.communicator()?.all_gather(&digest_to_tensor(digest)?)?;
    gathered_digests(&gathered)
}

fn divergence(field: &str, group: &ProcessGroup, group_rank: usize, axis: &str) -> MeshError {
    let rank = group.global_rank(group_rank).unwrap_or(group_rank);
    error!(field, rank, group = axis, "batch consistency check failed");
    MeshError::Consistency {
        field: field.to_string(),
        rank,
        group: axis.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::backend::LocalWorld;
    use crate::distributed::groups::TopologyBuilder;
    use crate::distributed::placeholder::{FieldSpec, PlaceholderRouter};
    use candle_core::{Device, Tensor};
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(10);

    /// Runs a checker on a 4-rank (tp=2, dp=2) world where each rank's
    /// "input_ids" is produced by `value(tp_rank, dp_rank)`.
    fn run(
        policy: ReplicaPolicy,
        field: &'static str,
        value: fn(usize, usize) -> f32,
    ) -> Vec<Result<()>> {
        LocalWorld::spawn(4, TIMEOUT, |backend| -> Result<()> {
            let topo = TopologyBuilder::new(4, 2, 2, 1)?.build(&backend)?;
            let router = PlaceholderRouter::for_topology(&topo)?;
            let (tp, dp) = (topo.tp_rank(), topo.dp_rank());
            let batch = router.route_batch(&[FieldSpec::new(field, 0)], |_| {
                Ok(Tensor::full(value(tp, dp), (2, 2), &Device::Cpu)?)
            })?;
            let result = BatchSanityChecker::new(true).with_policy(policy).check(&batch, &topo);
            topo.destroy()?;
            result
        })
    }

    #[test]
    fn test_distinct_replicas_pass() {
        for r in run(ReplicaPolicy::MustDiffer, "input_ids", |_, dp| dp as f32) {
            assert!(r.is_ok());
        }
    }

    #[test]
    fn test_tensor_parallel_divergence_is_reported() {
        for r in run(ReplicaPolicy::MustDiffer, "input_ids", |tp, dp| (tp * 10 + dp) as f32) {
            match r {
                Err(MeshError::Consistency { field, group, .. }) => {
                    assert_eq!(field, "input_ids");
                    assert_eq!(group, "tensor");
                }
                other => panic!("expected consistency error, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_identical_replicas_fail_when_they_must_differ() {
        let results = run(ReplicaPolicy::MustDiffer, "input_ids", |_, _| 1.0);
        for r in results {
            assert!(matches!(r, Err(MeshError::Consistency { ref group, .. }) if group == "data"));
        }
        for r in run(ReplicaPolicy::MustMatch, "input_ids", |_, _| 1.0) {
            assert!(r.is_ok());
        }
    }

    #[test]
    fn test_masks_are_exempt_from_the_data_check() {
        for r in run(ReplicaPolicy::MustDiffer, "input_mask", |_, _| 1.0) {
            assert!(r.is_ok());
        }
        for r in run(ReplicaPolicy::MustMatch, "input_mask", |_, dp| dp as f32) {
            assert!(r.is_ok());
        }
    }

    #[test]
    fn test_disabled_checker_skips_divergent_batches() {
        let results = LocalWorld::spawn(2, TIMEOUT, |backend| -> Result<()> {
            let topo = TopologyBuilder::new(2, 2, 1, 1)?.build(&backend)?;
            let rank = topo.rank() as f32;
            let batch = PlaceholderRouter::for_topology(&topo)?
                .route_batch(&[FieldSpec::new("input_ids", 0)], |_| {
                    Ok(Tensor::full(rank, 4, &Device::Cpu)?)
                })?;
            let checker = BatchSanityChecker::new(false);
            assert!(!checker.is_enabled());
            checker.check(&batch, &topo)?;
            topo.destroy()
        });
        for r in results {
            assert!(r.is_ok());
        }
    }

    #[test]
    fn test_config_toggle() {
        let mut general = GeneralConfig::default();
        assert!(!BatchSanityChecker::from_config(&general).is_enabled());
        general.ignore_sanity_checks = false;
        assert!(BatchSanityChecker::from_config(&general).is_enabled());
    }
}

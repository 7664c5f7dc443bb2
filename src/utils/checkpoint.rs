//! Optimizer checkpoints with SHA256 checksum validation.
//!
//! Nested state dicts are flattened to `/`-joined keys and written as
//! safetensors, with a companion `.meta.json` carrying the checksum. Each
//! rank writes its own file, named after its mesh coordinate.

use crate::distributed::{Axis, MeshCoordinate, MeshShape, TopologyDescriptor};
use crate::training::optimizer::{NamedOptimizer, OptimizerKind, StateDict, StateValue};
use crate::utils::digest::tensor_digest;
use crate::utils::error::{MeshError, Result};
use candle_core::{safetensors, Device, Tensor};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

pub const OPTIMIZER_CONFIG_FILE: &str = "optimizer_config.json";
const SEPARATOR: char = '/';

/// Metadata stored alongside checkpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// SHA256 checksum of the checkpoint data
    pub checksum: String,
    /// Original filename
    pub filename: String,
    /// Optimizer kind that produced the state
    pub kind: String,
    /// Flattened paths of mappings that held no tensors
    #[serde(default)]
    pub empty_mappings: Vec<String>,
    #[serde(default)]
    pub extra: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OptimizerFileConfig {
    #[serde(rename = "type")]
    kind: String,
}

/// Flatten a state dict into `/`-joined tensor keys.
///
/// Returns the tensors and the paths of empty sub-mappings, which safetensors
/// cannot represent on their own.
pub fn flatten_state_dict(state: &StateDict) -> Result<(HashMap<String, Tensor>, Vec<String>)> {
    let mut tensors = HashMap::new();
    let mut empty = Vec::new();
    flatten_into(state, "", &mut tensors, &mut empty)?;
    Ok((tensors, empty))
}

fn flatten_into(
    state: &StateDict,
    prefix: &str,
    tensors: &mut HashMap<String, Tensor>,
    empty: &mut Vec<String>,
) -> Result<()> {
    for (key, value) in state {
        if key.is_empty() || key.contains(SEPARATOR) {
            return Err(MeshError::Checkpoint(format!(
                "state key `{}` cannot be flattened",
                key
            )));
        }
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}{}{}", prefix, SEPARATOR, key)
        };
        match value {
            StateValue::Tensor(t) => {
                tensors.insert(path, t.clone());
            }
            StateValue::Nested(inner) if inner.is_empty() => empty.push(path),
            StateValue::Nested(inner) => flatten_into(inner, &path, tensors, empty)?,
        }
    }
    Ok(())
}

/// Rebuild the nested state dict from flattened keys.
pub fn unflatten_state_dict(tensors: HashMap<String, Tensor>, empty_mappings: &[String]) -> Result<StateDict> {
    let mut state = StateDict::new();
    for path in empty_mappings {
        insert_path(&mut state, path, StateValue::Nested(StateDict::new()))?;
    }
    for (path, tensor) in tensors {
        insert_path(&mut state, &path, StateValue::Tensor(tensor))?;
    }
    Ok(state)
}

fn insert_path(state: &mut StateDict, path: &str, leaf: StateValue) -> Result<()> {
    let conflict = || MeshError::Checkpoint(format!("conflicting entries at `{}`", path));
    let mut parts: Vec<&str> = path.split(SEPARATOR).collect();
    let last = parts.pop().ok_or_else(conflict)?;

    let mut node = state;
    for part in parts {
        let entry = node
            .entry(part.to_string())
            .or_insert_with(|| StateValue::Nested(StateDict::new()));
        node = match entry {
            StateValue::Nested(inner) => inner,
            StateValue::Tensor(_) => return Err(conflict()),
        };
    }
    if node.insert(last.to_string(), leaf).is_some() {
        return Err(conflict());
    }
    Ok(())
}

/// SHA256 over every tensor's dtype, shape and bytes, in key order.
pub fn compute_tensor_checksum(tensors: &HashMap<String, Tensor>) -> Result<String> {
    let mut keys: Vec<&String> = tensors.keys().collect();
    keys.sort();

    let mut hasher = Sha256::new();
    for key in keys {
        hasher.update(key.as_bytes());
        hasher.update(tensor_digest(&tensors[key])?);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// `optimizer_pp-{p}-of-{P}[_dp-{d}-of-{D}]_tp-{t}-of-{T}.safetensors`
///
/// The data-parallel part only appears when state is sharded.
pub fn optimizer_filename(coordinate: MeshCoordinate, shape: MeshShape, is_sharded: bool) -> String {
    let dp = if is_sharded {
        format!("_dp-{}-of-{}", coordinate.data, shape.size(Axis::Data))
    } else {
        String::new()
    };
    format!(
        "optimizer_pp-{}-of-{}{}_tp-{}-of-{}.safetensors",
        coordinate.pipeline,
        shape.size(Axis::Pipeline),
        dp,
        coordinate.tensor,
        shape.size(Axis::Tensor)
    )
}

/// Save a state dict with its checksum companion.
pub fn save_state_dict<P: AsRef<Path>>(state: &StateDict, kind: OptimizerKind, path: P) -> Result<()> {
    let path = path.as_ref();
    let (tensors, empty_mappings) = flatten_state_dict(state)?;
    let checksum = compute_tensor_checksum(&tensors)?;

    // Safetensors wants contiguous CPU data
    let tensors = tensors
        .into_iter()
        .map(|(k, t)| Ok((k, t.to_device(&Device::Cpu)?.contiguous()?)))
        .collect::<Result<HashMap<_, _>>>()?;
    safetensors::save(&tensors, path)?;

    let metadata = CheckpointMetadata {
        checksum: checksum.clone(),
        filename: path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("optimizer")
            .to_string(),
        kind: kind.name().to_string(),
        empty_mappings,
        extra: HashMap::new(),
    };
    let meta_json = serde_json::to_string_pretty(&metadata)
        .map_err(|e| MeshError::Checkpoint(format!("Failed to serialize metadata: {}", e)))?;
    fs::write(meta_path(path), meta_json)?;

    info!(
        checkpoint = %path.display(),
        checksum = %checksum,
        tensors = tensors.len(),
        "Optimizer state saved with checksum"
    );
    Ok(())
}

/// Load a state dict, verifying it against its checksum when present.
pub fn load_state_dict<P: AsRef<Path>>(path: P, device: &Device) -> Result<(StateDict, Option<CheckpointMetadata>)> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(MeshError::Checkpoint(format!(
            "Checkpoint not found: {}",
            path.display()
        )));
    }
    let tensors = safetensors::load(path, device)?;

    let meta_path = meta_path(path);
    let metadata = if meta_path.exists() {
        let meta: CheckpointMetadata = serde_json::from_str(&fs::read_to_string(&meta_path)?)
            .map_err(|e| MeshError::Checkpoint(format!("Failed to parse metadata: {}", e)))?;

        let current = compute_tensor_checksum(&tensors)?;
        if current != meta.checksum {
            error!(
                expected = %meta.checksum,
                actual = %current,
                "Checkpoint checksum mismatch - corruption detected"
            );
            return Err(MeshError::Checkpoint(format!(
                "Checkpoint corruption detected: checksum mismatch (expected {}, got {})",
                meta.checksum, current
            )));
        }
        Some(meta)
    } else {
        warn!(
            checkpoint = %path.display(),
            "No metadata file found - skipping checksum verification"
        );
        None
    };

    let empty = metadata.as_ref().map(|m| m.empty_mappings.as_slice()).unwrap_or(&[]);
    let state = unflatten_state_dict(tensors, empty)?;
    Ok((state, metadata))
}

fn meta_path(path: &Path) -> PathBuf {
    path.with_extension("meta.json")
}

fn is_sharded(optimizer: &dyn NamedOptimizer) -> bool {
    optimizer.shard_layout().is_some()
}

/// Save this rank's optimizer state under `dir`.
///
/// Without sharding every data-parallel replica holds the same state, so only
/// data-parallel rank 0 writes. Returns the file written, if any.
pub fn save_optimizer<P: AsRef<Path>>(
    optimizer: &dyn NamedOptimizer,
    topology: &TopologyDescriptor,
    dir: P,
) -> Result<Option<PathBuf>> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)?;

    if topology.rank() == 0 {
        let config = OptimizerFileConfig {
            kind: optimizer.kind().name().to_string(),
        };
        let json = serde_json::to_string_pretty(&config)
            .map_err(|e| MeshError::Checkpoint(format!("Failed to serialize optimizer config: {}", e)))?;
        fs::write(dir.join(OPTIMIZER_CONFIG_FILE), json)?;
    }

    let sharded = is_sharded(optimizer);
    if !sharded && topology.dp_rank() > 0 {
        return Ok(None);
    }

    let path = dir.join(optimizer_filename(topology.coordinate(), topology.shape(), sharded));
    save_state_dict(&optimizer.state_dict()?, optimizer.kind(), &path)?;
    Ok(Some(path))
}

/// Restore this rank's optimizer state from `dir`.
pub fn load_optimizer<P: AsRef<Path>>(
    optimizer: &mut dyn NamedOptimizer,
    topology: &TopologyDescriptor,
    dir: P,
) -> Result<()> {
    let dir = dir.as_ref();
    let config_path = dir.join(OPTIMIZER_CONFIG_FILE);
    let config: OptimizerFileConfig = serde_json::from_str(&fs::read_to_string(&config_path)?)
        .map_err(|e| MeshError::Checkpoint(format!("Failed to parse optimizer config: {}", e)))?;
    let expected = optimizer.kind().name();
    if config.kind != expected {
        return Err(MeshError::Checkpoint(format!(
            "checkpoint holds a {} state, optimizer is {}",
            config.kind, expected
        )));
    }

    let path = dir.join(optimizer_filename(
        topology.coordinate(),
        topology.shape(),
        is_sharded(optimizer),
    ));
    let (state, _) = load_state_dict(&path, topology.device())?;
    optimizer.load_state_dict(state)?;
    info!(checkpoint = %path.display(), kind = expected, "Optimizer state restored");
    Ok(())
}

/// Check a checkpoint's integrity without handing it to an optimizer.
pub fn validate_checkpoint<P: AsRef<Path>>(path: P) -> Result<bool> {
    match load_state_dict(path, &Device::Cpu) {
        Ok(_) => Ok(true),
        Err(MeshError::Checkpoint(msg)) if msg.contains("corruption") => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::adamw::{AdamW, AdamWConfig};
    use crate::training::optimizer::state_tensor;
    use crate::training::parameter::Parameter;
    use tempfile::tempdir;

    fn sample_state() -> Result<StateDict> {
        let mut entry = StateDict::new();
        entry.insert("exp_avg".to_string(), StateValue::Tensor(Tensor::new(&[1.0f32, 2.0], &Device::Cpu)?));
        let mut per_param = StateDict::new();
        per_param.insert("w".to_string(), StateValue::Nested(entry));
        per_param.insert("unused".to_string(), StateValue::Nested(StateDict::new()));

        let mut state = StateDict::new();
        state.insert("step".to_string(), StateValue::Tensor(Tensor::new(&[3i64], &Device::Cpu)?));
        state.insert("state".to_string(), StateValue::Nested(per_param));
        Ok(state)
    }

    #[test]
    fn test_flatten_round_trip() -> Result<()> {
        let (tensors, empty) = flatten_state_dict(&sample_state()?)?;
        let mut keys: Vec<_> = tensors.keys().cloned().collect();
        keys.sort();
        assert_eq!(keys, vec!["state/w/exp_avg", "step"]);
        assert_eq!(empty, vec!["state/unused"]);

        let state = unflatten_state_dict(tensors, &empty)?;
        let StateValue::Nested(per_param) = &state["state"] else {
            return Err(MeshError::Checkpoint("not nested".to_string()));
        };
        assert!(matches!(&per_param["unused"], StateValue::Nested(m) if m.is_empty()));
        assert_eq!(state_tensor(&state, "step")?.to_vec1::<i64>()?, vec![3]);
        Ok(())
    }

    #[test]
    fn test_keys_with_separator_are_rejected() -> Result<()> {
        let mut state = StateDict::new();
        state.insert("a/b".to_string(), StateValue::Tensor(Tensor::new(&[1u32], &Device::Cpu)?));
        assert!(matches!(flatten_state_dict(&state), Err(MeshError::Checkpoint(_))));
        Ok(())
    }

    #[test]
    fn test_filenames() -> Result<()> {
        let shape = MeshShape::new(8, 2, 2, 2)?;
        let coordinate = MeshCoordinate::new(1, 0, 1);
        assert_eq!(
            optimizer_filename(coordinate, shape, false),
            "optimizer_pp-1-of-2_tp-1-of-2.safetensors"
        );
        assert_eq!(
            optimizer_filename(coordinate, shape, true),
            "optimizer_pp-1-of-2_dp-0-of-2_tp-1-of-2.safetensors"
        );
        Ok(())
    }

    #[test]
    fn test_save_load_with_checksum() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("optimizer.safetensors");
        save_state_dict(&sample_state()?, OptimizerKind::AdamW, &path)?;
        assert!(path.with_extension("meta.json").exists());

        let (state, meta) = load_state_dict(&path, &Device::Cpu)?;
        assert_eq!(meta.map(|m| m.kind), Some("AdamW".to_string()));
        assert_eq!(state_tensor(&state, "step")?.to_vec1::<i64>()?, vec![3]);
        assert!(validate_checkpoint(&path)?);
        Ok(())
    }

    #[test]
    fn test_tampered_checkpoint_is_detected() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("optimizer.safetensors");
        save_state_dict(&sample_state()?, OptimizerKind::AdamW, &path)?;

        // Overwrite the tensors, keep the old metadata
        let mut other = HashMap::new();
        other.insert("step".to_string(), Tensor::new(&[4i64], &Device::Cpu)?);
        safetensors::save(&other, &path)?;
        assert!(!validate_checkpoint(&path)?);
        Ok(())
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            load_state_dict("/nonexistent/optimizer.safetensors", &Device::Cpu),
            Err(MeshError::Checkpoint(_))
        ));
    }

    #[test]
    fn test_adamw_state_survives_disk() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("adamw.safetensors");
        let p = Parameter::new(&Tensor::new(&[1.0f32, 2.0], &Device::Cpu)?)?;
        let mut opt = AdamW::new(vec![("w".to_string(), p.clone())], AdamWConfig::default())?;
        p.set_grad(Some(Tensor::new(&[0.5f32, 0.5], &Device::Cpu)?))?;
        opt.step()?;
        save_state_dict(&opt.state_dict()?, opt.kind(), &path)?;

        let mut fresh = AdamW::new(vec![("w".to_string(), p)], AdamWConfig::default())?;
        let (state, _) = load_state_dict(&path, &Device::Cpu)?;
        fresh.load_state_dict(state)?;
        assert_eq!(fresh.step_count(), 1);
        Ok(())
    }

    #[test]
    fn test_fresh_adamw_keeps_empty_state_mapping() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("fresh.safetensors");
        let p = Parameter::new(&Tensor::new(&[1.0f32], &Device::Cpu)?)?;
        let opt = AdamW::new(vec![("w".to_string(), p.clone())], AdamWConfig::default())?;
        save_state_dict(&opt.state_dict()?, opt.kind(), &path)?;

        let mut fresh = AdamW::new(vec![("w".to_string(), p)], AdamWConfig::default())?;
        let (state, _) = load_state_dict(&path, &Device::Cpu)?;
        fresh.load_state_dict(state)?;
        assert_eq!(fresh.step_count(), 0);
        Ok(())
    }
}

//! Packing of tokenized documents into fixed-length training rows.

use crate::utils::error::{MeshError, Result};
use candle_core::{Device, Tensor};
use tracing::debug;

/// Concatenate `documents` and cut the stream into rows of
/// `sequence_length + 1` tokens, each overlapping the next by one token.
///
/// A stream of `n` tokens yields `(n - 1) / sequence_length - 1` rows when
/// `n > sequence_length`, otherwise none. The final full window and any
/// shorter remainder are dropped.
pub fn group_texts(documents: &[Vec<u32>], sequence_length: usize) -> Result<Vec<Vec<u32>>> {
    if sequence_length == 0 {
        return Err(MeshError::Config("sequence_length must be positive".to_string()));
    }
    let stream: Vec<u32> = documents.iter().flatten().copied().collect();
    let width = sequence_length + 1;

    let mut total = stream.len();
    if total >= width {
        total = ((total - 1) / sequence_length) * sequence_length + 1;
    }
    let rows: Vec<Vec<u32>> = if total > width {
        (0..total - width)
            .step_by(sequence_length)
            .map(|start| stream[start..start + width].to_vec())
            .collect()
    } else {
        Vec::new()
    };

    debug!(
        documents = documents.len(),
        tokens = stream.len(),
        rows = rows.len(),
        "Packed token stream"
    );
    Ok(rows)
}

/// Stack packed rows into a `(rows, sequence_length + 1)` tensor for
/// `ClmCollator::collate`.
pub fn rows_to_tensor(rows: &[Vec<u32>], device: &Device) -> Result<Tensor> {
    let width = rows
        .first()
        .map(Vec::len)
        .ok_or_else(|| MeshError::Config("no packed rows to stack".to_string()))?;
    if let Some(bad) = rows.iter().find(|r| r.len() != width) {
        return Err(MeshError::Config(format!(
            "packed rows differ in length: {} vs {}",
            bad.len(),
            width
        )));
    }
    let data: Vec<u32> = rows.iter().flatten().copied().collect();
    Ok(Tensor::from_vec(data, (rows.len(), width), device)?)
}

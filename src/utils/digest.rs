//! SHA256 digests over raw tensor bytes.
//!
//! Used both for checkpoint checksums and for cross-rank bit-identity checks,
//! where only the 32-byte digest travels over the wire.

use crate::utils::error::Result;
use candle_core::{DType, Device, Tensor};
use sha2::{Digest, Sha256};

/// Raw little-endian bytes of a tensor in row-major order.
///
/// Half-precision types are widened to f32 first, which is exact.
pub fn tensor_bytes(tensor: &Tensor) -> Result<Vec<u8>> {
    let flat = tensor.flatten_all()?;
    let bytes = match flat.dtype() {
        DType::U8 => flat.to_vec1::<u8>()?,
        DType::U32 => flat
            .to_vec1::<u32>()?
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect(),
        DType::I64 => flat
            .to_vec1::<i64>()?
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect(),
        DType::F64 => flat
            .to_vec1::<f64>()?
            .iter()
            .flat_map(|v| v.to_bits().to_le_bytes())
            .collect(),
        _ => flat
            .to_dtype(DType::F32)?
            .to_vec1::<f32>()?
            .iter()
            .flat_map(|v| v.to_bits().to_le_bytes())
            .collect(),
    };
    Ok(bytes)
}

/// Digest of dtype, shape and data of one tensor.
pub fn tensor_digest(tensor: &Tensor) -> Result<[u8; 32]> {
    let mut hasher = Sha256::new();
    hasher.update(format!("{:?}:{:?}", tensor.dtype(), tensor.dims()).as_bytes());
    hasher.update(tensor_bytes(tensor)?);
    Ok(hasher.finalize().into())
}

/// Pack a digest into a `u32` tensor of 8 words so it can ride a collective.
pub fn digest_to_tensor(digest: &[u8; 32]) -> Result<Tensor> {
    let words: Vec<u32> = digest
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Ok(Tensor::new(words.as_slice(), &Device::Cpu)?)
}

/// Split an all-gathered digest tensor back into one word vector per rank.
pub fn gathered_digests(gathered: &Tensor) -> Result<Vec<Vec<u32>>> {
    let words = gathered.flatten_all()?.to_vec1::<u32>()?;
    Ok(words.chunks(8).map(|c| c.to_vec()).collect())
}

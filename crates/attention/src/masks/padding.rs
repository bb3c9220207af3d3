//! Padding masks for left- or right-padded batches.

use candle_core::{bail, DType, Device, Result, Tensor};

use super::{causal::build_causal_mask, MASK_DTYPE};

/// Construct padding masks from per-row valid key lengths, shaped `[rows, 1, q_len, k_len]`.
pub fn padding_mask_from_lengths(
    device: &Device,
    key_lengths: &[usize],
    q_len: usize,
    k_len: usize,
) -> Result<Tensor> {
    let rows = key_lengths.len();
    let mut data = vec![0f32; rows * q_len * k_len];
    for (b, &valid) in key_lengths.iter().enumerate() {
        let valid = valid.min(k_len);
        for q in 0..q_len {
            let row_start = (b * q_len + q) * k_len;
            data[row_start + valid..row_start + k_len].fill(f32::NEG_INFINITY);
        }
    }
    Tensor::from_vec(data, (rows, 1, q_len, k_len), device)
}

/// Turn a `[rows, k_len]` keep-mask (`1` keep, `0` pad) into the additive
/// causal decoder mask `[rows, 1, q_len, k_len]`.
pub fn decoder_mask_from_padding(keep: &Tensor, q_len: usize) -> Result<Tensor> {
    let (rows, k_len) = match keep.dims() {
        [rows, k_len] => (*rows, *k_len),
        dims => bail!("padding mask must be [rows, k_len], got {:?}", dims),
    };
    if q_len > k_len {
        bail!("q_len {q_len} exceeds mask key length {k_len}");
    }
    let keep = keep.to_dtype(DType::F32)?;
    let pad = keep
        .eq(0f64)?
        .where_cond(
            &Tensor::full(f32::NEG_INFINITY, (rows, k_len), keep.device())?,
            &Tensor::zeros((rows, k_len), MASK_DTYPE, keep.device())?,
        )?
        .reshape((rows, 1, 1, k_len))?;
    let causal = build_causal_mask(keep.device(), 1, 1, q_len, k_len)?;
    causal.broadcast_add(&pad)
}

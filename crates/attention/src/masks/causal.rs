//! Builders for causal attention masks.

use candle_core::{Device, Result, Tensor};

/// Construct a causal mask shaped `[batch, num_heads, q_len, k_len]`.
///
/// When `k_len > q_len`, query `i` sees keys `0..=i + (k_len - q_len)`. Pass
/// `batch = num_heads = 1` for a mask that broadcasts over rows and heads.
pub fn build_causal_mask(
    device: &Device,
    batch: usize,
    num_heads: usize,
    q_len: usize,
    k_len: usize,
) -> Result<Tensor> {
    let offset = k_len.saturating_sub(q_len);
    let plane: Vec<f32> = (0..q_len)
        .flat_map(|q| {
            (0..k_len).map(move |k| if k > q + offset { f32::NEG_INFINITY } else { 0.0 })
        })
        .collect();

    let data = plane.repeat(batch * num_heads);
    Tensor::from_vec(data, (batch, num_heads, q_len, k_len), device)
}

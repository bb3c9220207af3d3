//! Fused scaled dot-product attention.
//!
//! The softmax scale is folded into the query before the score matmul, and
//! mask add plus normalisation run through candle's single-pass
//! `softmax_last_dim` kernel. Rows whose every key is masked come out as
//! zeros, matching the reference path. Compiled only with the `fused` feature.

use candle_core::{DType, Tensor, D};
use candle_nn::ops::softmax_last_dim;

use crate::core::{validate, AttentionError, ScoreRequest, Scores};

pub fn sdpa(req: &ScoreRequest<'_>) -> Result<Scores, AttentionError> {
    let (rows, heads, q_len, k_len, head_dim) = validate(req)?;
    let dtype = req.q.dtype();
    let merged = rows * heads;

    let q = (req.q.to_dtype(DType::F32)? * req.scale)?.reshape((merged, q_len, head_dim))?;
    let k = req.k.to_dtype(DType::F32)?.reshape((merged, k_len, head_dim))?;
    let v = req.v.to_dtype(DType::F32)?.reshape((merged, k_len, head_dim))?;

    let mut scores = q.matmul(&k.t()?)?.reshape((rows, heads, q_len, k_len))?;
    if let Some(mask) = req.mask {
        scores = scores.broadcast_add(mask)?;
    }
    // Clamp -inf so fully masked rows stay finite, then zero those rows.
    let live = scores
        .max_keepdim(D::Minus1)?
        .ge(f32::MIN as f64)?
        .to_dtype(DType::F32)?;
    let scores = scores.clamp(f32::MIN, f32::MAX)?.contiguous()?;
    let probs = softmax_last_dim(&scores)?.broadcast_mul(&live)?;

    let context = probs
        .reshape((merged, q_len, k_len))?
        .matmul(&v)?
        .reshape((rows, heads, q_len, head_dim))?
        .to_dtype(dtype)?;
    Ok(Scores {
        context,
        weights: req.output_attentions.then_some(probs),
    })
}

//! Portable three-step attention: scaled matmul, masked softmax, weighted sum.
//!
//! Every step is a separate tensor op with an explicit max-subtracted softmax.
//! This path is always available and is the baseline the fused kernel is
//! validated against.

use candle_core::{DType, Tensor, D};

use crate::core::{validate, AttentionError, ScoreRequest, Scores};

/// Naive scaled dot-product attention over `[rows, heads, seq, head_dim]` inputs.
pub fn sdpa(req: &ScoreRequest<'_>) -> Result<Scores, AttentionError> {
    validate(req)?;
    let dtype = req.q.dtype();

    let q = req.q.to_dtype(DType::F32)?.contiguous()?;
    let k = req.k.to_dtype(DType::F32)?.contiguous()?;
    let v = req.v.to_dtype(DType::F32)?.contiguous()?;

    let k_t = k.transpose(2, 3)?.contiguous()?;
    let mut scores = (q.matmul(&k_t)? * req.scale)?;
    if let Some(mask) = req.mask {
        scores = scores.broadcast_add(mask)?;
    }

    let max = scores.max_keepdim(D::Minus1)?;
    // Fully masked rows produce -inf maxima; pin them so exp() yields zeros, not NaN.
    let max = max.clamp(f32::MIN, f32::MAX)?;
    let exp = scores.broadcast_sub(&max)?.exp()?;
    let denom = exp.sum_keepdim(D::Minus1)?;
    let denom = denom.clamp(f32::MIN_POSITIVE, f32::MAX)?;
    let probs = exp.broadcast_div(&denom)?;

    let context = probs.matmul(&v)?.to_dtype(dtype)?;
    Ok(Scores {
        context,
        weights: req.output_attentions.then_some(probs),
    })
}

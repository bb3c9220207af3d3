//! Core types shared by the score kernels and the attention module.
//!
//! Score kernels operate on tensors with layout
//! `[rows, n_heads, seq_len, head_dim]` where `rows` is `batch × beam`. Key
//! and value heads have already been repeated to the query head count. The
//! output tensor mirrors the query layout and dtype, and reductions accumulate
//! in `f32` regardless of the incoming dtype (`bf16`, `f16`, or `f32`).

pub mod capability;
pub mod config;
pub mod errors;

use candle_core::{DType, Tensor};

pub use capability::{Capabilities, SdpaBackend, Strategies};
pub use config::AttentionConfig;
pub use errors::AttentionError;

use crate::masks::MASK_DTYPE;

/// Inputs of one scaled dot-product attention call.
#[derive(Debug, Clone, Copy)]
pub struct ScoreRequest<'a> {
    pub q: &'a Tensor,
    pub k: &'a Tensor,
    pub v: &'a Tensor,
    /// Additive mask shaped `[rows, 1 or n_heads, q_len, k_len]`.
    pub mask: Option<&'a Tensor>,
    pub scale: f64,
    /// Also return the softmax probabilities.
    pub output_attentions: bool,
}

/// Attention context plus the optional probabilities, `[rows, heads, q_len, k_len]` in f32.
#[derive(Debug, Clone)]
pub struct Scores {
    pub context: Tensor,
    pub weights: Option<Tensor>,
}

/// Score computation selected once from [`Capabilities`].
pub type ScoreKernel = fn(&ScoreRequest<'_>) -> Result<Scores, AttentionError>;

/// Shape and dtype checks shared by every kernel. Returns `(rows, heads, q_len, k_len, head_dim)`.
pub(crate) fn validate(
    req: &ScoreRequest<'_>,
) -> Result<(usize, usize, usize, usize, usize), AttentionError> {
    let (q, k, v) = (req.q, req.k, req.v);
    let device = q.device();
    if !device.same_device(k.device()) || !device.same_device(v.device()) {
        return Err(AttentionError::shape("q, k, v must reside on the same device"));
    }

    let dtype = q.dtype();
    if dtype != k.dtype() || dtype != v.dtype() {
        return Err(AttentionError::shape("q, k, v must share the same dtype"));
    }
    if !matches!(dtype, DType::F32 | DType::F16 | DType::BF16) {
        return Err(AttentionError::UnsupportedDType {
            requested: format!("{dtype:?}"),
        });
    }

    let (rows, heads, q_len, head_dim) = q
        .dims4()
        .map_err(|_| AttentionError::shape("q must have shape [rows, heads, seq_len, head_dim]"))?;
    let (kb, kh, k_len, kd) = k
        .dims4()
        .map_err(|_| AttentionError::shape("k must have shape [rows, heads, seq_len, head_dim]"))?;
    let (vb, vh, vk, vd) = v
        .dims4()
        .map_err(|_| AttentionError::shape("v must have shape [rows, heads, seq_len, head_dim]"))?;

    if kb != rows || kh != heads || kd != head_dim {
        return Err(AttentionError::shape(format!(
            "k shape mismatch: expected [{rows}, {heads}, ?, {head_dim}] got [{kb}, {kh}, {k_len}, {kd}]"
        )));
    }
    if vb != rows || vh != heads || vk != k_len || vd != head_dim {
        return Err(AttentionError::shape(format!(
            "v shape mismatch: expected [{rows}, {heads}, {k_len}, {head_dim}] got [{vb}, {vh}, {vk}, {vd}]"
        )));
    }

    if let Some(mask) = req.mask {
        if !device.same_device(mask.device()) {
            return Err(AttentionError::shape("mask must reside on the same device as q"));
        }
        if mask.dtype() != MASK_DTYPE {
            return Err(AttentionError::UnsupportedDType {
                requested: format!("mask expects dtype {MASK_DTYPE:?}, got {:?}", mask.dtype()),
            });
        }
        let (mb, mh, mq, mk) = mask.dims4().map_err(|_| {
            AttentionError::shape("mask must have shape [rows|1, heads|1, q_len, k_len]")
        })?;
        if (mb != rows && mb != 1) || (mh != heads && mh != 1) || mq != q_len || mk != k_len {
            return Err(AttentionError::shape(format!(
                "mask shape mismatch: expected [{rows}|1, {heads}|1, {q_len}, {k_len}] got [{mb}, {mh}, {mq}, {mk}]"
            )));
        }
    }

    Ok((rows, heads, q_len, k_len, head_dim))
}

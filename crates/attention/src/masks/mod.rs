//! Additive attention masks.
//!
//! All masks produced here are additive tensors with dtype `f32`, shaped
//! `[rows | 1, heads | 1, q_len, k_len]`. Values are either `0.0` (keep) or
//! `f32::NEG_INFINITY` (discard). Queries are aligned with the most recent
//! `q_len` keys, so a mask built for a decode step covers the whole cache.

pub mod causal;
pub mod padding;

use candle_core::DType;

/// Dtype shared by all additive masks.
pub const MASK_DTYPE: DType = DType::F32;

pub use causal::build_causal_mask;
pub use padding::{decoder_mask_from_padding, padding_mask_from_lengths};

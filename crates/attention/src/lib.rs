//! Attention sublayer for optimized decoder blocks.
//!
//! [`module::AttentionModule`] owns the q/k/v/o projections of one layer and
//! runs a step of causal self-attention: projection, in-place rotary through
//! the model's shared [`embedding::positional::RotaryState`], KV-cache append,
//! scaled dot-product scores and the output projection with an optional
//! residual. Score kernels operate on `[rows, n_heads, seq_len, head_dim]`
//! tensors in bf16, f16 or f32, reduce in `f32`, and return the input dtype.
//!
//! The kernel, the residual strategy, the weight orientation and the cache
//! layout are captured once by [`core::Capabilities`] and resolved into
//! [`core::Strategies`]; nothing is re-queried on the forward path. The fused
//! kernel is compiled with the default `fused` feature; without it every
//! request degrades to the naive three-step path in [`reference`].

pub mod core;
pub mod kv_cache;
pub mod masks;
pub mod module;
pub mod reference;

#[cfg(feature = "fused")]
pub mod fused;

pub use core::{AttentionConfig, AttentionError, Capabilities, ScoreKernel, Strategies};
pub use kv_cache::{CacheLayout, KvCache};
pub use module::{AttentionInput, AttentionModule, AttentionOutput};

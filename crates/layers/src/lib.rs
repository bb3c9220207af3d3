//! Building blocks for optimized decoder layers.
//!
//! Projections come in two flavours, dense [`linear::Linear`] and 4-bit
//! [`quant::QuantizedLinear`], unified behind [`projection::Projection`] so
//! attention and MLP modules can fuse and re-layout them without caring which
//! backend holds the weights.

pub mod activations;
pub mod checks;
pub mod dtypes;
pub mod linear;
pub mod mlp;
pub mod norm;
pub mod projection;
pub mod quant;
pub mod residual;

use thiserror::Error;

pub use quant::QuantError;

/// Errors raised while configuring or assembling layers.
#[derive(Debug, Error)]
pub enum LayerError {
    #[error("unknown activation `{0}`")]
    UnknownActivation(String),
    #[error("unsupported dtype tag `{0}`")]
    UnsupportedDtype(String),
    #[error("cannot fuse projections: {0}")]
    Fusion(String),
    #[error(transparent)]
    Quant(#[from] QuantError),
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

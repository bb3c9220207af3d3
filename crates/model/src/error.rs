//! Error types for configuration, porting and block execution.

use attention::AttentionError;
use layers::{LayerError, QuantError};
use thiserror::Error;

/// Raised while building a [`TransformerConfig`](crate::config::TransformerConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown rope scaling type `{0}`")]
    UnknownRopeScaling(String),
    #[error("rope scaling `{kind}` is missing `{field}`")]
    MissingRopeField { kind: String, field: &'static str },
    #[error("unknown architecture `{0}`")]
    UnknownArchitecture(String),
    #[error("unsupported quantization `{0}`")]
    UnsupportedQuant(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error(transparent)]
    Layer(#[from] LayerError),
    #[error("failed to parse model config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("failed to read model config: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

/// Raised while porting weights into a block or running it.
#[derive(Debug, Error)]
pub enum BlockError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Attention(#[from] AttentionError),
    #[error(transparent)]
    Layer(#[from] LayerError),
    #[error(transparent)]
    Quant(#[from] QuantError),
    #[error("source module is missing `{0}`")]
    MissingWeight(&'static str),
    #[error("block {0} has already been ported")]
    AlreadyPorted(usize),
    #[error("invalid block input: {0}")]
    Shape(String),
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

//! Error types emitted by the attention sublayer.

use thiserror::Error;

/// Attention-specific error category.
#[derive(Debug, Error)]
pub enum AttentionError {
    /// The supplied tensor shapes do not align with the documented contract.
    #[error("invalid tensor shape for {context}")]
    InvalidShape { context: String },
    /// The kernel does not support the requested data type.
    #[error("unsupported dtype {requested}")]
    UnsupportedDType { requested: String },
    /// A capability override or module configuration could not be honoured.
    #[error("invalid attention configuration: {0}")]
    Config(String),
    /// `forward` or a porting step ran before `load_parameter`.
    #[error("attention weights have not been loaded ({0})")]
    NotLoaded(&'static str),
    #[error(transparent)]
    Layer(#[from] layers::LayerError),
    /// A backend-specific failure propagated to the caller.
    #[error(transparent)]
    Backend(#[from] candle_core::Error),
}

impl AttentionError {
    pub(crate) fn shape(context: impl Into<String>) -> Self {
        AttentionError::InvalidShape {
            context: context.into(),
        }
    }
}

//! Per-rank geometry of an attention sublayer.

use super::AttentionError;

/// Head geometry and bias flags of one attention module.
///
/// Head counts are the ones held by this rank; under tensor parallelism the
/// model divides the global counts before building the module.
#[derive(Debug, Clone, PartialEq)]
pub struct AttentionConfig {
    pub hidden_size: usize,
    pub num_heads: usize,
    /// Key/value heads; fewer than `num_heads` for grouped-query attention.
    pub num_kv_heads: usize,
    pub head_dim: usize,
    pub qkv_bias: bool,
    pub o_bias: bool,
    /// Softmax scale; `1 / sqrt(head_dim)` when `None`.
    pub scale: Option<f64>,
}

impl AttentionConfig {
    /// Multi-head attention over the full hidden size with no biases.
    pub fn new(hidden_size: usize, num_heads: usize) -> Self {
        Self {
            hidden_size,
            num_heads,
            num_kv_heads: num_heads,
            head_dim: if num_heads == 0 { 0 } else { hidden_size / num_heads },
            qkv_bias: false,
            o_bias: false,
            scale: None,
        }
    }

    pub fn with_kv_heads(mut self, num_kv_heads: usize) -> Self {
        self.num_kv_heads = num_kv_heads;
        self
    }

    pub fn validate(&self) -> Result<(), AttentionError> {
        if self.num_heads == 0 || self.num_kv_heads == 0 || self.head_dim == 0 {
            return Err(AttentionError::Config(format!(
                "head counts and head_dim must be non-zero ({self:?})"
            )));
        }
        if self.num_heads % self.num_kv_heads != 0 {
            return Err(AttentionError::Config(format!(
                "num_heads {} is not a multiple of num_kv_heads {}",
                self.num_heads, self.num_kv_heads
            )));
        }
        if self.head_dim % 2 != 0 {
            return Err(AttentionError::Config(format!(
                "head_dim {} must be even for rotary embeddings",
                self.head_dim
            )));
        }
        Ok(())
    }

    /// Query heads sharing one key/value head.
    pub fn kv_groups(&self) -> usize {
        self.num_heads / self.num_kv_heads
    }

    pub fn q_size(&self) -> usize {
        self.num_heads * self.head_dim
    }

    pub fn kv_size(&self) -> usize {
        self.num_kv_heads * self.head_dim
    }

    pub fn softmax_scale(&self) -> f64 {
        self.scale
            .unwrap_or_else(|| 1.0 / (self.head_dim as f64).sqrt())
    }
}

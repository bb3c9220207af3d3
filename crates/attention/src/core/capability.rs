//! One-time backend capability capture.
//!
//! [`Capabilities`] records what the execution target offers; [`Capabilities::resolve`]
//! turns it into [`Strategies`] that modules store and use on every call
//! without re-querying. Environment overrides follow the `ROPE_*` pattern of
//! the embedding crate:
//!
//! | variable | values |
//! |---|---|
//! | `BLOCK_SDPA` | `fused`, `naive` |
//! | `BLOCK_WEIGHT_LAYOUT` | `native`, `transposed` |
//! | `BLOCK_CACHE_LAYOUT` | `batch`, `seq` |
//! | `BLOCK_FUSED_RESIDUAL` | `0`, `1` |

use candle_core::Device;
use layers::{linear::WeightLayout, residual::ResidualStrategy};

use super::{AttentionError, ScoreKernel};
use crate::kv_cache::CacheLayout;

/// Score computation path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpaBackend {
    Fused,
    /// Scaled matmul, masked softmax, weighted sum.
    Naive,
}

impl SdpaBackend {
    fn parse(value: &str) -> Result<Self, AttentionError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "fused" => Ok(SdpaBackend::Fused),
            "naive" => Ok(SdpaBackend::Naive),
            other => Err(AttentionError::Config(format!(
                "BLOCK_SDPA must be `fused` or `naive`, got `{other}`"
            ))),
        }
    }
}

/// What the execution target supports, captured at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub sdpa: SdpaBackend,
    pub weight_layout: WeightLayout,
    pub cache_layout: CacheLayout,
    /// Whether output projections may fold the residual add into their epilogue.
    pub fused_residual: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            sdpa: SdpaBackend::Fused,
            weight_layout: WeightLayout::OutputMajor,
            cache_layout: CacheLayout::BatchMajor,
            fused_residual: true,
        }
    }
}

/// Strategies resolved from [`Capabilities`], stored by modules.
#[derive(Debug, Clone, Copy)]
pub struct Strategies {
    pub sdpa: SdpaBackend,
    pub score: ScoreKernel,
    pub residual: ResidualStrategy,
    pub weight_layout: WeightLayout,
    pub cache_layout: CacheLayout,
}

impl Capabilities {
    /// Static capability check for `device`.
    ///
    /// The CPU GEMM path reads weights as `[in, out]`; accelerators keep the
    /// checkpoint's `[out, in]` orientation.
    pub fn detect(device: &Device) -> Self {
        let weight_layout = if device.is_cpu() {
            WeightLayout::InputMajor
        } else {
            WeightLayout::OutputMajor
        };
        Self {
            sdpa: if cfg!(feature = "fused") {
                SdpaBackend::Fused
            } else {
                SdpaBackend::Naive
            },
            weight_layout,
            ..Self::default()
        }
    }

    /// [`Capabilities::detect`] followed by the `BLOCK_*` environment overrides.
    pub fn from_env(device: &Device) -> Result<Self, AttentionError> {
        Self::detect(device).with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides read through `lookup`. Invalid values are rejected, never ignored.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, AttentionError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("BLOCK_SDPA") {
            self.sdpa = SdpaBackend::parse(&value)?;
        }
        if let Some(value) = lookup("BLOCK_WEIGHT_LAYOUT") {
            self.weight_layout = match value.trim().to_ascii_lowercase().as_str() {
                "native" | "output_major" => WeightLayout::OutputMajor,
                "transposed" | "input_major" => WeightLayout::InputMajor,
                other => {
                    return Err(AttentionError::Config(format!(
                        "BLOCK_WEIGHT_LAYOUT must be `native` or `transposed`, got `{other}`"
                    )))
                }
            };
        }
        if let Some(value) = lookup("BLOCK_CACHE_LAYOUT") {
            self.cache_layout = match value.trim().to_ascii_lowercase().as_str() {
                "batch" => CacheLayout::BatchMajor,
                "seq" => CacheLayout::SeqMajor,
                other => {
                    return Err(AttentionError::Config(format!(
                        "BLOCK_CACHE_LAYOUT must be `batch` or `seq`, got `{other}`"
                    )))
                }
            };
        }
        if let Some(value) = lookup("BLOCK_FUSED_RESIDUAL") {
            self.fused_residual = match value.trim() {
                "1" | "true" => true,
                "0" | "false" => false,
                other => {
                    return Err(AttentionError::Config(format!(
                        "BLOCK_FUSED_RESIDUAL must be 0 or 1, got `{other}`"
                    )))
                }
            };
        }
        Ok(self)
    }

    /// Pick the kernels once. A fused request without a fused kernel degrades to naive.
    pub fn resolve(&self) -> Strategies {
        let (sdpa, score) = match (self.sdpa, fused_kernel()) {
            (SdpaBackend::Fused, Some(kernel)) => (SdpaBackend::Fused, kernel),
            (SdpaBackend::Fused, None) => {
                log::warn!("fused SDPA requested but not compiled in; using the naive path");
                (SdpaBackend::Naive, crate::reference::sdpa as ScoreKernel)
            }
            (SdpaBackend::Naive, _) => (SdpaBackend::Naive, crate::reference::sdpa as ScoreKernel),
        };
        let residual = if self.fused_residual {
            ResidualStrategy::Fused
        } else {
            ResidualStrategy::Separate
        };
        let strategies = Strategies {
            sdpa,
            score,
            residual,
            weight_layout: self.weight_layout,
            cache_layout: self.cache_layout,
        };
        log::info!(
            "attention strategies resolved: sdpa={:?} residual={:?} weights={:?} kv_cache={:?}",
            strategies.sdpa,
            strategies.residual,
            strategies.weight_layout,
            strategies.cache_layout
        );
        strategies
    }
}

#[cfg(feature = "fused")]
fn fused_kernel() -> Option<ScoreKernel> {
    Some(crate::fused::sdpa)
}

#[cfg(not(feature = "fused"))]
fn fused_kernel() -> Option<ScoreKernel> {
    None
}

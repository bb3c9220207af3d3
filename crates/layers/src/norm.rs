//! Normalisation sublayers of a decoder block.
//!
//! Normalisation runs along the last axis for any number of leading axes, so
//! the same layer serves both `(rows, seq, hidden)` and `(seq, rows, hidden)`
//! layouts. Statistics are computed in [`PrecisionPolicy::reduction`] before
//! the affine parameters are applied and the result is cast back to storage.

use candle_core::{Error, Result, Tensor, D};

use crate::{checks, dtypes::PrecisionPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormKind {
    LayerNorm,
    /// LLaMA-style root mean square norm without mean subtraction.
    RmsNorm,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormConfig {
    pub hidden_size: usize,
    pub epsilon: f64,
    pub kind: NormKind,
}

impl NormConfig {
    pub fn new(hidden_size: usize, kind: NormKind) -> Self {
        Self {
            hidden_size,
            epsilon: 1e-5,
            kind,
        }
    }
}

/// Shared interface for normalisation layers used inside decoder blocks.
pub trait NormalizationLayer: Send + Sync {
    fn config(&self) -> &NormConfig;

    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor>;
}

/// LayerNorm or RMSNorm with a learned scale and, for LayerNorm, an optional bias.
#[derive(Debug, Clone)]
pub struct Norm {
    config: NormConfig,
    weight: Tensor,
    bias: Option<Tensor>,
}

impl Norm {
    pub fn new(config: NormConfig, weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        if config.kind == NormKind::RmsNorm && bias.is_some() {
            return Err(Error::Msg("RMSNorm does not support bias parameters".into()));
        }
        checks::expect_shape("norm.weight", &weight, &[config.hidden_size])?;
        checks::expect_dtype_in("norm.weight", &weight, checks::FLOAT_DTYPES)?;
        if let Some(bias) = &bias {
            checks::expect_shape("norm.bias", bias, &[config.hidden_size])?;
            checks::expect_dtype_in("norm.bias", bias, checks::FLOAT_DTYPES)?;
        }
        Ok(Self {
            config,
            weight,
            bias,
        })
    }

    pub fn rms(weight: Tensor, epsilon: f64) -> Result<Self> {
        let mut config = NormConfig::new(weight.dim(0)?, NormKind::RmsNorm);
        config.epsilon = epsilon;
        Self::new(config, weight, None)
    }

    pub fn layer(weight: Tensor, bias: Option<Tensor>, epsilon: f64) -> Result<Self> {
        let mut config = NormConfig::new(weight.dim(0)?, NormKind::LayerNorm);
        config.epsilon = epsilon;
        Self::new(config, weight, bias)
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }
}

impl NormalizationLayer for Norm {
    fn config(&self) -> &NormConfig {
        &self.config
    }

    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_last_dim("norm.input", hidden, self.config.hidden_size)?;

        let hidden_size = self.config.hidden_size as f64;
        let mut compute = policy.cast_for_reduction(hidden)?;
        if self.config.kind == NormKind::LayerNorm {
            let mean = (compute.sum_keepdim(D::Minus1)? / hidden_size)?;
            compute = compute.broadcast_sub(&mean)?;
        }
        let variance = (compute.sqr()?.sum_keepdim(D::Minus1)? / hidden_size)?;
        let denom = (variance + self.config.epsilon)?.sqrt()?;
        let mut normalized = compute
            .broadcast_div(&denom)?
            .broadcast_mul(&self.weight.to_dtype(policy.reduction())?)?;
        if let Some(bias) = &self.bias {
            normalized = normalized.broadcast_add(&bias.to_dtype(policy.reduction())?)?;
        }
        policy.cast_to_storage(&normalized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::ops;

    fn build_input(device: &Device, dtype: DType, dims: (usize, usize, usize)) -> Result<Tensor> {
        let total = dims.0 * dims.1 * dims.2;
        let data = (0..total)
            .map(|i| (i as f32 * 0.25_f32) - 1.5_f32)
            .collect::<Vec<_>>();
        Tensor::from_vec(data, dims, device)?.to_dtype(dtype)
    }

    fn max_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
        a.to_dtype(DType::F32)?
            .sub(&b.to_dtype(DType::F32)?)?
            .abs()?
            .max_all()?
            .to_vec0::<f32>()
    }

    #[test]
    fn layer_norm_matches_candle_kernel() -> Result<()> {
        let device = Device::Cpu;
        let weight = Tensor::from_vec(vec![1.0f32, 0.5, -0.25, 1.5], (4,), &device)?;
        let bias = Tensor::from_vec(vec![0.1f32, -0.2, 0.05, 0.0], (4,), &device)?;
        for &dtype in &[DType::F32, DType::F16, DType::BF16] {
            let input = build_input(&device, dtype, (2, 3, 4))?;
            let norm = Norm::layer(weight.to_dtype(dtype)?, Some(bias.to_dtype(dtype)?), 1e-5)?;
            let policy = PrecisionPolicy::from_parameter_dtype(dtype);
            let output = norm.forward(&input, &policy)?;
            assert_eq!(output.dtype(), dtype);
            let reference = ops::layer_norm(
                &input.to_dtype(DType::F32)?,
                &weight,
                &bias,
                1e-5,
            )?;
            let tol = match dtype {
                DType::F16 => 5e-3,
                DType::BF16 => 3e-2,
                _ => 5e-4,
            };
            let diff = max_diff(&output, &reference)?;
            assert!(diff < tol, "max diff {diff} for dtype {dtype:?}");
        }
        Ok(())
    }

    #[test]
    fn rms_norm_matches_candle_kernel_in_seq_major_layout() -> Result<()> {
        let device = Device::Cpu;
        let weight = Tensor::from_vec(
            (0..6).map(|i| 1.0_f32 + i as f32 * 0.01).collect::<Vec<_>>(),
            (6,),
            &device,
        )?;
        let norm = Norm::rms(weight.clone(), 1e-6)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        let input = build_input(&device, DType::F32, (2, 4, 6))?;
        let seq_major = input.transpose(0, 1)?;
        let output = norm.forward(&seq_major, &policy)?.transpose(0, 1)?;
        let reference = ops::rms_norm(&input, &weight, 1e-6)?;
        assert!(max_diff(&output, &reference)? < 5e-4);
        Ok(())
    }

    #[test]
    fn rms_norm_rejects_bias() -> Result<()> {
        let device = Device::Cpu;
        let w = Tensor::ones(4, DType::F32, &device)?;
        let config = NormConfig::new(4, NormKind::RmsNorm);
        assert!(Norm::new(config, w.clone(), Some(w)).is_err());
        Ok(())
    }
}

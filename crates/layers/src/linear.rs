//! Dense affine projections.
//!
//! Inputs are shaped `(.., in_dim)` with any number of leading axes and produce
//! `(.., out_dim)`. Weights are held either output-major (`[out, in]`, the
//! checkpoint layout) or input-major (`[in, out]`, ready for a plain GEMM);
//! [`Linear::transpose_parameter`] moves between the two once at porting time.
//! Several projections reading the same input can be fused into one along the
//! output axis with [`Linear::fuse`].

use candle_core::{Error, Result, Tensor};

use crate::{checks, dtypes::PrecisionPolicy};

/// Physical orientation of a projection weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WeightLayout {
    /// `[out, in]`, as stored in checkpoints.
    #[default]
    OutputMajor,
    /// `[in, out]`, consumed directly by the GEMM.
    InputMajor,
}

impl WeightLayout {
    /// Axis holding output features in this layout.
    pub fn output_axis(&self) -> usize {
        match self {
            WeightLayout::OutputMajor => 0,
            WeightLayout::InputMajor => 1,
        }
    }
}

/// Configuration shared by projection layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearConfig {
    pub input_dim: usize,
    pub output_dim: usize,
    pub bias: bool,
}

impl LinearConfig {
    pub fn new(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
            bias: true,
        }
    }
}

/// Shared interface for affine projections, dense or quantized.
pub trait LinearLayer: Send + Sync {
    fn config(&self) -> &LinearConfig;

    /// Projects `hidden` and returns the result in `policy.compute()` precision.
    fn project(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor>;

    /// Projects and casts back to storage precision.
    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        policy.cast_to_storage(&self.project(hidden, policy)?)
    }

    /// Projects and adds `residual` before leaving compute precision.
    fn forward_with_residual(
        &self,
        hidden: &Tensor,
        residual: &Tensor,
        policy: &PrecisionPolicy,
    ) -> Result<Tensor> {
        let out = self.project(hidden, policy)?;
        checks::expect_same_shape("projection.output", &out, "residual", residual)?;
        let summed = out.add(&policy.cast_for_matmul(residual)?)?;
        policy.cast_to_storage(&summed)
    }
}

/// Dense affine projection with optional bias.
#[derive(Debug, Clone)]
pub struct Linear {
    config: LinearConfig,
    weight: Tensor,
    bias: Option<Tensor>,
    layout: WeightLayout,
}

impl Linear {
    /// Constructs a linear layer from an output-major weight.
    pub fn new(config: LinearConfig, weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        Self::validate_weight(&config, &weight)?;
        Self::validate_bias(&config, bias.as_ref())?;
        Ok(Self {
            config,
            weight,
            bias,
            layout: WeightLayout::OutputMajor,
        })
    }

    /// Builds a layer whose dimensions are read off an `[out, in]` weight.
    pub fn from_weights(weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        checks::expect_rank("linear.weight", &weight, 2)?;
        let (output_dim, input_dim) = weight.dims2()?;
        let config = LinearConfig {
            input_dim,
            output_dim,
            bias: bias.is_some(),
        };
        Self::new(config, weight, bias)
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    pub fn layout(&self) -> WeightLayout {
        self.layout
    }

    /// Re-lay the weight for the backend GEMM orientation.
    pub fn transpose_parameter(&mut self, layout: WeightLayout) -> Result<()> {
        if self.layout != layout {
            self.weight = self.weight.t()?.contiguous()?;
            self.layout = layout;
        }
        Ok(())
    }

    /// Concatenate same-input projections along the output axis, in order.
    ///
    /// Missing biases are zero-filled when at least one part carries one.
    pub fn fuse(parts: Vec<Linear>) -> Result<Linear> {
        let first = match parts.first() {
            Some(first) => first,
            None => return Err(Error::Msg("cannot fuse an empty projection list".into())),
        };
        let input_dim = first.config.input_dim;
        let layout = first.layout;
        let dtype = first.weight.dtype();
        for part in &parts {
            if part.config.input_dim != input_dim {
                return Err(Error::Msg(format!(
                    "fused projections must share input_dim {input_dim}, got {}",
                    part.config.input_dim
                )));
            }
            if part.layout != layout {
                return Err(Error::Msg("fused projections must share a weight layout".into()));
            }
            if part.weight.dtype() != dtype {
                return Err(Error::Msg(format!(
                    "fused projections must share dtype {dtype:?}, got {:?}",
                    part.weight.dtype()
                )));
            }
        }

        let output_dim = parts.iter().map(|p| p.config.output_dim).sum();
        let any_bias = parts.iter().any(|p| p.bias.is_some());
        let weights: Vec<&Tensor> = parts.iter().map(|p| &p.weight).collect();
        let weight = Tensor::cat(&weights, layout.output_axis())?;
        let bias = if any_bias {
            let biases = parts
                .iter()
                .map(|p| match &p.bias {
                    Some(b) => Ok(b.clone()),
                    None => Tensor::zeros(p.config.output_dim, dtype, p.weight.device()),
                })
                .collect::<Result<Vec<_>>>()?;
            Some(Tensor::cat(&biases, 0)?)
        } else {
            None
        };

        Ok(Linear {
            config: LinearConfig {
                input_dim,
                output_dim,
                bias: any_bias,
            },
            weight,
            bias,
            layout,
        })
    }

    fn validate_weight(config: &LinearConfig, weight: &Tensor) -> Result<()> {
        checks::expect_shape(
            "linear.weight",
            weight,
            &[config.output_dim, config.input_dim],
        )?;
        checks::expect_dtype_in("linear.weight", weight, checks::FLOAT_DTYPES)
    }

    fn validate_bias(config: &LinearConfig, bias: Option<&Tensor>) -> Result<()> {
        match (config.bias, bias) {
            (true, Some(tensor)) => {
                checks::expect_shape("linear.bias", tensor, &[config.output_dim])?;
                checks::expect_dtype_in("linear.bias", tensor, checks::FLOAT_DTYPES)
            }
            (false, Some(_)) => Err(Error::Msg("bias provided but config disables bias".into())),
            (true, None) => Err(Error::Msg("config expects bias but none supplied".into())),
            (false, None) => Ok(()),
        }
    }
}

impl LinearLayer for Linear {
    fn config(&self) -> &LinearConfig {
        &self.config
    }

    fn project(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_last_dim("linear.input", hidden, self.config.input_dim)?;
        let weight = policy.cast_for_matmul(&self.weight)?;
        let weight_io = match self.layout {
            WeightLayout::OutputMajor => weight.t()?,
            WeightLayout::InputMajor => weight,
        };
        let out = matmul_rows(&policy.cast_for_matmul(hidden)?, &weight_io)?;
        match &self.bias {
            Some(bias) => out.broadcast_add(&policy.cast_for_matmul(bias)?),
            None => Ok(out),
        }
    }
}

/// Multiply `(.., in)` by `[in, out]`, flattening the leading axes.
pub(crate) fn matmul_rows(input: &Tensor, weight_io: &Tensor) -> Result<Tensor> {
    let dims = input.dims();
    let in_dim = dims[dims.len() - 1];
    let (_, out_dim) = weight_io.dims2()?;
    let rows = input.elem_count() / in_dim.max(1);
    let flat = input.reshape((rows, in_dim))?;
    let out = flat.matmul(weight_io)?;
    let mut out_dims = dims.to_vec();
    let last = out_dims.len() - 1;
    out_dims[last] = out_dim;
    out.reshape(out_dims)
}

#[cfg(test)]
pub(crate) fn random_linear(
    input_dim: usize,
    output_dim: usize,
    bias: bool,
    dtype: candle_core::DType,
) -> Result<Linear> {
    let device = candle_core::Device::Cpu;
    let weight = Tensor::randn(0f32, 0.05, (output_dim, input_dim), &device)?.to_dtype(dtype)?;
    let bias = if bias {
        Some(Tensor::randn(0f32, 0.02, output_dim, &device)?.to_dtype(dtype)?)
    } else {
        None
    };
    Linear::from_weights(weight, bias)
}

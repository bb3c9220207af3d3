//! 4-bit group-quantized projections.
//!
//! A block holds:
//! - `qweight`: `u32` words packing eight 4-bit values along the input axis,
//!   `[out, in / 8]` output-major or `[in / 8, out]` input-major.
//! - `scales`: one float per `(output, group)`, `[out, in / group_size]`.
//! - `zeros`: optional `u8` zero point per `(output, group)`, same shape as
//!   `scales`. Symmetric checkpoints omit it and dequantize against
//!   [`DEFAULT_ZERO_POINT`].
//! - `bias`: optional `[out]`.
//!
//! Dequantized weight is `(nibble - zero) * scale`. By default the GEMM
//! dequantizes on every call, so resident memory stays at the packed size.
//! [`QuantizedLinear::keep_dense_copy`] trades that back for speed: the dense
//! f32 weight is built once, held next to the packed tensors, and dropped
//! whenever they change.

use std::sync::OnceLock;

use candle_core::{DType, Device, Tensor};
use thiserror::Error;

use crate::{
    checks,
    dtypes::PrecisionPolicy,
    linear::{matmul_rows, LinearConfig, LinearLayer, WeightLayout},
};

/// Number of 4-bit values packed into one `u32` word.
pub const PACK_FACTOR: usize = 8;
/// Zero point assumed when a block carries none.
pub const DEFAULT_ZERO_POINT: u8 = 8;
const NIBBLE_MAX: f32 = 15.0;

#[derive(Debug, Error)]
pub enum QuantError {
    #[error("{name}: expected shape {expected:?}, got {actual:?}")]
    Shape {
        name: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("{name}: expected dtype {expected}, got {actual:?}")]
    Dtype {
        name: &'static str,
        expected: &'static str,
        actual: DType,
    },
    #[error("in_features {in_features} is not divisible by {divisor} ({what})")]
    Indivisible {
        in_features: usize,
        divisor: usize,
        what: &'static str,
    },
    #[error("group size mismatch during fusion: {expected} vs {actual}")]
    GroupMismatch { expected: usize, actual: usize },
    #[error("input features mismatch during fusion: {expected} vs {actual}")]
    InputMismatch { expected: usize, actual: usize },
    #[error("weight layout mismatch during fusion")]
    LayoutMismatch,
    #[error("cannot fuse an empty list of quantized blocks")]
    EmptyFusion,
    #[error("quantized block is missing its {0}")]
    Incomplete(&'static str),
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

type QResult<T> = std::result::Result<T, QuantError>;

/// Group-quantized projection with optional zero points and bias.
#[derive(Debug, Clone)]
pub struct QuantizedLinear {
    config: LinearConfig,
    group_size: usize,
    qweight: Option<Tensor>,
    scales: Option<Tensor>,
    zeros: Option<Tensor>,
    bias: Option<Tensor>,
    layout: WeightLayout,
    keep_dense: bool,
    dense: OnceLock<Tensor>,
}

impl QuantizedLinear {
    /// Empty block awaiting [`Self::set_weights_bias`] and [`Self::set_scales_zps`].
    pub fn new(input_dim: usize, output_dim: usize, group_size: usize) -> QResult<Self> {
        validate_geometry(input_dim, group_size)?;
        Ok(Self {
            config: LinearConfig {
                input_dim,
                output_dim,
                bias: false,
            },
            group_size,
            qweight: None,
            scales: None,
            zeros: None,
            bias: None,
            layout: WeightLayout::OutputMajor,
            keep_dense: false,
            dense: OnceLock::new(),
        })
    }

    /// Hold the dequantized weight between calls instead of rebuilding it.
    pub fn keep_dense_copy(&mut self, keep: bool) {
        self.keep_dense = keep;
        if !keep {
            self.dense = OnceLock::new();
        }
    }

    pub fn has_dense_copy(&self) -> bool {
        self.dense.get().is_some()
    }

    pub fn group_size(&self) -> usize {
        self.group_size
    }

    pub fn layout(&self) -> WeightLayout {
        self.layout
    }

    pub fn qweight(&self) -> Option<&Tensor> {
        self.qweight.as_ref()
    }

    pub fn scales(&self) -> Option<&Tensor> {
        self.scales.as_ref()
    }

    pub fn zeros(&self) -> Option<&Tensor> {
        self.zeros.as_ref()
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    pub fn is_complete(&self) -> bool {
        self.qweight.is_some() && self.scales.is_some()
    }

    /// Change the quantization group. Scales already set must still fit.
    pub fn set_group_size(&mut self, group_size: usize) -> QResult<()> {
        validate_geometry(self.config.input_dim, group_size)?;
        let previous = std::mem::replace(&mut self.group_size, group_size);
        let checked = self
            .scales
            .as_ref()
            .map(|s| self.expect_layout_shape("scales", s, self.groups()))
            .transpose();
        if let Err(err) = checked {
            self.group_size = previous;
            return Err(err);
        }
        self.dense = OnceLock::new();
        Ok(())
    }

    /// Install packed weights (`u32`) and an optional bias.
    pub fn set_weights_bias(&mut self, qweight: Tensor, bias: Option<Tensor>) -> QResult<()> {
        expect_dtype("qweight", &qweight, &[DType::U32], "u32")?;
        self.expect_layout_shape("qweight", &qweight, self.config.input_dim / PACK_FACTOR)?;
        if let Some(b) = &bias {
            expect_shape("bias", b, &[self.config.output_dim])?;
            expect_dtype("bias", b, checks::FLOAT_DTYPES, "a float type")?;
        }
        self.config.bias = bias.is_some();
        self.qweight = Some(qweight);
        self.bias = bias;
        self.dense = OnceLock::new();
        Ok(())
    }

    /// Install per-group scales and optional `u8` zero points.
    pub fn set_scales_zps(&mut self, scales: Tensor, zeros: Option<Tensor>) -> QResult<()> {
        expect_dtype("scales", &scales, checks::FLOAT_DTYPES, "a float type")?;
        self.expect_layout_shape("scales", &scales, self.groups())?;
        if let Some(z) = &zeros {
            expect_dtype("zeros", z, &[DType::U8], "u8")?;
            self.expect_layout_shape("zeros", z, self.groups())?;
        }
        self.scales = Some(scales);
        self.zeros = zeros;
        self.dense = OnceLock::new();
        Ok(())
    }

    /// Concatenate same-input blocks along the output axis, in order.
    ///
    /// Blocks are consumed. Zero points and biases missing from some parts are
    /// synthesized (default zero point, zero bias) when others carry them.
    pub fn fuse(parts: Vec<QuantizedLinear>) -> QResult<QuantizedLinear> {
        let first = parts.first().ok_or(QuantError::EmptyFusion)?;
        let input_dim = first.config.input_dim;
        let group_size = first.group_size;
        let layout = first.layout;
        let keep_dense = parts.iter().all(|p| p.keep_dense);
        for part in &parts {
            if part.config.input_dim != input_dim {
                return Err(QuantError::InputMismatch {
                    expected: input_dim,
                    actual: part.config.input_dim,
                });
            }
            if part.group_size != group_size {
                return Err(QuantError::GroupMismatch {
                    expected: group_size,
                    actual: part.group_size,
                });
            }
            if part.layout != layout {
                return Err(QuantError::LayoutMismatch);
            }
        }

        let axis = layout.output_axis();
        let output_dim = parts.iter().map(|p| p.config.output_dim).sum();
        let qweights = parts
            .iter()
            .map(|p| p.qweight.clone().ok_or(QuantError::Incomplete("qweight")))
            .collect::<QResult<Vec<_>>>()?;
        let scales = parts
            .iter()
            .map(|p| p.scales.clone().ok_or(QuantError::Incomplete("scales")))
            .collect::<QResult<Vec<_>>>()?;
        let zeros = if parts.iter().any(|p| p.zeros.is_some()) {
            let zeros = parts
                .iter()
                .map(|p| match &p.zeros {
                    Some(z) => Ok(z.clone()),
                    None => p.default_zeros(),
                })
                .collect::<QResult<Vec<_>>>()?;
            Some(Tensor::cat(&zeros, axis)?)
        } else {
            None
        };
        let bias_dtype = parts.iter().find_map(|p| p.bias.as_ref().map(|b| b.dtype()));
        let bias = match bias_dtype {
            Some(dtype) => {
                let biases = parts
                    .iter()
                    .map(|p| match &p.bias {
                        Some(b) => Ok(b.clone()),
                        None => Ok(Tensor::zeros(p.config.output_dim, dtype, p.device()?)?),
                    })
                    .collect::<QResult<Vec<_>>>()?;
                Some(Tensor::cat(&biases, 0)?)
            }
            None => None,
        };

        let fused = QuantizedLinear {
            config: LinearConfig {
                input_dim,
                output_dim,
                bias: bias.is_some(),
            },
            group_size,
            qweight: Some(Tensor::cat(&qweights, axis)?),
            scales: Some(Tensor::cat(&scales, axis)?),
            zeros,
            bias,
            layout,
            keep_dense,
            dense: OnceLock::new(),
        };
        log::debug!(
            "fused {} quantized blocks into ({}, {}) group={}",
            parts.len(),
            output_dim,
            input_dim,
            group_size
        );
        Ok(fused)
    }

    /// Fuse query, key and value blocks in that order.
    pub fn cat_qkv(
        q: QuantizedLinear,
        k: QuantizedLinear,
        v: QuantizedLinear,
    ) -> QResult<QuantizedLinear> {
        Self::fuse(vec![q, k, v])
    }

    /// Adapt storage to the backend GEMM orientation.
    ///
    /// Output-major storage always carries explicit zero points, synthesized
    /// from [`DEFAULT_ZERO_POINT`] when the checkpoint had none. Input-major
    /// storage transposes every packed tensor so output features run along
    /// the last axis.
    pub fn transpose_parameter(&mut self, target: WeightLayout) -> QResult<()> {
        match target {
            WeightLayout::OutputMajor => {
                if self.zeros.is_none() {
                    self.zeros = Some(self.default_zeros()?);
                }
                if self.layout == WeightLayout::InputMajor {
                    self.transpose_all()?;
                }
            }
            WeightLayout::InputMajor => {
                if self.layout == WeightLayout::OutputMajor {
                    self.transpose_all()?;
                }
            }
        }
        self.layout = target;
        Ok(())
    }

    /// Dense `[out, in]` f32 weight.
    pub fn dequantize(&self) -> QResult<Tensor> {
        let qweight = self.qweight.as_ref().ok_or(QuantError::Incomplete("qweight"))?;
        let scales = self.scales.as_ref().ok_or(QuantError::Incomplete("scales"))?;
        let (out_dim, in_dim) = (self.config.output_dim, self.config.input_dim);

        let words = self.output_major(qweight)?.to_vec2::<u32>()?;
        let scales = self
            .output_major(scales)?
            .to_dtype(DType::F32)?
            .to_vec2::<f32>()?;
        let zeros = match &self.zeros {
            Some(z) => Some(self.output_major(z)?.to_vec2::<u8>()?),
            None => None,
        };

        let mut dense = Vec::with_capacity(out_dim * in_dim);
        for o in 0..out_dim {
            for i in 0..in_dim {
                let word = words[o][i / PACK_FACTOR];
                let nibble = (word >> (4 * (i % PACK_FACTOR))) & 0xF;
                let g = i / self.group_size;
                let zero = zeros.as_ref().map_or(DEFAULT_ZERO_POINT, |z| z[o][g]);
                dense.push((nibble as f32 - zero as f32) * scales[o][g]);
            }
        }
        Ok(Tensor::from_vec(dense, (out_dim, in_dim), qweight.device())?)
    }

    /// Quantize a dense `[out, in]` weight with per-group asymmetric 4-bit codes.
    pub fn quantize(weight: &Tensor, bias: Option<Tensor>, group_size: usize) -> QResult<Self> {
        if weight.rank() != 2 {
            return Err(QuantError::Shape {
                name: "weight",
                expected: vec![0, 0],
                actual: weight.dims().to_vec(),
            });
        }
        let (out_dim, in_dim) = weight.dims2()?;
        let mut block = Self::new(in_dim, out_dim, group_size)?;
        let rows = weight.to_dtype(DType::F32)?.to_vec2::<f32>()?;
        let groups = in_dim / group_size;

        let mut words = vec![0u32; out_dim * in_dim / PACK_FACTOR];
        let mut scales = Vec::with_capacity(out_dim * groups);
        let mut zeros = Vec::with_capacity(out_dim * groups);
        for (o, row) in rows.iter().enumerate() {
            for chunk in row.chunks(group_size) {
                let lo = chunk.iter().copied().fold(0f32, f32::min);
                let hi = chunk.iter().copied().fold(0f32, f32::max);
                let scale = if hi > lo { (hi - lo) / NIBBLE_MAX } else { 1.0 };
                let zero = (-lo / scale).round().clamp(0.0, NIBBLE_MAX);
                scales.push(scale);
                zeros.push(zero as u8);
            }
            for (i, &w) in row.iter().enumerate() {
                let g = o * groups + i / group_size;
                let code = (w / scales[g]).round() + zeros[g] as f32;
                let code = code.clamp(0.0, NIBBLE_MAX) as u32;
                words[(o * in_dim + i) / PACK_FACTOR] |= code << (4 * (i % PACK_FACTOR));
            }
        }

        let device = weight.device();
        let scales = Tensor::from_vec(scales, (out_dim, groups), device)?.to_dtype(weight.dtype())?;
        block.set_weights_bias(
            Tensor::from_vec(words, (out_dim, in_dim / PACK_FACTOR), device)?,
            bias,
        )?;
        block.set_scales_zps(
            scales,
            Some(Tensor::from_vec(zeros, (out_dim, groups), device)?),
        )?;
        Ok(block)
    }

    fn groups(&self) -> usize {
        self.config.input_dim / self.group_size
    }

    fn device(&self) -> QResult<&Device> {
        self.qweight
            .as_ref()
            .or(self.scales.as_ref())
            .map(|t| t.device())
            .ok_or(QuantError::Incomplete("qweight"))
    }

    fn default_zeros(&self) -> QResult<Tensor> {
        let groups = self.groups();
        let shape = match self.layout {
            WeightLayout::OutputMajor => (self.config.output_dim, groups),
            WeightLayout::InputMajor => (groups, self.config.output_dim),
        };
        Ok(Tensor::full(DEFAULT_ZERO_POINT, shape, self.device()?)?)
    }

    fn transpose_all(&mut self) -> QResult<()> {
        for slot in [&mut self.qweight, &mut self.scales, &mut self.zeros] {
            if let Some(t) = slot.take() {
                *slot = Some(t.t()?.contiguous()?);
            }
        }
        Ok(())
    }

    fn output_major(&self, t: &Tensor) -> QResult<Tensor> {
        Ok(match self.layout {
            WeightLayout::OutputMajor => t.clone(),
            WeightLayout::InputMajor => t.t()?.contiguous()?,
        })
    }

    fn expect_layout_shape(&self, name: &'static str, t: &Tensor, inner: usize) -> QResult<()> {
        let expected = match self.layout {
            WeightLayout::OutputMajor => [self.config.output_dim, inner],
            WeightLayout::InputMajor => [inner, self.config.output_dim],
        };
        expect_shape(name, t, &expected)
    }

    fn dense_weight(&self) -> QResult<Tensor> {
        if let Some(dense) = self.dense.get() {
            return Ok(dense.clone());
        }
        let dense = self.dequantize()?.t()?.contiguous()?;
        if self.keep_dense {
            let _ = self.dense.set(dense.clone());
        }
        Ok(dense)
    }
}

impl LinearLayer for QuantizedLinear {
    fn config(&self) -> &LinearConfig {
        &self.config
    }

    fn project(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> candle_core::Result<Tensor> {
        checks::expect_last_dim("quant.input", hidden, self.config.input_dim)?;
        let weight = self.dense_weight().map_err(candle_core::Error::wrap)?;
        let out = matmul_rows(
            &policy.cast_for_matmul(hidden)?,
            &policy.cast_for_matmul(&weight)?,
        )?;
        match &self.bias {
            Some(bias) => out.broadcast_add(&policy.cast_for_matmul(bias)?),
            None => Ok(out),
        }
    }
}

fn validate_geometry(input_dim: usize, group_size: usize) -> QResult<()> {
    if input_dim % PACK_FACTOR != 0 {
        return Err(QuantError::Indivisible {
            in_features: input_dim,
            divisor: PACK_FACTOR,
            what: "pack factor",
        });
    }
    if group_size == 0 || input_dim % group_size != 0 {
        return Err(QuantError::Indivisible {
            in_features: input_dim,
            divisor: group_size,
            what: "group size",
        });
    }
    Ok(())
}

fn expect_shape(name: &'static str, t: &Tensor, expected: &[usize]) -> QResult<()> {
    if t.dims() == expected {
        Ok(())
    } else {
        Err(QuantError::Shape {
            name,
            expected: expected.to_vec(),
            actual: t.dims().to_vec(),
        })
    }
}

fn expect_dtype(
    name: &'static str,
    t: &Tensor,
    allowed: &[DType],
    expected: &'static str,
) -> QResult<()> {
    if allowed.contains(&t.dtype()) {
        Ok(())
    } else {
        Err(QuantError::Dtype {
            name,
            expected,
            actual: t.dtype(),
        })
    }
}

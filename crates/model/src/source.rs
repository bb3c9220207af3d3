//! Framework-side layer modules whose weights are ported into optimized blocks.
//!
//! A [`SourceBlock`] mirrors one decoder layer of the original model: every
//! weight sits in an `Option` slot and porting `take`s it, so a ported source
//! is left empty.

use std::collections::HashMap;

use candle_core::Tensor;
use layers::{
    dtypes::PrecisionPolicy,
    linear::Linear,
    projection::Projection,
    quant::QuantizedLinear,
};

use crate::{config::QuantMode, error::BlockError};

/// One projection as it comes out of the checkpoint.
#[derive(Debug, Clone)]
pub enum SourceLinear {
    /// Output-major `[out, in]` weight.
    Dense { weight: Tensor, bias: Option<Tensor> },
    Quantized(QuantizedLinear),
}

impl SourceLinear {
    pub fn dense(weight: Tensor, bias: Option<Tensor>) -> Self {
        SourceLinear::Dense { weight, bias }
    }

    pub fn is_quantized(&self) -> bool {
        matches!(self, SourceLinear::Quantized(_))
    }

    /// Remove the bias. Row-parallel projections keep it on rank 0 only.
    pub fn drop_bias(self) -> Result<Self, BlockError> {
        Ok(match self {
            SourceLinear::Dense { weight, .. } => SourceLinear::Dense { weight, bias: None },
            SourceLinear::Quantized(mut q) if q.bias().is_some() => {
                let qweight = q
                    .qweight()
                    .cloned()
                    .ok_or(BlockError::MissingWeight("qweight"))?;
                q.set_weights_bias(qweight, None)?;
                SourceLinear::Quantized(q)
            }
            quantized => quantized,
        })
    }

    /// Convert into the projection backend selected by `quant`.
    ///
    /// Dense sources are quantized under [`QuantMode::Int4`] and quantized
    /// sources are dequantized under [`QuantMode::None`], so every projection
    /// of a block shares one backend.
    pub fn into_projection(
        self,
        quant: QuantMode,
        policy: &PrecisionPolicy,
    ) -> Result<Projection, BlockError> {
        let storage = policy.storage();
        Ok(match (self, quant) {
            (SourceLinear::Dense { weight, bias }, QuantMode::None) => {
                let bias = bias.map(|b| b.to_dtype(storage)).transpose()?;
                Linear::from_weights(weight.to_dtype(storage)?, bias)?.into()
            }
            (SourceLinear::Dense { weight, bias }, QuantMode::Int4 { group_size }) => {
                let bias = bias.map(|b| b.to_dtype(storage)).transpose()?;
                QuantizedLinear::quantize(&weight, bias, group_size)?.into()
            }
            (SourceLinear::Quantized(q), QuantMode::Int4 { .. }) => q.into(),
            (SourceLinear::Quantized(q), QuantMode::None) => {
                let bias = q.bias().map(|b| b.to_dtype(storage)).transpose()?;
                Linear::from_weights(q.dequantize()?.to_dtype(storage)?, bias)?.into()
            }
        })
    }
}

impl From<QuantizedLinear> for SourceLinear {
    fn from(value: QuantizedLinear) -> Self {
        SourceLinear::Quantized(value)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SourceAttention {
    pub q_proj: Option<SourceLinear>,
    pub k_proj: Option<SourceLinear>,
    pub v_proj: Option<SourceLinear>,
    /// Checkpoint-packed q/k/v (`W_pack`).
    pub w_pack: Option<SourceLinear>,
    pub o_proj: Option<SourceLinear>,
}

/// `up_proj` doubles as `fc_in` and `down_proj` as `fc_out` for plain MLPs.
#[derive(Debug, Clone, Default)]
pub struct SourceMlp {
    pub gate_proj: Option<SourceLinear>,
    pub up_proj: Option<SourceLinear>,
    pub down_proj: Option<SourceLinear>,
}

#[derive(Debug, Clone, Default)]
pub struct SourceNorm {
    pub weight: Option<Tensor>,
    pub bias: Option<Tensor>,
}

#[derive(Debug, Clone, Default)]
pub struct SourceBlock {
    /// `ln_1` for GPT-J.
    pub input_layernorm: SourceNorm,
    pub self_attn: SourceAttention,
    pub post_attention_layernorm: SourceNorm,
    pub mlp: SourceMlp,
}

impl SourceBlock {
    /// Assemble a layer from checkpoint tensor names.
    ///
    /// Only the last two name components are inspected, so prefixes such as
    /// `model.layers.7.` or `transformer.h.7.` may be left on. Tensors with
    /// unrecognised names are skipped.
    pub fn from_named<I, S>(tensors: I) -> Result<Self, BlockError>
    where
        I: IntoIterator<Item = (S, Tensor)>,
        S: AsRef<str>,
    {
        let mut linears: HashMap<&'static str, (Option<Tensor>, Option<Tensor>)> = HashMap::new();
        let mut block = SourceBlock::default();
        for (name, tensor) in tensors {
            let name = name.as_ref();
            let mut parts = name.rsplit('.');
            let (param, module) = match (parts.next(), parts.next()) {
                (Some(param), Some(module)) => (param, module),
                _ => {
                    log::debug!("skipping tensor `{name}`");
                    continue;
                }
            };
            let slot = match module {
                "q_proj" => "q_proj",
                "k_proj" => "k_proj",
                "v_proj" => "v_proj",
                "W_pack" => "w_pack",
                "o_proj" | "out_proj" => "o_proj",
                "gate_proj" => "gate_proj",
                "up_proj" | "fc_in" => "up_proj",
                "down_proj" | "fc_out" => "down_proj",
                "input_layernorm" | "ln_1" => {
                    let norm = &mut block.input_layernorm;
                    set_param(&mut norm.weight, &mut norm.bias, param, tensor, name);
                    continue;
                }
                "post_attention_layernorm" | "ln_2" => {
                    set_param(
                        &mut block.post_attention_layernorm.weight,
                        &mut block.post_attention_layernorm.bias,
                        param,
                        tensor,
                        name,
                    );
                    continue;
                }
                _ => {
                    log::debug!("skipping tensor `{name}`");
                    continue;
                }
            };
            let entry = linears.entry(slot).or_default();
            set_param(&mut entry.0, &mut entry.1, param, tensor, name);
        }

        for (slot, (weight, bias)) in linears {
            let weight = weight.ok_or(BlockError::MissingWeight(slot))?;
            let linear = Some(SourceLinear::dense(weight, bias));
            match slot {
                "q_proj" => block.self_attn.q_proj = linear,
                "k_proj" => block.self_attn.k_proj = linear,
                "v_proj" => block.self_attn.v_proj = linear,
                "w_pack" => block.self_attn.w_pack = linear,
                "o_proj" => block.self_attn.o_proj = linear,
                "gate_proj" => block.mlp.gate_proj = linear,
                "up_proj" => block.mlp.up_proj = linear,
                _ => block.mlp.down_proj = linear,
            }
        }
        Ok(block)
    }

    /// Whether every slot has been taken.
    pub fn is_empty(&self) -> bool {
        let attn = &self.self_attn;
        let mlp = &self.mlp;
        self.input_layernorm.weight.is_none()
            && self.post_attention_layernorm.weight.is_none()
            && attn.q_proj.is_none()
            && attn.k_proj.is_none()
            && attn.v_proj.is_none()
            && attn.w_pack.is_none()
            && attn.o_proj.is_none()
            && mlp.gate_proj.is_none()
            && mlp.up_proj.is_none()
            && mlp.down_proj.is_none()
    }
}

fn set_param(
    weight: &mut Option<Tensor>,
    bias: &mut Option<Tensor>,
    param: &str,
    tensor: Tensor,
    name: &str,
) {
    match param {
        "weight" => *weight = Some(tensor),
        "bias" => *bias = Some(tensor),
        _ => log::debug!("skipping tensor `{name}`"),
    }
}

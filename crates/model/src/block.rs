//! Optimized decoder block.
//!
//! A block owns its attention and MLP sublayers, built once from a framework
//! [`SourceBlock`] whose weights are moved in. Each forward call runs in one
//! of two phases:
//!
//! - first token of a beam search (no cache, beam width above one): the
//!   `batch × beam` rows are collapsed to `batch`, computed once in the
//!   `(rows, seq, hidden)` layout, and broadcast back afterwards;
//! - every other call: the input is transposed to `(seq, rows, hidden)` and
//!   transposed back before returning.

use std::sync::Arc;

use attention::{AttentionInput, AttentionModule, AttentionOutput, KvCache, Strategies};
use candle_core::Tensor;
use embedding::positional::RotaryState;
use layers::{
    dtypes::PrecisionPolicy,
    mlp::{FeedForwardLayer, Mlp},
    norm::{Norm, NormKind, NormalizationLayer},
    projection::Projection,
    residual,
};

use crate::{
    config::{QuantMode, TransformerConfig},
    error::BlockError,
    layout,
    source::{SourceBlock, SourceLinear, SourceNorm},
};

/// Arguments of one block call. `hidden` is `(batch × beam, seq, hidden)`.
#[derive(Debug)]
pub struct BlockInput<'a> {
    pub hidden: &'a Tensor,
    /// Additive mask `[rows | 1, 1 | heads, seq, kv_len]`.
    pub attention_mask: Option<&'a Tensor>,
    /// `[rows, seq]`, or `[seq]` shared by every row.
    pub position_ids: &'a Tensor,
    pub past_key_value: Option<KvCache>,
    pub output_attentions: bool,
    pub use_cache: bool,
    pub beam: usize,
}

#[derive(Debug)]
pub struct BlockOutput {
    /// Same shape as the input hidden states.
    pub hidden: Tensor,
    pub attention_weights: Option<Tensor>,
    pub present: Option<KvCache>,
}

#[derive(Debug)]
pub struct DecoderBlock {
    layer_id: usize,
    config: Arc<TransformerConfig>,
    input_norm: Norm,
    /// Absent for parallel-residual layers, which normalise once.
    post_attention_norm: Option<Norm>,
    attention: AttentionModule,
    mlp: Mlp,
}

impl DecoderBlock {
    /// Port `source` into a ready-to-run block. `source` is left empty.
    pub fn new(
        layer_id: usize,
        source: &mut SourceBlock,
        config: Arc<TransformerConfig>,
        strategies: Strategies,
    ) -> Result<Self, BlockError> {
        if source.is_empty() {
            return Err(BlockError::AlreadyPorted(layer_id));
        }
        let kind = config.architecture.norm_kind();
        let input_norm = port_norm(
            &mut source.input_layernorm,
            kind,
            config.norm_eps,
            &config.policy,
            "input_layernorm",
        )?;
        let post_attention_norm = if config.architecture.parallel_residual() {
            None
        } else {
            Some(port_norm(
                &mut source.post_attention_layernorm,
                kind,
                config.norm_eps,
                &config.policy,
                "post_attention_layernorm",
            )?)
        };
        let attention = AttentionModule::new(config.attention_config(), layer_id, strategies)?;
        let mlp = Mlp::new(config.feed_forward_config(), strategies.residual);

        let mut block = Self {
            layer_id,
            config,
            input_norm,
            post_attention_norm,
            attention,
            mlp,
        };
        block.port_all_parameters_to_new_module(source)?;
        Ok(block)
    }

    /// Move projections out of `source`, lay them out for the backend and fuse them.
    fn port_all_parameters_to_new_module(
        &mut self,
        source: &mut SourceBlock,
    ) -> Result<(), BlockError> {
        let quant = self.config.quant;
        let policy = self.config.policy;
        let keep_row_bias = self.config.tensor_parallel.rank() == 0;

        let attn = &mut source.self_attn;
        let o = take_projection(&mut attn.o_proj, "o_proj", quant, &policy, keep_row_bias)?;
        if self.config.architecture.packed_qkv() {
            let qkv = take_projection(&mut attn.w_pack, "W_pack", quant, &policy, true)?;
            self.attention.load_packed(qkv, o)?;
        } else {
            let q = take_projection(&mut attn.q_proj, "q_proj", quant, &policy, true)?;
            let k = take_projection(&mut attn.k_proj, "k_proj", quant, &policy, true)?;
            let v = take_projection(&mut attn.v_proj, "v_proj", quant, &policy, true)?;
            self.attention.load_parameter(q, k, v, o)?;
        }

        let mlp = &mut source.mlp;
        let gate = if self.mlp.config().gated {
            Some(take_projection(&mut mlp.gate_proj, "gate_proj", quant, &policy, true)?)
        } else {
            None
        };
        let up = take_projection(&mut mlp.up_proj, "up_proj", quant, &policy, true)?;
        let down = take_projection(&mut mlp.down_proj, "down_proj", quant, &policy, keep_row_bias)?;
        self.mlp.load_parameter(gate, up, down)?;

        let layout = self.attention.strategies().weight_layout;
        self.attention.transpose_parameter(layout)?;
        self.mlp.transpose_parameter(layout)?;
        self.attention.cat_qkv()?;
        self.mlp.fuse_gate_up()?;
        self.config.device.synchronize()?;

        log::debug!(
            "ported block {}: qkv_fused={} gate_up_fused={} layout={:?} quant={:?}",
            self.layer_id,
            self.attention.is_qkv_fused(),
            self.mlp.is_gate_up_fused(),
            layout,
            quant
        );
        Ok(())
    }

    pub fn layer_id(&self) -> usize {
        self.layer_id
    }

    pub fn config(&self) -> &TransformerConfig {
        &self.config
    }

    pub fn attention(&self) -> &AttentionModule {
        &self.attention
    }

    pub fn mlp(&self) -> &Mlp {
        &self.mlp
    }

    pub fn forward(
        &self,
        input: BlockInput<'_>,
        rotary: &mut RotaryState,
    ) -> Result<BlockOutput, BlockError> {
        let beam = input.beam;
        if beam == 0 {
            return Err(BlockError::Shape("beam width must be at least 1".into()));
        }
        let (rows, seq, hidden_dim) = input.hidden.dims3()?;
        if hidden_dim != self.config.embedding_dim {
            return Err(BlockError::Shape(format!(
                "hidden size {hidden_dim} does not match embedding_dim {}",
                self.config.embedding_dim
            )));
        }
        let position_ids = match input.position_ids.dims() {
            [s] if *s == seq => input
                .position_ids
                .unsqueeze(0)?
                .broadcast_as((rows, seq))?
                .contiguous()?,
            [r, s] if *r == rows && *s == seq => input.position_ids.clone(),
            dims => {
                return Err(BlockError::Shape(format!(
                    "position ids {dims:?} do not match ({rows}, {seq})"
                )))
            }
        };

        if input.past_key_value.is_none() && beam > 1 {
            if rows % beam != 0 {
                return Err(BlockError::Shape(format!(
                    "{rows} rows are not a multiple of beam width {beam}"
                )));
            }
            let hidden = layout::dedup_beams(input.hidden, beam)?;
            let position_ids = layout::dedup_beams(&position_ids, beam)?;
            let mask = input
                .attention_mask
                .map(|mask| dedup_rows(mask, rows, beam))
                .transpose()?;
            let step = self.run_layer(
                BlockInput {
                    hidden: &hidden,
                    attention_mask: mask.as_ref(),
                    position_ids: &position_ids,
                    past_key_value: None,
                    output_attentions: input.output_attentions,
                    use_cache: input.use_cache,
                    beam,
                },
                rotary,
            )?;
            let present = match step.present {
                Some(mut cache) => {
                    cache.expand_beams(beam)?;
                    Some(cache)
                }
                None => None,
            };
            Ok(BlockOutput {
                hidden: layout::broadcast_beams(&step.hidden, beam)?,
                attention_weights: step
                    .weights
                    .map(|w| layout::broadcast_beams(&w, beam))
                    .transpose()?,
                present,
            })
        } else {
            let hidden = layout::to_seq_major(input.hidden)?;
            let step = self.run_layer(
                BlockInput {
                    hidden: &hidden,
                    position_ids: &position_ids,
                    beam: 1,
                    ..input
                },
                rotary,
            )?;
            Ok(BlockOutput {
                hidden: layout::to_batch_major(&step.hidden)?,
                attention_weights: step.weights,
                present: step.present,
            })
        }
    }

    /// norm → attention (+ residual) → norm → MLP (+ residual), in the layout `step` uses.
    fn run_layer(
        &self,
        step: BlockInput<'_>,
        rotary: &mut RotaryState,
    ) -> Result<AttentionOutput, BlockError> {
        let policy = &self.config.policy;
        let tp = &self.config.tensor_parallel;
        let fold = !tp.is_parallel();
        let hidden = step.hidden;

        let normed = self.input_norm.forward(hidden, policy)?;
        let AttentionOutput {
            hidden: attn,
            weights,
            present,
        } = self.attention.forward(
            AttentionInput {
                hidden: &normed,
                attention_mask: step.attention_mask,
                position_ids: step.position_ids,
                past_key_value: step.past_key_value,
                output_attentions: step.output_attentions,
                use_cache: step.use_cache,
                residual: fold.then_some(hidden),
                beam: step.beam,
            },
            rotary,
            policy,
        )?;

        let out = match &self.post_attention_norm {
            // attn already carries the residual when folded
            None if fold => self.mlp.forward(&normed, Some(&attn), policy)?,
            None => {
                let mlp = self.mlp.forward(&normed, None, policy)?;
                let partial = residual::add(&mlp, &attn, policy)?;
                residual::add(&tp.all_reduce(&partial)?, hidden, policy)?
            }
            Some(norm) => {
                let attended = if fold {
                    attn
                } else {
                    residual::add(&tp.all_reduce(&attn)?, hidden, policy)?
                };
                let normed = norm.forward(&attended, policy)?;
                if fold {
                    self.mlp.forward(&normed, Some(&attended), policy)?
                } else {
                    let partial = self.mlp.forward(&normed, None, policy)?;
                    residual::add(&tp.all_reduce(&partial)?, &attended, policy)?
                }
            }
        };
        Ok(AttentionOutput {
            hidden: out,
            weights,
            present,
        })
    }
}

fn port_norm(
    slot: &mut SourceNorm,
    kind: NormKind,
    epsilon: f64,
    policy: &PrecisionPolicy,
    name: &'static str,
) -> Result<Norm, BlockError> {
    let weight = slot
        .weight
        .take()
        .ok_or(BlockError::MissingWeight(name))?
        .to_dtype(policy.storage())?;
    let bias = slot.bias.take();
    let norm = match kind {
        NormKind::RmsNorm => Norm::rms(weight, epsilon)?,
        NormKind::LayerNorm => {
            let bias = bias.map(|b| b.to_dtype(policy.storage())).transpose()?;
            Norm::layer(weight, bias, epsilon)?
        }
    };
    Ok(norm)
}

fn take_projection(
    slot: &mut Option<SourceLinear>,
    name: &'static str,
    quant: QuantMode,
    policy: &PrecisionPolicy,
    keep_bias: bool,
) -> Result<Projection, BlockError> {
    let linear = slot.take().ok_or(BlockError::MissingWeight(name))?;
    let linear = if keep_bias { linear } else { linear.drop_bias()? };
    linear.into_projection(quant, policy)
}

/// Deduplicate a per-row tensor; broadcast (`dim 0 == 1`) tensors pass through.
fn dedup_rows(x: &Tensor, rows: usize, beam: usize) -> candle_core::Result<Tensor> {
    if x.rank() >= 2 && x.dim(0)? == rows {
        layout::dedup_beams(x, beam)
    } else {
        Ok(x.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Architecture, ModelConfig};
    use crate::parallel::TensorParallel;
    use attention::Capabilities;
    use candle_core::{DType, Device, Error, Result};

    fn config(arch: Architecture) -> Result<Arc<TransformerConfig>> {
        let json = r#"{"hidden_size": 16, "intermediate_size": 32, "num_attention_heads": 4,
                       "num_key_value_heads": 2}"#;
        let source = ModelConfig::from_json(json).map_err(Error::wrap)?;
        let tp = TensorParallel::single();
        let cfg = TransformerConfig::build(arch, &source, "fp32", &Device::Cpu, tp)
            .map_err(Error::wrap)?;
        Ok(Arc::new(cfg))
    }

    fn linear(out: usize, inp: usize) -> Result<Option<SourceLinear>> {
        let w = Tensor::randn(0f32, 0.2, (out, inp), &Device::Cpu)?;
        Ok(Some(SourceLinear::dense(w, None)))
    }

    fn source(cfg: &TransformerConfig) -> Result<SourceBlock> {
        let (h, i) = (cfg.embedding_dim, cfg.intermediate_dim);
        let kv = cfg.num_key_value_head * cfg.head_dim;
        let norm = || -> Result<SourceNorm> {
            Ok(SourceNorm {
                weight: Some(Tensor::ones(h, DType::F32, &Device::Cpu)?),
                bias: None,
            })
        };
        let mut block = SourceBlock {
            input_layernorm: norm()?,
            post_attention_layernorm: norm()?,
            ..SourceBlock::default()
        };
        block.self_attn.q_proj = linear(h, h)?;
        block.self_attn.k_proj = linear(kv, h)?;
        block.self_attn.v_proj = linear(kv, h)?;
        block.self_attn.o_proj = linear(h, h)?;
        block.mlp.gate_proj = linear(i, h)?;
        block.mlp.up_proj = linear(i, h)?;
        block.mlp.down_proj = linear(h, i)?;
        Ok(block)
    }

    #[test]
    fn porting_empties_the_source_and_fuses() -> Result<()> {
        let cfg = config(Architecture::Llama)?;
        let mut src = source(&cfg)?;
        let strategies = Capabilities::detect(&Device::Cpu).resolve();
        let block = DecoderBlock::new(0, &mut src, cfg.clone(), strategies).map_err(Error::wrap)?;
        assert!(src.is_empty());
        assert!(block.attention().is_qkv_fused());
        assert!(block.mlp().is_gate_up_fused());

        let again = DecoderBlock::new(0, &mut src, cfg, strategies);
        assert!(matches!(again, Err(BlockError::AlreadyPorted(0))));
        Ok(())
    }

    #[test]
    fn missing_projection_is_reported() -> Result<()> {
        let cfg = config(Architecture::Llama)?;
        let mut src = source(&cfg)?;
        src.mlp.gate_proj = None;
        let strategies = Capabilities::detect(&Device::Cpu).resolve();
        let err = DecoderBlock::new(0, &mut src, cfg, strategies);
        assert!(matches!(err, Err(BlockError::MissingWeight("gate_proj"))));
        Ok(())
    }

    #[test]
    fn shared_position_ids_and_bad_shapes() -> Result<()> {
        let cfg = config(Architecture::Llama)?;
        let mut src = source(&cfg)?;
        let strategies = Capabilities::detect(&Device::Cpu).resolve();
        let block = DecoderBlock::new(0, &mut src, cfg.clone(), strategies).map_err(Error::wrap)?;
        let mut rotary = RotaryState::new(cfg.rope_config(), 16, 16, &Device::Cpu)?;

        let hidden = Tensor::randn(0f32, 1.0, (2, 3, 16), &Device::Cpu)?;
        let shared = Tensor::arange(0u32, 3, &Device::Cpu)?;
        let per_row = shared.unsqueeze(0)?.repeat((2, 1))?;
        let run = |positions: &Tensor, rotary: &mut RotaryState| {
            block.forward(
                BlockInput {
                    hidden: &hidden,
                    attention_mask: None,
                    position_ids: positions,
                    past_key_value: None,
                    output_attentions: false,
                    use_cache: false,
                    beam: 1,
                },
                rotary,
            )
        };
        let a = run(&shared, &mut rotary).map_err(Error::wrap)?;
        let b = run(&per_row, &mut rotary).map_err(Error::wrap)?;
        assert_eq!(a.hidden.dims(), &[2, 3, 16]);
        let diff = a.hidden.sub(&b.hidden)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert_eq!(diff, 0.0);

        let wrong = Tensor::arange(0u32, 4, &Device::Cpu)?;
        assert!(matches!(run(&wrong, &mut rotary), Err(BlockError::Shape(_))));
        Ok(())
    }
}

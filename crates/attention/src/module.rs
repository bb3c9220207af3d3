//! Attention sublayer of an optimized decoder block.
//!
//! Hidden states arrive in the block's current layout, either first-token
//! `(rows, seq, hidden)` or subsequent-token `(seq, rows, hidden)`; the layout
//! is detected from the position ids exactly as the rotary engine does, and the
//! output leaves in the same layout. Query, key and value come from three
//! projections or one fused projection. Rotary is written in place into the
//! freshly projected query and key, keys and values are appended to the
//! layer's [`KvCache`], and scores run through the [`ScoreKernel`] resolved at
//! construction.
//!
//! [`ScoreKernel`]: crate::core::ScoreKernel

use candle_core::{bail, Tensor};
use embedding::positional::{QkLayout, RotaryState, RotaryWrite};
use layers::{
    dtypes::PrecisionPolicy,
    linear::{LinearLayer, WeightLayout},
    projection::{split_last_dim, Projection},
};

use crate::{
    core::{AttentionConfig, AttentionError, ScoreRequest, Strategies},
    kv_cache::KvCache,
    masks::{build_causal_mask, MASK_DTYPE},
};

/// Arguments of one attention call.
#[derive(Debug)]
pub struct AttentionInput<'a> {
    pub hidden: &'a Tensor,
    /// Additive mask `[rows | 1, 1 | heads, seq, kv_len]`; causal is built when absent.
    pub attention_mask: Option<&'a Tensor>,
    /// `[rows, seq]` or `[seq]`.
    pub position_ids: &'a Tensor,
    /// Cache from the previous step, moved in.
    pub past_key_value: Option<KvCache>,
    pub output_attentions: bool,
    pub use_cache: bool,
    /// Added to the output projection; fused into its epilogue when the strategy allows.
    pub residual: Option<&'a Tensor>,
    pub beam: usize,
}

#[derive(Debug)]
pub struct AttentionOutput {
    pub hidden: Tensor,
    pub weights: Option<Tensor>,
    pub present: Option<KvCache>,
}

#[derive(Debug, Clone)]
enum QkvWeights {
    Separate {
        q: Projection,
        k: Projection,
        v: Projection,
    },
    /// Output columns ordered q, k, v.
    Fused(Projection),
}

#[derive(Debug, Clone)]
struct Weights {
    qkv: QkvWeights,
    o: Projection,
}

#[derive(Debug, Clone)]
pub struct AttentionModule {
    config: AttentionConfig,
    layer_id: usize,
    strategies: Strategies,
    weights: Option<Weights>,
}

impl AttentionModule {
    /// Empty module awaiting [`AttentionModule::load_parameter`].
    pub fn new(
        config: AttentionConfig,
        layer_id: usize,
        strategies: Strategies,
    ) -> Result<Self, AttentionError> {
        config.validate()?;
        Ok(Self {
            config,
            layer_id,
            strategies,
            weights: None,
        })
    }

    pub fn config(&self) -> &AttentionConfig {
        &self.config
    }

    pub fn layer_id(&self) -> usize {
        self.layer_id
    }

    pub fn strategies(&self) -> &Strategies {
        &self.strategies
    }

    pub fn is_loaded(&self) -> bool {
        self.weights.is_some()
    }

    pub fn is_qkv_fused(&self) -> bool {
        matches!(
            self.weights,
            Some(Weights {
                qkv: QkvWeights::Fused(_),
                ..
            })
        )
    }

    /// Take ownership of separate q/k/v projections and the output projection.
    pub fn load_parameter(
        &mut self,
        q: Projection,
        k: Projection,
        v: Projection,
        o: Projection,
    ) -> Result<(), AttentionError> {
        let cfg = &self.config;
        expect_dims("q_proj", &q, cfg.hidden_size, cfg.q_size())?;
        expect_dims("k_proj", &k, cfg.hidden_size, cfg.kv_size())?;
        expect_dims("v_proj", &v, cfg.hidden_size, cfg.kv_size())?;
        expect_dims("o_proj", &o, cfg.q_size(), cfg.hidden_size)?;
        self.weights = Some(Weights {
            qkv: QkvWeights::Separate { q, k, v },
            o,
        });
        Ok(())
    }

    /// Take ownership of a checkpoint-packed qkv projection (`W_pack`).
    pub fn load_packed(&mut self, qkv: Projection, o: Projection) -> Result<(), AttentionError> {
        let cfg = &self.config;
        expect_dims(
            "W_pack",
            &qkv,
            cfg.hidden_size,
            cfg.q_size() + 2 * cfg.kv_size(),
        )?;
        expect_dims("o_proj", &o, cfg.q_size(), cfg.hidden_size)?;
        self.weights = Some(Weights {
            qkv: QkvWeights::Fused(qkv),
            o,
        });
        Ok(())
    }

    /// Fuse q, k and v into one projection. No-op when already fused.
    ///
    /// The separate projections are kept when fusing fails.
    pub fn cat_qkv(&mut self) -> Result<(), AttentionError> {
        let weights = self
            .weights
            .as_mut()
            .ok_or(AttentionError::NotLoaded("cat_qkv"))?;
        if let QkvWeights::Separate { q, k, v } = &weights.qkv {
            let fused = Projection::fuse(vec![q.clone(), k.clone(), v.clone()])?;
            weights.qkv = QkvWeights::Fused(fused);
        }
        Ok(())
    }

    pub fn transpose_parameter(&mut self, layout: WeightLayout) -> Result<(), AttentionError> {
        let weights = self
            .weights
            .as_mut()
            .ok_or(AttentionError::NotLoaded("transpose_parameter"))?;
        match &mut weights.qkv {
            QkvWeights::Separate { q, k, v } => {
                q.transpose_parameter(layout)?;
                k.transpose_parameter(layout)?;
                v.transpose_parameter(layout)?;
            }
            QkvWeights::Fused(qkv) => qkv.transpose_parameter(layout)?,
        }
        weights.o.transpose_parameter(layout)?;
        Ok(())
    }

    /// Run attention for one step.
    ///
    /// `rotary` is the model's shared state; this module's `layer_id` decides
    /// whether it gathers (layer 0) or reuses the layer-0 gather.
    pub fn forward(
        &self,
        input: AttentionInput<'_>,
        rotary: &mut RotaryState,
        policy: &PrecisionPolicy,
    ) -> Result<AttentionOutput, AttentionError> {
        let weights = self
            .weights
            .as_ref()
            .ok_or(AttentionError::NotLoaded("forward"))?;
        let cfg = &self.config;
        let (rows, seq) = position_dims(input.position_ids)?;
        let layout = QkLayout::detect(input.hidden.dims(), rows, seq, input.beam)?;
        let (a, b, _) = input.hidden.dims3()?;

        let (q, k, v) = match &weights.qkv {
            QkvWeights::Separate { q, k, v } => (
                q.forward(input.hidden, policy)?,
                k.forward(input.hidden, policy)?,
                v.forward(input.hidden, policy)?,
            ),
            QkvWeights::Fused(qkv) => {
                let packed = qkv.forward(input.hidden, policy)?;
                let mut parts =
                    split_last_dim(&packed, &[cfg.q_size(), cfg.kv_size(), cfg.kv_size()])?
                        .into_iter();
                match (parts.next(), parts.next(), parts.next()) {
                    (Some(q), Some(k), Some(v)) => (q, k, v),
                    _ => return Err(AttentionError::shape("fused qkv split")),
                }
            }
        };
        let q = q.reshape((a, b, cfg.num_heads, cfg.head_dim))?.contiguous()?;
        let k = k.reshape((a, b, cfg.num_kv_heads, cfg.head_dim))?.contiguous()?;
        let v = v.reshape((a, b, cfg.num_kv_heads, cfg.head_dim))?;

        let past_len = input.past_key_value.as_ref().map_or(0, KvCache::seq_len);
        let kv_len = past_len + seq;
        let (q, k) = rotary.apply(
            &q,
            &k,
            input.position_ids,
            self.layer_id,
            input.beam,
            kv_len,
            RotaryWrite::InPlace,
        )?;

        let q = to_heads(&q, layout)?;
        let k = to_heads(&k, layout)?;
        let v = to_heads(&v, layout)?;

        let cache = match input.past_key_value {
            Some(mut cache) => {
                cache.append(&k, &v)?;
                cache
            }
            None => KvCache::new(self.strategies.cache_layout, &k, &v)?,
        };
        let groups = cfg.kv_groups();
        let keys = repeat_kv(cache.keys()?, groups)?;
        let values = repeat_kv(cache.values()?, groups)?;

        let mask = match input.attention_mask {
            Some(mask) => Some(mask.to_dtype(MASK_DTYPE)?),
            None if seq > 1 => Some(build_causal_mask(q.device(), 1, 1, seq, kv_len)?),
            None => None,
        };
        let scores = (self.strategies.score)(&ScoreRequest {
            q: &q,
            k: &keys,
            v: &values,
            mask: mask.as_ref(),
            scale: cfg.softmax_scale(),
            output_attentions: input.output_attentions,
        })?;

        let context = from_heads(&scores.context, layout)?;
        let hidden = match input.residual {
            Some(residual) => {
                self.strategies
                    .residual
                    .project_and_add(&weights.o, &context, residual, policy)?
            }
            None => weights.o.forward(&context, policy)?,
        };

        Ok(AttentionOutput {
            hidden,
            weights: scores.weights,
            present: input.use_cache.then_some(cache),
        })
    }
}

/// `(a, b, heads, head_dim)` in `layout` to `(rows, heads, seq, head_dim)`.
fn to_heads(x: &Tensor, layout: QkLayout) -> candle_core::Result<Tensor> {
    match layout {
        QkLayout::FirstToken => x.transpose(1, 2),
        QkLayout::SubsequentToken => x.permute((1, 2, 0, 3)),
    }
}

/// `(rows, heads, seq, head_dim)` back to `(a, b, heads * head_dim)` in `layout`.
fn from_heads(x: &Tensor, layout: QkLayout) -> candle_core::Result<Tensor> {
    let (rows, heads, seq, head_dim) = x.dims4()?;
    match layout {
        QkLayout::FirstToken => x.transpose(1, 2)?.reshape((rows, seq, heads * head_dim)),
        QkLayout::SubsequentToken => x
            .permute((2, 0, 1, 3))?
            .reshape((seq, rows, heads * head_dim)),
    }
}

/// Repeat each kv head `groups` times along the head axis.
fn repeat_kv(x: Tensor, groups: usize) -> candle_core::Result<Tensor> {
    if groups == 1 {
        return Ok(x);
    }
    let (rows, heads, len, head_dim) = x.dims4()?;
    x.unsqueeze(2)?
        .broadcast_as((rows, heads, groups, len, head_dim))?
        .reshape((rows, heads * groups, len, head_dim))
}

fn position_dims(position_ids: &Tensor) -> candle_core::Result<(usize, usize)> {
    match position_ids.dims() {
        [seq] => Ok((1, *seq)),
        [rows, seq] => Ok((*rows, *seq)),
        dims => bail!("position ids must have rank 1 or 2, got {:?}", dims),
    }
}

fn expect_dims(
    label: &str,
    proj: &Projection,
    input: usize,
    output: usize,
) -> Result<(), AttentionError> {
    let config = proj.config();
    if config.input_dim == input && config.output_dim == output {
        Ok(())
    } else {
        Err(AttentionError::shape(format!(
            "{label}: expected ({output}, {input}) projection, got ({}, {})",
            config.output_dim, config.input_dim
        )))
    }
}

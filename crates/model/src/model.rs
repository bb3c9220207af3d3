//! Stack of optimized decoder blocks sharing one rotary state.

use std::sync::Arc;

use attention::{Capabilities, KvCache, Strategies};
use candle_core::Tensor;
use embedding::positional::RotaryState;

use crate::{
    block::{BlockInput, DecoderBlock},
    config::TransformerConfig,
    error::{BlockError, ConfigError},
    source::SourceBlock,
};

/// Arguments of one forward call over every layer.
#[derive(Debug)]
pub struct ModelInput<'a> {
    pub hidden: &'a Tensor,
    pub attention_mask: Option<&'a Tensor>,
    pub position_ids: &'a Tensor,
    /// One cache per layer from the previous step.
    pub past_key_values: Option<Vec<KvCache>>,
    pub output_attentions: bool,
    pub use_cache: bool,
    pub beam: usize,
}

#[derive(Debug)]
pub struct ModelOutput {
    pub hidden: Tensor,
    /// One entry per layer when attention weights were requested.
    pub attentions: Vec<Tensor>,
    pub past_key_values: Option<Vec<KvCache>>,
}

/// Decoder layers ported from a framework model.
#[derive(Debug)]
pub struct OptimizedModel {
    config: Arc<TransformerConfig>,
    strategies: Strategies,
    blocks: Vec<DecoderBlock>,
    rotary: RotaryState,
}

impl OptimizedModel {
    /// Port every source layer with capabilities read from the environment.
    pub fn new(config: TransformerConfig, sources: &mut [SourceBlock]) -> Result<Self, BlockError> {
        let capabilities = Capabilities::from_env(&config.device)?;
        Self::with_capabilities(config, sources, capabilities)
    }

    pub fn with_capabilities(
        config: TransformerConfig,
        sources: &mut [SourceBlock],
        capabilities: Capabilities,
    ) -> Result<Self, BlockError> {
        config.validate()?;
        if sources.len() != config.num_layers {
            return Err(ConfigError::Invalid(format!(
                "config declares {} layers but {} source layers were given",
                config.num_layers,
                sources.len()
            ))
            .into());
        }
        let strategies = capabilities.resolve();
        let rotary = RotaryState::new(
            config.rope_config(),
            config.max_positions,
            config.growth_stride,
            &config.device,
        )?;
        let config = Arc::new(config);
        let blocks = sources
            .iter_mut()
            .enumerate()
            .map(|(layer_id, source)| {
                DecoderBlock::new(layer_id, source, Arc::clone(&config), strategies)
            })
            .collect::<Result<Vec<_>, _>>()?;

        log::info!(
            "ported {} {} layers: sdpa={:?} weights={:?} cache={:?} quant={:?} tp={}/{} rotary_len={}",
            blocks.len(),
            config.architecture.tag(),
            strategies.sdpa,
            strategies.weight_layout,
            strategies.cache_layout,
            config.quant,
            config.tensor_parallel.rank(),
            config.tensor_parallel.size(),
            rotary.current_max_len()
        );

        Ok(Self {
            config,
            strategies,
            blocks,
            rotary,
        })
    }

    pub fn config(&self) -> &TransformerConfig {
        &self.config
    }

    pub fn strategies(&self) -> &Strategies {
        &self.strategies
    }

    pub fn blocks(&self) -> &[DecoderBlock] {
        &self.blocks
    }

    pub fn rotary(&self) -> &RotaryState {
        &self.rotary
    }

    /// Run every layer, threading the rotary state and per-layer caches.
    pub fn forward(&mut self, input: ModelInput<'_>) -> Result<ModelOutput, BlockError> {
        let layers = self.blocks.len();
        let mut past: Vec<Option<KvCache>> = match input.past_key_values {
            Some(caches) if caches.len() == layers => caches.into_iter().map(Some).collect(),
            Some(caches) => {
                return Err(BlockError::Shape(format!(
                    "{} caches given for {layers} layers",
                    caches.len()
                )))
            }
            None => (0..layers).map(|_| None).collect(),
        };

        let mut hidden = input.hidden.clone();
        let mut attentions = Vec::new();
        let mut presents = Vec::with_capacity(layers);
        for (block, past_key_value) in self.blocks.iter().zip(past.iter_mut()) {
            let out = block.forward(
                BlockInput {
                    hidden: &hidden,
                    attention_mask: input.attention_mask,
                    position_ids: input.position_ids,
                    past_key_value: past_key_value.take(),
                    output_attentions: input.output_attentions,
                    use_cache: input.use_cache,
                    beam: input.beam,
                },
                &mut self.rotary,
            )?;
            hidden = out.hidden;
            attentions.extend(out.attention_weights);
            presents.extend(out.present);
        }

        Ok(ModelOutput {
            hidden,
            attentions,
            past_key_values: input.use_cache.then_some(presents),
        })
    }

    /// Select cache rows for the surviving beam hypotheses, in every layer.
    pub fn reorder_cache(caches: &mut [KvCache], beam_indices: &Tensor) -> Result<(), BlockError> {
        for cache in caches {
            cache.reorder(beam_indices)?;
        }
        Ok(())
    }
}

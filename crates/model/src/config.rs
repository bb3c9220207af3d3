//! Model configuration: the framework's `config.json` mirror and the
//! validated per-model [`TransformerConfig`] every block is built from.

use std::path::Path;
use std::str::FromStr;

use candle_core::{DType, Device};
use embedding::positional::{RopeConfig, RopeScaling, RotationStyle};
use layers::{
    activations::ActivationKind, dtypes::PrecisionPolicy, mlp::FeedForwardConfig, norm::NormKind,
};
use serde::Deserialize;

use attention::AttentionConfig;

use crate::{error::ConfigError, parallel::TensorParallel};

/// Static lower bound of the rotary table.
pub const MAX_SEQ_LEN: usize = 2048;
/// Positions added to the rotary table whenever it grows.
pub const GROWTH_STRIDE: usize = 2048;
/// Group size used when dense weights are quantized at porting time.
pub const DEFAULT_GROUP_SIZE: usize = 128;

/// Supported decoder families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture {
    Llama,
    /// LLaMA layout with a checkpoint-packed `W_pack` qkv projection.
    Baichuan,
    Qwen2,
    Mistral,
    Phi3,
    /// Interleaved partial rotary, LayerNorm, GELU MLP and a parallel residual.
    GptJ,
}

impl Architecture {
    pub fn tag(&self) -> &'static str {
        match self {
            Architecture::Llama => "llama",
            Architecture::Baichuan => "baichuan",
            Architecture::Qwen2 => "qwen2",
            Architecture::Mistral => "mistral",
            Architecture::Phi3 => "phi3",
            Architecture::GptJ => "gptj",
        }
    }

    pub fn rotation_style(&self) -> RotationStyle {
        match self {
            Architecture::GptJ => RotationStyle::Interleaved,
            _ => RotationStyle::Half,
        }
    }

    pub fn norm_kind(&self) -> NormKind {
        match self {
            Architecture::GptJ => NormKind::LayerNorm,
            _ => NormKind::RmsNorm,
        }
    }

    pub fn gated_mlp(&self) -> bool {
        !matches!(self, Architecture::GptJ)
    }

    pub fn packed_qkv(&self) -> bool {
        matches!(self, Architecture::Baichuan)
    }

    pub fn qkv_bias(&self) -> bool {
        matches!(self, Architecture::Qwen2)
    }

    /// `h = x + attn(ln(x)) + mlp(ln(x))` with a single norm.
    pub fn parallel_residual(&self) -> bool {
        matches!(self, Architecture::GptJ)
    }

    pub fn growth_stride(&self) -> usize {
        GROWTH_STRIDE
    }
}

impl FromStr for Architecture {
    type Err = ConfigError;

    /// Parses the framework's `model_type` tag.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "llama" => Ok(Architecture::Llama),
            "baichuan" => Ok(Architecture::Baichuan),
            "qwen2" => Ok(Architecture::Qwen2),
            "mistral" => Ok(Architecture::Mistral),
            "phi3" => Ok(Architecture::Phi3),
            "gptj" | "gpt-j" => Ok(Architecture::GptJ),
            other => Err(ConfigError::UnknownArchitecture(other.to_string())),
        }
    }
}

/// Weight quantization applied to projections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QuantMode {
    #[default]
    None,
    /// 4-bit weights; dense sources are quantized with `group_size` at porting time.
    Int4 { group_size: usize },
}

/// Resolve a dtype tag (`fp16`, `bf16`, `fp32`, `int4`) into storage precision and quantization.
pub fn parse_dtype_tag(tag: &str) -> Result<(PrecisionPolicy, QuantMode), ConfigError> {
    let lower = tag.trim().to_ascii_lowercase();
    match lower.as_str() {
        "int4" | "w4a16" => Ok((
            PrecisionPolicy::from_parameter_dtype(DType::F16),
            QuantMode::Int4 {
                group_size: DEFAULT_GROUP_SIZE,
            },
        )),
        other if other.starts_with("int") => Err(ConfigError::UnsupportedQuant(other.to_string())),
        other => Ok((PrecisionPolicy::from_tag(other)?, QuantMode::None)),
    }
}

/// `rope_scaling` entry of the framework config.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RopeScalingConfig {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub rope_type: Option<String>,
    #[serde(default)]
    pub factor: Option<f64>,
    #[serde(default)]
    pub short_factor: Option<Vec<f64>>,
    #[serde(default)]
    pub long_factor: Option<Vec<f64>>,
    #[serde(default)]
    pub low_freq_factor: Option<f64>,
    #[serde(default)]
    pub high_freq_factor: Option<f64>,
    #[serde(default)]
    pub original_max_position_embeddings: Option<usize>,
    #[serde(default)]
    pub short_mscale: Option<f64>,
    #[serde(default)]
    pub long_mscale: Option<f64>,
}

impl RopeScalingConfig {
    /// `rope_type` wins over the legacy `type` key.
    pub fn tag(&self) -> &str {
        self.rope_type
            .as_deref()
            .or(self.kind.as_deref())
            .unwrap_or("default")
    }

    /// Map the tagged dictionary onto a [`RopeScaling`] variant.
    pub fn to_scaling(
        &self,
        max_position_embeddings: usize,
        original_max_position_embeddings: Option<usize>,
    ) -> Result<RopeScaling, ConfigError> {
        let tag = self.tag().to_string();
        let missing = |field| ConfigError::MissingRopeField {
            kind: tag.clone(),
            field,
        };
        let original = self
            .original_max_position_embeddings
            .or(original_max_position_embeddings);
        match self.tag() {
            "default" => Ok(RopeScaling::Default),
            "linear" => Ok(RopeScaling::Linear {
                factor: self.factor.ok_or_else(|| missing("factor"))?,
            }),
            "dynamic" => Ok(RopeScaling::DynamicNtk {
                factor: self.factor.ok_or_else(|| missing("factor"))?,
                max_position_embeddings,
            }),
            "su" | "longrope" => Ok(RopeScaling::LongRope {
                short_factor: self
                    .short_factor
                    .clone()
                    .ok_or_else(|| missing("short_factor"))?,
                long_factor: self
                    .long_factor
                    .clone()
                    .ok_or_else(|| missing("long_factor"))?,
                original_max_position_embeddings: original
                    .ok_or_else(|| missing("original_max_position_embeddings"))?,
                max_position_embeddings,
                short_mscale: self.short_mscale,
                long_mscale: self.long_mscale,
            }),
            "llama3" => Ok(RopeScaling::FrequencyBand {
                factor: self.factor.ok_or_else(|| missing("factor"))?,
                low_freq_factor: self.low_freq_factor.ok_or_else(|| missing("low_freq_factor"))?,
                high_freq_factor: self
                    .high_freq_factor
                    .ok_or_else(|| missing("high_freq_factor"))?,
                original_max_position_embeddings: original
                    .ok_or_else(|| missing("original_max_position_embeddings"))?,
            }),
            other => Err(ConfigError::UnknownRopeScaling(other.to_string())),
        }
    }
}

/// Plain configuration object as shipped next to a checkpoint.
///
/// GPT-J spellings (`n_embd`, `n_head`, `n_layer`, `n_positions`, `n_inner`,
/// `activation_function`) are accepted as aliases.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub model_type: Option<String>,
    #[serde(alias = "n_embd")]
    pub hidden_size: usize,
    #[serde(default, alias = "n_inner")]
    pub intermediate_size: Option<usize>,
    #[serde(alias = "n_head")]
    pub num_attention_heads: usize,
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    #[serde(default, alias = "n_layer")]
    pub num_hidden_layers: usize,
    #[serde(default, alias = "n_positions")]
    pub max_position_embeddings: Option<usize>,
    #[serde(default)]
    pub original_max_position_embeddings: Option<usize>,
    #[serde(default)]
    pub rope_theta: Option<f64>,
    #[serde(default)]
    pub rope_scaling: Option<RopeScalingConfig>,
    #[serde(default = "default_activation", alias = "activation_function")]
    pub hidden_act: String,
    #[serde(default)]
    pub rms_norm_eps: Option<f64>,
    #[serde(default)]
    pub layer_norm_epsilon: Option<f64>,
    #[serde(default)]
    pub rotary_dim: Option<usize>,
    #[serde(default)]
    pub partial_rotary_factor: Option<f64>,
    #[serde(default)]
    pub head_dim: Option<usize>,
}

fn default_activation() -> String {
    "silu".to_string()
}

impl ModelConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    /// Architecture named by `model_type`, when present.
    pub fn architecture(&self) -> Result<Architecture, ConfigError> {
        self.model_type
            .as_deref()
            .ok_or_else(|| ConfigError::Invalid("config has no model_type".into()))?
            .parse()
    }
}

/// Immutable, validated configuration shared by every block of one model.
#[derive(Debug, Clone)]
pub struct TransformerConfig {
    pub architecture: Architecture,
    pub embedding_dim: usize,
    pub intermediate_dim: usize,
    pub num_attention_head: usize,
    pub num_key_value_head: usize,
    pub head_dim: usize,
    pub num_layers: usize,
    /// Initial rotary table length.
    pub max_positions: usize,
    /// Positions added per rotary table growth.
    pub growth_stride: usize,
    /// Rotated features per head; `None` rotates the whole head.
    pub rotary_dim: Option<usize>,
    pub rotary_base: f64,
    pub rope_scaling: RopeScaling,
    pub activation: ActivationKind,
    pub norm_eps: f64,
    pub quant: QuantMode,
    pub policy: PrecisionPolicy,
    pub device: Device,
    pub tensor_parallel: TensorParallel,
}

impl TransformerConfig {
    /// Build from a framework config, a dtype tag, a device and the TP group.
    ///
    /// Unknown activation, rope-scaling or dtype tags fail here.
    pub fn build(
        architecture: Architecture,
        source: &ModelConfig,
        dtype: &str,
        device: &Device,
        tensor_parallel: TensorParallel,
    ) -> Result<Self, ConfigError> {
        let (policy, quant) = parse_dtype_tag(dtype)?;
        let activation = ActivationKind::from_str(&source.hidden_act)?;
        let heads = source.num_attention_heads;
        if heads == 0 {
            return Err(ConfigError::Invalid("num_attention_heads must be non-zero".into()));
        }
        let head_dim = source.head_dim.unwrap_or(source.hidden_size / heads);
        let max_position_embeddings = source.max_position_embeddings.unwrap_or(MAX_SEQ_LEN);
        let rope_scaling = match &source.rope_scaling {
            Some(scaling) => scaling.to_scaling(
                max_position_embeddings,
                source.original_max_position_embeddings,
            )?,
            None => RopeScaling::Default,
        };
        let rotary_dim = source.rotary_dim.or_else(|| {
            source
                .partial_rotary_factor
                .filter(|f| *f < 1.0)
                .map(|f| (head_dim as f64 * f) as usize)
        });
        let norm_eps = match architecture.norm_kind() {
            NormKind::RmsNorm => source.rms_norm_eps.unwrap_or(1e-6),
            NormKind::LayerNorm => source.layer_norm_epsilon.unwrap_or(1e-5),
        };

        let config = Self {
            architecture,
            embedding_dim: source.hidden_size,
            intermediate_dim: source
                .intermediate_size
                .unwrap_or(4 * source.hidden_size),
            num_attention_head: heads,
            num_key_value_head: source.num_key_value_heads.unwrap_or(heads),
            head_dim,
            num_layers: source.num_hidden_layers,
            max_positions: max_position_embeddings.max(MAX_SEQ_LEN),
            growth_stride: architecture.growth_stride(),
            rotary_dim,
            rotary_base: source.rope_theta.unwrap_or(10_000.0),
            rope_scaling,
            activation,
            norm_eps,
            quant,
            policy,
            device: device.clone(),
            tensor_parallel,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        if self.embedding_dim == 0 || self.num_attention_head == 0 || self.num_key_value_head == 0 {
            return invalid("embedding_dim and head counts must be non-zero".into());
        }
        if self.embedding_dim % self.num_attention_head != 0 {
            return invalid(format!(
                "embedding_dim {} is not divisible by num_attention_head {}",
                self.embedding_dim, self.num_attention_head
            ));
        }
        if self.num_attention_head % self.num_key_value_head != 0 {
            return invalid(format!(
                "num_attention_head {} is not a multiple of num_key_value_head {}",
                self.num_attention_head, self.num_key_value_head
            ));
        }
        if let Some(rotary_dim) = self.rotary_dim {
            if rotary_dim > self.head_dim {
                return invalid(format!(
                    "rotary_dim {rotary_dim} exceeds head_dim {}",
                    self.head_dim
                ));
            }
        }
        if self.norm_eps.is_nan() || self.norm_eps <= 0.0 {
            return invalid(format!("norm_eps must be positive, got {}", self.norm_eps));
        }
        if self.growth_stride == 0 {
            return invalid("growth_stride must be non-zero".into());
        }
        let tp = &self.tensor_parallel;
        tp.shard("num_attention_head", self.num_attention_head)?;
        tp.shard("num_key_value_head", self.num_key_value_head)?;
        tp.shard("intermediate_dim", self.intermediate_dim)?;
        self.rope_config().validate()?;
        Ok(())
    }

    pub fn rope_config(&self) -> RopeConfig {
        RopeConfig {
            head_dim: self.head_dim,
            rope_theta: self.rotary_base,
            rotate_dim: self.rotary_dim,
            style: self.architecture.rotation_style(),
            scaling: self.rope_scaling.clone(),
        }
    }

    /// Attention geometry held by this rank.
    pub fn attention_config(&self) -> AttentionConfig {
        let size = self.tensor_parallel.size();
        AttentionConfig {
            hidden_size: self.embedding_dim,
            num_heads: self.num_attention_head / size,
            num_kv_heads: self.num_key_value_head / size,
            head_dim: self.head_dim,
            qkv_bias: self.architecture.qkv_bias(),
            o_bias: false,
            scale: None,
        }
    }

    /// MLP geometry held by this rank.
    pub fn feed_forward_config(&self) -> FeedForwardConfig {
        let config = FeedForwardConfig::new(
            self.embedding_dim,
            self.intermediate_dim / self.tensor_parallel.size(),
            self.activation,
        );
        if self.architecture.gated_mlp() {
            config.gated()
        } else {
            config
        }
    }
}

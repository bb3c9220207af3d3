//! Optimized decoder blocks.
//!
//! A framework decoder layer ([`source::SourceBlock`]) is ported once into a
//! [`block::DecoderBlock`]: weights are moved in, laid out for the backend and
//! fused, after which the block runs the first-token and subsequent-token
//! phases of generation. [`model::OptimizedModel`] stacks the blocks and owns
//! the rotary state they share.

pub mod block;
pub mod config;
pub mod error;
pub mod layout;
pub mod model;
pub mod parallel;
pub mod source;

pub use block::{BlockInput, BlockOutput, DecoderBlock};
pub use config::{Architecture, ModelConfig, QuantMode, TransformerConfig};
pub use error::{BlockError, ConfigError};
pub use model::{ModelInput, ModelOutput, OptimizedModel};
pub use parallel::{ProcessGroup, SingleProcess, TensorParallel};
pub use source::{SourceAttention, SourceBlock, SourceLinear, SourceMlp, SourceNorm};

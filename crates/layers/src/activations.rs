//! Activation catalogue for feed-forward stacks.
//!
//! Activations keep the input layout and evaluate in the compute dtype of the
//! supplied [`PrecisionPolicy`], returning the compute-dtype tensor so the
//! caller can chain the gate multiply and down projection without an extra
//! round trip through storage precision.
//!
//! Tags follow the `hidden_act` strings found in model configs:
//! `silu`/`swish`, `gelu`, `gelu_new`/`gelu_pytorch_tanh`/`gelu_fast`, `relu`
//! and `linear`/`identity`. Anything else is rejected.

use std::{fmt, str::FromStr, sync::Arc};

use candle_core::{Result, Tensor};

use crate::{dtypes::PrecisionPolicy, LayerError};

/// Identifies which non-linearity is implemented by an [`Activation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationKind {
    Identity,
    /// Exact erf-based GELU.
    Gelu,
    /// Tanh approximation used by GPT-J style models.
    GeluTanh,
    Silu,
    Relu,
}

impl ActivationKind {
    pub fn tag(&self) -> &'static str {
        match self {
            ActivationKind::Identity => "identity",
            ActivationKind::Gelu => "gelu",
            ActivationKind::GeluTanh => "gelu_new",
            ActivationKind::Silu => "silu",
            ActivationKind::Relu => "relu",
        }
    }
}

impl fmt::Display for ActivationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for ActivationKind {
    type Err = LayerError;

    fn from_str(tag: &str) -> std::result::Result<Self, Self::Err> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "silu" | "swish" => Ok(ActivationKind::Silu),
            "gelu" => Ok(ActivationKind::Gelu),
            "gelu_new" | "gelu_pytorch_tanh" | "gelu_fast" => Ok(ActivationKind::GeluTanh),
            "relu" => Ok(ActivationKind::Relu),
            "linear" | "identity" => Ok(ActivationKind::Identity),
            _ => Err(LayerError::UnknownActivation(tag.to_owned())),
        }
    }
}

/// Common interface shared by activation functions.
pub trait Activation: Send + Sync + fmt::Debug {
    fn kind(&self) -> ActivationKind;

    /// Applies the activation in `policy.compute()` precision.
    fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor>;
}

/// Built-in activation backed by candle kernels.
#[derive(Debug)]
struct BuiltinActivation {
    kind: ActivationKind,
}

impl Activation for BuiltinActivation {
    fn kind(&self) -> ActivationKind {
        self.kind
    }

    fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let compute = policy.cast_for_matmul(input)?;
        match self.kind {
            ActivationKind::Identity => Ok(compute),
            ActivationKind::Relu => compute.relu(),
            ActivationKind::Gelu => compute.gelu_erf(),
            ActivationKind::GeluTanh => compute.gelu(),
            ActivationKind::Silu => compute.silu(),
        }
    }
}

/// Returns a shared built-in activation implementation.
pub fn builtin(kind: ActivationKind) -> Arc<dyn Activation> {
    Arc::new(BuiltinActivation { kind })
}

//! Position-wise feed-forward module of a decoder block.
//!
//! Gated MLPs (`down(act(gate(x)) * up(x))`, LLaMA family) and plain MLPs
//! (`fc_out(act(fc_in(x)))`, GPT-J) share one type. For gated variants the
//! gate and up projections read the same input and are fused into one
//! `[2 * intermediate, hidden]` projection at porting time, its output split
//! along the last axis. The down projection can fold the residual add into its
//! epilogue.

use std::sync::Arc;

use candle_core::{Error, Result, Tensor};

use crate::{
    activations::{builtin, Activation, ActivationKind},
    dtypes::PrecisionPolicy,
    linear::{LinearLayer, WeightLayout},
    projection::{split_last_dim, Projection},
    residual::ResidualStrategy,
    LayerError,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedForwardConfig {
    pub hidden_size: usize,
    /// Intermediate width held by this rank.
    pub intermediate_size: usize,
    pub activation: ActivationKind,
    /// Whether a gate projection multiplies the activated branch.
    pub gated: bool,
}

impl FeedForwardConfig {
    pub fn new(hidden_size: usize, intermediate_size: usize, activation: ActivationKind) -> Self {
        Self {
            hidden_size,
            intermediate_size,
            activation,
            gated: false,
        }
    }

    pub fn gated(mut self) -> Self {
        self.gated = true;
        self
    }
}

/// Shared interface for feed-forward stacks.
pub trait FeedForwardLayer: Send + Sync {
    fn config(&self) -> &FeedForwardConfig;

    /// Runs the MLP, merging `residual` into the down projection when given.
    fn forward(
        &self,
        hidden: &Tensor,
        residual: Option<&Tensor>,
        policy: &PrecisionPolicy,
    ) -> Result<Tensor>;
}

#[derive(Debug, Clone)]
enum UpProjection {
    Plain(Projection),
    Gated { gate: Projection, up: Projection },
    FusedGated(Projection),
}

#[derive(Debug, Clone)]
struct Weights {
    up: UpProjection,
    down: Projection,
}

#[derive(Debug, Clone)]
pub struct Mlp {
    config: FeedForwardConfig,
    activation: Arc<dyn Activation>,
    residual: ResidualStrategy,
    weights: Option<Weights>,
}

impl Mlp {
    /// Empty module awaiting [`Mlp::load_parameter`].
    pub fn new(config: FeedForwardConfig, residual: ResidualStrategy) -> Self {
        Self {
            activation: builtin(config.activation),
            config,
            residual,
            weights: None,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.weights.is_some()
    }

    pub fn is_gate_up_fused(&self) -> bool {
        matches!(
            self.weights,
            Some(Weights {
                up: UpProjection::FusedGated(_),
                ..
            })
        )
    }

    /// Take ownership of the projections. `gate` is required exactly when the config is gated.
    pub fn load_parameter(
        &mut self,
        gate: Option<Projection>,
        up: Projection,
        down: Projection,
    ) -> std::result::Result<(), LayerError> {
        let (hidden, inter) = (self.config.hidden_size, self.config.intermediate_size);
        expect_dims("mlp.up", &up, hidden, inter)?;
        expect_dims("mlp.down", &down, inter, hidden)?;
        let up = match (self.config.gated, gate) {
            (true, Some(gate)) => {
                expect_dims("mlp.gate", &gate, hidden, inter)?;
                UpProjection::Gated { gate, up }
            }
            (false, None) => UpProjection::Plain(up),
            (true, None) => {
                return Err(Error::Msg("gated mlp requires a gate projection".into()).into())
            }
            (false, Some(_)) => {
                return Err(Error::Msg("plain mlp does not take a gate projection".into()).into())
            }
        };
        self.weights = Some(Weights { up, down });
        Ok(())
    }

    /// Fuse gate and up projections into one. No-op for plain or already fused MLPs.
    ///
    /// Gate and up stay separate when fusing fails.
    pub fn fuse_gate_up(&mut self) -> std::result::Result<(), LayerError> {
        if let Some(weights) = self.weights.as_mut() {
            if let UpProjection::Gated { gate, up } = &weights.up {
                let fused = Projection::fuse(vec![gate.clone(), up.clone()])?;
                weights.up = UpProjection::FusedGated(fused);
            }
        }
        Ok(())
    }

    pub fn transpose_parameter(
        &mut self,
        layout: WeightLayout,
    ) -> std::result::Result<(), LayerError> {
        if let Some(weights) = self.weights.as_mut() {
            match &mut weights.up {
                UpProjection::Plain(p) | UpProjection::FusedGated(p) => {
                    p.transpose_parameter(layout)?
                }
                UpProjection::Gated { gate, up } => {
                    gate.transpose_parameter(layout)?;
                    up.transpose_parameter(layout)?;
                }
            }
            weights.down.transpose_parameter(layout)?;
        }
        Ok(())
    }

    fn intermediate(
        &self,
        weights: &Weights,
        hidden: &Tensor,
        policy: &PrecisionPolicy,
    ) -> Result<Tensor> {
        match &weights.up {
            UpProjection::Plain(up) => {
                self.activation.forward(&up.project(hidden, policy)?, policy)
            }
            UpProjection::Gated { gate, up } => {
                let gate = self.activation.forward(&gate.project(hidden, policy)?, policy)?;
                gate.mul(&up.project(hidden, policy)?)
            }
            UpProjection::FusedGated(gate_up) => {
                let inter = self.config.intermediate_size;
                let both = gate_up.project(hidden, policy)?;
                let parts = split_last_dim(&both, &[inter, inter])?;
                let gate = self.activation.forward(&parts[0], policy)?;
                gate.mul(&parts[1])
            }
        }
    }
}

impl FeedForwardLayer for Mlp {
    fn config(&self) -> &FeedForwardConfig {
        &self.config
    }

    fn forward(
        &self,
        hidden: &Tensor,
        residual: Option<&Tensor>,
        policy: &PrecisionPolicy,
    ) -> Result<Tensor> {
        let weights = self
            .weights
            .as_ref()
            .ok_or_else(|| Error::Msg("mlp weights have not been loaded".into()))?;
        let inter = self.intermediate(weights, hidden, policy)?;
        match residual {
            Some(residual) => self
                .residual
                .project_and_add(&weights.down, &inter, residual, policy),
            None => weights.down.forward(&inter, policy),
        }
    }
}

fn expect_dims(label: &str, proj: &Projection, input: usize, output: usize) -> Result<()> {
    let config = proj.config();
    if config.input_dim == input && config.output_dim == output {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{label}: expected ({output}, {input}) projection, got ({}, {})",
            config.output_dim, config.input_dim
        )))
    }
}

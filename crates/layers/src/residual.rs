//! Residual connections around projection outputs.
//!
//! Residual branches combine tensors of identical shape. The add runs in
//! [`PrecisionPolicy::compute`] and the sum is cast back to storage. Whether the
//! add is folded into the output projection or performed afterwards is a
//! [`ResidualStrategy`] chosen once per block.

use candle_core::{Result, Tensor};

use crate::{checks, dtypes::PrecisionPolicy, linear::LinearLayer};

/// How a projection output is merged with its residual.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResidualStrategy {
    /// Add before leaving compute precision, inside the projection epilogue.
    Fused,
    /// Cast the projection to storage, then add.
    #[default]
    Separate,
}

impl ResidualStrategy {
    /// Project `hidden` through `proj` and merge `residual` per the strategy.
    pub fn project_and_add<L: LinearLayer + ?Sized>(
        &self,
        proj: &L,
        hidden: &Tensor,
        residual: &Tensor,
        policy: &PrecisionPolicy,
    ) -> Result<Tensor> {
        match self {
            ResidualStrategy::Fused => proj.forward_with_residual(hidden, residual, policy),
            ResidualStrategy::Separate => add(&proj.forward(hidden, policy)?, residual, policy),
        }
    }
}

/// Adds `branch` to `residual`.
pub fn add(branch: &Tensor, residual: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
    checks::expect_same_shape("residual.branch", branch, "residual", residual)?;
    let sum = policy
        .cast_for_matmul(branch)?
        .add(&policy.cast_for_matmul(residual)?)?;
    policy.cast_to_storage(&sum)
}

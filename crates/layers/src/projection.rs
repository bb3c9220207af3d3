//! Backend-agnostic projection handle used by attention and MLP modules.

use candle_core::{Result, Tensor, D};

use crate::{
    dtypes::PrecisionPolicy,
    linear::{Linear, LinearConfig, LinearLayer, WeightLayout},
    quant::QuantizedLinear,
    LayerError,
};

/// A dense or 4-bit projection.
#[derive(Debug, Clone)]
pub enum Projection {
    Dense(Linear),
    Quantized(QuantizedLinear),
}

impl Projection {
    pub fn is_quantized(&self) -> bool {
        matches!(self, Projection::Quantized(_))
    }

    pub fn layout(&self) -> WeightLayout {
        match self {
            Projection::Dense(l) => l.layout(),
            Projection::Quantized(q) => q.layout(),
        }
    }

    /// Re-lay stored weights for the backend GEMM orientation.
    pub fn transpose_parameter(
        &mut self,
        layout: WeightLayout,
    ) -> std::result::Result<(), LayerError> {
        match self {
            Projection::Dense(l) => l.transpose_parameter(layout)?,
            Projection::Quantized(q) => q.transpose_parameter(layout)?,
        }
        Ok(())
    }

    /// Fuse same-input projections along the output axis. All parts must share a backend.
    pub fn fuse(parts: Vec<Projection>) -> std::result::Result<Projection, LayerError> {
        if parts.iter().all(|p| !p.is_quantized()) {
            let dense = parts
                .into_iter()
                .filter_map(|p| match p {
                    Projection::Dense(l) => Some(l),
                    Projection::Quantized(_) => None,
                })
                .collect();
            Ok(Projection::Dense(Linear::fuse(dense)?))
        } else if parts.iter().all(Projection::is_quantized) {
            let quantized = parts
                .into_iter()
                .filter_map(|p| match p {
                    Projection::Quantized(q) => Some(q),
                    Projection::Dense(_) => None,
                })
                .collect();
            Ok(Projection::Quantized(QuantizedLinear::fuse(quantized)?))
        } else {
            Err(LayerError::Fusion(
                "cannot mix dense and quantized projections".into(),
            ))
        }
    }
}

impl From<Linear> for Projection {
    fn from(value: Linear) -> Self {
        Projection::Dense(value)
    }
}

impl From<QuantizedLinear> for Projection {
    fn from(value: QuantizedLinear) -> Self {
        Projection::Quantized(value)
    }
}

impl LinearLayer for Projection {
    fn config(&self) -> &LinearConfig {
        match self {
            Projection::Dense(l) => l.config(),
            Projection::Quantized(q) => q.config(),
        }
    }

    fn project(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        match self {
            Projection::Dense(l) => l.project(hidden, policy),
            Projection::Quantized(q) => q.project(hidden, policy),
        }
    }
}

/// Split the last axis of `tensor` into consecutive chunks of `sizes`.
pub fn split_last_dim(tensor: &Tensor, sizes: &[usize]) -> Result<Vec<Tensor>> {
    let total = tensor.dim(D::Minus1)?;
    if sizes.iter().sum::<usize>() != total {
        candle_core::bail!(
            "split sizes {:?} do not cover last dim {} of {:?}",
            sizes,
            total,
            tensor.dims()
        );
    }
    let last = tensor.rank() - 1;
    let mut offset = 0;
    let mut parts = Vec::with_capacity(sizes.len());
    for &size in sizes {
        parts.push(tensor.narrow(last, offset, size)?);
        offset += size;
    }
    Ok(parts)
}

//! Precision policy and dtype tag parsing.
//!
//! Parameters are stored in the dtype named by the model's dtype tag
//! (`f32`, `f16` or `bf16`). Matmuls, activations and residual adds run in the
//! compute dtype, which is `f32` whenever storage is a half-precision format.
//! Norm statistics always reduce in `f32`.

use candle_core::{DType, Result, Tensor};

use crate::LayerError;

/// Comparison tolerances matching a dtype's precision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrecisionEpsilons {
    pub storage: f32,
    pub compute: f32,
}

/// Describes how tensors are cast during different phases of a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrecisionPolicy {
    storage: DType,
    compute: DType,
    reduction: DType,
}

impl PrecisionPolicy {
    /// Builds a policy from the parameter storage dtype.
    pub fn from_parameter_dtype(storage: DType) -> Self {
        let compute = match storage {
            DType::F16 | DType::BF16 => DType::F32,
            other => other,
        };
        Self {
            storage,
            compute,
            reduction: DType::F32,
        }
    }

    /// Resolve a dtype tag such as `"bf16"` or `"float16"` into a policy.
    pub fn from_tag(tag: &str) -> std::result::Result<Self, LayerError> {
        parse_dtype_tag(tag).map(Self::from_parameter_dtype)
    }

    pub fn storage(&self) -> DType {
        self.storage
    }

    pub fn compute(&self) -> DType {
        self.compute
    }

    pub fn reduction(&self) -> DType {
        self.reduction
    }

    pub fn epsilons(&self) -> PrecisionEpsilons {
        PrecisionEpsilons {
            storage: epsilon_for(self.storage),
            compute: epsilon_for(self.compute),
        }
    }

    /// Casts a tensor to the compute dtype for matmul readiness.
    pub fn cast_for_matmul(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.compute)
    }

    pub fn cast_for_reduction(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.reduction)
    }

    /// Casts a tensor back to the storage dtype (or leaves it unchanged).
    pub fn cast_to_storage(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.storage)
    }
}

/// Parse a model dtype tag. Unknown tags are a configuration error.
pub fn parse_dtype_tag(tag: &str) -> std::result::Result<DType, LayerError> {
    match tag.trim().to_ascii_lowercase().as_str() {
        "f32" | "fp32" | "float32" | "float" => Ok(DType::F32),
        "f16" | "fp16" | "float16" | "half" => Ok(DType::F16),
        "bf16" | "bfloat16" => Ok(DType::BF16),
        _ => Err(LayerError::UnsupportedDtype(tag.to_owned())),
    }
}

fn cast_tensor(tensor: &Tensor, dtype: DType) -> Result<Tensor> {
    if tensor.dtype() == dtype {
        Ok(tensor.clone())
    } else {
        tensor.to_dtype(dtype)
    }
}

fn epsilon_for(dtype: DType) -> f32 {
    match dtype {
        DType::BF16 => 2e-2,
        DType::F16 => 5e-3,
        DType::F32 => 1e-5,
        DType::F64 => 1e-7,
        _ => 0.0,
    }
}

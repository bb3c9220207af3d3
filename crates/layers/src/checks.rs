//! Lightweight validation helpers shared across layer components.
//!
//! Every helper takes a `label` naming the tensor being checked so error
//! messages point at the offending parameter. They return
//! `candle_core::Result<()>` so call sites can propagate with `?`.

use candle_core::{DType, Error, Result, Tensor};

/// Ensures a tensor matches the expected dimensions exactly.
pub fn expect_shape(label: &str, tensor: &Tensor, expected: &[usize]) -> Result<()> {
    if tensor.dims() == expected {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{label}: expected shape {:?}, got {:?}",
            expected,
            tensor.dims()
        )))
    }
}

pub fn expect_rank(label: &str, tensor: &Tensor, rank: usize) -> Result<()> {
    if tensor.rank() == rank {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{label}: expected rank {rank}, got shape {:?}",
            tensor.dims()
        )))
    }
}

/// Checks the trailing (feature) dimension, accepting any number of leading axes.
pub fn expect_last_dim(label: &str, tensor: &Tensor, features: usize) -> Result<()> {
    match tensor.dims().last() {
        Some(&last) if last == features && tensor.rank() >= 2 => Ok(()),
        _ => Err(Error::Msg(format!(
            "{label}: expected (.., {features}) layout, got {:?}",
            tensor.dims()
        ))),
    }
}

/// Checks the tensor dtype is one of the allowed values.
pub fn expect_dtype_in(label: &str, tensor: &Tensor, allowed: &[DType]) -> Result<()> {
    let dtype = tensor.dtype();
    if allowed.contains(&dtype) {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{label}: expected dtype in {:?}, got {:?}",
            allowed, dtype
        )))
    }
}

pub fn expect_contiguous(label: &str, tensor: &Tensor) -> Result<()> {
    if tensor.is_contiguous() {
        Ok(())
    } else {
        Err(Error::Msg(format!("{label}: tensor must be contiguous")))
    }
}

pub fn expect_same_shape(a_label: &str, a: &Tensor, b_label: &str, b: &Tensor) -> Result<()> {
    if a.dims() == b.dims() {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{a_label} {:?} and {b_label} {:?} must share a shape",
            a.dims(),
            b.dims()
        )))
    }
}

/// Floating point dtypes accepted for weights, scales and activations.
pub const FLOAT_DTYPES: &[DType] = &[DType::F16, DType::BF16, DType::F32];

//! Tensor-parallel group handle.
//!
//! Attention heads and the MLP intermediate width are sharded across ranks by
//! whoever loads the checkpoint; blocks only need the group to all-reduce the
//! partial sums produced by the output and down projections.

use std::fmt;
use std::sync::Arc;

use candle_core::{Result, Tensor};

use crate::error::ConfigError;

/// Collective operations of a tensor-parallel group.
pub trait ProcessGroup: Send + Sync + fmt::Debug {
    fn size(&self) -> usize;

    fn rank(&self) -> usize;

    /// Elementwise sum of `tensor` across all ranks, returned on every rank.
    fn all_reduce(&self, tensor: &Tensor) -> Result<Tensor>;
}

/// The trivial group of one process.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl ProcessGroup for SingleProcess {
    fn size(&self) -> usize {
        1
    }

    fn rank(&self) -> usize {
        0
    }

    fn all_reduce(&self, tensor: &Tensor) -> Result<Tensor> {
        Ok(tensor.clone())
    }
}

#[derive(Debug, Clone)]
pub struct TensorParallel {
    size: usize,
    rank: usize,
    group: Arc<dyn ProcessGroup>,
}

impl Default for TensorParallel {
    fn default() -> Self {
        Self::single()
    }
}

impl TensorParallel {
    pub fn single() -> Self {
        Self {
            size: 1,
            rank: 0,
            group: Arc::new(SingleProcess),
        }
    }

    pub fn new(group: Arc<dyn ProcessGroup>) -> std::result::Result<Self, ConfigError> {
        let (size, rank) = (group.size(), group.rank());
        if size == 0 || rank >= size {
            return Err(ConfigError::Invalid(format!(
                "tensor-parallel rank {rank} is out of range for group size {size}"
            )));
        }
        Ok(Self { size, rank, group })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn is_parallel(&self) -> bool {
        self.size > 1
    }

    /// Per-rank share of `total`, which must divide evenly.
    pub fn shard(&self, what: &str, total: usize) -> std::result::Result<usize, ConfigError> {
        if total % self.size != 0 {
            return Err(ConfigError::Invalid(format!(
                "{what} ({total}) is not divisible by tensor-parallel size {}",
                self.size
            )));
        }
        Ok(total / self.size)
    }

    pub fn all_reduce(&self, tensor: &Tensor) -> Result<Tensor> {
        if self.is_parallel() {
            self.group.all_reduce(tensor)
        } else {
            Ok(tensor.clone())
        }
    }
}

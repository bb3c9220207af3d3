//! Per-layer key/value cache.
//!
//! Logically a cache holds `(rows, kv_heads, positions, head_dim)` where `rows`
//! is `batch × beam`. Physically it is stored either batch-major (the logical
//! order) or sequence-major, `(positions, rows, kv_heads, head_dim)`, which
//! makes the per-step append a contiguous write at the end of the buffer.
//! The cache is moved into and out of every forward call and only grows.

use candle_core::{bail, DType, Result, Tensor};

/// Physical ordering of cached tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CacheLayout {
    /// `(rows, kv_heads, positions, head_dim)`.
    #[default]
    BatchMajor,
    /// `(positions, rows, kv_heads, head_dim)`.
    SeqMajor,
}

impl CacheLayout {
    fn seq_axis(self) -> usize {
        match self {
            CacheLayout::BatchMajor => 2,
            CacheLayout::SeqMajor => 0,
        }
    }

    fn row_axis(self) -> usize {
        match self {
            CacheLayout::BatchMajor => 0,
            CacheLayout::SeqMajor => 1,
        }
    }

    fn to_physical(self, logical: &Tensor) -> Result<Tensor> {
        match self {
            CacheLayout::BatchMajor => logical.contiguous(),
            CacheLayout::SeqMajor => logical.permute((2, 0, 1, 3))?.contiguous(),
        }
    }

    fn to_logical(self, physical: &Tensor) -> Result<Tensor> {
        match self {
            CacheLayout::BatchMajor => Ok(physical.clone()),
            CacheLayout::SeqMajor => physical.permute((1, 2, 0, 3)),
        }
    }
}

/// Accumulated keys and values of one layer.
#[derive(Debug, Clone)]
pub struct KvCache {
    layout: CacheLayout,
    key: Tensor,
    value: Tensor,
}

impl KvCache {
    /// Start a cache from the first step's logical `(rows, kv_heads, seq, head_dim)` tensors.
    pub fn new(layout: CacheLayout, key: &Tensor, value: &Tensor) -> Result<Self> {
        check_pair(key, value)?;
        Ok(Self {
            layout,
            key: layout.to_physical(key)?,
            value: layout.to_physical(value)?,
        })
    }

    pub fn layout(&self) -> CacheLayout {
        self.layout
    }

    /// Cached positions.
    pub fn seq_len(&self) -> usize {
        self.key.dims()[self.layout.seq_axis()]
    }

    /// `batch × beam` rows.
    pub fn rows(&self) -> usize {
        self.key.dims()[self.layout.row_axis()]
    }

    pub fn dtype(&self) -> DType {
        self.key.dtype()
    }

    /// Physically stored key tensor.
    pub fn raw_key(&self) -> &Tensor {
        &self.key
    }

    pub fn raw_value(&self) -> &Tensor {
        &self.value
    }

    /// Keys viewed as `(rows, kv_heads, positions, head_dim)`.
    pub fn keys(&self) -> Result<Tensor> {
        self.layout.to_logical(&self.key)
    }

    /// Values viewed as `(rows, kv_heads, positions, head_dim)`.
    pub fn values(&self) -> Result<Tensor> {
        self.layout.to_logical(&self.value)
    }

    /// Append one step of logical `(rows, kv_heads, seq, head_dim)` keys and values.
    pub fn append(&mut self, key: &Tensor, value: &Tensor) -> Result<()> {
        check_pair(key, value)?;
        let (rows, heads, _, head_dim) = key.dims4()?;
        let (c_rows, c_heads, c_dim) = match self.layout {
            CacheLayout::BatchMajor => {
                let (r, h, _, d) = self.key.dims4()?;
                (r, h, d)
            }
            CacheLayout::SeqMajor => {
                let (_, r, h, d) = self.key.dims4()?;
                (r, h, d)
            }
        };
        if (rows, heads, head_dim) != (c_rows, c_heads, c_dim) {
            bail!(
                "kv append of {:?} does not match cache rows={c_rows} heads={c_heads} head_dim={c_dim}",
                key.dims()
            );
        }
        let axis = self.layout.seq_axis();
        let key = self.layout.to_physical(&key.to_dtype(self.key.dtype())?)?;
        let value = self.layout.to_physical(&value.to_dtype(self.value.dtype())?)?;
        self.key = Tensor::cat(&[&self.key, &key], axis)?;
        self.value = Tensor::cat(&[&self.value, &value], axis)?;
        Ok(())
    }

    /// Select rows by `beam_indices` (beam-search hypothesis reshuffle).
    pub fn reorder(&mut self, beam_indices: &Tensor) -> Result<()> {
        let indices = beam_indices.to_dtype(DType::U32)?.flatten_all()?;
        if indices.elem_count() == 0 {
            bail!("beam indices must select at least one cache row");
        }
        let rows = self.rows() as u32;
        let max = indices.max(0)?.to_scalar::<u32>()?;
        if max >= rows {
            bail!("beam index {max} out of range for {rows} cache rows");
        }
        let axis = self.layout.row_axis();
        self.key = self.key.index_select(&indices, axis)?;
        self.value = self.value.index_select(&indices, axis)?;
        Ok(())
    }

    /// Repeat each row `beam` times: `batch` rows become `batch × beam`.
    pub fn expand_beams(&mut self, beam: usize) -> Result<()> {
        if beam <= 1 {
            return Ok(());
        }
        let rows = self.rows();
        let indices: Vec<u32> = (0..rows as u32)
            .flat_map(|r| std::iter::repeat(r).take(beam))
            .collect();
        let indices = Tensor::from_vec(indices, rows * beam, self.key.device())?;
        let axis = self.layout.row_axis();
        self.key = self.key.index_select(&indices, axis)?;
        self.value = self.value.index_select(&indices, axis)?;
        Ok(())
    }
}

fn check_pair(key: &Tensor, value: &Tensor) -> Result<()> {
    if key.rank() != 4 || key.dims() != value.dims() {
        bail!(
            "kv tensors must share a rank-4 (rows, kv_heads, seq, head_dim) shape, got {:?} and {:?}",
            key.dims(),
            value.dims()
        );
    }
    Ok(())
}

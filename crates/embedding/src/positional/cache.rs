//! Per-model rotary table with growth and layer-0 gather reuse.
//!
//! A model owns exactly one [`RotaryState`] and threads it by `&mut` through
//! its layers. Layer 0 grows the table when needed and gathers the rows for
//! the current position ids; layers `1..N` reuse that gather.

use candle_core::{bail, DType, Device, Result, Tensor};

use super::rope::{build_tables, rotate, QkLayout, RopeConfig, RotaryWrite};

/// Counters describing how the state has been used so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RotaryStats {
    pub growths: usize,
    pub gathers: usize,
    pub reuses: usize,
}

#[derive(Debug, Clone)]
struct Gather {
    rows: usize,
    seq: usize,
    layout: QkLayout,
    sin: Tensor,
    cos: Tensor,
}

/// Growable sin/cos tables plus the most recent layer-0 gather.
#[derive(Debug, Clone)]
pub struct RotaryState {
    config: RopeConfig,
    device: Device,
    sin: Tensor,
    cos: Tensor,
    current_max_len: usize,
    growth_stride: usize,
    stats: RotaryStats,
    last_gather: Option<Gather>,
}

impl RotaryState {
    /// Build the initial table of `initial_len` positions.
    pub fn new(
        config: RopeConfig,
        initial_len: usize,
        growth_stride: usize,
        device: &Device,
    ) -> Result<Self> {
        config.validate()?;
        if growth_stride == 0 {
            bail!("rotary growth stride must be non-zero");
        }
        let initial_len = config.scaling.initial_table_len(initial_len);
        let (sin, cos) = build_tables(&config, initial_len, device)?;
        log::debug!(
            "rotary table initialised: len={} rot={} scaling={}",
            initial_len,
            config.rotary_dim(),
            config.scaling.tag()
        );
        Ok(Self {
            config,
            device: device.clone(),
            sin,
            cos,
            current_max_len: initial_len,
            growth_stride,
            stats: RotaryStats::default(),
            last_gather: None,
        })
    }

    pub fn config(&self) -> &RopeConfig {
        &self.config
    }

    pub fn current_max_len(&self) -> usize {
        self.current_max_len
    }

    pub fn growth_stride(&self) -> usize {
        self.growth_stride
    }

    pub fn stats(&self) -> RotaryStats {
        self.stats
    }

    /// Grow the table to `kv_len + growth_stride` once `kv_len` reaches the bound.
    ///
    /// Returns whether a growth happened. On error the previous table is kept.
    pub fn ensure_capacity(&mut self, kv_len: usize) -> Result<bool> {
        if kv_len < self.current_max_len {
            return Ok(false);
        }
        let new_len = kv_len + self.growth_stride;
        let (sin, cos) = build_tables(&self.config, new_len, &self.device)?;
        log::debug!(
            "rotary table grown: {} -> {} (kv_len={})",
            self.current_max_len,
            new_len,
            kv_len
        );
        self.sin = sin;
        self.cos = cos;
        self.current_max_len = new_len;
        self.stats.growths += 1;
        self.last_gather = None;
        Ok(true)
    }

    /// First `len` rows of the current `(sin, cos)` tables, growing if required.
    pub fn sin_cos(&mut self, len: usize) -> Result<(Tensor, Tensor)> {
        if len > self.current_max_len {
            self.ensure_capacity(len)?;
        }
        Ok((self.sin.narrow(0, 0, len)?, self.cos.narrow(0, 0, len)?))
    }

    /// Forget the layer-0 gather so the next layer-0 call gathers afresh.
    pub fn reset_gather(&mut self) {
        self.last_gather = None;
    }

    /// Gather table rows for `position_ids` (`[rows, seq]` or `[seq]`) shaped for `layout`.
    ///
    /// Layer 0 performs the index select; later layers must present the same
    /// position geometry and layout and receive the stored result.
    pub fn gather(
        &mut self,
        position_ids: &Tensor,
        layer_id: usize,
        layout: QkLayout,
    ) -> Result<(Tensor, Tensor)> {
        let (rows, seq) = position_dims(position_ids)?;
        if layer_id > 0 {
            return match &self.last_gather {
                Some(g) if g.rows == rows && g.seq == seq && g.layout == layout => {
                    self.stats.reuses += 1;
                    log::trace!("rotary gather reused by layer {layer_id}");
                    Ok((g.sin.clone(), g.cos.clone()))
                }
                Some(g) => bail!(
                    "layer {layer_id} position geometry ({rows}, {seq}, {layout:?}) differs from layer 0 ({}, {}, {:?})",
                    g.rows,
                    g.seq,
                    g.layout
                ),
                None => bail!("layer {layer_id} requested a rotary gather before layer 0"),
            };
        }

        let ids = position_ids
            .to_dtype(DType::U32)?
            .reshape(rows * seq)?;
        let max_pos = ids.max(0)?.to_scalar::<u32>()? as usize;
        if max_pos >= self.current_max_len {
            self.ensure_capacity(max_pos)?;
        }

        let rot = self.config.rotary_dim();
        let sin = self.sin.index_select(&ids, 0)?.reshape((rows, seq, rot))?;
        let cos = self.cos.index_select(&ids, 0)?.reshape((rows, seq, rot))?;
        let (sin, cos) = match layout {
            QkLayout::FirstToken => (sin, cos),
            QkLayout::SubsequentToken => (
                sin.transpose(0, 1)?.contiguous()?,
                cos.transpose(0, 1)?.contiguous()?,
            ),
        };
        let sin = sin.unsqueeze(2)?;
        let cos = cos.unsqueeze(2)?;

        self.stats.gathers += 1;
        self.last_gather = Some(Gather {
            rows,
            seq,
            layout,
            sin: sin.clone(),
            cos: cos.clone(),
        });
        Ok((sin, cos))
    }

    /// Apply rotary embeddings to `q` and `k` under the layout they arrive in.
    ///
    /// Layer 0 grows the table for `kv_len` before gathering.
    #[allow(clippy::too_many_arguments)]
    pub fn apply(
        &mut self,
        q: &Tensor,
        k: &Tensor,
        position_ids: &Tensor,
        layer_id: usize,
        beam: usize,
        kv_len: usize,
        write: RotaryWrite,
    ) -> Result<(Tensor, Tensor)> {
        let (rows, seq) = position_dims(position_ids)?;
        let layout = QkLayout::detect(q.dims(), rows, seq, beam)?;
        let k_layout = QkLayout::detect(k.dims(), rows, seq, beam)?;
        if layout != k_layout {
            bail!(
                "query layout {layout:?} differs from key layout {k_layout:?} ({:?} vs {:?})",
                q.dims(),
                k.dims()
            );
        }
        if layer_id == 0 {
            self.ensure_capacity(kv_len)?;
        }
        let (sin, cos) = self.gather(position_ids, layer_id, layout)?;
        let q = rotate(q, &sin, &cos, &self.config, write)?;
        let k = rotate(k, &sin, &cos, &self.config, write)?;
        Ok((q, k))
    }
}

fn position_dims(position_ids: &Tensor) -> Result<(usize, usize)> {
    match position_ids.dims() {
        [seq] => Ok((1, *seq)),
        [rows, seq] => Ok((*rows, *seq)),
        dims => bail!("position ids must have rank 1 or 2, got {:?}", dims),
    }
}

//! Rotary positional embeddings: tables, layouts and the shared rotation routine.

use candle_core::{bail, DType, Device, Result, Tensor};

use super::scaling::RopeScaling;

/// How rotated feature pairs are laid out inside a head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RotationStyle {
    /// Pair feature `i` with feature `i + rotate_dim / 2` (`rotate_half`).
    #[default]
    Half,
    /// Pair adjacent features `2i` and `2i + 1` (`rotate_every_two`).
    Interleaved,
}

/// Configuration for building rotary positional embeddings.
///
/// Environment overrides may be layered with [`RopeConfig::with_env_overrides`]:
/// - `ROPE_THETA` overrides `rope_theta`.
/// - `ROPE_ROTATE_DIM` overrides `rotate_dim` (`0` maps to `None`).
#[derive(Debug, Clone, PartialEq)]
pub struct RopeConfig {
    /// Per-head dimensionality of the representations being rotated.
    pub head_dim: usize,
    /// Base angle parameter θ controlling the frequency spectrum.
    pub rope_theta: f64,
    /// How many leading features to rotate; `None` rotates the full head.
    pub rotate_dim: Option<usize>,
    pub style: RotationStyle,
    pub scaling: RopeScaling,
}

impl Default for RopeConfig {
    fn default() -> Self {
        Self {
            head_dim: 0,
            rope_theta: 10_000.0,
            rotate_dim: None,
            style: RotationStyle::default(),
            scaling: RopeScaling::default(),
        }
    }
}

impl RopeConfig {
    /// Number of features rotated per head.
    pub fn rotary_dim(&self) -> usize {
        self.rotate_dim.unwrap_or(self.head_dim)
    }

    pub fn validate(&self) -> Result<()> {
        if self.head_dim == 0 {
            bail!("head_dim must be non-zero");
        }
        let rotate_dim = self.rotary_dim();
        if rotate_dim < 2 || rotate_dim > self.head_dim {
            bail!(
                "invalid rotate_dim {} for head_dim {}",
                rotate_dim,
                self.head_dim
            );
        }
        if rotate_dim % 2 != 0 {
            bail!("rotate_dim must be even, got {rotate_dim}");
        }
        if self.rope_theta.is_nan() || self.rope_theta <= 0.0 {
            bail!("rope_theta must be positive, got {}", self.rope_theta);
        }
        self.scaling.validate(rotate_dim)
    }

    /// Apply `ROPE_THETA` / `ROPE_ROTATE_DIM` from the process environment.
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(raw) = std::env::var("ROPE_THETA") {
            self.rope_theta = raw
                .trim()
                .parse()
                .map_err(|_| candle_core::Error::Msg(format!("invalid ROPE_THETA `{raw}`")))?;
        }
        if let Ok(raw) = std::env::var("ROPE_ROTATE_DIM") {
            let dim: usize = raw
                .trim()
                .parse()
                .map_err(|_| candle_core::Error::Msg(format!("invalid ROPE_ROTATE_DIM `{raw}`")))?;
            self.rotate_dim = (dim != 0).then_some(dim);
        }
        Ok(self)
    }
}

/// Build `(sin, cos)` tables shaped `[len, rotate_dim]` in f32.
///
/// Each row already carries the per-feature angle in the order dictated by
/// [`RotationStyle`], and both tables are multiplied by the scheme's magnitude.
pub fn build_tables(cfg: &RopeConfig, len: usize, device: &Device) -> Result<(Tensor, Tensor)> {
    if len == 0 {
        bail!("rotary table length must be non-zero");
    }
    let rotate_dim = cfg.rotary_dim();
    let freqs = cfg.scaling.frequencies(rotate_dim, cfg.rope_theta, len)?;
    let magnitude = freqs.magnitude;

    let mut sin_data = Vec::with_capacity(len * rotate_dim);
    let mut cos_data = Vec::with_capacity(len * rotate_dim);
    let mut row_angles = vec![0f64; rotate_dim];
    for pos in 0..len {
        let pos_f = pos as f64;
        match cfg.style {
            RotationStyle::Half => {
                let half = rotate_dim / 2;
                for (idx, inv_freq) in freqs.inv_freq.iter().enumerate() {
                    let angle = pos_f * inv_freq;
                    row_angles[idx] = angle;
                    row_angles[idx + half] = angle;
                }
            }
            RotationStyle::Interleaved => {
                for (idx, inv_freq) in freqs.inv_freq.iter().enumerate() {
                    let angle = pos_f * inv_freq;
                    row_angles[2 * idx] = angle;
                    row_angles[2 * idx + 1] = angle;
                }
            }
        }
        for &angle in &row_angles {
            sin_data.push((angle.sin() * magnitude) as f32);
            cos_data.push((angle.cos() * magnitude) as f32);
        }
    }

    let sin = Tensor::from_vec(sin_data, (len, rotate_dim), device)?;
    let cos = Tensor::from_vec(cos_data, (len, rotate_dim), device)?;
    Ok((sin, cos))
}

/// Physical layout of query/key tensors handed to the rotary engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QkLayout {
    /// `(rows, seq, heads, head_dim)`; first token of a beam search, beams deduplicated.
    FirstToken,
    /// `(seq, rows, heads, head_dim)`; every other call.
    SubsequentToken,
}

impl QkLayout {
    /// Detect the layout of a rank-3 or rank-4 tensor given the `(rows, seq)`
    /// shape of the position ids and the beam width.
    ///
    /// When both orderings fit (`rows == seq`), the first-token layout is picked
    /// only for a multi-token call with beam width above one.
    pub fn detect(dims: &[usize], rows: usize, seq: usize, beam: usize) -> Result<Self> {
        if dims.len() != 3 && dims.len() != 4 {
            bail!(
                "rotary input must have rank 3 or 4, got shape {:?}",
                dims
            );
        }
        let batch_major = dims[0] == rows && dims[1] == seq;
        let seq_major = dims[0] == seq && dims[1] == rows;
        match (batch_major, seq_major) {
            (true, false) => Ok(QkLayout::FirstToken),
            (false, true) => Ok(QkLayout::SubsequentToken),
            (true, true) => {
                if seq > 1 && beam > 1 {
                    Ok(QkLayout::FirstToken)
                } else {
                    Ok(QkLayout::SubsequentToken)
                }
            }
            (false, false) => bail!(
                "rotary input shape {:?} matches neither ({rows}, {seq}, ..) nor ({seq}, {rows}, ..)",
                dims
            ),
        }
    }
}

/// Whether rotation overwrites the input buffer or allocates a new tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RotaryWrite {
    /// Write the rotated features back into the input storage. The input must be contiguous.
    InPlace,
    #[default]
    NewStorage,
}

/// Rotate `x` with gathered tables broadcastable against its `[.., .., heads, rotate_dim]` slice.
///
/// Rank-3 inputs are viewed as `[.., .., heads * head_dim]`. The trailing
/// `head_dim - rotate_dim` features pass through untouched. Computation runs
/// in f32 and the output keeps the input dtype.
pub fn rotate(
    x: &Tensor,
    sin: &Tensor,
    cos: &Tensor,
    cfg: &RopeConfig,
    write: RotaryWrite,
) -> Result<Tensor> {
    rotate_signed(x, sin, cos, cfg, write, false)
}

/// Undo [`rotate`] for tables produced by a pure-rotation scheme.
pub fn inverse_rotate(
    x: &Tensor,
    sin: &Tensor,
    cos: &Tensor,
    cfg: &RopeConfig,
    write: RotaryWrite,
) -> Result<Tensor> {
    rotate_signed(x, sin, cos, cfg, write, true)
}

fn rotate_signed(
    x: &Tensor,
    sin: &Tensor,
    cos: &Tensor,
    cfg: &RopeConfig,
    write: RotaryWrite,
    inverse: bool,
) -> Result<Tensor> {
    let head_dim = cfg.head_dim;
    let rotate_dim = cfg.rotary_dim();
    let view = match x.rank() {
        4 => x.clone(),
        3 => {
            let (a, b, hidden) = x.dims3()?;
            if hidden % head_dim != 0 {
                bail!("hidden size {hidden} is not a multiple of head_dim {head_dim}");
            }
            x.reshape((a, b, hidden / head_dim, head_dim))?
        }
        rank => bail!(
            "rotary input must have rank 3 or 4, got rank {rank} ({:?})",
            x.dims()
        ),
    };
    let (_, _, _, hd) = view.dims4()?;
    if hd != head_dim {
        bail!("input head_dim {hd} does not match configured head_dim {head_dim}");
    }

    let dtype = view.dtype();
    let main = view.narrow(3, 0, rotate_dim)?.to_dtype(DType::F32)?;
    let partner = rotation_partner(&main, cfg.style)?;
    let partner = if inverse { partner.neg()? } else { partner };
    let rotated = main
        .broadcast_mul(cos)?
        .add(&partner.broadcast_mul(sin)?)?
        .to_dtype(dtype)?;

    match write {
        RotaryWrite::InPlace => {
            if !view.is_contiguous() {
                bail!("in-place rotary requires a contiguous input");
            }
            view.slice_set(&rotated.contiguous()?, 3, 0)?;
            Ok(x.clone())
        }
        RotaryWrite::NewStorage => {
            let out = if rotate_dim == head_dim {
                rotated
            } else {
                let tail = view.narrow(3, rotate_dim, head_dim - rotate_dim)?;
                Tensor::cat(&[&rotated, &tail], 3)?
            };
            out.reshape(x.dims())
        }
    }
}

/// The tensor multiplied by `sin`: `rotate_half` or `rotate_every_two`.
fn rotation_partner(main: &Tensor, style: RotationStyle) -> Result<Tensor> {
    let (a, b, h, rotate_dim) = main.dims4()?;
    let half = rotate_dim / 2;
    match style {
        RotationStyle::Half => {
            let x1 = main.narrow(3, 0, half)?;
            let x2 = main.narrow(3, half, half)?;
            Tensor::cat(&[&x2.neg()?, &x1], 3)
        }
        RotationStyle::Interleaved => {
            let pairs = main.reshape((a, b, h, half, 2))?;
            let even = pairs.narrow(4, 0, 1)?;
            let odd = pairs.narrow(4, 1, 1)?;
            Tensor::cat(&[&odd.neg()?, &even], 4)?.reshape((a, b, h, rotate_dim))
        }
    }
}

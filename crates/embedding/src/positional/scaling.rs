//! Inverse-frequency derivation for the supported rotary scaling schemes.
//!
//! Every scheme produces a vector of `rotate_dim / 2` inverse frequencies and a
//! magnitude applied to both sine and cosine tables. Rotation and layout
//! handling are shared and live in [`super::rope`]; only the numbers produced
//! here differ between schemes.

use std::f64::consts::PI;

use candle_core::{bail, Result};

/// Rotary scaling schemes understood by the positional engine.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum RopeScaling {
    /// Single base frequency, no context extension.
    #[default]
    Default,
    /// Positions compressed by `factor` (equivalently, frequencies divided by it).
    Linear { factor: f64 },
    /// NTK-aware base rescaling that kicks in once the table outgrows the trained context.
    DynamicNtk {
        factor: f64,
        max_position_embeddings: usize,
    },
    /// Short/long per-frequency factors switched at `original_max_position_embeddings`,
    /// with an optional magnitude rescale of the tables.
    LongRope {
        short_factor: Vec<f64>,
        long_factor: Vec<f64>,
        original_max_position_embeddings: usize,
        max_position_embeddings: usize,
        short_mscale: Option<f64>,
        long_mscale: Option<f64>,
    },
    /// Three-zone wavelength blend: high frequencies kept, low frequencies divided by
    /// `factor`, the band in between smoothly interpolated.
    FrequencyBand {
        factor: f64,
        low_freq_factor: f64,
        high_freq_factor: f64,
        original_max_position_embeddings: usize,
    },
}

/// Output of [`RopeScaling::frequencies`].
#[derive(Debug, Clone, PartialEq)]
pub struct Frequencies {
    /// One entry per rotated pair.
    pub inv_freq: Vec<f64>,
    /// Multiplier applied to both the sine and cosine tables.
    pub magnitude: f64,
}

impl RopeScaling {
    /// Short tag used in logs and cache fingerprints.
    pub fn tag(&self) -> &'static str {
        match self {
            RopeScaling::Default => "default",
            RopeScaling::Linear { .. } => "linear",
            RopeScaling::DynamicNtk { .. } => "dynamic",
            RopeScaling::LongRope { .. } => "longrope",
            RopeScaling::FrequencyBand { .. } => "llama3",
        }
    }

    /// Whether a plain inverse rotation restores the input exactly (up to rounding).
    ///
    /// Schemes that rescale table magnitude are not pure rotations.
    pub fn is_pure_rotation(&self) -> bool {
        !matches!(self, RopeScaling::LongRope { .. })
    }

    /// Table length to allocate before the first request arrives.
    pub fn initial_table_len(&self, default_len: usize) -> usize {
        match self {
            RopeScaling::LongRope {
                original_max_position_embeddings,
                ..
            } => *original_max_position_embeddings,
            _ => default_len,
        }
    }

    /// Checks parameters against the rotated width.
    pub fn validate(&self, rotate_dim: usize) -> Result<()> {
        let half = rotate_dim / 2;
        match self {
            RopeScaling::Default => Ok(()),
            RopeScaling::Linear { factor } => {
                if *factor <= 0.0 {
                    bail!("linear rope factor must be positive, got {factor}");
                }
                Ok(())
            }
            RopeScaling::DynamicNtk {
                factor,
                max_position_embeddings,
            } => {
                if *factor <= 0.0 {
                    bail!("dynamic rope factor must be positive, got {factor}");
                }
                if *max_position_embeddings == 0 {
                    bail!("dynamic rope requires a non-zero max_position_embeddings");
                }
                if rotate_dim <= 2 {
                    bail!("dynamic rope requires rotate_dim > 2, got {rotate_dim}");
                }
                Ok(())
            }
            RopeScaling::LongRope {
                short_factor,
                long_factor,
                original_max_position_embeddings,
                ..
            } => {
                if short_factor.len() != half || long_factor.len() != half {
                    bail!(
                        "longrope factors must have {half} entries, got short={} long={}",
                        short_factor.len(),
                        long_factor.len()
                    );
                }
                if *original_max_position_embeddings == 0 {
                    bail!("longrope requires a non-zero original_max_position_embeddings");
                }
                Ok(())
            }
            RopeScaling::FrequencyBand {
                factor,
                low_freq_factor,
                high_freq_factor,
                original_max_position_embeddings,
            } => {
                if *factor <= 0.0 {
                    bail!("llama3 rope factor must be positive, got {factor}");
                }
                if high_freq_factor <= low_freq_factor {
                    bail!(
                        "llama3 rope requires high_freq_factor ({high_freq_factor}) > low_freq_factor ({low_freq_factor})"
                    );
                }
                if *original_max_position_embeddings == 0 {
                    bail!("llama3 rope requires a non-zero original_max_position_embeddings");
                }
                Ok(())
            }
        }
    }

    /// Derive inverse frequencies for a table of `table_len` positions.
    pub fn frequencies(
        &self,
        rotate_dim: usize,
        base: f64,
        table_len: usize,
    ) -> Result<Frequencies> {
        if rotate_dim < 2 || rotate_dim % 2 != 0 {
            bail!("rotate_dim must be even and at least 2, got {rotate_dim}");
        }
        self.validate(rotate_dim)?;

        let (inv_freq, magnitude) = match self {
            RopeScaling::Default => (base_inv_freq(rotate_dim, base), 1.0),
            RopeScaling::Linear { factor } => (
                base_inv_freq(rotate_dim, base)
                    .into_iter()
                    .map(|f| f / factor)
                    .collect(),
                1.0,
            ),
            RopeScaling::DynamicNtk {
                factor,
                max_position_embeddings,
            } => {
                let base = if table_len > *max_position_embeddings {
                    let dim = rotate_dim as f64;
                    let ratio = factor * table_len as f64 / *max_position_embeddings as f64
                        - (factor - 1.0);
                    base * ratio.powf(dim / (dim - 2.0))
                } else {
                    base
                };
                (base_inv_freq(rotate_dim, base), 1.0)
            }
            RopeScaling::LongRope {
                short_factor,
                long_factor,
                original_max_position_embeddings,
                max_position_embeddings,
                short_mscale,
                long_mscale,
            } => {
                let original = *original_max_position_embeddings as f64;
                let scale = *max_position_embeddings as f64 / original;
                let default_mscale = if scale <= 1.0 {
                    1.0
                } else {
                    (1.0 + scale.ln() / original.ln()).sqrt()
                };
                let (factors, magnitude) = if table_len > *original_max_position_embeddings {
                    let magnitude = match long_mscale {
                        Some(m) if *m > 0.0 => *m,
                        _ => default_mscale,
                    };
                    (long_factor, magnitude)
                } else {
                    let magnitude = match short_mscale {
                        Some(m) if *m > 0.0 => *m,
                        Some(_) => 1.0,
                        None => default_mscale,
                    };
                    (short_factor, magnitude)
                };
                let inv_freq = base_inv_freq(rotate_dim, base)
                    .into_iter()
                    .zip(factors.iter())
                    .map(|(f, ext)| f / ext)
                    .collect();
                (inv_freq, magnitude)
            }
            RopeScaling::FrequencyBand {
                factor,
                low_freq_factor,
                high_freq_factor,
                original_max_position_embeddings,
            } => {
                let old_context = *original_max_position_embeddings as f64;
                let low_freq_wavelen = old_context / low_freq_factor;
                let high_freq_wavelen = old_context / high_freq_factor;
                let inv_freq = base_inv_freq(rotate_dim, base)
                    .into_iter()
                    .map(|f| {
                        let wavelen = 2.0 * PI / f;
                        if wavelen < high_freq_wavelen {
                            f
                        } else if wavelen > low_freq_wavelen {
                            f / factor
                        } else {
                            let smooth = (old_context / wavelen - low_freq_factor)
                                / (high_freq_factor - low_freq_factor);
                            (1.0 - smooth) * f / factor + smooth * f
                        }
                    })
                    .collect();
                (inv_freq, 1.0)
            }
        };

        Ok(Frequencies {
            inv_freq,
            magnitude,
        })
    }
}

fn base_inv_freq(rotate_dim: usize, base: f64) -> Vec<f64> {
    (0..rotate_dim / 2)
        .map(|idx| {
            let exponent = (2 * idx) as f64 / rotate_dim as f64;
            base.powf(-exponent)
        })
        .collect()
}

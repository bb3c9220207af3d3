//! Row-layout transforms applied around a decoder block.
//!
//! Callers hand hidden states in as `(batch × beam, seq, hidden)`. A block
//! either collapses the beams for the first token of a beam search or
//! transposes to `(seq, batch × beam, hidden)` for every other call, then
//! undoes the transform before returning.

use candle_core::{bail, Result, Tensor};

/// `(rows, seq, ..)` to `(seq, rows, ..)`.
pub fn to_seq_major(x: &Tensor) -> Result<Tensor> {
    x.transpose(0, 1)?.contiguous()
}

/// `(seq, rows, ..)` to `(rows, seq, ..)`.
pub fn to_batch_major(x: &Tensor) -> Result<Tensor> {
    x.transpose(0, 1)?.contiguous()
}

/// Keep the first of every `beam` consecutive rows: `batch × beam` becomes `batch`.
///
/// All beams of one prompt carry identical inputs at the first token.
pub fn dedup_beams(x: &Tensor, beam: usize) -> Result<Tensor> {
    if beam <= 1 {
        return Ok(x.clone());
    }
    let dims = x.dims();
    let rows = match dims.first() {
        Some(rows) => *rows,
        None => bail!("cannot deduplicate beams of a scalar"),
    };
    if rows % beam != 0 {
        bail!("{rows} rows are not a multiple of beam width {beam}");
    }
    let mut grouped = Vec::with_capacity(dims.len() + 1);
    grouped.extend([rows / beam, beam]);
    grouped.extend_from_slice(&dims[1..]);
    x.reshape(grouped)?.narrow(1, 0, 1)?.squeeze(1)?.contiguous()
}

/// Repeat every row `beam` times: `batch` becomes `batch × beam`.
pub fn broadcast_beams(x: &Tensor, beam: usize) -> Result<Tensor> {
    if beam <= 1 {
        return Ok(x.clone());
    }
    let dims = x.dims();
    let rows = match dims.first() {
        Some(rows) => *rows,
        None => bail!("cannot broadcast beams of a scalar"),
    };
    let mut expanded = Vec::with_capacity(dims.len() + 1);
    expanded.extend([rows, beam]);
    expanded.extend_from_slice(&dims[1..]);
    let mut merged = dims.to_vec();
    merged[0] = rows * beam;
    x.unsqueeze(1)?
        .broadcast_as(expanded)?
        .contiguous()?
        .reshape(merged)
}

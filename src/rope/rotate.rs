//! Reference rotation: `x' = x * cos + rotate_half(x) * sin`.
//!
//! Built from ordinary candle ops, so gradients flow through `cos`/`sin`
//! (and into learnable inverse frequencies) via candle's autograd.
//!
//! The validation and slicing helpers here are shared with the fused path so
//! both routes see identical windows and gathered angles.

use candle_core::{D, DType, Tensor};

use crate::error::{Error, Result};

/// Rotates half of the last axis.
///
/// For input `[x1, x2]` (each half of the last axis), produces `[-x2, x1]`.
pub fn rotate_half(x: &Tensor) -> Result<Tensor> {
    let last_dim = x.dim(D::Minus1)?;
    if !last_dim.is_multiple_of(2) {
        return Err(Error::ShapeMismatch(format!(
            "rotate_half needs an even last axis, got {last_dim}"
        )));
    }
    let half = last_dim / 2;
    let x1 = x.narrow(D::Minus1, 0, half)?;
    let x2 = x.narrow(D::Minus1, half, half)?;
    Ok(Tensor::cat(&[&x2.neg()?, &x1], D::Minus1)?)
}

/// Rotates a query/key pair with the window `[offset, offset + seq_len)` of
/// the angle tables.
///
/// # Arguments
///
/// * `q` - Query tensor `[seq_len, ..., dim]`
/// * `k` - Key tensor `[seq_len, ..., dim]`
/// * `cos`, `sin` - Tables `[rows, 1, dim]` (or `[rows, dim]`)
/// * `offset` - First absolute position covered by `q` (incremental decoding)
///
/// # Returns
///
/// Rotated `(q, k)` with the shapes of the inputs.
pub fn apply(
    q: &Tensor,
    k: &Tensor,
    cos: &Tensor,
    sin: &Tensor,
    offset: usize,
) -> Result<(Tensor, Tensor)> {
    let (seq_len, dim) = pair_dims(q, k)?;
    let (cos, sin) = angle_window(cos, sin, offset, seq_len, dim)?;

    let q_rot = combine(
        q,
        &broadcast_rows(&cos, q.rank())?,
        &broadcast_rows(&sin, q.rank())?,
    )?;
    let k_rot = combine(
        k,
        &broadcast_rows(&cos, k.rank())?,
        &broadcast_rows(&sin, k.rank())?,
    )?;
    Ok((q_rot, k_rot))
}

/// Rotates `h` using per-slot positions instead of `0..seq_len`.
///
/// # Arguments
///
/// * `h` - Hidden tensor `[seq_len, batch * heads, dim]`
/// * `cos`, `sin` - Tables `[rows, 1, dim]` (or `[rows, dim]`)
/// * `position_ids` - Integer table `[seq_len, batch]` of absolute positions
pub fn apply_indexed(
    h: &Tensor,
    cos: &Tensor,
    sin: &Tensor,
    position_ids: &Tensor,
) -> Result<Tensor> {
    let layout = IndexedLayout::new(h, position_ids)?;
    let (cos, sin) = gather_angles(cos, sin, position_ids, &layout)?;

    // [seq, batch, dim] -> [seq, batch, 1, dim], broadcast over heads
    let (seq, batch, heads, dim) = layout.dims4();
    let cos = cos.unsqueeze(2)?;
    let sin = sin.unsqueeze(2)?;

    let h = h.reshape((seq, batch, heads, dim))?;
    let out = combine(&h, &cos, &sin)?;
    Ok(out.reshape((seq, batch * heads, dim))?)
}

/// `x * cos + rotate_half(x) * sin`, with tables cast to the input dtype.
pub(crate) fn combine(x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
    let cos = cos.to_dtype(x.dtype())?;
    let sin = sin.to_dtype(x.dtype())?;
    let x_cos = x.broadcast_mul(&cos)?;
    let x_sin = rotate_half(x)?.broadcast_mul(&sin)?;
    Ok(x_cos.add(&x_sin)?)
}

/// Sequence length and feature size of a tensor the rotation applies to.
pub(crate) fn rotary_dims(x: &Tensor, name: &str) -> Result<(usize, usize)> {
    let dims = x.dims();
    if dims.len() < 2 {
        return Err(Error::ShapeMismatch(format!(
            "{name} needs a sequence and a feature axis, got {dims:?}"
        )));
    }
    let dim = dims[dims.len() - 1];
    if !dim.is_multiple_of(2) {
        return Err(Error::ShapeMismatch(format!(
            "{name} last axis must be even, got {dim}"
        )));
    }
    Ok((dims[0], dim))
}

/// Checks that `q` and `k` cover the same positions with the same features.
pub(crate) fn pair_dims(q: &Tensor, k: &Tensor) -> Result<(usize, usize)> {
    let (seq_len, dim) = rotary_dims(q, "q")?;
    let (k_seq_len, k_dim) = rotary_dims(k, "k")?;
    if k_seq_len != seq_len || k_dim != dim {
        return Err(Error::ShapeMismatch(format!(
            "q covers {seq_len} positions of {dim} features, k covers {k_seq_len} of {k_dim}"
        )));
    }
    Ok((seq_len, dim))
}

/// Flattens a `[rows, 1, dim]` / `[rows, dim]` table to `[rows, dim]`.
fn table_rows(table: &Tensor, name: &str, dim: usize) -> Result<Tensor> {
    let dims = table.dims();
    if dims.len() < 2 || dims[dims.len() - 1] != dim || table.elem_count() != dims[0] * dim {
        return Err(Error::ShapeMismatch(format!(
            "{name} table must be [rows, 1, {dim}] or [rows, {dim}], got {dims:?}"
        )));
    }
    Ok(table.reshape((dims[0], dim))?)
}

/// Slices `[offset, offset + seq_len)` out of both tables as `[seq_len, dim]`.
pub(crate) fn angle_window(
    cos: &Tensor,
    sin: &Tensor,
    offset: usize,
    seq_len: usize,
    dim: usize,
) -> Result<(Tensor, Tensor)> {
    let cos = table_rows(cos, "cos", dim)?;
    let sin = table_rows(sin, "sin", dim)?;
    let rows = cos.dim(0)?.min(sin.dim(0)?);
    let end = offset.checked_add(seq_len).ok_or_else(|| {
        Error::ShapeMismatch(format!("offset {offset} + {seq_len} positions overflows"))
    })?;
    if end > rows {
        return Err(Error::ShapeMismatch(format!(
            "positions {offset}..{end} exceed angle tables of {rows} rows"
        )));
    }
    Ok((cos.narrow(0, offset, seq_len)?, sin.narrow(0, offset, seq_len)?))
}

/// Reshapes `[seq, dim]` to `[seq, 1, .., 1, dim]` for a tensor of `rank`.
fn broadcast_rows(table: &Tensor, rank: usize) -> Result<Tensor> {
    let (seq, dim) = table.dims2()?;
    let mut shape = vec![1; rank];
    shape[0] = seq;
    shape[rank - 1] = dim;
    Ok(table.reshape(shape)?)
}

/// Shape bookkeeping for the indexed variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct IndexedLayout {
    pub seq: usize,
    pub batch: usize,
    pub heads: usize,
    pub dim: usize,
}

impl IndexedLayout {
    /// Derives `[seq, batch, heads, dim]` from `h: [seq, batch * heads, dim]`
    /// and `position_ids: [seq, batch]`.
    pub fn new(h: &Tensor, position_ids: &Tensor) -> Result<Self> {
        let &[seq, width, dim] = h.dims() else {
            return Err(Error::ShapeMismatch(format!(
                "indexed rotation expects h as [seq, batch * heads, dim], got {:?}",
                h.dims()
            )));
        };
        if !dim.is_multiple_of(2) {
            return Err(Error::ShapeMismatch(format!(
                "h last axis must be even, got {dim}"
            )));
        }
        let &[id_seq, batch] = position_ids.dims() else {
            return Err(Error::ShapeMismatch(format!(
                "position ids must be [seq, batch], got {:?}",
                position_ids.dims()
            )));
        };
        if id_seq != seq {
            return Err(Error::ShapeMismatch(format!(
                "position ids cover {id_seq} positions but h covers {seq}"
            )));
        }
        if batch == 0 || !width.is_multiple_of(batch) {
            return Err(Error::ShapeMismatch(format!(
                "h axis 1 ({width}) is not a multiple of the batch size ({batch})"
            )));
        }
        Ok(Self {
            seq,
            batch,
            heads: width / batch,
            dim,
        })
    }

    pub fn dims4(&self) -> (usize, usize, usize, usize) {
        (self.seq, self.batch, self.heads, self.dim)
    }
}

/// Position ids as a flat `u32` vector.
///
/// Float tensors are rejected. Wider or signed ids are range-checked in their
/// own dtype before the narrowing cast.
pub(crate) fn flat_position_ids(position_ids: &Tensor) -> Result<Tensor> {
    let dtype = position_ids.dtype();
    if dtype.is_float() {
        return Err(Error::ShapeMismatch(format!(
            "position ids must be an integer tensor, got {dtype:?}"
        )));
    }
    let ids = position_ids.flatten_all()?;
    if matches!(dtype, DType::U8 | DType::U32) || ids.elem_count() == 0 {
        return Ok(ids.to_dtype(DType::U32)?);
    }

    let wide = ids.to_dtype(DType::I64)?;
    let min = wide.min(0)?.to_scalar::<i64>()?;
    let max = wide.max(0)?.to_scalar::<i64>()?;
    if min < 0 || max > i64::from(u32::MAX) {
        return Err(Error::ShapeMismatch(format!(
            "position ids must lie in 0..={}, got range {min}..={max}",
            u32::MAX
        )));
    }
    Ok(wide.to_dtype(DType::U32)?)
}

/// Largest position id, used to size the angle tables.
pub(crate) fn max_position(position_ids: &Tensor) -> Result<usize> {
    let ids = flat_position_ids(position_ids)?;
    if ids.elem_count() == 0 {
        return Err(Error::ShapeMismatch("position ids are empty".into()));
    }
    Ok(ids.max(0)?.to_scalar::<u32>()? as usize)
}

/// Looks up one angle row per `(seq, batch)` slot, returning `[seq, batch, dim]`.
pub(crate) fn gather_angles(
    cos: &Tensor,
    sin: &Tensor,
    position_ids: &Tensor,
    layout: &IndexedLayout,
) -> Result<(Tensor, Tensor)> {
    let cos = table_rows(cos, "cos", layout.dim)?;
    let sin = table_rows(sin, "sin", layout.dim)?;
    let rows = cos.dim(0)?.min(sin.dim(0)?);

    let ids = flat_position_ids(position_ids)?;
    let max = max_position(position_ids)?;
    if max >= rows {
        return Err(Error::ShapeMismatch(format!(
            "position id {max} exceeds angle tables of {rows} rows"
        )));
    }

    let shape = (layout.seq, layout.batch, layout.dim);
    let cos = cos.index_select(&ids, 0)?.reshape(shape)?;
    let sin = sin.index_select(&ids, 0)?.reshape(shape)?;
    Ok((cos, sin))
}

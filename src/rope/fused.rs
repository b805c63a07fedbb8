//! Fused rotary operation with an explicit backward pass.
//!
//! [`FusedRotation::forward`] returns the rotated tensor together with a
//! [`RotationContext`] holding the `(cos, sin)` tables it consumed.
//! [`FusedRotation::backward`] takes that context by value, so each forward
//! is differentiated at most once.
//!
//! Only the gradient with respect to `h` is produced: the tables are treated
//! as constants on this route, so learnable inverse frequencies receive no
//! gradient through it. Use the reference path when they must be trained.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use candle_core::{DType, Tensor};
use tracing::trace;

use crate::error::{Error, Result};
use crate::rope::kernel::{CandleRopeKernel, KernelShape, RotaryKernel};
use crate::rope::rotate::{IndexedLayout, angle_window, gather_angles, pair_dims};

static NEXT_OP_ID: AtomicU64 = AtomicU64::new(0);

/// Saved state of one fused forward, consumed by its backward.
#[derive(Debug)]
pub struct RotationContext {
    op_id: u64,
    shape: KernelShape,
    output_dims: Vec<usize>,
    cos: Tensor,
    sin: Tensor,
}

impl RotationContext {
    /// Kernel layout the forward ran with.
    pub fn shape(&self) -> KernelShape {
        self.shape
    }

    /// Shape of the forward output, and of the gradient backward expects.
    pub fn output_dims(&self) -> &[usize] {
        &self.output_dims
    }

    /// The `[rows, dim]` tables retained for backward.
    pub fn tables(&self) -> (&Tensor, &Tensor) {
        (&self.cos, &self.sin)
    }
}

/// Output of a fused forward.
#[derive(Debug)]
pub struct Rotated {
    pub output: Tensor,
    pub context: RotationContext,
}

impl Rotated {
    pub fn into_parts(self) -> (Tensor, RotationContext) {
        (self.output, self.context)
    }
}

/// Rotation delegated to a [`RotaryKernel`].
#[derive(Debug, Clone)]
pub struct FusedRotation {
    kernel: Arc<dyn RotaryKernel>,
    id: u64,
}

impl FusedRotation {
    pub fn new(kernel: Arc<dyn RotaryKernel>) -> Self {
        Self {
            kernel,
            id: NEXT_OP_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Fused rotation backed by candle-nn's rope kernel.
    pub fn candle() -> Self {
        Self::new(Arc::new(CandleRopeKernel))
    }

    pub fn kernel(&self) -> &dyn RotaryKernel {
        self.kernel.as_ref()
    }

    /// Fails with [`Error::BackendUnavailable`] when the kernel cannot run on
    /// `x`'s device and dtype.
    pub fn ensure_supported(&self, x: &Tensor) -> Result<()> {
        if self.kernel.supports(x.device(), x.dtype()) {
            Ok(())
        } else {
            Err(Error::unavailable(self.kernel.name(), x.device(), x.dtype()))
        }
    }

    /// Rotates `h: [rows, heads, dim]` with per-row tables `[rows, 1, dim]`
    /// or `[rows, dim]`.
    pub fn forward(&self, h: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Rotated> {
        let &[rows, _, dim] = h.dims() else {
            return Err(Error::ShapeMismatch(format!(
                "fused rotation expects h as [rows, heads, dim], got {:?}",
                h.dims()
            )));
        };
        let (cos, sin) = angle_window(cos, sin, 0, rows, dim)?;
        self.run(h, &cos, &sin, h.dims().to_vec())
    }

    /// Fused counterpart of [`apply`](crate::rope::apply): rotates `q` and `k`
    /// with the window `[offset, offset + seq_len)`.
    ///
    /// `q` and `k` run through the kernel independently; each result carries
    /// its own context.
    pub fn apply(
        &self,
        q: &Tensor,
        k: &Tensor,
        cos: &Tensor,
        sin: &Tensor,
        offset: usize,
    ) -> Result<(Rotated, Rotated)> {
        let (seq_len, dim) = pair_dims(q, k)?;
        let (cos, sin) = angle_window(cos, sin, offset, seq_len, dim)?;

        let q3 = flatten_middle(q, seq_len, dim)?;
        let k3 = flatten_middle(k, seq_len, dim)?;
        let q_rot = self.run(&q3, &cos, &sin, q.dims().to_vec())?;
        let k_rot = self.run(&k3, &cos, &sin, k.dims().to_vec())?;
        Ok((q_rot, k_rot))
    }

    /// Fused counterpart of [`apply_indexed`](crate::rope::apply_indexed).
    ///
    /// Gathered angles are laid out one row per `(seq, batch)` slot, so the
    /// kernel sees `[seq * batch, heads, dim]`.
    pub fn apply_indexed(
        &self,
        h: &Tensor,
        cos: &Tensor,
        sin: &Tensor,
        position_ids: &Tensor,
    ) -> Result<Rotated> {
        let layout = IndexedLayout::new(h, position_ids)?;
        let (cos, sin) = gather_angles(cos, sin, position_ids, &layout)?;

        let (seq, batch, heads, dim) = layout.dims4();
        let rows = seq * batch;
        let cos = cos.reshape((rows, dim))?;
        let sin = sin.reshape((rows, dim))?;
        let h3 = h.reshape((rows, heads, dim))?;
        self.run(&h3, &cos, &sin, h.dims().to_vec())
    }

    /// Gradient of a previous forward with respect to its `h`.
    ///
    /// `grad_output` must have the forward output's shape. The context is
    /// consumed; the returned gradient has the same shape as `grad_output`.
    pub fn backward(&self, context: RotationContext, grad_output: &Tensor) -> Result<Tensor> {
        if context.op_id != self.id {
            return Err(Error::Misuse(format!(
                "context was produced by fused op #{}, not #{}",
                context.op_id, self.id
            )));
        }
        if grad_output.dims() != context.output_dims.as_slice() {
            return Err(Error::ShapeMismatch(format!(
                "gradient {:?} does not match forward output {:?}",
                grad_output.dims(),
                context.output_dims
            )));
        }
        self.ensure_supported(grad_output)?;

        let shape = context.shape;
        let grad = grad_output.reshape(shape.dims())?.contiguous()?;
        trace!(
            kernel = self.kernel.name(),
            rows = shape.rows,
            heads = shape.heads,
            dim = shape.dim,
            "fused rotary backward"
        );
        let grad_h = self
            .kernel
            .backward(shape, &grad, &context.cos, &context.sin)?;
        Ok(grad_h.reshape(context.output_dims.as_slice())?)
    }

    /// Runs the kernel on `h3: [rows, heads, dim]` with `[rows, dim]` tables.
    fn run(
        &self,
        h3: &Tensor,
        cos: &Tensor,
        sin: &Tensor,
        output_dims: Vec<usize>,
    ) -> Result<Rotated> {
        self.ensure_supported(h3)?;
        let (rows, heads, dim) = h3.dims3()?;
        let shape = KernelShape::new(rows, heads, dim);

        let h = h3.contiguous()?;
        let cos = cos.contiguous()?;
        let sin = sin.contiguous()?;
        ensure_paired_halves(&cos, "cos")?;
        ensure_paired_halves(&sin, "sin")?;

        trace!(
            kernel = self.kernel.name(),
            rows,
            heads,
            dim,
            "fused rotary forward"
        );
        let out = self.kernel.forward(shape, &h, &cos, &sin)?;
        if out.dims() != [rows, heads, dim] {
            return Err(Error::ShapeMismatch(format!(
                "kernel `{}` returned {:?} for input {:?}",
                self.kernel.name(),
                out.dims(),
                shape.dims()
            )));
        }

        Ok(Rotated {
            output: out.reshape(output_dims.as_slice())?,
            context: RotationContext {
                op_id: self.id,
                shape,
                output_dims,
                cos,
                sin,
            },
        })
    }
}

/// `[seq, ..., dim]` -> `[seq, prod(...), dim]`.
fn flatten_middle(x: &Tensor, seq_len: usize, dim: usize) -> Result<Tensor> {
    let width = x.elem_count() / (seq_len * dim).max(1);
    Ok(x.reshape((seq_len, width, dim))?)
}

/// Kernels read only the first half of each `[rows, dim]` table row, so both
/// halves must hold the same angles.
fn ensure_paired_halves(table: &Tensor, name: &str) -> Result<()> {
    let half = table.dim(1)? / 2;
    let mismatched = table
        .narrow(1, 0, half)?
        .ne(&table.narrow(1, half, half)?)?
        .to_dtype(DType::U32)?
        .sum_all()?
        .to_scalar::<u32>()?;
    if mismatched > 0 {
        return Err(Error::ShapeMismatch(format!(
            "{name} table halves differ in {mismatched} entries; fused rotation needs duplicated halves"
        )));
    }
    Ok(())
}

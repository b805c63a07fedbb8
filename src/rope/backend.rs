//! Rotation backend selection.
//!
//! Both variants share the slicing and gathering helpers in
//! [`rotate`](crate::rope::rotate); they differ only in who computes the
//! combine step.

use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use tracing::debug;

use crate::error::{Error, Result};
use crate::rope::fused::FusedRotation;
use crate::rope::kernel::{CandleRopeKernel, RotaryKernel};
use crate::rope::rotate;

/// Strategy used to rotate query/key tensors.
#[derive(Debug, Clone, Default)]
pub enum RotationBackend {
    /// Plain candle ops. Differentiable end to end, including `cos`/`sin`.
    #[default]
    Reference,
    /// Delegates the combine step to an accelerated kernel.
    Accelerated(FusedRotation),
}

impl RotationBackend {
    pub fn reference() -> Self {
        RotationBackend::Reference
    }

    /// Selects `kernel` after checking it supports `device` and `dtype`.
    ///
    /// There is no implicit fallback: callers that want one should match on
    /// [`Error::BackendUnavailable`] and pick [`RotationBackend::Reference`].
    pub fn accelerated(
        kernel: Arc<dyn RotaryKernel>,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        if !kernel.supports(device, dtype) {
            return Err(Error::unavailable(kernel.name(), device, dtype));
        }
        debug!(kernel = kernel.name(), ?dtype, "using accelerated rotary backend");
        Ok(RotationBackend::Accelerated(FusedRotation::new(kernel)))
    }

    /// Accelerated backend using candle-nn's fused rope kernel.
    pub fn candle_fused(device: &Device, dtype: DType) -> Result<Self> {
        Self::accelerated(Arc::new(CandleRopeKernel), device, dtype)
    }

    pub fn name(&self) -> &'static str {
        match self {
            RotationBackend::Reference => "reference",
            RotationBackend::Accelerated(op) => op.kernel().name(),
        }
    }

    pub fn is_fused(&self) -> bool {
        matches!(self, RotationBackend::Accelerated(_))
    }

    /// Returns the fused op, when this backend has one.
    pub fn fused(&self) -> Option<&FusedRotation> {
        match self {
            RotationBackend::Reference => None,
            RotationBackend::Accelerated(op) => Some(op),
        }
    }

    /// Rotates `q`/`k` with the window starting at `offset`.
    ///
    /// On the accelerated backend the backward contexts are dropped; call
    /// [`FusedRotation::apply`] directly to keep them.
    pub fn apply(
        &self,
        q: &Tensor,
        k: &Tensor,
        cos: &Tensor,
        sin: &Tensor,
        offset: usize,
    ) -> Result<(Tensor, Tensor)> {
        match self {
            RotationBackend::Reference => rotate::apply(q, k, cos, sin, offset),
            RotationBackend::Accelerated(op) => {
                let (q_rot, k_rot) = op.apply(q, k, cos, sin, offset)?;
                Ok((q_rot.output, k_rot.output))
            }
        }
    }

    /// Rotates `h: [seq, batch * heads, dim]` by per-slot positions.
    pub fn apply_indexed(
        &self,
        h: &Tensor,
        cos: &Tensor,
        sin: &Tensor,
        position_ids: &Tensor,
    ) -> Result<Tensor> {
        match self {
            RotationBackend::Reference => rotate::apply_indexed(h, cos, sin, position_ids),
            RotationBackend::Accelerated(op) => {
                Ok(op.apply_indexed(h, cos, sin, position_ids)?.output)
            }
        }
    }
}

//! Accelerated rotary kernels.
//!
//! A [`RotaryKernel`] is the opaque primitive the fused path delegates to. It
//! works on one canonical layout:
//!
//! - `h`, `grad_output`: `[rows, heads, dim]`, contiguous
//! - `cos`, `sin`: `[rows, dim]`, contiguous, both halves of each row equal
//!
//! Each row carries its own angle, which covers both the shared-position
//! layout (`rows = seq`) and the gathered per-slot layout (`rows = seq * batch`).

use candle_core::{DType, Device, Tensor};

/// Shape triple handed to a kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelShape {
    pub rows: usize,
    pub heads: usize,
    pub dim: usize,
}

impl KernelShape {
    pub fn new(rows: usize, heads: usize, dim: usize) -> Self {
        Self { rows, heads, dim }
    }

    pub fn dims(&self) -> (usize, usize, usize) {
        (self.rows, self.heads, self.dim)
    }
}

/// Hardware-optimized rotary primitive with a matching gradient.
pub trait RotaryKernel: std::fmt::Debug + Send + Sync {
    /// Short name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Whether the kernel can run on `device` for tensors of `dtype`.
    fn supports(&self, device: &Device, dtype: DType) -> bool;

    /// Computes `h * cos + rotate_half(h) * sin`.
    fn forward(
        &self,
        shape: KernelShape,
        h: &Tensor,
        cos: &Tensor,
        sin: &Tensor,
    ) -> candle_core::Result<Tensor>;

    /// Computes the gradient with respect to `h` for an upstream `grad_output`.
    fn backward(
        &self,
        shape: KernelShape,
        grad_output: &Tensor,
        cos: &Tensor,
        sin: &Tensor,
    ) -> candle_core::Result<Tensor>;
}

/// Kernel backed by candle-nn's fused non-interleaved `rope`.
///
/// candle-nn expects `[batch, heads, seq, dim]` activations and half-width
/// `[seq, dim / 2]` tables, so rows are moved to the sequence axis and only the
/// first half of each table row is passed.
#[derive(Debug, Clone, Copy, Default)]
pub struct CandleRopeKernel;

impl CandleRopeKernel {
    fn rotate(&self, x: &Tensor, cos: &Tensor, sin: &Tensor) -> candle_core::Result<Tensor> {
        // [rows, heads, dim] -> [1, heads, rows, dim]
        let xs = x.transpose(0, 1)?.unsqueeze(0)?.contiguous()?;
        let out = candle_nn::rotary_emb::rope(&xs, cos, sin)?;
        out.squeeze(0)?.transpose(0, 1)?.contiguous()
    }

    fn half_tables(
        &self,
        shape: KernelShape,
        cos: &Tensor,
        sin: &Tensor,
        dtype: DType,
    ) -> candle_core::Result<(Tensor, Tensor)> {
        let half = shape.dim / 2;
        let cos = cos.narrow(1, 0, half)?.to_dtype(dtype)?.contiguous()?;
        let sin = sin.narrow(1, 0, half)?.to_dtype(dtype)?.contiguous()?;
        Ok((cos, sin))
    }
}

impl RotaryKernel for CandleRopeKernel {
    fn name(&self) -> &'static str {
        "candle-rope"
    }

    fn supports(&self, device: &Device, dtype: DType) -> bool {
        match device {
            Device::Cpu => matches!(dtype, DType::F16 | DType::BF16 | DType::F32 | DType::F64),
            _ => matches!(dtype, DType::F16 | DType::BF16 | DType::F32),
        }
    }

    fn forward(
        &self,
        shape: KernelShape,
        h: &Tensor,
        cos: &Tensor,
        sin: &Tensor,
    ) -> candle_core::Result<Tensor> {
        let (cos, sin) = self.half_tables(shape, cos, sin, h.dtype())?;
        self.rotate(h, &cos, &sin)
    }

    fn backward(
        &self,
        shape: KernelShape,
        grad_output: &Tensor,
        cos: &Tensor,
        sin: &Tensor,
    ) -> candle_core::Result<Tensor> {
        // With equal halves, rotate_half commutes with the sin scaling and its
        // transpose is its negation, so the adjoint is the rotation by -angle.
        let (cos, sin) = self.half_tables(shape, cos, sin, grad_output.dtype())?;
        self.rotate(grad_output, &cos, &sin.neg()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supports_float_on_cpu() {
        let kernel = CandleRopeKernel;
        assert!(kernel.supports(&Device::Cpu, DType::F32));
        assert!(kernel.supports(&Device::Cpu, DType::BF16));
        assert!(!kernel.supports(&Device::Cpu, DType::U32));
    }

    #[test]
    fn test_forward_shape() {
        let device = Device::Cpu;
        let shape = KernelShape::new(3, 2, 8);
        let h = Tensor::randn(0.0f32, 1.0, shape.dims(), &device).unwrap();
        let cos = Tensor::ones((3, 8), DType::F32, &device).unwrap();
        let sin = Tensor::zeros((3, 8), DType::F32, &device).unwrap();

        let out = CandleRopeKernel.forward(shape, &h, &cos, &sin).unwrap();
        assert_eq!(out.dims(), &[3, 2, 8]);

        // Zero angle is the identity.
        let diff: f32 = (out - &h)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-6);
    }

    #[test]
    fn test_backward_inverts_forward() {
        let device = Device::Cpu;
        let shape = KernelShape::new(4, 3, 6);
        let h = Tensor::randn(0.0f32, 1.0, shape.dims(), &device).unwrap();
        let angles = Tensor::randn(0.0f32, 1.0, (4, 3), &device).unwrap();
        let angles = Tensor::cat(&[&angles, &angles], 1).unwrap();
        let cos = angles.cos().unwrap();
        let sin = angles.sin().unwrap();

        // The rotation is orthogonal: its adjoint is its inverse.
        let out = CandleRopeKernel.forward(shape, &h, &cos, &sin).unwrap();
        let back = CandleRopeKernel.backward(shape, &out, &cos, &sin).unwrap();
        let diff: f32 = (back - &h)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-5, "max diff {diff}");
    }
}

//! Integration tests for the fused rotary path.

use std::sync::Arc;

use candle_core::{DType, Device, Tensor, Var};
use nano_rope::rope::KernelShape;
use nano_rope::{
    Error, FrequencyCache, FusedRotation, Precision, RotaryConfig, RotaryEmbedding, RotaryKernel,
    RotationBackend, apply, apply_indexed,
};

fn test_device() -> Device {
    Device::Cpu
}

fn tables(dim: usize, seq_len: usize) -> (Tensor, Tensor) {
    let config = RotaryConfig::new(dim)
        .unwrap()
        .with_precision(Precision::F32);
    let mut cache = FrequencyCache::new(config, &test_device()).unwrap();
    cache.ensure(seq_len).unwrap().into_parts()
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    (a - b)
        .unwrap()
        .abs()
        .unwrap()
        .flatten_all()
        .unwrap()
        .max(0)
        .unwrap()
        .to_scalar()
        .unwrap()
}

/// Kernel that only claims f64 support, standing in for missing hardware.
#[derive(Debug)]
struct F64OnlyKernel;

impl RotaryKernel for F64OnlyKernel {
    fn name(&self) -> &'static str {
        "f64-only"
    }

    fn supports(&self, _device: &Device, dtype: DType) -> bool {
        dtype == DType::F64
    }

    fn forward(
        &self,
        _shape: KernelShape,
        h: &Tensor,
        _cos: &Tensor,
        _sin: &Tensor,
    ) -> candle_core::Result<Tensor> {
        Ok(h.clone())
    }

    fn backward(
        &self,
        _shape: KernelShape,
        grad_output: &Tensor,
        _cos: &Tensor,
        _sin: &Tensor,
    ) -> candle_core::Result<Tensor> {
        Ok(grad_output.clone())
    }
}

#[test]
fn test_fused_forward_matches_plain() {
    let device = test_device();
    let (cos, sin) = tables(64, 32);
    let q = Tensor::randn(0.0f32, 1.0, (8, 6, 64), &device).unwrap();
    let k = Tensor::randn(0.0f32, 1.0, (8, 6, 64), &device).unwrap();

    let op = FusedRotation::candle();
    let (q_fused, k_fused) = op.apply(&q, &k, &cos, &sin, 5).unwrap();
    let (q_plain, k_plain) = apply(&q, &k, &cos, &sin, 5).unwrap();

    assert_eq!(q_fused.output.dims(), q.dims());
    assert!(max_abs_diff(&q_fused.output, &q_plain) < 1e-5);
    assert!(max_abs_diff(&k_fused.output, &k_plain) < 1e-5);
}

#[test]
fn test_fused_rejects_tables_with_unequal_halves() {
    let device = test_device();
    let angles = Tensor::randn(0.0f32, 1.0, (4, 1, 8), &device).unwrap();
    let (cos, sin) = (angles.cos().unwrap(), angles.sin().unwrap());
    let q = Tensor::randn(0.0f32, 1.0, (4, 2, 8), &device).unwrap();

    // The reference path combines full rows; the kernel only reads half of
    // each row, so these tables are refused instead of rotated differently.
    assert!(apply(&q, &q, &cos, &sin, 0).is_ok());
    let op = FusedRotation::candle();
    assert!(matches!(
        op.apply(&q, &q, &cos, &sin, 0),
        Err(Error::ShapeMismatch(_))
    ));
    assert!(matches!(
        op.forward(&q, &cos, &sin),
        Err(Error::ShapeMismatch(_))
    ));
}

#[test]
fn test_fused_backward_matches_autograd() {
    let device = test_device();
    let (cos, sin) = tables(32, 16);
    let q = Var::randn(0.0f32, 1.0, (6, 4, 32), &device).unwrap();
    let k = Var::randn(0.0f32, 1.0, (6, 4, 32), &device).unwrap();
    let upstream = Tensor::randn(0.0f32, 1.0, (6, 4, 32), &device).unwrap();

    // Reference gradients through candle's autograd.
    let (q_plain, k_plain) = apply(q.as_tensor(), k.as_tensor(), &cos, &sin, 3).unwrap();
    let loss = ((q_plain * &upstream).unwrap().sum_all().unwrap()
        + (k_plain * &upstream).unwrap().sum_all().unwrap())
    .unwrap();
    let grads = loss.backward().unwrap();
    let q_grad = grads.get(q.as_tensor()).unwrap();
    let k_grad = grads.get(k.as_tensor()).unwrap();

    // Fused gradients through the explicit backward.
    let op = FusedRotation::candle();
    let (q_fused, k_fused) = op.apply(q.as_tensor(), k.as_tensor(), &cos, &sin, 3).unwrap();
    let q_fused_grad = op.backward(q_fused.context, &upstream).unwrap();
    let k_fused_grad = op.backward(k_fused.context, &upstream).unwrap();

    assert_eq!(q_fused_grad.dims(), &[6, 4, 32]);
    assert!(max_abs_diff(q_grad, &q_fused_grad) < 1e-5);
    assert!(max_abs_diff(k_grad, &k_fused_grad) < 1e-5);
}

#[test]
fn test_fused_indexed_matches_plain_indexed() {
    let device = test_device();
    let (seq_len, batch, heads, dim) = (4, 2, 3, 16);
    let (cos, sin) = tables(dim, 32);
    let h = Tensor::randn(0.0f32, 1.0, (seq_len, batch * heads, dim), &device).unwrap();
    let ids = Tensor::new(&[[0u32, 7], [1, 8], [2, 8], [3, 20]], &device).unwrap();

    let op = FusedRotation::candle();
    let fused = op.apply_indexed(&h, &cos, &sin, &ids).unwrap();
    let plain = apply_indexed(&h, &cos, &sin, &ids).unwrap();

    assert_eq!(fused.output.dims(), &[seq_len, batch * heads, dim]);
    assert_eq!(fused.context.shape(), KernelShape::new(seq_len * batch, heads, dim));
    assert!(max_abs_diff(&fused.output, &plain) < 1e-5);
}

#[test]
fn test_fused_indexed_backward_matches_autograd() {
    let device = test_device();
    let (cos, sin) = tables(8, 16);
    let h = Var::randn(0.0f32, 1.0, (3, 4, 8), &device).unwrap();
    let ids = Tensor::new(&[[5u32, 0], [6, 1], [9, 2]], &device).unwrap();
    let upstream = Tensor::randn(0.0f32, 1.0, (3, 4, 8), &device).unwrap();

    let plain = apply_indexed(h.as_tensor(), &cos, &sin, &ids).unwrap();
    let grads = (plain * &upstream)
        .unwrap()
        .sum_all()
        .unwrap()
        .backward()
        .unwrap();
    let expected = grads.get(h.as_tensor()).unwrap();

    let op = FusedRotation::candle();
    let (_, context) = op
        .apply_indexed(h.as_tensor(), &cos, &sin, &ids)
        .unwrap()
        .into_parts();
    let grad = op.backward(context, &upstream).unwrap();
    assert!(max_abs_diff(expected, &grad) < 1e-5);
}

#[test]
fn test_fused_gradient_skips_frequency_tables() {
    let device = test_device();
    let config = RotaryConfig::new(8)
        .unwrap()
        .with_precision(Precision::F32)
        .with_learnable(true);
    let mut cache = FrequencyCache::new(config, &device).unwrap();
    let (cos, sin) = cache.ensure(4).unwrap().into_parts();
    let h = Tensor::randn(0.0f32, 1.0, (4, 2, 8), &device).unwrap();

    let op = FusedRotation::candle();
    let rotated = op.forward(&h, &cos, &sin).unwrap();

    // The fused output is detached from the learnable frequencies.
    let grads = rotated.output.sum_all().unwrap().backward().unwrap();
    let var = cache.inv_freq().var().unwrap();
    assert!(grads.get(var.as_tensor()).is_none());
}

#[test]
fn test_backend_unavailable_at_construction() {
    let result = RotationBackend::accelerated(Arc::new(F64OnlyKernel), &test_device(), DType::F32);
    assert!(matches!(result, Err(Error::BackendUnavailable { .. })));
}

#[test]
fn test_backend_unavailable_at_call_time() {
    let device = test_device();
    let backend =
        RotationBackend::accelerated(Arc::new(F64OnlyKernel), &device, DType::F64).unwrap();
    let (cos, sin) = tables(8, 4);
    let q = Tensor::randn(0.0f32, 1.0, (4, 2, 8), &device).unwrap();

    // No silent fallback to the reference path.
    let err = backend.apply(&q, &q, &cos, &sin, 0).unwrap_err();
    assert!(matches!(err, Error::BackendUnavailable { kernel: "f64-only", .. }));
}

#[test]
fn test_rotary_embedding_with_fused_backend() {
    let device = test_device();
    let config = RotaryConfig::new(16)
        .unwrap()
        .with_precision(Precision::F32);
    let mut reference = RotaryEmbedding::new(config.clone(), &device).unwrap();
    let mut fused = RotaryEmbedding::new(config, &device)
        .unwrap()
        .with_backend(RotationBackend::candle_fused(&device, DType::F32).unwrap());
    assert!(fused.backend().is_fused());

    let q = Tensor::randn(0.0f32, 1.0, (5, 4, 16), &device).unwrap();
    let k = Tensor::randn(0.0f32, 1.0, (5, 4, 16), &device).unwrap();
    let (q_ref, k_ref) = reference.forward(&q, &k, 2).unwrap();
    let (q_fused, k_fused) = fused.forward(&q, &k, 2).unwrap();
    assert!(max_abs_diff(&q_ref, &q_fused) < 1e-5);
    assert!(max_abs_diff(&k_ref, &k_fused) < 1e-5);

    let ids = Tensor::new(&[[0u32, 3], [1, 4], [2, 5], [3, 6], [4, 7]], &device).unwrap();
    let h_ref = reference.forward_indexed(&q, &ids).unwrap();
    let h_fused = fused.forward_indexed(&q, &ids).unwrap();
    assert!(max_abs_diff(&h_ref, &h_fused) < 1e-5);
}

//! Error types for nano-rope.

use candle_core::{DType, Device};
use thiserror::Error;

/// Result type alias for nano-rope operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for nano-rope.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid rotary configuration (odd dimension, non-positive base, bad document).
    #[error("configuration error: {0}")]
    Config(String),

    /// Tensor shapes do not satisfy the rotation contract.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// The fused kernel cannot run on the requested device or dtype.
    #[error("fused rotary kernel `{kernel}` unavailable for {device} / {dtype:?}")]
    BackendUnavailable {
        kernel: &'static str,
        device: String,
        dtype: DType,
    },

    /// A fused backward was driven with a context it did not produce.
    #[error("fused rotation misuse: {0}")]
    Misuse(String),

    /// Tensor operation error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// JSON parsing error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn unavailable(kernel: &'static str, device: &Device, dtype: DType) -> Self {
        Error::BackendUnavailable {
            kernel,
            device: device_label(device),
            dtype,
        }
    }
}

fn device_label(device: &Device) -> String {
    format!("{:?}", device.location())
}

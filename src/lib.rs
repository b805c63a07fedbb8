//! nano-rope: rotary positional embeddings for attention layers.
//!
//! This crate implements the full rotary subsystem of a GPT-NeoX style model:
//! - Cached cos/sin angle tables derived from `(dim, base)`
//! - Plain and position-indexed rotation of query/key tensors
//! - A fused kernel path with an explicit, consume-once backward

pub mod config;
pub mod error;

pub mod rope;

pub use config::{DEFAULT_ROPE_BASE, Precision, RotaryConfig};
pub use error::{Error, Result};
pub use rope::{
    AngleTables, FrequencyCache, FusedRotation, RotaryEmbedding, RotaryKernel, Rotated,
    RotationBackend, RotationContext, apply, apply_indexed, rotate_half,
};

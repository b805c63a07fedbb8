//! Rotary positional embeddings.
//!
//! This module contains:
//! - Inverse frequencies and the growth-only cos/sin cache
//! - The reference rotation (plain and position-indexed)
//! - The fused kernel path with an explicit backward
//! - Backend selection and the `RotaryEmbedding` module tying them together

pub mod backend;
pub mod embedding;
pub mod frequency;
pub mod fused;
pub mod kernel;
pub mod rotate;

pub use backend::RotationBackend;
pub use embedding::RotaryEmbedding;
pub use frequency::{AngleTables, FrequencyCache, InverseFrequency};
pub use fused::{FusedRotation, Rotated, RotationContext};
pub use kernel::{CandleRopeKernel, KernelShape, RotaryKernel};
pub use rotate::{apply, apply_indexed, rotate_half};

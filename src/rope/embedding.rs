//! Module-level rotary embedding.
//!
//! [`RotaryEmbedding`] owns a [`FrequencyCache`] and a [`RotationBackend`].
//! Each forward grows the cache to the positions it touches and hands the
//! resulting tables to the backend. Activations are sequence-first, so axis 0
//! is the position axis for both the plain and the indexed entry points.

use candle_core::{Device, Tensor, Var};
use tracing::warn;

use crate::config::RotaryConfig;
use crate::error::{Error, Result};
use crate::rope::backend::RotationBackend;
use crate::rope::frequency::{AngleTables, FrequencyCache};
use crate::rope::rotate::max_position;

/// Rotary Position Embedding.
///
/// Owns the angle cache and the backend that applies the rotation.
/// Activations are sequence-first: `[seq_len, batch * heads, head_dim]`.
///
/// Key insight: `dot(rotate(q, pos_q), rotate(k, pos_k))` depends on
/// `pos_q - pos_k`, naturally capturing relative position.
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    cache: FrequencyCache,
    backend: RotationBackend,
}

impl RotaryEmbedding {
    /// Creates a RotaryEmbedding using the reference backend.
    ///
    /// No tables are computed until the first forward.
    ///
    /// # Arguments
    ///
    /// * `config` - Rotary dimension, base, precision and learnability
    /// * `device` - Device to create the tables on
    pub fn new(config: RotaryConfig, device: &Device) -> Result<Self> {
        Ok(Self {
            cache: FrequencyCache::new(config, device)?,
            backend: RotationBackend::default(),
        })
    }

    /// Replaces the rotation backend.
    pub fn with_backend(mut self, backend: RotationBackend) -> Self {
        if backend.is_fused() && self.cache.inv_freq().is_learnable() {
            warn!(
                backend = backend.name(),
                "fused rotary backend does not propagate gradients into learnable frequencies"
            );
        }
        self.backend = backend;
        self
    }

    pub fn config(&self) -> &RotaryConfig {
        self.cache.config()
    }

    /// Returns the rotated dimension.
    pub fn dim(&self) -> usize {
        self.cache.config().dim
    }

    pub fn backend(&self) -> &RotationBackend {
        &self.backend
    }

    pub fn cache(&self) -> &FrequencyCache {
        &self.cache
    }

    /// Returns the inverse frequencies `[dim / 2]`.
    pub fn inv_freq(&self) -> &Tensor {
        self.cache.inv_freq().as_tensor()
    }

    /// Returns the trainable inverse frequencies when `learnable` is set.
    pub fn inv_freq_var(&self) -> Option<&Var> {
        self.cache.inv_freq().var()
    }

    /// Returns cos/sin tables `[seq_len, 1, dim]`.
    pub fn ensure_angles(&mut self, seq_len: usize) -> Result<AngleTables> {
        self.cache.ensure(seq_len)
    }

    /// Applies rotary embedding to query and key tensors.
    ///
    /// # Arguments
    ///
    /// * `q` - Query tensor `[seq_len, ..., head_dim]`
    /// * `k` - Key tensor `[seq_len, ..., head_dim]`
    /// * `offset` - Starting position index (for incremental decoding)
    ///
    /// # Returns
    ///
    /// Tuple of rotated (q, k) tensors with same shapes as input.
    pub fn forward(&mut self, q: &Tensor, k: &Tensor, offset: usize) -> Result<(Tensor, Tensor)> {
        let seq_len = q.dims().first().copied().unwrap_or(0);
        if seq_len == 0 {
            return Err(Error::ShapeMismatch(format!(
                "query covers no positions: {:?}",
                q.dims()
            )));
        }
        let end = offset.checked_add(seq_len).ok_or_else(|| {
            Error::ShapeMismatch(format!("offset {offset} + {seq_len} positions overflows"))
        })?;
        let tables = self.cache.ensure(end)?;
        self.backend.apply(q, k, tables.cos(), tables.sin(), offset)
    }

    /// Applies rotary embedding with explicit per-slot positions.
    ///
    /// # Arguments
    ///
    /// * `h` - Hidden tensor `[seq_len, batch * heads, head_dim]`
    /// * `position_ids` - Integer tensor `[seq_len, batch]`
    ///
    /// The tables are grown to cover the largest id.
    pub fn forward_indexed(&mut self, h: &Tensor, position_ids: &Tensor) -> Result<Tensor> {
        let rows = max_position(position_ids)? + 1;
        let tables = self.cache.ensure(rows)?;
        self.backend.apply_indexed(h, tables.cos(), tables.sin(), position_ids)
    }
}

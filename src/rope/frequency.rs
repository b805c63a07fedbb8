//! Inverse frequencies and the cos/sin angle cache.
//!
//! Angles are laid out the GPT-NeoX way: for position `t` and pair `i`,
//! `angle = t * inv_freq[i]`, and each row holds `[angles, angles]` so that
//! the first and second half of the feature axis share the same rotation.
//!
//! ## Table Layout
//!
//! `cos`/`sin`: `[max_seq_len, 1, dim]`. The singleton axis broadcasts over the
//! `batch * heads` axis of `[seq, batch * heads, dim]` activations.

use candle_core::{D, Device, Tensor, Var};
use tracing::debug;

use crate::config::RotaryConfig;
use crate::error::{Error, Result};

/// Per-pair angular rates `1 / base^(2i / dim)`.
///
/// Fixed frequencies are plain tensors. Learnable ones are a [`Var`] whose
/// updates belong to the caller's optimizer.
#[derive(Debug, Clone)]
pub enum InverseFrequency {
    Fixed(Tensor),
    Learnable(Var),
}

impl InverseFrequency {
    /// Derives the `dim / 2` inverse frequencies for `config`.
    ///
    /// Values are stored in the config's compute dtype (`f32`, or `f64`).
    pub fn new(config: &RotaryConfig, device: &Device) -> Result<Self> {
        config.validate()?;

        let dim = config.dim as f64;
        let values: Vec<f64> = (0..config.half_dim())
            .map(|i| 1.0 / config.base.powf(2.0 * i as f64 / dim))
            .collect();
        let inv_freq = Tensor::new(values.as_slice(), device)?
            .to_dtype(config.precision.compute_dtype())?;

        if config.learnable {
            Ok(InverseFrequency::Learnable(Var::from_tensor(&inv_freq)?))
        } else {
            Ok(InverseFrequency::Fixed(inv_freq))
        }
    }

    /// Returns the frequencies as a tensor (tracked when learnable).
    pub fn as_tensor(&self) -> &Tensor {
        match self {
            InverseFrequency::Fixed(t) => t,
            InverseFrequency::Learnable(v) => v.as_tensor(),
        }
    }

    /// Returns the trainable variable, if any.
    pub fn var(&self) -> Option<&Var> {
        match self {
            InverseFrequency::Fixed(_) => None,
            InverseFrequency::Learnable(v) => Some(v),
        }
    }

    pub fn is_learnable(&self) -> bool {
        matches!(self, InverseFrequency::Learnable(_))
    }
}

/// An immutable cos/sin snapshot of shape `[rows, 1, dim]`.
///
/// Cloning is cheap: tensors are reference counted.
#[derive(Debug, Clone)]
pub struct AngleTables {
    cos: Tensor,
    sin: Tensor,
}

impl AngleTables {
    /// Wraps externally produced tables.
    ///
    /// Both tensors must have the same shape, with positions on axis 0.
    pub fn new(cos: Tensor, sin: Tensor) -> Result<Self> {
        if cos.dims() != sin.dims() {
            return Err(Error::ShapeMismatch(format!(
                "cos {:?} and sin {:?} tables differ in shape",
                cos.dims(),
                sin.dims()
            )));
        }
        if cos.rank() < 2 {
            return Err(Error::ShapeMismatch(format!(
                "angle tables need a position and a feature axis, got {:?}",
                cos.dims()
            )));
        }
        Ok(Self { cos, sin })
    }

    pub fn cos(&self) -> &Tensor {
        &self.cos
    }

    pub fn sin(&self) -> &Tensor {
        &self.sin
    }

    /// Number of positions covered.
    pub fn len(&self) -> usize {
        self.cos.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Feature dimension of each row.
    pub fn dim(&self) -> usize {
        self.cos.dims()[self.cos.rank() - 1]
    }

    /// Returns the first `len` positions.
    pub fn truncate(&self, len: usize) -> Result<Self> {
        if len > self.len() {
            return Err(Error::ShapeMismatch(format!(
                "requested {len} positions from a table of {}",
                self.len()
            )));
        }
        Ok(Self {
            cos: self.cos.narrow(0, 0, len)?,
            sin: self.sin.narrow(0, 0, len)?,
        })
    }

    pub fn into_parts(self) -> (Tensor, Tensor) {
        (self.cos, self.sin)
    }
}

/// Lazily built, growth-only cos/sin cache.
///
/// Growth needs `&mut self`, so two users can never extend the same cache
/// concurrently; what they receive is an [`AngleTables`] snapshot.
#[derive(Debug, Clone)]
pub struct FrequencyCache {
    config: RotaryConfig,
    inv_freq: InverseFrequency,
    device: Device,
    cached: Option<AngleTables>,
}

impl FrequencyCache {
    /// Creates an empty cache. Nothing is computed until [`ensure`](Self::ensure).
    pub fn new(config: RotaryConfig, device: &Device) -> Result<Self> {
        let inv_freq = InverseFrequency::new(&config, device)?;
        Ok(Self {
            config,
            inv_freq,
            device: device.clone(),
            cached: None,
        })
    }

    pub fn config(&self) -> &RotaryConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn inv_freq(&self) -> &InverseFrequency {
        &self.inv_freq
    }

    /// Longest sequence currently memoized.
    ///
    /// Always `None` for learnable frequencies, which are never memoized.
    pub fn cached_len(&self) -> Option<usize> {
        self.cached.as_ref().map(AngleTables::len)
    }

    /// Returns tables for exactly `seq_len` positions.
    ///
    /// The memoized tables are rebuilt from scratch when `seq_len` exceeds
    /// them; shorter requests are served by slicing. Learnable frequencies
    /// rebuild on every call so the result stays attached to the variable.
    pub fn ensure(&mut self, seq_len: usize) -> Result<AngleTables> {
        if seq_len == 0 {
            return Err(Error::ShapeMismatch(
                "angle tables requested for zero positions".into(),
            ));
        }

        if self.inv_freq.is_learnable() {
            return self.build(seq_len);
        }

        if let Some(tables) = &self.cached
            && tables.len() >= seq_len
        {
            return tables.truncate(seq_len);
        }

        debug!(
            seq_len,
            previous = ?self.cached_len(),
            dim = self.config.dim,
            "rebuilding rotary angle cache"
        );
        let tables = self.build(seq_len)?;
        self.cached = Some(tables.clone());
        Ok(tables)
    }

    /// Computes fresh tables for positions `0..seq_len`.
    fn build(&self, seq_len: usize) -> Result<AngleTables> {
        let precision = self.config.precision;
        let compute = precision.compute_dtype();
        let half_dim = self.config.half_dim();

        let inv_freq = self
            .inv_freq
            .as_tensor()
            .to_dtype(compute)?
            .reshape((1, half_dim))?;
        let end = u32::try_from(seq_len).map_err(|_| {
            Error::ShapeMismatch(format!("{seq_len} positions exceed the u32 position range"))
        })?;
        let positions = Tensor::arange(0u32, end, &self.device)?
            .to_dtype(compute)?
            .reshape((seq_len, 1))?;

        // [seq_len, dim/2] -> [seq_len, dim]
        let freqs = positions.broadcast_mul(&inv_freq)?;
        let emb = Tensor::cat(&[&freqs, &freqs], D::Minus1)?;

        let cos = emb.cos()?.to_dtype(precision.dtype())?.unsqueeze(1)?;
        let sin = emb.sin()?.to_dtype(precision.dtype())?.unsqueeze(1)?;
        AngleTables::new(cos, sin)
    }
}
